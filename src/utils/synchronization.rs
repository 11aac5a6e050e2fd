//! Cooperative cancellation for walks over target memory.
//!
//! A corrupted linked structure in the target (a segment list that loops, a thread list
//! whose `next` pointers never terminate, a loader heap that reports millions of chunks) is
//! the primary operational hazard of this crate. Every walk is already bounded by a hard
//! count or a cycle guard, but those bounds can still be large. This module provides a
//! token that callers can fire, or arm with a deadline, and that every bounded walk checks
//! between elements.
//!
//! # Key Components
//!
//! - [`CancellationToken`] - A cloneable flag with an optional deadline
//!
//! # Semantics
//!
//! - **Cooperative**: Walks observe the token between elements, never in the middle of a
//!   gateway call
//! - **Non-failing**: A cancelled walk ends early and returns what it produced so far
//! - **Shared**: Clones observe the same flag, cancelling one cancels all of them

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

#[derive(Debug)]
struct CancellationState {
    /// Whether [`CancellationToken::cancel`] was called on any clone
    cancelled: AtomicBool,
    /// Point in time after which the token reports itself cancelled
    deadline: Option<Instant>,
}

/// A cancellation signal honored between elements of every bounded walk.
///
/// # Examples
///
/// ```rust
/// use clrscope::CancellationToken;
/// use std::time::Duration;
///
/// let token = CancellationToken::with_timeout(Duration::from_secs(30));
/// assert!(!token.is_cancelled());
///
/// let observer = token.clone();
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<CancellationState>,
}

impl CancellationToken {
    /// Creates a token which is only cancelled explicitly.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancellationState {
                cancelled: AtomicBool::new(false),
                deadline: None,
            }),
        }
    }

    /// Creates a token which cancels itself once `deadline` has passed.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            state: Arc::new(CancellationState {
                cancelled: AtomicBool::new(false),
                deadline: Some(deadline),
            }),
        }
    }

    /// Creates a token which cancels itself `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Fires the token, all clones observe the cancellation.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` once the token was fired or its deadline has passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.state.cancelled.load(Ordering::Acquire) {
            return true;
        }

        match self.state.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.state.cancelled.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn explicit_cancel_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        let handle = thread::spawn(move || token.cancel());
        handle.join().unwrap();

        assert!(clone.is_cancelled());
    }

    #[test]
    fn expired_deadline() {
        let token = CancellationToken::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(token.is_cancelled());
    }

    #[test]
    fn distant_deadline() {
        let token = CancellationToken::with_timeout(Duration::from_secs(3600));
        assert!(!token.is_cancelled());
    }
}
