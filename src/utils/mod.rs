//! Shared helpers used across the heap, type system and native heap walkers.

pub(crate) mod io;
pub(crate) mod synchronization;

pub(crate) use io::{read_le, read_le_at, read_pointer_at};
pub use synchronization::CancellationToken;

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
#[must_use]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    (value + (alignment - 1)) & !(alignment - 1)
}
