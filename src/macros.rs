#![allow(unused_macros)]

/// Helper macro for locking items
///
/// ```rust, ignore
///  let mut seen = lock!(self.valid_method_tables);
///  seen.insert(mt);
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().expect("Failed to acquire lock")
    };
}

/// Helper macro for reading locked items
///
/// ```rust, ignore
///  let heap = read_lock!(self.heap);
///  println!("{:?}", heap.is_some());
/// ```
macro_rules! read_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.read().expect("Failed to acquire read lock")
    };
}

/// Helper macro for writing to locked items
///
/// ```rust, ignore
///  let mut heap = write_lock!(self.heap);
///  *heap = None;
/// ```
macro_rules! write_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.write().expect("Failed to acquire write lock")
    };
}

/// Leaves the enclosing loop once the cancellation token has fired
///
/// Every bounded walk over target memory calls this between elements, a corrupted
/// linked structure must never be able to keep a caller busy past its deadline.
///
/// ```rust, ignore
/// for index in 0..count {
///     break_if_cancelled!(self.cancel, "sync block table");
///     // ...
/// }
/// ```
macro_rules! break_if_cancelled {
    ($token:expr, $walk:expr) => {
        if $token.is_cancelled() {
            tracing::debug!(walk = $walk, "walk cancelled");
            break;
        }
    };
}
