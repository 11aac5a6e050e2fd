//! Managed threads.

use std::collections::HashSet;

use tracing::{trace, warn};

use crate::{
    dac::{SosDac, ThreadData, ThreadStoreData},
    utils::CancellationToken,
};

/// A managed thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClrThread {
    /// Address of the runtime's thread object
    pub address: u64,
    /// Managed thread id
    pub managed_thread_id: u32,
    /// OS thread id, `0` if the thread never started
    pub os_thread_id: u32,
    /// Raw runtime thread state
    pub state: u32,
    /// Number of locks the thread holds
    pub lock_count: u32,
    /// Thread environment block
    pub teb: u64,
    /// App domain the thread currently runs in
    pub app_domain: u64,
    /// Handle of the exception last thrown on this thread, `0` if none
    pub last_thrown_object_handle: u64,
    /// Whether this is the finalizer thread
    pub is_finalizer: bool,
    /// Whether this is the dedicated GC thread
    pub is_gc: bool,
}

impl ClrThread {
    pub(crate) fn new(address: u64, data: &ThreadData, store: &ThreadStoreData) -> Self {
        ClrThread {
            address,
            managed_thread_id: data.managed_thread_id,
            os_thread_id: data.os_thread_id,
            state: data.state,
            lock_count: data.lock_count,
            teb: data.teb,
            app_domain: data.domain,
            last_thrown_object_handle: data.last_thrown_object_handle,
            is_finalizer: address == store.finalizer_thread,
            is_gc: store.gc_thread != 0 && address == store.gc_thread,
        }
    }

    /// Whether the thread is backed by a running OS thread
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.os_thread_id != 0
    }
}

/// Walks the thread list from the store's first thread.
///
/// At most `min(thread count, limit)` threads are visited. The walk ends at an unreadable
/// thread, at the end of the list, or at a thread it has seen before.
pub(crate) fn walk_thread_list(
    dac: &dyn SosDac,
    store: &ThreadStoreData,
    limit: usize,
    cancel: &CancellationToken,
) -> Vec<(u64, ThreadData)> {
    let count = usize::try_from(store.thread_count).unwrap_or(0).min(limit);
    if usize::try_from(store.thread_count).unwrap_or(0) > limit {
        warn!(reported = store.thread_count, limit, "thread count exceeds the ceiling");
    }

    let mut seen = HashSet::from([0_u64]);
    let mut threads = Vec::with_capacity(count);
    let mut address = store.first_thread;
    while threads.len() < count {
        break_if_cancelled!(cancel, "thread list");
        if !seen.insert(address) {
            if address != 0 {
                warn!(address, "thread list revisits a thread");
            }
            break;
        }

        let Some(data) = dac.thread_data(address) else {
            break;
        };
        trace!(address, managed_id = data.managed_thread_id, "thread");
        threads.push((address, data));
        address = data.next_thread;
    }

    threads
}
