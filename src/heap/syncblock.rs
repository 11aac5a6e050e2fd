//! Sync blocks and the object header word.
//!
//! The 32-bit word before every object either holds a thin lock (owning thread id and
//! recursion level), a hash code, or the index of a sync block in the runtime's sync block
//! table. Sync blocks carry the fat monitor and COM interop state.

use std::collections::HashMap;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::{dac::SosDac, utils::CancellationToken};

/// Recursion level of a thin lock
pub const SYNCBLOCK_RECLEVEL_MASK: u32 = 0x0000_FC00;
/// Shift of the recursion level
pub const SYNCBLOCK_RECLEVEL_SHIFT: u32 = 10;
/// Thin lock id of the owning thread
pub const SYNCBLOCK_THREAD_ID_MASK: u32 = 0x0000_03FF;
/// The header is being updated under its spin lock
pub const SYNCBLOCK_SPIN_LOCK: u32 = 0x1000_0000;
/// The rest of the header is a hash code or a sync block index
pub const SYNCBLOCK_HASH_OR_INDEX: u32 = 0x0800_0000;
/// Together with [`SYNCBLOCK_HASH_OR_INDEX`], the rest is a hash code
pub const SYNCBLOCK_HASHCODE: u32 = 0x0400_0000;
/// Width of the sync block index
pub const SYNCBLOCK_INDEX_BITS: u32 = 26;
/// Sync block index
pub const SYNCBLOCK_INDEX_MASK: u32 = (1 << SYNCBLOCK_INDEX_BITS) - 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// COM interop state attached to a sync block
    pub struct SyncBlockComFlags : u32 {
        /// A runtime callable wrapper is attached
        const RCW = 0x1;
        /// A COM callable wrapper is attached
        const CCW = 0x2;
        /// A COM class factory is attached
        const CLASS_FACTORY = 0x4;
    }
}

/// Decoded object header word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader(pub u32);

impl ObjectHeader {
    /// Index into the sync block table, if the header holds one. `Some(0)` is corrupt.
    #[must_use]
    pub fn sync_block_index(&self) -> Option<u32> {
        if self.0 & SYNCBLOCK_HASH_OR_INDEX != 0 && self.0 & SYNCBLOCK_HASHCODE == 0 {
            Some(self.0 & SYNCBLOCK_INDEX_MASK)
        } else {
            None
        }
    }

    /// Whether the header holds a thin lock
    #[must_use]
    pub fn has_thin_lock(&self) -> bool {
        self.0 & (SYNCBLOCK_HASH_OR_INDEX | SYNCBLOCK_SPIN_LOCK) == 0
            && self.0 & SYNCBLOCK_THREAD_ID_MASK != 0
    }

    /// `(thin lock thread id, recursion)` if the header holds a thin lock
    #[must_use]
    pub fn thin_lock(&self) -> Option<(u32, u32)> {
        self.has_thin_lock().then(|| {
            (
                self.0 & SYNCBLOCK_THREAD_ID_MASK,
                (self.0 & SYNCBLOCK_RECLEVEL_MASK) >> SYNCBLOCK_RECLEVEL_SHIFT,
            )
        })
    }
}

/// A lock held through the object header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClrThinLock {
    /// Address of the owning thread
    pub thread: u64,
    /// Recursion level
    pub recursion: u32,
}

/// What a sync block carries beyond its object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncBlockKind {
    /// Only reserves the slot, e.g. for a hash code
    Plain,
    /// A monitor which is, or was, contended
    Full {
        /// Non-zero if the monitor is held
        monitor_held: u32,
        /// Recursion count of the holder
        recursion: u32,
        /// Thread holding the monitor
        holding_thread: u64,
        /// Threads waiting for the monitor
        waiting_threads: u32,
        /// App domain of the sync block
        app_domain: u64,
    },
    /// COM interop state
    Com(SyncBlockComFlags),
}

/// One live entry of the sync block table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBlock {
    /// Object owning the sync block
    pub object: u64,
    /// One-based index in the table, as stored in the object header
    pub index: u32,
    /// What the sync block carries
    pub kind: SyncBlockKind,
}

impl SyncBlock {
    /// COM flags, empty for non-COM sync blocks
    #[must_use]
    pub fn com_flags(&self) -> SyncBlockComFlags {
        match self.kind {
            SyncBlockKind::Com(flags) => flags,
            _ => SyncBlockComFlags::empty(),
        }
    }
}

/// Sync blocks indexed by their object
#[derive(Debug, Default)]
pub struct SyncBlockContainer {
    blocks: Vec<SyncBlock>,
    by_object: HashMap<u64, usize>,
}

impl SyncBlockContainer {
    pub(crate) fn new(blocks: Vec<SyncBlock>) -> Self {
        let mut by_object = HashMap::with_capacity(blocks.len());
        for (position, block) in blocks.iter().enumerate() {
            if by_object.insert(block.object, position).is_some() {
                warn!(object = block.object, "object owns more than one sync block");
            }
        }

        SyncBlockContainer { blocks, by_object }
    }

    /// Sync block of `object`
    #[must_use]
    pub fn get(&self, object: u64) -> Option<&SyncBlock> {
        self.by_object
            .get(&object)
            .and_then(|position| self.blocks.get(*position))
    }

    /// All sync blocks in table order
    #[must_use]
    pub fn blocks(&self) -> &[SyncBlock] {
        &self.blocks
    }

    /// Number of live sync blocks
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the table holds no live sync blocks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Reads the live entries of the sync block table.
///
/// The table is walked from index 1 up to the total the first entry reports, and ends early
/// at the first entry that cannot be read.
pub(crate) fn enumerate_sync_blocks(dac: &dyn SosDac, cancel: &CancellationToken) -> Vec<SyncBlock> {
    let Some(mut data) = dac.sync_block_data(1) else {
        return Vec::new();
    };
    let total = data.total_count.min(i32::MAX as u32);
    if total == 0 {
        return Vec::new();
    }

    let mut blocks = Vec::new();
    let mut index = 1_u32;
    loop {
        break_if_cancelled!(cancel, "sync block table");
        if !data.free {
            let kind = if data.monitor_held != 0
                || data.holding_thread != 0
                || data.recursion != 0
                || data.additional_thread_count != 0
            {
                SyncBlockKind::Full {
                    monitor_held: data.monitor_held,
                    recursion: data.recursion,
                    holding_thread: data.holding_thread,
                    waiting_threads: data.additional_thread_count,
                    app_domain: data.app_domain,
                }
            } else if data.com_flags != 0 {
                SyncBlockKind::Com(SyncBlockComFlags::from_bits_retain(data.com_flags))
            } else {
                SyncBlockKind::Plain
            };

            blocks.push(SyncBlock {
                object: data.object,
                index,
                kind,
            });
        }

        index += 1;
        if index > total {
            break;
        }
        match dac.sync_block_data(index) {
            Some(next) => data = next,
            None => break,
        }
    }

    debug!(total, live = blocks.len(), "sync block table");
    blocks
}
