//! Object verification.
//!
//! Checks run in a fixed order against one object: alignment, method table, size, the
//! references it holds, and its header. The first three failures leave nothing sensible to
//! check, so they end verification. Everything after them is collected until the caller's
//! budget is full.

use rayon::prelude::*;
use tracing::{debug, trace};

use super::{ClrHeap, ClrSegment, ClrSubHeap, GcState, ObjectHeader, SegmentFlags};
use crate::{typesystem::ClrTypeRc, Error, Result};

/// Bytes covered by one mark bit
const MARK_BIT_PITCH: u64 = 8;
/// Bits per mark word
const MARK_WORD_WIDTH: u64 = 32;
/// Bytes covered by one mark word
const MARK_WORD_SIZE: u64 = MARK_BIT_PITCH * MARK_WORD_WIDTH;

/// What is wrong with an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum ObjectCorruptionKind {
    /// The address lies outside every segment
    ObjectNotOnTheHeap,
    /// The object address is not pointer aligned
    ObjectNotPointerAligned,
    /// The object extends past its segment or exceeds the largest allowed size
    ObjectTooLarge,
    /// The method table is not one the runtime knows
    InvalidMethodTable,
    /// The method table pointer could not be read
    CouldNotReadMethodTable,
    /// The object's bytes could not be read in full
    CouldNotReadObject,
    /// The background GC mark array could not be read
    CouldNotReadCardTable,
    /// The type holds references but has no GC pointer map
    CouldNotReadGcDesc,
    /// A reference held by the object is not pointer aligned
    ObjectReferenceNotPointerAligned,
    /// A reference held by the object points at something without a valid method table
    InvalidObjectReference,
    /// A reference held by the object points at free space
    FreeObjectReference,
    /// The header holds sync block index 0
    SyncBlockZero,
    /// The header and the sync block table disagree
    SyncBlockMismatch,
    /// The header's thin lock names a thread that does not exist
    InvalidThinlock,
}

/// One problem found on an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectCorruption {
    /// Address of the object
    pub object: u64,
    /// Offset of the problem relative to the object, negative inside the header
    pub offset: i32,
    /// What is wrong
    pub kind: ObjectCorruptionKind,
    /// Sync block index stored in the header, for sync block kinds
    pub sync_block_index: Option<u32>,
    /// Index of the object's entry in the sync block table, for sync block kinds
    pub clr_sync_block_index: Option<u32>,
}

impl ObjectCorruption {
    fn new(object: u64, offset: i32, kind: ObjectCorruptionKind) -> Self {
        ObjectCorruption {
            object,
            offset,
            kind,
            sync_block_index: None,
            clr_sync_block_index: None,
        }
    }

    fn sync_block(
        object: u64,
        kind: ObjectCorruptionKind,
        sync_block_index: Option<u32>,
        clr_sync_block_index: Option<u32>,
    ) -> Self {
        ObjectCorruption {
            object,
            offset: -4,
            kind,
            sync_block_index,
            clr_sync_block_index,
        }
    }
}

/// Collects findings up to a fixed number
struct Findings {
    items: Vec<ObjectCorruption>,
    budget: usize,
}

impl Findings {
    /// Records `corruption`, returns whether there is room for more
    fn add(&mut self, corruption: ObjectCorruption) -> bool {
        self.items.push(corruption);
        self.items.len() < self.budget
    }

    fn contains(&self, kind: ObjectCorruptionKind) -> bool {
        self.items.iter().any(|item| item.kind == kind)
    }
}

impl ClrHeap {
    /// Checks one object and reports up to `budget` problems.
    ///
    /// The budget is capped by [`crate::CacheOptions::max_verify_budget`]. An empty result
    /// means the object looks intact.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `budget` is zero.
    pub fn verify_object(&self, object: u64, budget: usize) -> Result<Vec<ObjectCorruption>> {
        if budget == 0 {
            return Err(Error::InvalidArgument(
                "verification needs room for at least one result".to_string(),
            ));
        }

        let budget = budget.min(self.options.max_verify_budget.max(1));
        let mut findings = Findings {
            items: Vec::new(),
            budget,
        };

        match self.get_segment_by_address(object) {
            Some(segment) => self.verify_in_segment(segment, object, &mut findings),
            None => {
                findings.add(ObjectCorruption::new(
                    object,
                    0,
                    ObjectCorruptionKind::ObjectNotOnTheHeap,
                ));
            }
        }

        Ok(findings.items)
    }

    /// The first problem found on `object`, if any
    pub fn is_object_corrupted(&self, object: u64) -> Option<ObjectCorruption> {
        self.verify_object(object, 1)
            .ok()
            .and_then(|items| items.into_iter().next())
    }

    /// Checks each of `objects` in parallel, returning the first problem of every corrupt one
    #[must_use]
    pub fn verify_objects(&self, objects: &[u64]) -> Vec<ObjectCorruption> {
        let mut corrupt: Vec<_> = objects
            .par_iter()
            .filter_map(|object| self.is_object_corrupted(*object))
            .collect();
        corrupt.sort_by_key(|corruption| corruption.object);
        corrupt
    }

    /// Checks every object on the heap
    ///
    /// Walks carefully, so a corrupt object does not hide the ones after it.
    #[must_use]
    pub fn verify_heap(&self) -> Vec<ObjectCorruption> {
        let objects: Vec<u64> = self
            .enumerate_all_objects_carefully()
            .map(|object| object.address)
            .collect();
        debug!(count = objects.len(), "verifying heap");
        self.verify_objects(&objects)
    }

    fn verify_in_segment(&self, segment: &ClrSegment, object: u64, findings: &mut Findings) {
        let pointer_size = self.pointer_size() as u64;

        if object & (pointer_size - 1) != 0 {
            findings.add(ObjectCorruption::new(
                object,
                0,
                ObjectCorruptionKind::ObjectNotPointerAligned,
            ));
            return;
        }

        let Some(method_table) = self.reader.read_pointer(object) else {
            findings.add(ObjectCorruption::new(
                object,
                0,
                ObjectCorruptionKind::CouldNotReadMethodTable,
            ));
            return;
        };

        let ty = self.factory.get_or_create_type(method_table, object);
        let is_free = ty.as_ref().is_some_and(|ty| ty.is_free());
        let ty = match ty {
            Some(ty) if is_free || self.is_valid_method_table(method_table) => ty,
            _ => {
                findings.add(ObjectCorruption::new(
                    object,
                    0,
                    ObjectCorruptionKind::InvalidMethodTable,
                ));
                return;
            }
        };

        let size = self.object_size(object, &ty);
        if object.saturating_add(size) > segment.end()
            || (!is_free && size > segment.max_object_size())
        {
            let more = findings.add(ObjectCorruption::new(
                object,
                pointer_size as i32,
                ObjectCorruptionKind::ObjectTooLarge,
            ));
            if !more {
                return;
            }
        }

        if is_free {
            return;
        }

        let mut verify_members = false;
        if ty.contains_pointers() {
            match self.should_verify_members(segment, object) {
                Ok(verify) => {
                    verify_members = verify
                        && !(ty.is_array()
                            && findings.contains(ObjectCorruptionKind::ObjectTooLarge));
                }
                Err(()) => {
                    if !findings.add(ObjectCorruption::new(
                        object,
                        0,
                        ObjectCorruptionKind::CouldNotReadCardTable,
                    )) {
                        return;
                    }
                }
            }
        }

        if verify_members && !self.verify_members(segment, object, &ty, size, findings) {
            return;
        }

        self.verify_header(object, findings);
    }

    /// Walks the references held by `object`, returns whether there is room for more findings
    fn verify_members(
        &self,
        segment: &ClrSegment,
        object: u64,
        ty: &ClrTypeRc,
        size: u64,
        findings: &mut Findings,
    ) -> bool {
        let pointer_size = self.pointer_size() as u64;
        let empty_desc = ty.gc_desc().is_none_or(|desc| desc.is_empty());
        if empty_desc
            && !findings.add(ObjectCorruption::new(
                object,
                0,
                ObjectCorruptionKind::CouldNotReadGcDesc,
            ))
        {
            return false;
        }

        let length = size
            .min(i32::MAX as u64)
            .min(segment.end().saturating_sub(object)) as usize;
        let mut buffer = vec![0_u8; length];
        let read = self.reader.read(object, &mut buffer);
        if read != length
            && !findings.add(ObjectCorruption::new(
                object,
                read as i32,
                ObjectCorruptionKind::CouldNotReadObject,
            ))
        {
            return false;
        }

        let Some(desc) = ty.gc_desc() else {
            return true;
        };

        let free_method_table = self.factory.free_type().method_table();
        for (reference, offset) in desc.walk_object(&buffer[..read], length) {
            let offset = offset as i32;
            if reference & (pointer_size - 1) != 0
                && !findings.add(ObjectCorruption::new(
                    object,
                    offset,
                    ObjectCorruptionKind::ObjectReferenceNotPointerAligned,
                ))
            {
                return false;
            }

            let kind = match self.reader.read_pointer(reference) {
                Some(method_table) if self.is_valid_method_table(method_table) => {
                    ((method_table & !1) == free_method_table)
                        .then_some(ObjectCorruptionKind::FreeObjectReference)
                }
                _ => Some(ObjectCorruptionKind::InvalidObjectReference),
            };

            if let Some(kind) = kind {
                trace!(object, reference, %kind, "bad object reference");
                if !findings.add(ObjectCorruption::new(object, offset, kind)) {
                    return false;
                }
            }
        }

        true
    }

    fn verify_header(&self, object: u64, findings: &mut Findings) {
        let header = self.object_header(object);
        let block_index = self.get_sync_block(object).map(|block| block.index);

        match header.sync_block_index() {
            Some(0) => {
                if !findings.add(ObjectCorruption::sync_block(
                    object,
                    ObjectCorruptionKind::SyncBlockZero,
                    None,
                    block_index,
                )) {
                    return;
                }
            }
            Some(index) if Some(index) != block_index => {
                if !findings.add(ObjectCorruption::sync_block(
                    object,
                    ObjectCorruptionKind::SyncBlockMismatch,
                    Some(index),
                    block_index,
                )) {
                    return;
                }
            }
            Some(_) => {}
            None => {
                if block_index.is_some()
                    && !findings.add(ObjectCorruption::sync_block(
                        object,
                        ObjectCorruptionKind::SyncBlockMismatch,
                        None,
                        block_index,
                    ))
                {
                    return;
                }
            }
        }

        self.verify_thin_lock(object, header, findings);
    }

    fn verify_thin_lock(&self, object: u64, header: ObjectHeader, findings: &mut Findings) {
        let Some((thread_id, _)) = header.thin_lock() else {
            return;
        };

        let thread = self.dac.thread_from_thinlock_id(thread_id);
        if thread == 0 || !self.thread_addresses().contains(&thread) {
            findings.add(ObjectCorruption::new(
                object,
                -4,
                ObjectCorruptionKind::InvalidThinlock,
            ));
        }
    }

    /// Whether the members of `object` are worth checking while a background GC is
    /// planning. Unmarked objects in unswept memory are garbage and may hold stale
    /// references. `Err` if the mark array could not be read.
    fn should_verify_members(&self, segment: &ClrSegment, object: u64) -> std::result::Result<bool, ()> {
        let Some(sub_heap) = self.sub_heap_of(segment) else {
            return Ok(true);
        };
        if sub_heap.state != GcState::Planning {
            return Ok(true);
        }

        let sweep = sub_heap.current_sweep_position;
        if segment.flags.contains(SegmentFlags::SWEPT) || !segment.object_range.contains(sweep) {
            return Ok(true);
        }
        if segment.background_allocated == 0 {
            return Ok(true);
        }

        let check_saved_sweep = segment.address == sub_heap.saved_sweep_ephemeral_segment;
        let check_current_sweep = segment.object_range.contains(sweep);

        let no_bgc_mark = (check_current_sweep && object < sweep)
            || (check_saved_sweep && object >= sub_heap.saved_sweep_ephemeral_start)
            || object >= segment.background_allocated;
        if no_bgc_mark {
            return Ok(true);
        }

        self.background_object_marked(sub_heap, object)
    }

    fn background_object_marked(&self, sub_heap: &ClrSubHeap, object: u64) -> std::result::Result<bool, ()> {
        if object < sub_heap.background_saved_lowest_address
            || object >= sub_heap.background_saved_highest_address
        {
            return Ok(true);
        }

        let word = object / MARK_WORD_SIZE;
        let bit = (object / MARK_BIT_PITCH) % MARK_WORD_WIDTH;
        let address = sub_heap.mark_array.wrapping_add(4 * word);
        match self.reader.read_u32(address) {
            Some(entry) => Ok(entry & (1 << bit) != 0),
            None => {
                debug!(address, object, "could not read mark array");
                Err(())
            }
        }
    }
}
