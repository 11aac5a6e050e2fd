//! The garbage-collected heap.
//!
//! [`ClrHeap`] reconstructs the GC's layout from the query gateway and raw memory: the
//! subheaps, their segments (or regions) and generation windows, the objects laid out in
//! each segment, and the side tables the collector keeps (allocation contexts, sync blocks,
//! dependent handles). It also verifies objects against all of these, which is how heap
//! corruption is diagnosed.
//!
//! # Key Components
//!
//! - [`ClrHeap`] - Entry point, owns the [`crate::typesystem::TypeFactory`]
//! - [`ClrSubHeap`] - One GC heap instance
//! - [`ClrSegment`] - A segment or region with its generation windows
//! - [`SyncBlock`] / [`ObjectHeader`] - Monitor and COM state, and its header encoding
//! - [`ObjectCorruption`] - Result record of object verification
//!
//! # Walking Objects
//!
//! Objects in a segment are laid out back to back, each one's size derived from its method
//! table (and its component count for arrays and strings). Allocation contexts handed out to
//! threads are holes in that layout and are skipped. A plain walk ends at the first object
//! whose method table cannot be read or resolved, since nothing after it can be located. A
//! careful walk instead scans forward from there, a pointer at a time, to the next address
//! holding a valid method table and carries on. Large object segments skip ahead by
//! [`LARGE_OBJECT_THRESHOLD`] before scanning, since nothing smaller lives there.
//!
//! # Caching
//!
//! Everything the heap discovers is computed once, on first use, and lives until the owning
//! [`crate::ClrRuntime`] is flushed and a new heap is created.

mod segment;
mod subheap;
mod syncblock;
mod verify;

pub use segment::{ClrSegment, Generation, SegmentFlags, SegmentKind, LARGE_OBJECT_THRESHOLD};
pub use subheap::{ClrSubHeap, GcState};
pub use syncblock::{
    ClrThinLock, ObjectHeader, SyncBlock, SyncBlockComFlags, SyncBlockContainer, SyncBlockKind,
    SYNCBLOCK_HASHCODE, SYNCBLOCK_HASH_OR_INDEX, SYNCBLOCK_INDEX_BITS, SYNCBLOCK_INDEX_MASK,
    SYNCBLOCK_RECLEVEL_MASK, SYNCBLOCK_RECLEVEL_SHIFT, SYNCBLOCK_SPIN_LOCK,
    SYNCBLOCK_THREAD_ID_MASK,
};
pub use verify::{ObjectCorruption, ObjectCorruptionKind};

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, OnceLock},
};

use dashmap::DashSet;
use tracing::{debug, trace, warn};

use crate::{
    config::CacheOptions,
    dac::{CommonMethodTables, GcInfo, SosDac},
    runtime::walk_thread_list,
    target::{DataReader, MemoryRange},
    typesystem::{ClrTypeRc, TypeFactory},
    utils::{align_up, CancellationToken},
};

/// Kind code of a dependent handle
const HANDLE_KIND_DEPENDENT: u32 = 6;

/// Method table pointers at or below this are never real
const MIN_METHOD_TABLE: u64 = 0x1000;

/// An object address paired with its resolved type
#[derive(Debug, Clone)]
pub struct ClrObject {
    /// Address of the object, pointing at its method table pointer
    pub address: u64,
    /// Type of the object, `None` if its method table could not be resolved
    pub ty: Option<ClrTypeRc>,
}

impl ClrObject {
    /// Whether the object is a free-space filler
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.ty.as_ref().is_some_and(|ty| ty.is_free())
    }
}

/// The managed heap of one runtime.
pub struct ClrHeap {
    dac: Arc<dyn SosDac>,
    reader: Arc<dyn DataReader>,
    options: CacheOptions,
    cancel: CancellationToken,
    gc_info: GcInfo,
    factory: TypeFactory,
    sub_heaps: OnceLock<Vec<ClrSubHeap>>,
    segments: OnceLock<Vec<ClrSegment>>,
    allocation_contexts: OnceLock<HashMap<u64, u64>>,
    dependent_handles: OnceLock<Vec<(u64, u64)>>,
    sync_blocks: OnceLock<SyncBlockContainer>,
    threads: OnceLock<HashSet<u64>>,
    valid_method_tables: DashSet<u64>,
}

impl ClrHeap {
    /// Creates the heap and its type factory.
    ///
    /// ## Arguments
    /// * 'dac'        - The structured query gateway
    /// * 'reader'     - Raw memory access
    /// * 'options'    - Cache policy
    /// * 'cancel'     - Token every walk over the heap honors
    /// * 'common'     - Method tables of the system types
    /// * 'bcl_module' - The base class library module, `0` if unknown
    pub fn new(
        dac: Arc<dyn SosDac>,
        reader: Arc<dyn DataReader>,
        options: CacheOptions,
        cancel: CancellationToken,
        common: CommonMethodTables,
        bcl_module: u64,
    ) -> Self {
        let gc_info = dac.gc_heap_data().unwrap_or_else(|| {
            warn!("GC heap data unavailable");
            GcInfo::default()
        });
        debug!(
            server = gc_info.server_mode,
            heaps = gc_info.heap_count,
            regions = gc_info.has_regions,
            "creating heap"
        );

        let factory = TypeFactory::new(dac.clone(), reader.clone(), options, common, bcl_module);
        ClrHeap {
            dac,
            reader,
            options,
            cancel,
            gc_info,
            factory,
            sub_heaps: OnceLock::new(),
            segments: OnceLock::new(),
            allocation_contexts: OnceLock::new(),
            dependent_handles: OnceLock::new(),
            sync_blocks: OnceLock::new(),
            threads: OnceLock::new(),
            valid_method_tables: DashSet::new(),
        }
    }

    /// Whether the GC runs one subheap per core
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.gc_info.server_mode
    }

    /// Global GC configuration
    #[must_use]
    pub fn gc_info(&self) -> &GcInfo {
        &self.gc_info
    }

    /// The type factory backing this heap
    #[must_use]
    pub fn type_factory(&self) -> &TypeFactory {
        &self.factory
    }

    /// Size of a pointer in the target
    #[must_use]
    pub fn pointer_size(&self) -> usize {
        self.reader.pointer_size()
    }

    /// Resolve a method table to a type, see [`TypeFactory::get_or_create_type`]
    pub fn get_or_create_type(&self, method_table: u64, object: u64) -> Option<ClrTypeRc> {
        self.factory.get_or_create_type(method_table, object)
    }

    /// Type of the object at `object`
    pub fn get_object_type(&self, object: u64) -> Option<ClrTypeRc> {
        let method_table = self.reader.read_pointer(object)?;
        self.factory.get_or_create_type(method_table, object)
    }

    /// The subheaps, discovered once
    pub fn sub_heaps(&self) -> &[ClrSubHeap] {
        self.sub_heaps
            .get_or_init(|| subheap::enumerate_sub_heaps(self.dac.as_ref(), &self.gc_info))
    }

    /// Discovers the subheaps afresh, bypassing the cached list
    #[must_use]
    pub fn enumerate_sub_heaps(&self) -> Vec<ClrSubHeap> {
        subheap::enumerate_sub_heaps(self.dac.as_ref(), &self.gc_info)
    }

    /// Walks the generation lists of one subheap
    #[must_use]
    pub fn enumerate_segments(&self, sub_heap: &ClrSubHeap) -> Vec<ClrSegment> {
        segment::enumerate_segments(
            self.dac.as_ref(),
            self.pointer_size(),
            sub_heap,
            &self.cancel,
        )
    }

    /// All segments of all subheaps, sorted by start address
    pub fn segments(&self) -> &[ClrSegment] {
        self.segments.get_or_init(|| {
            let mut segments: Vec<_> = self
                .sub_heaps()
                .iter()
                .flat_map(|sub_heap| self.enumerate_segments(sub_heap))
                .collect();
            segments.sort_by_key(ClrSegment::start);
            debug!(count = segments.len(), "heap segments");
            segments
        })
    }

    /// The segment whose object range contains `address`
    pub fn get_segment_by_address(&self, address: u64) -> Option<&ClrSegment> {
        let segments = self.segments();
        let index = segments.partition_point(|segment| segment.start() <= address);
        let segment = segments.get(index.checked_sub(1)?)?;
        segment.object_range.contains(address).then_some(segment)
    }

    /// Subheap owning `segment`
    pub fn sub_heap_of(&self, segment: &ClrSegment) -> Option<&ClrSubHeap> {
        self.sub_heaps()
            .iter()
            .find(|sub_heap| sub_heap.index == segment.sub_heap)
    }

    /// Size of an object, at least the minimum object size
    ///
    /// Arrays and strings add their component count, read from the object, times the
    /// component size. Strings also count their null terminator.
    #[must_use]
    pub fn object_size(&self, object: u64, ty: &ClrTypeRc) -> u64 {
        let min_size = self.min_object_size();
        self.unaligned_size(object, ty).unwrap_or(0).max(min_size)
    }

    fn min_object_size(&self) -> u64 {
        self.pointer_size() as u64 * 3
    }

    fn unaligned_size(&self, object: u64, ty: &ClrTypeRc) -> Option<u64> {
        let static_size = u64::from(ty.static_size());
        let component_size = u64::from(ty.component_size());
        if component_size == 0 {
            return Some(static_size);
        }

        let mut count = u64::from(
            self.reader
                .read_u32(object.wrapping_add(self.pointer_size() as u64))?,
        );
        if ty.is_string() {
            count += 1;
        }
        Some(count.saturating_mul(component_size).saturating_add(static_size))
    }

    fn aligned_step(&self, size: u64, segment: &ClrSegment) -> u64 {
        let alignment = match segment.kind {
            SegmentKind::Large | SegmentKind::Pinned => 8,
            _ => self.pointer_size() as u64,
        };
        align_up(size, alignment).max(self.min_object_size())
    }

    /// Objects of one segment, in address order
    ///
    /// The walk ends at the first object whose method table cannot be read or resolved.
    pub fn enumerate_objects<'a>(&'a self, segment: &'a ClrSegment) -> SegmentObjects<'a> {
        SegmentObjects {
            heap: self,
            segment,
            next: Some(segment.start()),
            careful: false,
        }
    }

    /// Objects of one segment, resuming after unwalkable memory
    ///
    /// Where [`ClrHeap::enumerate_objects`] would stop, this scans forward to the next
    /// address holding a valid method table. Objects whose method table was read but not
    /// resolved are still yielded, untyped. Scanning is slow on badly damaged segments.
    pub fn enumerate_objects_carefully<'a>(
        &'a self,
        segment: &'a ClrSegment,
    ) -> SegmentObjects<'a> {
        SegmentObjects {
            careful: true,
            ..self.enumerate_objects(segment)
        }
    }

    /// Objects of every segment, in address order
    pub fn enumerate_all_objects(&self) -> impl Iterator<Item = ClrObject> + '_ {
        self.segments()
            .iter()
            .flat_map(move |segment| self.enumerate_objects(segment))
    }

    /// Objects of every segment, resuming after unwalkable memory
    pub fn enumerate_all_objects_carefully(&self) -> impl Iterator<Item = ClrObject> + '_ {
        self.segments()
            .iter()
            .flat_map(move |segment| self.enumerate_objects_carefully(segment))
    }

    /// Distance a careful walk moves past an object it cannot size
    fn resync_skip(&self, segment: &ClrSegment) -> u64 {
        match segment.kind {
            SegmentKind::Large => LARGE_OBJECT_THRESHOLD,
            _ => self.min_object_size(),
        }
    }

    /// First address at or after `address` holding a valid method table. `None` once the
    /// segment ends or its memory stops being readable.
    fn find_next_valid_object(&self, segment: &ClrSegment, address: u64) -> Option<u64> {
        let pointer_size = self.pointer_size() as u64;
        let mut candidate = align_up(address, pointer_size);
        while segment.object_range.contains(candidate) {
            break_if_cancelled!(self.cancel, "object resync");

            let past_context = self.skip_allocation_context(segment, candidate)?;
            if past_context != candidate {
                candidate = past_context;
                continue;
            }

            let method_table = self.reader.read_pointer(candidate)?;
            if method_table > MIN_METHOD_TABLE && self.is_valid_method_table(method_table) {
                trace!(address, resumed = candidate, "object walk resynchronized");
                return Some(candidate);
            }
            candidate = candidate.saturating_add(pointer_size);
        }

        None
    }

    /// Start → end of every allocation context
    fn allocation_context_map(&self) -> &HashMap<u64, u64> {
        self.allocation_contexts.get_or_init(|| {
            let mut contexts = HashMap::new();
            if let Some((pointer, limit)) = self.dac.global_allocation_context() {
                if pointer < limit {
                    contexts.insert(pointer, limit);
                }
            }

            if let Some(store) = self.dac.thread_store_data() {
                let threads = walk_thread_list(
                    self.dac.as_ref(),
                    &store,
                    self.options.max_thread_count,
                    &self.cancel,
                );
                for (_, thread) in threads {
                    if thread.allocation_context_pointer < thread.allocation_context_limit {
                        contexts.insert(
                            thread.allocation_context_pointer,
                            thread.allocation_context_limit,
                        );
                    }
                }
            }

            for sub_heap in self.sub_heaps() {
                let context = sub_heap.allocation_context();
                if !context.is_empty() {
                    contexts.insert(context.start, context.end);
                }
            }

            debug!(count = contexts.len(), "allocation contexts");
            contexts
        })
    }

    /// Memory handed to threads for allocation, which holds no objects yet
    #[must_use]
    pub fn enumerate_allocation_contexts(&self) -> Vec<MemoryRange> {
        let mut contexts: Vec<_> = self
            .allocation_context_map()
            .iter()
            .map(|(start, end)| MemoryRange::new(*start, *end))
            .collect();
        contexts.sort();
        contexts
    }

    /// Moves `address` past any allocation context starting there. `None` if the contexts
    /// are inconsistent with the segment.
    fn skip_allocation_context(&self, segment: &ClrSegment, address: u64) -> Option<u64> {
        if matches!(segment.kind, SegmentKind::Large | SegmentKind::Frozen) {
            return Some(address);
        }

        let contexts = self.allocation_context_map();
        let mut address = address;
        while let Some(limit) = contexts.get(&address) {
            let next = limit.saturating_add(self.aligned_step(self.min_object_size(), segment));
            if address >= next || address >= segment.end() {
                warn!(address, limit, "allocation context does not advance the walk");
                return None;
            }
            address = next;
        }

        Some(address)
    }

    /// `(source, target)` of every dependent handle, sorted by source
    pub fn enumerate_dependent_handles(&self) -> &[(u64, u64)] {
        self.dependent_handles.get_or_init(|| {
            let mut pairs = Vec::new();
            for handle in self.dac.handles().unwrap_or_default() {
                if self.cancel.is_cancelled() {
                    debug!(walk = "dependent handles", "walk cancelled");
                    break;
                }
                if handle.handle_type != HANDLE_KIND_DEPENDENT {
                    continue;
                }
                if let Some(source) = self.reader.read_pointer(handle.handle) {
                    if source != 0 {
                        pairs.push((source, handle.secondary));
                    }
                }
            }
            pairs.sort_unstable();
            pairs
        })
    }

    /// The sync block table, read once
    pub fn sync_blocks(&self) -> &SyncBlockContainer {
        self.sync_blocks.get_or_init(|| {
            SyncBlockContainer::new(syncblock::enumerate_sync_blocks(
                self.dac.as_ref(),
                &self.cancel,
            ))
        })
    }

    /// Live sync blocks in table order
    pub fn enumerate_sync_blocks(&self) -> &[SyncBlock] {
        self.sync_blocks().blocks()
    }

    /// Sync block of `object`
    pub fn get_sync_block(&self, object: u64) -> Option<&SyncBlock> {
        self.sync_blocks().get(object)
    }

    /// Header word in front of `object`, `0` if unreadable
    #[must_use]
    pub fn object_header(&self, object: u64) -> ObjectHeader {
        ObjectHeader(
            object
                .checked_sub(4)
                .and_then(|address| self.reader.read_u32(address))
                .unwrap_or(0),
        )
    }

    /// Thin lock held through the header of `object`
    #[must_use]
    pub fn get_thin_lock(&self, object: u64) -> Option<ClrThinLock> {
        let (thread_id, recursion) = self.object_header(object).thin_lock()?;
        let thread = self.dac.thread_from_thinlock_id(thread_id);
        (thread != 0).then_some(ClrThinLock { thread, recursion })
    }

    /// Addresses of the live managed threads
    fn thread_addresses(&self) -> &HashSet<u64> {
        self.threads.get_or_init(|| {
            self.dac
                .thread_store_data()
                .map(|store| {
                    walk_thread_list(
                        self.dac.as_ref(),
                        &store,
                        self.options.max_thread_count,
                        &self.cancel,
                    )
                    .into_iter()
                    .map(|(address, _)| address)
                    .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Whether the gateway can describe the method table at `method_table`
    ///
    /// Successful validations are remembered when the cache policy allows it.
    pub fn is_valid_method_table(&self, method_table: u64) -> bool {
        let method_table = method_table & !1;
        if method_table == 0 {
            return false;
        }

        let caching = self.options.cache_method_table_validity;
        if caching && self.valid_method_tables.contains(&method_table) {
            return true;
        }

        let valid = self.dac.method_table_data(method_table).is_some();
        if valid && caching {
            self.valid_method_tables.insert(method_table);
        }
        valid
    }

    /// References held by an object
    ///
    /// Only the part of the object inside its segment is read, so a corrupt array length
    /// cannot make this read past the segment. Objects outside every segment report no
    /// references of their own. With `include_dependent`, targets of dependent handles
    /// whose source is `object` are reported as well.
    #[must_use]
    pub fn enumerate_object_references(
        &self,
        object: u64,
        ty: &ClrTypeRc,
        include_dependent: bool,
    ) -> Vec<u64> {
        let mut references = Vec::new();

        if ty.contains_pointers() {
            if let Some(gc_desc) = ty.gc_desc() {
                let segment_end = self
                    .get_segment_by_address(object)
                    .map_or(object, ClrSegment::end);
                let size = self
                    .object_size(object, ty)
                    .min(i32::MAX as u64)
                    .min(segment_end.saturating_sub(object)) as usize;
                let mut buffer = vec![0_u8; size];
                let read = self.reader.read(object, &mut buffer);
                references.extend(
                    gc_desc
                        .walk_object(&buffer[..read], size)
                        .into_iter()
                        .map(|(reference, _)| reference),
                );
            }
        }

        if include_dependent {
            let dependent = self.enumerate_dependent_handles();
            let first = dependent.partition_point(|(source, _)| *source < object);
            references.extend(
                dependent[first..]
                    .iter()
                    .take_while(|(source, _)| *source == object)
                    .map(|(_, target)| *target),
            );
        }

        trace!(object, count = references.len(), "object references");
        references
    }
}

impl fmt::Debug for ClrHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClrHeap")
            .field("server", &self.gc_info.server_mode)
            .field("regions", &self.gc_info.has_regions)
            .field("cached_types", &self.factory.cached_type_count())
            .finish_non_exhaustive()
    }
}

/// Iterator over the objects of one segment, see [`ClrHeap::enumerate_objects`] and
/// [`ClrHeap::enumerate_objects_carefully`]
pub struct SegmentObjects<'a> {
    heap: &'a ClrHeap,
    segment: &'a ClrSegment,
    next: Option<u64>,
    careful: bool,
}

impl SegmentObjects<'_> {
    /// Where the walk continues after an object it could not size
    fn resume_after(&self, address: u64) -> Option<u64> {
        if !self.careful {
            return None;
        }
        let skip = self.heap.resync_skip(self.segment);
        self.heap
            .find_next_valid_object(self.segment, address.saturating_add(skip))
    }
}

impl Iterator for SegmentObjects<'_> {
    type Item = ClrObject;

    fn next(&mut self) -> Option<ClrObject> {
        loop {
            let address = self.next.take()?;
            if !self.segment.object_range.contains(address) {
                return None;
            }
            if self.heap.cancel.is_cancelled() {
                debug!(walk = "object walk", "walk cancelled");
                return None;
            }

            let Some(method_table) = self.heap.reader.read_pointer(address) else {
                trace!(address, careful = self.careful, "unreadable method table");
                self.next = self.resume_after(address);
                continue;
            };

            let ty = self.heap.factory.get_or_create_type(method_table, address);
            match &ty {
                Some(ty) => match self.heap.unaligned_size(address, ty) {
                    Some(size) => {
                        let step = self.heap.aligned_step(size, self.segment);
                        self.next = self
                            .heap
                            .skip_allocation_context(self.segment, address.saturating_add(step));
                    }
                    None => {
                        trace!(address, careful = self.careful, "unreadable component count");
                        self.next = self.resume_after(address);
                    }
                },
                None => {
                    trace!(address, method_table, careful = self.careful, "unknown type");
                    self.next = self.resume_after(address);
                }
            }

            return Some(ClrObject { address, ty });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        dac::{
            GenerationData, HandleData, HeapDetails, MethodTableData, ThreadData,
            ThreadStoreData,
        },
        test::{method_table, segment, MockDac, MockReader},
    };

    pub(super) const OBJECT: u64 = 0x7_1000;
    pub(super) const STRING: u64 = 0x7_2000;
    pub(super) const FREE: u64 = 0x7_3000;
    pub(super) const NODE: u64 = 0x7_4000;
    pub(super) const BYTES: u64 = 0x7_5000;

    pub(super) const SEGMENT_START: u64 = 0x10_0000;

    /// A workstation heap with one gen2 segment holding the objects written by `layout`
    pub(super) fn heap_with(
        configure: impl FnOnce(&mut MockDac),
        layout: impl FnOnce(&MockReader) -> u64,
    ) -> (Arc<MockDac>, Arc<MockReader>, ClrHeap) {
        let reader = Arc::new(MockReader::new(8));
        let end = layout(&reader);

        let mut dac = MockDac::new();
        dac.common = Some(CommonMethodTables {
            object: OBJECT,
            string: STRING,
            free: FREE,
            ..Default::default()
        });
        dac.add_method_table(OBJECT, method_table(0, 24, 0), "System.Object");
        dac.add_method_table(STRING, method_table(OBJECT, 22, 2), "System.String");
        dac.add_method_table(FREE, method_table(0, 24, 1), "Free");
        dac.add_method_table(
            NODE,
            MethodTableData {
                contains_pointers: true,
                ..method_table(OBJECT, 32, 0)
            },
            "Node",
        );
        dac.add_method_table(BYTES, method_table(OBJECT, 24, 1), "System.Byte[]");
        dac.gc_info = Some(GcInfo {
            heap_count: 1,
            max_generation: 2,
            ..Default::default()
        });
        dac.segments
            .insert(0x500, segment(0x500, SEGMENT_START, end, 0));
        dac.workstation = Some(HeapDetails {
            generation_table: vec![
                GenerationData::default(),
                GenerationData::default(),
                GenerationData {
                    start_segment: 0x500,
                    ..Default::default()
                },
                GenerationData::default(),
            ],
            ..Default::default()
        });
        configure(&mut dac);

        let dac = Arc::new(dac);
        let common = dac.common.unwrap_or_default();
        let heap = ClrHeap::new(
            dac.clone(),
            reader.clone(),
            CacheOptions::default(),
            CancellationToken::new(),
            common,
            0,
        );
        (dac, reader, heap)
    }

    /// `Node` instances hold one reference at offset 8
    pub(super) fn write_node(reader: &MockReader, address: u64, reference: u64) {
        reader.fill(address - 8, 40);
        reader.write_pointer(address, NODE);
        reader.write_pointer(address + 8, reference);
        // GC descriptor: one series of one pointer at offset 8
        reader.write(
            NODE - 24,
            &[(8 - 32_i64).to_le_bytes(), 8_u64.to_le_bytes(), 1_u64.to_le_bytes()].concat(),
        );
    }

    #[test]
    fn walks_objects_in_order() {
        let (_, _, heap) = heap_with(
            |_| {},
            |reader| {
                let mut at = SEGMENT_START;
                reader.fill(at - 8, 0x200);
                reader.write_pointer(at, OBJECT);
                at += 24;
                // "hi": 22 + 2 * (2 + 1) = 28, aligned to 32
                reader.write_pointer(at, STRING);
                reader.write_u32(at + 8, 2);
                at += 32;
                // 5 bytes: 24 + 5 = 29, aligned to 32
                reader.write_pointer(at, BYTES);
                reader.write_u32(at + 8, 5);
                at += 32;
                reader.write_pointer(at, OBJECT);
                at + 24
            },
        );

        let segment = heap.segments()[0].clone();
        let objects: Vec<_> = heap.enumerate_objects(&segment).collect();
        let addresses: Vec<_> = objects.iter().map(|o| o.address - SEGMENT_START).collect();
        assert_eq!(addresses, vec![0, 24, 56, 88]);
        assert!(objects[1].ty.as_ref().is_some_and(|ty| ty.is_string()));

        let string = objects[1].ty.clone().unwrap();
        assert_eq!(heap.object_size(objects[1].address, &string), 28);
    }

    #[test]
    fn walk_stops_at_unknown_type() {
        let (_, _, heap) = heap_with(
            |_| {},
            |reader| {
                reader.fill(SEGMENT_START - 8, 0x100);
                reader.write_pointer(SEGMENT_START, OBJECT);
                reader.write_pointer(SEGMENT_START + 24, 0xbad0);
                reader.write_pointer(SEGMENT_START + 48, OBJECT);
                SEGMENT_START + 72
            },
        );

        let objects: Vec<_> = heap.enumerate_all_objects().collect();
        assert_eq!(objects.len(), 2);
        assert!(objects[1].ty.is_none());
    }

    #[test]
    fn careful_walk_resumes_after_unknown_type() {
        let (_, _, heap) = heap_with(
            |_| {},
            |reader| {
                reader.fill(SEGMENT_START - 8, 0x100);
                reader.write_pointer(SEGMENT_START, OBJECT);
                reader.write_pointer(SEGMENT_START + 24, 0xbad0);
                // garbage below the smallest method table is scanned past
                reader.write_pointer(SEGMENT_START + 48, 0x800);
                reader.write_pointer(SEGMENT_START + 64, OBJECT);
                SEGMENT_START + 88
            },
        );

        let segment = heap.segments()[0].clone();
        let objects: Vec<_> = heap.enumerate_objects_carefully(&segment).collect();
        let addresses: Vec<_> = objects.iter().map(|o| o.address - SEGMENT_START).collect();
        assert_eq!(addresses, vec![0, 24, 64]);
        assert!(objects[1].ty.is_none());
        assert!(objects[2].ty.is_some());

        assert_eq!(heap.enumerate_all_objects().count(), 2);
    }

    #[test]
    fn careful_walk_crosses_unreadable_memory() {
        let (_, reader, heap) = heap_with(
            |_| {},
            |reader| {
                reader.fill(SEGMENT_START - 8, 0x100);
                reader.write_pointer(SEGMENT_START, OBJECT);
                reader.write_pointer(SEGMENT_START + 48, OBJECT);
                SEGMENT_START + 72
            },
        );
        reader.unmap(SEGMENT_START + 24, 8);

        let segment = heap.segments()[0].clone();
        let careful: Vec<_> = heap
            .enumerate_objects_carefully(&segment)
            .map(|o| o.address - SEGMENT_START)
            .collect();
        assert_eq!(careful, vec![0, 48]);

        let plain: Vec<_> = heap
            .enumerate_objects(&segment)
            .map(|o| o.address - SEGMENT_START)
            .collect();
        assert_eq!(plain, vec![0]);
    }

    #[test]
    fn allocation_contexts_are_skipped() {
        let (_, _, heap) = heap_with(
            |dac| {
                dac.thread_store = Some(ThreadStoreData {
                    thread_count: 1,
                    first_thread: 0x9000,
                    ..Default::default()
                });
                dac.threads.insert(
                    0x9000,
                    ThreadData {
                        allocation_context_pointer: SEGMENT_START + 24,
                        allocation_context_limit: SEGMENT_START + 0x80,
                        ..Default::default()
                    },
                );
            },
            |reader| {
                reader.fill(SEGMENT_START - 8, 0x200);
                reader.write_pointer(SEGMENT_START, OBJECT);
                // the context limit is followed by a minimum-size gap
                reader.write_pointer(SEGMENT_START + 0x80 + 24, OBJECT);
                SEGMENT_START + 0x80 + 48
            },
        );

        let objects: Vec<_> = heap.enumerate_all_objects().collect();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].address, SEGMENT_START + 0x98);
        assert_eq!(
            heap.enumerate_allocation_contexts(),
            vec![MemoryRange::new(SEGMENT_START + 24, SEGMENT_START + 0x80)]
        );
    }

    #[test]
    fn segment_lookup() {
        let (_, _, heap) = heap_with(|_| {}, |_| SEGMENT_START + 0x1000);
        assert!(heap.get_segment_by_address(SEGMENT_START).is_some());
        assert!(heap.get_segment_by_address(SEGMENT_START + 0xfff).is_some());
        assert!(heap.get_segment_by_address(SEGMENT_START + 0x1000).is_none());
        assert!(heap.get_segment_by_address(SEGMENT_START - 1).is_none());
        assert!(heap.get_segment_by_address(0).is_none());
    }

    #[test]
    fn method_table_validity_is_memoized() {
        let (dac, _, heap) = heap_with(|_| {}, |_| SEGMENT_START + 0x100);
        let before = dac.method_table_calls.load(std::sync::atomic::Ordering::SeqCst);
        assert!(heap.is_valid_method_table(NODE | 1));
        assert!(heap.is_valid_method_table(NODE));
        assert!(!heap.is_valid_method_table(0xdead0));
        assert!(!heap.is_valid_method_table(0));
        let after = dac.method_table_calls.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(after - before, 2);
    }

    #[test]
    fn references_and_dependent_handles() {
        let target = SEGMENT_START + 0x40;
        let (_, reader, heap) = heap_with(
            |dac| {
                dac.handles = Some(vec![
                    HandleData {
                        handle: 0x8_0000,
                        secondary: 0x1234_0000,
                        handle_type: HANDLE_KIND_DEPENDENT,
                        ..Default::default()
                    },
                    HandleData {
                        handle: 0x8_0008,
                        handle_type: 2,
                        ..Default::default()
                    },
                ]);
            },
            |reader| {
                write_node(reader, SEGMENT_START, target);
                reader.write_pointer(target, OBJECT);
                SEGMENT_START + 0x58
            },
        );
        reader.write_pointer(0x8_0000, SEGMENT_START);
        reader.write_pointer(0x8_0008, target);

        let node = heap.get_object_type(SEGMENT_START).unwrap();
        assert_eq!(
            heap.enumerate_object_references(SEGMENT_START, &node, false),
            vec![target]
        );
        assert_eq!(
            heap.enumerate_object_references(SEGMENT_START, &node, true),
            vec![target, 0x1234_0000]
        );
        assert_eq!(heap.enumerate_dependent_handles(), &[(SEGMENT_START, 0x1234_0000)]);
    }

    #[test]
    fn references_stop_at_the_segment_end() {
        const NODES: u64 = 0x7_6000;
        let (_, reader, heap) = heap_with(
            |dac| {
                dac.add_method_table(
                    NODES,
                    MethodTableData {
                        contains_pointers: true,
                        ..method_table(OBJECT, 24, 8)
                    },
                    "Node[]",
                );
            },
            |reader| {
                reader.fill(SEGMENT_START - 8, 0x48);
                reader.write_pointer(SEGMENT_START, NODES);
                // length far beyond the segment
                reader.write_u32(SEGMENT_START + 8, 0x1000_0000);
                reader.write_pointer(SEGMENT_START + 16, SEGMENT_START + 0x100);
                reader.write_pointer(SEGMENT_START + 24, SEGMENT_START + 0x200);
                // GC descriptor: elements from offset 16 to the end of the object
                reader.write(
                    NODES - 24,
                    &[(-24_i64).to_le_bytes(), 16_u64.to_le_bytes(), 1_u64.to_le_bytes()]
                        .concat(),
                );
                SEGMENT_START + 0x40
            },
        );

        let array = heap.get_object_type(SEGMENT_START).unwrap();
        assert!(heap.object_size(SEGMENT_START, &array) > 0x8000_0000);

        assert_eq!(
            heap.enumerate_object_references(SEGMENT_START, &array, false),
            vec![SEGMENT_START + 0x100, SEGMENT_START + 0x200]
        );
        assert!(reader.largest_read.load(std::sync::atomic::Ordering::SeqCst) <= 0x40);
    }

    #[test]
    fn thin_lock_lookup() {
        let (_, reader, heap) = heap_with(
            |dac| {
                dac.thinlocks.insert(5, 0x9000);
            },
            |reader| {
                reader.fill(SEGMENT_START - 8, 32);
                reader.write_pointer(SEGMENT_START, OBJECT);
                SEGMENT_START + 24
            },
        );
        reader.write_u32(SEGMENT_START - 4, (2 << SYNCBLOCK_RECLEVEL_SHIFT) | 5);

        assert_eq!(
            heap.get_thin_lock(SEGMENT_START),
            Some(ClrThinLock {
                thread: 0x9000,
                recursion: 2
            })
        );
    }
}
