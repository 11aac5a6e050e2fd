//! GC segments and regions, and their discovery from a subheap's generation table.

use std::collections::HashSet;

use bitflags::bitflags;
use tracing::{trace, warn};

use crate::{
    dac::SosDac,
    heap::subheap::ClrSubHeap,
    target::MemoryRange,
    utils::CancellationToken,
};

/// Objects at least this large are allocated on the large object heap
pub const LARGE_OBJECT_THRESHOLD: u64 = 85_000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Flags the GC keeps on each heap segment
    pub struct SegmentFlags : u64 {
        /// Read-only segment holding frozen objects
        const READ_ONLY = 0x0001;
        /// The segment lies within the GC's reserved range
        const IN_RANGE = 0x0002;
        /// Large object segment scheduled for deletion
        const LOH_DELETE = 0x0008;
        /// Background sweep already processed the segment
        const SWEPT = 0x0010;
        /// Mark array for the segment is committed
        const MA_COMMITTED = 0x0040;
        /// Mark array for the segment is partially committed
        const MA_PCOMMITTED = 0x0080;
        /// Upper object heap segment scheduled for deletion
        const UOH_DELETE = 0x0100;
    }
}

/// What a segment holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum SegmentKind {
    /// Region holding generation 0 objects
    Generation0,
    /// Region holding generation 1 objects
    Generation1,
    /// Segment or region holding generation 2 objects
    Generation2,
    /// Large object heap
    Large,
    /// Pinned object heap
    Pinned,
    /// Frozen, read-only objects
    Frozen,
    /// The segment holding generations 0 and 1 in segment mode, with the start of generation 2
    Ephemeral,
}

/// Generation of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Generation {
    /// Generation 0
    Generation0,
    /// Generation 1
    Generation1,
    /// Generation 2
    Generation2,
    /// Large object heap
    Large,
    /// Pinned object heap
    Pinned,
    /// Frozen object heap
    Frozen,
    /// The address is not part of a known generation window
    Unknown,
}

/// A contiguous range of GC memory
///
/// The ranges nest: `object_range` lies within `committed_memory`, and `reserved_memory`
/// starts where committed memory ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClrSegment {
    /// Address of the segment descriptor
    pub address: u64,
    /// Index of the owning subheap
    pub sub_heap: usize,
    /// What the segment holds
    pub kind: SegmentKind,
    /// Memory occupied by objects
    pub object_range: MemoryRange,
    /// Memory committed for the segment
    pub committed_memory: MemoryRange,
    /// Memory reserved but not committed
    pub reserved_memory: MemoryRange,
    /// Generation 0 window, empty unless this segment holds generation 0
    pub generation0: MemoryRange,
    /// Generation 1 window, empty unless this segment holds generation 1
    pub generation1: MemoryRange,
    /// Generation 2 window
    pub generation2: MemoryRange,
    /// Raw segment flags
    pub flags: SegmentFlags,
    /// Next segment in the generation's list
    pub next: u64,
    /// Background GC allocation pointer
    pub background_allocated: u64,
}

impl ClrSegment {
    /// First object address
    #[must_use]
    pub fn start(&self) -> u64 {
        self.object_range.start
    }

    /// End of the objects
    #[must_use]
    pub fn end(&self) -> u64 {
        self.object_range.end
    }

    /// Bytes occupied by objects
    #[must_use]
    pub fn length(&self) -> u64 {
        self.object_range.length()
    }

    /// Whether objects in this segment never move
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        matches!(
            self.kind,
            SegmentKind::Pinned | SegmentKind::Large | SegmentKind::Frozen
        )
    }

    /// Largest object the segment can hold
    #[must_use]
    pub fn max_object_size(&self) -> u64 {
        match self.kind {
            SegmentKind::Large | SegmentKind::Pinned | SegmentKind::Frozen => i32::MAX as u64,
            _ => LARGE_OBJECT_THRESHOLD,
        }
    }

    /// Generation of an object inside this segment
    #[must_use]
    pub fn generation_of(&self, object: u64) -> Generation {
        match self.kind {
            SegmentKind::Generation0 => Generation::Generation0,
            SegmentKind::Generation1 => Generation::Generation1,
            SegmentKind::Generation2 => Generation::Generation2,
            SegmentKind::Large => Generation::Large,
            SegmentKind::Pinned => Generation::Pinned,
            SegmentKind::Frozen => Generation::Frozen,
            SegmentKind::Ephemeral => {
                if self.generation0.contains(object) {
                    Generation::Generation0
                } else if self.generation1.contains(object) {
                    Generation::Generation1
                } else if self.generation2.contains(object) {
                    Generation::Generation2
                } else {
                    Generation::Unknown
                }
            }
        }
    }
}

/// Walks every generation list of `sub_heap`.
///
/// Lists are visited as gen3 (large), gen2, then gen1 and gen0 in region mode, and gen4
/// (pinned) when the table has it. A segment reachable from two lists, or a list that
/// loops, is reported once.
pub(crate) fn enumerate_segments(
    dac: &dyn SosDac,
    pointer_size: usize,
    sub_heap: &ClrSubHeap,
    cancel: &CancellationToken,
) -> Vec<ClrSegment> {
    let mut generations = vec![3, 2];
    if sub_heap.has_regions {
        generations.extend([1, 0]);
    }
    if sub_heap.generation_table.len() > 4 {
        generations.push(4);
    }

    let mut seen = HashSet::from([0_u64]);
    let mut segments = Vec::new();
    for generation in generations {
        let Some(entry) = sub_heap.generation_table.get(generation) else {
            continue;
        };

        let mut address = entry.start_segment;
        loop {
            break_if_cancelled!(cancel, "segment list");
            if !seen.insert(address) {
                if address != 0 {
                    warn!(sub_heap = sub_heap.index, generation, address, "segment list revisits a segment");
                }
                break;
            }

            let Some(segment) = create_segment(dac, pointer_size, sub_heap, address, generation)
            else {
                break;
            };

            trace!(address, kind = %segment.kind, range = %segment.object_range, "segment");
            address = segment.next;
            segments.push(segment);
        }
    }

    segments
}

fn create_segment(
    dac: &dyn SosDac,
    pointer_size: usize,
    sub_heap: &ClrSubHeap,
    address: u64,
    generation: usize,
) -> Option<ClrSegment> {
    let data = dac.segment_data(address)?;
    let flags = SegmentFlags::from_bits_retain(data.flags);
    let is_ephemeral = !sub_heap.has_regions && sub_heap.ephemeral_heap_segment == address;

    let kind = if flags.contains(SegmentFlags::READ_ONLY) {
        SegmentKind::Frozen
    } else {
        match generation {
            3 => SegmentKind::Large,
            4 => SegmentKind::Pinned,
            0 if sub_heap.has_regions => SegmentKind::Generation0,
            1 if sub_heap.has_regions => SegmentKind::Generation1,
            _ if is_ephemeral => SegmentKind::Ephemeral,
            _ => SegmentKind::Generation2,
        }
    };

    let object_end = if sub_heap.ephemeral_heap_segment == address {
        sub_heap.allocated
    } else {
        data.allocated
    };
    let object_range = MemoryRange::new(data.start, object_end);

    let committed_start = committed_start(kind, object_range.start, pointer_size);
    let committed_memory = MemoryRange::new(committed_start, data.committed.max(object_range.end));
    let reserved_memory = MemoryRange::new(
        committed_memory.end,
        data.reserved.max(committed_memory.end),
    );

    let (generation0, generation1, generation2) = if sub_heap.has_regions {
        match generation {
            0 => (object_range, MemoryRange::default(), MemoryRange::default()),
            1 => (MemoryRange::default(), object_range, MemoryRange::default()),
            _ => (MemoryRange::default(), MemoryRange::default(), object_range),
        }
    } else if kind == SegmentKind::Ephemeral {
        let gen0_start = sub_heap.generation_allocation_start(0);
        let gen1_start = sub_heap.generation_allocation_start(1);
        let generation0 = MemoryRange::new(gen0_start, object_range.end);
        let generation1 = MemoryRange::new(gen1_start, generation0.start);
        let generation2 = MemoryRange::new(object_range.start, generation1.start);
        (generation0, generation1, generation2)
    } else {
        (MemoryRange::default(), MemoryRange::default(), object_range)
    };

    Some(ClrSegment {
        address: data.address,
        sub_heap: sub_heap.index,
        kind,
        object_range,
        committed_memory,
        reserved_memory,
        generation0,
        generation1,
        generation2,
        flags,
        next: data.next,
        background_allocated: data.background_allocated,
    })
}

/// Best guess at where a segment's committed memory begins.
///
/// Regions put an aligned plug before the first object, segments a header whose size
/// depends on the runtime build. Neither is reported, so a first object at a 0x1000 offset
/// from an 8k boundary is taken to follow a 4k header, anything else is rounded down to a
/// page.
fn committed_start(kind: SegmentKind, first_object: u64, pointer_size: usize) -> u64 {
    if kind == SegmentKind::Frozen {
        first_object.saturating_sub(pointer_size as u64)
    } else if first_object & 0x1fff == 0x1000 {
        first_object - 0x1000
    } else {
        first_object & !0xfff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        dac::{GcInfo, GenerationData, HeapDetails},
        test::{segment, MockDac},
    };

    fn generations(starts: &[u64]) -> Vec<GenerationData> {
        starts
            .iter()
            .map(|start| GenerationData {
                start_segment: *start,
                ..Default::default()
            })
            .collect()
    }

    fn sub_heap(details: HeapDetails, has_regions: bool) -> ClrSubHeap {
        let info = GcInfo {
            has_regions,
            max_generation: 2,
            heap_count: 1,
            ..Default::default()
        };
        ClrSubHeap::new(0, &info, details)
    }

    #[test]
    fn segment_mode_with_ephemeral() {
        let mut dac = MockDac::new();
        dac.segments.insert(0x100, segment(0x100, 0x1_1000, 0x1_8000, 0x200));
        dac.segments.insert(0x200, segment(0x200, 0x2_0100, 0x2_9000, 0));
        dac.segments.insert(0x300, segment(0x300, 0x3_1000, 0x3_4000, 0));

        let mut table = generations(&[0x100, 0x100, 0x100, 0x300]);
        table[0].allocation_start = 0x2_6000;
        table[1].allocation_start = 0x2_4000;
        let details = HeapDetails {
            generation_table: table,
            ephemeral_heap_segment: 0x200,
            allocated: 0x2_8000,
            ..Default::default()
        };
        let heap = sub_heap(details, false);

        let segments = enumerate_segments(&dac, 8, &heap, &CancellationToken::new());
        assert_eq!(segments.len(), 3);

        assert_eq!(segments[0].kind, SegmentKind::Large);
        assert_eq!(segments[1].kind, SegmentKind::Generation2);
        assert_eq!(segments[2].kind, SegmentKind::Ephemeral);

        let ephemeral = &segments[2];
        assert_eq!(ephemeral.object_range, MemoryRange::new(0x2_0100, 0x2_8000));
        assert_eq!(ephemeral.generation0, MemoryRange::new(0x2_6000, 0x2_8000));
        assert_eq!(ephemeral.generation1, MemoryRange::new(0x2_4000, 0x2_6000));
        assert_eq!(ephemeral.generation2, MemoryRange::new(0x2_0100, 0x2_4000));
        assert_eq!(ephemeral.generation_of(0x2_7000), Generation::Generation0);
        assert_eq!(ephemeral.generation_of(0x2_1000), Generation::Generation2);
        assert_eq!(ephemeral.committed_memory.start, 0x2_0000);

        assert_eq!(segments[1].generation2, segments[1].object_range);
        assert_eq!(segments[1].committed_memory.start, 0x1_0000);
    }

    #[test]
    fn ranges_nest() {
        let mut dac = MockDac::new();
        dac.segments.insert(0x100, segment(0x100, 0x1_1000, 0x1_8000, 0));
        let details = HeapDetails {
            generation_table: generations(&[0, 0, 0x100, 0]),
            ..Default::default()
        };
        let heap = sub_heap(details, false);

        for segment in enumerate_segments(&dac, 8, &heap, &CancellationToken::new()) {
            assert!(segment.object_range.start <= segment.object_range.end);
            assert!(segment.object_range.end <= segment.committed_memory.end);
            assert!(segment.committed_memory.end <= segment.reserved_memory.end);
        }
    }

    #[test]
    fn region_mode_single_window() {
        let mut dac = MockDac::new();
        dac.segments.insert(0x10, segment(0x10, 0x10_0000, 0x10_4000, 0));
        dac.segments.insert(0x20, segment(0x20, 0x20_0000, 0x20_4000, 0));
        dac.segments.insert(0x30, segment(0x30, 0x30_0000, 0x30_4000, 0));
        dac.segments.insert(0x40, segment(0x40, 0x40_0000, 0x40_4000, 0));
        dac.segments.insert(0x50, segment(0x50, 0x50_0000, 0x50_4000, 0));
        let details = HeapDetails {
            generation_table: generations(&[0x10, 0x20, 0x30, 0x40, 0x50]),
            ..Default::default()
        };
        let heap = sub_heap(details, true);

        let segments = enumerate_segments(&dac, 8, &heap, &CancellationToken::new());
        let kinds: Vec<_> = segments.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SegmentKind::Large,
                SegmentKind::Generation2,
                SegmentKind::Generation1,
                SegmentKind::Generation0,
                SegmentKind::Pinned
            ]
        );

        for segment in &segments {
            let windows = [segment.generation0, segment.generation1, segment.generation2]
                .iter()
                .filter(|window| **window != MemoryRange::default())
                .count();
            assert_eq!(windows, 1, "{:?}", segment.kind);
        }

        assert_eq!(segments[3].generation0, segments[3].object_range);
        assert_eq!(segments[2].generation1, segments[2].object_range);
    }

    #[test]
    fn frozen_and_cycles() {
        let mut dac = MockDac::new();
        let mut frozen = segment(0x100, 0x5_0010, 0x5_1000, 0x200);
        frozen.flags = SegmentFlags::READ_ONLY.bits();
        dac.segments.insert(0x100, frozen);
        // 0x200 points back at 0x100
        dac.segments.insert(0x200, segment(0x200, 0x6_0000, 0x6_1000, 0x100));
        let details = HeapDetails {
            generation_table: generations(&[0x100, 0x100, 0x100, 0x200]),
            ..Default::default()
        };
        let heap = sub_heap(details, false);

        let segments = enumerate_segments(&dac, 8, &heap, &CancellationToken::new());
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].address, 0x200);
        assert_eq!(segments[1].kind, SegmentKind::Frozen);
        assert_eq!(segments[1].committed_memory.start, 0x5_0008);
        assert_eq!(segments[1].max_object_size(), i32::MAX as u64);
        assert_eq!(segments[0].max_object_size(), i32::MAX as u64);
    }

    #[test]
    fn unreadable_segment_ends_list() {
        let mut dac = MockDac::new();
        dac.segments.insert(0x100, segment(0x100, 0x1_0000, 0x1_1000, 0xdead));
        let details = HeapDetails {
            generation_table: generations(&[0, 0, 0x100, 0]),
            ..Default::default()
        };
        let heap = sub_heap(details, false);

        let segments = enumerate_segments(&dac, 8, &heap, &CancellationToken::new());
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].max_object_size(), LARGE_OBJECT_THRESHOLD);
    }

    #[test]
    fn cancelled_walk_is_empty() {
        let mut dac = MockDac::new();
        dac.segments.insert(0x100, segment(0x100, 0x1_0000, 0x1_1000, 0));
        let details = HeapDetails {
            generation_table: generations(&[0, 0, 0x100, 0]),
            ..Default::default()
        };
        let heap = sub_heap(details, false);
        let token = CancellationToken::new();
        token.cancel();

        assert!(enumerate_segments(&dac, 8, &heap, &token).is_empty());
    }
}
