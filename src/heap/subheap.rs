//! GC heap instances.

use tracing::debug;

use crate::{
    dac::{GcInfo, GenerationData, HeapDetails, SosDac},
    target::MemoryRange,
};

/// Phase of a background collection, as reported by the subheap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum GcState {
    /// Background marking is in progress
    Marking,
    /// Background GC is planning, the mark array is authoritative for unswept objects
    Planning,
    /// No background collection is running
    Free,
    /// The reported state is not one the crate knows
    Unknown(u32),
}

impl From<u32> for GcState {
    fn from(value: u32) -> Self {
        match value {
            0 => GcState::Marking,
            1 => GcState::Planning,
            2 => GcState::Free,
            other => GcState::Unknown(other),
        }
    }
}

/// One GC heap instance.
///
/// Workstation GC has a single subheap, server GC one per core. Each owns its generation
/// table, from which its segments are discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClrSubHeap {
    /// Position of the subheap in the heap list
    pub index: usize,
    /// Address of the heap, `0` under workstation GC
    pub address: u64,
    /// Allocation pointer of the ephemeral segment
    pub allocated: u64,
    /// Background GC mark array
    pub mark_array: u64,
    /// Background GC phase
    pub state: GcState,
    /// Position of the background sweep
    pub current_sweep_position: u64,
    /// Ephemeral segment at the start of the background sweep
    pub saved_sweep_ephemeral_segment: u64,
    /// Start of the ephemeral range at the start of the background sweep
    pub saved_sweep_ephemeral_start: u64,
    /// Lowest address the mark array covers
    pub background_saved_lowest_address: u64,
    /// Highest address the mark array covers
    pub background_saved_highest_address: u64,
    /// Generation table, gen0 through gen3 and gen4 when the runtime has a pinned heap
    pub generation_table: Vec<GenerationData>,
    /// The ephemeral segment in segment mode
    pub ephemeral_heap_segment: u64,
    /// Fill pointers of the finalization queue
    pub finalization_fill_pointers: Vec<u64>,
    /// Whether the GC uses regions
    pub has_regions: bool,
    /// Whether background GC is enabled
    pub has_background_gc: bool,
}

impl ClrSubHeap {
    pub(crate) fn new(index: usize, info: &GcInfo, details: HeapDetails) -> Self {
        ClrSubHeap {
            index,
            address: details.heap_address,
            allocated: details.allocated,
            mark_array: details.mark_array,
            state: GcState::from(details.current_gc_state),
            current_sweep_position: details.next_sweep_obj,
            saved_sweep_ephemeral_segment: details.saved_sweep_ephemeral_segment,
            saved_sweep_ephemeral_start: details.saved_sweep_ephemeral_start,
            background_saved_lowest_address: details.background_saved_lowest_address,
            background_saved_highest_address: details.background_saved_highest_address,
            generation_table: details.generation_table,
            ephemeral_heap_segment: details.ephemeral_heap_segment,
            finalization_fill_pointers: details.finalization_fill_pointers,
            has_regions: info.has_regions,
            has_background_gc: info.has_background_gc,
        }
    }

    /// Allocation context of generation 0, empty if none
    #[must_use]
    pub fn allocation_context(&self) -> MemoryRange {
        self.generation_table
            .first()
            .map(|gen0| {
                MemoryRange::new(gen0.allocation_context_pointer, gen0.allocation_context_limit)
            })
            .unwrap_or_default()
    }

    pub(crate) fn generation_allocation_start(&self, generation: usize) -> u64 {
        self.generation_table
            .get(generation)
            .map_or(0, |entry| entry.allocation_start)
    }
}

/// Discovers the subheaps of the GC.
///
/// Server GC asks for the heap list and the details of every heap in it, details that
/// cannot be read are skipped. Workstation GC has one subheap at index 0.
pub(crate) fn enumerate_sub_heaps(dac: &dyn SosDac, info: &GcInfo) -> Vec<ClrSubHeap> {
    if info.server_mode {
        let addresses = dac.heap_list(info.heap_count as usize);
        let heaps: Vec<_> = addresses
            .iter()
            .enumerate()
            .filter_map(|(index, address)| {
                dac.server_heap_details(*address).map(|mut details| {
                    details.heap_address = *address;
                    ClrSubHeap::new(index, info, details)
                })
            })
            .collect();

        debug!(
            reported = info.heap_count,
            found = heaps.len(),
            "server GC subheaps"
        );
        heaps
    } else {
        dac.workstation_heap_details()
            .map(|mut details| {
                details.heap_address = 0;
                vec![ClrSubHeap::new(0, info, details)]
            })
            .unwrap_or_default()
    }
}
