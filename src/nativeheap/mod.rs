//! Native memory owned by the runtime.
//!
//! Apart from the GC heap, the runtime allocates from simple bump allocators: loader heaps
//! for type data, stub heaps for virtual call stubs, and code heaps for jitted code. The
//! gateway traverses each of them and reports chunks as `(address, size, is current)`. This
//! module turns those chunks into [`ClrNativeHeapInfo`] records.
//!
//! # Address fixup
//!
//! The legacy traversal treats every heap as a plain loader heap. Explicitly controlled heaps
//! have no vtable, and some runtime builds also laid plain heaps out differently, so the heap
//! address must be shifted by one pointer before traversal. Which direction depends on the
//! runtime version and cannot always be known, so a guess whose chunks turn out unreadable is
//! retried once the other way.

use std::sync::{Arc, OnceLock};

use strum::IntoEnumIterator;
use tracing::{debug, trace, warn};

use crate::{
    config::{ClrFlavor, RuntimeInfo},
    dac::{CodeHeapKind, LoaderHeapKind, MemoryRegion, SosDac, StubHeapKind},
    target::{DataReader, MemoryRange},
    utils::CancellationToken,
};

/// What a native heap is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum NativeHeapKind {
    /// Not identified
    Unknown,
    /// Virtual call stub indirection cells
    IndirectionCellHeap,
    /// Virtual call stub lookup stubs
    LookupHeap,
    /// Virtual call stub resolve stubs
    ResolveHeap,
    /// Virtual call stub dispatch stubs
    DispatchHeap,
    /// Virtual call stub resolve cache entries
    CacheEntryHeap,
    /// Vtable call stubs
    VtableHeap,
    /// Jitted code in a loader code heap
    LoaderCodeHeap,
    /// Jitted code in a host provided heap
    HostCodeHeap,
    /// Stubs of a loader allocator
    StubHeap,
    /// Frequently used loader data
    HighFrequencyHeap,
    /// Rarely used loader data
    LowFrequencyHeap,
    /// Executable loader memory
    ExecutableHeap,
    /// Fixup precodes
    FixupPrecodeHeap,
    /// Stub precodes
    NewStubPrecodeHeap,
    /// Thunks of a module
    ThunkHeap,
    /// GC handle table memory
    HandleTable,
    /// Memory the GC uses for its own bookkeeping
    GCBookkeeping,
    /// A free region on a subheap's free list
    GCFreeRegion,
    /// A huge free region on the global free list
    GCFreeGlobalHugeRegion,
    /// A free region on the global free list
    GCFreeGlobalRegion,
    /// A free small object heap segment
    GCFreeSohSegment,
    /// A free large or pinned object heap segment
    GCFreeUohSegment,
}

impl NativeHeapKind {
    /// Kind of a loader allocator heap by the name the runtime reports for it
    #[must_use]
    pub fn from_heap_name(name: &str) -> Self {
        match name {
            "LowFrequencyHeap" => NativeHeapKind::LowFrequencyHeap,
            "HighFrequencyHeap" => NativeHeapKind::HighFrequencyHeap,
            "StubHeap" => NativeHeapKind::StubHeap,
            "ExecutableHeap" => NativeHeapKind::ExecutableHeap,
            "FixupPrecodeHeap" => NativeHeapKind::FixupPrecodeHeap,
            "NewStubPrecodeHeap" => NativeHeapKind::NewStubPrecodeHeap,
            "IndcellHeap" => NativeHeapKind::IndirectionCellHeap,
            "LookupHeap" => NativeHeapKind::LookupHeap,
            "ResolveHeap" => NativeHeapKind::ResolveHeap,
            "DispatchHeap" => NativeHeapKind::DispatchHeap,
            "CacheEntryHeap" => NativeHeapKind::CacheEntryHeap,
            "VtableHeap" => NativeHeapKind::VtableHeap,
            _ => NativeHeapKind::Unknown,
        }
    }

    /// Kind of a GC free region by its region discriminant
    #[must_use]
    pub fn from_free_region(extra_data: u64) -> Self {
        match extra_data {
            1 => NativeHeapKind::GCFreeGlobalHugeRegion,
            2 => NativeHeapKind::GCFreeGlobalRegion,
            4 => NativeHeapKind::GCFreeSohSegment,
            5 => NativeHeapKind::GCFreeUohSegment,
            _ => NativeHeapKind::GCFreeRegion,
        }
    }
}

impl From<StubHeapKind> for NativeHeapKind {
    fn from(kind: StubHeapKind) -> Self {
        match kind {
            StubHeapKind::IndirectionCell => NativeHeapKind::IndirectionCellHeap,
            StubHeapKind::Lookup => NativeHeapKind::LookupHeap,
            StubHeapKind::Resolve => NativeHeapKind::ResolveHeap,
            StubHeapKind::Dispatch => NativeHeapKind::DispatchHeap,
            StubHeapKind::CacheEntry => NativeHeapKind::CacheEntryHeap,
            StubHeapKind::Vtable => NativeHeapKind::VtableHeap,
        }
    }
}

/// Whether a chunk is the one currently allocated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ClrNativeHeapState {
    /// The heap's current chunk
    Active,
    /// An exhausted chunk, or memory that is not allocated from
    Inactive,
    /// Memory holding the GC's region table
    RegionOfRegions,
    /// State is not known
    None,
}

impl ClrNativeHeapState {
    fn from_current(current: bool) -> Self {
        if current {
            ClrNativeHeapState::Active
        } else {
            ClrNativeHeapState::Inactive
        }
    }
}

/// One chunk of native runtime memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClrNativeHeapInfo {
    /// Memory of the chunk
    pub range: MemoryRange,
    /// What the memory is used for
    pub kind: NativeHeapKind,
    /// Allocation state of the chunk
    pub state: ClrNativeHeapState,
    /// Owning GC subheap, for GC owned memory
    pub heap: Option<i32>,
}

impl ClrNativeHeapInfo {
    fn new(range: MemoryRange, kind: NativeHeapKind, state: ClrNativeHeapState) -> Self {
        ClrNativeHeapInfo {
            range,
            kind,
            state,
            heap: None,
        }
    }

    /// A chunk from a traversal callback
    fn chunk(address: u64, size: i64, kind: NativeHeapKind, current: bool) -> Self {
        Self::new(
            MemoryRange::from_length(address, sanitize_size(size)),
            kind,
            ClrNativeHeapState::from_current(current),
        )
    }

    /// A region reported by the GC
    pub(crate) fn from_region(region: &MemoryRegion, kind: NativeHeapKind, state: ClrNativeHeapState) -> Self {
        ClrNativeHeapInfo {
            range: MemoryRange::from_length(region.start, region.length),
            kind,
            state,
            heap: (region.heap >= 0).then_some(region.heap),
        }
    }
}

/// Chunk sizes the traversal cannot vouch for are reported as `0`
#[must_use]
pub fn sanitize_size(size: i64) -> u64 {
    if size < 0 || size > i64::from(i32::MAX) {
        0
    } else {
        size as u64
    }
}

/// Traverses the native heaps of domains, JIT managers and modules.
pub struct NativeHeapHelper {
    dac: Arc<dyn SosDac>,
    reader: Arc<dyn DataReader>,
    info: RuntimeInfo,
    cancel: CancellationToken,
    heap_kinds: OnceLock<Vec<NativeHeapKind>>,
}

impl NativeHeapHelper {
    /// Creates a new helper
    pub fn new(
        dac: Arc<dyn SosDac>,
        reader: Arc<dyn DataReader>,
        info: RuntimeInfo,
        cancel: CancellationToken,
    ) -> Self {
        NativeHeapHelper {
            dac,
            reader,
            info,
            cancel,
            heap_kinds: OnceLock::new(),
        }
    }

    /// Kinds of the heaps a loader allocator reports, by position
    fn heap_kinds(&self) -> &[NativeHeapKind] {
        self.heap_kinds.get_or_init(|| {
            self.dac
                .loader_allocator_heap_names()
                .unwrap_or_default()
                .iter()
                .map(|name| NativeHeapKind::from_heap_name(name))
                .collect()
        })
    }

    /// Whether plain loader heaps need their address moved for the legacy traversal
    fn normal_needs_adjustment(&self) -> bool {
        self.info.flavor == ClrFlavor::Core
            && (self.info.major == 7
                || (self.info.major == 8 && !self.dac.supports_loader_heap_kinds())
                || self.info.major == 0)
    }

    fn fixup_heap_address(&self, heap: u64, kind: LoaderHeapKind, normal_needs_adjustment: bool) -> u64 {
        let pointer_size = self.reader.pointer_size() as u64;
        match (normal_needs_adjustment, kind) {
            (true, LoaderHeapKind::Normal) => heap.wrapping_add(pointer_size),
            (false, LoaderHeapKind::ExplicitControl) => heap.wrapping_sub(pointer_size),
            _ => heap,
        }
    }

    /// Runs one traversal, `None` if the gateway rejected it
    fn traverse(
        &self,
        heap: u64,
        kind: Option<LoaderHeapKind>,
        native_kind: NativeHeapKind,
    ) -> Option<Vec<ClrNativeHeapInfo>> {
        let mut chunks = Vec::new();
        let cancel = &self.cancel;
        let ok = self.dac.traverse_loader_heap(heap, kind, &mut |address, size, current| {
            if !cancel.is_cancelled() {
                chunks.push(ClrNativeHeapInfo::chunk(address, size, native_kind, current));
            }
        });

        if cancel.is_cancelled() {
            debug!(walk = "loader heap", heap, "walk cancelled");
        }
        ok.then_some(chunks)
    }

    /// The legacy traversal of one loader heap, with the address fixup and its retry
    fn legacy_loader_heap(
        &self,
        heap: u64,
        kind: LoaderHeapKind,
        native_kind: NativeHeapKind,
    ) -> Vec<ClrNativeHeapInfo> {
        if heap == 0 {
            return Vec::new();
        }

        let adjust = self.normal_needs_adjustment();
        let mut result = self.traverse(self.fixup_heap_address(heap, kind, adjust), None, native_kind);

        if adjust {
            let unreadable = result.as_ref().is_some_and(|chunks| {
                chunks.iter().any(|chunk| {
                    let mut first_byte = [0_u8; 1];
                    self.reader.read(chunk.range.start, &mut first_byte) == 0
                })
            });

            if unreadable {
                warn!(heap, kind = ?native_kind, "loader heap chunks unreadable, retrying with the opposite fixup");
                result = self.traverse(self.fixup_heap_address(heap, kind, !adjust), None, native_kind);
            }
        }

        result.unwrap_or_default()
    }

    /// Traversal that knows the heap kind, falling back to the manual fixup when the gateway
    /// cannot tell heap kinds apart
    fn kind_aware_loader_heap(
        &self,
        heap: u64,
        kind: LoaderHeapKind,
        native_kind: NativeHeapKind,
    ) -> Option<Vec<ClrNativeHeapInfo>> {
        if heap == 0 {
            return None;
        }

        if self.dac.supports_loader_heap_kinds() {
            return self.traverse(heap, Some(kind), native_kind);
        }

        let pointer_size = self.reader.pointer_size() as u64;
        let address = if self.info.flavor == ClrFlavor::Core && self.info.major == 7 {
            match kind {
                LoaderHeapKind::Normal => heap.wrapping_add(pointer_size),
                LoaderHeapKind::ExplicitControl => heap,
            }
        } else {
            match kind {
                LoaderHeapKind::Normal => heap,
                LoaderHeapKind::ExplicitControl => heap.wrapping_sub(pointer_size),
            }
        };
        self.traverse(address, None, native_kind)
    }

    /// Code heaps of one JIT manager
    #[must_use]
    pub fn enumerate_jit_manager_heaps(&self, jit_manager: u64) -> Vec<ClrNativeHeapInfo> {
        let mut heaps = Vec::new();
        for code_heap in self.dac.code_heap_list(jit_manager) {
            if self.cancel.is_cancelled() {
                debug!(walk = "code heaps", "walk cancelled");
                break;
            }

            match code_heap.kind {
                CodeHeapKind::Loader => heaps.extend(self.legacy_loader_heap(
                    code_heap.address,
                    LoaderHeapKind::ExplicitControl,
                    NativeHeapKind::LoaderCodeHeap,
                )),
                CodeHeapKind::Host => heaps.push(ClrNativeHeapInfo::new(
                    MemoryRange::new(code_heap.address, code_heap.current_address),
                    NativeHeapKind::HostCodeHeap,
                    ClrNativeHeapState::Active,
                )),
                CodeHeapKind::Unknown => heaps.push(ClrNativeHeapInfo::new(
                    MemoryRange::new(code_heap.address, code_heap.address),
                    NativeHeapKind::Unknown,
                    ClrNativeHeapState::None,
                )),
            }
        }

        trace!(jit_manager, count = heaps.len(), "code heaps");
        heaps
    }

    /// Loader and stub heaps of one app domain
    ///
    /// Runtimes that report loader allocator heaps are walked through the domain's loader
    /// allocator. Older ones expose the stub, high and low frequency heaps and the virtual
    /// call stub heaps directly.
    #[must_use]
    pub fn enumerate_domain_heaps(&self, domain: u64) -> Vec<ClrNativeHeapInfo> {
        if domain == 0 {
            return Vec::new();
        }

        let loader_allocator = self.dac.domain_loader_allocator(domain);
        if loader_allocator != 0 && !self.heap_kinds().is_empty() {
            return self.enumerate_loader_allocator_heaps(loader_allocator);
        }

        let Some(data) = self.dac.app_domain_data(domain) else {
            return Vec::new();
        };

        let mut heaps = Vec::new();
        for (heap, kind) in [
            (data.stub_heap, NativeHeapKind::StubHeap),
            (data.high_frequency_heap, NativeHeapKind::HighFrequencyHeap),
            (data.low_frequency_heap, NativeHeapKind::LowFrequencyHeap),
        ] {
            heaps.extend(self.legacy_loader_heap(heap, LoaderHeapKind::Normal, kind));
        }

        for stub_kind in StubHeapKind::iter() {
            break_if_cancelled!(self.cancel, "stub heaps");
            let native_kind = NativeHeapKind::from(stub_kind);
            let mut chunks = Vec::new();
            let ok = self.dac.traverse_stub_heap(domain, stub_kind, &mut |address, size, current| {
                chunks.push(ClrNativeHeapInfo::chunk(address, size, native_kind, current));
            });
            if ok {
                heaps.extend(chunks);
            }
        }

        heaps
    }

    /// Heaps of a loader allocator, named by the runtime's heap name list
    #[must_use]
    pub fn enumerate_loader_allocator_heaps(&self, loader_allocator: u64) -> Vec<ClrNativeHeapInfo> {
        let kinds = self.heap_kinds();
        if loader_allocator == 0 || kinds.is_empty() {
            return Vec::new();
        }

        let mut heaps = Vec::new();
        let listed = self
            .dac
            .loader_allocator_heaps(loader_allocator)
            .unwrap_or_default();
        for (position, (heap, kind)) in listed.into_iter().enumerate() {
            break_if_cancelled!(self.cancel, "loader allocator heaps");
            let native_kind = kinds.get(position).copied().unwrap_or(NativeHeapKind::Unknown);
            if let Some(chunks) = self.traverse(heap, Some(kind), native_kind) {
                heaps.extend(chunks);
            }
        }

        heaps
    }

    /// Thunk heap of a module
    #[must_use]
    pub fn enumerate_thunk_heaps(&self, thunk_heap: u64) -> Vec<ClrNativeHeapInfo> {
        self.kind_aware_loader_heap(thunk_heap, LoaderHeapKind::Normal, NativeHeapKind::ThunkHeap)
            .unwrap_or_default()
    }
}
