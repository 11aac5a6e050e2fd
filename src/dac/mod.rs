//! The structured query gateway.
//!
//! The runtime's data access layer answers typed requests about its internal structures:
//! method tables, modules, threads, handles, heap segments, sync blocks and loader heaps. This
//! module defines that surface as the [`SosDac`] trait. Transport, marshaling and loading of
//! the actual data access library are out of scope; implementors adapt whatever transport
//! they have to this trait.
//!
//! # Conventions
//!
//! - A request that fails returns `None` (or an empty `Vec`, or `false` for traversals). The
//!   callers in this crate treat that as "no data", never as an error.
//! - Optional capabilities that only newer runtimes provide have default implementations
//!   reporting them as unavailable.
//! - Implementations may reenter themselves. Callers in this crate never hold a cache lock
//!   while calling into the gateway.

mod data;

pub use data::*;

/// The only data access protocol version this crate can talk to
pub const SUPPORTED_DAC_VERSION: u32 = 9;

/// Callback receiving `(chunk address, chunk size, is current chunk)` during loader heap traversal
pub type LoaderHeapCallback<'a> = dyn FnMut(u64, i64, bool) + 'a;

/// Typed request/response access to the runtime's data access layer.
pub trait SosDac: Send + Sync {
    /// Protocol version of the data access layer
    fn dac_version(&self) -> Option<u32>;

    /// Drops the gateway's own caches
    fn flush(&self);

    /// Thread store of the runtime
    fn thread_store_data(&self) -> Option<ThreadStoreData>;

    /// Data of the thread at `thread`
    fn thread_data(&self, thread: u64) -> Option<ThreadData>;

    /// Thread owning the thin lock id, `0` if unknown
    fn thread_from_thinlock_id(&self, id: u32) -> u64;

    /// Special method tables
    fn common_method_tables(&self) -> Option<CommonMethodTables>;

    /// Method table metadata
    fn method_table_data(&self, method_table: u64) -> Option<MethodTableData>;

    /// Raw, still mangled name of a method table
    fn method_table_name(&self, method_table: u64) -> Option<String>;

    /// Per-instance data of an object
    fn object_data(&self, object: u64) -> Option<ObjectData>;

    /// Data of a module
    fn module_data(&self, module: u64) -> Option<ModuleData>;

    /// Token row → method table pairs of one of a module's maps
    fn module_map(&self, module: u64, kind: ModuleMapKind) -> Vec<(u32, u64)>;

    /// Global GC configuration
    fn gc_heap_data(&self) -> Option<GcInfo>;

    /// Addresses of the server GC heaps
    fn heap_list(&self, count: usize) -> Vec<u64>;

    /// Details of one server GC heap
    fn server_heap_details(&self, heap: u64) -> Option<HeapDetails>;

    /// Details of the single workstation GC heap
    fn workstation_heap_details(&self) -> Option<HeapDetails>;

    /// Data of one segment or region
    fn segment_data(&self, segment: u64) -> Option<SegmentData>;

    /// Sync block entry at a one-based index
    fn sync_block_data(&self, index: u32) -> Option<SyncBlockData>;

    /// All GC handles, `None` if the handle table could not be enumerated
    fn handles(&self) -> Option<Vec<HandleData>>;

    /// COM callable wrapper attached to an object
    fn ccw_data(&self, object: u64) -> Option<CcwData>;

    /// Runtime callable wrapper attached to an object
    fn rcw_data(&self, object: u64) -> Option<RcwData>;

    /// JIT code managers
    fn jit_managers(&self) -> Vec<JitManagerInfo>;

    /// Code heaps of one JIT manager
    fn code_heap_list(&self, jit_manager: u64) -> Vec<JitCodeHeapInfo>;

    /// The app domain store
    fn app_domain_store_data(&self) -> Option<AppDomainStoreData>;

    /// Addresses of the app domains
    fn app_domain_list(&self, count: usize) -> Vec<u64>;

    /// Data of one app domain
    fn app_domain_data(&self, domain: u64) -> Option<AppDomainData>;

    /// Friendly name of an app domain
    fn app_domain_name(&self, domain: u64) -> Option<String>;

    /// Assemblies loaded into a domain
    fn assembly_list(&self, domain: u64) -> Vec<u64>;

    /// Modules of an assembly
    fn module_list(&self, assembly: u64) -> Vec<u64>;

    /// Walks the chunks of a loader heap
    ///
    /// `kind` is only passed on runtimes which understand loader heap kinds, see
    /// [`SosDac::supports_loader_heap_kinds`]. Returns `false` if the traversal failed.
    fn traverse_loader_heap(
        &self,
        heap: u64,
        kind: Option<LoaderHeapKind>,
        callback: &mut LoaderHeapCallback<'_>,
    ) -> bool;

    /// Walks the chunks of one of a domain's virtual call stub heaps
    fn traverse_stub_heap(
        &self,
        domain: u64,
        kind: StubHeapKind,
        callback: &mut LoaderHeapCallback<'_>,
    ) -> bool;

    /// Whether loader heap traversal accepts a [`LoaderHeapKind`]
    fn supports_loader_heap_kinds(&self) -> bool {
        false
    }

    /// Names of the heaps a loader allocator owns, in the order of
    /// [`SosDac::loader_allocator_heaps`]
    fn loader_allocator_heap_names(&self) -> Option<Vec<String>> {
        None
    }

    /// Heaps owned by a loader allocator together with their kind
    fn loader_allocator_heaps(&self, _loader_allocator: u64) -> Option<Vec<(u64, LoaderHeapKind)>> {
        None
    }

    /// Loader allocator of a domain, `0` if unavailable
    fn domain_loader_allocator(&self, _domain: u64) -> u64 {
        0
    }

    /// Allocation context shared by all threads, if the runtime has one
    fn global_allocation_context(&self) -> Option<(u64, u64)> {
        None
    }

    /// Regions the GC freed but has not yet returned to the OS
    fn gc_free_regions(&self) -> Option<Vec<MemoryRegion>> {
        None
    }

    /// Memory holding the handle table
    fn handle_table_regions(&self) -> Option<Vec<MemoryRegion>> {
        None
    }

    /// Memory the GC uses for its own bookkeeping (card tables, mark arrays)
    fn gc_bookkeeping_regions(&self) -> Option<Vec<MemoryRegion>> {
        None
    }
}
