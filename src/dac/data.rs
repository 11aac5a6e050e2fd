//! Records returned by the structured query gateway.
//!
//! These are plain data: the gateway fills them in, nothing in this crate mutates them.
//! Field names follow what the runtime's data access layer reports, in Rust casing.

/// Metadata for one method table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodTableData {
    /// Module the type is defined in
    pub module: u64,
    /// Method table of the base type, `0` for `System.Object` and interfaces
    pub parent_method_table: u64,
    /// Size of an instance without its components
    pub base_size: u32,
    /// Size of one array element or string character, `0` for non-array types
    pub component_size: u32,
    /// TypeDef metadata token
    pub token: u32,
    /// Number of methods in the vtable
    pub num_methods: u32,
    /// Whether instances hold GC references
    pub contains_pointers: bool,
    /// Whether the method table is shared across domains
    pub shared: bool,
    /// Whether this is the free-object method table
    pub is_free: bool,
}

/// Method tables the runtime treats specially
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommonMethodTables {
    /// `System.Object`
    pub object: u64,
    /// `System.String`
    pub string: u64,
    /// The free-object filler type
    pub free: u64,
    /// `System.Exception`
    pub exception: u64,
    /// `System.Array`
    pub array: u64,
}

/// Per-instance data, used to recover an array's element type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectData {
    /// Method table of the object
    pub method_table: u64,
    /// Element type code of the array's elements
    pub element_type: u32,
    /// Method table of the array's element type, `0` for primitives
    pub element_type_handle: u64,
    /// Array rank
    pub rank: u32,
    /// Number of elements
    pub num_components: u64,
    /// Size of the object in bytes
    pub size: u64,
    /// Address of the first element
    pub array_data_pointer: u64,
}

/// Data of one loaded module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleData {
    /// Address of the module
    pub address: u64,
    /// Owning assembly
    pub assembly: u64,
    /// Loader allocator, non-zero only for collectible assemblies
    pub loader_allocator: u64,
    /// Thunk heap of the module, `0` if none
    pub thunk_heap: u64,
    /// Simple name of the module, as the runtime reports it
    pub name: Option<String>,
}

/// Which token map of a module to traverse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleMapKind {
    /// TypeDef row → method table
    TypeDefToMethodTable,
    /// TypeRef row → method table
    TypeRefToMethodTable,
}

/// Global GC configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcInfo {
    /// Server GC, one subheap per core
    pub server_mode: bool,
    /// Number of subheaps
    pub heap_count: u32,
    /// Highest generation number, usually 2
    pub max_generation: u32,
    /// Whether the GC uses regions instead of segments
    pub has_regions: bool,
    /// Whether background GC is enabled
    pub has_background_gc: bool,
}

/// One entry of a subheap's generation table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationData {
    /// First segment of the generation's segment list
    pub start_segment: u64,
    /// Address at which the generation starts within the ephemeral segment
    pub allocation_start: u64,
    /// Allocation context pointer of the generation
    pub allocation_context_pointer: u64,
    /// Allocation context limit of the generation
    pub allocation_context_limit: u64,
}

/// Details of one GC heap instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapDetails {
    /// Address of the heap, `0` for workstation GC
    pub heap_address: u64,
    /// Allocation pointer of the ephemeral segment
    pub allocated: u64,
    /// Background GC mark array
    pub mark_array: u64,
    /// Current GC state, see [`crate::heap::GcState`]
    pub current_gc_state: u32,
    /// Position of the background sweep
    pub next_sweep_obj: u64,
    /// Ephemeral segment saved at the start of the background sweep
    pub saved_sweep_ephemeral_segment: u64,
    /// Start of the saved ephemeral range
    pub saved_sweep_ephemeral_start: u64,
    /// Lowest address covered by the background mark array
    pub background_saved_lowest_address: u64,
    /// Highest address covered by the background mark array
    pub background_saved_highest_address: u64,
    /// Generation table, at least gen0 through gen3 (LOH), gen4 (POH) when present
    pub generation_table: Vec<GenerationData>,
    /// The ephemeral segment in segment mode
    pub ephemeral_heap_segment: u64,
    /// Finalization queue fill pointers
    pub finalization_fill_pointers: Vec<u64>,
    /// Lowest heap address
    pub lowest_address: u64,
    /// Highest heap address
    pub highest_address: u64,
    /// Card table
    pub card_table: u64,
}

/// Data of one heap segment or region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentData {
    /// Address of the segment descriptor
    pub address: u64,
    /// First object address
    pub start: u64,
    /// Allocation pointer
    pub allocated: u64,
    /// End of committed memory
    pub committed: u64,
    /// End of reserved memory
    pub reserved: u64,
    /// End of used memory
    pub used: u64,
    /// Next segment in the generation's list
    pub next: u64,
    /// Background allocation pointer
    pub background_allocated: u64,
    /// Raw segment flags
    pub flags: u64,
    /// Owning heap
    pub heap: u64,
}

/// One entry of the sync block table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncBlockData {
    /// Object the sync block belongs to
    pub object: u64,
    /// Whether the entry is unused
    pub free: bool,
    /// Address of the sync block itself
    pub address: u64,
    /// COM interop flags
    pub com_flags: u32,
    /// Non-zero if the monitor is held
    pub monitor_held: u32,
    /// Monitor recursion count
    pub recursion: u32,
    /// Thread holding the monitor
    pub holding_thread: u64,
    /// Threads waiting on the monitor
    pub additional_thread_count: u32,
    /// Owning app domain
    pub app_domain: u64,
    /// Total number of entries in the table
    pub total_count: u32,
}

/// Thread store of the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStoreData {
    /// Number of managed threads
    pub thread_count: i32,
    /// First thread of the thread list
    pub first_thread: u64,
    /// The finalizer thread
    pub finalizer_thread: u64,
    /// The GC thread, `0` if none
    pub gc_thread: u64,
}

/// Data of one managed thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadData {
    /// Managed thread id
    pub managed_thread_id: u32,
    /// OS thread id, `0` for threads that have not started
    pub os_thread_id: u32,
    /// Runtime thread state bits
    pub state: u32,
    /// Number of locks held
    pub lock_count: u32,
    /// Thread environment block
    pub teb: u64,
    /// App domain the thread currently runs in
    pub domain: u64,
    /// Next thread in the thread list
    pub next_thread: u64,
    /// Start of the thread's allocation context
    pub allocation_context_pointer: u64,
    /// End of the thread's allocation context
    pub allocation_context_limit: u64,
    /// Handle of the last thrown exception
    pub last_thrown_object_handle: u64,
}

/// One GC handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleData {
    /// Owning app domain
    pub app_domain: u64,
    /// Address of the handle
    pub handle: u64,
    /// Secondary object, the dependent target of a dependent handle
    pub secondary: u64,
    /// Raw handle kind
    pub handle_type: u32,
    /// Whether the handle keeps its target alive
    pub strong_reference: bool,
    /// Reference count of a ref-counted handle
    pub ref_count: u32,
    /// Jupiter reference count
    pub jupiter_ref_count: u32,
    /// Whether the Jupiter count is pegged
    pub is_pegged: bool,
}

/// COM callable wrapper data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CcwData {
    /// Address of the wrapper
    pub address: u64,
    /// Reference count
    pub ref_count: u32,
}

/// Runtime callable wrapper data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RcwData {
    /// Address of the wrapper
    pub address: u64,
    /// Reference count
    pub ref_count: u32,
}

/// One JIT code manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitManagerInfo {
    /// Address of the manager
    pub address: u64,
    /// Raw code type
    pub code_type: u32,
    /// Head of the code heap list
    pub heap_list: u64,
}

/// Kind of a JIT code heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeHeapKind {
    /// Backed by a loader heap
    Loader,
    /// Host-provided code heap
    Host,
    /// Unknown kind
    Unknown,
}

/// One JIT code heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitCodeHeapInfo {
    /// Kind of the heap
    pub kind: CodeHeapKind,
    /// Loader heap address, or base address of a host heap
    pub address: u64,
    /// Current allocation address of a host heap
    pub current_address: u64,
}

/// The app domain store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppDomainStoreData {
    /// The shared domain, `0` on .NET Core
    pub shared_domain: u64,
    /// The system domain
    pub system_domain: u64,
    /// Number of app domains
    pub app_domain_count: u32,
}

/// Data of one app domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppDomainData {
    /// Address of the domain
    pub address: u64,
    /// Domain id
    pub id: i32,
    /// Stub heap
    pub stub_heap: u64,
    /// High frequency loader heap
    pub high_frequency_heap: u64,
    /// Low frequency loader heap
    pub low_frequency_heap: u64,
}

/// Flavor of loader heap, determines the vtable layout of the heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderHeapKind {
    /// Regular loader heap
    Normal,
    /// Explicitly controlled loader heap (code heaps)
    ExplicitControl,
}

/// Virtual call stub heaps of an app domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum StubHeapKind {
    /// Indirection cells
    IndirectionCell,
    /// Lookup stubs
    Lookup,
    /// Resolve stubs
    Resolve,
    /// Dispatch stubs
    Dispatch,
    /// Resolve cache entries
    CacheEntry,
    /// Vtable call stubs
    Vtable,
}

/// A raw memory region reported by the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Start address
    pub start: u64,
    /// Length in bytes
    pub length: u64,
    /// Region specific discriminant
    pub extra_data: u64,
    /// Owning subheap index, `-1` if none
    pub heap: i32,
}
