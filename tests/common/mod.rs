//! A small in-memory target shared by the integration tests.
//!
//! The fixture is a 64-bit workstation runtime with a single gen2 segment:
//!
//! | Address     | Object                                    |
//! |-------------|-------------------------------------------|
//! | `0x10_0000` | `System.Object`                           |
//! | `0x10_0018` | `Node` referencing the object above       |
//! | `0x10_0038` | `System.String` of three characters       |
//! | `0x10_0058` | free space                                |
//! | `0x10_0078` | `Node` referencing the free space         |

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use clrscope::{
    dac::{
        AppDomainData, AppDomainStoreData, CcwData, CommonMethodTables, GcInfo, GenerationData,
        HandleData, HeapDetails, JitCodeHeapInfo, JitManagerInfo, LoaderHeapCallback,
        LoaderHeapKind, MethodTableData, ModuleData, ModuleMapKind, ObjectData, RcwData,
        SegmentData, SosDac, StubHeapKind, SyncBlockData, ThreadData, ThreadStoreData,
        SUPPORTED_DAC_VERSION,
    },
    Architecture, CacheOptions, ClrFlavor, ClrRuntime, DataReader, RuntimeInfo,
};

pub const OBJECT: u64 = 0x7_1000;
pub const STRING: u64 = 0x7_2000;
pub const FREE: u64 = 0x7_3000;
pub const NODE: u64 = 0x7_4000;

pub const SEGMENT: u64 = 0x500;
pub const SEGMENT_START: u64 = 0x10_0000;

pub const PLAIN_OBJECT: u64 = 0x10_0000;
pub const FIRST_NODE: u64 = 0x10_0018;
pub const STRING_OBJECT: u64 = 0x10_0038;
pub const FREE_OBJECT: u64 = 0x10_0058;
pub const DANGLING_NODE: u64 = 0x10_0078;
pub const SEGMENT_END: u64 = 0x10_0098;

/// Target memory made of disjoint byte regions
#[derive(Default)]
pub struct FlatReader {
    regions: Vec<(u64, Vec<u8>)>,
}

impl FlatReader {
    pub fn map(&mut self, start: u64, length: usize) {
        self.regions.push((start, vec![0; length]));
    }

    pub fn write(&mut self, address: u64, bytes: &[u8]) {
        let (start, data) = self
            .regions
            .iter_mut()
            .find(|(start, data)| address >= *start && address + bytes.len() as u64 <= *start + data.len() as u64)
            .expect("write outside of mapped memory");
        let offset = (address - *start) as usize;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        self.write(address, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        self.write(address, &value.to_le_bytes());
    }
}

impl DataReader for FlatReader {
    fn read(&self, address: u64, buffer: &mut [u8]) -> usize {
        for (start, data) in &self.regions {
            let end = *start + data.len() as u64;
            if address >= *start && address < end {
                let offset = (address - *start) as usize;
                let length = buffer.len().min(data.len() - offset);
                buffer[..length].copy_from_slice(&data[offset..offset + length]);
                return length;
            }
        }
        0
    }

    fn pointer_size(&self) -> usize {
        8
    }

    fn architecture(&self) -> Architecture {
        Architecture::X64
    }
}

/// A gateway answering from fixed tables
#[derive(Default)]
pub struct FakeDac {
    pub version: u32,
    pub common: CommonMethodTables,
    pub method_tables: HashMap<u64, (MethodTableData, String)>,
    pub segments: HashMap<u64, SegmentData>,
    pub workstation: HeapDetails,
    pub handles: Vec<HandleData>,
    pub method_table_queries: AtomicUsize,
    pub flushes: AtomicUsize,
}

impl FakeDac {
    pub fn add_method_table(&mut self, address: u64, data: MethodTableData, name: &str) {
        self.method_tables.insert(address, (data, name.to_string()));
    }
}

impl SosDac for FakeDac {
    fn dac_version(&self) -> Option<u32> {
        Some(self.version)
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn thread_store_data(&self) -> Option<ThreadStoreData> {
        Some(ThreadStoreData::default())
    }

    fn thread_data(&self, _thread: u64) -> Option<ThreadData> {
        None
    }

    fn thread_from_thinlock_id(&self, _id: u32) -> u64 {
        0
    }

    fn common_method_tables(&self) -> Option<CommonMethodTables> {
        Some(self.common)
    }

    fn method_table_data(&self, method_table: u64) -> Option<MethodTableData> {
        self.method_table_queries.fetch_add(1, Ordering::SeqCst);
        self.method_tables
            .get(&method_table)
            .map(|(data, _)| data.clone())
    }

    fn method_table_name(&self, method_table: u64) -> Option<String> {
        self.method_tables
            .get(&method_table)
            .map(|(_, name)| name.clone())
    }

    fn object_data(&self, _object: u64) -> Option<ObjectData> {
        None
    }

    fn module_data(&self, _module: u64) -> Option<ModuleData> {
        None
    }

    fn module_map(&self, _module: u64, _kind: ModuleMapKind) -> Vec<(u32, u64)> {
        Vec::new()
    }

    fn gc_heap_data(&self) -> Option<GcInfo> {
        Some(GcInfo {
            heap_count: 1,
            max_generation: 2,
            ..Default::default()
        })
    }

    fn heap_list(&self, _count: usize) -> Vec<u64> {
        Vec::new()
    }

    fn server_heap_details(&self, _heap: u64) -> Option<HeapDetails> {
        None
    }

    fn workstation_heap_details(&self) -> Option<HeapDetails> {
        Some(self.workstation.clone())
    }

    fn segment_data(&self, segment: u64) -> Option<SegmentData> {
        self.segments.get(&segment).copied()
    }

    fn sync_block_data(&self, _index: u32) -> Option<SyncBlockData> {
        None
    }

    fn handles(&self) -> Option<Vec<HandleData>> {
        Some(self.handles.clone())
    }

    fn ccw_data(&self, _object: u64) -> Option<CcwData> {
        None
    }

    fn rcw_data(&self, _object: u64) -> Option<RcwData> {
        None
    }

    fn jit_managers(&self) -> Vec<JitManagerInfo> {
        Vec::new()
    }

    fn code_heap_list(&self, _jit_manager: u64) -> Vec<JitCodeHeapInfo> {
        Vec::new()
    }

    fn app_domain_store_data(&self) -> Option<AppDomainStoreData> {
        None
    }

    fn app_domain_list(&self, _count: usize) -> Vec<u64> {
        Vec::new()
    }

    fn app_domain_data(&self, _domain: u64) -> Option<AppDomainData> {
        None
    }

    fn app_domain_name(&self, _domain: u64) -> Option<String> {
        None
    }

    fn assembly_list(&self, _domain: u64) -> Vec<u64> {
        Vec::new()
    }

    fn module_list(&self, _assembly: u64) -> Vec<u64> {
        Vec::new()
    }

    fn traverse_loader_heap(
        &self,
        _heap: u64,
        _kind: Option<LoaderHeapKind>,
        _callback: &mut LoaderHeapCallback<'_>,
    ) -> bool {
        false
    }

    fn traverse_stub_heap(
        &self,
        _domain: u64,
        _kind: StubHeapKind,
        _callback: &mut LoaderHeapCallback<'_>,
    ) -> bool {
        false
    }
}

fn plain(parent: u64, base_size: u32, component_size: u32) -> MethodTableData {
    MethodTableData {
        module: 0x7000,
        parent_method_table: parent,
        base_size,
        component_size,
        ..Default::default()
    }
}

/// Builds the fixture described in the module docs
pub fn fixture() -> (Arc<FakeDac>, Arc<FlatReader>) {
    let mut reader = FlatReader::default();
    reader.map(0x7_0000, 0x1_0000);
    reader.map(SEGMENT_START, (SEGMENT_END - SEGMENT_START) as usize);

    // One series covering the reference at offset 8 of a 32 byte Node
    reader.write_u64(NODE - 24, (8_i64 - 32) as u64);
    reader.write_u64(NODE - 16, 8);
    reader.write_u64(NODE - 8, 1);

    reader.write_u64(PLAIN_OBJECT, OBJECT);

    reader.write_u64(FIRST_NODE, NODE);
    reader.write_u64(FIRST_NODE + 8, PLAIN_OBJECT);

    reader.write_u64(STRING_OBJECT, STRING);
    reader.write_u32(STRING_OBJECT + 8, 3);

    reader.write_u64(FREE_OBJECT, FREE);
    reader.write_u32(FREE_OBJECT + 8, 8);

    reader.write_u64(DANGLING_NODE, NODE);
    reader.write_u64(DANGLING_NODE + 8, FREE_OBJECT);

    let mut dac = FakeDac {
        version: SUPPORTED_DAC_VERSION,
        common: CommonMethodTables {
            object: OBJECT,
            string: STRING,
            free: FREE,
            ..Default::default()
        },
        ..Default::default()
    };
    dac.add_method_table(OBJECT, plain(0, 24, 0), "System.Object");
    dac.add_method_table(STRING, plain(OBJECT, 22, 2), "System.String");
    dac.add_method_table(FREE, plain(0, 24, 1), "Free");
    dac.add_method_table(
        NODE,
        MethodTableData {
            contains_pointers: true,
            ..plain(OBJECT, 32, 0)
        },
        "Sample.Node`1[[System.String, System.Private.CoreLib]]",
    );
    dac.segments.insert(
        SEGMENT,
        SegmentData {
            address: SEGMENT,
            start: SEGMENT_START,
            allocated: SEGMENT_END,
            committed: SEGMENT_END + 0x1000,
            reserved: SEGMENT_END + 0x10000,
            used: SEGMENT_END,
            background_allocated: SEGMENT_END,
            ..Default::default()
        },
    );
    dac.workstation = HeapDetails {
        generation_table: vec![
            GenerationData::default(),
            GenerationData::default(),
            GenerationData {
                start_segment: SEGMENT,
                ..Default::default()
            },
            GenerationData::default(),
        ],
        ..Default::default()
    };

    (Arc::new(dac), Arc::new(reader))
}

/// Opens a session over the fixture
pub fn runtime(options: CacheOptions) -> (Arc<FakeDac>, ClrRuntime) {
    let (dac, reader) = fixture();
    let runtime = ClrRuntime::new(
        dac.clone(),
        reader,
        RuntimeInfo::new(ClrFlavor::Core, 8),
        options,
    )
    .expect("fixture runtime opens");
    (dac, runtime)
}
