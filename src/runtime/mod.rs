//! The runtime session.
//!
//! [`ClrRuntime`] is the entry point of the crate. It validates the query gateway once, then
//! hands out the heap, threads, handles, app domains and native heaps of the target. All of
//! that is cached until [`ClrRuntime::flush`] is called.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use clrscope::{CacheOptions, ClrFlavor, ClrRuntime, RuntimeInfo};
//!
//! let runtime = ClrRuntime::new(dac, reader, RuntimeInfo::new(ClrFlavor::Core, 8), CacheOptions::default())?;
//! let heap = runtime.heap();
//! for object in heap.enumerate_all_objects() {
//!     println!("{:#x} {:?}", object.address, object.ty.and_then(|ty| ty.name()));
//! }
//! # Ok::<(), clrscope::Error>(())
//! ```
//!
//! # Flushing
//!
//! Addresses are not stable once the target resumes. The caller stops the target, queries,
//! and calls [`ClrRuntime::flush`] before querying again after a resume. Flushing drops the
//! app domain data, the native heap helper and the heap together, and forwards the flush to
//! the gateway.

mod appdomain;
mod handle;
mod jit;
mod thread;

pub use appdomain::{ClrAppDomain, ClrModule, SHARED_DOMAIN_NAME, SYSTEM_DOMAIN_NAME};
pub use handle::{ClrHandle, ClrHandleKind};
pub use jit::{ClrJitManager, CodeKind};
pub use thread::ClrThread;

pub(crate) use thread::walk_thread_list;

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, RwLock},
};

use tracing::debug;

use crate::{
    config::{CacheOptions, RuntimeInfo},
    dac::{CommonMethodTables, SosDac, SUPPORTED_DAC_VERSION},
    heap::ClrHeap,
    nativeheap::{ClrNativeHeapInfo, ClrNativeHeapState, NativeHeapHelper, NativeHeapKind},
    target::DataReader,
    typesystem::ClrTypeRc,
    utils::CancellationToken,
    Error, Result,
};

use appdomain::DomainData;

/// A session on one runtime in the target.
pub struct ClrRuntime {
    dac: Arc<dyn SosDac>,
    reader: Arc<dyn DataReader>,
    info: RuntimeInfo,
    options: CacheOptions,
    cancel: CancellationToken,
    common: CommonMethodTables,
    domains: RwLock<Option<Arc<DomainData>>>,
    native: Mutex<Option<Arc<NativeHeapHelper>>>,
    heap: Mutex<Option<Arc<ClrHeap>>>,
}

impl ClrRuntime {
    /// Opens a session on the runtime the gateway is connected to.
    ///
    /// ## Arguments
    /// * 'dac'     - The structured query gateway
    /// * 'reader'  - Raw memory access to the target
    /// * 'info'    - Flavor and version of the runtime
    /// * 'options' - Cache policy
    ///
    /// # Errors
    /// Returns [`Error::ProtocolVersionMismatch`] if the gateway speaks another protocol
    /// version, and [`Error::NotInitialized`] if the runtime has no thread store or special
    /// method tables yet.
    pub fn new(
        dac: Arc<dyn SosDac>,
        reader: Arc<dyn DataReader>,
        info: RuntimeInfo,
        options: CacheOptions,
    ) -> Result<Self> {
        Self::with_cancellation(dac, reader, info, options, CancellationToken::new())
    }

    /// Like [`ClrRuntime::new`], with every walk bound to `cancel`.
    ///
    /// # Errors
    /// See [`ClrRuntime::new`].
    pub fn with_cancellation(
        dac: Arc<dyn SosDac>,
        reader: Arc<dyn DataReader>,
        info: RuntimeInfo,
        options: CacheOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        match dac.dac_version() {
            Some(SUPPORTED_DAC_VERSION) => {}
            Some(actual) => {
                return Err(Error::ProtocolVersionMismatch {
                    expected: SUPPORTED_DAC_VERSION,
                    actual,
                })
            }
            None => {
                return Err(Error::NotInitialized(
                    "the data access layer reported no protocol version".to_string(),
                ))
            }
        }

        if dac.thread_store_data().is_none() {
            return Err(Error::NotInitialized("thread store unavailable".to_string()));
        }

        let common = dac
            .common_method_tables()
            .filter(|common| common.object != 0)
            .ok_or_else(|| Error::NotInitialized("special method tables unavailable".to_string()))?;

        debug!(
            flavor = %info.flavor,
            major = info.major,
            object = common.object,
            "runtime session opened"
        );

        Ok(ClrRuntime {
            dac,
            reader,
            info,
            options,
            cancel,
            common,
            domains: RwLock::new(None),
            native: Mutex::new(None),
            heap: Mutex::new(None),
        })
    }

    /// Flavor and version of the runtime
    #[must_use]
    pub fn info(&self) -> &RuntimeInfo {
        &self.info
    }

    /// The cache policy of this session
    #[must_use]
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Drops everything cached about the target.
    ///
    /// Must be called after the target ran. Callers must not query concurrently with a flush.
    pub fn flush(&self) {
        let heap = lock!(self.heap).take();
        if let Some(heap) = heap {
            heap.type_factory().invalidate_all();
        }
        *lock!(self.native) = None;
        *write_lock!(self.domains) = None;
        self.dac.flush();
        debug!("runtime flushed");
    }

    fn domain_data(&self) -> Arc<DomainData> {
        if let Some(data) = read_lock!(self.domains).as_ref() {
            return data.clone();
        }

        // Built outside the lock, the gateway may reenter
        let data = Arc::new(DomainData::read(
            self.dac.as_ref(),
            &self.info,
            self.common.object,
            &self.cancel,
        ));
        write_lock!(self.domains).get_or_insert(data).clone()
    }

    fn native_heaps(&self) -> Arc<NativeHeapHelper> {
        if let Some(helper) = lock!(self.native).as_ref() {
            return helper.clone();
        }

        let helper = Arc::new(NativeHeapHelper::new(
            self.dac.clone(),
            self.reader.clone(),
            self.info,
            self.cancel.clone(),
        ));
        lock!(self.native).get_or_insert(helper).clone()
    }

    /// The managed heap, created on first use and shared until the next flush
    pub fn heap(&self) -> Arc<ClrHeap> {
        if let Some(heap) = lock!(self.heap).as_ref() {
            return heap.clone();
        }

        let bcl = self.domain_data().base_class_library.unwrap_or(0);
        let heap = Arc::new(ClrHeap::new(
            self.dac.clone(),
            self.reader.clone(),
            self.options,
            self.cancel.clone(),
            self.common,
            bcl,
        ));
        lock!(self.heap).get_or_insert(heap).clone()
    }

    /// Type of a method table, see [`crate::typesystem::TypeFactory::get_or_create_type`]
    pub fn get_type_by_method_table(&self, method_table: u64) -> Option<ClrTypeRc> {
        self.heap().get_or_create_type(method_table, 0)
    }

    /// The system domain
    pub fn system_domain(&self) -> Option<ClrAppDomain> {
        self.domain_data().system.clone()
    }

    /// The shared domain, `None` on .NET Core
    pub fn shared_domain(&self) -> Option<ClrAppDomain> {
        self.domain_data().shared.clone()
    }

    /// The app domains, without the system and shared domains
    pub fn app_domains(&self) -> Vec<ClrAppDomain> {
        self.domain_data().app_domains.clone()
    }

    /// Every loaded module, by address
    pub fn modules(&self) -> Vec<ClrModule> {
        self.domain_data().modules.values().cloned().collect()
    }

    /// The module defining `System.Object`
    pub fn base_class_library(&self) -> Option<ClrModule> {
        let data = self.domain_data();
        data.base_class_library
            .and_then(|address| data.modules.get(&address).cloned())
    }

    /// The managed threads
    pub fn threads(&self) -> Vec<ClrThread> {
        let Some(store) = self.dac.thread_store_data() else {
            return Vec::new();
        };

        walk_thread_list(
            self.dac.as_ref(),
            &store,
            self.options.max_thread_count,
            &self.cancel,
        )
        .iter()
        .map(|(address, data)| ClrThread::new(*address, data, &store))
        .collect()
    }

    /// GC handles whose object is non-null
    pub fn enumerate_handles(&self) -> Vec<ClrHandle> {
        let fallback = self.domain_data().fallback_domain();
        handle::enumerate_handles(
            self.dac.as_ref(),
            self.reader.as_ref(),
            fallback,
            &self.cancel,
        )
    }

    /// The JIT code managers
    pub fn enumerate_jit_managers(&self) -> Vec<ClrJitManager> {
        self.dac
            .jit_managers()
            .into_iter()
            .map(ClrJitManager::from)
            .collect()
    }

    /// Code heaps of one JIT manager
    pub fn enumerate_jit_manager_heaps(&self, jit_manager: &ClrJitManager) -> Vec<ClrNativeHeapInfo> {
        self.native_heaps()
            .enumerate_jit_manager_heaps(jit_manager.address)
    }

    /// Loader and stub heaps of one app domain
    pub fn enumerate_domain_heaps(&self, domain: &ClrAppDomain) -> Vec<ClrNativeHeapInfo> {
        self.native_heaps().enumerate_domain_heaps(domain.address)
    }

    /// Every native heap the runtime owns.
    ///
    /// Visits the JIT code heaps, the heaps of every domain, the thunk heaps and collectible
    /// loader allocators of the modules, then the GC's free, handle table and bookkeeping
    /// regions. A loader allocator shared by several domains or modules is visited once.
    pub fn enumerate_native_heaps(&self) -> Vec<ClrNativeHeapInfo> {
        let native = self.native_heaps();
        let mut heaps = Vec::new();

        for manager in self.enumerate_jit_managers() {
            heaps.extend(native.enumerate_jit_manager_heaps(manager.address));
        }

        let data = self.domain_data();
        let mut visited = HashSet::new();

        for domain in data.system.iter().chain(data.shared.iter()) {
            visited.insert(domain.loader_allocator);
            heaps.extend(native.enumerate_domain_heaps(domain.address));
        }

        for domain in &data.app_domains {
            if domain.loader_allocator == 0 || visited.insert(domain.loader_allocator) {
                heaps.extend(native.enumerate_domain_heaps(domain.address));
            }
        }

        for module in data.modules.values() {
            if self.cancel.is_cancelled() {
                debug!(walk = "module heaps", "walk cancelled");
                break;
            }
            if module.address != 0 && !visited.insert(module.address) {
                continue;
            }
            if module.thunk_heap != 0 && visited.insert(module.thunk_heap) {
                heaps.extend(native.enumerate_thunk_heaps(module.thunk_heap));
            }
            if module.loader_allocator != 0 && visited.insert(module.loader_allocator) {
                heaps.extend(native.enumerate_loader_allocator_heaps(module.loader_allocator));
            }
        }

        for region in self.dac.gc_free_regions().unwrap_or_default() {
            let start = region.start & !0xff;
            let mut region = region;
            region.length += region.start - start;
            region.start = start;
            heaps.push(ClrNativeHeapInfo::from_region(
                &region,
                NativeHeapKind::from_free_region(region.extra_data),
                ClrNativeHeapState::Inactive,
            ));
        }

        for region in self.dac.handle_table_regions().unwrap_or_default() {
            heaps.push(ClrNativeHeapInfo::from_region(
                &region,
                NativeHeapKind::HandleTable,
                ClrNativeHeapState::Active,
            ));
        }

        for region in self.dac.gc_bookkeeping_regions().unwrap_or_default() {
            let mut info = ClrNativeHeapInfo::from_region(
                &region,
                NativeHeapKind::GCBookkeeping,
                ClrNativeHeapState::RegionOfRegions,
            );
            info.heap = None;
            heaps.push(info);
        }

        debug!(count = heaps.len(), "native heaps");
        heaps
    }
}

impl fmt::Debug for ClrRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClrRuntime")
            .field("info", &self.info)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
