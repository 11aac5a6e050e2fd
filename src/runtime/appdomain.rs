//! App domains and the modules loaded into them.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::{config::RuntimeInfo, dac::SosDac, utils::CancellationToken};

/// Name given to the system domain
pub const SYSTEM_DOMAIN_NAME: &str = "System Domain";
/// Name given to the shared domain
pub const SHARED_DOMAIN_NAME: &str = "Shared Domain";

/// An app domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClrAppDomain {
    /// Address of the domain
    pub address: u64,
    /// Domain id, `-1` if unknown
    pub id: i32,
    /// Friendly name
    pub name: Option<String>,
    /// Loader allocator of the domain, `0` if the runtime reports none
    pub loader_allocator: u64,
    /// Modules loaded into the domain, by address
    pub modules: Vec<u64>,
}

/// A loaded module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClrModule {
    /// Address of the module
    pub address: u64,
    /// Owning assembly
    pub assembly: u64,
    /// First domain the module was found in
    pub app_domain: u64,
    /// Simple name as the runtime reports it
    pub name: Option<String>,
    /// Loader allocator of a collectible assembly, `0` otherwise
    pub loader_allocator: u64,
    /// Thunk heap, `0` if none
    pub thunk_heap: u64,
}

/// Everything read from the app domain store, discarded on flush
#[derive(Debug, Default)]
pub(crate) struct DomainData {
    pub system: Option<ClrAppDomain>,
    pub shared: Option<ClrAppDomain>,
    pub app_domains: Vec<ClrAppDomain>,
    pub modules: BTreeMap<u64, ClrModule>,
    pub base_class_library: Option<u64>,
}

impl DomainData {
    /// Reads the app domain store and the modules of every domain in it.
    ///
    /// The base class library is the module defining `object_method_table`, or failing that
    /// the module carrying the runtime's core library name.
    pub(crate) fn read(
        dac: &dyn SosDac,
        info: &RuntimeInfo,
        object_method_table: u64,
        cancel: &CancellationToken,
    ) -> Self {
        let Some(store) = dac.app_domain_store_data() else {
            debug!("app domain store unavailable");
            return DomainData::default();
        };

        let mut data = DomainData::default();
        let mut modules = BTreeMap::new();

        if store.system_domain != 0 {
            data.system = Some(Self::domain(
                dac,
                store.system_domain,
                Some(SYSTEM_DOMAIN_NAME.to_string()),
                &mut modules,
            ));
        }
        if store.shared_domain != 0 {
            data.shared = Some(Self::domain(
                dac,
                store.shared_domain,
                Some(SHARED_DOMAIN_NAME.to_string()),
                &mut modules,
            ));
        }

        for address in dac.app_domain_list(store.app_domain_count as usize) {
            break_if_cancelled!(cancel, "app domain list");
            if address == 0 {
                continue;
            }
            let name = dac.app_domain_name(address);
            data.app_domains
                .push(Self::domain(dac, address, name, &mut modules));
        }

        data.base_class_library = dac
            .method_table_data(object_method_table)
            .map(|mt| mt.module)
            .filter(|module| *module != 0)
            .or_else(|| {
                let expected = info.base_class_library_name();
                modules
                    .values()
                    .find(|module: &&ClrModule| {
                        module
                            .name
                            .as_deref()
                            .is_some_and(|name| name.eq_ignore_ascii_case(expected))
                    })
                    .map(|module| module.address)
            });

        data.modules = modules;
        debug!(
            domains = data.app_domains.len(),
            modules = data.modules.len(),
            bcl = data.base_class_library.unwrap_or(0),
            "app domains"
        );
        data
    }

    fn domain(
        dac: &dyn SosDac,
        address: u64,
        name: Option<String>,
        modules: &mut BTreeMap<u64, ClrModule>,
    ) -> ClrAppDomain {
        let id = dac.app_domain_data(address).map_or(-1, |data| data.id);

        let mut domain_modules = Vec::new();
        for assembly in dac.assembly_list(address) {
            for module in dac.module_list(assembly) {
                if module == 0 || domain_modules.contains(&module) {
                    continue;
                }
                domain_modules.push(module);

                if modules.contains_key(&module) {
                    continue;
                }
                let Some(data) = dac.module_data(module) else {
                    continue;
                };
                trace!(module, name = ?data.name, "module");
                modules.insert(
                    module,
                    ClrModule {
                        address: module,
                        assembly: if data.assembly != 0 { data.assembly } else { assembly },
                        app_domain: address,
                        name: data.name,
                        loader_allocator: data.loader_allocator,
                        thunk_heap: data.thunk_heap,
                    },
                );
            }
        }

        ClrAppDomain {
            address,
            id,
            name,
            loader_allocator: dac.domain_loader_allocator(address),
            modules: domain_modules,
        }
    }

    /// The system domain, then the shared domain, then the first app domain
    pub(crate) fn fallback_domain(&self) -> u64 {
        self.system
            .as_ref()
            .or(self.shared.as_ref())
            .or(self.app_domains.first())
            .map_or(0, |domain| domain.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        config::ClrFlavor,
        dac::{AppDomainData, AppDomainStoreData, ModuleData},
        test::{method_table, MockDac},
    };

    fn module(address: u64, name: &str) -> ModuleData {
        ModuleData {
            address,
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn store() -> MockDac {
        let mut dac = MockDac::new();
        dac.domain_store = Some(AppDomainStoreData {
            system_domain: 0x100,
            shared_domain: 0,
            app_domain_count: 1,
        });
        dac.domains = vec![0x200];
        dac.domain_names.insert(0x200, "app.exe".to_string());
        dac.domain_data.insert(
            0x200,
            AppDomainData {
                address: 0x200,
                id: 1,
                ..Default::default()
            },
        );
        dac.assemblies.insert(0x100, vec![0x1000]);
        dac.assemblies.insert(0x200, vec![0x1000, 0x2000]);
        dac.assembly_modules.insert(0x1000, vec![0x1100]);
        dac.assembly_modules.insert(0x2000, vec![0x2100]);
        dac.modules.insert(0x1100, module(0x1100, "System.Private.CoreLib"));
        dac.modules.insert(0x2100, module(0x2100, "app"));
        dac
    }

    #[test]
    fn domains_and_modules() {
        let dac = store();
        let info = RuntimeInfo::new(ClrFlavor::Core, 8);
        let data = DomainData::read(&dac, &info, 0, &CancellationToken::new());

        let system = data.system.as_ref().unwrap();
        assert_eq!(system.name.as_deref(), Some(SYSTEM_DOMAIN_NAME));
        assert_eq!(system.id, -1);
        assert!(data.shared.is_none());

        assert_eq!(data.app_domains.len(), 1);
        assert_eq!(data.app_domains[0].id, 1);
        assert_eq!(data.app_domains[0].modules, vec![0x1100, 0x2100]);

        assert_eq!(data.modules.len(), 2);
        assert_eq!(data.modules[&0x1100].app_domain, 0x100);
        assert_eq!(data.fallback_domain(), 0x100);
    }

    #[test]
    fn bcl_by_object_module_then_name() {
        let mut dac = store();
        let info = RuntimeInfo::new(ClrFlavor::Core, 8);

        let by_name = DomainData::read(&dac, &info, 0x7_1000, &CancellationToken::new());
        assert_eq!(by_name.base_class_library, Some(0x1100));

        dac.add_method_table(0x7_1000, method_table(0, 24, 0), "System.Object");
        dac.method_tables.get_mut(&0x7_1000).unwrap().module = 0x2100;
        let by_object = DomainData::read(&dac, &info, 0x7_1000, &CancellationToken::new());
        assert_eq!(by_object.base_class_library, Some(0x2100));

        let desktop = RuntimeInfo::new(ClrFlavor::Desktop, 4);
        let missing = DomainData::read(&store(), &desktop, 0, &CancellationToken::new());
        assert_eq!(missing.base_class_library, None);
    }
}
