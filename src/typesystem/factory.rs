//! Creation and caching of [`ClrType`] values.
//!
//! The factory is the only place types are constructed. It owns the per-method-table
//! cache, the primitive-type table and the per-module token maps, and it is shared by the
//! heap, the runtime and the signature decoder.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::{
    config::CacheOptions,
    dac::{CommonMethodTables, ModuleMapKind, SosDac},
    target::DataReader,
    typesystem::{
        ClrElementType, ClrType, ClrTypeRc, ConstructedType, NameState, RuntimeType, SystemRole,
        TypeContext, BASIC_TYPE_SLOTS, MAX_BASE_DEPTH,
    },
};

/// Mask selecting the row number of a metadata token
const TOKEN_ROW_MASK: u32 = 0x00FF_FFFF;
/// Table byte of a TypeDef token
const TOKEN_TYPEDEF: u32 = 0x02;
/// Table byte of a TypeRef token
const TOKEN_TYPEREF: u32 = 0x01;

type BasicTypeTable = Arc<Vec<Option<ClrTypeRc>>>;

/// Creates and caches the types of one runtime.
///
/// All lookups are safe to call from many threads at once. A cache miss builds the new
/// type without holding any lock and then inserts it with an atomic entry operation, so
/// two racing callers for the same method table always observe the same handle.
pub struct TypeFactory {
    context: Arc<TypeContext>,
    common: CommonMethodTables,
    bcl_module: u64,
    object_type: ClrTypeRc,
    free_type: ClrTypeRc,
    string_type: ClrTypeRc,
    exception_type: Option<ClrTypeRc>,
    types: DashMap<u64, ClrTypeRc>,
    primitives: DashMap<ClrElementType, ClrTypeRc>,
    basic_types: Mutex<Option<BasicTypeTable>>,
    module_maps: DashMap<(u64, ModuleMapKind), Arc<HashMap<u32, u64>>>,
}

impl TypeFactory {
    /// Create a factory and materialize the system types.
    ///
    /// ## Arguments
    /// * 'dac'         - The structured query gateway
    /// * 'reader'      - Raw memory access
    /// * 'options'     - Cache policy
    /// * 'common'      - Method tables of the system types
    /// * 'bcl_module'  - The base class library module, `0` if unknown
    pub fn new(
        dac: Arc<dyn SosDac>,
        reader: Arc<dyn DataReader>,
        options: CacheOptions,
        common: CommonMethodTables,
        bcl_module: u64,
    ) -> Self {
        let context = Arc::new(TypeContext {
            dac,
            reader,
            options,
        });

        let object_type =
            Self::create_system_type(&context, common.object, None, SystemRole::Object, "System.Object");
        let free_type = Self::create_system_type(
            &context,
            common.free,
            Some(object_type.clone()),
            SystemRole::Free,
            "Free",
        );
        let string_type = Self::create_system_type(
            &context,
            common.string,
            Some(object_type.clone()),
            SystemRole::String,
            "System.String",
        );
        let exception_type = (common.exception != 0).then(|| {
            Self::create_system_type(
                &context,
                common.exception,
                Some(object_type.clone()),
                SystemRole::Exception,
                "System.Exception",
            )
        });

        TypeFactory {
            context,
            common,
            bcl_module,
            object_type,
            free_type,
            string_type,
            exception_type,
            types: DashMap::new(),
            primitives: DashMap::new(),
            basic_types: Mutex::new(None),
            module_maps: DashMap::new(),
        }
    }

    fn create_system_type(
        context: &Arc<TypeContext>,
        method_table: u64,
        base_type: Option<ClrTypeRc>,
        role: SystemRole,
        name: &str,
    ) -> ClrTypeRc {
        let data = context
            .dac
            .method_table_data(method_table)
            .unwrap_or_default();

        let runtime_type = RuntimeType::new(
            context.clone(),
            method_table & !1,
            data,
            role,
            base_type,
            NameState::TriedSome(name.to_string()),
        );

        Arc::new(match role {
            SystemRole::String => ClrType::StringType(runtime_type),
            _ => ClrType::RuntimeBacked(runtime_type),
        })
    }

    /// The cache policy in effect
    #[must_use]
    pub fn options(&self) -> &CacheOptions {
        &self.context.options
    }

    /// Target pointer size
    #[must_use]
    pub fn pointer_size(&self) -> usize {
        self.context.reader.pointer_size()
    }

    /// The system method tables this factory was created with
    #[must_use]
    pub fn common_method_tables(&self) -> &CommonMethodTables {
        &self.common
    }

    /// `System.Object`
    #[must_use]
    pub fn object_type(&self) -> &ClrTypeRc {
        &self.object_type
    }

    /// The free-object filler type
    #[must_use]
    pub fn free_type(&self) -> &ClrTypeRc {
        &self.free_type
    }

    /// `System.String`
    #[must_use]
    pub fn string_type(&self) -> &ClrTypeRc {
        &self.string_type
    }

    /// `System.Exception`, if the runtime reported it
    #[must_use]
    pub fn exception_type(&self) -> Option<&ClrTypeRc> {
        self.exception_type.as_ref()
    }

    fn system_type(&self, method_table: u64) -> Option<&ClrTypeRc> {
        if method_table == self.common.object & !1 {
            Some(&self.object_type)
        } else if method_table == self.common.free & !1 {
            Some(&self.free_type)
        } else if method_table == self.common.string & !1 {
            Some(&self.string_type)
        } else if method_table == self.common.exception & !1 {
            self.exception_type.as_ref()
        } else {
            None
        }
    }

    /// Resolve a method table to a type.
    ///
    /// When `object` is non-zero and the type is array shaped, the array's component type
    /// is recovered from that instance. Returns `None` for a zero method table or one the
    /// gateway cannot describe.
    ///
    /// ## Arguments
    /// * 'method_table' - Method table address, the mark bit is ignored
    /// * 'object'       - An instance of the type, or `0`
    pub fn get_or_create_type(&self, method_table: u64, object: u64) -> Option<ClrTypeRc> {
        self.get_or_create_type_at(method_table, object, 0, false)
    }

    fn get_or_create_type_at(
        &self,
        method_table: u64,
        object: u64,
        depth: usize,
        always_cache: bool,
    ) -> Option<ClrTypeRc> {
        if method_table == 0 {
            return None;
        }

        let method_table = method_table & !1;
        if depth > MAX_BASE_DEPTH {
            debug!(method_table, "base type chain too deep");
            return None;
        }

        if let Some(system) = self.system_type(method_table) {
            return Some(system.clone());
        }

        let cached = self
            .types
            .get(&method_table)
            .map(|entry| entry.value().clone());
        if let Some(existing) = cached {
            if object != 0 {
                if let Some(rt) = existing.as_runtime() {
                    if rt.data().component_size != 0 && !rt.has_component_type() {
                        if let Some(component) = self.component_from_instance(object, depth) {
                            rt.fill_component_type(component);
                        }
                    }
                }
            }
            return Some(existing);
        }

        let Some(data) = self.context.dac.method_table_data(method_table) else {
            trace!(method_table, "no method table data");
            return None;
        };

        let base_type = if data.parent_method_table != 0 {
            self.get_or_create_type_at(data.parent_method_table, 0, depth + 1, always_cache)
        } else {
            None
        };

        let component = if object != 0 && data.component_size != 0 {
            self.component_from_instance(object, depth)
        } else {
            None
        };

        let runtime_type = RuntimeType::new(
            self.context.clone(),
            method_table,
            data,
            SystemRole::None,
            base_type,
            NameState::NotTried,
        );
        if let Some(component) = component {
            runtime_type.fill_component_type(component);
        }

        let created = Arc::new(ClrType::RuntimeBacked(runtime_type));
        if always_cache || self.context.options.cache_types {
            let entry = self.types.entry(method_table).or_insert(created);
            return Some(entry.value().clone());
        }

        Some(created)
    }

    /// Component type of the array at `object`: its element type handle if that resolves,
    /// otherwise the basic type of its element-type code. `None` if the instance has neither.
    fn component_from_instance(&self, object: u64, depth: usize) -> Option<ClrTypeRc> {
        let data = self.context.dac.object_data(object)?;
        if data.element_type_handle != 0 {
            let resolved =
                self.get_or_create_type_at(data.element_type_handle, 0, depth + 1, false);
            if resolved.is_some() {
                return resolved;
            }
            trace!(
                object,
                handle = data.element_type_handle,
                "unresolved element type handle"
            );
        }

        (data.element_type != 0)
            .then(|| self.get_or_create_basic_type(ClrElementType::from_code(data.element_type)))
    }

    /// The type for an element-type code.
    ///
    /// Object and String resolve to the system types. Primitives come from a table built
    /// once from the base class library; codes missing from it become synthesized
    /// [`ClrType::Primitive`] singletons.
    pub fn get_or_create_basic_type(&self, element_type: ClrElementType) -> ClrTypeRc {
        match element_type {
            ClrElementType::Object | ClrElementType::Class => return self.object_type.clone(),
            ClrElementType::String => return self.string_type.clone(),
            _ => {}
        }

        let table = self.basic_types();
        if let Some(Some(basic)) = table.get(usize::from(element_type.code())) {
            return basic.clone();
        }

        self.primitives
            .entry(element_type)
            .or_insert_with(|| Arc::new(ClrType::Primitive { element_type }))
            .value()
            .clone()
    }

    fn basic_types(&self) -> BasicTypeTable {
        if let Some(table) = lock!(self.basic_types).as_ref() {
            return table.clone();
        }

        let built = Arc::new(self.build_basic_types());
        lock!(self.basic_types).get_or_insert(built).clone()
    }

    fn build_basic_types(&self) -> Vec<Option<ClrTypeRc>> {
        let mut table: Vec<Option<ClrTypeRc>> = vec![None; BASIC_TYPE_SLOTS];
        table[usize::from(ClrElementType::Object.code())] = Some(self.object_type.clone());
        table[usize::from(ClrElementType::String.code())] = Some(self.string_type.clone());

        if self.bcl_module == 0 {
            debug!("base class library unknown, primitives will be synthesized");
            return table;
        }

        let map = self.module_map(self.bcl_module, ModuleMapKind::TypeDefToMethodTable);
        let mut remaining = 16;
        for method_table in map.values() {
            let Some(name) = self.context.dac.method_table_name(*method_table) else {
                continue;
            };

            let element_type = match name.as_str() {
                "System.ValueType" => ClrElementType::Struct,
                "System.Enum" => continue,
                other => match ClrElementType::from_well_known_name(other) {
                    Some(element_type) => element_type,
                    None => continue,
                },
            };

            let slot = usize::from(element_type.code());
            if table[slot].is_some() {
                continue;
            }

            if let Some(basic) = self.get_or_create_type_at(*method_table, 0, 0, true) {
                table[slot] = Some(basic);
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
        }

        table
    }

    /// The token → method table map of a module, cached per module and kind.
    ///
    /// Keys are metadata row numbers.
    pub fn module_map(&self, module: u64, kind: ModuleMapKind) -> Arc<HashMap<u32, u64>> {
        let key = (module, kind);
        if let Some(map) = self.module_maps.get(&key) {
            return map.value().clone();
        }

        let built: HashMap<u32, u64> = self
            .context
            .dac
            .module_map(module, kind)
            .into_iter()
            .map(|(token, method_table)| (token & TOKEN_ROW_MASK, method_table))
            .collect();

        self.module_maps
            .entry(key)
            .or_insert_with(|| Arc::new(built))
            .value()
            .clone()
    }

    /// Resolve a TypeDef or TypeRef token of `module` to a type.
    ///
    /// Tokens of any other table resolve to `None`.
    pub fn get_or_create_type_from_token(&self, module: u64, token: u32) -> Option<ClrTypeRc> {
        let kind = match token >> 24 {
            TOKEN_TYPEDEF => ModuleMapKind::TypeDefToMethodTable,
            TOKEN_TYPEREF => ModuleMapKind::TypeRefToMethodTable,
            _ => return None,
        };

        let method_table = *self.module_map(module, kind).get(&(token & TOKEN_ROW_MASK))?;
        self.get_or_create_type(method_table, 0)
    }

    /// An array of `component` with the given rank
    #[must_use]
    pub fn get_or_create_array_type(&self, component: ClrTypeRc, rank: u32) -> ClrTypeRc {
        Arc::new(ClrType::Constructed(ConstructedType {
            component: Some(component),
            rank: rank.max(1),
            is_pointer: false,
            pointer_size: self.pointer_size() as u32,
        }))
    }

    /// A pointer to `component` with `depth` levels of indirection
    #[must_use]
    pub fn get_or_create_pointer_type(&self, component: ClrTypeRc, depth: u32) -> ClrTypeRc {
        Arc::new(ClrType::Constructed(ConstructedType {
            component: Some(component),
            rank: depth.max(1),
            is_pointer: true,
            pointer_size: self.pointer_size() as u32,
        }))
    }

    /// A placeholder for a generic type or method parameter
    #[must_use]
    pub fn get_or_create_generic_parameter(
        &self,
        index: u32,
        is_method: bool,
        name: Option<String>,
    ) -> ClrTypeRc {
        Arc::new(ClrType::GenericParameter {
            index,
            is_method,
            name,
        })
    }

    /// Number of cached runtime-backed types
    #[must_use]
    pub fn cached_type_count(&self) -> usize {
        self.types.len()
    }

    /// Drop every cached type, token map and the primitive table.
    ///
    /// The system types survive, they are owned by the factory itself.
    pub fn invalidate_all(&self) {
        self.types.clear();
        self.primitives.clear();
        self.module_maps.clear();
        *lock!(self.basic_types) = None;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, thread};

    use super::*;
    use crate::{
        dac::{MethodTableData, ObjectData},
        test::{MockDac, MockReader},
    };

    const OBJECT: u64 = 0x1000;
    const STRING: u64 = 0x2000;
    const FREE: u64 = 0x3000;
    const EXCEPTION: u64 = 0x4000;
    const VALUETYPE: u64 = 0x5000;
    const INT32: u64 = 0x6000;
    const FOO: u64 = 0x7000;
    const INT_ARRAY: u64 = 0x8000;
    const ENUM: u64 = 0x9000;
    const COLOR: u64 = 0xa000;
    const BCL: u64 = 0xb000;

    fn mt(parent: u64, base_size: u32, component_size: u32) -> MethodTableData {
        MethodTableData {
            module: BCL,
            parent_method_table: parent,
            base_size,
            component_size,
            ..Default::default()
        }
    }

    fn dac() -> MockDac {
        let mut dac = MockDac::new();
        dac.common = Some(CommonMethodTables {
            object: OBJECT,
            string: STRING,
            free: FREE,
            exception: EXCEPTION,
            array: 0,
        });
        dac.add_method_table(OBJECT, mt(0, 24, 0), "System.Object");
        dac.add_method_table(STRING, mt(OBJECT, 22, 2), "System.String");
        dac.add_method_table(FREE, mt(0, 24, 1), "Free");
        dac.add_method_table(EXCEPTION, mt(OBJECT, 128, 0), "System.Exception");
        dac.add_method_table(VALUETYPE, mt(OBJECT, 24, 0), "System.ValueType");
        dac.add_method_table(INT32, mt(VALUETYPE, 24, 0), "System.Int32");
        dac.add_method_table(FOO, mt(OBJECT, 32, 0), "Foo");
        dac.add_method_table(INT_ARRAY, mt(OBJECT, 24, 4), "System.Int32[]");
        dac.add_method_table(ENUM, mt(VALUETYPE, 24, 0), "System.Enum");
        dac.add_method_table(COLOR, mt(ENUM, 24, 0), "Color");
        dac.module_maps.insert(
            (BCL, ModuleMapKind::TypeDefToMethodTable),
            vec![
                (0x0200_0001, OBJECT),
                (0x0200_0002, VALUETYPE),
                (0x0200_0003, INT32),
                (0x0200_0004, ENUM),
            ],
        );
        dac.module_maps.insert(
            (BCL, ModuleMapKind::TypeRefToMethodTable),
            vec![(0x0100_0007, FOO)],
        );
        dac
    }

    fn factory_with(dac: MockDac, options: CacheOptions) -> (Arc<MockDac>, TypeFactory) {
        let dac = Arc::new(dac);
        let common = dac.common.unwrap_or_default();
        let factory = TypeFactory::new(
            dac.clone(),
            Arc::new(MockReader::new(8)),
            options,
            common,
            BCL,
        );
        (dac, factory)
    }

    #[test]
    fn zero_method_table_is_none() {
        let (_, factory) = factory_with(dac(), CacheOptions::default());
        assert!(factory.get_or_create_type(0, 0).is_none());
    }

    #[test]
    fn mark_bit_is_ignored() {
        let (_, factory) = factory_with(dac(), CacheOptions::default());
        let plain = factory.get_or_create_type(FOO, 0).unwrap();
        let marked = factory.get_or_create_type(FOO | 1, 0).unwrap();
        assert!(Arc::ptr_eq(&plain, &marked));
        assert_eq!(plain.method_table(), FOO);
    }

    #[test]
    fn unknown_method_table_is_none() {
        let (_, factory) = factory_with(dac(), CacheOptions::default());
        assert!(factory.get_or_create_type(0xdead_0000, 0).is_none());
    }

    #[test]
    fn system_types() {
        let (_, factory) = factory_with(dac(), CacheOptions::minimal());
        let string = factory.get_or_create_type(STRING, 0).unwrap();
        assert!(string.is_string());
        assert_eq!(string.element_type(), ClrElementType::String);
        assert!(Arc::ptr_eq(&string, factory.string_type()));

        let free = factory.get_or_create_type(FREE, 0).unwrap();
        assert!(free.is_free());
        assert!(!free.is_array());
        assert_eq!(free.name().as_deref(), Some("Free"));

        let object = factory.get_or_create_type(OBJECT, 0).unwrap();
        assert_eq!(object.element_type(), ClrElementType::Object);
        assert!(object.base_type().is_none());
    }

    #[test]
    fn element_type_derivation() {
        let (_, factory) = factory_with(dac(), CacheOptions::default());

        let foo = factory.get_or_create_type(FOO, 0).unwrap();
        assert_eq!(foo.element_type(), ClrElementType::Class);
        assert!(foo.is_object_reference());

        let int32 = factory.get_or_create_type(INT32, 0).unwrap();
        assert_eq!(int32.element_type(), ClrElementType::Int32);
        assert!(int32.is_value_type());

        let array = factory.get_or_create_type(INT_ARRAY, 0).unwrap();
        assert_eq!(array.element_type(), ClrElementType::SZArray);
        assert!(array.is_array());
        assert_eq!(array.rank(), 1);

        let color = factory.get_or_create_type(COLOR, 0).unwrap();
        assert!(color.is_enum());
        assert_eq!(color.element_type(), ClrElementType::Int32);

        let exception = factory.get_or_create_type(EXCEPTION, 0).unwrap();
        assert!(exception.is_exception());
        assert!(!foo.is_exception());
    }

    #[test]
    fn component_type_from_instance() {
        let mut dac = dac();
        dac.objects.insert(
            0x10_0000,
            ObjectData {
                method_table: INT_ARRAY,
                element_type: u32::from(ClrElementType::Int32.code()),
                ..Default::default()
            },
        );
        dac.objects.insert(
            0x20_0000,
            ObjectData {
                method_table: INT_ARRAY,
                element_type: u32::from(ClrElementType::Class.code()),
                element_type_handle: FOO,
                ..Default::default()
            },
        );
        let (_, factory) = factory_with(dac, CacheOptions::default());

        // Cached without a component first, then filled in from an instance
        let array = factory.get_or_create_type(INT_ARRAY, 0).unwrap();
        assert!(array.component_type().is_none());

        let again = factory.get_or_create_type(INT_ARRAY, 0x10_0000).unwrap();
        assert!(Arc::ptr_eq(&array, &again));
        let component = array.component_type().unwrap();
        assert_eq!(component.method_table(), INT32);

        // An already resolved component is not replaced
        factory.get_or_create_type(INT_ARRAY, 0x20_0000);
        assert_eq!(array.component_type().unwrap().method_table(), INT32);
    }

    #[test]
    fn component_falls_back_to_element_code() {
        let mut dac = dac();
        dac.objects.insert(
            0x10_0000,
            ObjectData {
                method_table: INT_ARRAY,
                element_type: u32::from(ClrElementType::Int32.code()),
                element_type_handle: 0xdead_0000,
                ..Default::default()
            },
        );
        dac.objects.insert(
            0x20_0000,
            ObjectData {
                method_table: INT_ARRAY,
                ..Default::default()
            },
        );

        // uncached, so each lookup reads its own instance
        let (_, factory) = factory_with(dac, CacheOptions::minimal());
        let resolved = factory.get_or_create_type(INT_ARRAY, 0x10_0000).unwrap();
        assert_eq!(resolved.component_type().unwrap().method_table(), INT32);

        let unknown = factory.get_or_create_type(INT_ARRAY, 0x20_0000).unwrap();
        assert!(unknown.component_type().is_none());
    }

    #[test]
    fn caching_policy() {
        let (dac, factory) = factory_with(dac(), CacheOptions::minimal());
        let first = factory.get_or_create_type(FOO, 0).unwrap();
        let second = factory.get_or_create_type(FOO, 0).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.cached_type_count(), 0);

        // Names are not cached either
        let before = dac.name_calls.load(Ordering::SeqCst);
        first.name();
        first.name();
        assert_eq!(dac.name_calls.load(Ordering::SeqCst), before + 2);
    }

    #[test]
    fn names_are_cached() {
        let (dac, factory) = factory_with(dac(), CacheOptions::default());
        let foo = factory.get_or_create_type(FOO, 0).unwrap();
        let before = dac.name_calls.load(Ordering::SeqCst);
        assert_eq!(foo.name().as_deref(), Some("Foo"));
        assert_eq!(foo.name().as_deref(), Some("Foo"));
        assert_eq!(dac.name_calls.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn names_are_demangled() {
        let mut dac = dac();
        dac.add_method_table(
            0xc000,
            mt(OBJECT, 32, 0),
            "System.Collections.Generic.List`1[[System.Int32, mscorlib]]",
        );
        let (_, factory) = factory_with(dac, CacheOptions::default());
        let list = factory.get_or_create_type(0xc000, 0).unwrap();
        assert_eq!(
            list.name().as_deref(),
            Some("System.Collections.Generic.List<System.Int32>")
        );
    }

    #[test]
    fn basic_types() {
        let (_, factory) = factory_with(dac(), CacheOptions::minimal());

        let int32 = factory.get_or_create_basic_type(ClrElementType::Int32);
        assert_eq!(int32.method_table(), INT32);
        let again = factory.get_or_create_basic_type(ClrElementType::Int32);
        assert!(Arc::ptr_eq(&int32, &again));

        let value_type = factory.get_or_create_basic_type(ClrElementType::Struct);
        assert_eq!(value_type.method_table(), VALUETYPE);

        let object = factory.get_or_create_basic_type(ClrElementType::Class);
        assert!(Arc::ptr_eq(&object, factory.object_type()));

        // Missing from the base library: synthesized once
        let double = factory.get_or_create_basic_type(ClrElementType::Double);
        assert!(matches!(
            *double,
            ClrType::Primitive {
                element_type: ClrElementType::Double
            }
        ));
        assert!(Arc::ptr_eq(
            &double,
            &factory.get_or_create_basic_type(ClrElementType::Double)
        ));
    }

    #[test]
    fn tokens() {
        let (_, factory) = factory_with(dac(), CacheOptions::default());
        let int32 = factory.get_or_create_type_from_token(BCL, 0x0200_0003).unwrap();
        assert_eq!(int32.method_table(), INT32);

        let foo = factory.get_or_create_type_from_token(BCL, 0x0100_0007).unwrap();
        assert_eq!(foo.method_table(), FOO);

        assert!(factory.get_or_create_type_from_token(BCL, 0x0200_0099).is_none());
        assert!(factory.get_or_create_type_from_token(BCL, 0x1b00_0001).is_none());
    }

    #[test]
    fn constructed_names() {
        let (_, factory) = factory_with(dac(), CacheOptions::default());
        let int32 = factory.get_or_create_basic_type(ClrElementType::Int32);

        let array = factory.get_or_create_array_type(int32.clone(), 2);
        assert_eq!(array.name().as_deref(), Some("System.Int32[,]"));
        assert_eq!(array.element_type(), ClrElementType::Array);

        let pointer = factory.get_or_create_pointer_type(int32, 2);
        assert_eq!(pointer.name().as_deref(), Some("System.Int32**"));
        assert!(pointer.is_pointer());
        assert!(!pointer.is_array());
    }

    #[test]
    fn invalidate_all_keeps_system_types() {
        let (_, factory) = factory_with(dac(), CacheOptions::default());
        let foo = factory.get_or_create_type(FOO, 0).unwrap();
        factory.get_or_create_basic_type(ClrElementType::Int32);
        assert!(factory.cached_type_count() > 0);

        factory.invalidate_all();
        assert_eq!(factory.cached_type_count(), 0);

        let fresh = factory.get_or_create_type(FOO, 0).unwrap();
        assert!(!Arc::ptr_eq(&foo, &fresh));
        assert!(Arc::ptr_eq(
            &factory.get_or_create_type(OBJECT, 0).unwrap(),
            factory.object_type()
        ));
    }

    #[test]
    fn concurrent_creation_yields_one_instance() {
        let (_, factory) = factory_with(dac(), CacheOptions::default());
        let factory = Arc::new(factory);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let factory = factory.clone();
                thread::spawn(move || factory.get_or_create_type(COLOR, 0).unwrap())
            })
            .collect();

        let types: Vec<ClrTypeRc> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for ty in &types[1..] {
            assert!(Arc::ptr_eq(&types[0], ty));
        }
    }
}
