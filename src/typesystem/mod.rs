//! Reconstruction of the target runtime's type system.
//!
//! Every managed object starts with a pointer to its method table, and the method table
//! is the only durable identity a type has in a memory snapshot. This module turns method
//! table addresses into [`ClrType`] values and caches them per address.
//!
//! # Key Components
//!
//! - [`ClrType`]: A closed set of type variants. Runtime-backed types have a method table;
//!   constructed, primitive and generic-parameter types are synthesized
//! - [`TypeFactory`]: Creates and caches types from method tables, tokens and signatures
//! - [`GcDesc`]: The per-type pointer map used to find an object's references
//! - [`ClrElementType`]: The runtime's storage classification of a type
//!
//! # Type Identity
//!
//! Types are shared as [`ClrTypeRc`] handles. A runtime-backed type is created at most once
//! per method table while caching is enabled, so handle identity and method table identity
//! agree. Base types form an acyclic tree rooted at `System.Object`.
//!
//! # Lazy State
//!
//! Names, element types, GC descriptors and array component types are filled on first
//! use. Gateway and memory reads always happen outside of any lock; racing initializers
//! may both compute a value, and the first one stored wins.
//!
//! # Examples
//!
//! ```rust,ignore
//! let heap = runtime.heap();
//! if let Some(ty) = heap.get_object_type(object) {
//!     println!("{} ({})", ty, ty.element_type());
//! }
//! ```

mod elementtype;
mod factory;
mod gcdesc;
mod signature;

use std::{
    fmt,
    sync::{Arc, Mutex, OnceLock},
};

pub use elementtype::{ClrElementType, ELEMENT_TYPE};
pub use factory::TypeFactory;
pub use gcdesc::GcDesc;

pub(crate) use elementtype::{BASIC_TYPE_SLOTS, SIG_GENERIC};

use crate::{
    config::CacheOptions,
    dac::{MethodTableData, SosDac},
    nameparser::parse_name,
    target::DataReader,
};

/// A reference counted handle to a type
pub type ClrTypeRc = Arc<ClrType>;

/// Bound on base-type chains, guards against cycles in corrupted method tables
pub(crate) const MAX_BASE_DEPTH: usize = 256;

/// State shared by every runtime-backed type created by one factory
pub(crate) struct TypeContext {
    pub(crate) dac: Arc<dyn SosDac>,
    pub(crate) reader: Arc<dyn DataReader>,
    pub(crate) options: CacheOptions,
}

/// Store a computed value into a lazily initialized cell, keeping the first stored value.
fn store_once<T>(cell: &OnceLock<T>, value: T) -> &T {
    cell.get_or_init(|| value)
}

/// Tri-state cache of a type's name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameState {
    /// The gateway has not been asked yet
    NotTried,
    /// The gateway was asked and had no name
    TriedNone,
    /// The gateway returned this name
    TriedSome(String),
}

impl From<Option<String>> for NameState {
    fn from(name: Option<String>) -> Self {
        match name {
            Some(name) => NameState::TriedSome(name),
            None => NameState::TriedNone,
        }
    }
}

/// Roles the runtime assigns to a handful of method tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SystemRole {
    None,
    Object,
    Free,
    String,
    Exception,
}

/// A type backed by a method table in the target
pub struct RuntimeType {
    context: Arc<TypeContext>,
    method_table: u64,
    data: MethodTableData,
    role: SystemRole,
    base_type: Option<ClrTypeRc>,
    component_type: OnceLock<ClrTypeRc>,
    name: Mutex<NameState>,
    gc_desc: OnceLock<GcDesc>,
    element_type: OnceLock<ClrElementType>,
}

impl RuntimeType {
    pub(crate) fn new(
        context: Arc<TypeContext>,
        method_table: u64,
        data: MethodTableData,
        role: SystemRole,
        base_type: Option<ClrTypeRc>,
        name: NameState,
    ) -> Self {
        RuntimeType {
            context,
            method_table,
            data,
            role,
            base_type,
            component_type: OnceLock::new(),
            name: Mutex::new(name),
            gc_desc: OnceLock::new(),
            element_type: OnceLock::new(),
        }
    }

    /// The method table address, with the mark bit cleared
    #[must_use]
    pub fn method_table(&self) -> u64 {
        self.method_table
    }

    /// Raw method table metadata
    #[must_use]
    pub fn data(&self) -> &MethodTableData {
        &self.data
    }

    /// The base type, `None` for `System.Object` and interfaces
    #[must_use]
    pub fn base_type(&self) -> Option<&ClrTypeRc> {
        self.base_type.as_ref()
    }

    pub(crate) fn role(&self) -> SystemRole {
        self.role
    }

    /// The element type of an array, if it has been resolved
    #[must_use]
    pub fn component_type(&self) -> Option<ClrTypeRc> {
        self.component_type.get().cloned()
    }

    /// Records the component type if none was set yet.
    pub(crate) fn fill_component_type(&self, component: ClrTypeRc) {
        let _ = self.component_type.set(component);
    }

    pub(crate) fn has_component_type(&self) -> bool {
        self.component_type.get().is_some()
    }

    /// The demangled type name.
    ///
    /// The name is fetched from the gateway on first use and passed through
    /// [`crate::parse_name`]. It is cached only if the cache policy allows it.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        let state = lock!(self.name).clone();
        match state {
            NameState::TriedSome(name) => Some(name),
            NameState::TriedNone => None,
            NameState::NotTried => {
                let name = self
                    .context
                    .dac
                    .method_table_name(self.method_table)
                    .map(|raw| parse_name(&raw).into_owned());

                if self.context.options.cache_type_names {
                    let mut cached = lock!(self.name);
                    if *cached == NameState::NotTried {
                        *cached = NameState::from(name.clone());
                    }
                }
                name
            }
        }
    }

    /// The GC pointer map, empty for types without references
    #[must_use]
    pub fn gc_desc(&self) -> &GcDesc {
        if let Some(desc) = self.gc_desc.get() {
            return desc;
        }

        let desc = if self.data.contains_pointers {
            GcDesc::read(self.context.reader.as_ref(), self.method_table)
        } else {
            GcDesc::default()
        };
        store_once(&self.gc_desc, desc)
    }

    /// The storage classification of this type
    #[must_use]
    pub fn element_type(&self) -> ClrElementType {
        if let Some(element_type) = self.element_type.get() {
            return *element_type;
        }
        *store_once(&self.element_type, self.compute_element_type())
    }

    fn compute_element_type(&self) -> ClrElementType {
        match self.role {
            SystemRole::Object => return ClrElementType::Object,
            SystemRole::String => return ClrElementType::String,
            _ => {}
        }

        if self.data.component_size != 0 {
            let pointer_size = self.context.reader.pointer_size() as u32;
            return if self.data.base_size > pointer_size * 3 {
                ClrElementType::Array
            } else {
                ClrElementType::SZArray
            };
        }

        let Some(base) = &self.base_type else {
            return ClrElementType::Object;
        };

        if base.as_runtime().is_some_and(|rt| rt.role == SystemRole::Object) {
            return ClrElementType::Class;
        }

        if base.name().as_deref() != Some("System.ValueType") {
            return base.element_type();
        }

        self.name()
            .and_then(|name| ClrElementType::from_well_known_name(&name))
            .unwrap_or(ClrElementType::Struct)
    }
}

impl fmt::Debug for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeType")
            .field("method_table", &format_args!("{:#x}", self.method_table))
            .field("data", &self.data)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// An array or pointer type synthesized from a signature
#[derive(Debug)]
pub struct ConstructedType {
    /// The element or pointee type
    pub component: Option<ClrTypeRc>,
    /// Array rank, or pointer indirection depth
    pub rank: u32,
    /// Pointer rather than array
    pub is_pointer: bool,
    /// Target pointer size
    pub pointer_size: u32,
}

/// A generic type or method parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericParameter {
    /// Position in the declaring generic parameter list
    pub index: u32,
    /// Parameter name, if metadata was available
    pub name: Option<String>,
}

impl GenericParameter {
    /// Create a parameter description
    #[must_use]
    pub fn new(index: u32, name: Option<String>) -> Self {
        GenericParameter { index, name }
    }
}

/// A type as seen in the target runtime
#[derive(Debug)]
pub enum ClrType {
    /// A type backed by a method table
    RuntimeBacked(RuntimeType),
    /// The `System.String` singleton
    StringType(RuntimeType),
    /// An array or pointer type with no method table of its own
    Constructed(ConstructedType),
    /// A primitive type with no method table available
    Primitive {
        /// The primitive's element type
        element_type: ClrElementType,
    },
    /// A placeholder for a generic parameter
    GenericParameter {
        /// Position in the declaring list
        index: u32,
        /// Method rather than type parameter
        is_method: bool,
        /// Name from metadata
        name: Option<String>,
    },
}

impl ClrType {
    /// The runtime-backed part of the type, if any
    #[must_use]
    pub fn as_runtime(&self) -> Option<&RuntimeType> {
        match self {
            ClrType::RuntimeBacked(rt) | ClrType::StringType(rt) => Some(rt),
            _ => None,
        }
    }

    /// The demangled type name
    #[must_use]
    pub fn name(&self) -> Option<String> {
        match self {
            ClrType::RuntimeBacked(rt) | ClrType::StringType(rt) => rt.name(),
            ClrType::Constructed(ct) => {
                let component = ct
                    .component
                    .as_ref()
                    .and_then(|component| component.name())
                    .unwrap_or_else(|| "<unknown>".to_string());
                let rank = ct.rank.max(1) as usize;
                if ct.is_pointer {
                    Some(format!("{component}{}", "*".repeat(rank)))
                } else {
                    Some(format!("{component}[{}]", ",".repeat(rank - 1)))
                }
            }
            ClrType::Primitive { element_type } => Some(element_type.primitive_name().to_string()),
            ClrType::GenericParameter {
                index,
                is_method,
                name,
            } => Some(match name {
                Some(name) => name.clone(),
                None if *is_method => format!("!!{index}"),
                None => format!("!{index}"),
            }),
        }
    }

    /// The storage classification of this type
    #[must_use]
    pub fn element_type(&self) -> ClrElementType {
        match self {
            ClrType::RuntimeBacked(rt) => rt.element_type(),
            ClrType::StringType(_) => ClrElementType::String,
            ClrType::Constructed(ct) => {
                if ct.is_pointer {
                    ClrElementType::Pointer
                } else if ct.rank == 1 {
                    ClrElementType::SZArray
                } else {
                    ClrElementType::Array
                }
            }
            ClrType::Primitive { element_type } => *element_type,
            ClrType::GenericParameter { is_method, .. } => {
                if *is_method {
                    ClrElementType::MVar
                } else {
                    ClrElementType::Var
                }
            }
        }
    }

    /// The GC pointer map, `None` for synthesized types
    #[must_use]
    pub fn gc_desc(&self) -> Option<&GcDesc> {
        self.as_runtime().map(RuntimeType::gc_desc)
    }

    /// Element type of an array or pointee of a pointer
    #[must_use]
    pub fn component_type(&self) -> Option<ClrTypeRc> {
        match self {
            ClrType::RuntimeBacked(rt) => rt.component_type(),
            ClrType::Constructed(ct) => ct.component.clone(),
            _ => None,
        }
    }

    /// The base type of a runtime-backed type
    #[must_use]
    pub fn base_type(&self) -> Option<&ClrTypeRc> {
        self.as_runtime().and_then(RuntimeType::base_type)
    }

    /// Method table address, `0` for synthesized types
    #[must_use]
    pub fn method_table(&self) -> u64 {
        self.as_runtime().map_or(0, RuntimeType::method_table)
    }

    /// Address of the defining module, `0` if unknown
    #[must_use]
    pub fn module(&self) -> u64 {
        self.as_runtime().map_or(0, |rt| rt.data.module)
    }

    /// TypeDef token in the defining module, `0` if unknown
    #[must_use]
    pub fn metadata_token(&self) -> u32 {
        self.as_runtime().map_or(0, |rt| rt.data.token)
    }

    /// Size of an instance without array components
    #[must_use]
    pub fn static_size(&self) -> u32 {
        match self {
            ClrType::RuntimeBacked(rt) | ClrType::StringType(rt) => rt.data.base_size,
            ClrType::Constructed(ct) => ct.pointer_size,
            _ => 0,
        }
    }

    /// Size of one component for arrays and strings, `0` otherwise
    #[must_use]
    pub fn component_size(&self) -> u32 {
        self.as_runtime().map_or(0, |rt| rt.data.component_size)
    }

    /// Whether instances hold GC references
    #[must_use]
    pub fn contains_pointers(&self) -> bool {
        self.as_runtime().is_some_and(|rt| rt.data.contains_pointers)
    }

    /// Array rank, `0` for non-array types
    #[must_use]
    pub fn rank(&self) -> u32 {
        match self {
            ClrType::Constructed(ct) if !ct.is_pointer => ct.rank,
            _ => match self.element_type() {
                ClrElementType::SZArray => 1,
                ClrElementType::Array => self.array_rank_from_size(),
                _ => 0,
            },
        }
    }

    fn array_rank_from_size(&self) -> u32 {
        // A multi-dimensional array header carries one length and one lower bound per dimension
        let Some(rt) = self.as_runtime() else {
            return 0;
        };
        let pointer_size = rt.context.reader.pointer_size() as u32;
        let header = pointer_size * 3;
        rt.data.base_size.saturating_sub(header) / 8
    }

    /// True for arrays of any rank
    #[must_use]
    pub fn is_array(&self) -> bool {
        match self {
            ClrType::RuntimeBacked(rt) => {
                rt.data.component_size != 0 && rt.role != SystemRole::Free
            }
            ClrType::Constructed(ct) => !ct.is_pointer,
            _ => false,
        }
    }

    /// True for pointer types
    #[must_use]
    pub fn is_pointer(&self) -> bool {
        matches!(self, ClrType::Constructed(ct) if ct.is_pointer)
    }

    /// True for `System.String`
    #[must_use]
    pub fn is_string(&self) -> bool {
        matches!(self, ClrType::StringType(_))
    }

    /// True for the free-object filler type
    #[must_use]
    pub fn is_free(&self) -> bool {
        match self {
            ClrType::RuntimeBacked(rt) => rt.role == SystemRole::Free || rt.data.is_free,
            _ => false,
        }
    }

    /// True if this type is or derives from `System.Exception`
    #[must_use]
    pub fn is_exception(&self) -> bool {
        let mut current = self.as_runtime();
        for _ in 0..MAX_BASE_DEPTH {
            let Some(rt) = current else {
                return false;
            };
            if rt.role == SystemRole::Exception {
                return true;
            }
            current = rt.base_type.as_ref().and_then(|base| base.as_runtime());
        }
        false
    }

    /// True if the direct base type is `System.Enum`
    #[must_use]
    pub fn is_enum(&self) -> bool {
        self.base_type()
            .is_some_and(|base| base.name().as_deref() == Some("System.Enum"))
    }

    /// True for primitives and structs
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        self.element_type().is_value_type()
    }

    /// True if values of this type are GC references
    #[must_use]
    pub fn is_object_reference(&self) -> bool {
        self.element_type().is_object_reference()
    }
}

impl fmt::Display for ClrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(&name),
            None => write!(f, "<unknown type {:#x}>", self.method_table()),
        }
    }
}
