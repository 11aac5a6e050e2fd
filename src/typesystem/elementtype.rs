use strum::{Display, EnumIter};

#[allow(non_snake_case, dead_code, missing_docs)]
/// Element-type bytes of the runtime's type-signature grammar
pub mod ELEMENT_TYPE {
    //Marks end of a list
    pub const END: u8 = 0x00;
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    // Followed by type
    pub const PTR: u8 = 0x0f;
    // Followed by type
    pub const BYREF: u8 = 0x10;
    // Followed by TypeDef or TypeRef token
    pub const VALUETYPE: u8 = 0x11;
    // Followed by TypeDef or TypeRef token
    pub const CLASS: u8 = 0x12;
    // Generic parameter of a type, followed by its index
    pub const VAR: u8 = 0x13;
    // type rank boundsCount bound1 … loCount lo1 …
    pub const ARRAY: u8 = 0x14;
    // Generic instantiation: CLASS|VALUETYPE token count type-1 ... type-n
    pub const GENERICINST: u8 = 0x15;
    pub const TYPEDBYREF: u8 = 0x16;
    // System.IntPtr
    pub const I: u8 = 0x18;
    // System.UIntPtr
    pub const U: u8 = 0x19;
    // Followed by full method signature
    pub const FNPTR: u8 = 0x1b;
    // System.Object
    pub const OBJECT: u8 = 0x1c;
    // Single-dim array with 0 lower bound
    pub const SZARRAY: u8 = 0x1d;
    // Generic parameter of a method, followed by its index
    pub const MVAR: u8 = 0x1e;
    // Required modifier : followed by a TypeDef or TypeRef token
    pub const CMOD_REQD: u8 = 0x1f;
    // Optional modifier : followed by a TypeDef or TypeRef token
    pub const CMOD_OPT: u8 = 0x20;
    // Runtime-internal: followed by a pointer-sized method table
    pub const INTERNAL: u8 = 0x21;
    // Sentinel for vararg method signature
    pub const SENTINEL: u8 = 0x41;
    // Denotes a local variable that points at a pinned object
    pub const PINNED: u8 = 0x45;
}

/// Method signature calling-convention flag marking a generic method
pub(crate) const SIG_GENERIC: u8 = 0x10;

/// The runtime's classification of a type's storage.
///
/// The discriminants are the signature element-type bytes, so a code read from an array
/// instance or a signature converts with [`ClrElementType::from_code`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[repr(u8)]
pub enum ClrElementType {
    Unknown = 0x00,
    Void = ELEMENT_TYPE::VOID,
    Boolean = ELEMENT_TYPE::BOOLEAN,
    Char = ELEMENT_TYPE::CHAR,
    Int8 = ELEMENT_TYPE::I1,
    UInt8 = ELEMENT_TYPE::U1,
    Int16 = ELEMENT_TYPE::I2,
    UInt16 = ELEMENT_TYPE::U2,
    Int32 = ELEMENT_TYPE::I4,
    UInt32 = ELEMENT_TYPE::U4,
    Int64 = ELEMENT_TYPE::I8,
    UInt64 = ELEMENT_TYPE::U8,
    Float = ELEMENT_TYPE::R4,
    Double = ELEMENT_TYPE::R8,
    String = ELEMENT_TYPE::STRING,
    Pointer = ELEMENT_TYPE::PTR,
    Struct = ELEMENT_TYPE::VALUETYPE,
    Class = ELEMENT_TYPE::CLASS,
    Var = ELEMENT_TYPE::VAR,
    Array = ELEMENT_TYPE::ARRAY,
    GenericInstantiation = ELEMENT_TYPE::GENERICINST,
    NativeInt = ELEMENT_TYPE::I,
    NativeUInt = ELEMENT_TYPE::U,
    FunctionPointer = ELEMENT_TYPE::FNPTR,
    Object = ELEMENT_TYPE::OBJECT,
    SZArray = ELEMENT_TYPE::SZARRAY,
    MVar = ELEMENT_TYPE::MVAR,
}

/// Number of slots in the basic-type table, indexed by element-type code
pub(crate) const BASIC_TYPE_SLOTS: usize = 0x20;

impl ClrElementType {
    /// Convert a raw element-type code. Unrecognized codes map to [`ClrElementType::Unknown`].
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        let Ok(byte) = u8::try_from(code) else {
            return ClrElementType::Unknown;
        };

        match byte {
            ELEMENT_TYPE::VOID => ClrElementType::Void,
            ELEMENT_TYPE::BOOLEAN => ClrElementType::Boolean,
            ELEMENT_TYPE::CHAR => ClrElementType::Char,
            ELEMENT_TYPE::I1 => ClrElementType::Int8,
            ELEMENT_TYPE::U1 => ClrElementType::UInt8,
            ELEMENT_TYPE::I2 => ClrElementType::Int16,
            ELEMENT_TYPE::U2 => ClrElementType::UInt16,
            ELEMENT_TYPE::I4 => ClrElementType::Int32,
            ELEMENT_TYPE::U4 => ClrElementType::UInt32,
            ELEMENT_TYPE::I8 => ClrElementType::Int64,
            ELEMENT_TYPE::U8 => ClrElementType::UInt64,
            ELEMENT_TYPE::R4 => ClrElementType::Float,
            ELEMENT_TYPE::R8 => ClrElementType::Double,
            ELEMENT_TYPE::STRING => ClrElementType::String,
            ELEMENT_TYPE::PTR => ClrElementType::Pointer,
            ELEMENT_TYPE::VALUETYPE => ClrElementType::Struct,
            ELEMENT_TYPE::CLASS => ClrElementType::Class,
            ELEMENT_TYPE::VAR => ClrElementType::Var,
            ELEMENT_TYPE::ARRAY => ClrElementType::Array,
            ELEMENT_TYPE::GENERICINST => ClrElementType::GenericInstantiation,
            ELEMENT_TYPE::I => ClrElementType::NativeInt,
            ELEMENT_TYPE::U => ClrElementType::NativeUInt,
            ELEMENT_TYPE::FNPTR => ClrElementType::FunctionPointer,
            ELEMENT_TYPE::OBJECT => ClrElementType::Object,
            ELEMENT_TYPE::SZARRAY => ClrElementType::SZArray,
            ELEMENT_TYPE::MVAR => ClrElementType::MVar,
            _ => ClrElementType::Unknown,
        }
    }

    /// The raw element-type code
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// True for the fixed-size primitives, including the native-sized integers
    #[must_use]
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            ClrElementType::Boolean
                | ClrElementType::Char
                | ClrElementType::Int8
                | ClrElementType::UInt8
                | ClrElementType::Int16
                | ClrElementType::UInt16
                | ClrElementType::Int32
                | ClrElementType::UInt32
                | ClrElementType::Int64
                | ClrElementType::UInt64
                | ClrElementType::Float
                | ClrElementType::Double
                | ClrElementType::NativeInt
                | ClrElementType::NativeUInt
        )
    }

    /// True for element types that are stored inline rather than by reference
    #[must_use]
    pub fn is_value_type(self) -> bool {
        self.is_primitive() || self == ClrElementType::Struct
    }

    /// True for element types whose values are GC references
    #[must_use]
    pub fn is_object_reference(self) -> bool {
        matches!(
            self,
            ClrElementType::String
                | ClrElementType::Class
                | ClrElementType::Array
                | ClrElementType::SZArray
                | ClrElementType::Object
        )
    }

    /// Map a well-known base library type name to its element type.
    ///
    /// `System.Enum` maps to `Int32`, the default underlying type of an enumeration.
    #[must_use]
    pub fn from_well_known_name(name: &str) -> Option<Self> {
        let element_type = match name {
            "System.Int32" | "System.Enum" => ClrElementType::Int32,
            "System.Int16" => ClrElementType::Int16,
            "System.Int64" => ClrElementType::Int64,
            "System.IntPtr" => ClrElementType::NativeInt,
            "System.UInt16" => ClrElementType::UInt16,
            "System.UInt32" => ClrElementType::UInt32,
            "System.UInt64" => ClrElementType::UInt64,
            "System.UIntPtr" => ClrElementType::NativeUInt,
            "System.Boolean" => ClrElementType::Boolean,
            "System.Single" => ClrElementType::Float,
            "System.Double" => ClrElementType::Double,
            "System.Byte" => ClrElementType::UInt8,
            "System.Char" => ClrElementType::Char,
            "System.SByte" => ClrElementType::Int8,
            "System.Void" => ClrElementType::Void,
            _ => return None,
        };
        Some(element_type)
    }

    /// Name used for a synthesized primitive of this element type
    #[must_use]
    pub fn primitive_name(self) -> &'static str {
        match self {
            ClrElementType::Void => "System.Void",
            ClrElementType::Boolean => "System.Boolean",
            ClrElementType::Char => "System.Char",
            ClrElementType::Int8 => "System.SByte",
            ClrElementType::UInt8 => "System.Byte",
            ClrElementType::Int16 => "System.Int16",
            ClrElementType::UInt16 => "System.UInt16",
            ClrElementType::Int32 => "System.Int32",
            ClrElementType::UInt32 => "System.UInt32",
            ClrElementType::Int64 => "System.Int64",
            ClrElementType::UInt64 => "System.UInt64",
            ClrElementType::Float => "System.Single",
            ClrElementType::Double => "System.Double",
            ClrElementType::NativeInt => "System.IntPtr",
            ClrElementType::NativeUInt => "System.UIntPtr",
            ClrElementType::String => "System.String",
            ClrElementType::Object | ClrElementType::Class => "System.Object",
            ClrElementType::Struct => "System.ValueType",
            _ => "<unknown>",
        }
    }
}
