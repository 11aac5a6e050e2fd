//! Cache and session configuration
//!
//! This module provides the knobs that decide how much of the target's state is memoized
//! between queries. Everything memoized here is thrown away on [`crate::ClrRuntime::flush`],
//! the options only control what is kept *between* flushes.

/// Runtime flavor of the target process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ClrFlavor {
    /// .NET Core, .NET 5 and later
    Core,
    /// .NET Framework (desktop CLR)
    Desktop,
}

/// Identification of the runtime the data access layer was loaded for
///
/// A handful of layout decisions (the loader heap vtable fixup, the name of the base class
/// library) depend on which runtime produced the target. A major version of `0` means the
/// version could not be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// Flavor of the runtime
    pub flavor: ClrFlavor,
    /// Major version, `0` when unknown
    pub major: u32,
}

impl RuntimeInfo {
    /// Creates a new [`RuntimeInfo`]
    #[must_use]
    pub fn new(flavor: ClrFlavor, major: u32) -> Self {
        RuntimeInfo { flavor, major }
    }

    /// Name of the module which holds `System.Object`, as reported by the runtime
    #[must_use]
    pub fn base_class_library_name(&self) -> &'static str {
        match self.flavor {
            ClrFlavor::Core => "SYSTEM.PRIVATE.CORELIB",
            ClrFlavor::Desktop => "MSCORLIB",
        }
    }
}

/// Configuration for the caches built on top of the query gateway
///
/// Basic and system types (Object, String, Free, Exception and the primitive table) are
/// always cached regardless of these settings, since every other lookup depends on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct CacheOptions {
    /// Keep every materialized type keyed by its method table
    pub cache_types: bool,

    /// Keep the demangled display name of a type once it was requested
    pub cache_type_names: bool,

    /// Memoize which method table addresses were successfully validated
    pub cache_method_table_validity: bool,

    /// Upper bound for the number of corruption entries a single object verification may report
    pub max_verify_budget: usize,

    /// Hard ceiling on managed threads walked, applied on top of the reported thread count
    pub max_thread_count: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_types: true,
            cache_type_names: true,
            cache_method_table_validity: true,
            max_verify_budget: 64,
            max_thread_count: 1 << 16,
        }
    }
}

impl CacheOptions {
    /// Keeps nothing beyond the always-cached system types
    ///
    /// Useful against live targets that are resumed often, where most cached entries would be
    /// flushed before they are hit a second time.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            cache_types: false,
            cache_type_names: false,
            cache_method_table_validity: false,
            ..Self::default()
        }
    }

    /// Caches everything, the default
    #[must_use]
    pub fn full() -> Self {
        Self::default()
    }
}
