//! # clrscope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the clrscope library. Import this module to get quick access to everything needed
//! to open a runtime session and inspect its heap.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all clrscope operations
pub use crate::Error;

/// The result type used throughout clrscope
pub use crate::Result;

/// Shared ownership, as returned by most session accessors
pub use std::sync::Arc;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// The runtime session
pub use crate::runtime::ClrRuntime;

/// Cache policy and runtime identification
pub use crate::config::{CacheOptions, ClrFlavor, RuntimeInfo};

/// Cooperative cancellation of long walks
pub use crate::utils::CancellationToken;

// ================================================================================================
// Target Access
// ================================================================================================

/// The two sources every session is built from
pub use crate::dac::SosDac;
pub use crate::target::{Architecture, DataReader, MemoryRange};

// ================================================================================================
// Heap
// ================================================================================================

/// GC heap layout and objects
pub use crate::heap::{
    ClrHeap, ClrObject, ClrSegment, ClrSubHeap, Generation, SegmentKind, SyncBlock,
};

/// Heap verification results
pub use crate::heap::{ObjectCorruption, ObjectCorruptionKind};

// ================================================================================================
// Type System
// ================================================================================================

/// Types and their factory
pub use crate::typesystem::{ClrElementType, ClrType, ClrTypeRc, GcDesc, TypeFactory};

/// Display names from runtime type names
pub use crate::nameparser::parse_name;

// ================================================================================================
// Runtime State
// ================================================================================================

/// Domains, modules, threads, handles and code managers
pub use crate::runtime::{
    ClrAppDomain, ClrHandle, ClrHandleKind, ClrJitManager, ClrModule, ClrThread, CodeKind,
};

/// Native heaps owned by the runtime
pub use crate::nativeheap::{ClrNativeHeapInfo, ClrNativeHeapState, NativeHeapKind};
