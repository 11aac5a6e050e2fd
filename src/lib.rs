// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # clrscope
//!
//! Reconstructs the managed heap and type system of a .NET runtime from a stopped process
//! or a memory dump. Built in pure Rust, `clrscope` reads raw target memory and talks to the
//! runtime's data access layer through a narrow trait, and from those two sources rebuilds:
//!
//! - **GC heap layout** - subheaps, segments and regions, generation windows, objects
//! - **Type system** - method tables as shared [`ClrType`] handles, signatures, GC pointer maps
//! - **Heap verification** - per-object corruption diagnosis, in parallel over the whole heap
//! - **Runtime state** - app domains, modules, threads, GC handles, sync blocks
//! - **Native heaps** - loader, stub, code and GC bookkeeping memory owned by the runtime
//!
//! ## Quick Start
//!
//! The caller provides two things: a [`DataReader`] over target memory, and an
//! implementation of [`dac::SosDac`] answering structured queries. Everything else is built
//! on top of them.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use clrscope::prelude::*;
//!
//! let runtime = ClrRuntime::new(dac, reader, RuntimeInfo::new(ClrFlavor::Core, 8), CacheOptions::default())?;
//!
//! let heap = runtime.heap();
//! for segment in heap.segments() {
//!     println!("{} {}", segment.kind, segment.object_range);
//! }
//!
//! for corruption in heap.verify_heap() {
//!     println!("{:#x}: {}", corruption.object, corruption.kind);
//! }
//! # Ok::<(), clrscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`runtime`] - The session: initialization, flushing, domains, threads, handles
//! - [`heap`] - GC heap layout, object walking and verification
//! - [`typesystem`] - Method tables to types, signatures, GC pointer maps
//! - [`nameparser`] - Runtime type names to C#-like display names
//! - [`nativeheap`] - Loader, stub and code heap traversal
//! - [`dac`] - The structured query gateway trait and its records
//! - [`target`] - Raw memory access
//!
//! ## Caching and Flushing
//!
//! Everything read from the target is cached until [`ClrRuntime::flush`]. Addresses in the
//! target are only stable while it is stopped, so the caller flushes after every resume.
//! What is cached between flushes is controlled by [`CacheOptions`].
//!
//! ## Error Handling
//!
//! Memory in a dump may be missing, torn or corrupted. Failed reads never surface as
//! errors: walks end early and lookups return `None`. Corruption found while verifying is
//! reported as data. [`Error`] is only returned for a gateway that cannot be used at all,
//! and for invalid arguments.
//!
//! ```rust,ignore
//! use clrscope::{ClrRuntime, Error};
//!
//! match ClrRuntime::new(dac, reader, info, options) {
//!     Ok(runtime) => println!("{} threads", runtime.threads().len()),
//!     Err(Error::ProtocolVersionMismatch { actual, .. }) => println!("unsupported version {actual}"),
//!     Err(Error::NotInitialized(reason)) => println!("runtime not ready: {reason}"),
//!     Err(e) => println!("other error: {e}"),
//! }
//! ```
//!
//! ## Logging
//!
//! The crate emits [`tracing`] events and installs no subscriber. Lifecycle events are
//! `debug`, per-element walks `trace`, truncated walks `warn`.
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,ignore
/// use clrscope::prelude::*;
///
/// let runtime = ClrRuntime::new(dac, reader, info, CacheOptions::default())?;
/// let heap: Arc<ClrHeap> = runtime.heap();
/// # Ok::<(), clrscope::Error>(())
/// ```
pub mod prelude;

/// Cache policy and runtime identification
pub mod config;

/// The structured query gateway to the runtime's data access layer.
///
/// Implementors adapt their transport to [`dac::SosDac`]. Every method reports failure as
/// "no data" rather than as an error.
pub mod dac;

/// Raw memory access to the target.
///
/// # Key Types
///
/// - [`DataReader`] - Reads bytes and pointers from the target
/// - [`MemoryRange`] - Half-open address range used throughout the crate
/// - [`Parser`] - Cursor over a byte buffer, used for signatures
pub mod target;

/// Reconstruction of the GC heap.
///
/// # Key Types
///
/// - [`heap::ClrHeap`] - Segments, objects, references, sync blocks and verification
/// - [`heap::ClrSegment`] - A segment or region with its generation windows
/// - [`heap::ObjectCorruption`] - One problem found on an object
///
/// # Examples
///
/// ```rust,ignore
/// let heap = runtime.heap();
/// for object in heap.enumerate_all_objects().filter(|o| !o.is_free()) {
///     if let Some(problem) = heap.is_object_corrupted(object.address) {
///         println!("{:#x}: {}", problem.object, problem.kind);
///     }
/// }
/// ```
pub mod heap;

/// Types of the target runtime, reconstructed from method tables and signatures.
pub mod typesystem;

/// Conversion of runtime type names to display names.
///
/// ```rust
/// use clrscope::parse_name;
///
/// assert_eq!(
///     parse_name("System.Collections.Generic.List`1[[System.Int32, mscorlib]]"),
///     "System.Collections.Generic.List<System.Int32>"
/// );
/// ```
pub mod nameparser;

/// Native memory owned by the runtime: loader, stub, code and GC bookkeeping heaps.
pub mod nativeheap;

/// The runtime session, app domains, modules, threads and handles.
pub mod runtime;

/// Shared utilities.
pub mod utils;

/// `clrscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `clrscope` Error type
///
/// See [`error::Error`] for the variants. Read failures on target memory are never
/// reported through this type.
pub use error::Error;

/// Entry point of the crate, see [`runtime::ClrRuntime`].
pub use runtime::ClrRuntime;

/// The managed heap, see [`heap::ClrHeap`].
pub use heap::ClrHeap;

/// A type of the target runtime, see [`typesystem::ClrType`].
pub use typesystem::{ClrType, ClrTypeRc};

/// Raw memory access, see [`target`].
pub use target::{parser::Parser, Architecture, DataReader, MemoryRange};

/// Cache policy and runtime identification, see [`config`].
pub use config::{CacheOptions, ClrFlavor, RuntimeInfo};

/// Cooperative cancellation of walks, see [`utils::CancellationToken`].
pub use utils::CancellationToken;

/// Runtime type name to display name, see [`nameparser::parse_name`].
pub use nameparser::parse_name;
