//! Access to the memory of the inspected process or dump.
//!
//! This module defines the leaf abstraction every other part of the crate reads through.
//! Whether the bytes come from a live process, a minidump or a core file is not a concern
//! of this crate; implementors of [`DataReader`] provide them.
//!
//! # Key Components
//!
//! - [`DataReader`] - Trait providing raw reads plus pointer size and architecture
//! - [`MemoryRange`] - Half-open address range used for segments, generations and native heaps
//! - [`Architecture`] - Processor architecture of the target
//! - [`parser::Parser`] - Bounds-checked cursor over signature blobs
//!
//! # Failure Model
//!
//! A read that fails, or that returns fewer bytes than requested, is never an error in this
//! crate. The typed helpers on [`DataReader`] return `None` and the caller treats the data as
//! absent.

pub mod parser;

use std::fmt;

use crate::utils::{read_le, read_pointer_at};

/// Processor architecture of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Architecture {
    /// 32-bit x86
    X86,
    /// 64-bit x86
    X64,
    /// 32-bit ARM
    Arm,
    /// 64-bit ARM
    Arm64,
    /// Architecture could not be determined
    Unknown,
}

/// Raw memory access to the target.
///
/// Implementations must be safe to call from multiple threads; the heap and type system
/// issue reads concurrently when callers do.
///
/// # Examples
///
/// ```rust
/// use clrscope::{Architecture, DataReader};
///
/// struct Flat(Vec<u8>);
///
/// impl DataReader for Flat {
///     fn read(&self, address: u64, buffer: &mut [u8]) -> usize {
///         let start = address as usize;
///         if start >= self.0.len() {
///             return 0;
///         }
///         let len = buffer.len().min(self.0.len() - start);
///         buffer[..len].copy_from_slice(&self.0[start..start + len]);
///         len
///     }
///     fn pointer_size(&self) -> usize { 8 }
///     fn architecture(&self) -> Architecture { Architecture::X64 }
/// }
///
/// let reader = Flat(vec![0x2a, 0, 0, 0, 0, 0, 0, 0]);
/// assert_eq!(reader.read_pointer(0), Some(0x2a));
/// assert_eq!(reader.read_pointer(4), None);
/// ```
pub trait DataReader: Send + Sync {
    /// Reads up to `buffer.len()` bytes at `address` and returns how many were read.
    fn read(&self, address: u64, buffer: &mut [u8]) -> usize;

    /// Size of a pointer in the target, 4 or 8
    fn pointer_size(&self) -> usize;

    /// Architecture of the target
    fn architecture(&self) -> Architecture;

    /// Reads a full pointer, `None` on a short read.
    fn read_pointer(&self, address: u64) -> Option<u64> {
        let mut buffer = [0_u8; 8];
        let size = self.pointer_size().min(8);
        if self.read(address, &mut buffer[..size]) != size {
            return None;
        }

        let mut offset = 0;
        read_pointer_at(&buffer, &mut offset, size).ok()
    }

    /// Reads a little-endian `u32`, `None` on a short read.
    fn read_u32(&self, address: u64) -> Option<u32> {
        let mut buffer = [0_u8; 4];
        if self.read(address, &mut buffer) != buffer.len() {
            return None;
        }
        read_le::<u32>(&buffer).ok()
    }

    /// Reads a little-endian `i32`, `None` on a short read.
    fn read_i32(&self, address: u64) -> Option<i32> {
        self.read_u32(address).map(|value| value as i32)
    }

    /// Reads a little-endian `u64`, `None` on a short read.
    fn read_u64(&self, address: u64) -> Option<u64> {
        let mut buffer = [0_u8; 8];
        if self.read(address, &mut buffer) != buffer.len() {
            return None;
        }
        read_le::<u64>(&buffer).ok()
    }

    /// Reads a pointer-sized signed value (the GC descriptor series count is stored this way).
    fn read_isize(&self, address: u64) -> Option<i64> {
        match self.pointer_size() {
            4 => self.read_i32(address).map(i64::from),
            _ => self.read_u64(address).map(|value| value as i64),
        }
    }
}

/// A half-open range of target addresses, `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryRange {
    /// First address in the range
    pub start: u64,
    /// First address past the range
    pub end: u64,
}

impl MemoryRange {
    /// Creates a range from its bounds. An inverted pair is clamped to an empty range at `start`.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        MemoryRange {
            start,
            end: end.max(start),
        }
    }

    /// Creates a range from a start address and a length.
    #[must_use]
    pub fn from_length(start: u64, length: u64) -> Self {
        MemoryRange {
            start,
            end: start.saturating_add(length),
        }
    }

    /// Number of bytes covered
    #[must_use]
    pub fn length(&self) -> u64 {
        self.end - self.start
    }

    /// `true` if the range covers no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// `true` if `address` lies within the range
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    /// `true` if `other` lies entirely within this range
    #[must_use]
    pub fn contains_range(&self, other: &MemoryRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// `true` if the two ranges share at least one address
    #[must_use]
    pub fn overlaps(&self, other: &MemoryRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}
