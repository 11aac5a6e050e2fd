//! Little-endian decoding of primitive values from byte buffers.
//!
//! Every structure read out of the target (object headers, GC descriptors, mark array words,
//! signature blobs) is little-endian. This module provides the single bounds-checked primitive
//! that the rest of the crate builds on.
//!
//! # Key Components
//!
//! - [`crate::utils::io::MemIO`] - Trait for fixed-size values that can be decoded from raw bytes
//! - [`crate::utils::io::read_le_at`] - Read a value at an offset and advance the offset
//! - [`crate::utils::io::read_le`] - Read a value from the start of a buffer

use crate::{Error::OutOfBounds, Result};

/// Trait for fixed-size primitive values which can be decoded from target memory.
pub trait MemIO: Sized {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
}

macro_rules! impl_mem_io {
    ($($ty:ty),*) => {
        $(
            impl MemIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_mem_io!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Safely reads a value of type `T` in little-endian byte order from the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le<T: MemIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at a specific offset.
///
/// The offset is advanced by the size of `T` on success and left untouched on failure.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at<T: MemIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Reads a pointer-sized little-endian value, widening 4-byte pointers to `u64`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes, or
/// [`crate::Error::NotSupported`] for pointer sizes other than 4 or 8.
pub fn read_pointer_at(data: &[u8], offset: &mut usize, pointer_size: usize) -> Result<u64> {
    match pointer_size {
        8 => read_le_at::<u64>(data, offset),
        4 => Ok(u64::from(read_le_at::<u32>(data, offset)?)),
        _ => Err(crate::Error::NotSupported),
    }
}
