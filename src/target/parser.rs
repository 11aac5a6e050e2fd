//! Bounds-checked cursor over signature blobs.
//!
//! Signatures arrive as short byte strings read out of target memory, so every read here
//! checks availability first. A truncated signature yields [`crate::Error::OutOfBounds`]
//! and a reserved encoding [`crate::Error::Malformed`]; the signature decoder turns both
//! into an unresolved type.
//!
//! ```rust
//! use clrscope::Parser;
//!
//! // SZARRAY of I4
//! let signature = [0x1D, 0x08];
//! let mut parser = Parser::new(&signature);
//!
//! assert_eq!(parser.read_le::<u8>()?, 0x1D);
//! assert_eq!(parser.peek_byte()?, 0x08);
//! assert_eq!(parser.pos(), 1);
//! # Ok::<(), clrscope::Error>(())
//! ```

use crate::{
    utils::{io::MemIO, read_le_at},
    Result,
};

/// A cursor over a byte slice, used to decode signatures.
///
/// The cursor only ever moves forward by the number of bytes a successful read consumed.
/// A failed read leaves the position untouched, which is what lets signature decoding keep
/// exact accounting of consumed bytes on every branch.
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`crate::target::parser::Parser`] from a byte slice.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use clrscope::Parser;
    /// let data = [0x01, 0x02, 0x03, 0x04];
    /// let parser = Parser::new(&data);
    /// assert_eq!(parser.len(), 4);
    /// ```
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the parser has no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if there is more data available to parse.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Move the position forward by one byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if advancing would exceed the data length.
    pub fn advance(&mut self) -> Result<()> {
        self.advance_by(1)
    }

    /// Move the position forward by the specified number of bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if advancing by step would exceed the data length.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        if self.position + step > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position += step;
        Ok(())
    }

    /// Get the current position of the parser within the data buffer.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Peek at the next byte without advancing the position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if position is at or beyond the data length.
    pub fn peek_byte(&self) -> Result<u8> {
        if self.position >= self.data.len() {
            return Err(out_of_bounds_error!());
        }
        Ok(self.data[self.position])
    }

    /// Read a type `T` from the current position in little-endian format and advance the position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length.
    pub fn read_le<T: MemIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Read a compressed unsigned integer.
    ///
    /// - Values 0-127: 1 byte (0xxxxxxx)
    /// - Values 128-16383: 2 bytes (10xxxxxx xxxxxxxx)
    /// - Values 16384-536870911: 4 bytes (11xxxxxx xxxxxxxx xxxxxxxx xxxxxxxx)
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length or
    /// [`crate::Error::Malformed`] for an invalid lead byte.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use clrscope::Parser;
    ///
    /// let data = [0x80, 0x80];
    /// let mut parser = Parser::new(&data);
    /// assert_eq!(parser.read_compressed_uint()?, 128);
    /// # Ok::<(), clrscope::Error>(())
    /// ```
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let start = self.position;
        let result = self.read_compressed_uint_inner();
        if result.is_err() {
            self.position = start;
        }
        result
    }

    fn read_compressed_uint_inner(&mut self) -> Result<u32> {
        let first_byte = self.read_le::<u8>()?;

        // 1-byte encoding: 0xxxxxxx
        if (first_byte & 0x80) == 0 {
            return Ok(u32::from(first_byte));
        }

        // 2-byte encoding: 10xxxxxx xxxxxxxx
        if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_le::<u8>()?;
            let value = ((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte);
            return Ok(value);
        }

        // 4-byte encoding: 11xxxxxx xxxxxxxx xxxxxxxx xxxxxxxx
        if (first_byte & 0xE0) == 0xC0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            let b3 = u32::from(self.read_le::<u8>()?);
            let value = ((u32::from(first_byte) & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3;
            return Ok(value);
        }

        Err(malformed_error!("Invalid compressed uint - {}", first_byte))
    }

    /// Read a compressed signed integer (used for array lower bounds).
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length or
    /// [`crate::Error::Malformed`] for invalid encoding.
    pub fn read_compressed_int(&mut self) -> Result<i32> {
        let unsigned = self.read_compressed_uint()?;

        #[allow(clippy::cast_possible_wrap)]
        let signed = if (unsigned & 1) == 0 {
            (unsigned >> 1) as i32
        } else {
            -((unsigned >> 1) as i32 + 1)
        };

        Ok(signed)
    }

    /// Read a compressed `TypeDefOrRefOrSpec` token and expand it to a full metadata token.
    ///
    /// | Tag | Table | Token Prefix |
    /// |-----|-------|--------------|
    /// | 0x0 | TypeDef | 0x0200_0000 |
    /// | 0x1 | TypeRef | 0x0100_0000 |
    /// | 0x2 | TypeSpec | 0x1B00_0000 |
    ///
    /// Tag `0x3` is not a valid encoding. The bytes of the token are still consumed so the
    /// caller stays in sync with the rest of the signature.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length or
    /// [`crate::Error::Malformed`] for the reserved tag.
    pub fn read_compressed_token(&mut self) -> Result<u32> {
        let compressed_token = self.read_compressed_uint()?;

        let table: u32 = match compressed_token & 0x3 {
            0x0 => 0x0200_0000, // TypeDef
            0x1 => 0x0100_0000, // TypeRef
            0x2 => 0x1B00_0000, // TypeSpec
            _ => {
                return Err(malformed_error!(
                    "Invalid compressed token - {}",
                    compressed_token
                ))
            }
        };

        Ok(table + (compressed_token >> 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_uint_encodings() {
        let data = [0x03, 0xBF, 0xFF, 0xC0, 0x00, 0x40, 0x00];
        let mut parser = Parser::new(&data);

        assert_eq!(parser.read_compressed_uint().unwrap(), 0x03);
        assert_eq!(parser.read_compressed_uint().unwrap(), 0x3FFF);
        assert_eq!(parser.read_compressed_uint().unwrap(), 0x4000);
        assert!(!parser.has_more_data());
    }

    #[test]
    fn compressed_uint_truncated_keeps_position() {
        let data = [0x01, 0xC0, 0x00];
        let mut parser = Parser::new(&data);

        parser.advance().unwrap();
        assert!(parser.read_compressed_uint().is_err());
        assert_eq!(parser.pos(), 1);
    }

    #[test]
    fn compressed_int_sign() {
        let data = [20, 9];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_compressed_int().unwrap(), 10);
        assert_eq!(parser.read_compressed_int().unwrap(), -5);
    }

    #[test]
    fn compressed_tokens() {
        let data = [0x08, 0x05, 0x0A, 0x07];
        let mut parser = Parser::new(&data);

        assert_eq!(parser.read_compressed_token().unwrap(), 0x0200_0002);
        assert_eq!(parser.read_compressed_token().unwrap(), 0x0100_0001);
        assert_eq!(parser.read_compressed_token().unwrap(), 0x1B00_0002);
        assert!(matches!(
            parser.read_compressed_token(),
            Err(crate::Error::Malformed { .. })
        ));
        // The reserved tag still consumed its byte
        assert_eq!(parser.pos(), 4);
    }

    #[test]
    fn advance_bounds() {
        let data = [0x01, 0x02];
        let mut parser = Parser::new(&data);
        assert!(parser.advance_by(2).is_ok());
        assert!(parser.advance().is_err());
        assert!(parser.peek_byte().is_err());
    }
}
