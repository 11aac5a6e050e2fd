//! Decoding of the per-type GC pointer map.
//!
//! The runtime stores a type's reference layout in the words immediately preceding its
//! method table. The word right before the method table is a signed series count:
//!
//! - **positive**: that many `(size, offset)` series follow, each describing one run of
//!   contiguous reference slots. Sizes are stored biased by the base size so that one
//!   series can also describe the variable-length tail of a reference array.
//! - **negative**: the type is an array of value types with embedded references. One start
//!   offset is followed by `|count|` `(pointer count, skip)` pairs packed into half words,
//!   repeated for every element until the end of the object.
//!
//! [`GcDesc`] keeps the raw bytes as read from the target and decodes them on every walk.

use tracing::warn;

use crate::{
    target::DataReader,
    utils::{read_le_at, read_pointer_at},
};

/// Upper bound on the number of series a sane type can carry
const MAX_SERIES: u64 = 0x0001_0000;

/// A type's GC pointer map, as the byte image of the words preceding its method table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcDesc {
    data: Vec<u8>,
    pointer_size: usize,
}

impl GcDesc {
    /// Wrap a raw descriptor image. `data` must end with the series-count word.
    #[must_use]
    pub fn new(data: Vec<u8>, pointer_size: usize) -> Self {
        GcDesc { data, pointer_size }
    }

    /// Read the descriptor stored in front of `method_table`.
    ///
    /// Any read failure yields an empty descriptor.
    pub fn read(reader: &dyn DataReader, method_table: u64) -> Self {
        let pointer_size = reader.pointer_size();
        let ptr = pointer_size as u64;

        let Some(series) = method_table
            .checked_sub(ptr)
            .and_then(|address| reader.read_isize(address))
        else {
            warn!(method_table, "could not read gc descriptor series count");
            return GcDesc::default();
        };

        let entries = series.unsigned_abs();
        if entries == 0 || entries > MAX_SERIES {
            warn!(method_table, series, "implausible gc descriptor series count");
            return GcDesc::default();
        }

        let slots = 1 + 2 * entries;
        let Some(start) = method_table.checked_sub(slots * ptr) else {
            return GcDesc::default();
        };

        let mut data = vec![0_u8; (slots * ptr) as usize];
        if reader.read(start, &mut data) != data.len() {
            warn!(method_table, "short read of gc descriptor");
            return GcDesc::default();
        }

        GcDesc { data, pointer_size }
    }

    /// True if no pointer map is available
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() < self.pointer_size || self.pointer_size == 0
    }

    /// The raw descriptor bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The signed series count, `0` for an empty descriptor
    #[must_use]
    pub fn num_series(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        self.signed_at(self.data.len() - self.pointer_size)
            .unwrap_or(0)
    }

    /// Enumerate the non-null references of an object.
    ///
    /// `object` holds the object's bytes starting at its method table pointer and `size` is
    /// the object's full size. Returns `(reference, offset)` pairs, where `offset` is
    /// relative to the object start. Slots beyond the supplied bytes are not reported.
    #[must_use]
    pub fn walk_object(&self, object: &[u8], size: usize) -> Vec<(u64, usize)> {
        let mut references = Vec::new();

        let series = self.num_series();
        if series == 0 {
            return references;
        }

        let ptr = self.pointer_size;
        let Some(highest) = self.data.len().checked_sub(ptr * 3) else {
            return references;
        };

        if series > 0 {
            let span = ptr * 2 * (series as usize - 1);
            let Some(lowest) = highest.checked_sub(span) else {
                return references;
            };

            let mut current = highest;
            loop {
                let (Some(series_size), Some(offset)) =
                    (self.signed_at(current), self.pointer_at(current + ptr))
                else {
                    break;
                };

                let mut slot = offset as i64;
                let stop = slot + series_size + size as i64;
                while slot < stop {
                    if !self.push_reference(object, slot as usize, &mut references) {
                        break;
                    }
                    slot += ptr as i64;
                }

                if current < lowest + ptr * 2 {
                    break;
                }
                current -= ptr * 2;
            }
        } else {
            let Some(mut slot) = self.pointer_at(highest + ptr).map(|offset| offset as usize) else {
                return references;
            };

            let end = size.saturating_sub(ptr);
            while slot < end {
                let before = slot;
                for index in 0..series.unsigned_abs() as usize {
                    let Some(entry) = highest.checked_sub(index * ptr) else {
                        return references;
                    };

                    let (Some(pointers), Some(skip)) =
                        (self.half_word_at(entry), self.half_word_at(entry + ptr / 2))
                    else {
                        return references;
                    };

                    for _ in 0..pointers {
                        if !self.push_reference(object, slot, &mut references) {
                            return references;
                        }
                        slot += ptr;
                    }
                    slot += skip as usize;
                }

                if slot == before {
                    break;
                }
            }
        }

        references
    }

    fn push_reference(&self, object: &[u8], slot: usize, references: &mut Vec<(u64, usize)>) -> bool {
        let mut offset = slot;
        match read_pointer_at(object, &mut offset, self.pointer_size) {
            Ok(reference) => {
                if reference != 0 {
                    references.push((reference, slot));
                }
                true
            }
            Err(_) => false,
        }
    }

    fn pointer_at(&self, offset: usize) -> Option<u64> {
        let mut offset = offset;
        read_pointer_at(&self.data, &mut offset, self.pointer_size).ok()
    }

    fn signed_at(&self, offset: usize) -> Option<i64> {
        let value = self.pointer_at(offset)?;
        Some(if self.pointer_size == 4 {
            i64::from(value as u32 as i32)
        } else {
            value as i64
        })
    }

    fn half_word_at(&self, offset: usize) -> Option<u32> {
        let mut offset = offset;
        if self.pointer_size == 4 {
            read_le_at::<u16>(&self.data, &mut offset)
                .ok()
                .map(u32::from)
        } else {
            read_le_at::<u32>(&self.data, &mut offset).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::MockReader;

    fn words64(words: &[i64]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn object64(words: &[u64]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn single_field_series() {
        // One reference at offset 8 in a 24-byte object
        let desc = GcDesc::new(words64(&[8 - 24, 8, 1]), 8);
        assert_eq!(desc.num_series(), 1);

        let object = object64(&[0x1000, 0xdead_0000, 0x42]);
        assert_eq!(desc.walk_object(&object, 24), vec![(0xdead_0000, 8)]);
    }

    #[test]
    fn null_references_are_skipped() {
        let desc = GcDesc::new(words64(&[8 - 24, 8, 1]), 8);
        let object = object64(&[0x1000, 0, 0x42]);
        assert!(desc.walk_object(&object, 24).is_empty());
    }

    #[test]
    fn two_series_walk_highest_first() {
        // Series at offset 8 (one slot) and offset 24 (two slots) in a 48-byte object.
        // The series closest to the method table is the first one in memory order.
        let desc = GcDesc::new(words64(&[16 - 48, 24, 8 - 48, 8, 2]), 8);
        let object = object64(&[0x1000, 0xa, 0x0, 0xb, 0xc, 0x0]);
        assert_eq!(
            desc.walk_object(&object, 48),
            vec![(0xa, 8), (0xb, 24), (0xc, 32)]
        );
    }

    #[test]
    fn reference_array_series_uses_object_size() {
        // object[] of three elements: base size 24, elements start at 16
        let desc = GcDesc::new(words64(&[-24, 16, 1]), 8);
        let object = object64(&[0x1000, 3, 0xa, 0xb, 0xc]);
        let size = 24 + 3 * 8;
        assert_eq!(
            desc.walk_object(&object, size),
            vec![(0xa, 16), (0xb, 24), (0xc, 32)]
        );
    }

    #[test]
    fn value_class_array() {
        // Array of struct { object o; long l; }, two elements, data starts at 16.
        // Pair word: low half = pointer count 1, high half = skip 8.
        let pair = 1_i64 | (8_i64 << 32);
        let desc = GcDesc::new(words64(&[pair, 16, -1]), 8);
        assert_eq!(desc.num_series(), -1);

        let object = object64(&[0x1000, 2, 0xa, 7, 0xb, 9, 0]);
        let size = 24 + 2 * 16;
        assert_eq!(desc.walk_object(&object, size), vec![(0xa, 16), (0xb, 32)]);
    }

    #[test]
    fn value_class_walk_stops_without_progress() {
        let desc = GcDesc::new(words64(&[0, 16, -1]), 8);
        let object = object64(&[0x1000, 2, 0xa, 7]);
        assert!(desc.walk_object(&object, 32).is_empty());
    }

    #[test]
    fn pointer_size_four() {
        let words: Vec<u8> = [4_i32 - 12, 4, 1]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let desc = GcDesc::new(words, 4);
        let object: Vec<u8> = [0x1000_u32, 0xbeef, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        assert_eq!(desc.walk_object(&object, 12), vec![(0xbeef, 4)]);
    }

    #[test]
    fn truncated_object_stops_walk() {
        let desc = GcDesc::new(words64(&[-24, 16, 1]), 8);
        let object = object64(&[0x1000, 3, 0xa]);
        assert_eq!(desc.walk_object(&object, 48), vec![(0xa, 16)]);
    }

    #[test]
    fn read_from_target() {
        let reader = MockReader::new(8);
        let mt = 0x10_0000_u64;
        reader.write(mt - 24, &words64(&[-16, 8, 1]));

        let desc = GcDesc::read(&reader, mt);
        assert_eq!(desc.num_series(), 1);
        assert_eq!(desc.data().len(), 24);
    }

    #[test]
    fn read_failure_is_empty() {
        let reader = MockReader::new(8);
        let mt = 0x10_0000_u64;
        assert!(GcDesc::read(&reader, mt).is_empty());

        // Count readable but the series are not
        reader.write(mt - 8, &words64(&[2]));
        assert!(GcDesc::read(&reader, mt).is_empty());
    }
}
