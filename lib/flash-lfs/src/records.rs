// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-flash record formats for the object store: key filters, index
//! records, and index anchors.

use flash_map::CACHE_BLOCK_SIZE;
use flash_volume::header::MAX_MAPPABLE_DATA_BYTES;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Keys are 8-bit; there can be at most this many distinct objects per
/// parent.
pub const MAX_KEYS: usize = 0x100;

/// Object sizes are 8-bit, nonzero, in multiples of `SIZE_UNIT`.
pub const SIZE_SHIFT: u32 = 4;
pub const SIZE_UNIT: usize = 1 << SIZE_SHIFT;
pub const SIZE_MASK: usize = SIZE_UNIT - 1;
pub const MAX_OBJECT_SIZE: usize = 0x100 << SIZE_SHIFT;
pub const MIN_OBJECT_SIZE: usize = 0x001 << SIZE_SHIFT;

/// Check byte over a two-byte payload. The exact function doesn't matter
/// much, but it must be computed identically by writer and reader, and it
/// must never produce 0xFF for the all-ones input, so a torn-but-started
/// record can't masquerade as erased space.
pub fn check_byte(a: u8, b: u8) -> u8 {
    0x5A ^ a ^ b.rotate_left(3)
}

static_assertions::const_assert!(
    0x5Au8 ^ 0xFFu8 ^ 0xFFu8.rotate_left(3) != 0xFFu8
);

pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0xFF)
}

/// A probabilistic member test for one index block's key set.
///
/// This is a one-hash Bloom filter squeezed into 16 bits, sized for a key
/// space that's only an order of magnitude larger than the filter. Because
/// it lives in flash and insertions must not require an erase, the usual
/// bit sense is inverted: 1 is an empty bucket, 0 an occupied one.
///
/// The hash is `key * (2*row + 1) mod 16`. Multiplying by any odd number
/// mod 16 permutes the residues, so games using small counting keys get
/// collision-free rows, and rows collide on *different* key pairs, which
/// bounds the damage any one collision can do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(transparent)]
pub struct KeyFilter {
    bits: [u8; 2],
}

impl KeyFilter {
    pub const EMPTY: Self = Self { bits: [0xFF, 0xFF] };

    fn mask(row: usize, key: u8) -> u16 {
        let h = (key as usize * ((row << 1) | 1)) & 0xF;
        1 << h
    }

    fn get(self) -> u16 {
        u16::from_le_bytes(self.bits)
    }

    pub fn is_empty(self) -> bool {
        self.get() == 0xFFFF
    }

    pub fn add(&mut self, row: usize, key: u8) {
        let bits = self.get() & !Self::mask(row, key);
        self.bits = bits.to_le_bytes();
    }

    /// True if `key` is *possibly* in this block, false if definitely not.
    pub fn test(self, row: usize, key: u8) -> bool {
        self.get() & Self::mask(row, key) == 0
    }
}

/// Rows in the meta-index, one per index block. Sized to exactly fill the
/// mappable type-specific-data area next to a 4-byte sequence number.
pub const NUM_ROWS: usize = (MAX_MAPPABLE_DATA_BYTES - 4) / 2;

/// Bytes of type-specific data an LFS child volume carries.
pub const TYPE_DATA_BYTES: usize = 4 + 2 * NUM_ROWS;

static_assertions::const_assert!(TYPE_DATA_BYTES <= MAX_MAPPABLE_DATA_BYTES);

/// One entry in a volume's object index.
///
/// Five bytes buys us everything needed to locate an object, decide very
/// reliably whether its slot was ever allocated (even across a power
/// failure mid-write), and validate the body so a reader can fall back to
/// an earlier version:
///
/// - a record that never finished writing fails its check byte and is
///   skipped — the slot is wasted but no object space was consumed;
/// - a record whose body never finished writing fails the body CRC, and
///   the previous version of that key remains authoritative.
#[derive(Copy, Clone, Debug)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct IndexRecord {
    key: u8,
    size: u8,
    crc: [u8; 2], // unaligned on purpose, to keep the check byte last
    check: u8,
}

pub const RECORD_SIZE: usize = core::mem::size_of::<IndexRecord>();
static_assertions::const_assert_eq!(RECORD_SIZE, 5);

impl IndexRecord {
    pub fn new(key: u8, size_in_bytes: usize, crc: u16) -> Self {
        debug_assert!(size_in_bytes >= MIN_OBJECT_SIZE);
        debug_assert!(size_in_bytes <= MAX_OBJECT_SIZE);
        debug_assert_eq!(size_in_bytes & SIZE_MASK, 0);

        let size = ((size_in_bytes >> SIZE_SHIFT) - 1) as u8;
        Self {
            key,
            size,
            crc: crc.to_le_bytes(),
            check: check_byte(key, size),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.check == check_byte(self.key, self.size)
    }

    pub fn is_empty(&self) -> bool {
        is_erased(&[self.key, self.size, self.crc[0], self.crc[1], self.check])
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    pub fn size_in_bytes(&self) -> usize {
        (usize::from(self.size) + 1) << SIZE_SHIFT
    }

    pub fn crc(&self) -> u16 {
        u16::from_le_bytes(self.crc)
    }

    pub fn check_crc(&self, reference: u16) -> bool {
        self.crc() == reference
    }

    pub fn size_is_allowed(bytes: usize) -> bool {
        bytes > 0 && bytes <= MAX_OBJECT_SIZE
    }
}

/// Header record at the front of an index block, giving the payload offset
/// of the block's first object.
///
/// There may be several torn anchors before the single valid one, left by
/// power failures during block allocation; they are skipped. Erased bytes
/// can never read as a valid anchor.
#[derive(Copy, Clone, Debug)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct IndexAnchor {
    offset: [u8; 2],
    check: u8,
}

pub const ANCHOR_SIZE: usize = core::mem::size_of::<IndexAnchor>();
static_assertions::const_assert_eq!(ANCHOR_SIZE, 3);

impl IndexAnchor {
    pub const OFFSET_SHIFT: u32 = SIZE_SHIFT;

    pub fn new(offset_in_bytes: u32) -> Self {
        debug_assert_eq!(offset_in_bytes as usize & SIZE_MASK, 0);
        let word = (offset_in_bytes >> Self::OFFSET_SHIFT) as u16;
        let [lo, hi] = word.to_le_bytes();
        Self { offset: [lo, hi], check: check_byte(lo, hi) }
    }

    pub fn is_valid(&self) -> bool {
        self.check == check_byte(self.offset[0], self.offset[1])
    }

    pub fn is_empty(&self) -> bool {
        is_erased(&[self.offset[0], self.offset[1], self.check])
    }

    pub fn offset_in_bytes(&self) -> u32 {
        u32::from(u16::from_le_bytes(self.offset)) << Self::OFFSET_SHIFT
    }
}

/// Maximum records one index block can hold, after its anchor.
pub const MAX_RECORDS_PER_BLOCK: usize =
    (CACHE_BLOCK_SIZE - ANCHOR_SIZE) / RECORD_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_rows_permute_small_keys() {
        for row in 0..NUM_ROWS {
            let mut filter = KeyFilter::EMPTY;
            for key in 0..16u8 {
                assert!(!filter.test(row, key));
                filter.add(row, key);
                assert!(filter.test(row, key));
            }
            // Sixteen small keys fill the row exactly: a permutation.
            assert_eq!(filter.get(), 0);
        }
    }

    #[test]
    fn filter_never_false_negative() {
        let mut filter = KeyFilter::EMPTY;
        for key in [0u8, 17, 93, 200, 255] {
            filter.add(5, key);
        }
        for key in [0u8, 17, 93, 200, 255] {
            assert!(filter.test(5, key));
        }
    }

    #[test]
    fn record_round_trip_and_check() {
        let rec = IndexRecord::new(0x42, 64, 0xBEEF);
        assert!(rec.is_valid());
        assert!(!rec.is_empty());
        assert_eq!(rec.key(), 0x42);
        assert_eq!(rec.size_in_bytes(), 64);
        assert!(rec.check_crc(0xBEEF));
        assert!(!rec.check_crc(0xBEEE));
    }

    #[test]
    fn erased_bytes_never_validate() {
        let erased = [0xFFu8; RECORD_SIZE];
        let rec: IndexRecord =
            zerocopy::FromBytes::read_from_bytes(&erased[..]).unwrap();
        assert!(rec.is_empty());
        assert!(!rec.is_valid());

        let erased = [0xFFu8; ANCHOR_SIZE];
        let anchor: IndexAnchor =
            zerocopy::FromBytes::read_from_bytes(&erased[..]).unwrap();
        assert!(anchor.is_empty());
        assert!(!anchor.is_valid());
    }

    #[test]
    fn anchor_offsets_scale() {
        let anchor = IndexAnchor::new(0x4560);
        assert!(anchor.is_valid());
        assert_eq!(anchor.offset_in_bytes(), 0x4560);
    }

    #[test]
    fn extreme_sizes_encode() {
        let small = IndexRecord::new(1, MIN_OBJECT_SIZE, 0);
        assert_eq!(small.size_in_bytes(), MIN_OBJECT_SIZE);
        let big = IndexRecord::new(1, MAX_OBJECT_SIZE, 0);
        assert_eq!(big.size_in_bytes(), MAX_OBJECT_SIZE);
    }
}
