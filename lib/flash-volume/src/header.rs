// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-flash layout of the volume header.
//!
//! Each volume's first map block begins with a fixed 32-byte prefix,
//! followed by the packed map, optional type-specific data, the per-block
//! erase counts, padding to the next cache block, and finally the payload.
//! Subsequent map blocks carry no header of their own, which keeps the
//! payload span contiguous in map space.
//!
//! The header stores erase counts on behalf of the whole volume, so a
//! volume must be deletable without invalidating the header: deletion just
//! rewrites the type fields to `T_DELETED` (all zero bits, reachable from
//! any prior type by programming alone).

use crc::Crc;
use flash_map::{MapBlock, CACHE_BLOCK_SIZE};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes as _, IntoBytes as _};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// "CubeVOL_" when read as little-endian bytes.
pub const MAGIC: u64 = 0x5F4C_4F56_6562_7543;

pub type EraseCount = u32;

//
// Volume type codes.
//

/// All bits clear, so a volume can be retired with a single in-place
/// program and no erase.
pub const T_DELETED: u16 = 0x0000;
/// All bits set: the erased state. A writer that loses power before commit
/// leaves its volume in this type with no extra writes.
pub const T_INCOMPLETE: u16 = 0xFFFF;
pub const T_ELF: u16 = 0x4C45;
pub const T_LFS: u16 = 0x4C46;
pub const T_ERASE_LOG: u16 = 0x4C47;
/// Application-defined type codes begin here; below is reserved.
pub const T_APP_BASE: u16 = 0x8000;

/// True for the types whose blocks the recycler may reclaim. Their map
/// entries are invalidated one at a time during recycling, so the map CRC
/// is not enforced for them.
pub fn type_is_recyclable(t: u16) -> bool {
    t == T_DELETED || t == T_INCOMPLETE
}

/// Fixed-size portion of the header (32 bytes).
#[derive(Copy, Clone, Debug, Default)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct VolumeHeader {
    pub magic: U64,

    pub type_code: U16,
    /// Number of cache blocks of payload data.
    pub payload_blocks: U16,
    /// Type-specific data size, in bytes.
    pub data_bytes: U16,
    pub payload_blocks_cpl: U16,
    pub data_bytes_cpl: U16,
    pub type_code_copy: U16,

    /// CRC of the in-use portion of the map.
    pub crc_map: U32,
    /// CRC of the in-use portion of the erase count array.
    pub crc_erase: U32,

    /// Map block code of the parent volume's header, 0 if top-level.
    pub parent_block: u8,
    pub parent_block_cpl: u8,

    pub reserved: U16,
}

pub const HEADER_SIZE: usize = core::mem::size_of::<VolumeHeader>();
static_assertions::const_assert_eq!(HEADER_SIZE, 32);

/// Maximum type-specific data that still fits in the same cache block as
/// the header of a minimal single-map-entry volume.
pub const MAX_MAPPABLE_DATA_BYTES: usize =
    CACHE_BLOCK_SIZE - HEADER_SIZE - 4 - 4;

const fn round_up4(x: usize) -> usize {
    (x + 3) & !3
}

impl VolumeHeader {
    pub fn read(page: &[u8; CACHE_BLOCK_SIZE]) -> Self {
        Self::read_from_bytes(&page[..HEADER_SIZE]).unwrap()
    }

    /// Initialize every field except the CRCs.
    pub fn init(
        type_code: u16,
        payload_blocks: u16,
        data_bytes: u16,
        parent: MapBlock,
    ) -> Self {
        let hdr = Self {
            magic: MAGIC.into(),
            type_code: type_code.into(),
            payload_blocks: payload_blocks.into(),
            data_bytes: data_bytes.into(),
            payload_blocks_cpl: (!payload_blocks).into(),
            data_bytes_cpl: (!data_bytes).into(),
            type_code_copy: type_code.into(),
            crc_map: 0.into(),
            crc_erase: 0.into(),
            parent_block: parent.code,
            parent_block_cpl: !parent.code,
            reserved: 0xFFFF.into(),
        };
        debug_assert!(hdr.is_valid());
        hdr
    }

    pub fn write(&self, page: &mut [u8; CACHE_BLOCK_SIZE]) {
        page[..HEADER_SIZE].copy_from_slice(self.as_bytes());
    }

    /// Check whether the fixed prefix itself is superficially valid: magic
    /// matches and every redundant field pair agrees.
    pub fn is_valid(&self) -> bool {
        self.magic.get() == MAGIC
            && self.type_code.get() == self.type_code_copy.get()
            && self.payload_blocks.get() ^ self.payload_blocks_cpl.get()
                == 0xFFFF
            && self.data_bytes.get() ^ self.data_bytes_cpl.get() == 0xFFFF
            && self.parent_block ^ self.parent_block_cpl == 0xFF
    }

    pub fn parent(&self) -> MapBlock {
        MapBlock { code: self.parent_block }
    }

    pub fn payload_bytes(&self) -> usize {
        usize::from(self.payload_blocks.get()) * CACHE_BLOCK_SIZE
    }

    /// Number of map entries, equal to the number of map blocks the volume
    /// covers.
    ///
    /// This is circular on its face: the header's size depends on the entry
    /// count, and the entry count depends on the total size of header plus
    /// payload. The header can never add more than one map block though, so
    /// compute assuming a minimal header and bump by one if the real header
    /// doesn't fit.
    pub fn num_map_entries(&self) -> usize {
        num_map_entries(
            usize::from(self.payload_blocks.get()),
            usize::from(self.data_bytes.get()),
        )
    }
}

const CACHE_BLOCKS_PER_MAP_BLOCK: usize =
    flash_map::MAP_BLOCK_SIZE / CACHE_BLOCK_SIZE;

pub fn num_map_entries(payload_blocks: usize, data_bytes: usize) -> usize {
    let min_result =
        (payload_blocks + 1).div_ceil(CACHE_BLOCKS_PER_MAP_BLOCK);

    let min_hdr_blocks = (HEADER_SIZE
        + round_up4(min_result)
        + round_up4(data_bytes)
        + core::mem::size_of::<EraseCount>() * min_result)
        .div_ceil(CACHE_BLOCK_SIZE);

    if (payload_blocks + min_hdr_blocks)
        .div_ceil(CACHE_BLOCKS_PER_MAP_BLOCK)
        == min_result
    {
        min_result
    } else {
        min_result + 1
    }
}

/// Offset of the map, in bytes from the start of the header block.
pub const fn map_offset() -> usize {
    HEADER_SIZE
}

/// Size of the in-use portion of the map, in bytes.
pub const fn map_size_bytes(num_map_entries: usize) -> usize {
    round_up4(num_map_entries)
}

pub const fn data_offset(num_map_entries: usize) -> usize {
    map_offset() + map_size_bytes(num_map_entries)
}

pub const fn erase_count_offset(
    num_map_entries: usize,
    data_bytes: usize,
) -> usize {
    data_offset(num_map_entries) + round_up4(data_bytes)
}

pub const fn payload_offset_bytes(
    num_map_entries: usize,
    data_bytes: usize,
) -> usize {
    erase_count_offset(num_map_entries, data_bytes)
        + core::mem::size_of::<EraseCount>() * num_map_entries
}

/// Offset of the payload, in cache blocks.
pub const fn payload_offset_blocks(
    num_map_entries: usize,
    data_bytes: usize,
) -> usize {
    payload_offset_bytes(num_map_entries, data_bytes)
        .div_ceil(CACHE_BLOCK_SIZE)
}

/// CRC over the in-use portion of a map, as stored in the header block.
pub fn map_crc(page: &[u8; CACHE_BLOCK_SIZE], num_map_entries: usize) -> u32 {
    let start = map_offset();
    CRC32.checksum(&page[start..start + map_size_bytes(num_map_entries)])
}

/// CRC over a packed erase count array.
pub fn erase_crc(counts: &[EraseCount]) -> u32 {
    let mut digest = CRC32.digest();
    for c in counts {
        digest.update(&c.to_le_bytes());
    }
    digest.finalize()
}

/// Read one map entry out of the header page.
pub fn map_entry(page: &[u8; CACHE_BLOCK_SIZE], index: usize) -> MapBlock {
    MapBlock { code: page[map_offset() + index] }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundant_fields_catch_corruption() {
        let hdr =
            VolumeHeader::init(T_ELF, 4, 0, MapBlock::INVALID);
        assert!(hdr.is_valid());

        let mut bad = hdr;
        bad.payload_blocks = 5.into();
        assert!(!bad.is_valid());

        let mut bad = hdr;
        bad.type_code = T_LFS.into();
        assert!(!bad.is_valid());

        let mut bad = hdr;
        bad.magic = 0.into();
        assert!(!bad.is_valid());
    }

    #[test]
    fn single_block_volume_geometry() {
        // One map entry: 32-byte header + 4 map bytes + 4-byte erase count,
        // so the payload starts one cache block in.
        let n = num_map_entries(200, 0);
        assert_eq!(n, 1);
        assert_eq!(payload_offset_blocks(1, 0), 1);
    }

    #[test]
    fn header_block_accounting_can_add_an_entry() {
        // A payload of exactly one map block's worth of cache blocks needs
        // a second map block once the header is accounted for.
        let full = CACHE_BLOCKS_PER_MAP_BLOCK;
        assert_eq!(num_map_entries(full, 0), 2);
        assert_eq!(num_map_entries(full - 1, 0), 1);
    }

    #[test]
    fn type_data_stays_in_header_block() {
        let n = num_map_entries(100, MAX_MAPPABLE_DATA_BYTES);
        assert_eq!(n, 1);
        assert!(
            payload_offset_bytes(n, MAX_MAPPABLE_DATA_BYTES)
                <= CACHE_BLOCK_SIZE
        );
    }

    #[test]
    fn deleted_type_reachable_by_programming() {
        // Any type can reach T_DELETED by clearing bits, and T_INCOMPLETE
        // (erased) can reach any type.
        for t in [T_ELF, T_LFS, T_ERASE_LOG, T_APP_BASE] {
            assert_eq!(t & !T_INCOMPLETE, 0);
            assert_eq!(T_DELETED & !t, 0);
        }
    }
}
