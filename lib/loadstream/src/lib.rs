// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash loadstream codec: the bulk asset channel into cube tile memory.
//!
//! The loadstream rides inside the radio codec's flash escape and is
//! consumed by a state machine on the cube, interleaved with rendering.
//! It works in 8-bit opcodes — upper three bits the operation, lower five
//! an argument, usually a repeat count. Tile pixel data is decoded
//! through a persistent 16-entry color LUT, with variable-bit-depth RLE
//! codings underneath; together with an offline optimizer choosing LUT
//! contents this lands somewhere near indexed color plus a dictionary,
//! on a few dozen bytes of RAM.
//!
//! The decoder erases a flash block the first time it programs within it,
//! so a stream needs no explicit erase commands.

#![cfg_attr(not(test), no_std)]

use crc::Crc;

mod decode;
mod encode;

pub use decode::{Decoder, TileTarget};
pub use encode::Encoder;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Size of cube flash erase blocks.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// One tile is 8×8 16-bit pixels.
pub const TILE_PIXELS: usize = 64;
pub const TILE_BYTES: usize = TILE_PIXELS * 2;

/// FIFO between the radio and the decoder, and its usable capacity.
pub const FIFO_SIZE: usize = 73;
pub const FIFO_USABLE: usize = FIFO_SIZE - 1;

/// Persistent color LUT used by the RLE tile codings.
pub const LUT_SIZE: usize = 16;

pub const OP_MASK: u8 = 0xE0;
pub const ARG_MASK: u8 = 0x1F;

/// Single 16-bit LUT entry; the argument is the index.
pub const OP_LUT1: u8 = 0x00;
/// Up to 16 LUT entries, preceded by a 16-bit vector of which.
pub const OP_LUT16: u8 = 0x20;
/// One solid tile; the argument is the color index.
pub const OP_TILE_P0: u8 = 0x40;
/// Tiles with 1-bit pixels and 4-bit RLE (argument is count-1).
pub const OP_TILE_P1_R4: u8 = 0x60;
/// Tiles with 2-bit pixels and 4-bit RLE.
pub const OP_TILE_P2_R4: u8 = 0x80;
/// Tiles with 4-bit pixels and 4-bit RLE.
pub const OP_TILE_P4_R4: u8 = 0xA0;
/// Tiles with full 16-bit pixels and per-8-pixel repetition masks.
pub const OP_TILE_P16: u8 = 0xC0;
pub const OP_SPECIAL: u8 = 0xE0;

/// Permanently reserved as a no-op.
pub const OP_NOP: u8 = 0xE0;
/// Followed by a two-byte (lat1:lat2) tile address; A21 in lat2's LSB.
pub const OP_ADDRESS: u8 = 0xE1;
/// Followed by (query id, tile count): CRC the tiles at the write
/// address, reported out of band.
pub const OP_QUERY_CRC: u8 = 0xE2;
/// Followed by (byte count, bytes...).
pub const OP_CHECK_QUERY: u8 = 0xE3;
// 0xE4 through 0xFF are reserved.

/// Minimum buffered operand bytes before a 4-bit-RLE tile opcode can
/// materialize a worst-case 16-pixel group.
pub const MIN_TILE_R4: usize = 12;
/// Likewise for 16-bit tiles: two masks plus sixteen pixels.
pub const MIN_TILE_P16: usize = 34;

static_assertions::const_assert!(MIN_TILE_P16 < FIFO_USABLE);

/// Decode a two-byte latched tile address into a byte address.
pub fn latched_address(lat1: u8, lat2: u8) -> u32 {
    (u32::from(lat2 & 0xFE) << 13)
        | (u32::from(lat1 & 0xFE) << 6)
        | (u32::from(lat2 & 1) << 21)
}

/// Encode a tile index as the two address latch bytes.
pub fn tile_to_latches(tile: u32) -> (u8, u8) {
    debug_assert!(tile < 1 << 15);
    let lat1 = ((tile & 0x7F) << 1) as u8;
    let lat2 = ((((tile >> 7) & 0x7F) << 1) | (tile >> 14)) as u8;
    (lat1, lat2)
}
