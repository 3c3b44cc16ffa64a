// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loadstream producer.
//!
//! The offline asset tool decides tile *ordering* and LUT contents to
//! minimize total stream cost; that optimization is its own problem and
//! deliberately not solved here. This encoder's contract is narrower:
//! whatever order the caller emits in, the byte stream must decode
//! exactly. Tiles go out in caller order.

use crate::{
    tile_to_latches, OP_ADDRESS, OP_CHECK_QUERY, OP_LUT1, OP_LUT16, OP_NOP,
    OP_QUERY_CRC, OP_TILE_P0, OP_TILE_P16, OP_TILE_P1_R4, OP_TILE_P2_R4,
    OP_TILE_P4_R4, TILE_PIXELS,
};

pub struct Encoder {
    /// Mirror of the decoder's previous 8-pixel group, for P16 masks.
    prev_group: [u16; 8],
}

impl Encoder {
    pub fn new() -> Self {
        Self { prev_group: [0; 8] }
    }

    /// Mirror a decoder reset.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn nop(&self, out: &mut impl FnMut(u8)) {
        out(OP_NOP);
    }

    /// Point the decoder's write address at a tile.
    pub fn set_address(&self, tile: u32, out: &mut impl FnMut(u8)) {
        let (lat1, lat2) = tile_to_latches(tile);
        out(OP_ADDRESS);
        out(lat1);
        out(lat2);
    }

    /// Load a single LUT entry.
    pub fn lut1(&self, index: u8, color: u16, out: &mut impl FnMut(u8)) {
        debug_assert!(index < 16);
        out(OP_LUT1 | index);
        let [lo, hi] = color.to_le_bytes();
        out(lo);
        out(hi);
    }

    /// Load several LUT entries at once: a bitmask of target slots, then
    /// colors for the set slots in ascending index order.
    pub fn lut16(&self, entries: &[(u8, u16)], out: &mut impl FnMut(u8)) {
        let mut slots = [None; 16];
        let mut mask = 0u16;
        for &(index, color) in entries {
            debug_assert!(index < 16);
            mask |= 1 << index;
            slots[usize::from(index)] = Some(color);
        }
        out(OP_LUT16);
        let [lo, hi] = mask.to_le_bytes();
        out(lo);
        out(hi);
        for slot in slots.into_iter().flatten() {
            let [lo, hi] = slot.to_le_bytes();
            out(lo);
            out(hi);
        }
    }

    /// One solid tile from the LUT.
    pub fn tile_solid(&self, color_index: u8, out: &mut impl FnMut(u8)) {
        debug_assert!(color_index < 16);
        out(OP_TILE_P0 | color_index);
    }

    /// Tiles of LUT indices at 1, 2, or 4 bits per pixel, with the 4-bit
    /// RLE coding. `tiles` holds per-pixel LUT indices.
    pub fn tiles_rle(
        &self,
        bits: u8,
        tiles: &[[u8; TILE_PIXELS]],
        out: &mut impl FnMut(u8),
    ) {
        debug_assert!(matches!(bits, 1 | 2 | 4));
        debug_assert!(!tiles.is_empty() && tiles.len() <= 32);

        out(match bits {
            1 => OP_TILE_P1_R4,
            2 => OP_TILE_P2_R4,
            _ => OP_TILE_P4_R4,
        } | (tiles.len() - 1) as u8);

        // Pack pixels into data nybbles, low bits first.
        let per_nybble = usize::from(4 / bits);
        let mut nybbles = [0u8; 32 * TILE_PIXELS];
        let mut count = 0;
        for tile in tiles {
            for chunk in tile.chunks(per_nybble) {
                let mut n = 0u8;
                for (i, &px) in chunk.iter().enumerate() {
                    debug_assert!(px < 1 << bits);
                    n |= px << (i as u8 * bits);
                }
                nybbles[count] = n;
                count += 1;
            }
        }

        // Apply the RLE escape: after any two equal nybbles on the wire,
        // the decoder reads a repeat count, so one must always follow.
        let mut half: Option<u8> = None;
        let mut push = |n: u8| match half.take() {
            None => half = Some(n),
            Some(lo) => out(lo | (n << 4)),
        };

        let mut prev: Option<u8> = None;
        let mut i = 0;
        while i < count {
            let d = nybbles[i];
            push(d);
            i += 1;
            if prev == Some(d) {
                let mut run = 0u8;
                while run < 15 && i < count && nybbles[i] == d {
                    run += 1;
                    i += 1;
                }
                push(run);
                prev = None;
            } else {
                prev = Some(d);
            }
        }

        // The decoder discards a trailing pad nybble.
        if let Some(lo) = half {
            out(lo);
        }
    }

    /// Tiles of raw 16-bit pixels with repetition masks: each mask bit
    /// that is clear repeats the pixel at the same slot of the previous
    /// 8-pixel group.
    pub fn tiles_p16(
        &mut self,
        tiles: &[[u16; TILE_PIXELS]],
        out: &mut impl FnMut(u8),
    ) {
        debug_assert!(!tiles.is_empty() && tiles.len() <= 32);
        out(OP_TILE_P16 | (tiles.len() - 1) as u8);

        for tile in tiles {
            for group in tile.chunks(8) {
                let mut mask = 0u8;
                for (i, &px) in group.iter().enumerate() {
                    if px != self.prev_group[i] {
                        mask |= 1 << i;
                    }
                }
                out(mask);
                for (i, &px) in group.iter().enumerate() {
                    if mask & (1 << i) != 0 {
                        let [lo, hi] = px.to_le_bytes();
                        out(lo);
                        out(hi);
                    }
                    self.prev_group[i] = px;
                }
            }
        }
    }

    /// Ask the cube to CRC `tile_count` tiles at the write address.
    pub fn query_crc(
        &self,
        query_id: u8,
        tile_count: u8,
        out: &mut impl FnMut(u8),
    ) {
        out(OP_QUERY_CRC);
        out(query_id);
        out(tile_count);
    }

    pub fn check_query(&self, bytes: &[u8], out: &mut impl FnMut(u8)) {
        debug_assert!(bytes.len() <= 0xFF);
        out(OP_CHECK_QUERY);
        out(bytes.len() as u8);
        for &b in bytes {
            out(b);
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}
