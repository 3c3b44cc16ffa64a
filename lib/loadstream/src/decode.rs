// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cube-side loadstream decoder.
//!
//! Bytes arrive from the radio FIFO in arbitrary chunks, so the decoder
//! is a fully incremental state machine: every byte (and, inside the RLE
//! tile codings, every nybble) advances it, and partial operands simply
//! wait. The worst-case operand sizes in `MIN_TILE_R4`/`MIN_TILE_P16`
//! bound how much the radio layer must be able to buffer ahead of it.

use arrayvec::ArrayVec;

use crate::{
    latched_address, ARG_MASK, BLOCK_SIZE, CRC32, LUT_SIZE, OP_ADDRESS,
    OP_CHECK_QUERY, OP_LUT1, OP_LUT16, OP_MASK, OP_NOP, OP_QUERY_CRC,
    OP_SPECIAL, OP_TILE_P0, OP_TILE_P16, OP_TILE_P1_R4, OP_TILE_P2_R4,
    OP_TILE_P4_R4, TILE_BYTES, TILE_PIXELS,
};

/// The tile memory the decoder programs. A flash block must be erased
/// before programming; the decoder issues erases itself, so targets only
/// mechanize them.
pub trait TileTarget {
    fn program_word(&mut self, addr: u32, word: u16);
    fn erase_block(&mut self, index: usize);
    fn read_word(&self, addr: u32) -> u16;
    /// CRC query result, reported out of band.
    fn query_result(&mut self, _query_id: u8, _crc: u32) {}
    fn check_query(&mut self, _bytes: &[u8]) {}
}

const MAX_CHECK_BYTES: usize = 64;

#[derive(Copy, Clone, Debug)]
struct RleState {
    bits: u8,
    tiles_left: u8,
    pixels_done: u8,
    /// RLE escape detection: two equal nybbles arm a run, and the nybble
    /// after them is a repeat count.
    last: u8,
    have_last: bool,
    await_count: bool,
}

#[derive(Copy, Clone, Debug)]
struct P16State {
    tiles_left: u8,
    pixels_done: u8,
    mask: u8,
    mask_left: u8,
    lo: Option<u8>,
    need_mask: bool,
}

#[derive(Copy, Clone, Debug)]
enum State {
    Opcode,
    Lut1 { index: u8, lo: Option<u8> },
    Lut16Mask { lo: Option<u8> },
    Lut16Colors { mask: u16, next: u8, lo: Option<u8> },
    TileRle(RleState),
    TileP16(P16State),
    AddressLo,
    AddressHi { lat1: u8 },
    QueryId,
    QueryCount { id: u8 },
    CheckLen,
    CheckBytes { remaining: u8 },
}

pub struct Decoder {
    state: State,
    lut: [u16; LUT_SIZE],
    /// Byte address of the next pixel write.
    addr: u32,
    /// Blocks erased this session, by block index.
    erased: u64,
    /// Previous 8-pixel group, for the P16 repetition masks.
    prev_group: [u16; 8],
    check_buf: ArrayVec<u8, MAX_CHECK_BYTES>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::Opcode,
            lut: [0; LUT_SIZE],
            addr: 0,
            erased: 0,
            prev_group: [0; 8],
            check_buf: ArrayVec::new(),
        }
    }

    /// Reset request from the radio protocol: back to a fresh session.
    /// The caller acknowledges out of band by bumping the FIFO progress
    /// counter.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn address(&self) -> u32 {
        self.addr
    }

    /// Feed a chunk of loadstream bytes.
    pub fn feed(&mut self, bytes: &[u8], target: &mut impl TileTarget) {
        for &b in bytes {
            self.byte(b, target);
        }
    }

    fn byte(&mut self, b: u8, target: &mut impl TileTarget) {
        match self.state {
            State::Opcode => self.opcode(b, target),
            State::Lut1 { index, lo: None } => {
                self.state = State::Lut1 { index, lo: Some(b) };
            }
            State::Lut1 { index, lo: Some(lo) } => {
                self.lut[usize::from(index)] =
                    u16::from_le_bytes([lo, b]);
                self.state = State::Opcode;
            }
            State::Lut16Mask { lo: None } => {
                self.state = State::Lut16Mask { lo: Some(b) };
            }
            State::Lut16Mask { lo: Some(lo) } => {
                let mask = u16::from_le_bytes([lo, b]);
                self.advance_lut16(mask, 0);
            }
            State::Lut16Colors { mask, next, lo: None } => {
                self.state =
                    State::Lut16Colors { mask, next, lo: Some(b) };
            }
            State::Lut16Colors { mask, next, lo: Some(lo) } => {
                self.lut[usize::from(next)] = u16::from_le_bytes([lo, b]);
                self.advance_lut16(mask, next + 1);
            }
            State::TileRle(mut st) => {
                // Low nybble first. If the opcode completes on the low
                // nybble, the high half of the byte is padding.
                self.rle_nybble(&mut st, b & 0xF, target);
                if st.tiles_left > 0 {
                    self.rle_nybble(&mut st, b >> 4, target);
                }
                self.state = if st.tiles_left > 0 {
                    State::TileRle(st)
                } else {
                    State::Opcode
                };
            }
            State::TileP16(mut st) => {
                if st.need_mask {
                    st.mask = b;
                    st.mask_left = 8;
                    st.need_mask = false;
                    self.p16_repeats(&mut st, target);
                } else if st.lo.is_none() {
                    st.lo = Some(b);
                } else {
                    let value = u16::from_le_bytes([st.lo.take().unwrap(), b]);
                    self.p16_pixel(&mut st, value, target);
                    self.p16_repeats(&mut st, target);
                }
                self.state = if st.tiles_left > 0 {
                    State::TileP16(st)
                } else {
                    State::Opcode
                };
            }
            State::AddressLo => {
                self.state = State::AddressHi { lat1: b };
            }
            State::AddressHi { lat1 } => {
                self.addr = latched_address(lat1, b);
                self.state = State::Opcode;
            }
            State::QueryId => {
                self.state = State::QueryCount { id: b };
            }
            State::QueryCount { id } => {
                self.run_crc_query(id, b, target);
                self.state = State::Opcode;
            }
            State::CheckLen => {
                self.check_buf.clear();
                if b == 0 {
                    target.check_query(&self.check_buf);
                    self.state = State::Opcode;
                } else {
                    self.state = State::CheckBytes { remaining: b };
                }
            }
            State::CheckBytes { remaining } => {
                let _ = self.check_buf.try_push(b);
                if remaining == 1 {
                    target.check_query(&self.check_buf);
                    self.state = State::Opcode;
                } else {
                    self.state =
                        State::CheckBytes { remaining: remaining - 1 };
                }
            }
        }
    }

    fn opcode(&mut self, b: u8, target: &mut impl TileTarget) {
        let arg = b & ARG_MASK;
        match b & OP_MASK {
            OP_LUT1 => {
                self.state =
                    State::Lut1 { index: arg & 0xF, lo: None };
            }
            OP_LUT16 => {
                self.state = State::Lut16Mask { lo: None };
            }
            OP_TILE_P0 => {
                let color = self.lut[usize::from(arg & 0xF)];
                for _ in 0..TILE_PIXELS {
                    self.program_pixel(color, target);
                }
            }
            OP_TILE_P1_R4 => self.begin_rle(1, arg),
            OP_TILE_P2_R4 => self.begin_rle(2, arg),
            OP_TILE_P4_R4 => self.begin_rle(4, arg),
            OP_TILE_P16 => {
                self.state = State::TileP16(P16State {
                    tiles_left: arg + 1,
                    pixels_done: 0,
                    mask: 0,
                    mask_left: 0,
                    lo: None,
                    need_mask: true,
                });
            }
            _ => match b {
                OP_NOP => {}
                OP_ADDRESS => self.state = State::AddressLo,
                OP_QUERY_CRC => self.state = State::QueryId,
                OP_CHECK_QUERY => self.state = State::CheckLen,
                // Reserved codes are ignored, leaving room to grow the
                // protocol.
                _ => {}
            },
        }
    }

    fn begin_rle(&mut self, bits: u8, arg: u8) {
        self.state = State::TileRle(RleState {
            bits,
            tiles_left: arg + 1,
            pixels_done: 0,
            last: 0,
            have_last: false,
            await_count: false,
        });
    }

    fn rle_nybble(
        &mut self,
        st: &mut RleState,
        n: u8,
        target: &mut impl TileTarget,
    ) {
        if st.await_count {
            // Count of additional copies of the armed nybble.
            let armed = st.last;
            for _ in 0..n {
                if st.tiles_left == 0 {
                    break;
                }
                self.rle_pixels(st, armed, target);
            }
            st.await_count = false;
            st.have_last = false;
            return;
        }

        self.rle_pixels(st, n, target);
        if st.have_last && st.last == n {
            st.await_count = true;
        } else {
            st.last = n;
            st.have_last = true;
        }
    }

    /// Emit the pixels one data nybble carries at this bit depth.
    fn rle_pixels(
        &mut self,
        st: &mut RleState,
        n: u8,
        target: &mut impl TileTarget,
    ) {
        let per_nybble = 4 / st.bits;
        let mask = (1u8 << st.bits) - 1;
        for i in 0..per_nybble {
            if st.tiles_left == 0 {
                return;
            }
            let index = (n >> (i * st.bits)) & mask;
            let color = self.lut[usize::from(index)];
            self.program_pixel(color, target);
            st.pixels_done += 1;
            if usize::from(st.pixels_done) == TILE_PIXELS {
                st.pixels_done = 0;
                st.tiles_left -= 1;
            }
        }
    }

    fn p16_pixel(
        &mut self,
        st: &mut P16State,
        value: u16,
        target: &mut impl TileTarget,
    ) {
        let slot = usize::from(st.pixels_done % 8);
        self.prev_group[slot] = value;
        self.program_pixel(value, target);
        st.pixels_done = (st.pixels_done + 1) % TILE_PIXELS as u8;
        st.mask >>= 1;
        st.mask_left -= 1;
        if st.pixels_done == 0 {
            st.tiles_left -= 1;
        }
        if st.mask_left == 0 && st.tiles_left > 0 {
            st.need_mask = true;
        }
    }

    /// Emit pixels for clear mask bits until input is needed again.
    fn p16_repeats(
        &mut self,
        st: &mut P16State,
        target: &mut impl TileTarget,
    ) {
        while st.tiles_left > 0 && st.mask_left > 0 && st.mask & 1 == 0 {
            let value = self.prev_group[usize::from(st.pixels_done % 8)];
            self.p16_pixel(st, value, target);
        }
    }

    fn program_pixel(&mut self, value: u16, target: &mut impl TileTarget) {
        let block = self.addr / BLOCK_SIZE as u32;
        if self.erased & (1 << block) == 0 {
            target.erase_block(block as usize);
            self.erased |= 1 << block;
        }
        target.program_word(self.addr, value);
        self.addr += 2;
    }

    fn run_crc_query(
        &mut self,
        id: u8,
        tile_count: u8,
        target: &mut impl TileTarget,
    ) {
        let mut digest = CRC32.digest();
        let mut addr = self.addr;
        for _ in 0..u32::from(tile_count) * (TILE_BYTES as u32 / 2) {
            digest.update(&target.read_word(addr).to_le_bytes());
            addr += 2;
        }
        target.query_result(id, digest.finalize());
    }

    fn advance_lut16(&mut self, mask: u16, from: u8) {
        // Find the next set bit that still needs a color.
        let mut next = from;
        while next < 16 && mask & (1 << next) == 0 {
            next += 1;
        }
        self.state = if next < 16 {
            State::Lut16Colors { mask, next, lo: None }
        } else {
            State::Opcode
        };
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
