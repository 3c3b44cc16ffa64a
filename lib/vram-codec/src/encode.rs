// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Master-side encoder for the VRAM codec.
//!
//! The encoder owns a shadow copy of the cube's video memory — the sample
//! points are defined over the *decoder's* state, so the encoder must
//! model it exactly. Tiles prefer, in order: extending the current run,
//! a one-nybble copy of a sample point, a two-nybble diff, a four-nybble
//! literal.
//!
//! Runs are deferred: a run code is only emitted once its successor is
//! known, because a bare run nybble followed by another run-class nybble
//! would parse as an extended code. When the successor *is* run-class (a
//! skip, a set-address, an escape) or the stream is ending, short run
//! remainders are re-emitted as primary codes instead.
//!
//! Codes may split across maximum-length packets; overflow nybbles queue
//! inside the encoder and drain into the next packet via `resume`. A
//! short packet resets the decoder, so after transmitting one the caller
//! reports it with `note_packet_end` and the encoder drops its code state
//! to match (keeping the cursor, and re-seeking on the next write).

use crate::{
    index_to_word, TxPacket, VramBuffer, DIFF_BASE, MAX_RUN, SAMPLES,
    VRAM_WORDS,
};

/// Worst-case overflow: a flushed maximum run plus a literal.
const PENDING_NYBBLES: usize = 64;

pub struct Encoder {
    model: VramBuffer,
    cursor: u16,
    s: u8,
    d: i16,
    /// True once the decoder has seen a primary code to repeat.
    state_valid: bool,
    /// Deferred repeats of the current primary code.
    run: u16,
    /// Nybbles that didn't fit the current packet.
    pending: [u8; PENDING_NYBBLES],
    pending_len: usize,
    pending_pos: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            model: VramBuffer::new(),
            cursor: 0,
            s: 0,
            d: 0,
            state_valid: false,
            run: 0,
            pending: [0; PENDING_NYBBLES],
            pending_len: 0,
            pending_pos: 0,
        }
    }

    /// The encoder's model of the cube's video memory.
    pub fn model(&self) -> &VramBuffer {
        &self.model
    }

    pub fn cursor(&self) -> u16 {
        self.cursor
    }

    /// True if overflow nybbles are waiting for the next packet.
    pub fn has_pending(&self) -> bool {
        self.pending_pos < self.pending_len
    }

    /// Drain overflow nybbles into a fresh packet. Returns true when the
    /// encoder is ready for new codes.
    pub fn resume(&mut self, pkt: &mut TxPacket) -> bool {
        while self.has_pending() {
            if !pkt.push_nybble(self.pending[self.pending_pos]) {
                return false;
            }
            self.pending_pos += 1;
        }
        self.pending_len = 0;
        self.pending_pos = 0;
        true
    }

    fn out(&mut self, pkt: &mut TxPacket, n: u8) {
        if self.has_pending() || !pkt.push_nybble(n) {
            debug_assert!(self.pending_len < PENDING_NYBBLES);
            self.pending[self.pending_len] = n;
            self.pending_len += 1;
        }
    }

    /// Encode one tile index at the cursor.
    pub fn tile(&mut self, index: u16, pkt: &mut TxPacket) {
        debug_assert!(index < 0x4000);

        // Does repeating the current primary code produce this tile?
        if self.state_valid {
            let sample = self.sample(self.s);
            if (sample) as i16 + self.d == (index) as i16 {
                self.run += 1;
                self.write_model(index);
                return;
            }
        }

        // Pick the shortest fresh code: copy, diff, literal.
        let mut choice: Option<(u8, i16)> = None;
        for (s, _) in SAMPLES.iter().enumerate() {
            let diff =
                (index) as i16 - (self.sample(s as u8)) as i16;
            if diff == 0 {
                choice = Some((s as u8, 0));
                break;
            }
            if choice.is_none() && (-7..=8).contains(&diff) {
                choice = Some((s as u8, diff));
            }
        }

        self.flush_run(pkt, false);
        match choice {
            Some((s, 0)) => {
                self.out(pkt, 0b0100 | s);
                self.s = s;
                self.d = 0;
            }
            Some((s, diff)) => {
                self.out(pkt, 0b1000 | s);
                self.out(pkt, (diff + DIFF_BASE) as u8);
                self.s = s;
                self.d = diff;
            }
            None => {
                self.emit_literal(index, pkt);
                self.s = 0;
                self.d = 0;
            }
        }
        self.state_valid = true;
        self.write_model(index);
    }

    /// Position the cursor, using a skip for small forward gaps and an
    /// absolute set-address otherwise.
    pub fn seek(&mut self, addr: u16, pkt: &mut TxPacket) {
        let addr = addr % VRAM_WORDS as u16;
        if addr == self.cursor {
            return;
        }

        // Both forms are run-class codes, so short run remainders must go
        // out as primaries first.
        self.flush_run(pkt, true);

        let gap = addr.wrapping_sub(self.cursor) % VRAM_WORDS as u16;
        if (1..=8).contains(&gap) {
            let n = (gap - 1) as u8;
            self.out(pkt, n & 1); //          000n: count bit 0
            self.out(pkt, n >> 1); //         00nn: count bits 2:1
        } else {
            self.out(pkt, 0b0011);
            self.out(pkt, ((addr >> 8) & 1) as u8);
            self.out(pkt, (addr & 0xF) as u8);
            self.out(pkt, ((addr >> 4) & 0xF) as u8);
        }
        self.cursor = addr;
    }

    /// Write a raw 16-bit word (not tile-index format).
    pub fn raw_word(&mut self, word: u16, pkt: &mut TxPacket) {
        self.flush_run(pkt, true);
        self.out(pkt, 0b0011);
        self.out(pkt, 0b0010);
        for step in 0..4 {
            self.out(pkt, ((word >> (4 * step)) & 0xF) as u8);
        }
        self.model.set_word(self.cursor, word);
        self.cursor = (self.cursor + 1) % VRAM_WORDS as u16;
        // The decoder resets to S=0, D=0, but a raw word may not be
        // meaningful in index space; don't extend runs over it.
        self.s = 0;
        self.d = 0;
        self.state_valid = false;
    }

    /// Resolve any deferred run. Call immediately before transmitting a
    /// final, short packet; the stream must not continue afterwards
    /// without `note_packet_end`.
    pub fn flush(&mut self, pkt: &mut TxPacket) {
        self.flush_run(pkt, true);
    }

    /// The caller transmitted a packet. A short packet resets the
    /// decoder's code state; mirror it.
    pub fn note_packet_end(&mut self, was_short: bool) {
        if was_short {
            debug_assert_eq!(self.run, 0, "flush before a short packet");
            debug_assert!(!self.has_pending());
            self.s = 0;
            self.d = 0;
            self.state_valid = false;
        }
    }

    //
    // Escapes. Each consumes the remainder of its packet, so the caller
    // transmits right afterwards. They fail (returning false / 0) when
    // the packet lacks room rather than splitting.
    //

    /// Feed loadstream bytes: returns how many of `data` fit. Zero-length
    /// data requests a loadstream decoder reset, so if there's no room
    /// for at least one payload byte the escape isn't emitted at all.
    pub fn flash_escape(&mut self, data: &[u8], pkt: &mut TxPacket) -> usize {
        self.flush_run(pkt, true);
        if self.has_pending() {
            return 0;
        }
        // Escape pair, alignment, and (for data) one payload byte.
        let aligned = (pkt.remaining_nybbles().saturating_sub(2)) & !1;
        if pkt.remaining_nybbles() < 2
            || (!data.is_empty() && aligned < 2)
        {
            return 0;
        }
        pkt.push_nybble(0b0011);
        pkt.push_nybble(0b0011);
        pkt.align_to_byte();
        let mut sent = 0;
        for &b in data {
            if !pkt.push_byte(b) {
                break;
            }
            sent += 1;
        }
        sent
    }

    pub fn sensor_sync(&mut self, timer_reload: u16, pkt: &mut TxPacket) -> bool {
        self.byte_escape(0, &timer_reload.to_le_bytes(), pkt)
    }

    pub fn ack_request(&mut self, pkt: &mut TxPacket) -> bool {
        self.byte_escape(1, &[], pkt)
    }

    /// Retune the cube's radio. Always resets codec state on both sides.
    pub fn radio_hop(&mut self, payload: &[u8], pkt: &mut TxPacket) -> bool {
        if !self.byte_escape(2, payload, pkt) {
            return false;
        }
        self.cursor = 0;
        self.s = 0;
        self.d = 0;
        self.state_valid = false;
        true
    }

    pub fn radio_nap(&mut self, duration: u16, pkt: &mut TxPacket) -> bool {
        self.byte_escape(3, &duration.to_le_bytes(), pkt)
    }

    fn byte_escape(
        &mut self,
        s: u8,
        args: &[u8],
        pkt: &mut TxPacket,
    ) -> bool {
        self.flush_run(pkt, false);
        if self.has_pending() {
            return false;
        }
        // The code, alignment, and all argument bytes must fit — a
        // truncated escape would be dropped or misread by the cube.
        let aligned = (pkt.remaining_nybbles().saturating_sub(2)) & !1;
        if pkt.remaining_nybbles() < 2 || aligned < args.len() * 2 {
            return false;
        }
        pkt.push_nybble(0b1000 | s);
        pkt.push_nybble(DIFF_BASE as u8);
        pkt.align_to_byte();
        for &b in args {
            pkt.push_byte(b);
        }
        true
    }

    fn sample(&self, s: u8) -> u16 {
        self.model.index(
            self.cursor.wrapping_sub(SAMPLES[usize::from(s)])
                % VRAM_WORDS as u16,
        )
    }

    fn write_model(&mut self, index: u16) {
        self.model.set_index(self.cursor, index);
        self.cursor = (self.cursor + 1) % VRAM_WORDS as u16;
    }

    fn emit_literal(&mut self, index: u16, pkt: &mut TxPacket) {
        let w = index_to_word(index);
        self.out(pkt, 0b1100 | ((w >> 14) & 3) as u8);
        self.out(pkt, ((w >> 1) & 0xF) as u8);
        self.out(pkt, (((w >> 9) & 1) << 3 | ((w >> 5) & 7)) as u8);
        self.out(pkt, ((w >> 10) & 0xF) as u8);
    }

    /// Emit the deferred run. `next_is_run_class` promises the next
    /// nybble in the stream will have the run prefix (or that nothing
    /// follows). A bare run nybble in front of that would pair into an
    /// extended code, so short remainders end with one re-emitted primary
    /// — same effect as a repeat, but unmistakably not a run nybble.
    fn flush_run(&mut self, pkt: &mut TxPacket, next_is_run_class: bool) {
        while self.run > MAX_RUN {
            self.emit_long_run(MAX_RUN, pkt);
            self.run -= MAX_RUN;
        }
        if self.run >= 5 {
            let run = self.run;
            self.emit_long_run(run, pkt);
        } else if self.run > 0 {
            if next_is_run_class {
                if self.run >= 2 {
                    self.out(pkt, (self.run - 2) as u8);
                }
                if self.d == 0 {
                    self.out(pkt, 0b0100 | self.s);
                } else {
                    let (s, d) = (self.s, self.d);
                    self.out(pkt, 0b1000 | s);
                    self.out(pkt, (d + DIFF_BASE) as u8);
                }
            } else {
                let n = (self.run - 1) as u8;
                self.out(pkt, n);
            }
        }
        self.run = 0;
    }

    fn emit_long_run(&mut self, count: u16, pkt: &mut TxPacket) {
        debug_assert!((5..=MAX_RUN).contains(&count));
        let n = count - 5;
        self.out(pkt, 0b0010);
        self.out(pkt, ((n >> 4) & 3) as u8);
        self.out(pkt, (n & 0xF) as u8);
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}
