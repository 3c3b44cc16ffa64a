// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cube-side decoder for the VRAM codec.
//!
//! One code may be split across a maximum-length packet boundary, so all
//! partial-code state lives in the `Decoder` between packets. A short
//! packet discards partial codes and resets code state, which is the
//! protocol's resync mechanism. The VRAM write cursor survives a short
//! packet (the encoder re-seeks after a reset); a radio hop resets
//! everything.

use crate::{VramBuffer, DIFF_BASE, PACKET_BYTES, SAMPLES, VRAM_WORDS};

/// Where escape payloads go. Flash data feeds the loadstream FIFO; the
/// radio-control escapes are handled by the radio layer and default to
/// ignored here.
pub trait EscapeSink {
    fn flash_bytes(&mut self, bytes: &[u8]);
    fn flash_reset(&mut self);
    fn sensor_sync(&mut self, _timer_reload: u16) {}
    fn ack_request(&mut self) {}
    fn radio_hop(&mut self, _payload: &[u8]) {}
    fn radio_nap(&mut self, _duration: u16) {}
}

/// Sink that drops everything; useful for tests that only touch VRAM.
pub struct NullSink;

impl EscapeSink for NullSink {
    fn flash_bytes(&mut self, _bytes: &[u8]) {}
    fn flash_reset(&mut self) {}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Opcode,
    /// Saw `10ss`, awaiting the diff nybble.
    Diff { s: u8 },
    /// Collecting the three trailing nybbles of a 14-bit literal.
    Lit14 { step: u8, word: u16 },
    /// One run nybble seen; the run executes when a non-run nybble (or a
    /// packet boundary) resolves it, or pairs into an extended code.
    RunPending { first: u8 },
    /// Saw `0010 00nn`, awaiting the low count nybble.
    LongRun { high: u8 },
    /// Collecting a 9-bit write address.
    SetAddr { bit8: u8, step: u8, addr: u16 },
    /// Collecting a raw 16-bit word.
    Lit16 { step: u8, word: u16 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Escape {
    Flash,
    SensorSync,
    AckRequest,
    RadioHop,
    RadioNap,
}

pub struct Decoder {
    state: State,
    /// Current sample point index.
    s: u8,
    /// Current diff, already de-biased.
    d: i16,
    /// VRAM write cursor, in words.
    cursor: u16,
}

impl Decoder {
    pub fn new() -> Self {
        Self { state: State::Opcode, s: 0, d: 0, cursor: 0 }
    }

    pub fn cursor(&self) -> u16 {
        self.cursor
    }

    /// Decode one received packet into `vram`, routing escape payloads to
    /// `sink`.
    pub fn decode_packet(
        &mut self,
        packet: &[u8],
        vram: &mut VramBuffer,
        sink: &mut impl EscapeSink,
    ) {
        let nybbles = packet.len() * 2;
        let mut i = 0;
        while i < nybbles {
            let n = (packet[i / 2] >> ((i % 2) * 4)) & 0xF;
            i += 1;

            if let Some(escape) = self.take_nybble(n, vram) {
                // Byte-mode escapes claim the remainder of the packet,
                // starting at the next byte boundary.
                let rest = &packet[i.div_ceil(2)..];
                self.handle_escape(escape, rest, sink);
                break;
            }
        }

        if packet.len() < PACKET_BYTES {
            self.end_short_packet();
        }
    }

    fn take_nybble(
        &mut self,
        n: u8,
        vram: &mut VramBuffer,
    ) -> Option<Escape> {
        match self.state {
            State::RunPending { first } => {
                if n >> 2 == 0 {
                    // Two run nybbles in a row: an extended code, not a
                    // run. The first nybble selects the flavor.
                    self.state = State::Opcode;
                    match first {
                        0 | 1 => {
                            // Skip output words without writing.
                            let count = ((n & 3) << 1) | (first & 1);
                            self.cursor = (self.cursor + u16::from(count) + 1)
                                % VRAM_WORDS as u16;
                        }
                        2 => self.state = State::LongRun { high: n & 3 },
                        _ => match n {
                            0 => {
                                self.state =
                                    State::SetAddr { bit8: 0, step: 0, addr: 0 }
                            }
                            1 => {
                                self.state =
                                    State::SetAddr { bit8: 1, step: 0, addr: 0 }
                            }
                            2 => {
                                self.state = State::Lit16 { step: 0, word: 0 }
                            }
                            _ => return Some(Escape::Flash),
                        },
                    }
                    None
                } else {
                    // A non-run successor resolves the deferred run.
                    self.state = State::Opcode;
                    self.run(u16::from(first) + 1, vram);
                    self.opcode_nybble(n, vram)
                }
            }
            State::Opcode => self.opcode_nybble(n, vram),
            State::Diff { s } => {
                self.state = State::Opcode;
                if n == DIFF_BASE as u8 {
                    // Redundant zero-diff encodings are repurposed as
                    // escapes.
                    return Some(match s {
                        0 => Escape::SensorSync,
                        1 => Escape::AckRequest,
                        2 => Escape::RadioHop,
                        _ => Escape::RadioNap,
                    });
                }
                self.s = s;
                self.d = (n) as i16 - DIFF_BASE;
                self.delta_word(vram);
                None
            }
            State::Lit14 { step, word } => {
                let word = match step {
                    // Word bits [4:1].
                    0 => word | (u16::from(n) << 1),
                    // Word bits 9, [7:5].
                    1 => {
                        word
                            | (u16::from(n >> 3) << 9)
                            | (u16::from(n & 7) << 5)
                    }
                    // Word bits [13:10].
                    _ => word | (u16::from(n) << 10),
                };
                if step == 2 {
                    self.state = State::Opcode;
                    vram.set_word(self.cursor, word);
                    self.advance();
                    self.s = 0;
                    self.d = 0;
                } else {
                    self.state = State::Lit14 { step: step + 1, word };
                }
                None
            }
            State::LongRun { high } => {
                self.state = State::Opcode;
                let count = (u16::from(high) << 4 | u16::from(n)) + 5;
                self.run(count, vram);
                None
            }
            State::SetAddr { bit8, step, addr } => {
                if step == 0 {
                    self.state = State::SetAddr {
                        bit8,
                        step: 1,
                        addr: u16::from(n),
                    };
                } else {
                    self.state = State::Opcode;
                    self.cursor =
                        addr | (u16::from(n) << 4) | (u16::from(bit8) << 8);
                }
                None
            }
            State::Lit16 { step, word } => {
                let word = word | (u16::from(n) << (4 * step));
                if step == 3 {
                    self.state = State::Opcode;
                    vram.set_word(self.cursor, word);
                    self.advance();
                    self.s = 0;
                    self.d = 0;
                } else {
                    self.state = State::Lit16 { step: step + 1, word };
                }
                None
            }
        }
    }

    fn opcode_nybble(
        &mut self,
        n: u8,
        vram: &mut VramBuffer,
    ) -> Option<Escape> {
        match n >> 2 {
            0 => self.state = State::RunPending { first: n },
            1 => {
                // Copy sample s.
                self.s = n & 3;
                self.d = 0;
                self.delta_word(vram);
            }
            2 => self.state = State::Diff { s: n & 3 },
            _ => {
                // Literal: the first nybble carries word bits [15:14].
                self.state =
                    State::Lit14 { step: 0, word: u16::from(n & 3) << 14 };
            }
        }
        None
    }

    /// Write one delta word: sample, bias, store, advance.
    fn delta_word(&mut self, vram: &mut VramBuffer) {
        let sample_addr = self
            .cursor
            .wrapping_sub(SAMPLES[usize::from(self.s)])
            % VRAM_WORDS as u16;
        let value =
            ((vram.index(sample_addr)) as i16 + self.d) as u16 & 0x3FFF;
        vram.set_index(self.cursor, value);
        self.advance();
    }

    fn run(&mut self, count: u16, vram: &mut VramBuffer) {
        for _ in 0..count {
            self.delta_word(vram);
        }
    }

    fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % VRAM_WORDS as u16;
    }

    fn handle_escape(
        &mut self,
        escape: Escape,
        rest: &[u8],
        sink: &mut impl EscapeSink,
    ) {
        self.state = State::Opcode;
        match escape {
            Escape::Flash => {
                // Zero trailing bytes means "reset the loadstream
                // decoder", acknowledged out of band.
                if rest.is_empty() {
                    sink.flash_reset();
                } else {
                    sink.flash_bytes(rest);
                }
            }
            Escape::SensorSync => {
                if rest.len() >= 2 {
                    sink.sensor_sync(u16::from_le_bytes([rest[0], rest[1]]));
                }
            }
            Escape::AckRequest => sink.ack_request(),
            Escape::RadioHop => {
                sink.radio_hop(rest);
                // A hop tears down the whole codec state.
                *self = Self::new();
            }
            Escape::RadioNap => {
                if rest.len() >= 2 {
                    sink.radio_nap(u16::from_le_bytes([rest[0], rest[1]]));
                }
            }
        }
    }

    /// A non-max-length packet ended: partial codes are ignored — this
    /// includes a still-deferred run, and with it the zero nybble that
    /// pads out a packet's final half byte. The cursor survives; the
    /// encoder re-seeks after a reset.
    fn end_short_packet(&mut self) {
        self.state = State::Opcode;
        self.s = 0;
        self.d = 0;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_to_word;

    fn short(packet: &[u8]) -> Vec<u8> {
        packet.to_vec()
    }

    #[test]
    fn literal_then_copy_left() {
        let mut dec = Decoder::new();
        let mut vram = VramBuffer::new();

        // Literal index 0x123, then `01 00` copy of sample 0 (one left).
        let w = index_to_word(0x123);
        let nybbles = [
            0xC | ((w >> 14) & 3) as u8,
            ((w >> 1) & 0xF) as u8,
            (((w >> 9) & 1) << 3 | ((w >> 5) & 7)) as u8,
            ((w >> 10) & 0xF) as u8,
            0x4, // copy sample 0
        ];
        let mut packet = vec![];
        for pair in nybbles.chunks(2) {
            let lo = pair[0];
            let hi = pair.get(1).copied().unwrap_or(0);
            packet.push(lo | (hi << 4));
        }

        let mut sink = NullSink;
        dec.decode_packet(&short(&packet), &mut vram, &mut sink);

        assert_eq!(vram.index(0), 0x123);
        assert_eq!(vram.index(1), 0x123);
        assert_eq!(dec.cursor(), 2);
    }

    #[test]
    fn deferred_run_resolves_on_next_code() {
        let mut dec = Decoder::new();
        let mut vram = VramBuffer::new();
        vram.set_index(100, 7);

        let mut sink = NullSink;
        // set addr 101 ; diff s0 +1 ; run nybble 0001 (two repeats),
        // resolved by a following diff ; trailing pad nybble ignored.
        let packet = [0x03, 0x65, 0x88, 0x81, 0x08];
        dec.decode_packet(&packet, &mut vram, &mut sink);

        assert_eq!(vram.index(101), 8);
        assert_eq!(vram.index(102), 9);
        assert_eq!(vram.index(103), 10);
        assert_eq!(vram.index(104), 11);
        assert_eq!(dec.cursor(), 105);
    }

    #[test]
    fn pending_run_at_short_packet_end_is_a_partial_code() {
        let mut dec = Decoder::new();
        let mut vram = VramBuffer::new();
        vram.set_index(100, 7);

        let mut sink = NullSink;
        // diff at 101, copy at 102, then a run nybble with no successor:
        // the run is a partial code, dropped at the short-packet boundary.
        let packet = [0x03, 0x65, 0x88, 0x14];
        dec.decode_packet(&packet, &mut vram, &mut sink);

        assert_eq!(vram.index(101), 8);
        assert_eq!(vram.index(102), 8);
        assert_eq!(vram.index(103), 0);
        assert_eq!(dec.cursor(), 103);
    }

    #[test]
    fn skip_moves_cursor_without_writing() {
        let mut dec = Decoder::new();
        let mut vram = VramBuffer::new();
        let mut sink = NullSink;

        // 0001 0011 : skip (first=1, second=3) -> count 0b111 + 1 = 8.
        dec.decode_packet(&[0x31], &mut vram, &mut sink);
        assert_eq!(dec.cursor(), 8);
        assert_eq!(vram.words(), VramBuffer::new().words());
    }

    #[test]
    fn flash_escape_routes_remaining_bytes() {
        struct Capture(Vec<u8>, usize);
        impl EscapeSink for Capture {
            fn flash_bytes(&mut self, bytes: &[u8]) {
                self.0.extend_from_slice(bytes);
            }
            fn flash_reset(&mut self) {
                self.1 += 1;
            }
        }

        let mut dec = Decoder::new();
        let mut vram = VramBuffer::new();
        let mut sink = Capture(vec![], 0);

        // 0011 0011 then payload bytes.
        dec.decode_packet(&[0x33, 0xDE, 0xAD], &mut vram, &mut sink);
        assert_eq!(sink.0, vec![0xDE, 0xAD]);
        assert_eq!(sink.1, 0);

        // Escape with nothing after it: a loadstream reset request.
        dec.decode_packet(&[0x33], &mut vram, &mut sink);
        assert_eq!(sink.1, 1);
    }

    #[test]
    fn radio_hop_resets_codec_state() {
        struct Hop(Vec<u8>);
        impl EscapeSink for Hop {
            fn flash_bytes(&mut self, _: &[u8]) {}
            fn flash_reset(&mut self) {}
            fn radio_hop(&mut self, payload: &[u8]) {
                self.0 = payload.to_vec();
            }
        }

        let mut dec = Decoder::new();
        let mut vram = VramBuffer::new();
        let mut sink = Hop(vec![]);

        // Move the cursor, then hop: 1010 0111 + channel byte.
        dec.decode_packet(&[0x03, 0x65], &mut vram, &mut sink); // set addr 101
        assert_eq!(dec.cursor(), 101);
        dec.decode_packet(&[0x7A, 0x2A], &mut vram, &mut sink);
        assert_eq!(sink.0, vec![0x2A]);
        assert_eq!(dec.cursor(), 0);
    }
}
