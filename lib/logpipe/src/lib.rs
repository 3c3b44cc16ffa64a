// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side decoder for the VM's structured log records.
//!
//! Guest code never formats text; it emits a 32-bit tag plus raw argument
//! words, and format strings stay behind in the debug binary's log-string
//! section. This keeps the log syscall cheap and the wire format fixed.
//! Decoding happens here, on the host, with the debug binary in hand.

#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};

use abi::log::{LogKind, LogTag, BUFFER_BYTES, SCRIPT_NONE};

/// Capacity for an accumulating script block.
pub const SCRIPT_BUF_BYTES: usize = 1024;

pub struct LogDecoder {
    script_type: u32,
    script_len: usize,
    script_buf: [u8; SCRIPT_BUF_BYTES],
}

impl LogDecoder {
    pub fn new() -> Self {
        Self {
            script_type: SCRIPT_NONE,
            script_len: 0,
            script_buf: [0; SCRIPT_BUF_BYTES],
        }
    }

    /// Decode one record.
    ///
    /// `strings` resolves a format-string offset into the debug binary's
    /// log-string section. Formatted text goes to `out`, except while a
    /// script block is open, in which case it accumulates; a completed
    /// block is handed to `script` with its type.
    ///
    /// Returns the number of payload bytes the record consumed.
    pub fn decode<'s>(
        &mut self,
        tag: LogTag,
        args: &[u32],
        mut strings: impl FnMut(u32) -> Option<&'s str>,
        out: &mut impl Write,
        mut script: impl FnMut(u32, &str),
    ) -> Result<usize, fmt::Error> {
        match tag.kind() {
            Some(LogKind::Fmt) => {
                let arity = tag.arity().min(args.len());
                match strings(tag.param()) {
                    Some(fmt_str) => {
                        let mut text = ScriptOrOut { dec: self, out };
                        format_log(fmt_str, &args[..arity], &mut text)?;
                    }
                    None => {
                        // No debug info; dump the raw record.
                        write!(out, "LOG[{:08x}]", tag.value())?;
                        for a in &args[..arity] {
                            write!(out, " {a:08x}")?;
                        }
                        writeln!(out)?;
                    }
                }
                Ok(arity * 4)
            }
            Some(LogKind::String) => {
                let bytes = (tag.param() as usize).min(BUFFER_BYTES);
                let mut text = ScriptOrOut { dec: self, out };
                for chunk in arg_bytes(args).take(bytes) {
                    text.write_char(char_for(chunk))?;
                }
                Ok(bytes)
            }
            Some(LogKind::Hexdump) => {
                let bytes = (tag.param() as usize).min(BUFFER_BYTES);
                let mut text = ScriptOrOut { dec: self, out };
                for b in arg_bytes(args).take(bytes) {
                    write!(text, "{b:02x}")?;
                }
                Ok(bytes)
            }
            Some(LogKind::Script) => {
                if self.script_type != SCRIPT_NONE {
                    let text = core::str::from_utf8(
                        &self.script_buf[..self.script_len],
                    )
                    .unwrap_or("");
                    script(self.script_type, text);
                }
                self.script_type = tag.param();
                self.script_len = 0;
                Ok(0)
            }
            None => Ok(0),
        }
    }

    fn buffer_byte(&mut self, b: u8) {
        if self.script_len < SCRIPT_BUF_BYTES {
            self.script_buf[self.script_len] = b;
            self.script_len += 1;
        }
    }
}

impl Default for LogDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes formatted text either to the caller's sink or into the open
/// script block.
struct ScriptOrOut<'a, W> {
    dec: &'a mut LogDecoder,
    out: &'a mut W,
}

impl<W: Write> Write for ScriptOrOut<'_, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.dec.script_type == SCRIPT_NONE {
            self.out.write_str(s)
        } else {
            for b in s.bytes() {
                self.dec.buffer_byte(b);
            }
            Ok(())
        }
    }
}

fn arg_bytes(args: &[u32]) -> impl Iterator<Item = u8> + '_ {
    args.iter().flat_map(|a| a.to_le_bytes())
}

fn char_for(b: u8) -> char {
    if b.is_ascii() {
        b as char
    } else {
        char::REPLACEMENT_CHARACTER
    }
}

/// printf-like formatter for log records. Deliberately a subset: only
/// int, float, char, and pointer-ish hex conversions — nothing that would
/// need to dereference guest memory at format time. Floats are single
/// precision, one argument slot each.
pub fn format_log(
    fmt: &str,
    args: &[u32],
    out: &mut impl Write,
) -> fmt::Result {
    let mut args = args.iter().copied();
    let mut chars = fmt.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.write_char(c)?;
            continue;
        }

        let mut zero = false;
        let mut width = 0usize;
        let mut precision: Option<usize> = None;

        loop {
            let Some(&spec) = chars.peek() else {
                return Ok(());
            };
            chars.next();
            match spec {
                '0' if width == 0 && precision.is_none() => zero = true,
                '0'..='9' => match &mut precision {
                    Some(p) => *p = *p * 10 + (spec as usize - '0' as usize),
                    None => {
                        width = width * 10 + (spec as usize - '0' as usize)
                    }
                },
                '.' => precision = Some(0),
                ' ' | '-' | '+' => {}
                '%' => {
                    out.write_char('%')?;
                    break;
                }
                'c' => {
                    let a = args.next().unwrap_or(0);
                    out.write_char(char_for(a as u8))?;
                    break;
                }
                'd' | 'i' => {
                    let a = args.next().unwrap_or(0) as i32;
                    pad_int(out, a as i64, 10, false, zero, width)?;
                    break;
                }
                'u' => {
                    let a = args.next().unwrap_or(0);
                    pad_int(out, i64::from(a), 10, false, zero, width)?;
                    break;
                }
                'x' => {
                    let a = args.next().unwrap_or(0);
                    pad_int(out, i64::from(a), 16, false, zero, width)?;
                    break;
                }
                'X' => {
                    let a = args.next().unwrap_or(0);
                    pad_int(out, i64::from(a), 16, true, zero, width)?;
                    break;
                }
                'p' => {
                    let a = args.next().unwrap_or(0);
                    write!(out, "0x{a:08x}")?;
                    break;
                }
                'f' | 'F' => {
                    let a = f32::from_bits(args.next().unwrap_or(0));
                    let precision = precision.unwrap_or(6);
                    write!(out, "{a:.precision$}")?;
                    break;
                }
                // Unknown conversions are dropped rather than guessed at.
                _ => break,
            }
        }
    }
    Ok(())
}

fn pad_int(
    out: &mut impl Write,
    value: i64,
    radix: u32,
    upper: bool,
    zero: bool,
    width: usize,
) -> fmt::Result {
    match (radix, upper, zero) {
        (16, false, true) => write!(out, "{value:0width$x}"),
        (16, false, false) => write!(out, "{value:width$x}"),
        (16, true, true) => write!(out, "{value:0width$X}"),
        (16, true, false) => write!(out, "{value:width$X}"),
        (_, _, true) => write!(out, "{value:0width$}"),
        _ => write!(out, "{value:width$}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::log::LogKind;

    fn fmt_tag(arity: usize, param: u32) -> LogTag {
        LogTag::new(LogKind::Fmt, arity, param)
    }

    #[test]
    fn formats_ints_floats_and_chars() {
        let mut out = String::new();
        format_log(
            "n=%d hex=%04x pct=%% f=%.2f c=%c",
            &[42, 0xBEu32, 1078530011 /* pi as f32 bits */, b'Q' as u32],
            &mut out,
        )
        .unwrap();
        assert_eq!(out, "n=42 hex=00be pct=% f=3.14 c=Q");
    }

    #[test]
    fn negative_ints_format_signed() {
        let mut out = String::new();
        format_log("%d", &[(-7i32) as u32], &mut out).unwrap();
        assert_eq!(out, "-7");
    }

    #[test]
    fn fmt_record_resolves_through_lookup() {
        let mut dec = LogDecoder::new();
        let mut out = String::new();
        let consumed = dec
            .decode(
                fmt_tag(1, 0x40),
                &[7],
                |off| (off == 0x40).then_some("seven=%d\n"),
                &mut out,
                |_, _| {},
            )
            .unwrap();
        assert_eq!(out, "seven=7\n");
        assert_eq!(consumed, 4);
    }

    #[test]
    fn missing_debug_info_dumps_raw() {
        let mut dec = LogDecoder::new();
        let mut out = String::new();
        dec.decode(fmt_tag(2, 0x99), &[1, 2], |_| None, &mut out, |_, _| {})
            .unwrap();
        assert!(out.contains("LOG["));
        assert!(out.contains("00000001"));
    }

    #[test]
    fn string_and_hexdump_records() {
        let mut dec = LogDecoder::new();
        let mut out = String::new();
        let words = [u32::from_le_bytes(*b"hi!\0")];
        dec.decode(
            LogTag::new(LogKind::String, 1, 3),
            &words,
            |_| None,
            &mut out,
            |_, _| {},
        )
        .unwrap();
        assert_eq!(out, "hi!");

        let mut out = String::new();
        dec.decode(
            LogTag::new(LogKind::Hexdump, 1, 2),
            &[0xBBAA],
            |_| None,
            &mut out,
            |_, _| {},
        )
        .unwrap();
        assert_eq!(out, "aabb");
    }

    #[test]
    fn script_blocks_buffer_until_closed() {
        let mut dec = LogDecoder::new();
        let mut out = String::new();
        let mut scripts = vec![];

        // Open a script block; text now accumulates instead of printing.
        dec.decode(
            LogTag::new(LogKind::Script, 0, abi::log::SCRIPT_LUA),
            &[],
            |_| None,
            &mut out,
            |t, s: &str| scripts.push((t, s.to_string())),
        )
        .unwrap();
        dec.decode(
            fmt_tag(1, 0),
            &[5],
            |_| Some("x=%d"),
            &mut out,
            |t, s: &str| scripts.push((t, s.to_string())),
        )
        .unwrap();
        assert!(out.is_empty());

        // Closing the block delivers it.
        dec.decode(
            LogTag::new(LogKind::Script, 0, abi::log::SCRIPT_NONE),
            &[],
            |_| None,
            &mut out,
            |t, s: &str| scripts.push((t, s.to_string())),
        )
        .unwrap();
        assert_eq!(scripts, vec![(abi::log::SCRIPT_LUA, "x=5".to_string())]);
    }
}
