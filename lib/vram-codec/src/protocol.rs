// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cube → master acknowledgment packet layout.
//!
//! The full ACK structure describes everything a cube can report back.
//! Bytes at the tail that haven't changed since the previous ACK may be
//! omitted, so a received ACK is a prefix of this struct; in the most
//! trivial case it's empty.

use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const HWID_LEN: usize = 8;

// Valid truncation lengths, shortest to longest.
pub const ACK_LEN_EMPTY: usize = 0;
pub const ACK_LEN_FRAME: usize = 1;
pub const ACK_LEN_ACCEL: usize = 4;
pub const ACK_LEN_NEIGHBOR: usize = 8;
pub const ACK_LEN_FLASH_FIFO: usize = 9;
pub const ACK_LEN_BATTERY_V: usize = 11;
pub const ACK_LEN_HWID: usize = 19;
pub const ACK_LEN_MAX: usize = ACK_LEN_HWID;

// frame_count bit assignments.
pub const QUERY_ACK_BIT: u8 = 0x80;
pub const FRAME_ACK_CONTINUOUS: u8 = 0x40;
pub const FRAME_ACK_COUNT: u8 = 0x3F;
pub const FRAME_ACK_TOGGLE: u8 = 0x01;

// Neighbor byte assignments.
pub const NB_ID_MASK: u8 = 0x1F;
pub const NB_FLAG_SIDE_ACTIVE: u8 = 0x80;
pub const NB0_FLAG_TOUCH: u8 = 0x40;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct AckPacket {
    /// Frame sync counter, plus the query-response and continuous-render
    /// bits. If `QUERY_ACK_BIT` is set this is not a normal ACK at all:
    /// the low bits identify the query this packet answers and the rest
    /// of the contents are query-specific.
    pub frame_count: u8,
    /// Signed 8-bit accelerometer sample, x/y/z.
    pub accel: [u8; 3],
    /// Neighbor IDs in the low bits, flags above.
    pub neighbors: [u8; 4],
    /// Bytes consumed by the flash loadstream decoder so far. Wraps, and
    /// never decrements; a loadstream reset completion bumps it by one.
    pub flash_fifo_bytes: u8,
    /// Raw battery voltage, little-endian.
    pub battery_v: [u8; 2],
    pub hwid: [u8; HWID_LEN],
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<AckPacket>(),
    ACK_LEN_MAX
);

impl AckPacket {
    /// Overlay a possibly-truncated ACK onto the last known full state.
    pub fn merge_from(&mut self, bytes: &[u8]) {
        use zerocopy::IntoBytes;
        debug_assert!(bytes.len() <= ACK_LEN_MAX);
        self.as_mut_bytes()[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn is_query_response(&self) -> bool {
        self.frame_count & QUERY_ACK_BIT != 0
    }

    pub fn frame_counter(&self) -> u8 {
        self.frame_count & FRAME_ACK_COUNT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_ack_merges_over_previous() {
        let mut state = AckPacket::default();
        state.battery_v = [0x34, 0x12];

        // A short ACK carrying only frame + accel leaves the tail alone.
        state.merge_from(&[0x05, 1, 2, 3]);
        assert_eq!(state.frame_counter(), 5);
        assert_eq!(state.accel, [1, 2, 3]);
        assert_eq!(state.battery_v, [0x34, 0x12]);
        assert!(!state.is_query_response());
    }
}
