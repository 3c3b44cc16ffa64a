// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest address space: 32 KiB of user RAM at a fixed virtual base, plus
//! two read-only flash segments backed by volume payload spans. Code
//! executes only from segment 0, and only from regions the validator has
//! certified.
//!
//! Registers are native-width, so on a 64-bit host a register can carry
//! junk above bit 31 — the leftovers of 32-bit arithmetic emulated at
//! full register width. Every translation therefore begins by squashing
//! the address to 32 bits, and anything storing an address back into
//! guest-visible memory must do the same, or stack-derived and
//! register-derived pointers would disagree about the same location.

use abi::Reg;
use bitflags::bitflags;
use flash_device::FlashDevice;
use flash_map::{BlockCache, BlockRef, MapSpan, CACHE_BLOCK_MASK};

use crate::validator;

pub const RAM_SIZE: usize = 32 * 1024;
pub const VIRTUAL_RAM_BASE: u32 = 0x0001_0000;

pub const NUM_FLASH_SEGMENTS: usize = 2;
pub const SEGMENT_0_VA: u32 = 0x8000_0000;
pub const SEGMENT_1_VA: u32 = 0xC000_0000;

const SEGMENT_VA: [u32; NUM_FLASH_SEGMENTS] = [SEGMENT_0_VA, SEGMENT_1_VA];

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SegmentAttrs: u32 {
        const READ = 1 << 0;
        /// Only segment 0 carries this; `map_ro_code` refuses the rest.
        const EXECUTE = 1 << 2;
    }
}

struct Segment {
    span: MapSpan,
    attrs: SegmentAttrs,
}

/// Truncate a native-width register value to a 32-bit virtual address.
#[inline(always)]
pub fn squash(va: Reg) -> u32 {
    va as u32
}

#[inline(always)]
pub fn is_aligned(va: Reg, alignment: u32) -> bool {
    squash(va) % alignment == 0
}

/// A successfully translated read-only range.
pub enum RoMapping<'c> {
    Ram { offset: usize, len: u32 },
    Flash { block: BlockRef<'c>, offset: usize, len: u32 },
}

pub struct SvmMemory {
    ram: [u8; RAM_SIZE],
    segs: [Segment; NUM_FLASH_SEGMENTS],
}

impl SvmMemory {
    pub fn new() -> Self {
        Self {
            ram: [0; RAM_SIZE],
            segs: [
                Segment {
                    span: MapSpan::empty(),
                    attrs: SegmentAttrs::READ | SegmentAttrs::EXECUTE,
                },
                Segment {
                    span: MapSpan::empty(),
                    attrs: SegmentAttrs::READ,
                },
            ],
        }
    }

    /// Back flash segment `index` with a volume payload span.
    pub fn set_segment(&mut self, index: usize, span: MapSpan) {
        self.segs[index].span = span;
    }

    pub fn ram(&self) -> &[u8; RAM_SIZE] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8; RAM_SIZE] {
        &mut self.ram
    }

    /// Translate a guest RAM range to an offset into the RAM array.
    ///
    /// Both the standard virtual base and already-physical offsets are
    /// accepted: addresses derived from the stack pointer may have been
    /// squashed from either form. With `len == 0`, the address one past
    /// the end of RAM is valid. The extent check must work securely for
    /// any possible 32-bit length.
    pub fn map_ram(&self, va: Reg, len: u32) -> Result<usize, ()> {
        let va = squash(va);
        let offset = if (va as usize) <= RAM_SIZE {
            // Already a physical offset; this arises from pointer
            // arithmetic on the stack pointer.
            va as usize
        } else {
            va.wrapping_sub(VIRTUAL_RAM_BASE) as usize
        };

        if offset <= RAM_SIZE && len as usize <= RAM_SIZE - offset {
            Ok(offset)
        } else {
            Err(())
        }
    }

    fn segment_offset(&self, index: usize, va: u32) -> Option<u32> {
        let off = va.wrapping_sub(SEGMENT_VA[index]);
        self.segs[index].span.offset_is_valid(off).then_some(off)
    }

    /// True iff the whole range is readable: RAM or either flash segment.
    pub fn check_ro(&self, va: Reg, len: u32) -> bool {
        if self.map_ram(va, len).is_ok() {
            return true;
        }
        let va = squash(va);
        let last = len.saturating_sub(1);
        (0..NUM_FLASH_SEGMENTS).any(|i| {
            self.segment_offset(i, va).is_some()
                && self.segment_offset(i, va.wrapping_add(last)).is_some()
        })
    }

    /// Map a read-only range. Flash mappings may clamp `len` to the
    /// bytes remaining in one cache block; the returned block reference
    /// pins that block for the mapping's lifetime.
    pub fn map_ro<'c>(
        &self,
        cache: &'c BlockCache,
        dev: &dyn FlashDevice,
        va: Reg,
        len: u32,
    ) -> Result<RoMapping<'c>, ()> {
        if let Ok(offset) = self.map_ram(va, len) {
            return Ok(RoMapping::Ram { offset, len });
        }

        let va = squash(va);
        for i in 0..NUM_FLASH_SEGMENTS {
            let Some(off) = self.segment_offset(i, va) else {
                continue;
            };
            let Some((block, within, clamped)) =
                self.segs[i].span.map_bytes(cache, dev, off, len)
            else {
                continue;
            };
            if clamped == 0 && len != 0 {
                continue;
            }
            return Ok(RoMapping::Flash {
                block,
                offset: within,
                len: clamped,
            });
        }
        Err(())
    }

    /// Map one validated code location in segment 0.
    ///
    /// The low two bits and high byte of `va` are ignored; real branch
    /// targets are word-aligned and some callers pack flags up top. The
    /// returned offset is within the block, and is guaranteed — this is
    /// the security boundary — to lie inside the prefix of the block
    /// that the validator certified. A literal pool can never be mapped
    /// as code.
    pub fn map_ro_code<'c>(
        &self,
        cache: &'c BlockCache,
        dev: &dyn FlashDevice,
        va: Reg,
    ) -> Result<(BlockRef<'c>, usize), ()> {
        if !self.segs[0].attrs.contains(SegmentAttrs::EXECUTE) {
            return Err(());
        }

        let flash_offset = squash(va) & 0x00FF_FFFC;
        let block_offset = flash_offset & !(CACHE_BLOCK_MASK as u32);

        let block = self.segs[0]
            .span
            .get_block(cache, dev, block_offset)
            .ok_or(())?;

        // The validator result rides in the cache entry, computed once
        // per residency of the block.
        let bundles = match block.code_len() {
            Some(n) => n,
            None => {
                let mut code = [0u8; flash_map::CACHE_BLOCK_SIZE];
                block.read(0, &mut code);
                let n = validator::valid_bundles(&code);
                block.set_code_len(n);
                n
            }
        };

        let within = (flash_offset as usize) & CACHE_BLOCK_MASK;
        if within / abi::BUNDLE_SIZE >= bundles {
            return Err(());
        }
        Ok((block, within))
    }

    /// Bulk copy from RAM or flash into a host buffer.
    pub fn copy_ro(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        dst: &mut [u8],
        va: Reg,
    ) -> bool {
        if let Ok(offset) = self.map_ram(va, dst.len() as u32) {
            dst.copy_from_slice(&self.ram[offset..offset + dst.len()]);
            return true;
        }

        let va = squash(va);
        for i in 0..NUM_FLASH_SEGMENTS {
            if let Some(off) = self.segment_offset(i, va) {
                return self.segs[i].span.copy_bytes(cache, dev, off, dst);
            }
        }
        false
    }

    /// NUL-terminated string copy with a destination bound. The
    /// destination is always terminated on success.
    pub fn strlcpy_ro(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        dst: &mut [u8],
        mut va: Reg,
    ) -> bool {
        if dst.is_empty() {
            return false;
        }
        let last = dst.len() - 1;
        let mut n = 0;
        while n < last {
            let mut byte = [0u8; 1];
            if !self.copy_ro(cache, dev, &mut byte, va) {
                return false;
            }
            if byte[0] == 0 {
                break;
            }
            dst[n] = byte[0];
            n += 1;
            va = va.wrapping_add(1);
        }
        dst[n] = 0;
        true
    }

    /// Hint the cache to fetch the block covering `va`.
    pub fn preload(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        va: Reg,
    ) -> bool {
        let va = squash(va);
        (0..NUM_FLASH_SEGMENTS).any(|i| {
            self.segment_offset(i, va)
                .map(|off| self.segs[i].span.preload(cache, dev, off))
                .unwrap_or(false)
        })
    }

    //
    // Typed guest accessors used by the interpreter. Addresses must have
    // been alignment-checked by the caller; these only translate.
    //

    pub fn read_u32(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        va: Reg,
    ) -> Result<u32, ()> {
        let mut bytes = [0u8; 4];
        if self.copy_ro(cache, dev, &mut bytes, va) {
            Ok(u32::from_le_bytes(bytes))
        } else {
            Err(())
        }
    }

    pub fn read_u16(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        va: Reg,
    ) -> Result<u16, ()> {
        let mut bytes = [0u8; 2];
        if self.copy_ro(cache, dev, &mut bytes, va) {
            Ok(u16::from_le_bytes(bytes))
        } else {
            Err(())
        }
    }

    pub fn read_u8(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        va: Reg,
    ) -> Result<u8, ()> {
        let mut bytes = [0u8; 1];
        if self.copy_ro(cache, dev, &mut bytes, va) {
            Ok(bytes[0])
        } else {
            Err(())
        }
    }

    pub fn write_u32(&mut self, va: Reg, value: u32) -> Result<(), ()> {
        let offset = self.map_ram(va, 4)?;
        self.ram[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u16(&mut self, va: Reg, value: u16) -> Result<(), ()> {
        let offset = self.map_ram(va, 2)?;
        self.ram[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u8(&mut self, va: Reg, value: u8) -> Result<(), ()> {
        let offset = self.map_ram(va, 1)?;
        self.ram[offset] = value;
        Ok(())
    }
}

impl Default for SvmMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_translation_accepts_both_forms() {
        let mem = SvmMemory::new();

        // Virtual base form.
        assert_eq!(mem.map_ram(VIRTUAL_RAM_BASE as Reg, 4), Ok(0));
        assert_eq!(
            mem.map_ram((VIRTUAL_RAM_BASE + 0x100) as Reg, 4),
            Ok(0x100)
        );
        // Physical-offset form, from stack pointer arithmetic.
        assert_eq!(mem.map_ram(0x100, 4), Ok(0x100));

        // One past the end is valid at length zero only.
        let end = (VIRTUAL_RAM_BASE as usize + RAM_SIZE) as Reg;
        assert_eq!(mem.map_ram(end, 0), Ok(RAM_SIZE));
        assert!(mem.map_ram(end, 1).is_err());
    }

    #[test]
    fn ram_extent_is_checked_for_any_length() {
        let mem = SvmMemory::new();
        assert!(mem.map_ram(VIRTUAL_RAM_BASE as Reg, u32::MAX).is_err());
        assert!(mem
            .map_ram((VIRTUAL_RAM_BASE + 1) as Reg, RAM_SIZE as u32)
            .is_err());
        assert!(mem.map_ram(0x4000_0000, 4).is_err());
    }

    #[test]
    fn junk_in_upper_bits_is_squashed() {
        let mem = SvmMemory::new();
        if core::mem::size_of::<Reg>() > 4 {
            // Simulated 64-bit underflow leftovers.
            let va = 0xFFFF_FFFF_0001_0000u64 as Reg;
            assert_eq!(mem.map_ram(va, 4), Ok(0));
        }
    }

    #[test]
    fn ram_read_write_round_trip() {
        let mut mem = SvmMemory::new();
        mem.write_u32(VIRTUAL_RAM_BASE as Reg + 8, 0xAABBCCDD).unwrap();
        assert_eq!(
            u32::from_le_bytes(mem.ram()[8..12].try_into().unwrap()),
            0xAABBCCDD
        );
        assert!(mem.write_u32(0x7000_0000, 1).is_err());
    }
}
