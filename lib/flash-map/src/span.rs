// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-addressed views over a discontiguous block map.

use arrayvec::ArrayVec;
use flash_device::FlashDevice;

use crate::cache::{BlockCache, BlockRef, CACHE_BLOCK_MASK, CACHE_BLOCK_SIZE};
use crate::{MapBlock, MAP_BLOCK_SIZE, NUM_MAP_BLOCKS};

const CACHE_BLOCKS_PER_MAP_BLOCK: usize = MAP_BLOCK_SIZE / CACHE_BLOCK_SIZE;

/// A contiguous byte range within a volume's map, measured in cache blocks.
///
/// The span owns a copy of the map rather than pointing back into the
/// cached header page, so it stays usable while the cache churns.
#[derive(Clone, Debug, Default)]
pub struct MapSpan {
    blocks: ArrayVec<MapBlock, NUM_MAP_BLOCKS>,
    /// Offset of the span within the map space, in cache blocks.
    first_block: u32,
    /// Length of the span, in cache blocks.
    num_blocks: u32,
}

impl MapSpan {
    pub fn create(
        map: impl IntoIterator<Item = MapBlock>,
        first_block: u32,
        num_blocks: u32,
    ) -> Self {
        let mut blocks = ArrayVec::new();
        blocks.extend(map);
        Self { blocks, first_block, num_blocks }
    }

    pub const fn empty() -> Self {
        Self {
            blocks: ArrayVec::new_const(),
            first_block: 0,
            num_blocks: 0,
        }
    }

    pub fn size_in_bytes(&self) -> u32 {
        self.num_blocks * CACHE_BLOCK_SIZE as u32
    }

    /// True iff `offset` names a byte inside the span. Works securely for
    /// any 32-bit offset.
    pub fn offset_is_valid(&self, offset: u32) -> bool {
        offset < self.size_in_bytes()
    }

    /// Translate a span byte offset into a device address.
    pub fn flash_addr(&self, offset: u32) -> Option<u32> {
        if !self.offset_is_valid(offset) {
            return None;
        }
        let cache_block =
            self.first_block + offset / CACHE_BLOCK_SIZE as u32;
        let entry = self
            .blocks
            .get(cache_block as usize / CACHE_BLOCKS_PER_MAP_BLOCK)
            .copied()?;
        if !entry.is_valid() {
            return None;
        }
        let within = (cache_block as usize % CACHE_BLOCKS_PER_MAP_BLOCK)
            * CACHE_BLOCK_SIZE
            + (offset as usize & CACHE_BLOCK_MASK);
        Some(entry.address() + within as u32)
    }

    /// Inverse of `flash_addr`: recover the span offset of a device
    /// address, if that address lies inside the span.
    pub fn offset_of_flash_addr(&self, addr: u32) -> Option<u32> {
        for (i, entry) in self.blocks.iter().enumerate() {
            if !entry.is_valid() {
                continue;
            }
            let base = entry.address();
            if addr >= base && addr < base + MAP_BLOCK_SIZE as u32 {
                let cache_block = (i * CACHE_BLOCKS_PER_MAP_BLOCK) as u32
                    + (addr - base) / CACHE_BLOCK_SIZE as u32;
                if cache_block < self.first_block
                    || cache_block >= self.first_block + self.num_blocks
                {
                    return None;
                }
                return Some(
                    (cache_block - self.first_block)
                        * CACHE_BLOCK_SIZE as u32
                        + (addr & CACHE_BLOCK_MASK as u32),
                );
            }
        }
        None
    }

    /// Pin the page holding `offset` and return it with the in-page
    /// position and the number of bytes available before the page ends.
    /// `len` is clamped to the page boundary, not extended.
    pub fn map_bytes<'c>(
        &self,
        cache: &'c BlockCache,
        dev: &dyn FlashDevice,
        offset: u32,
        len: u32,
    ) -> Option<(BlockRef<'c>, usize, u32)> {
        let addr = self.flash_addr(offset)?;
        let page = addr & !(CACHE_BLOCK_MASK as u32);
        let within = (addr & CACHE_BLOCK_MASK as u32) as usize;
        let span_remaining = self.size_in_bytes() - offset;
        let avail = (CACHE_BLOCK_SIZE - within) as u32;
        let clamped = len.min(avail).min(span_remaining);
        Some((cache.get(dev, page), within, clamped))
    }

    /// Pin the whole cache page at `offset`, which must be page-aligned.
    pub fn get_block<'c>(
        &self,
        cache: &'c BlockCache,
        dev: &dyn FlashDevice,
        offset: u32,
    ) -> Option<BlockRef<'c>> {
        debug_assert_eq!(offset as usize & CACHE_BLOCK_MASK, 0);
        let addr = self.flash_addr(offset)?;
        Some(cache.get(dev, addr))
    }

    /// Copy out an arbitrary range, spanning pages as needed.
    pub fn copy_bytes(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        mut offset: u32,
        mut out: &mut [u8],
    ) -> bool {
        while !out.is_empty() {
            let Some((page, within, avail)) =
                self.map_bytes(cache, dev, offset, out.len() as u32)
            else {
                return false;
            };
            if avail == 0 {
                return false;
            }
            let chunk = avail as usize;
            page.read(within, &mut out[..chunk]);
            offset += avail;
            out = &mut out[chunk..];
        }
        true
    }

    /// Read a single byte.
    pub fn byte(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        offset: u32,
    ) -> Option<u8> {
        let (page, within, avail) = self.map_bytes(cache, dev, offset, 1)?;
        if avail == 0 {
            return None;
        }
        let byte = page.data()[within];
        Some(byte)
    }

    /// Hint the cache to fetch the page covering `offset`.
    pub fn preload(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        offset: u32,
    ) -> bool {
        match self.map_bytes(cache, dev, offset, 1) {
            Some(_) => true,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flash_device::SimFlash;

    fn two_block_span() -> MapSpan {
        // Deliberately discontiguous and out of device order.
        MapSpan::create(
            [MapBlock::from_index(5), MapBlock::from_index(2)],
            0,
            (2 * CACHE_BLOCKS_PER_MAP_BLOCK) as u32,
        )
    }

    #[test]
    fn addresses_follow_the_map() {
        let span = two_block_span();
        assert_eq!(span.flash_addr(0), Some(5 * MAP_BLOCK_SIZE as u32));
        assert_eq!(
            span.flash_addr(MAP_BLOCK_SIZE as u32),
            Some(2 * MAP_BLOCK_SIZE as u32)
        );
        assert_eq!(
            span.flash_addr(MAP_BLOCK_SIZE as u32 + 300),
            Some(2 * MAP_BLOCK_SIZE as u32 + 300)
        );
        assert_eq!(span.flash_addr(2 * MAP_BLOCK_SIZE as u32), None);
    }

    #[test]
    fn offset_round_trip() {
        let span = two_block_span();
        for offset in
            [0u32, 17, CACHE_BLOCK_SIZE as u32, MAP_BLOCK_SIZE as u32 + 42]
        {
            let addr = span.flash_addr(offset).unwrap();
            assert_eq!(span.offset_of_flash_addr(addr), Some(offset));
        }
        // An address outside the span does not reverse-map.
        assert_eq!(span.offset_of_flash_addr(0), None);
    }

    #[test]
    fn copy_spans_page_and_block_boundaries() {
        let mut dev = SimFlash::new();
        let span = two_block_span();

        // Straddle the map-block boundary: last 4 bytes of block 5, first
        // 4 bytes of block 2.
        let boundary = MAP_BLOCK_SIZE as u32 - 4;
        let addr_a = span.flash_addr(boundary).unwrap();
        let addr_b = span.flash_addr(MAP_BLOCK_SIZE as u32).unwrap();
        dev.write(addr_a, &[1, 2, 3, 4]);
        dev.write(addr_b, &[5, 6, 7, 8]);

        let cache = BlockCache::new();
        let mut out = [0u8; 8];
        assert!(span.copy_bytes(&cache, &dev, boundary, &mut out));
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn map_bytes_clamps_to_page() {
        let dev = SimFlash::new();
        let cache = BlockCache::new();
        let span = two_block_span();

        let (_, within, avail) =
            span.map_bytes(&cache, &dev, 250, 100).unwrap();
        assert_eq!(within, 250);
        assert_eq!(avail, 6);
    }

    #[test]
    fn invalid_map_entry_blocks_access() {
        let span = MapSpan::create(
            [MapBlock::INVALID],
            0,
            CACHE_BLOCKS_PER_MAP_BLOCK as u32,
        );
        assert_eq!(span.flash_addr(0), None);
        assert!(span.offset_is_valid(0));
    }
}
