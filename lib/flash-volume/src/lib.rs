// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Volume layer of the flash stack.
//!
//! Volumes are coarsely-allocated, physically discontiguous regions of
//! flash, located and enumerated purely by scanning for valid headers —
//! there is no allocation table to corrupt. A volume supports enumeration,
//! payload mapping, atomic-feeling creation (via the `T_INCOMPLETE` type),
//! deletion by a single in-place write, and block-by-block reclamation
//! with wear leveling.
//!
//! Erase counts travel inside each volume's header. An allocation that
//! loses power leaves a `T_INCOMPLETE` volume whose whole purpose is to
//! keep those counts reachable; a fully uninitialized or damaged device
//! degrades to orphan blocks whose counts are estimated from the average.

#![cfg_attr(not(test), no_std)]

use flash_device::FlashDevice;
use flash_map::{
    BlockCache, BlockWriter, MapBlock, MapBlockSet, MapSpan, CACHE_BLOCK_SIZE,
};

pub mod header;
mod eraselog;
mod recycler;
mod writer;

pub use eraselog::{EraseLog, EraseLogRecord, PreEraser, NUM_LOG_RECORDS};
pub use recycler::{RecycledBlock, Recycler};
pub use writer::VolumeWriter;

use header::VolumeHeader;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FsError {
    /// No recyclable blocks remain; the device is full.
    NoSpace,
    /// The named volume is missing or failed validation.
    InvalidVolume,
}

/// A single volume, named by its header block.
///
/// None of the volume's state lives in RAM; every accessor reads through
/// the block cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    pub block: MapBlock,
}

impl Volume {
    pub fn new(block: MapBlock) -> Self {
        Self { block }
    }

    /// Full validity check: header prefix valid, and both CRCs good. The
    /// map CRC is skipped for recyclable volumes, whose map entries are
    /// invalidated one at a time as blocks are reclaimed.
    pub fn is_valid(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
    ) -> bool {
        if !self.block.is_valid() {
            return false;
        }

        let page = cache.get(dev, self.block.address());
        let hdr = VolumeHeader::read(&page.data());
        if !hdr.is_valid() {
            return false;
        }

        // Redundant fields can agree by chance on hostile or damaged
        // data; the implied map still has to fit the device.
        let n = hdr.num_map_entries();
        if n > flash_map::NUM_MAP_BLOCKS {
            return false;
        }
        if !header::type_is_recyclable(hdr.type_code.get())
            && hdr.crc_map.get() != header::map_crc(&page.data(), n)
        {
            return false;
        }

        let mut counts = [0u32; flash_map::NUM_MAP_BLOCKS];
        for (i, slot) in counts[..n].iter_mut().enumerate() {
            *slot = self.erase_count_inner(cache, dev, &hdr, i);
        }
        hdr.crc_erase.get() == header::erase_crc(&counts[..n])
    }

    pub fn header(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
    ) -> VolumeHeader {
        let page = cache.get(dev, self.block.address());
        let header = VolumeHeader::read(&page.data());
        header
    }

    pub fn type_code(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
    ) -> u16 {
        self.header(cache, dev).type_code.get()
    }

    pub fn parent(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
    ) -> Option<MapBlock> {
        let p = self.header(cache, dev).parent();
        p.is_valid().then_some(p)
    }

    /// Copy the volume's map out of the header block.
    pub fn map(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        out: &mut [MapBlock],
    ) -> usize {
        let page = cache.get(dev, self.block.address());
        let hdr = VolumeHeader::read(&page.data());
        let n = hdr.num_map_entries();
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = header::map_entry(&page.data(), i);
        }
        n
    }

    /// The volume's payload, as a byte-addressed span.
    pub fn payload(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
    ) -> MapSpan {
        let page = cache.get(dev, self.block.address());
        let hdr = VolumeHeader::read(&page.data());
        let n = hdr.num_map_entries();
        let data = usize::from(hdr.data_bytes.get());
        let map =
            (0..n).map(|i| header::map_entry(&page.data(), i));
        MapSpan::create(
            map,
            header::payload_offset_blocks(n, data) as u32,
            u32::from(hdr.payload_blocks.get()),
        )
    }

    /// Device address and length of the type-specific data area, which is
    /// guaranteed to live inside the header block when its size is at most
    /// `MAX_MAPPABLE_DATA_BYTES`.
    pub fn type_data_region(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
    ) -> (u32, usize) {
        let hdr = self.header(cache, dev);
        let n = hdr.num_map_entries();
        let off = header::data_offset(n);
        (
            self.block.address() + off as u32,
            usize::from(hdr.data_bytes.get()),
        )
    }

    /// Stored erase count for map entry `index`.
    pub fn erase_count(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        index: usize,
    ) -> u32 {
        let hdr = self.header(cache, dev);
        self.erase_count_inner(cache, dev, &hdr, index)
    }

    fn erase_count_inner(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        hdr: &VolumeHeader,
        index: usize,
    ) -> u32 {
        let n = hdr.num_map_entries();
        debug_assert!(index < n);
        let addr = self.block.address()
            + (header::erase_count_offset(
                n,
                usize::from(hdr.data_bytes.get()),
            ) + index * 4) as u32;
        let page = cache.get(dev, addr & !(CACHE_BLOCK_SIZE as u32 - 1));
        let within = addr as usize & (CACHE_BLOCK_SIZE - 1);
        let mut bytes = [0u8; 4];
        page.read(within, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Mark the volume deleted: rewrite both type fields to `T_DELETED`,
    /// in place, with no erase, so the erase counts survive.
    pub fn mark_deleted(
        &self,
        cache: &BlockCache,
        dev: &mut dyn FlashDevice,
    ) {
        let mut writer = BlockWriter::new();
        writer.begin(cache, dev, self.block.address());
        {
            let mut page = writer.data_mut();
            let mut hdr = VolumeHeader::read(&page);
            hdr.type_code = header::T_DELETED.into();
            hdr.type_code_copy = header::T_DELETED.into();
            hdr.write(&mut page);
        }
        writer.commit(dev);
    }

    /// Opaque 32-bit handle for crossing the syscall boundary. The
    /// complement byte exists only to catch garbage handles early.
    pub fn handle(&self) -> u32 {
        u32::from(self.block.code) | (u32::from(!self.block.code) << 8)
    }

    pub fn from_handle(handle: u32) -> Option<Self> {
        let code = (handle & 0xFF) as u8;
        let check = ((handle >> 8) & 0xFF) as u8;
        if handle >> 16 != 0 || check != !code {
            return None;
        }
        let block = MapBlock { code };
        block.is_valid().then_some(Self { block })
    }
}

/// Finds every valid volume on the device by scanning map blocks from the
/// lowest index up. A volume's header is required to occupy its
/// lowest-numbered block, so a header is always discovered before any of
/// that volume's payload blocks could be misread as one.
pub struct VolumeIter {
    remaining: MapBlockSet,
}

impl VolumeIter {
    pub fn new() -> Self {
        Self { remaining: MapBlockSet::full() }
    }

    pub fn next(
        &mut self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
    ) -> Option<Volume> {
        while let Some(index) = self.remaining.clear_first() {
            let vol = Volume::new(MapBlock::from_index(index));
            if !vol.is_valid(cache, dev) {
                continue;
            }

            // Don't visit any later blocks owned by this volume.
            let mut map = [MapBlock::INVALID; flash_map::NUM_MAP_BLOCKS];
            let n = vol.map(cache, dev, &mut map);
            for entry in &map[..n] {
                if entry.is_valid() {
                    self.remaining.clear(entry.index());
                }
            }
            return Some(vol);
        }
        None
    }
}

impl Default for VolumeIter {
    fn default() -> Self {
        Self::new()
    }
}

/// Look up a volume of the given type, newest scan order first.
pub fn find_by_type(
    cache: &BlockCache,
    dev: &dyn FlashDevice,
    type_code: u16,
) -> Option<Volume> {
    let mut iter = VolumeIter::new();
    while let Some(vol) = iter.next(cache, dev) {
        if vol.type_code(cache, dev) == type_code {
            return Some(vol);
        }
    }
    None
}
