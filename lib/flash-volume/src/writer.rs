// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-step volume creation.
//!
//! `begin` allocates and erases every block up front and writes a complete
//! header — map, CRCs, erase counts — under the `T_INCOMPLETE` type. Only
//! `commit` flips the type to its real value, so a crash at any point
//! leaves either no volume or an incomplete one, never a half-valid one,
//! and the erase counts are preserved in all cases.

use flash_device::FlashDevice;
use flash_map::{
    BlockCache, BlockWriter, MapBlock, MapSpan, CACHE_BLOCK_MASK,
    CACHE_BLOCK_SIZE, NUM_MAP_BLOCKS,
};

use crate::header::{self, VolumeHeader};
use crate::{FsError, Recycler, Volume};

pub struct VolumeWriter<'c> {
    cache: &'c BlockCache,
    pub volume: Volume,
    type_code: u16,
    payload_offset: u32,
    payload_span: MapSpan,
    payload_writer: BlockWriter<'c>,
}

impl<'c> VolumeWriter<'c> {
    /// Allocate a new volume, drawing blocks from a fresh recycler that
    /// takes the erase-log fast path when the log is populated.
    pub fn begin(
        cache: &'c BlockCache,
        dev: &mut dyn FlashDevice,
        type_code: u16,
        payload_bytes: usize,
        hdr_data_bytes: usize,
        parent: MapBlock,
    ) -> Result<Self, FsError> {
        let mut recycler = Recycler::new(cache, dev, true);
        let result = Self::begin_with(
            cache,
            dev,
            &mut recycler,
            type_code,
            payload_bytes,
            hdr_data_bytes,
            parent,
        );
        recycler.commit(dev);
        result
    }

    /// As `begin`, with a caller-supplied recycler. The erase log uses this
    /// to allocate its own volumes without consulting itself.
    pub fn begin_with(
        cache: &'c BlockCache,
        dev: &mut dyn FlashDevice,
        recycler: &mut Recycler<'_>,
        type_code: u16,
        payload_bytes: usize,
        hdr_data_bytes: usize,
        parent: MapBlock,
    ) -> Result<Self, FsError> {
        let payload_blocks = payload_bytes.div_ceil(CACHE_BLOCK_SIZE);
        debug_assert!(payload_blocks <= usize::from(u16::MAX));
        debug_assert!(hdr_data_bytes <= usize::from(u16::MAX));

        let n = header::num_map_entries(payload_blocks, hdr_data_bytes);
        // The whole header area, erase counts included, must stay within
        // the first map block.
        debug_assert!(
            header::payload_offset_bytes(n, hdr_data_bytes)
                <= flash_map::MAP_BLOCK_SIZE
        );

        let mut map = [MapBlock::INVALID; NUM_MAP_BLOCKS];
        // Unallocated entries keep the erased pattern, same as their
        // unwritten storage.
        let mut counts = [u32::MAX; NUM_MAP_BLOCKS];

        // Allocate every block now, preserving erase counts even if we
        // come up short: the header still gets written, as T_INCOMPLETE.
        let mut allocated = 0;
        while allocated < n {
            let Some(rb) = recycler.next(dev) else {
                break;
            };
            let ec = if rb.needs_erase {
                dev.erase_block(rb.block.index());
                cache.invalidate_block(rb.block.address());
                rb.erase_count + 1
            } else {
                rb.erase_count
            };

            // The header must land in the lowest-numbered block, so the
            // volume scan can never find a payload block first. Data in
            // the middle of a volume being misread as a header would be a
            // security bug, not just a correctness one.
            if allocated > 0 && rb.block.index() < map[0].index() {
                map[allocated] = map[0];
                counts[allocated] = counts[0];
                map[0] = rb.block;
                counts[0] = ec;
            } else {
                map[allocated] = rb.block;
                counts[allocated] = ec;
            }
            allocated += 1;
        }

        if allocated == 0 {
            return Err(FsError::NoSpace);
        }

        let volume = Volume::new(map[0]);
        let base = volume.block.address();

        let mut writer = BlockWriter::new();
        writer.begin_erased(cache, dev, base);
        {
            let mut page = writer.data_mut();
            let mut hdr = VolumeHeader::init(
                header::T_INCOMPLETE,
                payload_blocks as u16,
                hdr_data_bytes as u16,
                parent,
            );
            for (i, block) in map[..n].iter().enumerate() {
                page[header::map_offset() + i] = block.code;
            }
            hdr.crc_map = header::map_crc(&page, n).into();
            hdr.crc_erase = header::erase_crc(&counts[..n]).into();
            hdr.write(&mut page);
        }

        // Erase counts may or may not share the header's cache block; the
        // writer commits and moves forward as the addresses climb.
        let ec_base = header::erase_count_offset(n, hdr_data_bytes);
        for (i, count) in counts[..n].iter().enumerate() {
            let addr = base + (ec_base + i * 4) as u32;
            writer.begin_erased(cache, dev, addr & !(CACHE_BLOCK_MASK as u32));
            let within = addr as usize & CACHE_BLOCK_MASK;
            writer.data_mut()[within..within + 4]
                .copy_from_slice(&count.to_le_bytes());
        }
        writer.commit(dev);

        if allocated < n {
            return Err(FsError::NoSpace);
        }

        let payload_span = MapSpan::create(
            map[..n].iter().copied(),
            header::payload_offset_blocks(n, hdr_data_bytes) as u32,
            payload_blocks as u32,
        );

        Ok(Self {
            cache,
            volume,
            type_code,
            payload_offset: 0,
            payload_span,
            payload_writer: BlockWriter::new(),
        })
    }

    /// Stream payload bytes, starting from the front of the payload area.
    pub fn append_payload(&mut self, dev: &mut dyn FlashDevice, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let addr = self
                .payload_span
                .flash_addr(self.payload_offset)
                .expect("write past end of volume payload");
            let within = addr as usize & CACHE_BLOCK_MASK;
            let chunk = bytes.len().min(CACHE_BLOCK_SIZE - within);

            // Every payload block was erased during begin, so skip the
            // readback.
            self.payload_writer.begin_erased(
                self.cache,
                dev,
                addr & !(CACHE_BLOCK_MASK as u32),
            );
            self.payload_writer.data_mut()[within..within + chunk]
                .copy_from_slice(&bytes[..chunk]);

            self.payload_offset += chunk as u32;
            bytes = &bytes[chunk..];
        }
    }

    /// Finish any buffered payload, then rewrite the header with the real
    /// type. This is the commit point.
    pub fn commit(&mut self, dev: &mut dyn FlashDevice) {
        self.payload_writer.commit(dev);

        let mut writer = BlockWriter::new();
        writer.begin(self.cache, dev, self.volume.block.address());
        {
            let mut page = writer.data_mut();
            let mut hdr = VolumeHeader::read(&page);
            hdr.type_code = self.type_code.into();
            hdr.type_code_copy = self.type_code.into();
            hdr.write(&mut page);
        }
        writer.commit(dev);
    }
}
