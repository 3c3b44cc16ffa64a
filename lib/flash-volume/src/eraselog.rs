// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A durable queue of pre-erased blocks.
//!
//! Erasing is the slow half of allocation, so a background task erases
//! recyclable blocks ahead of time and records them — with their new erase
//! counts — in a dedicated volume type. Synchronous allocators then pop
//! records instead of erasing.
//!
//! Records move through three flag states, each reachable from the last by
//! programming alone: erased (0xFF), valid, popped. Popping is therefore a
//! single one-byte write, and after a reboot two binary searches over the
//! flags recover the read and write positions.

use flash_device::FlashDevice;
use flash_map::{BlockCache, MapBlock, CACHE_BLOCK_SIZE};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes as _, IntoBytes as _};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::header::{self, CRC32};
use crate::{Recycler, Volume, VolumeIter, VolumeWriter};

/// Records fill the single-map-block log volume's payload exactly.
pub const NUM_LOG_RECORDS: usize =
    (flash_map::MAP_BLOCK_SIZE - CACHE_BLOCK_SIZE)
        / core::mem::size_of::<EraseLogRecord>();

const F_ERASED: u8 = 0xFF;
const F_VALID: u8 = 0x5F;
const F_POPPED: u8 = 0x00;

#[derive(Copy, Clone, Debug, Default)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct EraseLogRecord {
    pub block_code: u8,
    pub flag: u8,
    pub erase_count: U32,
    pub check: U16,
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<EraseLogRecord>(),
    8
);

impl EraseLogRecord {
    pub fn block(&self) -> MapBlock {
        MapBlock { code: self.block_code }
    }

    fn compute_check(&self) -> u16 {
        let mut digest = CRC32.digest();
        digest.update(&self.erase_count.get().to_le_bytes());
        digest.update(&[self.block_code]);
        digest.finalize() as u16
    }
}

pub struct EraseLog {
    volume: Option<Volume>,
    read_index: usize,
    write_index: usize,
}

impl EraseLog {
    pub fn new() -> Self {
        Self { volume: None, read_index: 0, write_index: 0 }
    }

    fn record_addr(volume: Volume, index: usize) -> u32 {
        debug_assert!(index < NUM_LOG_RECORDS);
        // The log volume is a single map block; records are its payload,
        // starting one cache block past the header. They are read and
        // written directly, never through the block cache.
        volume.block.address()
            + CACHE_BLOCK_SIZE as u32
            + (index * core::mem::size_of::<EraseLogRecord>()) as u32
    }

    fn read_flag(dev: &dyn FlashDevice, volume: Volume, index: usize) -> u8 {
        let mut flag = [0u8];
        dev.read(Self::record_addr(volume, index) + 1, &mut flag);
        flag[0]
    }

    fn read_record(
        dev: &dyn FlashDevice,
        volume: Volume,
        index: usize,
    ) -> EraseLogRecord {
        let mut bytes = [0u8; core::mem::size_of::<EraseLogRecord>()];
        dev.read(Self::record_addr(volume, index), &mut bytes);
        EraseLogRecord::read_from_bytes(&bytes).unwrap()
    }

    /// Recover `read_index` and `write_index` for the current volume.
    ///
    /// Record flags always form a popped prefix, then a valid run, then an
    /// erased tail, so both boundaries are binary-searchable.
    fn find_indices(&mut self, dev: &dyn FlashDevice) {
        let volume = self.volume.unwrap();

        // First index whose flag fails the predicate, given the
        // true-prefix shape.
        let partition = |pred: &dyn Fn(u8) -> bool| {
            let mut lo = 0;
            let mut hi = NUM_LOG_RECORDS;
            while lo < hi {
                let mid = (lo + hi) / 2;
                if pred(Self::read_flag(dev, volume, mid)) {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            lo
        };

        self.read_index = partition(&|flag| flag == F_POPPED);
        self.write_index = partition(&|flag| flag != F_ERASED);
        debug_assert!(self.read_index <= self.write_index);
    }

    /// Ensure space for one more record, finding or allocating a log
    /// volume. Allocation goes through the caller's recycler, which must
    /// bypass the erase log itself.
    pub fn allocate(
        &mut self,
        cache: &BlockCache,
        dev: &mut dyn FlashDevice,
        recycler: &mut Recycler<'_>,
    ) -> bool {
        if self.volume.is_some() && self.write_index < NUM_LOG_RECORDS {
            return true;
        }

        // Adopt an existing log volume with write space.
        let mut iter = VolumeIter::new();
        while let Some(vol) = iter.next(cache, dev) {
            if vol.type_code(cache, dev) != header::T_ERASE_LOG {
                continue;
            }
            self.volume = Some(vol);
            self.find_indices(dev);
            if self.write_index < NUM_LOG_RECORDS {
                return true;
            }
        }

        // Out of volumes to search; start a fresh one.
        let payload = NUM_LOG_RECORDS * core::mem::size_of::<EraseLogRecord>();
        match VolumeWriter::begin_with(
            cache,
            dev,
            recycler,
            header::T_ERASE_LOG,
            payload,
            0,
            MapBlock::INVALID,
        ) {
            Ok(mut writer) => {
                writer.commit(dev);
                self.volume = Some(writer.volume);
                self.read_index = 0;
                self.write_index = 0;
                true
            }
            Err(_) => false,
        }
    }

    /// Append one record. Space must already have been allocated.
    pub fn commit(&mut self, dev: &mut dyn FlashDevice, block: MapBlock, erase_count: u32) {
        debug_assert!(self.write_index < NUM_LOG_RECORDS);
        let volume = self.volume.unwrap();

        let mut rec = EraseLogRecord {
            block_code: block.code,
            flag: F_VALID,
            erase_count: erase_count.into(),
            check: 0.into(),
        };
        rec.check = rec.compute_check().into();

        dev.write(Self::record_addr(volume, self.write_index), rec.as_bytes());
        self.write_index += 1;
    }

    /// Dequeue the oldest record, hunting for log volumes as needed and
    /// deleting fully-consumed ones. A popped block must be used in a new
    /// volume (or re-logged), or it becomes an orphan.
    pub fn pop(
        &mut self,
        cache: &BlockCache,
        dev: &mut dyn FlashDevice,
    ) -> Option<EraseLogRecord> {
        let mut iter = VolumeIter::new();

        loop {
            // Find a volume with unread records.
            while self
                .volume
                .map_or(true, |_| self.read_index >= NUM_LOG_RECORDS)
            {
                let vol = loop {
                    let vol = iter.next(cache, dev)?;
                    if vol.type_code(cache, dev) == header::T_ERASE_LOG {
                        break vol;
                    }
                };
                self.volume = Some(vol);
                self.find_indices(dev);

                if self.read_index >= NUM_LOG_RECORDS {
                    // Every record consumed; retire the volume.
                    vol.mark_deleted(cache, dev);
                }
            }

            let volume = self.volume.unwrap();
            let rec = Self::read_record(dev, volume, self.read_index);

            if rec.flag == F_ERASED {
                // Reached the write frontier.
                return None;
            }

            // Consume the record, whatever its state.
            if rec.flag != F_POPPED {
                dev.write(
                    Self::record_addr(volume, self.read_index) + 1,
                    &[F_POPPED],
                );
            }
            self.read_index += 1;

            // Skip torn or stale records, return good ones.
            if rec.flag == F_VALID
                && rec.compute_check() == rec.check.get()
                && rec.block().is_valid()
            {
                return Some(rec);
            }
        }
    }
}

impl Default for EraseLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task: recycle blocks, erase them ahead of demand, and stash
/// the results in the log. Its recycler bypasses the erase log, otherwise
/// it could consume its own output and never make progress.
pub struct PreEraser<'c> {
    recycler: Recycler<'c>,
    log: EraseLog,
}

impl<'c> PreEraser<'c> {
    pub fn new(cache: &'c BlockCache, dev: &dyn FlashDevice) -> Self {
        Self {
            recycler: Recycler::new(cache, dev, false),
            log: EraseLog::new(),
        }
    }

    /// Recycle, erase, and log one more block. Returns false when out of
    /// recyclable blocks or log space.
    pub fn next(
        &mut self,
        cache: &BlockCache,
        dev: &mut dyn FlashDevice,
    ) -> bool {
        if !self.log.allocate(cache, dev, &mut self.recycler) {
            return false;
        }

        let Some(rb) = self.recycler.next(dev) else {
            return false;
        };
        debug_assert!(rb.needs_erase);

        dev.erase_block(rb.block.index());
        cache.invalidate_block(rb.block.address());
        self.log.commit(dev, rb.block, rb.erase_count + 1);
        true
    }

    /// Flush the recycler's pending map writes.
    pub fn finish(&mut self, dev: &mut dyn FlashDevice) {
        self.recycler.commit(dev);
    }
}
