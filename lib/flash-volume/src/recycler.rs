// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Finds blocks to reclaim, biased toward wear leveling.
//!
//! Orphan blocks — reachable from no volume at all — go out first. Their
//! true erase count is unknown, so they are assigned the current average;
//! handing them out before anything else keeps that estimate from drifting
//! upward over time and making orphans look more worn than they are, which
//! matters most on a blank or damaged device where *every* block is an
//! orphan.
//!
//! After that, blocks come from deleted (or incomplete) volumes. We don't
//! keep a table of blocks sorted by erase count, and we don't rescan the
//! device per block; it's enough to *tend* toward low-erase-count blocks.
//! A candidate set holds the recyclable volumes containing at least one
//! block with an erase count at or below the average, and blocks are
//! drained one volume at a time, the header last so its erase counts stay
//! reachable until the end.

use flash_device::FlashDevice;
use flash_map::{BlockCache, BlockWriter, MapBlock, MapBlockSet};

use crate::header::{self, VolumeHeader};
use crate::{EraseLog, Volume, VolumeIter};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RecycledBlock {
    pub block: MapBlock,
    /// Erase count on record for this block. When `needs_erase` is set the
    /// caller erases and stores `erase_count + 1`; pre-erased blocks from
    /// the erase log arrive with the increment already applied.
    pub erase_count: u32,
    pub needs_erase: bool,
}

pub struct Recycler<'c> {
    cache: &'c BlockCache,
    orphans: MapBlockSet,
    /// Header blocks of recyclable volumes.
    deleted: MapBlockSet,
    candidates: MapBlockSet,
    average_erase_count: u32,
    /// Map-entry invalidations are coalesced per volume; we commit when
    /// switching volumes or on `commit`.
    dirty: BlockWriter<'c>,
    dirty_volume: Option<Volume>,
    erase_log: Option<EraseLog>,
}

impl<'c> Recycler<'c> {
    /// Scan the device once and build the orphan, deleted, and candidate
    /// sets. `use_erase_log` must be false when the caller is the one
    /// populating the erase log, or it could never make forward progress.
    pub fn new(
        cache: &'c BlockCache,
        dev: &dyn FlashDevice,
        use_erase_log: bool,
    ) -> Self {
        let mut this = Self {
            cache,
            orphans: MapBlockSet::full(),
            deleted: MapBlockSet::empty(),
            candidates: MapBlockSet::empty(),
            average_erase_count: 0,
            dirty: BlockWriter::new(),
            dirty_volume: None,
            erase_log: use_erase_log.then(EraseLog::new),
        };
        this.scan_volumes(dev);
        this.find_candidate_volumes(dev);
        this
    }

    fn scan_volumes(&mut self, dev: &dyn FlashDevice) {
        let mut sum: u64 = 0;
        let mut reachable: u32 = 0;

        let mut iter = VolumeIter::new();
        while let Some(vol) = iter.next(self.cache, dev) {
            let hdr = vol.header(self.cache, dev);
            if header::type_is_recyclable(hdr.type_code.get()) {
                self.deleted.mark(vol.block.index());
            }

            // A block reachable by any volume, even a deleted one, is not
            // an orphan, and its erase count contributes to the average.
            let n = hdr.num_map_entries();
            for i in 0..n {
                let entry = self.map_entry(dev, vol, i);
                if entry.is_valid() {
                    self.orphans.clear(entry.index());
                    sum += u64::from(vol.erase_count(self.cache, dev, i));
                    reachable += 1;
                }
            }
        }

        // With nothing reachable (a blank device), default to zero.
        self.average_erase_count = if reachable != 0 {
            (sum / u64::from(reachable)) as u32
        } else {
            0
        };
    }

    fn find_candidate_volumes(&mut self, dev: &dyn FlashDevice) {
        self.candidates = MapBlockSet::empty();

        let mut remaining = self.deleted;
        while let Some(index) = remaining.clear_first() {
            let vol = Volume::new(MapBlock::from_index(index));
            let hdr = vol.header(self.cache, dev);
            for i in 0..hdr.num_map_entries() {
                let entry = self.map_entry(dev, vol, i);
                if entry.is_valid()
                    && vol.erase_count(self.cache, dev, i)
                        <= self.average_erase_count
                {
                    self.candidates.mark(index);
                    break;
                }
            }
        }

        // All the below-average blocks may already be gone; fall back to
        // every recyclable volume rather than stalling.
        if self.candidates.is_empty() {
            self.candidates = self.deleted;
        }
    }

    fn map_entry(
        &self,
        dev: &dyn FlashDevice,
        vol: Volume,
        index: usize,
    ) -> MapBlock {
        let page = self.cache.get(dev, vol.block.address());
        let entry = header::map_entry(&page.data(), index);
        entry
    }

    /// Produce the next recyclable block and its erase count.
    pub fn next(&mut self, dev: &mut dyn FlashDevice) -> Option<RecycledBlock> {
        // Fast path: a pre-erased block stashed by the background eraser.
        // Logged blocks are reachable from no volume, so they also appear
        // in the orphan set; claim them out of it.
        if let Some(log) = &mut self.erase_log {
            if let Some(rec) = log.pop(self.cache, dev) {
                self.orphans.clear(rec.block().index());
                return Some(RecycledBlock {
                    block: rec.block(),
                    erase_count: rec.erase_count.get(),
                    needs_erase: false,
                });
            }
        }

        if let Some(index) = self.orphans.clear_first() {
            return Some(RecycledBlock {
                block: MapBlock::from_index(index),
                erase_count: self.average_erase_count,
                needs_erase: true,
            });
        }

        // Stick with the volume we've already started dirtying, to bound
        // the number of map writes per volume.
        let vol = match self.dirty_volume {
            Some(vol) => vol,
            None => {
                let index = match self.candidates.clear_first() {
                    Some(i) => i,
                    None => {
                        self.find_candidate_volumes(dev);
                        self.candidates.clear_first()?
                    }
                };
                Volume::new(MapBlock::from_index(index))
            }
        };

        let header_page = vol.block.address();
        let page = self.cache.get(dev, header_page);
        let hdr = VolumeHeader::read(&page.data());
        let n = hdr.num_map_entries();

        for i in 0..n {
            let entry = header::map_entry(&page.data(), i);
            if entry.is_valid() && entry.code != vol.block.code {
                let count = vol.erase_count(self.cache, dev, i);
                drop(page);

                // Retire this map entry in place; a cleared entry is
                // invalid to every future reader.
                self.dirty.begin(self.cache, dev, header_page);
                self.dirty.data_mut()[header::map_offset() + i] = 0;
                self.dirty_volume = Some(vol);

                return Some(RecycledBlock {
                    block: entry,
                    erase_count: count,
                    needs_erase: true,
                });
            }
        }

        // Only the header block remains: emit it last and retire the
        // volume entirely.
        let count = vol.erase_count(self.cache, dev, 0);
        drop(page);
        self.deleted.clear(vol.block.index());
        self.dirty.commit(dev);
        self.dirty_volume = None;

        Some(RecycledBlock {
            block: vol.block,
            erase_count: count,
            needs_erase: true,
        })
    }

    /// Flush any staged map invalidations.
    pub fn commit(&mut self, dev: &mut dyn FlashDevice) {
        self.dirty.commit(dev);
        self.dirty_volume = None;
    }
}
