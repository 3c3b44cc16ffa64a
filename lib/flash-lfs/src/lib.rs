// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Log-structured object store, layered over the volume layer.
//!
//! Volumes are fine for large immutable things; this layer exists for
//! small objects that change often. Each parent volume may own an LFS: a
//! ring of child volumes holding append-only object versions, addressed by
//! an 8-bit key. Objects are never updated in place — later writes
//! supersede earlier ones, and the newest copy whose body checks out wins.
//!
//! Within a child volume, object data grows up from the front of the
//! payload while index blocks grow down from the end, one cache block at a
//! time. A meta-index of per-block key filters lives in the volume
//! header's type-specific data and steers lookups away from index blocks
//! that can't contain a key. Everything is ordered: children by an
//! explicit sequence number, records by position. Recovery needs no
//! journal — the write path is arranged so that any torn state reads as
//! either "slot never allocated" or "body bad, use the previous version".

#![cfg_attr(not(test), no_std)]

use arrayvec::ArrayVec;
use crc::Crc;
use flash_device::FlashDevice;
use flash_map::{BlockCache, BlockWriter, MapBlock, MapSpan, CACHE_BLOCK_SIZE};
use flash_volume::header::T_LFS;
use flash_volume::{FsError, Volume, VolumeIter, VolumeWriter};
use zerocopy::{FromBytes, IntoBytes};

pub mod records;

use records::{
    IndexAnchor, IndexRecord, KeyFilter, ANCHOR_SIZE, MAX_OBJECT_SIZE,
    MAX_RECORDS_PER_BLOCK, NUM_ROWS, RECORD_SIZE, SIZE_UNIT, TYPE_DATA_BYTES,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Payload size of every child volume: one map block, less the header's
/// cache block.
pub const CHILD_PAYLOAD_BYTES: usize =
    flash_map::MAP_BLOCK_SIZE - CACHE_BLOCK_SIZE;

/// Object space remaining in a child whose index has grown to its limit.
const MIN_OBJ_BYTES_PER_CHILD: usize =
    CHILD_PAYLOAD_BYTES - NUM_ROWS * CACHE_BLOCK_SIZE;

/// Worst case: every key holding a maximum-size object, plus two pad
/// volumes so garbage collection can copy live data forward.
const MAX_OBJ_VOLUMES: usize = (records::MAX_KEYS * MAX_OBJECT_SIZE)
    .div_ceil(MIN_OBJ_BYTES_PER_CHILD);
const PAD_VOLUMES: usize = 2;
pub const MAX_VOLUMES: usize = MAX_OBJ_VOLUMES + PAD_VOLUMES;

/// CRC of an object body as stored in its index record: a 32-bit CRC over
/// the padded body, truncated to 16 bits.
pub fn body_crc(bytes: &[u8], padded_size: usize) -> u16 {
    debug_assert!(padded_size >= bytes.len());
    let mut digest = CRC32.digest();
    digest.update(bytes);
    for _ in bytes.len()..padded_size {
        digest.update(&[0xFF]);
    }
    digest.finalize() as u16
}

/// Round a byte length up to the record size granularity.
pub fn padded_size(len: usize) -> usize {
    len.max(1).div_ceil(SIZE_UNIT) * SIZE_UNIT
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ObjectRef {
    /// Device address of the body. Child volumes are single map blocks, so
    /// the body is physically contiguous.
    pub addr: u32,
    pub size: usize,
}

#[derive(Copy, Clone, Debug)]
struct Child {
    vol: Volume,
    sequence: u32,
}

/// Parsed write position of one child volume.
#[derive(Copy, Clone, Debug)]
struct WriteState {
    /// Highest anchored index block, with the byte position of the next
    /// free record slot in that block.
    top: Option<(usize, usize)>,
    /// Payload offset where the next object body goes.
    object_head: u32,
}

pub struct Lfs {
    parent: MapBlock,
    children: ArrayVec<Child, MAX_VOLUMES>,
    last_sequence: u32,
}

/// Payload offset of index block `r`, counting down from the payload end.
fn index_block_offset(payload: u32, r: usize) -> u32 {
    payload - ((r + 1) * CACHE_BLOCK_SIZE) as u32
}

impl Lfs {
    /// Enumerate and order the children of `parent`. An invalid `parent`
    /// block mounts the top-level store.
    pub fn mount(
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        parent: MapBlock,
    ) -> Self {
        let mut children: ArrayVec<Child, MAX_VOLUMES> = ArrayVec::new();

        let mut iter = VolumeIter::new();
        while let Some(vol) = iter.next(cache, dev) {
            if vol.type_code(cache, dev) != T_LFS {
                continue;
            }
            let hdr = vol.header(cache, dev);
            if hdr.parent().code != parent.code {
                continue;
            }
            let sequence = read_sequence(cache, dev, vol);
            if children.try_push(Child { vol, sequence }).is_err() {
                break;
            }
        }

        children.sort_unstable_by_key(|c| c.sequence);
        let last_sequence =
            children.last().map(|c| c.sequence).unwrap_or(0);
        Self { parent, children, last_sequence }
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    /// Find the newest committed version of `key`.
    ///
    /// Children are walked newest first, index blocks within each child
    /// newest first, records within each block newest first. The
    /// meta-index filter rules blocks out, never in; a version whose body
    /// CRC fails is skipped in favor of an older one.
    pub fn find_object(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        key: u8,
    ) -> Option<ObjectRef> {
        for child in self.children.iter().rev() {
            let span = child.vol.payload(cache, dev);
            let payload = span.size_in_bytes();

            for r in (0..NUM_ROWS).rev() {
                if !meta_filter(cache, dev, child.vol, r).test(r, key) {
                    continue;
                }
                let Some(page) = read_index_page(cache, dev, &span, payload, r)
                else {
                    continue;
                };
                let Some((anchor_off, rec_start)) = parse_anchor(&page)
                else {
                    continue;
                };

                let mut matches: ArrayVec<
                    (u32, usize, u16),
                    MAX_RECORDS_PER_BLOCK,
                > = ArrayVec::new();
                walk_records(&page, rec_start, anchor_off, |off, rec| {
                    if rec.key() == key {
                        let _ = matches.try_push((
                            off,
                            rec.size_in_bytes(),
                            rec.crc(),
                        ));
                    }
                });

                for &(off, size, crc) in matches.iter().rev() {
                    if stored_body_crc(cache, dev, &span, off, size)
                        == Some(crc)
                    {
                        return Some(ObjectRef {
                            addr: span.flash_addr(off)?,
                            size,
                        });
                    }
                }
            }
        }
        None
    }

    /// Read the newest version of `key` into `out`, returning its size.
    pub fn read_object(
        &self,
        cache: &BlockCache,
        dev: &dyn FlashDevice,
        key: u8,
        out: &mut [u8],
    ) -> Option<usize> {
        let obj = self.find_object(cache, dev, key)?;
        let take = obj.size.min(out.len());
        dev.read(obj.addr, &mut out[..take]);
        Some(obj.size)
    }

    /// Allocate space for a new version of `key` with the given padded
    /// size and body CRC, writing the index record. Returns the device
    /// address for the body; until the body is fully written and matches
    /// the CRC, the previous version remains authoritative.
    pub fn new_object(
        &mut self,
        cache: &BlockCache,
        dev: &mut dyn FlashDevice,
        key: u8,
        size: usize,
        crc: u16,
    ) -> Result<u32, FsError> {
        debug_assert!(size >= records::MIN_OBJECT_SIZE);
        debug_assert!(size <= MAX_OBJECT_SIZE);
        debug_assert_eq!(size % SIZE_UNIT, 0);

        if self.children.is_empty() {
            self.push_new_child(cache, dev)?;
        }

        loop {
            let child = *self.children.last().unwrap();
            let span = child.vol.payload(cache, dev);
            let payload = span.size_in_bytes();

            if let Some((row, rec_pos, obj_off)) =
                self.place(cache, dev, &span, payload, size)
            {
                // The filter update must land no later than the record:
                // a filter bit without a record is a harmless false
                // positive, a record without its filter bit would be
                // invisible forever.
                meta_add(cache, dev, child.vol, row, key);

                let rec = IndexRecord::new(key, size, crc);
                let page_off = index_block_offset(payload, row);
                let addr = span
                    .flash_addr(page_off)
                    .ok_or(FsError::InvalidVolume)?;
                let mut writer = BlockWriter::new();
                writer.begin(cache, dev, addr);
                writer.data_mut()[rec_pos..rec_pos + RECORD_SIZE]
                    .copy_from_slice(rec.as_bytes());
                writer.commit(dev);

                return span
                    .flash_addr(obj_off)
                    .ok_or(FsError::InvalidVolume);
            }

            if self.children.len() >= MAX_VOLUMES {
                return Err(FsError::NoSpace);
            }
            self.push_new_child(cache, dev)?;
        }
    }

    /// Write a complete object: pads the body to the size granularity,
    /// allocates, and programs the body after the record.
    pub fn write_object(
        &mut self,
        cache: &BlockCache,
        dev: &mut dyn FlashDevice,
        key: u8,
        body: &[u8],
    ) -> Result<u32, FsError> {
        let size = padded_size(body.len());
        let crc = body_crc(body, size);
        let addr = self.new_object(cache, dev, key, size, crc)?;

        let mut writer = BlockWriter::new();
        let mut pos = 0;
        while pos < body.len() {
            let page = (addr + pos as u32) & !(CACHE_BLOCK_SIZE as u32 - 1);
            let within = (addr as usize + pos) & (CACHE_BLOCK_SIZE - 1);
            let chunk = body.len().min(pos + CACHE_BLOCK_SIZE - within) - pos;
            writer.begin(cache, dev, page);
            writer.data_mut()[within..within + chunk]
                .copy_from_slice(&body[pos..pos + chunk]);
            pos += chunk;
        }
        writer.commit(dev);
        // Padding bytes stay erased; the CRC accounts for them as 0xFF.
        Ok(addr)
    }

    /// Pick the index block, record slot, and object offset for a new
    /// object of `size` bytes, opening a new index block if needed.
    /// Returns None when this child can't take the object at all.
    fn place(
        &self,
        cache: &BlockCache,
        dev: &mut dyn FlashDevice,
        span: &MapSpan,
        payload: u32,
        size: usize,
    ) -> Option<(usize, usize, u32)> {
        let state = recover_state(cache, dev, span, payload);

        let (row, rec_pos) = match state.top {
            Some((row, rec_pos))
                if rec_pos + RECORD_SIZE <= CACHE_BLOCK_SIZE
                    && state.object_head + size as u32
                        <= index_block_offset(payload, row) =>
            {
                (row, rec_pos)
            }
            other => {
                // Current block is full (or none exists); open the next.
                let next = other.map_or(0, |(row, _)| row + 1);
                if next >= NUM_ROWS
                    || state.object_head + size as u32
                        > index_block_offset(payload, next)
                {
                    return None;
                }
                let rec_pos = write_anchor(
                    cache,
                    dev,
                    span,
                    payload,
                    next,
                    state.object_head,
                )?;
                (next, rec_pos)
            }
        };

        Some((row, rec_pos, state.object_head))
    }

    fn push_new_child(
        &mut self,
        cache: &BlockCache,
        dev: &mut dyn FlashDevice,
    ) -> Result<(), FsError> {
        if self.children.is_full() {
            return Err(FsError::NoSpace);
        }

        let mut writer = VolumeWriter::begin(
            cache,
            dev,
            T_LFS,
            CHILD_PAYLOAD_BYTES,
            TYPE_DATA_BYTES,
            self.parent,
        )?;
        writer.commit(dev);

        let sequence = self.last_sequence + 1;
        write_sequence(cache, dev, writer.volume, sequence);
        self.last_sequence = sequence;
        self.children.push(Child { vol: writer.volume, sequence });
        Ok(())
    }

    /// Delete children that hold no authoritative object versions, and
    /// copy a sparsely-live oldest child forward so it too can go.
    /// Returns the number of child volumes reclaimed.
    pub fn collect_garbage(
        &mut self,
        cache: &BlockCache,
        dev: &mut dyn FlashDevice,
    ) -> usize {
        // Newest-first sweep: the first good version of each key we meet
        // is the authoritative one; note which child holds it.
        let mut authoritative = [usize::MAX; records::MAX_KEYS];
        for (ci, child) in self.children.iter().enumerate().rev() {
            let span = child.vol.payload(cache, dev);
            let payload = span.size_in_bytes();
            for r in (0..NUM_ROWS).rev() {
                let Some(page) =
                    read_index_page(cache, dev, &span, payload, r)
                else {
                    continue;
                };
                let Some((anchor_off, rec_start)) = parse_anchor(&page)
                else {
                    continue;
                };
                let mut found: ArrayVec<
                    (u32, usize, u8, u16),
                    MAX_RECORDS_PER_BLOCK,
                > = ArrayVec::new();
                walk_records(&page, rec_start, anchor_off, |off, rec| {
                    let _ = found.try_push((
                        off,
                        rec.size_in_bytes(),
                        rec.key(),
                        rec.crc(),
                    ));
                });
                for &(off, size, key, crc) in found.iter().rev() {
                    if authoritative[usize::from(key)] != usize::MAX {
                        continue;
                    }
                    if stored_body_crc(cache, dev, &span, off, size)
                        == Some(crc)
                    {
                        authoritative[usize::from(key)] = ci;
                    }
                }
            }
        }

        // Fully superseded children go first.
        let mut removed = 0;
        let mut ci = 0;
        while ci < self.children.len() {
            let live = authoritative.iter().filter(|&&a| a == ci).count();
            if live == 0 {
                self.children[ci].vol.mark_deleted(cache, dev);
                self.children.remove(ci);
                for a in authoritative.iter_mut() {
                    if *a != usize::MAX && *a > ci {
                        *a -= 1;
                    }
                }
                removed += 1;
            } else {
                ci += 1;
            }
        }

        // If the oldest survivor is mostly dead, copy its live objects
        // forward (the pad volumes reserve room for this) and delete it.
        if self.children.len() > 1 {
            let oldest = self.children[0];
            let live_keys: ArrayVec<u8, { records::MAX_KEYS }> = (0..records::MAX_KEYS)
                .filter(|&k| authoritative[k] == 0)
                .map(|k| k as u8)
                .collect();
            let live_bytes: usize = live_keys
                .iter()
                .filter_map(|&k| self.find_object(cache, dev, k))
                .map(|o| o.size)
                .sum();

            if live_bytes * 4 < CHILD_PAYLOAD_BYTES {
                let mut buf = [0u8; MAX_OBJECT_SIZE];
                let mut all_copied = true;
                for &key in &live_keys {
                    let Some(obj) = self.find_object(cache, dev, key)
                    else {
                        continue;
                    };
                    dev.read(obj.addr, &mut buf[..obj.size]);
                    if self
                        .write_object(cache, dev, key, &buf[..obj.size])
                        .is_err()
                    {
                        all_copied = false;
                        break;
                    }
                }
                if all_copied {
                    oldest.vol.mark_deleted(cache, dev);
                    self.children.remove(0);
                    removed += 1;
                }
            }
        }

        removed
    }
}

fn read_sequence(
    cache: &BlockCache,
    dev: &dyn FlashDevice,
    vol: Volume,
) -> u32 {
    let (addr, _) = vol.type_data_region(cache, dev);
    let page = cache.get(dev, addr & !(CACHE_BLOCK_SIZE as u32 - 1));
    let within = addr as usize & (CACHE_BLOCK_SIZE - 1);
    let mut bytes = [0u8; 4];
    page.read(within, &mut bytes);
    u32::from_le_bytes(bytes)
}

fn write_sequence(
    cache: &BlockCache,
    dev: &mut dyn FlashDevice,
    vol: Volume,
    sequence: u32,
) {
    let (addr, _) = vol.type_data_region(cache, dev);
    let page_addr = addr & !(CACHE_BLOCK_SIZE as u32 - 1);
    let within = addr as usize & (CACHE_BLOCK_SIZE - 1);
    let mut writer = BlockWriter::new();
    writer.begin(cache, dev, page_addr);
    writer.data_mut()[within..within + 4]
        .copy_from_slice(&sequence.to_le_bytes());
    writer.commit(dev);
}

fn meta_filter(
    cache: &BlockCache,
    dev: &dyn FlashDevice,
    vol: Volume,
    row: usize,
) -> KeyFilter {
    let (addr, len) = vol.type_data_region(cache, dev);
    debug_assert!(4 + 2 * row + 2 <= len);
    let page = cache.get(dev, addr & !(CACHE_BLOCK_SIZE as u32 - 1));
    let within = (addr as usize & (CACHE_BLOCK_SIZE - 1)) + 4 + 2 * row;
    let mut bytes = [0u8; 2];
    page.read(within, &mut bytes);
    KeyFilter::read_from_bytes(&bytes[..]).unwrap()
}

fn meta_add(
    cache: &BlockCache,
    dev: &mut dyn FlashDevice,
    vol: Volume,
    row: usize,
    key: u8,
) {
    let (addr, _) = vol.type_data_region(cache, dev);
    let page_addr = addr & !(CACHE_BLOCK_SIZE as u32 - 1);
    let within = (addr as usize & (CACHE_BLOCK_SIZE - 1)) + 4 + 2 * row;

    let mut writer = BlockWriter::new();
    writer.begin(cache, dev, page_addr);
    {
        let mut page = writer.data_mut();
        let mut filter =
            KeyFilter::read_from_bytes(&page[within..within + 2]).unwrap();
        filter.add(row, key);
        page[within..within + 2].copy_from_slice(filter.as_bytes());
    }
    writer.commit(dev);
}

/// Copy out index block `r`, if the span covers it.
fn read_index_page(
    cache: &BlockCache,
    dev: &dyn FlashDevice,
    span: &MapSpan,
    payload: u32,
    r: usize,
) -> Option<[u8; CACHE_BLOCK_SIZE]> {
    let offset = index_block_offset(payload, r);
    let block = span.get_block(cache, dev, offset)?;
    let mut page = [0u8; CACHE_BLOCK_SIZE];
    block.read(0, &mut page);
    Some(page)
}

/// Locate the single valid anchor in an index page: skip torn anchors,
/// stop at erased space. Returns the anchored object offset and the byte
/// position where records begin.
fn parse_anchor(page: &[u8; CACHE_BLOCK_SIZE]) -> Option<(u32, usize)> {
    let mut pos = 0;
    while pos + ANCHOR_SIZE <= CACHE_BLOCK_SIZE {
        let anchor =
            IndexAnchor::read_from_bytes(&page[pos..pos + ANCHOR_SIZE])
                .unwrap();
        if anchor.is_empty() {
            return None;
        }
        if anchor.is_valid() {
            return Some((anchor.offset_in_bytes(), pos + ANCHOR_SIZE));
        }
        pos += ANCHOR_SIZE;
    }
    None
}

/// Walk the records of an anchored index page in write order, handing
/// each *valid* record and its object offset to `f`. Torn records consume
/// an index slot but no object space. Returns the next free record
/// position and the object head after the last record.
fn walk_records(
    page: &[u8; CACHE_BLOCK_SIZE],
    rec_start: usize,
    anchor_off: u32,
    mut f: impl FnMut(u32, &IndexRecord),
) -> (usize, u32) {
    let mut pos = rec_start;
    let mut object_off = anchor_off;
    while pos + RECORD_SIZE <= CACHE_BLOCK_SIZE {
        let rec =
            IndexRecord::read_from_bytes(&page[pos..pos + RECORD_SIZE])
                .unwrap();
        if rec.is_empty() {
            break;
        }
        if rec.is_valid() {
            f(object_off, &rec);
            object_off += rec.size_in_bytes() as u32;
        }
        pos += RECORD_SIZE;
    }
    (pos, object_off)
}

/// Recover the write position of a child volume: the highest anchored
/// index block, the next record slot in it, and the object head.
fn recover_state(
    cache: &BlockCache,
    dev: &dyn FlashDevice,
    span: &MapSpan,
    payload: u32,
) -> WriteState {
    let mut top = None;
    for r in 0..NUM_ROWS {
        let Some(page) = read_index_page(cache, dev, span, payload, r)
        else {
            break;
        };
        let Some((anchor_off, rec_start)) = parse_anchor(&page) else {
            break;
        };
        let (rec_pos, object_head) =
            walk_records(&page, rec_start, anchor_off, |_, _| {});
        top = Some(((r, rec_pos), object_head));
    }

    match top {
        Some(((r, rec_pos), object_head)) => WriteState {
            top: Some((r, rec_pos)),
            object_head,
        },
        None => WriteState { top: None, object_head: 0 },
    }
}

/// Anchor index block `r` at `object_off`, skipping any torn anchors
/// already in the page. Returns the record start position.
fn write_anchor(
    cache: &BlockCache,
    dev: &mut dyn FlashDevice,
    span: &MapSpan,
    payload: u32,
    r: usize,
    object_off: u32,
) -> Option<usize> {
    let page_off = index_block_offset(payload, r);
    let addr = span.flash_addr(page_off)?;

    let mut writer = BlockWriter::new();
    writer.begin(cache, dev, addr);
    let slot = {
        let mut page = writer.data_mut();
        let mut pos = 0;
        loop {
            if pos + ANCHOR_SIZE > CACHE_BLOCK_SIZE {
                return None;
            }
            let existing = IndexAnchor::read_from_bytes(
                &page[pos..pos + ANCHOR_SIZE],
            )
            .unwrap();
            if existing.is_empty() {
                break;
            }
            // A torn anchor from an interrupted allocation; leave it and
            // use the next slot.
            debug_assert!(!existing.is_valid());
            pos += ANCHOR_SIZE;
        }
        let anchor = IndexAnchor::new(object_off);
        page[pos..pos + ANCHOR_SIZE].copy_from_slice(anchor.as_bytes());
        pos
    };
    writer.commit(dev);
    Some(slot + ANCHOR_SIZE)
}

/// CRC of the stored body at `off`, streamed through the cache.
fn stored_body_crc(
    cache: &BlockCache,
    dev: &dyn FlashDevice,
    span: &MapSpan,
    off: u32,
    size: usize,
) -> Option<u16> {
    let mut digest = CRC32.digest();
    let mut offset = off;
    let mut remaining = size as u32;
    while remaining > 0 {
        let (page, within, avail) =
            span.map_bytes(cache, dev, offset, remaining)?;
        if avail == 0 {
            return None;
        }
        digest.update(&page.data()[within..within + avail as usize]);
        offset += avail;
        remaining -= avail;
    }
    Some(digest.finalize() as u16)
}
