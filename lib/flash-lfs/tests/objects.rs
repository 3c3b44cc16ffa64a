// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object store behavior over the simulated device, including torn-write
//! recovery and garbage collection.

use flash_device::SimFlash;
use flash_lfs::{body_crc, padded_size, Lfs};
use flash_map::{BlockCache, MapBlock};

fn fresh() -> (SimFlash, BlockCache) {
    (SimFlash::new(), BlockCache::new())
}

fn mount(cache: &BlockCache, dev: &SimFlash) -> Lfs {
    Lfs::mount(cache, dev, MapBlock::INVALID)
}

#[test]
fn write_then_read_round_trip() {
    let (mut dev, cache) = fresh();
    let mut lfs = mount(&cache, &dev);

    let body = [0xAAu8; 16];
    lfs.write_object(&cache, &mut dev, 5, &body).unwrap();

    let mut out = [0u8; 16];
    assert_eq!(lfs.read_object(&cache, &dev, 5, &mut out), Some(16));
    assert_eq!(out, body);

    assert_eq!(lfs.find_object(&cache, &dev, 6), None);
}

#[test]
fn newest_version_wins() {
    let (mut dev, cache) = fresh();
    let mut lfs = mount(&cache, &dev);

    for round in 0..5u8 {
        lfs.write_object(&cache, &mut dev, 9, &[round; 32]).unwrap();
    }

    let mut out = [0u8; 32];
    assert_eq!(lfs.read_object(&cache, &dev, 9, &mut out), Some(32));
    assert_eq!(out, [4u8; 32]);
}

#[test]
fn survives_reboot() {
    let (mut dev, cache) = fresh();
    let mut lfs = mount(&cache, &dev);

    for key in 0..20u8 {
        lfs.write_object(&cache, &mut dev, key, &[key ^ 0x5A; 48]).unwrap();
    }

    // Remount with a cold cache.
    let cache = BlockCache::new();
    let lfs = mount(&cache, &dev);
    for key in 0..20u8 {
        let mut out = [0u8; 48];
        assert_eq!(lfs.read_object(&cache, &dev, key, &mut out), Some(48));
        assert_eq!(out, [key ^ 0x5A; 48]);
    }
}

#[test]
fn torn_body_falls_back_to_previous_version() {
    let (mut dev, cache) = fresh();
    let mut lfs = mount(&cache, &dev);

    let old = [0xAAu8; 16];
    lfs.write_object(&cache, &mut dev, 5, &old).unwrap();

    // Power fails after the index record but before any of the body:
    // allocate a slot for the new version and never write it.
    let fresh_body = [0xBBu8; 16];
    let crc = body_crc(&fresh_body, padded_size(fresh_body.len()));
    lfs.new_object(&cache, &mut dev, 5, 16, crc).unwrap();

    // Reboot and look: the old version is still authoritative.
    let cache = BlockCache::new();
    let lfs = mount(&cache, &dev);
    let mut out = [0u8; 16];
    assert_eq!(lfs.read_object(&cache, &dev, 5, &mut out), Some(16));
    assert_eq!(out, old);
}

#[test]
fn torn_index_record_is_ignored() {
    let (mut dev, cache) = fresh();
    let mut lfs = mount(&cache, &dev);

    lfs.write_object(&cache, &mut dev, 7, &[0xAA; 16]).unwrap();

    // Cut power partway into programming the next record: the filter
    // page (one full cache block) completes, then ten bytes of the index
    // page, tearing the new record.
    dev.fail_after_bytes(256 + 10);
    let _ = lfs.write_object(&cache, &mut dev, 7, &[0xBB; 16]);
    dev.clear_failure();

    let cache = BlockCache::new();
    let mut lfs = mount(&cache, &dev);
    let mut out = [0u8; 16];
    assert_eq!(lfs.read_object(&cache, &dev, 7, &mut out), Some(16));
    assert_eq!(out, [0xAA; 16]);

    // The wasted slot doesn't block later writes.
    lfs.write_object(&cache, &mut dev, 7, &[0xCC; 16]).unwrap();
    assert_eq!(lfs.read_object(&cache, &dev, 7, &mut out), Some(16));
    assert_eq!(out, [0xCC; 16]);
}

#[test]
fn index_overflows_into_new_block() {
    let (mut dev, cache) = fresh();
    let mut lfs = mount(&cache, &dev);

    // More records than one index block holds.
    for i in 0..120u8 {
        lfs.write_object(&cache, &mut dev, i, &[i; 16]).unwrap();
    }
    assert_eq!(lfs.num_children(), 1);

    for i in 0..120u8 {
        let mut out = [0u8; 16];
        assert_eq!(lfs.read_object(&cache, &dev, i, &mut out), Some(16));
        assert_eq!(out, [i; 16]);
    }
}

#[test]
fn payload_overflows_into_new_child() {
    let (mut dev, cache) = fresh();
    let mut lfs = mount(&cache, &dev);

    // Large objects overflow a single child volume.
    for i in 0..20u8 {
        lfs.write_object(&cache, &mut dev, i, &[i; 4096]).unwrap();
    }
    assert!(lfs.num_children() >= 2);

    for i in 0..20u8 {
        let obj = lfs.find_object(&cache, &dev, i).unwrap();
        assert_eq!(obj.size, 4096);
        let mut out = vec![0u8; 4096];
        lfs.read_object(&cache, &dev, i, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == i));
    }
}

#[test]
fn gc_reclaims_superseded_children() {
    let (mut dev, cache) = fresh();
    let mut lfs = mount(&cache, &dev);

    // Fill a child with versions of one key, then supersede them all.
    for round in 0..18u8 {
        lfs.write_object(&cache, &mut dev, 1, &[round; 4096]).unwrap();
    }
    assert!(lfs.num_children() >= 2);
    let before = lfs.num_children();

    let reclaimed = lfs.collect_garbage(&cache, &mut dev);
    assert!(reclaimed > 0);
    assert!(lfs.num_children() < before);

    // The newest version survives collection.
    let mut out = vec![0u8; 4096];
    assert_eq!(lfs.read_object(&cache, &dev, 1, &mut out), Some(4096));
    assert!(out.iter().all(|&b| b == 17));
}

#[test]
fn gc_preserves_live_objects() {
    let (mut dev, cache) = fresh();
    let mut lfs = mount(&cache, &dev);

    // Mixed liveness: key 0's early version stays live in the oldest
    // child while churn on key 1 pushes into later children.
    lfs.write_object(&cache, &mut dev, 0, &[0xEE; 64]).unwrap();
    for round in 0..18u8 {
        lfs.write_object(&cache, &mut dev, 1, &[round; 4096]).unwrap();
    }

    lfs.collect_garbage(&cache, &mut dev);

    let mut out = [0u8; 64];
    assert_eq!(lfs.read_object(&cache, &dev, 0, &mut out), Some(64));
    assert_eq!(out, [0xEE; 64]);
    let mut big = vec![0u8; 4096];
    assert_eq!(lfs.read_object(&cache, &dev, 1, &mut big), Some(4096));
    assert!(big.iter().all(|&b| b == 17));
}

#[test]
fn unpadded_sizes_round_up() {
    let (mut dev, cache) = fresh();
    let mut lfs = mount(&cache, &dev);

    let body = [0x11u8; 20]; // pads to 32
    lfs.write_object(&cache, &mut dev, 3, &body).unwrap();

    let obj = lfs.find_object(&cache, &dev, 3).unwrap();
    assert_eq!(obj.size, 32);
    let mut out = [0u8; 32];
    lfs.read_object(&cache, &dev, 3, &mut out).unwrap();
    assert_eq!(&out[..20], &body[..]);
    // Padding reads back as erased flash.
    assert!(out[20..].iter().all(|&b| b == 0xFF));
}
