// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole-stack tests for the volume layer over the simulated device.

use flash_device::{FlashDevice, SimFlash};
use flash_map::{BlockCache, MapBlock, NUM_MAP_BLOCKS};
use flash_volume::header::{T_APP_BASE, T_ELF, T_INCOMPLETE};
use flash_volume::{PreEraser, Volume, VolumeIter, VolumeWriter};

/// Collect all valid volumes.
fn volumes(cache: &BlockCache, dev: &SimFlash) -> Vec<Volume> {
    let mut out = vec![];
    let mut iter = VolumeIter::new();
    while let Some(vol) = iter.next(cache, dev) {
        out.push(vol);
    }
    out
}

fn map_of(cache: &BlockCache, dev: &SimFlash, vol: Volume) -> Vec<MapBlock> {
    let mut map = [MapBlock::INVALID; NUM_MAP_BLOCKS];
    let n = vol.map(cache, dev, &mut map);
    map[..n].to_vec()
}

fn payload_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn round_trip_type_and_payload() {
    let mut dev = SimFlash::new();
    let cache = BlockCache::new();

    let payload = payload_pattern(70_000, 3);
    let mut writer = VolumeWriter::begin(
        &cache,
        &mut dev,
        T_APP_BASE + 7,
        payload.len(),
        0,
        MapBlock::INVALID,
    )
    .unwrap();
    writer.append_payload(&mut dev, &payload);
    writer.commit(&mut dev);

    let vols = volumes(&cache, &dev);
    assert_eq!(vols.len(), 1);
    let vol = vols[0];
    assert_eq!(vol.type_code(&cache, &dev), T_APP_BASE + 7);

    let span = vol.payload(&cache, &dev);
    let mut read_back = vec![0u8; payload.len()];
    assert!(span.copy_bytes(&cache, &dev, 0, &mut read_back));
    assert_eq!(read_back, payload);
}

#[test]
fn header_occupies_lowest_block() {
    let mut dev = SimFlash::new();
    let cache = BlockCache::new();

    for seed in 0..4 {
        let mut writer = VolumeWriter::begin(
            &cache,
            &mut dev,
            T_ELF,
            200_000,
            0,
            MapBlock::INVALID,
        )
        .unwrap();
        writer.append_payload(&mut dev, &payload_pattern(64, seed));
        writer.commit(&mut dev);
    }

    for vol in volumes(&cache, &dev) {
        for entry in map_of(&cache, &dev, vol) {
            if entry.is_valid() {
                assert!(vol.block.index() <= entry.index());
            }
        }
    }
}

#[test]
fn stored_erase_counts_match_device_ground_truth() {
    let mut dev = SimFlash::new();
    let cache = BlockCache::new();

    // A few rounds of create/delete/create to accumulate erases.
    for round in 0..3 {
        let mut created = vec![];
        for seed in 0..3 {
            let mut writer = VolumeWriter::begin(
                &cache,
                &mut dev,
                T_APP_BASE,
                150_000,
                0,
                MapBlock::INVALID,
            )
            .unwrap();
            writer.append_payload(&mut dev, &payload_pattern(100, seed));
            writer.commit(&mut dev);
            created.push(writer.volume);
        }
        if round < 2 {
            for vol in created {
                vol.mark_deleted(&cache, &mut dev);
            }
        }
    }

    for vol in volumes(&cache, &dev) {
        let map = map_of(&cache, &dev, vol);
        for (i, entry) in map.iter().enumerate() {
            if entry.is_valid() {
                assert_eq!(
                    vol.erase_count(&cache, &dev, i),
                    dev.erase_count(entry.index()),
                    "block {} erase count mismatch",
                    entry.index()
                );
            }
        }
    }
}

#[test]
fn deleted_blocks_are_recycled_with_bumped_counts() {
    let mut dev = SimFlash::new();
    let cache = BlockCache::new();

    // Fill the whole device so no orphans remain.
    let mut all = vec![];
    loop {
        match VolumeWriter::begin(
            &cache,
            &mut dev,
            T_APP_BASE,
            8 * 65536 - 4096,
            0,
            MapBlock::INVALID,
        ) {
            Ok(mut writer) => {
                writer.commit(&mut dev);
                all.push(writer.volume);
            }
            Err(_) => break,
        }
    }
    assert!(all.len() >= 2);

    // Delete one mid-device volume and note its blocks and counts.
    let victim = all[1];
    let victim_blocks: Vec<usize> = map_of(&cache, &dev, victim)
        .iter()
        .filter(|b| b.is_valid())
        .map(|b| b.index())
        .collect();
    let prior_counts: Vec<u32> =
        victim_blocks.iter().map(|&i| dev.erase_count(i)).collect();
    victim.mark_deleted(&cache, &mut dev);

    // A new volume of the same size must land exactly on those blocks.
    let mut writer = VolumeWriter::begin(
        &cache,
        &mut dev,
        T_APP_BASE + 1,
        8 * 65536 - 4096,
        0,
        MapBlock::INVALID,
    )
    .unwrap();
    writer.commit(&mut dev);

    let mut new_blocks: Vec<usize> = map_of(&cache, &dev, writer.volume)
        .iter()
        .filter(|b| b.is_valid())
        .map(|b| b.index())
        .collect();
    let mut expected = victim_blocks.clone();
    new_blocks.sort();
    expected.sort();
    assert_eq!(new_blocks, expected);

    for (i, &index) in victim_blocks.iter().enumerate() {
        assert_eq!(dev.erase_count(index), prior_counts[i] + 1);
    }
    assert!(writer.volume.is_valid(&cache, &dev));
}

#[test]
fn crash_during_begin_corrupts_nothing() {
    // Crash at a spread of points during an allocation; at every point,
    // the prior volume must remain intact and any new volume visible must
    // still carry the incomplete type.
    for budget in [0, 1, 7, 64, 200, 300, 1000, 5000] {
        let mut dev = SimFlash::new();
        let cache = BlockCache::new();

        let keep = payload_pattern(10_000, 9);
        let mut writer = VolumeWriter::begin(
            &cache,
            &mut dev,
            T_APP_BASE,
            keep.len(),
            0,
            MapBlock::INVALID,
        )
        .unwrap();
        writer.append_payload(&mut dev, &keep);
        writer.commit(&mut dev);
        let keeper = writer.volume;

        dev.fail_after_bytes(budget);
        let _ = VolumeWriter::begin(
            &cache,
            &mut dev,
            T_APP_BASE + 2,
            30_000,
            0,
            MapBlock::INVALID,
        );

        // Reboot: fresh cache, power restored.
        dev.clear_failure();
        let cache = BlockCache::new();

        let mut seen_keeper = false;
        for vol in volumes(&cache, &dev) {
            if vol.block == keeper.block {
                seen_keeper = true;
                let mut body = vec![0u8; keep.len()];
                assert!(vol
                    .payload(&cache, &dev)
                    .copy_bytes(&cache, &dev, 0, &mut body));
                assert_eq!(body, keep);
            } else {
                assert_eq!(
                    vol.type_code(&cache, &dev),
                    T_INCOMPLETE,
                    "crash budget {budget} exposed a committed ghost"
                );
            }
        }
        assert!(seen_keeper, "crash budget {budget} lost the prior volume");
    }
}

#[test]
fn incomplete_volumes_are_recycled() {
    let mut dev = SimFlash::new();
    let cache = BlockCache::new();

    // Interrupted allocation leaves a T_INCOMPLETE volume behind.
    dev.fail_after_bytes(100_000);
    let _ = VolumeWriter::begin(
        &cache,
        &mut dev,
        T_APP_BASE,
        200_000,
        0,
        MapBlock::INVALID,
    );
    dev.clear_failure();

    let cache = BlockCache::new();
    let before = volumes(&cache, &dev);
    assert!(before
        .iter()
        .any(|v| v.type_code(&cache, &dev) == T_INCOMPLETE));

    // The next allocation may consume its blocks freely.
    let mut writer = VolumeWriter::begin(
        &cache,
        &mut dev,
        T_APP_BASE + 1,
        200_000,
        0,
        MapBlock::INVALID,
    )
    .unwrap();
    writer.commit(&mut dev);
    assert!(writer.volume.is_valid(&cache, &dev));
}

#[test]
fn pre_erased_blocks_take_the_fast_path() {
    let mut dev = SimFlash::new();
    let cache = BlockCache::new();

    // Pre-erase a handful of blocks into the log.
    let mut pre = PreEraser::new(&cache, &dev);
    for _ in 0..6 {
        assert!(pre.next(&cache, &mut dev));
    }
    pre.finish(&mut dev);

    let erases_before: u32 =
        (0..NUM_MAP_BLOCKS).map(|i| dev.erase_count(i)).sum();

    // A small allocation should consume logged blocks without erasing.
    let mut writer = VolumeWriter::begin(
        &cache,
        &mut dev,
        T_APP_BASE,
        100_000,
        0,
        MapBlock::INVALID,
    )
    .unwrap();
    writer.commit(&mut dev);

    let erases_after: u32 =
        (0..NUM_MAP_BLOCKS).map(|i| dev.erase_count(i)).sum();
    assert_eq!(erases_before, erases_after);

    // And the stored counts still match ground truth.
    let vol = writer.volume;
    for (i, entry) in map_of(&cache, &dev, vol).iter().enumerate() {
        if entry.is_valid() {
            assert_eq!(
                vol.erase_count(&cache, &dev, i),
                dev.erase_count(entry.index())
            );
        }
    }
}

#[test]
fn popped_log_entries_do_not_dangle() {
    let mut dev = SimFlash::new();
    let cache = BlockCache::new();

    let mut pre = PreEraser::new(&cache, &dev);
    for _ in 0..4 {
        assert!(pre.next(&cache, &mut dev));
    }
    pre.finish(&mut dev);

    // Consume the log through an allocation, then make sure every block on
    // the device is either reachable from a valid volume or free to a
    // fresh recycler — nothing leaks.
    let mut writer = VolumeWriter::begin(
        &cache,
        &mut dev,
        T_APP_BASE,
        60_000,
        0,
        MapBlock::INVALID,
    )
    .unwrap();
    writer.commit(&mut dev);

    let mut reachable = vec![false; NUM_MAP_BLOCKS];
    for vol in volumes(&cache, &dev) {
        for entry in map_of(&cache, &dev, vol) {
            if entry.is_valid() {
                reachable[entry.index()] = true;
            }
        }
    }

    let mut recycler =
        flash_volume::Recycler::new(&cache, &dev, true);
    let mut claimed = 0;
    while let Some(_) = recycler.next(&mut dev) {
        claimed += 1;
        if claimed > NUM_MAP_BLOCKS {
            break;
        }
    }
    recycler.commit(&mut dev);

    let unreachable = reachable.iter().filter(|r| !**r).count();
    assert!(claimed >= unreachable, "recycler lost track of free blocks");
}
