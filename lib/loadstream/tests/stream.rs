// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Encoder/decoder agreement for the loadstream, over a RAM-backed tile
//! memory that models erase-before-program.

use loadstream::{Decoder, Encoder, TileTarget, BLOCK_SIZE, TILE_BYTES};

struct RamTiles {
    mem: Vec<u16>,
    erased: Vec<bool>,
    erase_count: Vec<u32>,
    queries: Vec<(u8, u32)>,
    checks: Vec<Vec<u8>>,
}

impl RamTiles {
    fn new(blocks: usize) -> Self {
        Self {
            mem: vec![0xDEAD; blocks * BLOCK_SIZE / 2],
            erased: vec![false; blocks],
            erase_count: vec![0; blocks],
            queries: vec![],
            checks: vec![],
        }
    }

    fn tile(&self, index: usize) -> &[u16] {
        let word = index * TILE_BYTES / 2;
        &self.mem[word..word + TILE_BYTES / 2]
    }
}

impl TileTarget for RamTiles {
    fn program_word(&mut self, addr: u32, word: u16) {
        let block = addr as usize / BLOCK_SIZE;
        assert!(self.erased[block], "programming an unerased block");
        self.mem[addr as usize / 2] &= word;
    }

    fn erase_block(&mut self, index: usize) {
        let base = index * BLOCK_SIZE / 2;
        self.mem[base..base + BLOCK_SIZE / 2].fill(0xFFFF);
        self.erased[index] = true;
        self.erase_count[index] += 1;
    }

    fn read_word(&self, addr: u32) -> u16 {
        self.mem[addr as usize / 2]
    }

    fn query_result(&mut self, query_id: u8, crc: u32) {
        self.queries.push((query_id, crc));
    }

    fn check_query(&mut self, bytes: &[u8]) {
        self.checks.push(bytes.to_vec());
    }
}

#[test]
fn solid_tiles_program_and_erase_first() {
    let mut enc = Encoder::new();
    let mut stream = vec![];
    let mut out = |b| stream.push(b);
    enc.lut1(3, 0xF00F, &mut out);
    enc.set_address(0, &mut out);
    enc.tile_solid(3, &mut out);
    enc.tile_solid(3, &mut out);

    let mut dec = Decoder::new();
    let mut mem = RamTiles::new(2);
    dec.feed(&stream, &mut mem);

    assert_eq!(mem.erase_count[0], 1);
    assert_eq!(mem.erase_count[1], 0);
    assert!(mem.tile(0).iter().all(|&w| w == 0xF00F));
    assert!(mem.tile(1).iter().all(|&w| w == 0xF00F));
}

#[test]
fn rle_tiles_round_trip_at_each_depth() {
    for bits in [1u8, 2, 4] {
        let levels = 1u8 << bits;
        // A pattern with genuine runs in it.
        let mut tiles = [[0u8; 64]; 3];
        for (t, tile) in tiles.iter_mut().enumerate() {
            for (i, px) in tile.iter_mut().enumerate() {
                *px = match i {
                    0..=30 => 0,
                    31 => (t as u8) % levels,
                    _ => (i as u8 / 7) % levels,
                };
            }
        }

        let mut enc = Encoder::new();
        let mut stream = vec![];
        let mut out = |b| stream.push(b);
        // LUT entries 0..levels get distinct colors.
        for i in 0..levels {
            enc.lut1(i, 0x1000 + u16::from(i) * 3, &mut out);
        }
        enc.set_address(0, &mut out);
        enc.tiles_rle(bits, &tiles, &mut out);

        let mut dec = Decoder::new();
        let mut mem = RamTiles::new(1);
        dec.feed(&stream, &mut mem);

        for (t, tile) in tiles.iter().enumerate() {
            for (i, &px) in tile.iter().enumerate() {
                assert_eq!(
                    mem.tile(t)[i],
                    0x1000 + u16::from(px) * 3,
                    "bits={bits} tile={t} pixel={i}"
                );
            }
        }
    }
}

#[test]
fn rle_long_runs_use_counts() {
    // 64 identical pixels at 1bpp is 16 equal nybbles; with the escape
    // this is far smaller than the raw packing.
    let tiles = [[1u8; 64]; 4];
    let mut enc = Encoder::new();
    let mut stream = vec![];
    let mut out = |b| stream.push(b);
    enc.lut1(0, 0x1111, &mut out);
    enc.lut1(1, 0x2222, &mut out);
    enc.set_address(0, &mut out);
    enc.tiles_rle(1, &tiles, &mut out);

    // Raw would be 4 tiles * 16 nybbles = 32 bytes of pixel data.
    assert!(stream.len() < 20);

    let mut dec = Decoder::new();
    let mut mem = RamTiles::new(1);
    dec.feed(&stream, &mut mem);
    for t in 0..4 {
        assert!(mem.tile(t).iter().all(|&w| w == 0x2222));
    }
}

#[test]
fn p16_tiles_round_trip_with_repetition() {
    let mut tiles = [[0u16; 64]; 2];
    for (i, px) in tiles[0].iter_mut().enumerate() {
        *px = 0x8000 | (i as u16 & 7); // repeats across groups
    }
    for (i, px) in tiles[1].iter_mut().enumerate() {
        *px = (i as u16) * 0x101;
    }

    let mut enc = Encoder::new();
    let mut stream = vec![];
    let mut out = |b| stream.push(b);
    enc.set_address(4, &mut out);
    enc.tiles_p16(&tiles, &mut out);

    let mut dec = Decoder::new();
    let mut mem = RamTiles::new(1);
    dec.feed(&stream, &mut mem);

    assert_eq!(mem.tile(4), &tiles[0][..]);
    assert_eq!(mem.tile(5), &tiles[1][..]);

    // The repeated groups in tile 0 should have made the stream smaller
    // than raw 16bpp.
    assert!(stream.len() < 3 + 2 * (64 * 2 + 8));
}

#[test]
fn byte_at_a_time_feeding_matches_bulk() {
    let mut enc = Encoder::new();
    let mut stream = vec![];
    let mut out = |b| stream.push(b);
    enc.lut16(&[(0, 0x1234), (1, 0xAAAA), (3, 0xBBBB)], &mut out);
    enc.set_address(0, &mut out);
    let mut idx_tiles = [[1u8; 64]; 2];
    idx_tiles[1][..8].fill(3);
    enc.tiles_rle(2, &idx_tiles, &mut out);

    let mut bulk = RamTiles::new(1);
    let mut dec = Decoder::new();
    dec.feed(&stream, &mut bulk);

    let mut dribble = RamTiles::new(1);
    let mut dec = Decoder::new();
    for &b in &stream {
        dec.feed(&[b], &mut dribble);
    }

    assert_eq!(bulk.mem, dribble.mem);
}

#[test]
fn address_op_targets_later_blocks() {
    let mut enc = Encoder::new();
    let mut stream = vec![];
    let mut out = |b| stream.push(b);
    enc.lut1(0, 0x00FF, &mut out);
    // Tile 512 lands in the second 64 KiB block.
    enc.set_address(512, &mut out);
    enc.tile_solid(0, &mut out);

    let mut dec = Decoder::new();
    let mut mem = RamTiles::new(2);
    dec.feed(&stream, &mut mem);

    assert_eq!(mem.erase_count[0], 0);
    assert_eq!(mem.erase_count[1], 1);
    assert!(mem.tile(512).iter().all(|&w| w == 0x00FF));
}

#[test]
fn crc_query_reports_programmed_tiles() {
    let mut enc = Encoder::new();
    let mut stream = vec![];
    let mut out = |b| stream.push(b);
    enc.lut1(0, 0x4242, &mut out);
    enc.set_address(0, &mut out);
    enc.tile_solid(0, &mut out);
    enc.set_address(0, &mut out);
    enc.query_crc(9, 1, &mut out);

    let mut dec = Decoder::new();
    let mut mem = RamTiles::new(1);
    dec.feed(&stream, &mut mem);

    assert_eq!(mem.queries.len(), 1);
    assert_eq!(mem.queries[0].0, 9);

    // The CRC matches an independent computation over the tile data.
    let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let mut digest = crc.digest();
    for &w in mem.tile(0) {
        digest.update(&w.to_le_bytes());
    }
    assert_eq!(mem.queries[0].1, digest.finalize());
}

#[test]
fn check_query_passes_bytes_through() {
    let mut enc = Encoder::new();
    let mut stream = vec![];
    let mut out = |b| stream.push(b);
    enc.check_query(&[1, 2, 3, 4], &mut out);
    enc.nop(&mut out);

    let mut dec = Decoder::new();
    let mut mem = RamTiles::new(1);
    dec.feed(&stream, &mut mem);

    assert_eq!(mem.checks, vec![vec![1, 2, 3, 4]]);
}

#[test]
fn reset_starts_a_fresh_session() {
    let mut enc = Encoder::new();
    let mut stream = vec![];
    let mut out = |b| stream.push(b);
    enc.lut1(0, 0xAAAA, &mut out);
    enc.set_address(0, &mut out);
    enc.tile_solid(0, &mut out);

    let mut dec = Decoder::new();
    let mut mem = RamTiles::new(1);
    dec.feed(&stream, &mut mem);
    assert_eq!(mem.erase_count[0], 1);

    // After a reset the next program re-erases the block.
    dec.reset();
    let mut stream = vec![];
    let mut out = |b| stream.push(b);
    enc.reset();
    enc.lut1(0, 0xBBBB, &mut out);
    enc.set_address(0, &mut out);
    enc.tile_solid(0, &mut out);
    dec.feed(&stream, &mut mem);

    assert_eq!(mem.erase_count[0], 2);
    assert!(mem.tile(0).iter().all(|&w| w == 0xBBBB));
}
