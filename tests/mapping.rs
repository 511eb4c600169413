/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Snapfs.
 *
 * Snapfs is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Snapfs is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Snapfs. If not, see <https://www.gnu.org/licenses/>.
 */

//! Block mapping: lookups, branch allocation and splicing.

mod common;

use common::Harness;
use snapfs::{
	block::{branch::get_branch, path::resolve},
	inode::{Inode, DIR_BLOCKS, IND_SLOT, TIND_SLOT},
	AllocMode, Allocator, FsError, Journal, MapFlags, MapMode, SnapFs,
};
use std::{sync::Arc, thread, time::Duration};

#[test]
fn single_indirect_splice() {
	let h = Harness::new();
	let file = h.create_file();
	// First write beyond the direct slots
	let phys = h.write_block(&file, DIR_BLOCKS as u32, 0x5a);
	let ind = file.disk().read_slot(IND_SLOT);
	assert_ne!(ind, 0);
	let buf = h.cache.get(ind as u64).unwrap();
	assert_eq!(buf.read_slot(0), phys);
	// One indirect block plus one data block are charged
	assert_eq!(file.disk().get_blocks(&h.fs.sb()), 2);
	assert_eq!(h.alloc.quota_usage(file.ino), 2);
}

#[test]
fn triple_indirect_hole_fill() {
	let h = Harness::new();
	let file = h.create_file();
	// 12 + 256 + 256^2: first block of the triply indirect range
	let iblock = 12 + 256 + 256 * 256;
	let phys = h.write_block(&file, iblock, 0x77);
	// The whole downward chain must be valid
	let tind = file.disk().read_slot(TIND_SLOT);
	assert_ne!(tind, 0);
	let l1 = h.cache.get(tind as u64).unwrap().read_slot(0);
	assert_ne!(l1, 0);
	let l2 = h.cache.get(l1 as u64).unwrap().read_slot(0);
	assert_ne!(l2, 0);
	assert_eq!(l2, phys);
	// 3 indirect blocks + 1 data block
	assert_eq!(file.disk().get_blocks(&h.fs.sb()), 4);
	// No other slot of the fresh indirect blocks leaked a pointer
	let buf = h.cache.get(tind as u64).unwrap();
	for slot in 1..256 {
		assert_eq!(buf.read_slot(slot), 0);
	}
}

#[test]
fn lookup_reports_holes() {
	let h = Harness::new();
	let file = h.create_file();
	let mapping = h.fs.map_block(&file, 7, 1, MapMode::Lookup).unwrap();
	assert!(!mapping.flags.contains(MapFlags::MAPPED));
	assert_eq!(mapping.count, 0);
	h.write_block(&file, 7, 1);
	let mapping = h.fs.map_block(&file, 7, 1, MapMode::Lookup).unwrap();
	assert!(mapping.flags.contains(MapFlags::MAPPED));
	assert_eq!(mapping.count, 1);
}

#[test]
fn contiguous_runs() {
	let h = Harness::new();
	let file = h.create_file();
	let handle = h.start();
	// A batched creating mapping returns a contiguous extent
	let mapping = h
		.fs
		.map_block(
			&file,
			0,
			8,
			MapMode::Create {
				handle: &handle,
				mode: AllocMode::empty(),
			},
		)
		.unwrap();
	assert!(mapping.flags.contains(MapFlags::NEW));
	assert!(mapping.count >= 1 && mapping.count <= 8);
	for i in 0..mapping.count {
		assert_eq!(file.disk().read_slot(i as usize), mapping.phys + i);
	}
	h.journal.stop(&handle).unwrap();
	// A lookup over the extent reports the same run
	let lookup = h
		.fs
		.map_block(&file, 0, mapping.count, MapMode::Lookup)
		.unwrap();
	assert_eq!(lookup.phys, mapping.phys);
	assert_eq!(lookup.count, mapping.count);
}

#[test]
fn boundary_is_reported() {
	let h = Harness::new();
	let file = h.create_file();
	// Last direct slot
	h.write_block(&file, DIR_BLOCKS as u32 - 1, 1);
	let mapping = h
		.fs
		.map_block(&file, DIR_BLOCKS as u32 - 1, 4, MapMode::Lookup)
		.unwrap();
	assert!(mapping.flags.contains(MapFlags::BOUNDARY));
	assert_eq!(mapping.count, 1);
	// Last slot of the simply indirect block
	let last_ind = DIR_BLOCKS as u32 + 255;
	h.write_block(&file, last_ind, 2);
	let mapping = h
		.fs
		.map_block(&file, last_ind, 4, MapMode::Lookup)
		.unwrap();
	assert!(mapping.flags.contains(MapFlags::BOUNDARY));
	assert_eq!(mapping.count, 1);
}

#[test]
fn mapping_survives_remount() {
	let h = Harness::new();
	let file = h.create_file();
	let ino = file.ino;
	let mut expected = Vec::new();
	for iblock in [0u32, 5, 12, 12 + 256, 1000] {
		let phys = h.write_block(&file, iblock, iblock as u8);
		expected.push((iblock, phys));
	}
	let h = h.remount();
	let file = h.fs.get_inode(ino).unwrap();
	for (iblock, phys) in expected {
		let mapping = h.fs.map_block(&file, iblock, 1, MapMode::Lookup).unwrap();
		assert!(mapping.flags.contains(MapFlags::MAPPED));
		assert_eq!(mapping.phys, phys);
		let data = h.read_block(&file, iblock).unwrap();
		assert!(data.iter().all(|b| *b == iblock as u8));
	}
}

#[test]
fn out_of_range_offset() {
	let h = Harness::new();
	let file = h.create_file();
	// Beyond the reach of a conventional inode's tree
	let max = (12 + 256 + 256 * 256 + 256 * 256 * 256) as u32;
	let res = h.fs.map_block(&file, max, 1, MapMode::Lookup);
	assert_eq!(res.err(), Some(FsError::OutOfRange));
}

/// Races a walking task against a full truncate of the walked branch.
///
/// The walker sleeps on the device read of the doubly indirect block, like a
/// task losing the CPU mid-walk. The truncate runs during the pause and sits
/// on that same read until the walker's fill completes; the walker's
/// re-validation is then held back, through the inode lock its root check
/// needs, until the truncate has dropped the captured pointer. Whatever the
/// walker does next, it does against a chain that no longer exists.
fn walk_against_truncate<T: Send + 'static>(
	h: &Harness,
	walker: impl FnOnce(Arc<SnapFs>, Arc<Inode>, u32) -> T + Send + 'static,
) -> (Arc<Inode>, u32, T) {
	let file = h.create_file();
	// First block of the triply indirect range: a depth-4 branch
	let iblock = 12 + 256 + 256 * 256;
	h.write_block(&file, iblock, 0x11);
	let r = file.disk().read_slot(TIND_SLOT);
	let r_buf = h.cache.get(r as u64).unwrap();
	let x = r_buf.read_slot(0);
	// The walker must go to the device for the doubly indirect block
	h.cache.forget(x as u64);
	h.dev.arm_read_gate(x as u64);
	let walk = {
		let fs = h.fs.clone();
		let file = file.clone();
		thread::spawn(move || walker(fs, file, iblock))
	};
	h.dev.await_read_gate();
	let truncate = {
		let fs = h.fs.clone();
		let file = file.clone();
		thread::spawn(move || {
			file.disk().set_size(0);
			file.mark_dirty();
			fs.truncate(&file)
		})
	};
	// Let the truncate pass its opening writes and reach the walked branch,
	// where it waits on the read the walker still owns
	while h.fs.sb().s_last_orphan != file.ino {
		thread::sleep(Duration::from_millis(1));
	}
	thread::sleep(Duration::from_millis(200));
	{
		// Hold the walker's re-validation until the captured pointer is gone
		let _resume_hold = file.disk();
		h.dev.open_read_gate();
		while r_buf.read_slot(0) != 0 {
			thread::sleep(Duration::from_millis(1));
		}
	}
	let res = walk.join().unwrap();
	truncate.join().unwrap().unwrap();
	(file, iblock, res)
}

#[test]
fn branch_walk_detects_concurrent_truncate() {
	let h = Harness::new();
	let (file, iblock, res) = walk_against_truncate(&h, |fs, file, iblock| {
		let log = fs.sb().get_entries_per_block_log();
		let path = resolve(iblock, log, false).unwrap();
		get_branch(&fs, &file, &path).map(|b| b.is_complete())
	});
	// The resumed walker finds its captured chain stale and bails out
	assert_eq!(res, Err(FsError::Conflict));
	// The tree is gone; a fresh walk sees the hole
	assert_eq!(file.disk().read_slot(TIND_SLOT), 0);
	let mapping = h.fs.map_block(&file, iblock, 1, MapMode::Lookup).unwrap();
	assert!(!mapping.flags.contains(MapFlags::MAPPED));
}

#[test]
fn conflicted_mapping_retries_to_the_hole() {
	let h = Harness::new();
	// The same race through `map_block`: the conflicted first walk is
	// retried under the tree lock, where the truncated range reads as a hole
	let (_, _, res) = walk_against_truncate(&h, |fs, file, iblock| {
		fs.map_block(&file, iblock, 1, MapMode::Lookup)
	});
	let mapping = res.unwrap();
	assert!(!mapping.flags.contains(MapFlags::MAPPED));
	assert_eq!(mapping.count, 0);
}

#[test]
fn sequential_allocations_stay_close() {
	let h = Harness::new();
	let file = h.create_file();
	let a = h.write_block(&file, 0, 1);
	let b = h.write_block(&file, 1, 2);
	// The goal of a sequential write is right after the previous block
	assert_eq!(b, a + 1);
}
