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

//! Block group descriptors.
//!
//! The descriptor table starts on the block following the superblock. Each
//! descriptor locates the bitmaps and the inode table of one group.

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

/// An on-disk block group descriptor.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct BlockGroupDescriptor {
	/// The block containing the block usage bitmap.
	pub bg_block_bitmap: u32,
	/// The block containing the inode usage bitmap.
	pub bg_inode_bitmap: u32,
	/// The starting block of the inode table.
	pub bg_inode_table: u32,
	/// The number of unallocated blocks in the group.
	pub bg_free_blocks_count: u16,
	/// The number of unallocated inodes in the group.
	pub bg_free_inodes_count: u16,
	/// The number of directories in the group.
	pub bg_used_dirs_count: u16,
	pub bg_pad: u16,
	/// The block containing the exclude bitmap for the group. Blocks set in it
	/// are never preserved in snapshots. Zero means none.
	pub bg_exclude_bitmap: u32,

	pub bg_reserved: [u32; 2],
}

const_assert_eq!(core::mem::size_of::<BlockGroupDescriptor>(), 32);

impl BlockGroupDescriptor {
	/// Returns the number of descriptors per block for the given block size.
	pub fn per_block(blk_size: u32) -> u32 {
		blk_size / core::mem::size_of::<Self>() as u32
	}
}

/// Volatile per-group state, rebuilt at every mount.
///
/// `cow_bitmap` caches the block, inside the active snapshot, holding the
/// snapshot's private copy of the group's block bitmap. It is never written
/// to the on-disk descriptor: a stale value after remount only costs a
/// re-initialization.
#[derive(Default)]
pub struct GroupInfo {
	/// The snapshot block holding the group's copy-on-write bitmap. Zero means
	/// not initialized yet.
	cow_bitmap: AtomicU32,
	/// Serializes block bitmap mutation with the copy taken when the group's
	/// copy-on-write bitmap is initialized.
	lock: Mutex<()>,
}

impl GroupInfo {
	/// Returns the cached copy-on-write bitmap block, or zero.
	#[inline]
	pub fn cow_bitmap(&self) -> u32 {
		self.cow_bitmap.load(Relaxed)
	}

	/// Records the copy-on-write bitmap block for the group.
	#[inline]
	pub fn set_cow_bitmap(&self, blk: u32) {
		self.cow_bitmap.store(blk, Relaxed);
	}

	/// Resets the cached copy-on-write bitmap block.
	///
	/// Called when the active snapshot is released.
	#[inline]
	pub fn clear_cow_bitmap(&self) {
		self.cow_bitmap.store(0, Relaxed);
	}

	/// Returns the group-local lock.
	#[inline]
	pub fn lock(&self) -> &Mutex<()> {
		&self.lock
	}
}
