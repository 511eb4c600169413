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

//! Interface to the block and inode allocator.
//!
//! The allocator owns the bitmaps and the quota accounting. It lives outside
//! of the core, with one obligation towards it: any modification of a block
//! bitmap must first obtain access through
//! [`crate::SnapFs::get_bitmap_access`], so that the bitmap's pre-image is
//! preserved in the active snapshot before the first bit flips.

use crate::{bgd::BlockGroupDescriptor, cache::RcBuffer, err::FsResult, journal::Handle, SnapFs};

/// The block and inode allocation service consumed by the core.
pub trait Allocator: Send + Sync {
	/// Allocates up to `count` consecutive blocks near `goal`, best-effort.
	///
	/// Arguments:
	/// - `ino` is the inode whose owner the blocks are charged to
	/// - `goal` is the preferred first block
	/// - `count` is the wanted run length
	///
	/// Returns the first allocated block and the obtained run length, which is
	/// at least 1. Fails with `NoSpace` when the filesystem is full.
	fn new_blocks(
		&self,
		fs: &SnapFs,
		handle: &Handle,
		ino: u32,
		goal: u32,
		count: u32,
	) -> FsResult<(u32, u32)>;

	/// Returns `count` consecutive blocks starting at `first` to the free
	/// pool, refunding the owner of `ino`.
	fn free_blocks(
		&self,
		fs: &SnapFs,
		handle: &Handle,
		ino: u32,
		first: u32,
		count: u32,
	) -> FsResult<()>;

	/// Allocates an inode number.
	fn new_inode(&self, fs: &SnapFs, handle: &Handle) -> FsResult<u32>;

	/// Returns the inode number `ino` to the free pool.
	fn free_inode(&self, fs: &SnapFs, handle: &Handle, ino: u32) -> FsResult<()>;

	/// Returns the descriptor of the block group `group`.
	fn group_desc(&self, group: u32) -> FsResult<BlockGroupDescriptor>;

	/// Returns the buffer holding the live block bitmap of `group`.
	fn read_block_bitmap(&self, group: u32) -> FsResult<RcBuffer>;

	/// Returns the number of blocks charged to the owner of `ino`.
	fn quota_usage(&self, ino: u32) -> u64;

	/// Moves the charge for `count` blocks from the owner of `from` to the
	/// owner of `to`.
	fn quota_transfer(&self, from: u32, to: u32, count: u32) -> FsResult<()>;
}
