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

//! Interface to the underlying block device.
//!
//! The core never talks to storage directly. Everything goes through the
//! buffer cache, which in turn reads and writes whole filesystem blocks
//! through this trait.

use crate::err::FsResult;

/// A storage device addressed in filesystem blocks.
///
/// Implementations must be safe to call from several tasks at once. The
/// buffer cache serializes accesses to a given block, but different blocks
/// may be read or written concurrently.
pub trait BlockDevice: Send + Sync {
	/// Returns the size of a block in bytes.
	fn block_size(&self) -> u32;

	/// Returns the total number of blocks on the device.
	fn block_count(&self) -> u64;

	/// Reads the block at offset `blk` into `buf`.
	///
	/// `buf` is exactly one block long.
	fn read_block(&self, blk: u64, buf: &mut [u8]) -> FsResult<()>;

	/// Writes `buf` to the block at offset `blk`.
	fn write_block(&self, blk: u64, buf: &[u8]) -> FsResult<()>;
}
