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

//! The superblock describes the geometry of the filesystem and carries the
//! mutable state shared by every block group: free counters, the orphan list
//! head and the snapshot list.

use crate::err::{FsError, FsResult};
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

/// The filesystem's magic number.
pub const SNAPFS_MAGIC: u16 = 0x5346;

/// The offset of the superblock from the beginning of the device, in bytes.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// State telling that the filesystem is clean.
pub const FS_STATE_CLEAN: u16 = 1;
/// State telling that the filesystem has errors.
pub const FS_STATE_ERROR: u16 = 2;

/// Error handle action telling to ignore it.
pub const ERR_ACTION_IGNORE: u16 = 1;
/// Error handle action telling to mount as read-only.
pub const ERR_ACTION_READ_ONLY: u16 = 2;
/// Error handle action telling to refuse any further access.
pub const ERR_ACTION_PANIC: u16 = 3;

bitflags::bitflags! {
	/// Mount options.
	#[derive(Clone, Copy, Debug, Eq, PartialEq)]
	pub struct MountFlags: u32 {
		/// Mount the filesystem read-only.
		const RDONLY = 0x1;
	}
}

/// The on-disk superblock structure.
///
/// Occupies 1024 bytes starting at [`SUPERBLOCK_OFFSET`] on the device,
/// whatever the block size.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Superblock {
	/// Total number of inodes in the filesystem.
	pub s_inodes_count: u32,
	/// Total number of blocks in the filesystem.
	pub s_blocks_count: u32,
	/// Number of blocks reserved for the superuser.
	pub s_r_blocks_count: u32,
	/// Total number of unallocated blocks.
	pub s_free_blocks_count: u32,
	/// Total number of unallocated inodes.
	pub s_free_inodes_count: u32,
	/// Block number of the block containing the superblock.
	pub s_first_data_block: u32,
	/// `log2(block_size) - 10`
	pub s_log_block_size: u32,
	/// The number of blocks per block group.
	pub s_blocks_per_group: u32,
	/// The number of inodes per block group.
	pub s_inodes_per_group: u32,
	/// The timestamp of the last mount operation.
	pub s_mtime: u32,
	/// The timestamp of the last write operation.
	pub s_wtime: u32,
	/// The number of mounts since the last consistency check.
	pub s_mnt_count: u16,
	/// The number of mounts allowed before a consistency check must be done.
	pub s_max_mnt_count: u16,
	/// The filesystem's signature.
	pub s_magic: u16,
	/// The filesystem's state.
	pub s_state: u16,
	/// The action to perform when an error is detected.
	pub s_errors: u16,
	/// The minor version.
	pub s_minor_rev_level: u16,
	/// The timestamp of the last consistency check.
	pub s_lastcheck: u32,
	/// The major version.
	pub s_rev_level: u32,
	/// The first non-reserved inode.
	pub s_first_ino: u32,
	/// The size of the inode structure in bytes.
	pub s_inode_size: u16,
	/// The block group containing the superblock.
	pub s_block_group_nr: u16,
	/// Optional features for the implementation to support.
	pub s_feature_compat: u32,
	/// Required features for the implementation to support.
	pub s_feature_incompat: u32,
	/// Required features for the implementation to support for writing.
	pub s_feature_ro_compat: u32,
	/// The filesystem id.
	pub s_uuid: [u8; 16],
	/// The volume name.
	pub s_volume_name: [u8; 16],
	/// The head of the orphan inodes list.
	pub s_last_orphan: u32,
	/// The inode of the active snapshot. Zero means none.
	pub s_snapshot_inum: u32,
	/// The id of the active snapshot.
	pub s_snapshot_id: u32,
	/// The head of the on-disk snapshot list. Zero means the list is empty.
	pub s_snapshot_list: u32,
	/// The message recorded by the last detected inconsistency.
	pub s_error_msg: [u8; 64],

	pub _padding: [u8; 828],
}

const_assert_eq!(core::mem::size_of::<Superblock>(), 1024);

impl Superblock {
	/// Tells whether the superblock is valid.
	pub fn is_valid(&self) -> bool {
		self.s_magic == SNAPFS_MAGIC
	}

	/// Returns the size of a block in bytes.
	pub fn get_block_size(&self) -> u32 {
		1024 << self.s_log_block_size
	}

	/// Returns the log2 of the number of block entries in each block.
	pub fn get_entries_per_block_log(&self) -> u32 {
		// An entry is 4 bytes long (`log2(4) = 2`)
		self.s_log_block_size + 10 - 2
	}

	/// Returns the number of block entries in each block.
	pub fn get_entries_per_block(&self) -> u32 {
		1 << self.get_entries_per_block_log()
	}

	/// Returns the number of block groups.
	pub fn get_block_groups_count(&self) -> u32 {
		self.s_blocks_count.div_ceil(self.s_blocks_per_group)
	}

	/// Returns the size of an inode.
	pub fn get_inode_size(&self) -> usize {
		if self.s_rev_level >= 1 {
			self.s_inode_size as _
		} else {
			128
		}
	}

	/// Returns the block group containing the block `blk`.
	pub fn block_group_of(&self, blk: u32) -> u32 {
		(blk - self.s_first_data_block) / self.s_blocks_per_group
	}

	/// Returns the offset of `blk` inside its block group's bitmap.
	pub fn group_index_of(&self, blk: u32) -> u32 {
		(blk - self.s_first_data_block) % self.s_blocks_per_group
	}

	/// Returns the first block of the block group `group`.
	pub fn group_first_block(&self, group: u32) -> u32 {
		self.s_first_data_block + group * self.s_blocks_per_group
	}

	/// Checks the superblock is sane for the given device size, in blocks.
	pub fn validate(&self, dev_blocks: u64) -> FsResult<()> {
		if !self.is_valid() {
			return Err(FsError::Inconsistency("bad magic number"));
		}
		if self.s_log_block_size > 6 {
			return Err(FsError::Inconsistency("unsupported block size"));
		}
		if self.s_blocks_count as u64 > dev_blocks {
			return Err(FsError::Inconsistency("block count beyond device"));
		}
		if self.s_blocks_per_group == 0 || self.s_inodes_per_group == 0 {
			return Err(FsError::Inconsistency("empty block group geometry"));
		}
		// A group's block bitmap must fit in one block
		if self.s_blocks_per_group > self.get_block_size() * 8 {
			return Err(FsError::Inconsistency("block group larger than its bitmap"));
		}
		if self.s_rev_level >= 1 {
			let inode_size = self.s_inode_size as u32;
			if !inode_size.is_power_of_two()
				|| inode_size < 128
				|| inode_size > self.get_block_size()
			{
				return Err(FsError::Inconsistency("bad inode size"));
			}
		}
		Ok(())
	}

	/// Returns the block and the offset inside it at which the superblock is
	/// stored, for the given block size.
	pub fn location(blk_size: u32) -> (u64, usize) {
		(
			SUPERBLOCK_OFFSET / blk_size as u64,
			(SUPERBLOCK_OFFSET % blk_size as u64) as usize,
		)
	}
}
