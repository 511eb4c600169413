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

//! An inode represents a file in the filesystem.
//!
//! The inode addresses its content through a slot array: [`DIR_BLOCKS`]
//! direct slots, then one simply, one doubly and one triply indirect slot.
//!
//! Snapshot files must map the whole block address space of the device, which
//! the conventional array cannot reach. Their slot array is therefore
//! extended with [`NTIND`] additional triply indirect slots, and the layout
//! rotates: the indirect roots move to the front of the on-disk array and
//! the direct slots to the end, so that the extended roots sit right after
//! the original one.

use crate::{err::FsError, err::FsResult, sb::Superblock};
use bytemuck::{Pod, Zeroable};
use parking_lot::{Mutex, MutexGuard};
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};

/// The number of direct slots in each inode.
pub const DIR_BLOCKS: usize = 12;
/// The index of the simply indirect slot.
pub const IND_SLOT: usize = DIR_BLOCKS;
/// The index of the doubly indirect slot.
pub const DIND_SLOT: usize = DIR_BLOCKS + 1;
/// The index of the triply indirect slot.
pub const TIND_SLOT: usize = DIR_BLOCKS + 2;
/// The number of slots in a conventional inode.
pub const N_BLOCKS: usize = DIR_BLOCKS + 3;
/// The number of additional triply indirect slots in a snapshot inode.
pub const NTIND: usize = 4;
/// The number of slots in a snapshot inode.
pub const SNAPSHOT_N_BLOCKS: usize = N_BLOCKS + NTIND;

/// The size of a sector in bytes, for block accounting.
pub const SECTOR_SIZE: u32 = 512;

/// The maximum length for a symlink target to be stored in the inode itself
/// instead of a separate block.
pub const SYMLINK_INLINE_LIMIT: u32 = 60;

/// INode type: FIFO
pub const INODE_TYPE_FIFO: u16 = 0x1000;
/// INode type: Char device
pub const INODE_TYPE_CHAR_DEVICE: u16 = 0x2000;
/// INode type: Directory
pub const INODE_TYPE_DIRECTORY: u16 = 0x4000;
/// INode type: Block device
pub const INODE_TYPE_BLOCK_DEVICE: u16 = 0x6000;
/// INode type: Regular file
pub const INODE_TYPE_REGULAR: u16 = 0x8000;
/// INode type: Symbolic link
pub const INODE_TYPE_SYMLINK: u16 = 0xa000;
/// INode type: Socket
pub const INODE_TYPE_SOCKET: u16 = 0xc000;

bitflags::bitflags! {
	/// Inode flags.
	#[derive(Clone, Copy, Debug, Eq, PartialEq)]
	pub struct InodeFlags: u32 {
		/// The file cannot be modified.
		const IMMUTABLE = 0x00010;
		/// `i_blocks` counts filesystem blocks instead of 512-byte sectors,
		/// with `i_blocks_high` holding the upper bits.
		const HUGE_FILE = 0x40000;
		/// The inode is a snapshot file.
		const SNAPFILE = 0x01000000;
		/// The snapshot is linked on the on-disk snapshot list.
		const SNAPFILE_ON_LIST = 0x02000000;
		/// The snapshot is the active one.
		const SNAPFILE_ACTIVE = 0x04000000;
	}
}

/// The type of a file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
	Fifo,
	CharDevice,
	Directory,
	BlockDevice,
	Regular,
	Link,
	Socket,
}

/// The on-disk inode structure.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DiskInode {
	/// Type and permissions.
	pub i_mode: u16,
	/// User ID.
	pub i_uid: u16,
	/// Lower 32 bits of size in bytes.
	pub i_size: u32,
	/// Timestamp of the last access.
	pub i_atime: u32,
	/// Timestamp of the last modification of the metadata.
	pub i_ctime: u32,
	/// Timestamp of the last modification of the content.
	pub i_mtime: u32,
	/// Timestamp of the deletion. While the inode is on the orphan list, the
	/// field holds the next orphan's inumber instead.
	pub i_dtime: u32,
	/// Group ID.
	pub i_gid: u16,
	/// The number of hard links to this inode.
	pub i_links_count: u16,
	/// The number of sectors used by this inode, or of filesystem blocks when
	/// the `HUGE_FILE` flag is set.
	pub i_blocks: u32,
	/// INode flags.
	pub i_flags: u32,
	/// OS-specific value.
	pub i_osd1: u32,
	/// The slot array.
	pub i_block: [u32; N_BLOCKS],
	/// Generation number.
	pub i_generation: u32,
	/// The file's ACL.
	pub i_file_acl: u32,
	/// Higher 32 bits of size in bytes.
	pub i_size_high: u32,
	/// Block address of fragment.
	pub i_faddr: u32,
	/// Higher 16 bits of the block count, used with `HUGE_FILE`.
	pub i_blocks_high: u16,
	pub i_pad: u16,
	/// The next snapshot on the snapshot list. Zero terminates the list.
	pub i_next_snapshot: u32,
	pub i_reserved: u32,
	/// Extra triply indirect slots, used by snapshot inodes only.
	pub i_block_extra: [u32; NTIND],

	pub _padding: [u8; 112],
}

const_assert_eq!(core::mem::size_of::<DiskInode>(), 256);

impl DiskInode {
	/// Returns the type of the file.
	pub fn get_type(&self) -> FileType {
		let file_type = self.i_mode & 0xf000;
		match file_type {
			INODE_TYPE_FIFO => FileType::Fifo,
			INODE_TYPE_CHAR_DEVICE => FileType::CharDevice,
			INODE_TYPE_DIRECTORY => FileType::Directory,
			INODE_TYPE_BLOCK_DEVICE => FileType::BlockDevice,
			INODE_TYPE_SYMLINK => FileType::Link,
			INODE_TYPE_SOCKET => FileType::Socket,
			_ => FileType::Regular,
		}
	}

	/// Returns the inode flags.
	pub fn flags(&self) -> InodeFlags {
		InodeFlags::from_bits_truncate(self.i_flags)
	}

	/// Tells whether the inode is a snapshot file.
	#[inline]
	pub fn is_snapshot(&self) -> bool {
		self.flags().contains(InodeFlags::SNAPFILE)
	}

	/// Returns the number of slots in the inode's slot array.
	#[inline]
	pub fn slot_count(&self) -> usize {
		if self.is_snapshot() {
			SNAPSHOT_N_BLOCKS
		} else {
			N_BLOCKS
		}
	}

	/// Returns the on-disk position of the logical slot `slot`.
	///
	/// For conventional inodes, the position is the slot itself. For snapshot
	/// inodes, the array is rotated so that the indirect roots come first.
	fn slot_position(&self, slot: usize) -> usize {
		if self.is_snapshot() {
			(slot + SNAPSHOT_N_BLOCKS - DIR_BLOCKS) % SNAPSHOT_N_BLOCKS
		} else {
			slot
		}
	}

	/// Reads the logical slot `slot` of the slot array.
	pub fn read_slot(&self, slot: usize) -> u32 {
		let pos = self.slot_position(slot);
		if pos < N_BLOCKS {
			self.i_block[pos]
		} else {
			self.i_block_extra[pos - N_BLOCKS]
		}
	}

	/// Writes `value` to the logical slot `slot` of the slot array.
	pub fn write_slot(&mut self, slot: usize, value: u32) {
		let pos = self.slot_position(slot);
		if pos < N_BLOCKS {
			self.i_block[pos] = value;
		} else {
			self.i_block_extra[pos - N_BLOCKS] = value;
		}
	}

	/// Returns the size of the file in bytes.
	pub fn get_size(&self) -> u64 {
		((self.i_size_high as u64) << 32) | (self.i_size as u64)
	}

	/// Sets the size of the file in bytes.
	pub fn set_size(&mut self, size: u64) {
		self.i_size = size as u32;
		self.i_size_high = (size >> 32) as u32;
	}

	/// Returns the number of content blocks charged to the inode.
	pub fn get_blocks(&self, sb: &Superblock) -> u64 {
		let blocks = ((self.i_blocks_high as u64) << 32) | (self.i_blocks as u64);
		if self.flags().contains(InodeFlags::HUGE_FILE) {
			blocks
		} else {
			let sector_per_blk = (sb.get_block_size() / SECTOR_SIZE) as u64;
			blocks / sector_per_blk
		}
	}

	/// Charges `count` more content blocks to the inode.
	pub fn add_blocks(&mut self, sb: &Superblock, count: u64) {
		self.set_raw_blocks(sb, self.get_blocks(sb) + count);
	}

	/// Discharges `count` content blocks from the inode.
	pub fn sub_blocks(&mut self, sb: &Superblock, count: u64) {
		self.set_raw_blocks(sb, self.get_blocks(sb).saturating_sub(count));
	}

	fn set_raw_blocks(&mut self, sb: &Superblock, blocks: u64) {
		let raw = if self.flags().contains(InodeFlags::HUGE_FILE) {
			blocks
		} else {
			blocks * (sb.get_block_size() / SECTOR_SIZE) as u64
		};
		self.i_blocks = raw as u32;
		self.i_blocks_high = (raw >> 32) as u16;
	}

	/// Tells whether the inode is a symlink storing its target inline in the
	/// slot array.
	pub fn is_fast_symlink(&self) -> bool {
		self.get_type() == FileType::Link && self.get_size() <= SYMLINK_INLINE_LIMIT as u64
	}

	/// Returns the block of the inode table and the byte offset inside it at
	/// which inode `ino` is stored.
	///
	/// `inode_table` is the starting block of the group's inode table.
	pub fn table_location(sb: &Superblock, inode_table: u32, ino: u32) -> FsResult<(u64, usize)> {
		if ino == 0 {
			return Err(FsError::Inconsistency("zero inumber"));
		}
		let blk_size = sb.get_block_size() as u64;
		let inode_size = sb.get_inode_size() as u64;
		let index = ((ino - 1) % sb.s_inodes_per_group) as u64;
		let blk = inode_table as u64 + index * inode_size / blk_size;
		let off = (index * inode_size % blk_size) as usize;
		Ok((blk, off))
	}
}

/// An inode together with its in-memory state.
///
/// One instance exists per inumber for a mounted filesystem; the instance is
/// shared by every task using the file.
pub struct Inode {
	/// The inumber.
	pub ino: u32,
	/// The on-disk content of the inode.
	disk: Mutex<DiskInode>,
	/// Serializes mutations of the inode's indirect tree.
	truncate_mutex: Mutex<()>,
	/// The last allocated position, for sequential write locality.
	last_alloc: Mutex<Option<LastAlloc>>,
	/// Tells whether the in-memory inode differs from the table block.
	dirty: AtomicBool,
	/// Tells whether the inode is linked on the orphan list.
	orphan: AtomicBool,
}

/// Position of the last block allocation performed on an inode.
#[derive(Clone, Copy, Debug)]
pub struct LastAlloc {
	/// The logical block of the last allocation.
	pub logical: u32,
	/// The physical block of the last allocation.
	pub physical: u32,
}

impl Inode {
	/// Creates the in-memory state for inode `ino` with content `disk`.
	pub fn new(ino: u32, disk: DiskInode) -> Self {
		Self {
			ino,
			disk: Mutex::new(disk),
			truncate_mutex: Mutex::new(()),
			last_alloc: Mutex::new(None),
			dirty: AtomicBool::new(false),
			orphan: AtomicBool::new(false),
		}
	}

	/// Locks and returns the on-disk content of the inode.
	pub fn disk(&self) -> MutexGuard<'_, DiskInode> {
		self.disk.lock()
	}

	/// Takes the lock serializing mutations of the inode's indirect tree.
	pub fn lock_tree(&self) -> MutexGuard<'_, ()> {
		self.truncate_mutex.lock()
	}

	/// Returns the last allocation position, if the last allocation mapped the
	/// logical block right before `logical`.
	pub fn alloc_hint(&self, logical: u32) -> Option<u32> {
		let last = self.last_alloc.lock();
		match *last {
			Some(l) if logical > 0 && l.logical == logical - 1 => Some(l.physical + 1),
			_ => None,
		}
	}

	/// Records the last allocation position.
	pub fn set_alloc_hint(&self, logical: u32, physical: u32) {
		*self.last_alloc.lock() = Some(LastAlloc {
			logical,
			physical,
		});
	}

	/// Marks the in-memory inode as differing from its table block.
	#[inline]
	pub fn mark_dirty(&self) {
		self.dirty.store(true, Relaxed);
	}

	/// Clears the dirty mark, returning its previous value.
	#[inline]
	pub fn take_dirty(&self) -> bool {
		self.dirty.swap(false, Relaxed)
	}

	/// Tells whether the inode is linked on the orphan list.
	#[inline]
	pub fn is_orphan(&self) -> bool {
		self.orphan.load(Relaxed)
	}

	/// Records whether the inode is linked on the orphan list.
	#[inline]
	pub fn set_orphan(&self, orphan: bool) {
		self.orphan.store(orphan, Relaxed);
	}
}
