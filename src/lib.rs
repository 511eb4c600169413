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

//! Snapfs is the core of a journaled, block-addressed filesystem with
//! copy-on-write snapshots.
//!
//! The filesystem divides the storage device into several substructures:
//! - Block Group: a fixed-size run of consecutive blocks with its own bitmaps
//!   and inode table
//! - Block: stored inside of block groups
//! - INode: represents a file in the filesystem
//!
//! The access to an INode's data is divided into several parts, each
//! overflowing on the next when full:
//! - Direct Block Pointers: each inode has 12 of them
//! - Singly Indirect Block Pointer: a pointer to a block dedicated to storing
//!   a list of more blocks to store the inode's data. The number of blocks it
//!   can store depends on the size of a block
//! - Doubly Indirect Block Pointer: a pointer to a block storing pointers to
//!   Singly Indirect Block Pointers
//! - Triply Indirect Block Pointer: a pointer to a block storing pointers to
//!   Doubly Indirect Block Pointers
//!
//! A snapshot is an inode mapping, at each logical offset `b`, the snapshot's
//! private copy of the device's physical block `b`. While a snapshot is
//! active, every write is preceded by a hook of the copy-on-write engine
//! which preserves the pre-modification content in the snapshot image, so the
//! whole device can later be read back as it was when the snapshot was taken.
//!
//! This crate is a library: the write-ahead journal and the block allocator
//! are consumed through the [`Journal`] and [`Allocator`] traits, and the
//! page-cache or VFS layer above drives the core through
//! [`SnapFs::map_block`], [`SnapFs::truncate`] and the access hooks.

pub mod alloc;
pub mod bgd;
pub mod block;
pub mod cache;
pub mod dev;
pub mod err;
pub mod inode;
pub mod journal;
pub mod sb;
pub mod snapshot;
pub mod truncate;

pub use alloc::Allocator;
pub use block::{alloc::AllocMode, MapFlags, MapMode, Mapping};
pub use cache::{BufState, Buffer, BufferCache, RcBuffer};
pub use dev::BlockDevice;
pub use err::{FsError, FsResult};
pub use journal::{Handle, Journal, MAX_TRANS_DATA};
pub use sb::MountFlags;

use crate::{
	bgd::GroupInfo,
	inode::{DiskInode, Inode, InodeFlags},
	sb::{Superblock, ERR_ACTION_PANIC, ERR_ACTION_READ_ONLY, FS_STATE_ERROR},
};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, Ordering::Relaxed},
		Arc,
	},
	time::{SystemTime, UNIX_EPOCH},
};

/// Returns the current timestamp in seconds.
pub(crate) fn now() -> u32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as u32)
		.unwrap_or(0)
}

/// A mounted filesystem instance.
pub struct SnapFs {
	/// The buffer cache over the underlying device.
	cache: Arc<BufferCache>,
	/// The write-ahead journal service.
	journal: Arc<dyn Journal>,
	/// The block and inode allocation service.
	alloc: Arc<dyn Allocator>,
	/// The in-memory superblock.
	sb: RwLock<Superblock>,
	/// Volatile per-group state.
	groups: Box<[GroupInfo]>,
	/// The inodes currently in use, by inumber.
	inodes: Mutex<HashMap<u32, Arc<Inode>>>,
	/// Serializes snapshot lifecycle operations. Never taken while holding an
	/// inode's tree lock.
	pub(crate) snapshot_mutex: Mutex<()>,
	/// The active snapshot, if any.
	pub(crate) active: RwLock<Option<Arc<Inode>>>,
	/// Set when an inconsistency was detected; further writes are refused.
	errored: AtomicBool,
	/// Mount options.
	mount_flags: MountFlags,
}

impl SnapFs {
	/// Mounts the filesystem found on the device behind `cache`.
	///
	/// Arguments:
	/// - `cache` is the buffer cache over the device; the journal must have
	///   been replayed already
	/// - `journal` is the write-ahead journal service
	/// - `alloc` is the block and inode allocation service
	/// - `mount_flags` are the mount options
	pub fn mount(
		cache: Arc<BufferCache>,
		journal: Arc<dyn Journal>,
		alloc: Arc<dyn Allocator>,
		mut mount_flags: MountFlags,
	) -> FsResult<Arc<Self>> {
		let blk_size = cache.block_size();
		let (sb_blk, sb_off) = Superblock::location(blk_size);
		let sb_buf = cache.get(sb_blk)?;
		let sb: Superblock = {
			let data = sb_buf.data();
			bytemuck::pod_read_unaligned(&data[sb_off..sb_off + size_of::<Superblock>()])
		};
		sb.validate(cache.block_count())?;
		if sb.get_block_size() != blk_size {
			return Err(FsError::Inconsistency("device and superblock block sizes differ"));
		}
		if sb.get_inode_size() < size_of::<DiskInode>() {
			return Err(FsError::Inconsistency("inode size too small"));
		}
		if sb.s_state & FS_STATE_ERROR != 0 {
			match sb.s_errors {
				ERR_ACTION_READ_ONLY => {
					log::warn!("snapfs: filesystem has errors, mounting read-only");
					mount_flags |= MountFlags::RDONLY;
				}
				ERR_ACTION_PANIC => {
					return Err(FsError::Inconsistency("filesystem has errors"));
				}
				_ => log::warn!("snapfs: filesystem has errors, continuing anyway"),
			}
		}
		let groups: Box<[GroupInfo]> = (0..sb.get_block_groups_count())
			.map(|_| GroupInfo::default())
			.collect();
		let fs = Arc::new(Self {
			cache,
			journal,
			alloc,
			sb: RwLock::new(sb),
			groups,
			inodes: Mutex::new(HashMap::new()),
			snapshot_mutex: Mutex::new(()),
			active: RwLock::new(None),
			errored: AtomicBool::new(false),
			mount_flags,
		});
		// Bring back the active snapshot
		let snap_ino = fs.sb().s_snapshot_inum;
		if snap_ino != 0 {
			let inode = fs.get_inode(snap_ino)?;
			if !inode
				.disk()
				.flags()
				.contains(InodeFlags::SNAPFILE | InodeFlags::SNAPFILE_ACTIVE)
			{
				return Err(FsError::Inconsistency("active snapshot is not a snapshot file"));
			}
			*fs.active.write() = Some(inode);
		}
		// Complete interrupted truncates and deletions
		if !fs.mount_flags.contains(MountFlags::RDONLY) {
			fs.replay_orphans()?;
		}
		{
			let mut sb = fs.sb_mut();
			sb.s_mnt_count = sb.s_mnt_count.wrapping_add(1);
			sb.s_mtime = now();
		}
		fs.write_sb(&sb_buf);
		log::info!(
			"snapfs: mounted, {} blocks of {blk_size} bytes in {} groups",
			fs.sb().s_blocks_count,
			fs.groups.len()
		);
		Ok(fs)
	}

	/// Returns the buffer cache.
	#[inline]
	pub fn cache(&self) -> &BufferCache {
		&self.cache
	}

	/// Returns the journal service.
	#[inline]
	pub fn journal(&self) -> &dyn Journal {
		&*self.journal
	}

	/// Returns the allocation service.
	#[inline]
	pub fn allocator(&self) -> &dyn Allocator {
		&*self.alloc
	}

	/// Returns the in-memory superblock.
	pub fn sb(&self) -> RwLockReadGuard<'_, Superblock> {
		self.sb.read()
	}

	/// Returns the in-memory superblock, for modification.
	///
	/// The caller is responsible for flushing it afterwards.
	pub(crate) fn sb_mut(&self) -> RwLockWriteGuard<'_, Superblock> {
		self.sb.write()
	}

	/// Returns the volatile state of the block group `group`.
	pub fn group(&self, group: u32) -> &GroupInfo {
		&self.groups[group as usize]
	}

	/// Resets every group's cached copy-on-write bitmap.
	pub(crate) fn clear_cow_bitmaps(&self) {
		for group in self.groups.iter() {
			group.clear_cow_bitmap();
		}
	}

	/// Returns the buffer holding the superblock.
	pub(crate) fn sb_buffer(&self) -> FsResult<RcBuffer> {
		let (blk, _) = Superblock::location(self.cache.block_size());
		self.cache.get(blk)
	}

	/// Copies the in-memory superblock into its buffer.
	fn write_sb(&self, buf: &RcBuffer) {
		let (_, off) = Superblock::location(self.cache.block_size());
		let sb = self.sb();
		let bytes = bytemuck::bytes_of(&*sb);
		let mut data = buf.data_mut();
		data[off..off + bytes.len()].copy_from_slice(bytes);
		drop(data);
		buf.mark_dirty();
	}

	/// Writes the in-memory superblock through the journal.
	///
	/// The caller must have obtained write access on `buf` beforehand.
	pub(crate) fn flush_sb(&self, handle: &Handle, buf: &RcBuffer) -> FsResult<()> {
		self.write_sb(buf);
		self.journal.dirty_metadata(handle, buf)
	}

	/// Returns the buffer of the inode table block holding inode `ino`, and
	/// the offset of the inode inside it.
	pub(crate) fn inode_table_buffer(&self, ino: u32) -> FsResult<(RcBuffer, usize)> {
		let (valid, group) = {
			let sb = self.sb();
			(
				ino != 0 && ino <= sb.s_inodes_count,
				ino.saturating_sub(1) / sb.s_inodes_per_group,
			)
		};
		if !valid {
			return Err(self.inconsistency("inumber out of range"));
		}
		let bgd = self.alloc.group_desc(group)?;
		let (blk, off) = DiskInode::table_location(&self.sb(), bgd.bg_inode_table, ino)?;
		Ok((self.cache.get(blk)?, off))
	}

	/// Returns the in-memory inode `ino`, reading it from the inode table if
	/// it is not in use yet.
	pub fn get_inode(&self, ino: u32) -> FsResult<Arc<Inode>> {
		if let Some(inode) = self.inodes.lock().get(&ino) {
			return Ok(inode.clone());
		}
		let (buf, off) = self.inode_table_buffer(ino)?;
		let disk: DiskInode = {
			let data = buf.data();
			bytemuck::pod_read_unaligned(&data[off..off + size_of::<DiskInode>()])
		};
		let mut inodes = self.inodes.lock();
		// Another task may have loaded it while the table block was read
		let inode = inodes
			.entry(ino)
			.or_insert_with(|| Arc::new(Inode::new(ino, disk)));
		Ok(inode.clone())
	}

	/// Installs a freshly created inode, replacing any stale in-memory state
	/// for the inumber.
	pub fn install_inode(&self, ino: u32, disk: DiskInode) -> Arc<Inode> {
		let inode = Arc::new(Inode::new(ino, disk));
		self.inodes.lock().insert(ino, inode.clone());
		inode
	}

	/// Forgets the in-memory state of inode `ino`.
	pub(crate) fn drop_inode(&self, ino: u32) {
		self.inodes.lock().remove(&ino);
	}

	/// Writes the inode content `disk` to its slot in the inode table,
	/// through the journal.
	///
	/// This is how the layer above persists size, link count and timestamp
	/// updates.
	pub fn flush_inode(&self, handle: &Handle, inode: &Inode, disk: &DiskInode) -> FsResult<()> {
		let (buf, off) = self.inode_table_buffer(inode.ino)?;
		self.get_write_access(handle, &buf)?;
		{
			let bytes = bytemuck::bytes_of(disk);
			let mut data = buf.data_mut();
			data[off..off + bytes.len()].copy_from_slice(bytes);
		}
		buf.mark_dirty();
		inode.take_dirty();
		self.journal.dirty_metadata(handle, &buf)
	}

	/// Fails unless the filesystem accepts writes.
	pub fn check_writable(&self) -> FsResult<()> {
		if self.errored.load(Relaxed) {
			return Err(FsError::Inconsistency("filesystem has errors"));
		}
		if self.mount_flags.contains(MountFlags::RDONLY) {
			return Err(FsError::Permission);
		}
		Ok(())
	}

	/// Records an inconsistency: the error is logged and remembered in the
	/// superblock, and every further write is refused.
	pub fn fs_error(&self, msg: &'static str) {
		log::error!("snapfs: filesystem error: {msg}");
		self.errored.store(true, Relaxed);
		{
			let mut sb = self.sb_mut();
			sb.s_state |= FS_STATE_ERROR;
			let bytes = msg.as_bytes();
			let len = bytes.len().min(sb.s_error_msg.len());
			sb.s_error_msg = [0; 64];
			sb.s_error_msg[..len].copy_from_slice(&bytes[..len]);
		}
		// Best effort: the record should survive even if the journal is gone
		if let Ok(buf) = self.sb_buffer() {
			self.write_sb(&buf);
			let _ = self.cache.sync_buffer(&buf);
		}
	}

	/// Records an inconsistency and returns the matching error.
	pub(crate) fn inconsistency(&self, msg: &'static str) -> FsError {
		self.fs_error(msg);
		FsError::Inconsistency(msg)
	}

	/// Commits the journal and writes every dirty buffer back to the device.
	pub fn sync_fs(&self) -> FsResult<()> {
		self.journal.force_commit()?;
		self.cache.sync()
	}
}
