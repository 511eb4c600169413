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

//! Snapshots.
//!
//! A snapshot is a regular inode whose logical offset `b` maps the snapshot's
//! private copy of the device's physical block `b`, and nothing else. At most
//! one snapshot is active at a time; the copy-on-write engine fills the
//! active snapshot's image as the live filesystem diverges from it.
//!
//! Snapshots are chained on an on-disk list headed in the superblock, newest
//! first. Reading a block through a snapshot returns its private copy when it
//! has one, cascades along the list otherwise, and falls back to the live
//! device block when no snapshot preserved it.

pub mod bitmap;
pub mod cow;

use crate::{
	err::{FsError, FsResult},
	inode::{DiskInode, Inode, InodeFlags, INODE_TYPE_REGULAR},
	journal::{Handle, MAX_TRANS_DATA},
	MapFlags, MapMode, SnapFs,
};
use bytemuck::Zeroable;
use std::sync::Arc;

impl SnapFs {
	/// Returns the active snapshot, if any.
	pub fn active_snapshot(&self) -> Option<Arc<Inode>> {
		self.active.read().clone()
	}

	/// Takes a new snapshot and returns its inumber.
	///
	/// The snapshot records the state of the filesystem as of the commit this
	/// function forces. It is linked at the head of the snapshot list but not
	/// activated; preservation starts once [`SnapFs::snapshot_activate`] is
	/// called.
	pub fn snapshot_take(&self) -> FsResult<u32> {
		self.check_writable()?;
		let _lock = self.snapshot_mutex.lock();
		let handle = self.journal().start(MAX_TRANS_DATA)?;
		let ino = self.allocator().new_inode(self, &handle)?;
		let (size, list_head, id) = {
			let sb = self.sb();
			(
				sb.s_blocks_count as u64 * sb.get_block_size() as u64,
				sb.s_snapshot_list,
				sb.s_snapshot_id + 1,
			)
		};
		let mut disk = DiskInode::zeroed();
		disk.i_mode = INODE_TYPE_REGULAR | 0o600;
		disk.i_flags =
			(InodeFlags::SNAPFILE | InodeFlags::SNAPFILE_ON_LIST | InodeFlags::HUGE_FILE).bits();
		disk.i_links_count = 1;
		// The image spans the whole device address space
		disk.set_size(size);
		let now = crate::now();
		disk.i_atime = now;
		disk.i_ctime = now;
		disk.i_mtime = now;
		disk.i_generation = id;
		disk.i_next_snapshot = list_head;
		let inode = self.install_inode(ino, disk);
		inode.mark_dirty();
		self.flush_inode(&handle, &inode, &disk)?;
		let sb_buf = self.sb_buffer()?;
		self.get_write_access(&handle, &sb_buf)?;
		{
			let mut sb = self.sb_mut();
			sb.s_snapshot_list = ino;
			sb.s_snapshot_id = id;
		}
		self.flush_sb(&handle, &sb_buf)?;
		self.journal().stop(&handle)?;
		// The snapshot freezes at this commit
		self.journal().force_commit()?;
		log::info!("snapfs: snapshot {id} taken as inode {ino}");
		Ok(ino)
	}

	/// Makes the snapshot `ino` the active one, replacing the current active
	/// snapshot if any.
	pub fn snapshot_activate(&self, ino: u32) -> FsResult<()> {
		self.check_writable()?;
		let _lock = self.snapshot_mutex.lock();
		let inode = self.get_inode(ino)?;
		{
			let flags = inode.disk().flags();
			if !flags.contains(InodeFlags::SNAPFILE | InodeFlags::SNAPFILE_ON_LIST) {
				return Err(FsError::Permission);
			}
			if flags.contains(InodeFlags::SNAPFILE_ACTIVE) {
				return Ok(());
			}
		}
		let handle = self.journal().start(MAX_TRANS_DATA)?;
		if let Some(prev) = self.active_snapshot() {
			self.clear_active(&handle, &prev)?;
		}
		let disk = {
			let mut disk = inode.disk();
			disk.i_flags |= InodeFlags::SNAPFILE_ACTIVE.bits();
			*disk
		};
		inode.mark_dirty();
		self.flush_inode(&handle, &inode, &disk)?;
		let sb_buf = self.sb_buffer()?;
		self.get_write_access(&handle, &sb_buf)?;
		self.sb_mut().s_snapshot_inum = ino;
		self.flush_sb(&handle, &sb_buf)?;
		self.journal().stop(&handle)?;
		// The frozen bitmaps of the previous active snapshot are meaningless
		// for this one
		self.clear_cow_bitmaps();
		*self.active.write() = Some(inode);
		log::info!("snapfs: snapshot inode {ino} activated");
		Ok(())
	}

	/// Deactivates the active snapshot, if any. Preservation stops.
	pub fn snapshot_deactivate(&self) -> FsResult<()> {
		self.check_writable()?;
		let _lock = self.snapshot_mutex.lock();
		let Some(inode) = self.active_snapshot() else {
			return Ok(());
		};
		let handle = self.journal().start(MAX_TRANS_DATA)?;
		self.clear_active(&handle, &inode)?;
		let sb_buf = self.sb_buffer()?;
		self.get_write_access(&handle, &sb_buf)?;
		self.sb_mut().s_snapshot_inum = 0;
		self.flush_sb(&handle, &sb_buf)?;
		self.journal().stop(&handle)?;
		*self.active.write() = None;
		self.clear_cow_bitmaps();
		log::info!("snapfs: snapshot inode {} deactivated", inode.ino);
		Ok(())
	}

	fn clear_active(&self, handle: &Handle, inode: &Arc<Inode>) -> FsResult<()> {
		let disk = {
			let mut disk = inode.disk();
			disk.i_flags &= !InodeFlags::SNAPFILE_ACTIVE.bits();
			*disk
		};
		inode.mark_dirty();
		self.flush_inode(handle, inode, &disk)
	}

	/// Removes the snapshot `ino` from the snapshot list and frees its image.
	///
	/// The active snapshot cannot be deleted.
	pub fn snapshot_delete(&self, ino: u32) -> FsResult<()> {
		self.check_writable()?;
		let _lock = self.snapshot_mutex.lock();
		if self.active_snapshot().is_some_and(|a| a.ino == ino) {
			return Err(FsError::Permission);
		}
		let inode = self.get_inode(ino)?;
		{
			let flags = inode.disk().flags();
			if !flags.contains(InodeFlags::SNAPFILE | InodeFlags::SNAPFILE_ON_LIST) {
				return Err(FsError::Permission);
			}
		}
		// Unlink from the on-disk list
		let handle = self.journal().start(MAX_TRANS_DATA)?;
		let next = inode.disk().i_next_snapshot;
		let head = self.sb().s_snapshot_list;
		if head == ino {
			let sb_buf = self.sb_buffer()?;
			self.get_write_access(&handle, &sb_buf)?;
			self.sb_mut().s_snapshot_list = next;
			self.flush_sb(&handle, &sb_buf)?;
		} else {
			let mut cur = head;
			while cur != 0 {
				let prev = self.get_inode(cur)?;
				let prev_next = prev.disk().i_next_snapshot;
				if prev_next == ino {
					let disk = {
						let mut disk = prev.disk();
						disk.i_next_snapshot = next;
						*disk
					};
					prev.mark_dirty();
					self.flush_inode(&handle, &prev, &disk)?;
					break;
				}
				cur = prev_next;
			}
			if cur == 0 {
				self.journal().stop(&handle)?;
				return Err(self.inconsistency("snapshot absent from the snapshot list"));
			}
		}
		let disk = {
			let mut disk = inode.disk();
			disk.i_flags &=
				!(InodeFlags::SNAPFILE_ON_LIST | InodeFlags::SNAPFILE_ACTIVE).bits();
			disk.i_next_snapshot = 0;
			disk.i_links_count = 0;
			*disk
		};
		inode.mark_dirty();
		self.flush_inode(&handle, &inode, &disk)?;
		self.journal().stop(&handle)?;
		// Free the image
		self.delete_inode(&inode)?;
		log::info!("snapfs: snapshot inode {ino} deleted");
		Ok(())
	}

	/// Reads the device block `phys` as it was when the snapshot `snap_ino`
	/// was taken.
	///
	/// The snapshot's private copy is returned when one exists; otherwise the
	/// read cascades along the snapshot list, and finally to the live device
	/// block, which is unchanged since the take if no snapshot preserved it.
	pub fn snapshot_read_block(&self, snap_ino: u32, phys: u32) -> FsResult<Vec<u8>> {
		if phys >= self.sb().s_blocks_count {
			return Err(FsError::OutOfRange);
		}
		let mut cur = self.get_inode(snap_ino)?;
		loop {
			if !cur.disk().flags().contains(InodeFlags::SNAPFILE) {
				return Err(FsError::Permission);
			}
			let mapping = self.map_block(&cur, phys, 1, MapMode::Lookup)?;
			if mapping.flags.contains(MapFlags::MAPPED) {
				return self.read_preserved(mapping.phys);
			}
			let next = cur.disk().i_next_snapshot;
			if next == 0 {
				break;
			}
			cur = self.get_inode(next)?;
		}
		Ok(self.cache().get(phys as u64)?.data().to_vec())
	}

	/// Reads a preserved block, synchronizing with an in-flight copy.
	fn read_preserved(&self, blk: u32) -> FsResult<Vec<u8>> {
		if let Some(buf) = self.cache().peek(blk as u64) {
			if buf.is_pending_cow() {
				buf.wait_pending_cow();
			}
			if buf.is_uptodate() {
				// The copy is in memory, no need for a device round-trip
				return Ok(buf.data().to_vec());
			}
			log::error!("snapfs: snapshot block {blk} is mapped but was never filled");
			return Err(FsError::Io);
		}
		Ok(self.cache().get(blk as u64)?.data().to_vec())
	}
}
