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

//! The copy-on-write engine.
//!
//! Every metadata write and every overwrite of live file data funnels
//! through the hooks below before reaching the journal. When a snapshot is
//! active, the hooks make sure the pre-modification content of the affected
//! block is present in the snapshot image first: metadata blocks are copied
//! into a freshly allocated snapshot block, data blocks are moved under the
//! snapshot wholesale and the writer gets a replacement block.
//!
//! The engine re-enters itself: preserving a block mutates the snapshot
//! inode's own metadata, which funnels through the same hooks. The handle's
//! reentrance mark breaks the recursion, so everything the engine does on
//! the snapshot's behalf is exempt from further copies.

use crate::{
	block::{
		alloc::AllocMode,
		branch::get_branch,
		path::resolve,
	},
	cache::RcBuffer,
	err::{FsError, FsResult},
	inode::Inode,
	journal::Handle,
	MapFlags, MapMode, SnapFs,
};
use std::sync::Arc;

/// Reentrance mark on a handle, held for the duration of one copy-on-write
/// operation.
struct CowGuard<'h> {
	handle: &'h Handle,
	prev: bool,
}

impl<'h> CowGuard<'h> {
	fn new(handle: &'h Handle) -> Self {
		let prev = handle.set_cowing(true);
		Self {
			handle,
			prev,
		}
	}
}

impl Drop for CowGuard<'_> {
	fn drop(&mut self) {
		self.handle.set_cowing(self.prev);
	}
}

/// What a copy-on-write test does about a block needing preservation.
#[derive(Clone, Copy, Eq, PartialEq)]
enum CowMode {
	/// Copy the pre-image into the snapshot.
	Copy,
	/// Only report that a copy would be needed.
	Test,
}

impl SnapFs {
	/// Declares the intent to modify the metadata buffer `buf`.
	///
	/// The pre-image is preserved in the active snapshot if needed, then the
	/// journal is informed.
	pub fn get_write_access(&self, handle: &Handle, buf: &RcBuffer) -> FsResult<()> {
		self.test_and_cow(handle, buf, CowMode::Copy)?;
		self.journal().get_write_access(handle, buf)
	}

	/// Declares the freshly allocated metadata buffer `buf`.
	///
	/// A freshly allocated block can never need preservation: the allocator
	/// only hands out blocks that are free, and a block recorded in use at
	/// snapshot-take time is not. If the copy-on-write bitmap claims
	/// otherwise, the filesystem is corrupted.
	pub fn get_create_access(&self, handle: &Handle, buf: &RcBuffer) -> FsResult<()> {
		if self.test_and_cow(handle, buf, CowMode::Test)? {
			return Err(
				self.inconsistency("freshly allocated block still referenced by the snapshot")
			);
		}
		self.journal().get_create_access(handle, buf)
	}

	/// Declares the intent to modify the block bitmap of `group` and returns
	/// its buffer, with journal write access granted.
	///
	/// The first access under an active snapshot freezes the group's
	/// copy-on-write bitmap, then the live bitmap itself is preserved like
	/// any other metadata block.
	pub fn get_bitmap_access(&self, handle: &Handle, group: u32) -> FsResult<RcBuffer> {
		let buf = self.allocator().read_block_bitmap(group)?;
		self.test_and_cow(handle, &buf, CowMode::Copy)?;
		self.journal().get_write_access(handle, &buf)?;
		Ok(buf)
	}

	/// Declares the intent to modify `inode`'s entry in the inode table.
	pub fn inode_write_access(&self, handle: &Handle, inode: &Inode) -> FsResult<()> {
		let (buf, _) = self.inode_table_buffer(inode.ino)?;
		self.get_write_access(handle, &buf)
	}

	/// Runs the copy-on-write test, and possibly the copy, for `buf`.
	///
	/// Returns whether the block needs (or needed) preservation. No-op
	/// without an active snapshot, under a reentering copy-on-write
	/// operation, and for a buffer already copied in the running transaction.
	fn test_and_cow(&self, handle: &Handle, buf: &RcBuffer, mode: CowMode) -> FsResult<bool> {
		if handle.is_aborted() {
			return Err(FsError::Aborted);
		}
		if handle.is_cowing() {
			return Ok(false);
		}
		let Some(snap) = self.active_snapshot() else {
			return Ok(false);
		};
		// A block copied earlier in this very transaction needs no second
		// copy; the tag is only meaningful while the buffer is attached to
		// the running transaction
		if mode == CowMode::Copy
			&& buf.journal_tid() == handle.tid()
			&& buf.cow_tid() == handle.tid()
		{
			return Ok(false);
		}
		let _guard = CowGuard::new(handle);
		let res = self.test_and_cow_impl(handle, &snap, buf, mode);
		if res == Err(FsError::Io) {
			self.fs_error("I/O error while preserving a block in the snapshot");
		}
		res
	}

	fn test_and_cow_impl(
		&self,
		handle: &Handle,
		snap: &Arc<Inode>,
		buf: &RcBuffer,
		mode: CowMode,
	) -> FsResult<bool> {
		let blk = buf.block() as u32;
		if !self.test_cow_bit(handle, snap, blk)? {
			// Free at snapshot-take time: later writes are of no concern
			buf.set_cow_tid(handle.tid());
			return Ok(false);
		}
		if mode == CowMode::Test {
			return Ok(true);
		}
		let mapping = self.map_block(snap, blk, 1, MapMode::Lookup)?;
		if mapping.flags.contains(MapFlags::MAPPED) {
			// Another writer already preserved it
			buf.set_cow_tid(handle.tid());
			return Ok(true);
		}
		self.cow_copy(handle, snap, buf, blk)?;
		buf.set_cow_tid(handle.tid());
		Ok(true)
	}

	/// Copies the content of `src` into a fresh block of the snapshot image,
	/// at the logical offset matching the source's physical address.
	fn cow_copy(&self, handle: &Handle, snap: &Arc<Inode>, src: &RcBuffer, blk: u32) -> FsResult<()> {
		let mapping = self.map_block(
			snap,
			blk,
			1,
			MapMode::Create {
				handle,
				mode: AllocMode::COW,
			},
		)?;
		if !mapping.flags.contains(MapFlags::NEW) {
			return Ok(());
		}
		// The mapping is already visible; the pending marker set at
		// allocation keeps readers off the copy until it is filled
		let copy = self
			.cache()
			.peek(mapping.phys as u64)
			.expect("fresh snapshot block without a buffer");
		let res = self.journal().get_create_access(handle, &copy).and_then(|_| {
			{
				let src_data = src.data();
				let mut dst = copy.data_mut();
				dst.copy_from_slice(&src_data);
			}
			copy.mark_dirty();
			self.journal().dirty_metadata(handle, &copy)
		});
		if let Err(e) = res {
			copy.cancel_pending_cow();
			return Err(e);
		}
		log::trace!("snapfs: block {blk} preserved at snapshot block {}", mapping.phys);
		Ok(())
	}

	/// Declares the intent to overwrite the live data block `phys`, mapped at
	/// `iblock` of the regular file `inode`.
	///
	/// If the active snapshot needs the block's content, the block itself is
	/// moved under the snapshot and a replacement is allocated for the
	/// writer. Returns the replacement block, or `None` when the write may
	/// proceed in place.
	///
	/// `partial` tells whether the upcoming write covers only part of the
	/// block, in which case the old content is carried over into the
	/// replacement.
	pub fn get_move_access(
		&self,
		handle: &Handle,
		inode: &Arc<Inode>,
		iblock: u32,
		phys: u32,
		partial: bool,
	) -> FsResult<Option<u32>> {
		if handle.is_aborted() {
			return Err(FsError::Aborted);
		}
		if handle.is_cowing() {
			return Ok(None);
		}
		let Some(snap) = self.active_snapshot() else {
			return Ok(None);
		};
		self.check_writable()?;
		// Snapshot-side work runs under the reentrance mark; the file's own
		// metadata updates below run outside of it, so their pre-images are
		// preserved like any other write
		{
			let _guard = CowGuard::new(handle);
			if !self.test_cow_bit(handle, &snap, phys)? {
				return Ok(None);
			}
			if self
				.map_block(&snap, phys, 1, MapMode::Lookup)?
				.flags
				.contains(MapFlags::MAPPED)
			{
				return Ok(None);
			}
			// The snapshot adopts the block as it sits on disk; no copy is
			// made
			self.map_block(
				&snap,
				phys,
				1,
				MapMode::Create {
					handle,
					mode: AllocMode::MOVE,
				},
			)?;
		}
		self.allocator().quota_transfer(inode.ino, snap.ino, 1)?;
		let res = self.swap_data_block(handle, inode, iblock, phys, partial);
		match res {
			Ok(replacement) => {
				log::trace!(
					"snapfs: block {phys} of inode {} moved to the snapshot, writer continues on {replacement}",
					inode.ino
				);
				Ok(Some(replacement))
			}
			Err(e) => {
				// The pre-image stays preserved; the writer will retry the
				// move of whatever remains
				if let Err(qe) = self.allocator().quota_transfer(snap.ino, inode.ino, 1) {
					log::error!("snapfs: quota refund after failed move: {qe}");
				}
				Err(e)
			}
		}
	}

	/// Allocates a replacement for the moved block `old` and splices it into
	/// `inode` at `iblock`.
	fn swap_data_block(
		&self,
		handle: &Handle,
		inode: &Arc<Inode>,
		iblock: u32,
		old: u32,
		partial: bool,
	) -> FsResult<u32> {
		let (replacement, _) = self
			.allocator()
			.new_blocks(self, handle, inode.ino, old, 1)?;
		let nbuf = self.cache().get_new(replacement as u64)?;
		if partial {
			let obuf = self.cache().get(old as u64)?;
			let odata = obuf.data();
			nbuf.data_mut().copy_from_slice(&odata);
		}
		nbuf.mark_dirty();
		let res = self.replace_leaf(handle, inode, iblock, old, replacement);
		if let Err(e) = res {
			self.cache().forget(replacement as u64);
			if let Err(fe) =
				self.allocator()
					.free_blocks(self, handle, inode.ino, replacement, 1)
			{
				log::error!("snapfs: failed to roll back replacement block {replacement}: {fe}");
			}
			return Err(e);
		}
		Ok(replacement)
	}

	/// Rewrites the leaf pointer of `iblock` from `old` to `new` in `inode`'s
	/// tree.
	fn replace_leaf(
		&self,
		handle: &Handle,
		inode: &Arc<Inode>,
		iblock: u32,
		old: u32,
		new: u32,
	) -> FsResult<()> {
		let _tree = inode.lock_tree();
		let snapshot = inode.disk().is_snapshot();
		let path = resolve(iblock, self.sb().get_entries_per_block_log(), snapshot)?;
		let branch = get_branch(self, inode, &path)?;
		if !branch.is_complete() || branch.leaf() != old {
			// The mapping changed before the lock was taken
			return Err(FsError::Conflict);
		}
		let point = branch.steps.last().unwrap();
		match &point.buf {
			Some(buf) => {
				self.get_write_access(handle, buf)?;
				buf.write_slot(point.slot, new);
				buf.mark_dirty();
				self.journal().dirty_metadata(handle, buf)?;
			}
			None => {
				self.inode_write_access(handle, inode)?;
				inode.disk().write_slot(point.slot, new);
				inode.mark_dirty();
			}
		}
		let disk = *inode.disk();
		self.flush_inode(handle, inode, &disk)
	}

	/// Declares that the block `blk`, charged to `owner`, is about to return
	/// to the allocator.
	///
	/// If the active snapshot needs its content, the snapshot inherits the
	/// block directly and the function returns `true`: the caller must not
	/// free it.
	pub fn get_delete_access(&self, handle: &Handle, owner: u32, blk: u32) -> FsResult<bool> {
		if handle.is_aborted() {
			return Err(FsError::Aborted);
		}
		if handle.is_cowing() {
			return Ok(false);
		}
		let Some(snap) = self.active_snapshot() else {
			return Ok(false);
		};
		let _guard = CowGuard::new(handle);
		if !self.test_cow_bit(handle, &snap, blk)? {
			return Ok(false);
		}
		if self
			.map_block(&snap, blk, 1, MapMode::Lookup)?
			.flags
			.contains(MapFlags::MAPPED)
		{
			return Ok(false);
		}
		self.map_block(
			&snap,
			blk,
			1,
			MapMode::Create {
				handle,
				mode: AllocMode::MOVE,
			},
		)?;
		self.allocator().quota_transfer(owner, snap.ino, 1)?;
		log::trace!("snapfs: freed block {blk} inherited by the snapshot");
		Ok(true)
	}
}
