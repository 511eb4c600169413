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

//! Truncation of an inode's indirect tree.
//!
//! Freeing a large tree can exceed any reasonable transaction budget, so the
//! work is spread over several sub-transactions. Between two of them, the
//! on-disk tree is always reachable and acyclic: a parent slot is zeroed in
//! the same sub-transaction that frees the block it pointed to, and children
//! are freed before their parent. The inode sits on the orphan list for the
//! whole operation, so an interrupted truncate is completed on the next
//! mount.

use crate::{
	block::path::{resolve, MAX_DEPTH},
	cache::RcBuffer,
	err::{FsError, FsResult},
	inode::{FileType, Inode, InodeFlags, DIND_SLOT, DIR_BLOCKS, IND_SLOT, NTIND, TIND_SLOT},
	journal::{Handle, MAX_TRANS_DATA},
	MapMode, SnapFs,
};
use parking_lot::MutexGuard;
use std::sync::Arc;

/// The credits a single freeing step may need: the parent slot, the inode
/// table block, the superblock, bitmap blocks and the copies the snapshot
/// engine may take of each.
const STEP_CREDITS: u32 = 16;

/// The holder of the slots being freed at one level of the walk.
enum Holder<'a> {
	/// The inode's slot array.
	Root,
	/// An indirect block.
	Buf(&'a RcBuffer),
}

/// The state of one truncate operation.
///
/// The inode's tree lock is held for the whole operation, except across
/// journal restarts: the lock is dropped there so that writers blocked on it
/// can observe the intermediate state, then reacquired.
struct Truncator<'a> {
	fs: &'a SnapFs,
	inode: &'a Inode,
	handle: Arc<Handle>,
	guard: Option<MutexGuard<'a, ()>>,
	/// The credit budget of each sub-transaction.
	budget: u32,
	/// Blocks discharged from the inode since the last flush.
	freed: u64,
}

impl<'a> Truncator<'a> {
	/// Makes sure at least `needed` buffer credits remain, committing the
	/// current sub-transaction and opening the next one if they do not.
	fn ensure_credits(&mut self, needed: u32) -> FsResult<()> {
		if self.handle.is_aborted() {
			return Err(FsError::Aborted);
		}
		if self.handle.buffer_credits() >= needed {
			return Ok(());
		}
		let want = self.budget.max(needed);
		if self.fs.journal().extend(&self.handle, want).is_ok()
			&& self.handle.buffer_credits() >= needed
		{
			return Ok(());
		}
		// Restart: everything freed so far must land with the inode state
		// describing it
		self.flush_inode()?;
		self.guard = None;
		self.fs.journal().restart(&self.handle, want)?;
		self.guard = Some(self.inode.lock_tree());
		Ok(())
	}

	/// Writes the in-memory inode, with the accumulated discharge, to its
	/// table block.
	fn flush_inode(&mut self) -> FsResult<()> {
		let disk = {
			let mut disk = self.inode.disk();
			let sb = self.fs.sb();
			disk.sub_blocks(&sb, self.freed);
			self.freed = 0;
			*disk
		};
		self.inode.mark_dirty();
		self.fs.flush_inode(&self.handle, self.inode, &disk)
	}

	fn read_slot(&self, holder: &Holder<'_>, slot: usize) -> u32 {
		match holder {
			Holder::Root => self.inode.disk().read_slot(slot),
			Holder::Buf(buf) => buf.read_slot(slot),
		}
	}

	/// Zeroes `slots` in `holder` under journal write access.
	fn zero_slots(&mut self, holder: &Holder<'_>, slots: &[usize]) -> FsResult<()> {
		match holder {
			Holder::Root => {
				self.fs.inode_write_access(&self.handle, self.inode)?;
				let mut disk = self.inode.disk();
				for slot in slots {
					disk.write_slot(*slot, 0);
				}
				self.inode.mark_dirty();
			}
			Holder::Buf(buf) => {
				self.fs.get_write_access(&self.handle, buf)?;
				for slot in slots {
					buf.write_slot(*slot, 0);
				}
				buf.mark_dirty();
				self.fs.journal().dirty_metadata(&self.handle, buf)?;
			}
		}
		Ok(())
	}

	/// Disposes of a freed block: the active snapshot inherits it when it
	/// needs its content, otherwise it returns to the allocator.
	fn dispose(&mut self, first: u32, count: u32) -> FsResult<()> {
		let mut run_start = first;
		let mut run_len = 0;
		for blk in first..first + count {
			let moved = self
				.fs
				.get_delete_access(&self.handle, self.inode.ino, blk)?;
			if moved {
				if run_len > 0 {
					self.fs.allocator().free_blocks(
						self.fs,
						&self.handle,
						self.inode.ino,
						run_start,
						run_len,
					)?;
				}
				run_start = blk + 1;
				run_len = 0;
			} else {
				run_len += 1;
			}
		}
		if run_len > 0 {
			self.fs.allocator().free_blocks(
				self.fs,
				&self.handle,
				self.inode.ino,
				run_start,
				run_len,
			)?;
		}
		self.freed += count as u64;
		Ok(())
	}

	/// Frees the data blocks referenced by `slots` of `holder`, batching
	/// contiguous runs into single allocator calls.
	fn free_data(&mut self, holder: &Holder<'_>, slots: std::ops::Range<usize>) -> FsResult<()> {
		let values: Vec<(usize, u32)> = slots
			.map(|s| (s, self.read_slot(holder, s)))
			.filter(|(_, v)| *v != 0)
			.collect();
		if values.is_empty() {
			return Ok(());
		}
		self.ensure_credits(STEP_CREDITS)?;
		// Detach the leaves first, then return the blocks
		let slots: Vec<usize> = values.iter().map(|(s, _)| *s).collect();
		self.zero_slots(holder, &slots)?;
		let mut run_start = values[0].1;
		let mut run_len = 1;
		for (_, value) in &values[1..] {
			if *value == run_start + run_len {
				run_len += 1;
				continue;
			}
			self.dispose(run_start, run_len)?;
			run_start = *value;
			run_len = 1;
		}
		self.dispose(run_start, run_len)
	}

	/// Frees whole sub-trees referenced by `slots` of `holder`.
	///
	/// `depth` is the number of indirection levels of the pointed blocks: 1
	/// means they hold data pointers. Children are freed before the pointer
	/// to them is dropped, so every sub-transaction commit leaves the tree
	/// consistent.
	fn free_branches(
		&mut self,
		holder: &Holder<'_>,
		slots: std::ops::Range<usize>,
		depth: usize,
	) -> FsResult<()> {
		for slot in slots {
			let value = self.read_slot(holder, slot);
			if value == 0 {
				continue;
			}
			let entries = self.fs.sb().get_entries_per_block() as usize;
			let buf = self.fs.cache().get(value as u64)?;
			if depth == 1 {
				self.free_data(&Holder::Buf(&buf), 0..entries)?;
			} else {
				self.free_branches(&Holder::Buf(&buf), 0..entries, depth - 1)?;
			}
			// The sub-tree is gone. Drop the now-empty indirect block and the
			// pointer to it in one step
			self.ensure_credits(STEP_CREDITS)?;
			self.fs.journal().forget(&self.handle, &buf)?;
			self.fs.journal().revoke(&self.handle, value)?;
			self.fs.cache().forget(value as u64);
			self.dispose(value, 1)?;
			self.zero_slots(holder, &[slot])?;
		}
		Ok(())
	}

	/// Frees the sub-tree hanging off the inode slot `slot`, entirely.
	fn free_root(&mut self, slot: usize, depth: usize) -> FsResult<()> {
		self.free_branches(&Holder::Root, slot..slot + 1, depth)
	}

	/// Frees the partial branch containing the cut point, then everything to
	/// its right.
	///
	/// `offsets` locates the first freed leaf below the inode slot
	/// `root_slot`; `depth` is the indirection level of the root's block.
	fn free_partial(&mut self, root_slot: usize, offsets: &[usize], depth: usize) -> FsResult<()> {
		// When the cut falls on the boundary of the root's sub-tree, the whole
		// sub-tree goes
		if offsets.iter().all(|o| *o == 0) {
			return self.free_root(root_slot, depth);
		}
		let value = self.inode.disk().read_slot(root_slot);
		if value == 0 {
			return Ok(());
		}
		let buf = self.fs.cache().get(value as u64)?;
		self.free_partial_level(&buf, offsets, depth)
	}

	fn free_partial_level(&mut self, buf: &RcBuffer, offsets: &[usize], depth: usize) -> FsResult<()> {
		let entries = self.fs.sb().get_entries_per_block() as usize;
		let slot = offsets[0];
		let holder = Holder::Buf(buf);
		if depth == 1 {
			// Leaf level: the cut falls inside this block
			return self.free_data(&holder, slot..entries);
		}
		if offsets[1..].iter().all(|o| *o == 0) {
			// The cut falls on the boundary of the child: it goes entirely,
			// with everything to its right
			return self.free_branches(&holder, slot..entries, depth - 1);
		}
		// Descend along the cut, then free the right siblings
		let value = buf.read_slot(slot);
		if value != 0 {
			let child = self.fs.cache().get(value as u64)?;
			self.free_partial_level(&child, &offsets[1..], depth - 1)?;
		}
		self.free_branches(&holder, slot + 1..entries, depth - 1)
	}

	/// Frees every block at or beyond the logical block `last_block`.
	fn truncate_blocks(&mut self, last_block: u32) -> FsResult<()> {
		let (log, snapshot) = {
			let sb = self.fs.sb();
			(
				sb.get_entries_per_block_log(),
				self.inode.disk().is_snapshot(),
			)
		};
		let tind_roots = if snapshot { 1 + NTIND } else { 1 };
		let path = match resolve(last_block, log, snapshot) {
			Ok(path) => path,
			// Nothing beyond the representable range to free
			Err(FsError::OutOfRange) => return Ok(()),
			Err(e) => return Err(e),
		};
		match path.depth {
			1 => {
				self.free_data(&Holder::Root, path.offsets[0]..DIR_BLOCKS)?;
				self.free_root(IND_SLOT, 1)?;
				self.free_root(DIND_SLOT, 2)?;
				for t in 0..tind_roots {
					self.free_root(TIND_SLOT + t, 3)?;
				}
			}
			2 => {
				self.free_partial(IND_SLOT, &path.offsets[1..2], 1)?;
				self.free_root(DIND_SLOT, 2)?;
				for t in 0..tind_roots {
					self.free_root(TIND_SLOT + t, 3)?;
				}
			}
			3 => {
				self.free_partial(DIND_SLOT, &path.offsets[1..3], 2)?;
				for t in 0..tind_roots {
					self.free_root(TIND_SLOT + t, 3)?;
				}
			}
			_ => {
				let root = path.offsets[0];
				self.free_partial(root, &path.offsets[1..MAX_DEPTH], 3)?;
				for t in root + 1..TIND_SLOT + tind_roots {
					self.free_root(t, 3)?;
				}
			}
		}
		Ok(())
	}
}

impl SnapFs {
	/// Truncates the content of `inode` to its current size, freeing every
	/// block strictly beyond it.
	///
	/// The operation is idempotent: re-running it over a partially truncated
	/// tree completes it.
	pub fn truncate(&self, inode: &Arc<Inode>) -> FsResult<()> {
		self.check_writable()?;
		let (size, blocks, skip) = {
			let disk = inode.disk();
			let sb = self.sb();
			let skip = disk.is_fast_symlink()
				|| disk.flags().contains(InodeFlags::SNAPFILE_ACTIVE)
				|| matches!(
					disk.get_type(),
					FileType::CharDevice | FileType::BlockDevice | FileType::Fifo | FileType::Socket
				);
			(disk.get_size(), disk.get_blocks(&sb), skip)
		};
		if skip {
			return Ok(());
		}
		// A corrupted inode may claim no blocks and still hold a tree
		let budget = (blocks as u32).clamp(2, MAX_TRANS_DATA);
		let handle = self.journal().start(budget)?;
		let res = self.do_truncate(&handle, inode, size, budget);
		if let Err(e) = &res {
			log::error!(
				"snapfs: truncate of inode {} failed: {e}; left on the orphan list",
				inode.ino
			);
		}
		if let Err(e) = self.journal().stop(&handle) {
			log::error!("snapfs: failed to stop the truncate handle: {e}");
		}
		res
	}

	fn do_truncate(
		&self,
		handle: &Arc<Handle>,
		inode: &Arc<Inode>,
		size: u64,
		budget: u32,
	) -> FsResult<()> {
		let blk_size = self.sb().get_block_size() as u64;
		self.orphan_add(handle, inode)?;
		self.truncate_zero_tail(handle, inode, size)?;
		let last_block = size.div_ceil(blk_size) as u32;
		let mut t = Truncator {
			fs: self,
			inode,
			handle: handle.clone(),
			guard: Some(inode.lock_tree()),
			budget: budget.max(STEP_CREDITS),
			freed: 0,
		};
		t.truncate_blocks(last_block)?;
		t.ensure_credits(STEP_CREDITS)?;
		{
			let mut disk = inode.disk();
			let now = crate::now();
			disk.i_mtime = now;
			disk.i_ctime = now;
		}
		t.flush_inode()?;
		drop(t);
		// A still-linked inode leaves the orphan list here; an unlinked one
		// stays for `delete_inode`
		let links = inode.disk().i_links_count;
		if links > 0 {
			self.orphan_del(handle, inode)?;
		}
		Ok(())
	}

	/// Zeroes the tail of the last surviving block, preserving its pre-image
	/// in the active snapshot first if needed.
	fn truncate_zero_tail(
		&self,
		handle: &Arc<Handle>,
		inode: &Arc<Inode>,
		size: u64,
	) -> FsResult<()> {
		let blk_size = self.sb().get_block_size() as u64;
		let off = (size % blk_size) as usize;
		if off == 0 {
			return Ok(());
		}
		let iblock = (size / blk_size) as u32;
		let mapping = self.map_block(inode, iblock, 1, MapMode::Lookup)?;
		if !mapping.flags.contains(crate::MapFlags::MAPPED) {
			return Ok(());
		}
		let target = self
			.get_move_access(handle, inode, iblock, mapping.phys, true)?
			.unwrap_or(mapping.phys);
		let buf = self.cache().get(target as u64)?;
		{
			let mut data = buf.data_mut();
			data[off..].fill(0);
		}
		buf.mark_dirty();
		Ok(())
	}

	/// Truncates `inode` to zero length, frees it and stamps its deletion.
	///
	/// The caller guarantees the inode has no remaining link.
	pub fn delete_inode(&self, inode: &Arc<Inode>) -> FsResult<()> {
		{
			let mut disk = inode.disk();
			disk.set_size(0);
			inode.mark_dirty();
		}
		self.truncate(inode)?;
		let handle = self.journal().start(MAX_TRANS_DATA)?;
		self.orphan_del(&handle, inode)?;
		{
			let mut disk = inode.disk();
			disk.i_dtime = crate::now();
			disk.i_links_count = 0;
			let disk = *disk;
			inode.mark_dirty();
			self.flush_inode(&handle, inode, &disk)?;
		}
		self.allocator().free_inode(self, &handle, inode.ino)?;
		self.journal().stop(&handle)?;
		self.drop_inode(inode.ino);
		Ok(())
	}

	/// Links `inode` at the head of the on-disk orphan list.
	///
	/// The inode's deletion timestamp field carries the link to the next
	/// orphan while the inode is on the list.
	pub(crate) fn orphan_add(&self, handle: &Handle, inode: &Inode) -> FsResult<()> {
		if inode.is_orphan() {
			// Already there, typically a truncate re-run after a crash
			return Ok(());
		}
		let sb_buf = self.sb_buffer()?;
		self.get_write_access(handle, &sb_buf)?;
		let head = {
			let mut sb = self.sb_mut();
			let head = sb.s_last_orphan;
			sb.s_last_orphan = inode.ino;
			head
		};
		self.flush_sb(handle, &sb_buf)?;
		let disk = {
			let mut disk = inode.disk();
			disk.i_dtime = head;
			*disk
		};
		inode.mark_dirty();
		self.flush_inode(handle, inode, &disk)?;
		inode.set_orphan(true);
		Ok(())
	}

	/// Unlinks `inode` from the on-disk orphan list.
	pub(crate) fn orphan_del(&self, handle: &Handle, inode: &Inode) -> FsResult<()> {
		if !inode.is_orphan() {
			return Ok(());
		}
		let (disk, next_ino) = {
			let mut disk = inode.disk();
			let next_ino = disk.i_dtime;
			disk.i_dtime = 0;
			(*disk, next_ino)
		};
		inode.mark_dirty();
		self.flush_inode(handle, inode, &disk)?;
		let head = self.sb().s_last_orphan;
		if head == inode.ino {
			let sb_buf = self.sb_buffer()?;
			self.get_write_access(handle, &sb_buf)?;
			self.sb_mut().s_last_orphan = next_ino;
			self.flush_sb(handle, &sb_buf)?;
		} else {
			// Walk the list for the predecessor
			let mut cur = head;
			while cur != 0 {
				let prev = self.get_inode(cur)?;
				let prev_next = prev.disk().i_dtime;
				if prev_next == inode.ino {
					let disk = {
						let mut disk = prev.disk();
						disk.i_dtime = next_ino;
						*disk
					};
					prev.mark_dirty();
					self.flush_inode(handle, &prev, &disk)?;
					break;
				}
				cur = prev_next;
			}
			if cur == 0 {
				log::warn!(
					"snapfs: inode {} marked orphan but absent from the list",
					inode.ino
				);
			}
		}
		inode.set_orphan(false);
		Ok(())
	}

	/// Completes the interrupted deletions recorded on the orphan list.
	///
	/// Called at mount, after journal replay brought the metadata back to a
	/// consistent state.
	pub fn replay_orphans(&self) -> FsResult<()> {
		loop {
			let head = self.sb().s_last_orphan;
			if head == 0 {
				return Ok(());
			}
			let inode = self.get_inode(head)?;
			inode.set_orphan(true);
			let links = inode.disk().i_links_count;
			log::info!(
				"snapfs: completing interrupted {} of orphan inode {head}",
				if links > 0 { "truncate" } else { "delete" }
			);
			if links > 0 {
				self.truncate(&inode)?;
			} else {
				self.delete_inode(&inode)?;
			}
		}
	}
}
