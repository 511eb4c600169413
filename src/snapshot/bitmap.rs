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

//! Copy-on-write bitmaps.
//!
//! Each block group gets, inside the active snapshot, a private copy of its
//! block bitmap frozen at the moment the snapshot first sees the group. A set
//! bit reads "this block was in use when the snapshot was taken and its
//! content must be preserved"; a clear bit lets later writes proceed without
//! any copy.
//!
//! The copy is taken lazily, on the first copy-on-write access to the group,
//! and the snapshot block holding it is remembered in the volatile per-group
//! state. It lives at the snapshot's logical offset equal to the physical
//! address of the live bitmap, like every other preserved block.

use crate::{
	block::alloc::AllocMode,
	cache::RcBuffer,
	err::FsResult,
	inode::Inode,
	journal::Handle,
	MapFlags, MapMode, SnapFs,
};
use std::sync::Arc;

impl SnapFs {
	/// Returns the snapshot block holding the copy-on-write bitmap of `group`,
	/// initializing it on first access.
	///
	/// Must run under a copy-on-write context: the handle's reentrance mark
	/// keeps the snapshot mapping below from triggering further copies.
	pub(crate) fn cow_bitmap_block(
		&self,
		handle: &Handle,
		snap: &Arc<Inode>,
		group: u32,
	) -> FsResult<u32> {
		debug_assert!(handle.is_cowing());
		let info = self.group(group);
		let cached = info.cow_bitmap();
		if cached != 0 {
			return Ok(cached);
		}
		let _group_lock = info.lock().lock();
		// Another task may have initialized the bitmap while the lock was
		// taken
		let cached = info.cow_bitmap();
		if cached != 0 {
			return Ok(cached);
		}
		let bgd = self.allocator().group_desc(group)?;
		// Capture the live bitmap first: allocating the copy block below
		// flips bits of its own, which belong to the snapshot and must not
		// read as "preserve"
		let frozen = {
			let live = self.allocator().read_block_bitmap(group)?;
			let data = live.data();
			data.to_vec()
		};
		// The copy lives at the logical offset matching the live bitmap's
		// physical address. The indirect blocks backing it are written
		// synchronously so the mapping is not reserved against the journal
		let mapping = self.map_block(
			snap,
			bgd.bg_block_bitmap,
			1,
			MapMode::Create {
				handle,
				mode: AllocMode::COW | AllocMode::SYNC,
			},
		)?;
		if mapping.flags.contains(MapFlags::NEW) {
			let copy = self
				.cache()
				.peek(mapping.phys as u64)
				.expect("fresh snapshot block without a buffer");
			if let Err(e) = self.fill_cow_bitmap(handle, bgd.bg_exclude_bitmap, &frozen, &copy) {
				copy.cancel_pending_cow();
				return Err(e);
			}
		}
		info.set_cow_bitmap(mapping.phys);
		log::debug!(
			"snapfs: group {group} copy-on-write bitmap at block {}",
			mapping.phys
		);
		Ok(mapping.phys)
	}

	/// Writes the captured bitmap content into `copy`, masking out the blocks
	/// of excluded files.
	fn fill_cow_bitmap(
		&self,
		handle: &Handle,
		exclude_bitmap: u32,
		frozen: &[u8],
		copy: &RcBuffer,
	) -> FsResult<()> {
		self.journal().get_create_access(handle, copy)?;
		{
			let mut copy_data = copy.data_mut();
			copy_data.copy_from_slice(frozen);
		}
		if exclude_bitmap != 0 {
			let exclude = self.cache().get(exclude_bitmap as u64)?;
			let exclude_data = exclude.data();
			let mut copy_data = copy.data_mut();
			for (c, e) in copy_data.iter_mut().zip(exclude_data.iter()) {
				*c &= !*e;
			}
		}
		copy.mark_dirty();
		self.journal().dirty_metadata(handle, copy)
	}

	/// Tells whether physical block `blk` was in use when the active snapshot
	/// was taken, that is whether its content must be preserved.
	pub(crate) fn test_cow_bit(
		&self,
		handle: &Handle,
		snap: &Arc<Inode>,
		blk: u32,
	) -> FsResult<bool> {
		let (group, index) = {
			let sb = self.sb();
			(sb.block_group_of(blk), sb.group_index_of(blk))
		};
		let bitmap_blk = self.cow_bitmap_block(handle, snap, group)?;
		let buf = self.cache().get(bitmap_blk as u64)?;
		let data = buf.data();
		Ok(data[index as usize / 8] & (1 << (index % 8)) != 0)
	}
}
