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

//! Allocation and splicing of a new branch of the indirect tree.
//!
//! A branch is built in private buffers first: the missing indirect blocks
//! are allocated, zeroed and chained together before anything on disk can
//! reach them. The final pointer write into the existing tree publishes the
//! whole sub-tree at once.

use crate::{
	block::{branch::Branch, path::BlockPath},
	cache::RcBuffer,
	err::{FsError, FsResult},
	inode::{DiskInode, Inode},
	journal::Handle,
	SnapFs,
};

bitflags::bitflags! {
	/// Branch allocation modes. Empty means a plain allocation.
	#[derive(Clone, Copy, Debug, Eq, PartialEq)]
	pub struct AllocMode: u32 {
		/// The branch holds a snapshot's private copy of a block. Failures
		/// must leave the caller able to cancel its pending copy marker.
		const COW = 0x1;
		/// No leaf allocation: the caller supplies an existing physical block
		/// to adopt as the leaf. Indirect blocks are still allocated.
		const MOVE = 0x2;
		/// Write new indirect buffers synchronously to the device, bypassing
		/// the journal.
		const SYNC = 0x4;
	}
}

/// The outcome of a branch allocation.
#[derive(Clone, Copy, Debug)]
pub struct AllocResult {
	/// The first leaf block of the new branch.
	pub first_leaf: u32,
	/// The number of contiguous leaf blocks spliced in.
	pub leaf_count: u32,
}

/// Blocks obtained from the allocator, grouped in contiguous runs.
struct Obtained {
	runs: Vec<(u32, u32)>,
}

impl Obtained {
	fn total(&self) -> u32 {
		self.runs.iter().map(|(_, c)| c).sum()
	}

	/// Iterates over individual blocks, in allocation order.
	fn blocks(&self) -> impl Iterator<Item = u32> + '_ {
		self.runs
			.iter()
			.flat_map(|&(first, count)| first..first + count)
	}
}

/// Obtains `indirect_count` indirect blocks plus up to `want_leaves` leaf
/// blocks, best-effort.
///
/// The allocator may return short runs; the function keeps asking until every
/// indirect block plus at least one leaf is obtained. Leaves are only taken
/// from the run that provides the first one, so the mapped extent stays
/// contiguous.
fn alloc_blocks(
	fs: &SnapFs,
	handle: &Handle,
	ino: u32,
	mut goal: u32,
	indirect_count: u32,
	want_leaves: u32,
) -> FsResult<Obtained> {
	let alloc = fs.allocator();
	let mut obtained = Obtained {
		runs: Vec::new(),
	};
	let want_total = indirect_count + want_leaves;
	loop {
		let total = obtained.total();
		if total >= want_total {
			break;
		}
		let (first, count) = match alloc.new_blocks(fs, handle, ino, goal, want_total - total) {
			Ok(r) => r,
			Err(e) => {
				rollback_blocks(fs, handle, ino, &obtained, 0);
				return Err(e);
			}
		};
		obtained.runs.push((first, count));
		goal = first + count;
		// Stop as soon as one leaf is available: growing the run further
		// could not be published as one contiguous extent anyway
		if want_leaves > 0 && total + count > indirect_count {
			break;
		}
	}
	Ok(obtained)
}

/// Returns every obtained block after `keep` to the allocator.
fn rollback_blocks(fs: &SnapFs, handle: &Handle, ino: u32, obtained: &Obtained, keep: u32) {
	let mut skip = keep;
	for &(first, count) in &obtained.runs {
		if skip >= count {
			skip -= count;
			continue;
		}
		let first = first + skip;
		let count = count - skip;
		skip = 0;
		if let Err(e) = fs.allocator().free_blocks(fs, handle, ino, first, count) {
			// The primary failure is being reported; the leak only costs
			// space until the next filesystem check
			log::error!("snapfs: failed to roll back blocks {first}..+{count}: {e}");
		}
	}
}

/// Allocates and splices the branch filling the hole of `branch`.
///
/// Arguments:
/// - `disk` is the locked content of `inode`
/// - `path` is the resolved path of `iblock`
/// - `branch` is the partial chain previously walked for `path`
/// - `want` is the wanted number of contiguous leaf blocks; it must not cross
///   the boundary reported by the resolver
/// - `goal` is the preferred position of the first allocated block
/// - `move_leaf` supplies the adopted leaf block in `MOVE` mode
///
/// The splice into the live tree is the last write: a failure anywhere before
/// it leaves the on-disk tree untouched.
#[allow(clippy::too_many_arguments)]
pub fn alloc_branch(
	fs: &SnapFs,
	handle: &Handle,
	inode: &Inode,
	disk: &mut DiskInode,
	iblock: u32,
	path: &BlockPath,
	branch: &Branch,
	want: u32,
	goal: u32,
	mode: AllocMode,
	move_leaf: Option<u32>,
) -> FsResult<AllocResult> {
	if handle.is_aborted() {
		return Err(FsError::Aborted);
	}
	let hole = branch.hole_at.expect("allocating over a complete branch");
	let indirect_count = (path.depth - 1 - hole) as u32;
	let is_move = mode.contains(AllocMode::MOVE);
	let want_leaves = if is_move { 0 } else { want.max(1) };
	// Obtain the blocks
	let obtained = alloc_blocks(fs, handle, inode.ino, goal, indirect_count, want_leaves)?;
	let mut blocks = obtained.blocks();
	let indirects: Vec<u32> = blocks.by_ref().take(indirect_count as usize).collect();
	let (first_leaf, leaf_count) = if is_move {
		(move_leaf.expect("move without a leaf"), want.max(1))
	} else {
		// The leaves are the contiguous remainder of the obtained runs
		let leaves: Vec<u32> = blocks.collect();
		let first = leaves[0];
		let count = leaves
			.iter()
			.enumerate()
			.take_while(|(i, b)| **b == first + *i as u32)
			.count() as u32;
		(first, count)
	};
	// A snapshot copy is published before its content is written: buffer the
	// leaf with the pending marker set, so a reader reaching the fresh
	// mapping waits for the copy instead of reading garbage
	let pending_leaf = if mode.contains(AllocMode::COW) && !is_move {
		let buf = fs.cache().get_new(first_leaf as u64)?;
		buf.set_pending_cow();
		Some(buf)
	} else {
		None
	};
	// Chain the new indirect blocks together, deepest first in the write
	// order below but linked top-down
	let mut new_bufs: Vec<RcBuffer> = Vec::with_capacity(indirects.len());
	let res = build_branch(
		fs,
		handle,
		path,
		hole,
		&indirects,
		first_leaf,
		leaf_count,
		mode,
		&mut new_bufs,
	);
	if let Err(e) = res {
		if let Some(buf) = &pending_leaf {
			buf.cancel_pending_cow();
			fs.cache().forget(buf.block());
		}
		cleanup_branch(fs, handle, &new_bufs);
		rollback_blocks(fs, handle, inode.ino, &obtained, 0);
		return Err(e);
	}
	// Publish
	let subroot = indirects.first().copied().unwrap_or(first_leaf);
	let res = splice_branch(
		fs,
		handle,
		inode,
		disk,
		iblock,
		path,
		branch,
		subroot,
		indirect_count,
		first_leaf,
		leaf_count,
	);
	if let Err(e) = res {
		if let Some(buf) = &pending_leaf {
			buf.cancel_pending_cow();
			fs.cache().forget(buf.block());
		}
		cleanup_branch(fs, handle, &new_bufs);
		rollback_blocks(fs, handle, inode.ino, &obtained, 0);
		return Err(e);
	}
	// Unused tail of the obtained runs, when the allocator gave less
	// contiguity than asked
	let used = indirect_count + if is_move { 0 } else { leaf_count };
	rollback_blocks(fs, handle, inode.ino, &obtained, used);
	Ok(AllocResult {
		first_leaf,
		leaf_count,
	})
}

/// Prepares the new indirect blocks of the branch in private buffers.
#[allow(clippy::too_many_arguments)]
fn build_branch(
	fs: &SnapFs,
	handle: &Handle,
	path: &BlockPath,
	hole: usize,
	indirects: &[u32],
	first_leaf: u32,
	leaf_count: u32,
	mode: AllocMode,
	new_bufs: &mut Vec<RcBuffer>,
) -> FsResult<()> {
	for (i, blk) in indirects.iter().enumerate() {
		let buf = fs.cache().get_new(*blk as u64)?;
		fs.get_create_access(handle, &buf)?;
		new_bufs.push(buf.clone());
		// The level this indirect block serves
		let level = hole + 1 + i;
		if level == path.depth - 1 {
			// Deepest indirect: link the leaves
			for l in 0..leaf_count as usize {
				buf.write_slot(path.offsets[level] + l, first_leaf + l as u32);
			}
		} else {
			buf.write_slot(path.offsets[level], indirects[i + 1]);
		}
		buf.mark_dirty();
		if mode.contains(AllocMode::SYNC) {
			// Bitmap bootstrap: the mapping must not be reserved against the
			// journal
			fs.cache().sync_buffer_now(&buf)?;
		} else {
			fs.journal().dirty_metadata(handle, &buf)?;
		}
	}
	Ok(())
}

/// Writes the subroot pointer into the live tree, publishing the branch.
#[allow(clippy::too_many_arguments)]
fn splice_branch(
	fs: &SnapFs,
	handle: &Handle,
	inode: &Inode,
	disk: &mut DiskInode,
	iblock: u32,
	path: &BlockPath,
	branch: &Branch,
	subroot: u32,
	indirect_count: u32,
	first_leaf: u32,
	leaf_count: u32,
) -> FsResult<()> {
	let point = branch.splice_point();
	match &point.buf {
		Some(buf) => {
			fs.get_write_access(handle, buf)?;
			buf.write_slot(point.slot, subroot);
			if indirect_count == 0 {
				// The branch bottoms out in this block: link the extra leaves
				// right after the subroot
				for l in 1..leaf_count as usize {
					buf.write_slot(point.slot + l, first_leaf + l as u32);
				}
			}
			buf.mark_dirty();
			fs.journal().dirty_metadata(handle, buf)?;
		}
		None => {
			fs.inode_write_access(handle, inode)?;
			disk.write_slot(point.slot, subroot);
			if indirect_count == 0 && path.depth == 1 {
				for l in 1..leaf_count as usize {
					disk.write_slot(point.slot + l, first_leaf + l as u32);
				}
			}
		}
	}
	// Accounting on the owning inode
	let total = indirect_count as u64 + leaf_count as u64;
	let sb = fs.sb();
	disk.add_blocks(&sb, total);
	drop(sb);
	disk.i_ctime = crate::now();
	inode.set_alloc_hint(iblock + leaf_count - 1, first_leaf + leaf_count - 1);
	inode.mark_dirty();
	fs.flush_inode(handle, inode, disk)
}

/// Withdraws the private buffers of a failed branch from the journal and the
/// cache.
fn cleanup_branch(fs: &SnapFs, handle: &Handle, new_bufs: &[RcBuffer]) {
	for buf in new_bufs {
		if let Err(e) = fs.journal().forget(handle, buf) {
			log::error!(
				"snapfs: failed to forget buffer of block {}: {e}",
				buf.block()
			);
		}
		fs.cache().forget(buf.block());
	}
}
