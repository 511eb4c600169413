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

//! Traversal of one branch of an inode's indirect tree.
//!
//! A walk captures, at each level, where the downward pointer lives and the
//! value it held. The walk does not hold the inode lock across block reads:
//! another task may truncate the tree while the walker sleeps. Instead, every
//! captured value is re-checked against the live slot after each read; a
//! mismatch aborts the walk and the caller retries from scratch.

use crate::{
	block::path::BlockPath,
	cache::RcBuffer,
	err::{FsError, FsResult},
	inode::Inode,
	SnapFs,
};

/// One level of a walked branch: the location of the downward pointer and the
/// value captured when it was read.
pub struct BranchRef {
	/// The buffer holding the pointer, or `None` when the pointer lives in the
	/// inode's slot array.
	pub buf: Option<RcBuffer>,
	/// The slot index inside the holder.
	pub slot: usize,
	/// The captured pointer value.
	pub value: u32,
}

impl BranchRef {
	/// Re-reads the pointer through its holder.
	pub fn reload(&self, inode: &Inode) -> u32 {
		match &self.buf {
			Some(buf) => buf.read_slot(self.slot),
			None => inode.disk().read_slot(self.slot),
		}
	}
}

/// A walked branch of the indirect tree.
///
/// The chain holds a read reference on every traversed indirect buffer, so
/// the buffers cannot leave the cache while the walk result is used.
pub struct Branch {
	/// The traversed levels, root first.
	pub steps: Vec<BranchRef>,
	/// The depth at which the walk found a zero slot, if any.
	pub hole_at: Option<usize>,
}

impl Branch {
	/// Tells whether the branch reaches a leaf block.
	#[inline]
	pub fn is_complete(&self) -> bool {
		self.hole_at.is_none()
	}

	/// Returns the leaf block of a complete branch.
	pub fn leaf(&self) -> u32 {
		self.steps.last().unwrap().value
	}

	/// Returns the level into which a new sub-branch must be spliced: the
	/// holder of the hole, or the deepest level of a complete branch.
	pub fn splice_point(&self) -> &BranchRef {
		match self.hole_at {
			Some(d) => &self.steps[d],
			None => self.steps.last().unwrap(),
		}
	}

	/// Re-reads every captured pointer and tells whether the branch is still
	/// current.
	pub fn verify(&self, inode: &Inode) -> bool {
		self.steps.iter().all(|s| s.reload(inode) == s.value)
	}
}

/// Checks for an invalid block number.
///
/// If the block number is zero, the function returns `None`.
pub fn check_blk(fs: &SnapFs, blk: u32) -> FsResult<Option<u32>> {
	if blk >= fs.sb().s_blocks_count {
		return Err(fs.inconsistency("block pointer beyond block count"));
	}
	Ok((blk != 0).then_some(blk))
}

/// Walks the branch described by `path`, capturing each level.
///
/// Returns the walked chain, stopped early at the first hole. If a previously
/// captured pointer changed while a deeper level was being read, the function
/// fails with [`FsError::Conflict`] and the caller must retry; a concurrent
/// truncate ran over the same range.
pub fn get_branch(fs: &SnapFs, inode: &Inode, path: &BlockPath) -> FsResult<Branch> {
	let mut steps = Vec::with_capacity(path.depth);
	let root = inode.disk().read_slot(path.offsets[0]);
	let present = check_blk(fs, root)?.is_some();
	steps.push(BranchRef {
		buf: None,
		slot: path.offsets[0],
		value: root,
	});
	if !present {
		return Ok(Branch {
			steps,
			hole_at: Some(0),
		});
	}
	for depth in 1..path.depth {
		let parent = steps[depth - 1].value;
		let buf = fs.cache().get(parent as u64)?;
		// The read may have slept. If a concurrent truncate rewrote any
		// pointer above, the chain is stale
		let changed = steps.iter().any(|s| s.reload(inode) != s.value);
		if changed {
			return Err(FsError::Conflict);
		}
		let value = buf.read_slot(path.offsets[depth]);
		let present = check_blk(fs, value)?.is_some();
		// An indirect block pointing back into the walked chain is a cycle
		if present && steps.iter().any(|s| s.value == value) {
			return Err(fs.inconsistency("cycle in indirect block pointers"));
		}
		steps.push(BranchRef {
			buf: Some(buf),
			slot: path.offsets[depth],
			value,
		});
		if !present {
			return Ok(Branch {
				steps,
				hole_at: Some(depth),
			});
		}
	}
	Ok(Branch {
		steps,
		hole_at: None,
	})
}

/// Returns an allocation goal near the existing blocks of the branch.
///
/// The slots left of the hole in its holder are scanned for any allocated
/// pointer; failing that, the holder's own block is the goal. When the hole
/// sits directly in the inode's slot array, independent writers are spread
/// across the inode's group by a colouring derived from the task id.
pub fn find_near(fs: &SnapFs, inode: &Inode, branch: &Branch) -> u32 {
	let point = branch.splice_point();
	match &point.buf {
		Some(buf) => {
			for slot in (0..point.slot).rev() {
				let value = buf.read_slot(slot);
				if value != 0 {
					return value;
				}
			}
			buf.block() as u32
		}
		None => {
			{
				let disk = inode.disk();
				for slot in (0..point.slot).rev() {
					let value = disk.read_slot(slot);
					if value != 0 {
						return value;
					}
				}
			}
			let sb = fs.sb();
			let group = (inode.ino - 1) / sb.s_inodes_per_group;
			let colour = (std::process::id() % 16) * (sb.s_blocks_per_group / 16);
			sb.group_first_block(group) + colour
		}
	}
}

/// Returns the allocation goal for mapping `iblock`.
///
/// Sequential writes continue right after the previous allocation; otherwise
/// the goal is derived from the branch neighbourhood.
pub fn find_goal(fs: &SnapFs, inode: &Inode, iblock: u32, branch: &Branch) -> u32 {
	if let Some(hint) = inode.alloc_hint(iblock) {
		return hint;
	}
	find_near(fs, inode, branch)
}
