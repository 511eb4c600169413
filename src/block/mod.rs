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

//! Translation of logical block offsets to physical blocks.
//!
//! [`SnapFs::map_block`] is the single primitive the upper layers use. A
//! lookup walks the inode's indirect tree; a creating mapping additionally
//! allocates the missing branch and splices it in, under the inode's tree
//! lock.

pub mod alloc;
pub mod branch;
pub mod path;

use crate::{
	block::{
		alloc::{alloc_branch, AllocMode},
		branch::{find_goal, get_branch, Branch},
		path::{resolve, BlockPath},
	},
	err::{FsError, FsResult},
	inode::Inode,
	journal::Handle,
	SnapFs,
};

bitflags::bitflags! {
	/// Properties of a returned mapping.
	#[derive(Clone, Copy, Debug, Eq, PartialEq)]
	pub struct MapFlags: u32 {
		/// The mapping exists.
		const MAPPED = 0x1;
		/// The blocks were freshly allocated.
		const NEW = 0x2;
		/// The mapping ends on the last slot of its indirect block.
		const BOUNDARY = 0x4;
	}
}

/// The result of a block mapping request.
#[derive(Clone, Copy, Debug)]
pub struct Mapping {
	/// The first physical block, zero when unmapped.
	pub phys: u32,
	/// The number of contiguous blocks mapped, zero when unmapped.
	pub count: u32,
	/// Mapping properties.
	pub flags: MapFlags,
}

impl Mapping {
	const HOLE: Self = Self {
		phys: 0,
		count: 0,
		flags: MapFlags::empty(),
	};
}

/// How a mapping request treats a hole.
pub enum MapMode<'h> {
	/// Translate only; holes are reported unmapped.
	Lookup,
	/// Allocate the missing branch under the given transaction.
	Create {
		/// The running transaction.
		handle: &'h Handle,
		/// Branch allocation mode.
		mode: AllocMode,
	},
}

impl SnapFs {
	/// Maps `want` logical blocks of `inode` starting at `iblock` to physical
	/// blocks.
	///
	/// The returned run is contiguous both logically and physically and never
	/// crosses an indirect-block boundary; `count` may be smaller than `want`.
	///
	/// A walk raced by a concurrent truncate is retried once under the
	/// inode's tree lock before the conflict is surfaced.
	pub fn map_block(
		&self,
		inode: &Inode,
		iblock: u32,
		want: u32,
		mode: MapMode<'_>,
	) -> FsResult<Mapping> {
		let want = want.max(1);
		match self.map_block_attempt(inode, iblock, want, &mode, false) {
			Err(FsError::Conflict) => self.map_block_attempt(inode, iblock, want, &mode, true),
			res => res,
		}
	}

	fn map_block_attempt(
		&self,
		inode: &Inode,
		iblock: u32,
		want: u32,
		mode: &MapMode<'_>,
		locked_lookup: bool,
	) -> FsResult<Mapping> {
		let snapshot = inode.disk().is_snapshot();
		let path = resolve(iblock, self.sb().get_entries_per_block_log(), snapshot)?;
		// Lookup
		let branch = {
			let _guard = locked_lookup.then(|| inode.lock_tree());
			get_branch(self, inode, &path)?
		};
		if branch.is_complete() {
			return Ok(self.mapped_run(inode, &path, &branch, want));
		}
		let MapMode::Create {
			handle,
			mode,
		} = mode
		else {
			return Ok(Mapping::HOLE);
		};
		// Creation
		self.check_writable()?;
		if handle.is_aborted() {
			return Err(FsError::Aborted);
		}
		if snapshot && !handle.is_cowing() {
			// The snapshot image is only written through the copy-on-write
			// engine
			return Err(FsError::Permission);
		}
		let _tree = inode.lock_tree();
		// The tree may have changed while the lock was taken; the captured
		// chain is only reusable if every pointer still holds
		let branch = if branch.verify(inode) {
			branch
		} else {
			get_branch(self, inode, &path)?
		};
		if branch.is_complete() {
			return Ok(self.mapped_run(inode, &path, &branch, want));
		}
		let count = self.free_run(inode, &path, &branch, want);
		let goal = if snapshot && mode.intersects(AllocMode::COW | AllocMode::MOVE) {
			// Snapshot copies go near their sources, and the source physical
			// block of a snapshot mapping is the logical offset itself
			iblock
		} else {
			find_goal(self, inode, iblock, &branch)
		};
		let move_leaf = mode.contains(AllocMode::MOVE).then_some(iblock);
		let mut disk = inode.disk();
		let res = alloc_branch(
			self, handle, inode, &mut disk, iblock, &path, &branch, count, goal, *mode, move_leaf,
		)?;
		let mut flags = MapFlags::MAPPED | MapFlags::NEW;
		if res.leaf_count == path.boundary + 1 {
			flags |= MapFlags::BOUNDARY;
		}
		Ok(Mapping {
			phys: res.first_leaf,
			count: res.leaf_count,
			flags,
		})
	}

	/// Extends a complete branch into a contiguous mapped run of up to `want`
	/// blocks.
	fn mapped_run(&self, inode: &Inode, path: &BlockPath, branch: &Branch, want: u32) -> Mapping {
		let leaf = branch.leaf();
		let base = path.offsets[path.depth - 1];
		let limit = want.min(path.boundary + 1);
		let point = branch.steps.last().unwrap();
		let mut count = 1;
		while count < limit {
			let next = match &point.buf {
				Some(buf) => buf.read_slot(base + count as usize),
				None => inode.disk().read_slot(base + count as usize),
			};
			if next != leaf + count {
				break;
			}
			count += 1;
		}
		let mut flags = MapFlags::MAPPED;
		if count == path.boundary + 1 {
			flags |= MapFlags::BOUNDARY;
		}
		Mapping {
			phys: leaf,
			count,
			flags,
		}
	}

	/// Counts the consecutive free leaf slots to fill, starting at the hole.
	fn free_run(&self, inode: &Inode, path: &BlockPath, branch: &Branch, want: u32) -> u32 {
		let limit = want.min(path.boundary + 1);
		let hole = branch.hole_at.unwrap();
		if hole < path.depth - 1 {
			// The whole sub-tree is missing: every wanted slot is free
			return limit;
		}
		let base = path.offsets[path.depth - 1];
		let point = branch.splice_point();
		let mut count = 1;
		while count < limit {
			let next = match &point.buf {
				Some(buf) => buf.read_slot(base + count as usize),
				None => inode.disk().read_slot(base + count as usize),
			};
			if next != 0 {
				break;
			}
			count += 1;
		}
		count
	}
}
