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

//! Test harness: an in-memory device, a recording journal and a bitmap-backed
//! allocator, plus a small formatter building a filesystem from scratch.

#![allow(dead_code)]

use bytemuck::Zeroable;
use parking_lot::Mutex;
use snapfs::{
	bgd::BlockGroupDescriptor,
	err::{FsError, FsResult},
	inode::{DiskInode, Inode, INODE_TYPE_REGULAR},
	sb::{Superblock, FS_STATE_CLEAN, SNAPFS_MAGIC, SUPERBLOCK_OFFSET},
	AllocMode, Allocator, BlockDevice, BufferCache, Handle, Journal, MapFlags, MapMode,
	MountFlags, RcBuffer, SnapFs,
};
use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::Relaxed},
		Arc,
	},
};

/// An in-memory block device.
///
/// A one-shot read gate can be armed on a block: the first task reading it
/// sleeps inside the read, like a walker waiting on a slow disk, until the
/// test opens the gate. Later reads of the block pass through.
pub struct MemDev {
	data: Mutex<Vec<u8>>,
	blk_size: u32,
	count: u64,
	/// The gated block. `u64::MAX` means disarmed.
	gate_blk: AtomicU64,
	/// Set once a reader is parked on the gate.
	gate_arrived: AtomicBool,
	/// Set to let the parked reader through.
	gate_open: AtomicBool,
}

impl MemDev {
	pub fn new(blk_size: u32, count: u64) -> Self {
		Self {
			data: Mutex::new(vec![0; (blk_size as u64 * count) as usize]),
			blk_size,
			count,
			gate_blk: AtomicU64::new(u64::MAX),
			gate_arrived: AtomicBool::new(false),
			gate_open: AtomicBool::new(false),
		}
	}

	/// Arms the gate on the next read of `blk`.
	pub fn arm_read_gate(&self, blk: u64) {
		self.gate_open.store(false, Relaxed);
		self.gate_arrived.store(false, Relaxed);
		self.gate_blk.store(blk, Relaxed);
	}

	/// Waits until a reader is parked on the gate.
	pub fn await_read_gate(&self) {
		while !self.gate_arrived.load(Relaxed) {
			std::thread::sleep(std::time::Duration::from_millis(1));
		}
	}

	/// Lets the parked reader through.
	pub fn open_read_gate(&self) {
		self.gate_open.store(true, Relaxed);
	}
}

impl BlockDevice for MemDev {
	fn block_size(&self) -> u32 {
		self.blk_size
	}

	fn block_count(&self) -> u64 {
		self.count
	}

	fn read_block(&self, blk: u64, buf: &mut [u8]) -> FsResult<()> {
		if self
			.gate_blk
			.compare_exchange(blk, u64::MAX, Relaxed, Relaxed)
			.is_ok()
		{
			self.gate_arrived.store(true, Relaxed);
			while !self.gate_open.load(Relaxed) {
				std::thread::sleep(std::time::Duration::from_millis(1));
			}
		}
		if blk >= self.count {
			return Err(FsError::Io);
		}
		let off = (blk * self.blk_size as u64) as usize;
		buf.copy_from_slice(&self.data.lock()[off..off + self.blk_size as usize]);
		Ok(())
	}

	fn write_block(&self, blk: u64, buf: &[u8]) -> FsResult<()> {
		if blk >= self.count {
			return Err(FsError::Io);
		}
		let off = (blk * self.blk_size as u64) as usize;
		self.data.lock()[off..off + self.blk_size as usize].copy_from_slice(buf);
		Ok(())
	}
}

type RestartHook = Box<dyn Fn(u32) + Send + Sync>;

/// A journal good enough for the core: it hands out credits, tracks the
/// running transaction id and records restarts. Durability is the cache's
/// write-back; replay is out of scope.
pub struct MemJournal {
	tid: AtomicU64,
	/// Cap on the credits granted per transaction. Zero means uncapped.
	cap: AtomicU32,
	pub restarts: AtomicU32,
	pub commits: AtomicU32,
	/// Abort the journal at the nth restart, as a crash would. Zero disables.
	abort_at: AtomicU32,
	on_restart: Mutex<Option<RestartHook>>,
}

impl MemJournal {
	pub fn new() -> Self {
		Self {
			tid: AtomicU64::new(1),
			cap: AtomicU32::new(0),
			restarts: AtomicU32::new(0),
			commits: AtomicU32::new(0),
			abort_at: AtomicU32::new(0),
			on_restart: Mutex::new(None),
		}
	}

	/// Caps the credits granted to each transaction, forcing restarts.
	pub fn set_credit_cap(&self, cap: u32) {
		self.cap.store(cap, Relaxed);
	}

	/// Makes the `nth` restart abort the journal, as a crash would.
	pub fn set_abort_at(&self, nth: u32) {
		self.abort_at.store(nth, Relaxed);
	}

	/// Registers a callback invoked after each transaction restart.
	pub fn set_restart_hook(&self, hook: RestartHook) {
		*self.on_restart.lock() = Some(hook);
	}

	fn grantable(&self, asked: u32) -> u32 {
		let cap = self.cap.load(Relaxed);
		if cap == 0 {
			asked
		} else {
			asked.min(cap)
		}
	}

	fn check(&self, handle: &Handle) -> FsResult<()> {
		if handle.is_aborted() {
			return Err(FsError::Aborted);
		}
		Ok(())
	}
}

impl Journal for MemJournal {
	fn start(&self, nblocks: u32) -> FsResult<Arc<Handle>> {
		let credits = self.grantable(nblocks);
		Ok(Arc::new(Handle::new(
			self.tid.load(Relaxed),
			credits,
			credits,
		)))
	}

	fn get_write_access(&self, handle: &Handle, buf: &RcBuffer) -> FsResult<()> {
		self.check(handle)?;
		buf.set_journal_tid(handle.tid());
		Ok(())
	}

	fn get_create_access(&self, handle: &Handle, buf: &RcBuffer) -> FsResult<()> {
		self.check(handle)?;
		buf.set_journal_tid(handle.tid());
		Ok(())
	}

	fn dirty_metadata(&self, handle: &Handle, buf: &RcBuffer) -> FsResult<()> {
		self.check(handle)?;
		if !handle.consume_buffer_credit() {
			return Err(FsError::NoMem);
		}
		buf.set_journal_tid(handle.tid());
		Ok(())
	}

	fn forget(&self, handle: &Handle, buf: &RcBuffer) -> FsResult<()> {
		self.check(handle)?;
		buf.set_journal_tid(0);
		Ok(())
	}

	fn revoke(&self, handle: &Handle, _blk: u32) -> FsResult<()> {
		self.check(handle)
	}

	fn extend(&self, handle: &Handle, nblocks: u32) -> FsResult<()> {
		self.check(handle)?;
		if self.cap.load(Relaxed) != 0 {
			// A capped journal is full by definition
			return Err(FsError::NoSpace);
		}
		handle.grant_buffer_credits(nblocks);
		Ok(())
	}

	fn restart(&self, handle: &Handle, nblocks: u32) -> FsResult<()> {
		self.check(handle)?;
		let abort_at = self.abort_at.load(Relaxed);
		if abort_at != 0 && self.restarts.load(Relaxed) + 1 >= abort_at {
			handle.abort();
			return Err(FsError::Aborted);
		}
		let tid = self.tid.fetch_add(1, Relaxed) + 1;
		self.commits.fetch_add(1, Relaxed);
		let credits = self.grantable(nblocks);
		handle.reset(tid, credits, credits);
		let restarts = self.restarts.fetch_add(1, Relaxed) + 1;
		if let Some(hook) = &*self.on_restart.lock() {
			hook(restarts);
		}
		Ok(())
	}

	fn stop(&self, handle: &Handle) -> FsResult<()> {
		self.check(handle)
	}

	fn force_commit(&self) -> FsResult<()> {
		self.tid.fetch_add(1, Relaxed);
		self.commits.fetch_add(1, Relaxed);
		Ok(())
	}
}

/// A first-fit allocator over the on-disk bitmaps, with a per-owner quota
/// ledger.
pub struct MemAllocator {
	cache: Arc<BufferCache>,
	/// Serializes bitmap scans and flips. Never held across a call back into
	/// the core, which may re-enter the allocator for the snapshot's needs.
	lock: Mutex<()>,
	quota: Mutex<HashMap<u32, u64>>,
	/// Number of `new_blocks` calls, for allocation-counting assertions.
	pub alloc_calls: AtomicU32,
	/// Makes the next block allocation fail, as a full disk would.
	fail_next: AtomicBool,
}

impl MemAllocator {
	pub fn new(cache: Arc<BufferCache>) -> Self {
		Self {
			cache,
			lock: Mutex::new(()),
			quota: Mutex::new(HashMap::new()),
			alloc_calls: AtomicU32::new(0),
			fail_next: AtomicBool::new(false),
		}
	}

	/// Makes the next `new_blocks` call fail with `NoSpace`.
	pub fn fail_next_alloc(&self) {
		self.fail_next.store(true, Relaxed);
	}

	fn sb(&self) -> FsResult<Superblock> {
		let (blk, off) = Superblock::location(self.cache.block_size());
		let buf = self.cache.get(blk)?;
		let data = buf.data();
		Ok(bytemuck_read(&data[off..off + 1024]))
	}

	fn charge(&self, ino: u32, count: u64) {
		*self.quota.lock().entry(ino).or_insert(0) += count;
	}

	fn refund(&self, ino: u32, count: u64) {
		let mut quota = self.quota.lock();
		let usage = quota.entry(ino).or_insert(0);
		*usage = usage.saturating_sub(count);
	}

	/// Scans `bitmap` for a free run of up to `count` bits starting at or
	/// after `from`, allocates it and returns (index, length).
	fn take_run(&self, bitmap: &RcBuffer, from: u32, limit: u32, count: u32) -> Option<(u32, u32)> {
		let mut data = bitmap.data_mut();
		let mut start = None;
		for i in from..limit {
			let free = data[i as usize / 8] & (1 << (i % 8)) == 0;
			if free {
				start = Some(i);
				break;
			}
		}
		let start = start?;
		let mut len = 0;
		while len < count && start + len < limit {
			let i = start + len;
			if data[i as usize / 8] & (1 << (i % 8)) != 0 {
				break;
			}
			data[i as usize / 8] |= 1 << (i % 8);
			len += 1;
		}
		Some((start, len))
	}
}

fn bytemuck_read<T: bytemuck::Pod>(bytes: &[u8]) -> T {
	bytemuck::pod_read_unaligned(bytes)
}

impl Allocator for MemAllocator {
	fn new_blocks(
		&self,
		fs: &SnapFs,
		handle: &Handle,
		ino: u32,
		goal: u32,
		count: u32,
	) -> FsResult<(u32, u32)> {
		if self.fail_next.swap(false, Relaxed) {
			return Err(FsError::NoSpace);
		}
		self.alloc_calls.fetch_add(1, Relaxed);
		let sb = self.sb()?;
		let groups = sb.get_block_groups_count();
		let goal = goal.clamp(sb.s_first_data_block, sb.s_blocks_count - 1);
		let goal_group = sb.block_group_of(goal);
		for pass in 0..=groups {
			let group = (goal_group + pass) % groups;
			let from = if pass == 0 {
				sb.group_index_of(goal)
			} else {
				0
			};
			let limit = sb
				.s_blocks_per_group
				.min(sb.s_blocks_count - sb.group_first_block(group));
			// The access hook must run before the allocator lock is taken:
			// preserving the bitmap's pre-image may re-enter the allocator
			let bitmap = fs.get_bitmap_access(handle, group)?;
			let run = {
				let _lock = self.lock.lock();
				self.take_run(&bitmap, from, limit, count)
			};
			if let Some((index, len)) = run {
				bitmap.mark_dirty();
				fs.journal().dirty_metadata(handle, &bitmap)?;
				self.charge(ino, len as u64);
				return Ok((sb.group_first_block(group) + index, len));
			}
		}
		Err(FsError::NoSpace)
	}

	fn free_blocks(
		&self,
		fs: &SnapFs,
		handle: &Handle,
		ino: u32,
		first: u32,
		count: u32,
	) -> FsResult<()> {
		let sb = self.sb()?;
		// A run may span a group boundary
		let mut cur = first;
		let end = first + count;
		while cur < end {
			let group = sb.block_group_of(cur);
			let group_end = sb.group_first_block(group) + sb.s_blocks_per_group;
			let chunk_end = end.min(group_end);
			let bitmap = fs.get_bitmap_access(handle, group)?;
			{
				let _lock = self.lock.lock();
				let mut data = bitmap.data_mut();
				for blk in cur..chunk_end {
					let i = sb.group_index_of(blk);
					data[i as usize / 8] &= !(1 << (i % 8));
				}
			}
			bitmap.mark_dirty();
			fs.journal().dirty_metadata(handle, &bitmap)?;
			cur = chunk_end;
		}
		self.refund(ino, count as u64);
		Ok(())
	}

	fn new_inode(&self, fs: &SnapFs, handle: &Handle) -> FsResult<u32> {
		let sb = self.sb()?;
		for group in 0..sb.get_block_groups_count() {
			let bgd = self.group_desc(group)?;
			let bitmap = self.cache.get(bgd.bg_inode_bitmap as u64)?;
			fs.get_write_access(handle, &bitmap)?;
			let found = {
				let _lock = self.lock.lock();
				let mut data = bitmap.data_mut();
				let mut found = None;
				for i in 0..sb.s_inodes_per_group {
					if data[i as usize / 8] & (1 << (i % 8)) == 0 {
						data[i as usize / 8] |= 1 << (i % 8);
						found = Some(i);
						break;
					}
				}
				found
			};
			if let Some(i) = found {
				bitmap.mark_dirty();
				fs.journal().dirty_metadata(handle, &bitmap)?;
				return Ok(group * sb.s_inodes_per_group + i + 1);
			}
		}
		Err(FsError::NoSpace)
	}

	fn free_inode(&self, fs: &SnapFs, handle: &Handle, ino: u32) -> FsResult<()> {
		let sb = self.sb()?;
		let group = (ino - 1) / sb.s_inodes_per_group;
		let index = (ino - 1) % sb.s_inodes_per_group;
		let bgd = self.group_desc(group)?;
		let bitmap = self.cache.get(bgd.bg_inode_bitmap as u64)?;
		fs.get_write_access(handle, &bitmap)?;
		{
			let _lock = self.lock.lock();
			let mut data = bitmap.data_mut();
			data[index as usize / 8] &= !(1 << (index % 8));
		}
		bitmap.mark_dirty();
		fs.journal().dirty_metadata(handle, &bitmap)
	}

	fn group_desc(&self, group: u32) -> FsResult<BlockGroupDescriptor> {
		let blk_size = self.cache.block_size();
		let (sb_blk, _) = Superblock::location(blk_size);
		let per_block = BlockGroupDescriptor::per_block(blk_size);
		let blk = sb_blk + 1 + (group / per_block) as u64;
		let off = (group % per_block) as usize * size_of::<BlockGroupDescriptor>();
		let buf = self.cache.get(blk)?;
		let data = buf.data();
		Ok(bytemuck_read(&data[off..off + size_of::<BlockGroupDescriptor>()]))
	}

	fn read_block_bitmap(&self, group: u32) -> FsResult<RcBuffer> {
		let bgd = self.group_desc(group)?;
		self.cache.get(bgd.bg_block_bitmap as u64)
	}

	fn quota_usage(&self, ino: u32) -> u64 {
		self.quota.lock().get(&ino).copied().unwrap_or(0)
	}

	fn quota_transfer(&self, from: u32, to: u32, count: u32) -> FsResult<()> {
		self.refund(from, count as u64);
		self.charge(to, count as u64);
		Ok(())
	}
}

/// Geometry of a formatted test filesystem.
pub struct Geometry {
	pub blk_size: u32,
	pub blocks: u32,
	pub blocks_per_group: u32,
	pub inodes_per_group: u32,
}

impl Default for Geometry {
	fn default() -> Self {
		Self {
			blk_size: 1024,
			blocks: 4096,
			blocks_per_group: 1024,
			inodes_per_group: 64,
		}
	}
}

/// Formats the device: superblock, group descriptors, bitmaps and empty
/// inode tables.
pub fn format(dev: &MemDev, geo: &Geometry) {
	let bs = geo.blk_size;
	let first_data = u32::from(bs == 1024);
	let groups = (geo.blocks - first_data).div_ceil(geo.blocks_per_group);
	let sb_blk = (SUPERBLOCK_OFFSET / bs as u64) as u32;
	let bgd_blocks = (groups * 32).div_ceil(bs);
	let table_blocks = geo.inodes_per_group * 256 / bs;
	let mut bgds = vec![0u8; (bgd_blocks * bs) as usize];
	let mut total_used = 0u32;
	for g in 0..groups {
		let group_start = first_data + g * geo.blocks_per_group;
		let meta = if g == 0 {
			sb_blk + 1 + bgd_blocks
		} else {
			group_start
		};
		let bgd = BlockGroupDescriptor {
			bg_block_bitmap: meta,
			bg_inode_bitmap: meta + 1,
			bg_inode_table: meta + 2,
			bg_free_blocks_count: 0,
			bg_free_inodes_count: geo.inodes_per_group as u16,
			bg_used_dirs_count: 0,
			bg_pad: 0,
			bg_exclude_bitmap: 0,
			bg_reserved: [0; 2],
		};
		bgds[(g * 32) as usize..(g * 32 + 32) as usize]
			.copy_from_slice(bytemuck::bytes_of(&bgd));
		// Block bitmap: group metadata and the tail beyond the device are in
		// use
		let mut bitmap = vec![0u8; bs as usize];
		let mut set = |blk: u32| {
			let i = blk - group_start;
			bitmap[i as usize / 8] |= 1 << (i % 8);
		};
		for blk in group_start..(meta + 2 + table_blocks).min(geo.blocks) {
			// Group 0 also covers the boot area, superblock and descriptors
			set(blk);
			total_used += 1;
		}
		drop(set);
		let limit = (geo.blocks - group_start).min(geo.blocks_per_group);
		for i in limit..geo.blocks_per_group.min(bs * 8) {
			bitmap[i as usize / 8] |= 1 << (i % 8);
		}
		dev.write_block(meta as u64, &bitmap).unwrap();
		// Inode bitmap: reserved inodes in group 0, the out-of-range tail
		// everywhere
		let mut ibitmap = vec![0u8; bs as usize];
		if g == 0 {
			for i in 0..10 {
				ibitmap[i / 8] |= 1 << (i % 8);
			}
		}
		for i in geo.inodes_per_group..bs * 8 {
			ibitmap[i as usize / 8] |= 1 << (i % 8);
		}
		dev.write_block((meta + 1) as u64, &ibitmap).unwrap();
		// Empty inode table
		let zero = vec![0u8; bs as usize];
		for b in 0..table_blocks {
			dev.write_block((meta + 2 + b) as u64, &zero).unwrap();
		}
	}
	for b in 0..bgd_blocks {
		dev.write_block(
			(sb_blk + 1 + b) as u64,
			&bgds[(b * bs) as usize..((b + 1) * bs) as usize],
		)
		.unwrap();
	}
	let mut sb = Superblock::zeroed();
	sb.s_magic = SNAPFS_MAGIC;
	sb.s_log_block_size = bs.trailing_zeros() - 10;
	sb.s_blocks_count = geo.blocks;
	sb.s_first_data_block = first_data;
	sb.s_blocks_per_group = geo.blocks_per_group;
	sb.s_inodes_per_group = geo.inodes_per_group;
	sb.s_inodes_count = groups * geo.inodes_per_group;
	sb.s_free_blocks_count = geo.blocks - total_used;
	sb.s_free_inodes_count = groups * geo.inodes_per_group - 10;
	sb.s_rev_level = 1;
	sb.s_first_ino = 11;
	sb.s_inode_size = 256;
	sb.s_state = FS_STATE_CLEAN;
	sb.s_errors = 1;
	sb.s_max_mnt_count = u16::MAX;
	let mut blk = vec![0u8; bs as usize];
	let off = (SUPERBLOCK_OFFSET % bs as u64) as usize;
	blk[off..off + 1024].copy_from_slice(bytemuck::bytes_of(&sb));
	dev.write_block(sb_blk as u64, &blk).unwrap();
}

/// A formatted and mounted filesystem with its collaborators.
pub struct Harness {
	pub dev: Arc<MemDev>,
	pub cache: Arc<BufferCache>,
	pub journal: Arc<MemJournal>,
	pub alloc: Arc<MemAllocator>,
	pub fs: Arc<SnapFs>,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_geometry(Geometry::default())
	}

	pub fn with_geometry(geo: Geometry) -> Self {
		let dev = Arc::new(MemDev::new(geo.blk_size, geo.blocks as u64));
		format(&dev, &geo);
		Self::mount(dev)
	}

	pub fn mount(dev: Arc<MemDev>) -> Self {
		let cache = Arc::new(BufferCache::new(dev.clone()));
		let journal = Arc::new(MemJournal::new());
		let alloc = Arc::new(MemAllocator::new(cache.clone()));
		let fs = SnapFs::mount(
			cache.clone(),
			journal.clone(),
			alloc.clone(),
			MountFlags::empty(),
		)
		.expect("mount failed");
		Self {
			dev,
			cache,
			journal,
			alloc,
			fs,
		}
	}

	/// Unmounts and mounts again over the same device, dropping every
	/// in-memory state.
	pub fn remount(self) -> Self {
		self.fs.sync_fs().expect("sync failed");
		let dev = self.dev.clone();
		drop(self);
		Self::mount(dev)
	}

	pub fn start(&self) -> Arc<Handle> {
		self.journal.start(64).unwrap()
	}

	/// Creates an empty regular file.
	pub fn create_file(&self) -> Arc<Inode> {
		let handle = self.start();
		let ino = self.alloc.new_inode(&self.fs, &handle).unwrap();
		let mut disk = DiskInode::zeroed();
		disk.i_mode = INODE_TYPE_REGULAR | 0o644;
		disk.i_links_count = 1;
		let inode = self.fs.install_inode(ino, disk);
		self.fs.flush_inode(&handle, &inode, &disk).unwrap();
		self.journal.stop(&handle).unwrap();
		inode
	}

	/// Writes one block of `inode` at `iblock`, filled with `fill`, through
	/// the data hooks. Returns the physical block written.
	pub fn write_block(&self, inode: &Arc<Inode>, iblock: u32, fill: u8) -> u32 {
		let handle = self.start();
		let mapping = self
			.fs
			.map_block(inode, iblock, 1, MapMode::Lookup)
			.unwrap();
		let (phys, new) = if mapping.flags.contains(MapFlags::MAPPED) {
			let replacement = self
				.fs
				.get_move_access(&handle, inode, iblock, mapping.phys, false)
				.unwrap();
			(replacement.unwrap_or(mapping.phys), replacement.is_some())
		} else {
			let mapping = self
				.fs
				.map_block(
					inode,
					iblock,
					1,
					MapMode::Create {
						handle: &handle,
						mode: AllocMode::empty(),
					},
				)
				.unwrap();
			(mapping.phys, true)
		};
		let buf = if new {
			self.cache.get_new(phys as u64).unwrap()
		} else {
			self.cache.get(phys as u64).unwrap()
		};
		buf.data_mut().fill(fill);
		buf.mark_dirty();
		// Keep the size covering the written block
		{
			let mut disk = inode.disk();
			let size = (iblock as u64 + 1) * self.cache.block_size() as u64;
			if disk.get_size() < size {
				disk.set_size(size);
			}
			let disk = *disk;
			inode.mark_dirty();
			self.fs.flush_inode(&handle, inode, &disk).unwrap();
		}
		self.journal.stop(&handle).unwrap();
		phys
	}

	/// Reads one block of `inode`, if mapped.
	pub fn read_block(&self, inode: &Arc<Inode>, iblock: u32) -> Option<Vec<u8>> {
		let mapping = self
			.fs
			.map_block(inode, iblock, 1, MapMode::Lookup)
			.unwrap();
		if !mapping.flags.contains(MapFlags::MAPPED) {
			return None;
		}
		Some(self.cache.get(mapping.phys as u64).unwrap().data().to_vec())
	}

	/// Tells whether block `blk` is allocated in its group's bitmap.
	pub fn block_in_use(&self, blk: u32) -> bool {
		let sb_snapshot = *self.fs.sb();
		let group = sb_snapshot.block_group_of(blk);
		let index = sb_snapshot.group_index_of(blk);
		let bitmap = self.alloc.read_block_bitmap(group).unwrap();
		let data = bitmap.data();
		data[index as usize / 8] & (1 << (index % 8)) != 0
	}
}
