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

//! The buffer cache holds the content of filesystem blocks in memory and
//! tracks their state relative to the disk.
//!
//! A buffer is in exactly one of the following states:
//! - **New**: the block was just allocated. Its content has never been read
//!   from nor written to the disk. While a copy-on-write operation is filling
//!   the buffer, the `pending` flag is set and readers must wait for it to
//!   clear
//! - **Uptodate**: the content matches (or predates) the disk
//! - **Dirty**: the content was modified and has not been written back yet
//!
//! Valid transitions: `New -> Uptodate`, `New -> Dirty`, `Uptodate -> Dirty`
//! on modification, `Dirty -> Uptodate` on write-back. The `pending` flag only
//! exists in the `New` state.

use crate::{dev::BlockDevice, err::FsError, err::FsResult};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering::Relaxed},
		Arc,
	},
	time::Duration,
};

/// The interval at which a task waiting on a pending copy re-checks the
/// buffer state.
const PENDING_WAIT_SLICE: Duration = Duration::from_millis(10);
/// The number of wait slices after which an overdue pending copy is reported.
const PENDING_WAIT_REPORT: u32 = 100;

/// The state of a cached buffer relative to the disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufState {
	/// The block was just allocated and holds no on-disk content yet.
	///
	/// `pending` tells whether a copy-on-write operation has reserved the
	/// buffer and is still filling it.
	New {
		/// Pending copy-on-write marker.
		pending: bool,
	},
	/// The content matches the disk.
	Uptodate,
	/// The content was modified and must be written back.
	Dirty,
}

/// A cached filesystem block.
///
/// The buffer content is protected by a read-write lock; the state and the
/// transaction tags are protected by a separate lock so that state can be
/// inspected without touching the content.
pub struct Buffer {
	/// The block offset on the device.
	blk: u64,
	/// The block content.
	data: RwLock<Box<[u8]>>,
	/// The buffer state.
	state: Mutex<BufState>,
	/// Signaled when a pending copy completes or is cancelled.
	cond: Condvar,

	/// The transaction in which the buffer was last copied to the snapshot.
	/// Zero means never.
	cow_tid: AtomicU64,
	/// The transaction the buffer is currently attached to. Zero means the
	/// buffer is not attached to the journal.
	journal_tid: AtomicU64,
}

/// Reference-counted handle on a cached buffer.
pub type RcBuffer = Arc<Buffer>;

impl Buffer {
	/// Returns the block offset of the buffer on the device.
	#[inline]
	pub fn block(&self) -> u64 {
		self.blk
	}

	/// Returns a read guard on the buffer's content.
	pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
		self.data.read()
	}

	/// Returns a write guard on the buffer's content.
	///
	/// The caller is responsible for marking the buffer dirty afterwards.
	pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
		self.data.write()
	}

	/// Reads the 32-bit little-endian slot at index `i`.
	pub fn read_slot(&self, i: usize) -> u32 {
		let data = self.data.read();
		let off = i * 4;
		u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
	}

	/// Writes `value` to the 32-bit little-endian slot at index `i`.
	///
	/// The caller is responsible for marking the buffer dirty afterwards.
	pub fn write_slot(&self, i: usize, value: u32) {
		let mut data = self.data.write();
		let off = i * 4;
		data[off..off + 4].copy_from_slice(&value.to_le_bytes());
	}

	/// Returns the current state of the buffer.
	pub fn state(&self) -> BufState {
		*self.state.lock()
	}

	/// Tells whether the buffer is dirty.
	pub fn is_dirty(&self) -> bool {
		matches!(*self.state.lock(), BufState::Dirty)
	}

	/// Tells whether the buffer holds valid content, that is whether it left
	/// the `New` state.
	pub fn is_uptodate(&self) -> bool {
		!matches!(*self.state.lock(), BufState::New { .. })
	}

	/// Marks the buffer's content as matching the disk.
	///
	/// A pending copy marker, if any, is cleared and waiters are woken up.
	pub fn set_uptodate(&self) {
		let mut state = self.state.lock();
		if matches!(*state, BufState::New { pending: true }) {
			self.cond.notify_all();
		}
		*state = BufState::Uptodate;
	}

	/// Marks the buffer as modified.
	///
	/// A pending copy marker, if any, is cleared and waiters are woken up.
	pub fn mark_dirty(&self) {
		let mut state = self.state.lock();
		if matches!(*state, BufState::New { pending: true }) {
			self.cond.notify_all();
		}
		*state = BufState::Dirty;
	}

	/// Sets the pending copy marker on a `New` buffer.
	///
	/// If the buffer is not in the `New` state, the function panics: only a
	/// freshly allocated buffer can carry a pending copy.
	pub fn set_pending_cow(&self) {
		let mut state = self.state.lock();
		match *state {
			BufState::New { .. } => *state = BufState::New { pending: true },
			_ => panic!("pending copy on a buffer holding valid content"),
		}
	}

	/// Clears the pending copy marker without publishing content, waking up
	/// waiters.
	///
	/// Used when a copy is cancelled after a failure.
	pub fn cancel_pending_cow(&self) {
		let mut state = self.state.lock();
		if matches!(*state, BufState::New { pending: true }) {
			*state = BufState::New { pending: false };
			self.cond.notify_all();
		}
	}

	/// Tells whether a copy-on-write operation is pending on the buffer.
	pub fn is_pending_cow(&self) -> bool {
		matches!(*self.state.lock(), BufState::New { pending: true })
	}

	/// Waits until the pending copy marker clears.
	///
	/// An overdue copy is reported once, then the wait continues: completion
	/// is bounded by the device, not by a timeout.
	pub fn wait_pending_cow(&self) {
		let mut state = self.state.lock();
		let mut slices = 0;
		while matches!(*state, BufState::New { pending: true }) {
			let timeout = self.cond.wait_for(&mut state, PENDING_WAIT_SLICE);
			if timeout.timed_out() {
				slices += 1;
				if slices == PENDING_WAIT_REPORT {
					log::warn!(
						"snapfs: pending copy of block {} overdue, still waiting",
						self.blk
					);
				}
			}
		}
	}

	/// Returns the transaction in which the buffer was last copied to the
	/// snapshot, or zero.
	#[inline]
	pub fn cow_tid(&self) -> u64 {
		self.cow_tid.load(Relaxed)
	}

	/// Records the transaction in which the buffer was copied to the snapshot.
	#[inline]
	pub fn set_cow_tid(&self, tid: u64) {
		self.cow_tid.store(tid, Relaxed);
	}

	/// Returns the transaction the buffer is attached to, or zero.
	#[inline]
	pub fn journal_tid(&self) -> u64 {
		self.journal_tid.load(Relaxed)
	}

	/// Attaches the buffer to transaction `tid`. Zero detaches it.
	///
	/// Called by the journal implementation.
	#[inline]
	pub fn set_journal_tid(&self, tid: u64) {
		self.journal_tid.store(tid, Relaxed);
	}
}

/// The cache of filesystem blocks for one device.
pub struct BufferCache {
	/// The underlying device.
	dev: Arc<dyn BlockDevice>,
	/// Cached buffers, by block offset.
	entries: Mutex<HashMap<u64, RcBuffer>>,
}

impl BufferCache {
	/// Creates a cache over the given device.
	pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
		Self {
			dev,
			entries: Mutex::new(HashMap::new()),
		}
	}

	/// Returns the size of a block in bytes.
	#[inline]
	pub fn block_size(&self) -> u32 {
		self.dev.block_size()
	}

	/// Returns the total number of blocks on the device.
	#[inline]
	pub fn block_count(&self) -> u64 {
		self.dev.block_count()
	}

	fn new_entry(&self, blk: u64, state: BufState) -> RcBuffer {
		Arc::new(Buffer {
			blk,
			data: RwLock::new(vec![0; self.dev.block_size() as usize].into_boxed_slice()),
			state: Mutex::new(state),
			cond: Condvar::new(),
			cow_tid: AtomicU64::new(0),
			journal_tid: AtomicU64::new(0),
		})
	}

	/// Returns the buffer for block `blk`, reading it from the device if it is
	/// not cached.
	pub fn get(&self, blk: u64) -> FsResult<RcBuffer> {
		if blk >= self.dev.block_count() {
			return Err(FsError::Inconsistency("block offset beyond device"));
		}
		let buf;
		let mut data;
		{
			let mut entries = self.entries.lock();
			if let Some(buf) = entries.get(&blk) {
				return Ok(buf.clone());
			}
			buf = self.new_entry(blk, BufState::New { pending: false });
			// Take the content lock before publication so a concurrent reader
			// blocks until the fill below completes
			data = buf.data.write();
			entries.insert(blk, buf.clone());
		}
		if let Err(e) = self.dev.read_block(blk, &mut data) {
			drop(data);
			self.entries.lock().remove(&blk);
			return Err(e);
		}
		drop(data);
		buf.set_uptodate();
		Ok(buf)
	}

	/// Returns a buffer for the freshly allocated block `blk` without reading
	/// the device.
	///
	/// The buffer content is zeroed and the state is `New`.
	pub fn get_new(&self, blk: u64) -> FsResult<RcBuffer> {
		if blk >= self.dev.block_count() {
			return Err(FsError::Inconsistency("block offset beyond device"));
		}
		let mut entries = self.entries.lock();
		// A stale entry may remain from a previous life of the block
		let buf = self.new_entry(blk, BufState::New { pending: false });
		entries.insert(blk, buf.clone());
		Ok(buf)
	}

	/// Returns the buffer for block `blk` only if it is cached.
	pub fn peek(&self, blk: u64) -> Option<RcBuffer> {
		self.entries.lock().get(&blk).cloned()
	}

	/// Drops the cache entry for block `blk`, if any.
	///
	/// Used when a block is freed or an allocation is rolled back, so that a
	/// later reuse of the block does not observe stale content.
	pub fn forget(&self, blk: u64) {
		self.entries.lock().remove(&blk);
	}

	/// Writes the buffer back to the device if it is dirty.
	pub fn sync_buffer(&self, buf: &Buffer) -> FsResult<()> {
		// Keep the content lock across the state transition so that a
		// concurrent modification marks the buffer dirty again after the write
		let data = buf.data.read();
		{
			let mut state = buf.state.lock();
			match *state {
				BufState::Dirty => *state = BufState::Uptodate,
				_ => return Ok(()),
			}
		}
		let res = self.dev.write_block(buf.blk, &data);
		if res.is_err() {
			// The content never reached the disk
			let mut state = buf.state.lock();
			if matches!(*state, BufState::Uptodate) {
				*state = BufState::Dirty;
			}
		}
		res
	}

	/// Writes the buffer to the device regardless of its state, leaving it
	/// `Uptodate`.
	///
	/// This is the synchronous path used for metadata which must bypass the
	/// journal.
	pub fn sync_buffer_now(&self, buf: &Buffer) -> FsResult<()> {
		let data = buf.data.read();
		self.dev.write_block(buf.blk, &data)?;
		buf.set_uptodate();
		Ok(())
	}

	/// Writes every dirty buffer back to the device, in ascending block order.
	pub fn sync(&self) -> FsResult<()> {
		let mut dirty: Vec<RcBuffer> = {
			let entries = self.entries.lock();
			entries.values().filter(|b| b.is_dirty()).cloned().collect()
		};
		dirty.sort_unstable_by_key(|b| b.blk);
		for buf in dirty {
			self.sync_buffer(&buf)?;
		}
		Ok(())
	}
}
