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

//! Interface to the write-ahead journal.
//!
//! The journal itself lives outside of the core. The core only requires the
//! service surface below: transactions are started with a buffer-credit
//! budget, metadata buffers are declared before modification, and a running
//! transaction can be extended or restarted when the budget runs out.
//!
//! **Note**: the core never writes a metadata buffer without first obtaining
//! access through [`crate::SnapFs::get_write_access`] or
//! [`crate::SnapFs::get_create_access`], which run the snapshot copy-on-write
//! engine before delegating to the journal.

use crate::{cache::RcBuffer, err::FsResult};
use std::sync::{
	atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::Relaxed},
	Arc,
};

/// The maximum number of buffer credits a single truncate sub-transaction may
/// reserve.
pub const MAX_TRANS_DATA: u32 = 64;

/// A running transaction handle.
///
/// The handle carries the budgets granted by the journal and two pieces of
/// core-owned state: the abort flag, after which every hook short-circuits,
/// and the `cowing` flag marking that the holder is currently inside a
/// copy-on-write operation so that nested hooks are suppressed.
pub struct Handle {
	/// The id of the transaction the handle currently runs under.
	tid: AtomicU64,
	/// Remaining metadata buffer credits.
	buffer_credits: AtomicU32,
	/// Remaining data block credits.
	user_credits: AtomicU32,
	/// Set when the journal has been aborted.
	aborted: AtomicBool,
	/// Set while a copy-on-write operation runs under this handle.
	cowing: AtomicBool,
}

impl Handle {
	/// Creates a handle for transaction `tid` with the given credit budgets.
	///
	/// Called by the journal implementation.
	pub fn new(tid: u64, buffer_credits: u32, user_credits: u32) -> Self {
		Self {
			tid: AtomicU64::new(tid),
			buffer_credits: AtomicU32::new(buffer_credits),
			user_credits: AtomicU32::new(user_credits),
			aborted: AtomicBool::new(false),
			cowing: AtomicBool::new(false),
		}
	}

	/// Returns the id of the transaction the handle runs under.
	#[inline]
	pub fn tid(&self) -> u64 {
		self.tid.load(Relaxed)
	}

	/// Returns the remaining buffer credits.
	#[inline]
	pub fn buffer_credits(&self) -> u32 {
		self.buffer_credits.load(Relaxed)
	}

	/// Returns the remaining user credits.
	#[inline]
	pub fn user_credits(&self) -> u32 {
		self.user_credits.load(Relaxed)
	}

	/// Consumes one buffer credit. Returns `false` if none is left.
	pub fn consume_buffer_credit(&self) -> bool {
		self.buffer_credits
			.fetch_update(Relaxed, Relaxed, |c| c.checked_sub(1))
			.is_ok()
	}

	/// Consumes one user credit. Returns `false` if none is left.
	pub fn consume_user_credit(&self) -> bool {
		self.user_credits
			.fetch_update(Relaxed, Relaxed, |c| c.checked_sub(1))
			.is_ok()
	}

	/// Moves the handle onto transaction `tid` with a fresh credit budget.
	///
	/// Called by the journal implementation on restart.
	pub fn reset(&self, tid: u64, buffer_credits: u32, user_credits: u32) {
		self.tid.store(tid, Relaxed);
		self.buffer_credits.store(buffer_credits, Relaxed);
		self.user_credits.store(user_credits, Relaxed);
	}

	/// Grants `extra` additional buffer credits.
	///
	/// Called by the journal implementation on extend.
	pub fn grant_buffer_credits(&self, extra: u32) {
		self.buffer_credits.fetch_add(extra, Relaxed);
	}

	/// Tells whether the journal has been aborted under this handle.
	#[inline]
	pub fn is_aborted(&self) -> bool {
		self.aborted.load(Relaxed)
	}

	/// Marks the handle aborted. Every later hook call short-circuits.
	#[inline]
	pub fn abort(&self) {
		self.aborted.store(true, Relaxed);
	}

	/// Tells whether a copy-on-write operation is running under this handle.
	#[inline]
	pub fn is_cowing(&self) -> bool {
		self.cowing.load(Relaxed)
	}

	/// Sets the copy-on-write reentrance mark. Returns the previous value.
	#[inline]
	pub fn set_cowing(&self, cowing: bool) -> bool {
		self.cowing.swap(cowing, Relaxed)
	}
}

/// The write-ahead journal service consumed by the core.
///
/// Implementations attach buffers to transactions through
/// [`crate::cache::Buffer::set_journal_tid`] so that the copy-on-write engine
/// can tell whether a buffer belongs to the running transaction.
pub trait Journal: Send + Sync {
	/// Starts a transaction reserving `nblocks` buffer credits and returns its
	/// handle.
	fn start(&self, nblocks: u32) -> FsResult<Arc<Handle>>;

	/// Declares the intent to modify `buf`, whose previous content must be
	/// saved by the journal.
	fn get_write_access(&self, handle: &Handle, buf: &RcBuffer) -> FsResult<()>;

	/// Declares a freshly allocated metadata buffer. The previous content is
	/// meaningless and is not saved.
	fn get_create_access(&self, handle: &Handle, buf: &RcBuffer) -> FsResult<()>;

	/// Marks `buf` as part of the transaction's metadata update.
	fn dirty_metadata(&self, handle: &Handle, buf: &RcBuffer) -> FsResult<()>;

	/// Withdraws `buf` from the transaction, dropping any pending update to
	/// it.
	fn forget(&self, handle: &Handle, buf: &RcBuffer) -> FsResult<()>;

	/// Tells replay to ignore any earlier journal record for `blk`. Required
	/// when a journaled metadata block is freed.
	fn revoke(&self, handle: &Handle, blk: u32) -> FsResult<()>;

	/// Tries to grow the handle's budget by `nblocks` buffer credits.
	fn extend(&self, handle: &Handle, nblocks: u32) -> FsResult<()>;

	/// Commits the current transaction and moves the handle onto a new one
	/// with a budget of `nblocks` buffer credits.
	fn restart(&self, handle: &Handle, nblocks: u32) -> FsResult<()>;

	/// Terminates the handle. The transaction commits at the journal's
	/// discretion.
	fn stop(&self, handle: &Handle) -> FsResult<()>;

	/// Commits the current transaction and waits for it to reach the disk.
	fn force_commit(&self) -> FsResult<()>;
}
