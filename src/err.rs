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

//! Error kinds shared by every layer of the filesystem core.

use thiserror::Error;

/// Result alias used across the crate.
pub type FsResult<T> = Result<T, FsError>;

/// An error returned by the filesystem core.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum FsError {
	/// The device failed to read or write a block.
	#[error("input/output error")]
	Io,
	/// The block allocator is exhausted.
	#[error("no space left on device")]
	NoSpace,
	/// A cache or memory allocation failed.
	#[error("out of memory")]
	NoMem,
	/// A verified branch chain changed under the caller, which must retry from
	/// scratch.
	#[error("block mapping changed concurrently")]
	Conflict,
	/// An on-disk invariant does not hold. The filesystem is marked errored and
	/// further writes are refused.
	#[error("filesystem inconsistency: {0}")]
	Inconsistency(&'static str),
	/// Illegal access, such as writing the active snapshot directly.
	#[error("operation not permitted")]
	Permission,
	/// The journal has been aborted. The write will not land.
	#[error("journal aborted")]
	Aborted,
	/// A logical block offset exceeds the representable range of the inode's
	/// indirect tree.
	#[error("logical block offset out of range")]
	OutOfRange,
}
