/*
 * Created on Tue Jan 09 2024
 *
 * This file is a part of Skyfs
 * Skyfs is a free and open-source copy-on-write filesystem tree engine
 * written by Sayan Nandan ("the Author") with the vision to provide a
 * transactional dancing-tree storage core without compromising on
 * performance or recoverability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use std::io::Error as IoError;

pub type TreeResult<T> = Result<T, TreeError>;
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Tree core errors.
///
/// The first group surfaces to callers of the tree API. The second group
/// is an internal band: those codes are consumed inside the tree, carry
/// and flush subsystems and must never cross the crate boundary.
pub enum TreeError {
    // surfacing
    /// lookup missed
    NotFound,
    /// block read/write failure or a node that failed its format check
    Io,
    /// allocator exhaustion, or balancing could not place an item even
    /// after allocating new nodes
    NoSpace,
    /// transient allocation (carry pool) exhaustion
    NoMemory,
    // internal band
    /// sibling absent, or not in cache and reads were disallowed
    NoNeighbor,
    /// znode not loaded and reads were disallowed
    NotInCache,
    /// a shift/insert primitive could not fit; triggers make-space
    NodeFull,
    /// restartable carry level must release and reacquire its locks
    Restart,
    /// lock manager detected priority inversion; unwind and retry
    Deadlock,
    /// a non-blocking lock request would have blocked
    WouldBlock,
}

impl TreeError {
    /// true for codes that are allowed to leave the tree/carry/flush
    /// subsystems
    pub const fn surfaces(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::Io | Self::NoSpace | Self::NoMemory
        )
    }
}

#[derive(Debug)]
/// Storage layer errors
pub enum StorageError {
    /// OS level I/O failure
    Io(IoError),
    /// bad magic or unsupported version in the master super-block
    BadMaster,
    /// the per-format super-block failed validation
    BadSuper,
    /// checksum mismatch on a formatted metadata block
    BadChecksum,
    /// block device exhausted
    NoSpace,
    /// journal header/footer failed validation
    BadJournal,
    /// access past the end of the device
    OutOfBounds,
}

enum_impls!(StorageError => {
    IoError as Io,
});

impl From<StorageError> for TreeError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NoSpace => TreeError::NoSpace,
            _ => TreeError::Io,
        }
    }
}

impl PartialEq for StorageError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            (Self::BadMaster, Self::BadMaster)
            | (Self::BadSuper, Self::BadSuper)
            | (Self::BadChecksum, Self::BadChecksum)
            | (Self::NoSpace, Self::NoSpace)
            | (Self::BadJournal, Self::BadJournal)
            | (Self::OutOfBounds, Self::OutOfBounds) => true,
            _ => false,
        }
    }
}
