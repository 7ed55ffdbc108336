/*
 * Created on Mon Jan 22 2024
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

use {
    crate::engine::error::{StorageError, StorageResult},
    bytes::Bytes,
    parking_lot::RwLock,
};

/// A page-sized-block device. The engine consumes nothing else from the
/// I/O layer: read a block, write a block, flush the lot.
pub trait BlockDevice: Sync + Send {
    fn block_size(&self) -> usize;
    fn size_in_blocks(&self) -> u64;
    fn read_block(&self, block: u64) -> StorageResult<Bytes>;
    fn write_block(&self, block: u64, data: &[u8]) -> StorageResult<()>;
    fn sync(&self) -> StorageResult<()>;
}

/// An in-memory block device. Every storage test runs against one of
/// these instead of a real disk.
pub struct MemDisk {
    block_size: usize,
    blocks: RwLock<Vec<Option<Bytes>>>,
    writes: RwLock<u64>,
}

impl MemDisk {
    pub fn new(block_size: usize, nblocks: u64) -> Self {
        Self {
            block_size,
            blocks: RwLock::new(vec![None; nblocks as usize]),
            writes: RwLock::new(0),
        }
    }
    /// number of write_block calls, for tests asserting I/O batching
    pub fn write_count(&self) -> u64 {
        *self.writes.read()
    }
}

impl BlockDevice for MemDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }
    fn size_in_blocks(&self) -> u64 {
        self.blocks.read().len() as u64
    }
    fn read_block(&self, block: u64) -> StorageResult<Bytes> {
        let blocks = self.blocks.read();
        match blocks.get(block as usize) {
            Some(Some(data)) => Ok(data.clone()),
            // never written: all zeroes, like a fresh device
            Some(None) => Ok(Bytes::from(vec![0u8; self.block_size])),
            None => Err(StorageError::OutOfBounds),
        }
    }
    fn write_block(&self, block: u64, data: &[u8]) -> StorageResult<()> {
        if data.len() != self.block_size {
            return Err(StorageError::OutOfBounds);
        }
        let mut blocks = self.blocks.write();
        let slot = blocks
            .get_mut(block as usize)
            .ok_or(StorageError::OutOfBounds)?;
        *slot = Some(Bytes::copy_from_slice(data));
        *self.writes.write() += 1;
        Ok(())
    }
    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}
