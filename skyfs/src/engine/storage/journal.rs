/*
 * Created on Thu Jan 25 2024
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

/*
    The wander journal proper is a collaborator, not part of this core.
    What the core touches are the journal header and footer blocks at
    fixed positions inside the format: on mount they tell us the last
    committed tree state (replay itself happened before we got here),
    and on commit the footer is advanced. The record area layout between
    them is deliberately not specified here.
*/

use {
    super::{
        blockdev::BlockDevice,
        superblock::format_block,
    },
    crate::engine::error::{StorageError, StorageResult},
    crc::{Crc, CRC_32_ISO_HDLC},
};

pub const JOURNAL_HEADER_MAGIC: &[u8; 8] = b"SkyFJHdr";
pub const JOURNAL_FOOTER_MAGIC: &[u8; 8] = b"SkyFJFtr";

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const fn journal_header_block(block_size: usize) -> u64 {
    format_block(block_size) + 1
}
pub const fn journal_footer_block(block_size: usize) -> u64 {
    format_block(block_size) + 2
}
/// first block usable by the tree
pub const fn data_start_block(block_size: usize) -> u64 {
    journal_footer_block(block_size) + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The last committed tree state, as recorded by the journal footer
pub struct JournalRecord {
    /// commit sequence number
    pub sequence: u64,
    pub root_block: u64,
    pub tree_height: u16,
}

impl JournalRecord {
    fn encode(&self, magic: &[u8; 8], block: &mut [u8]) {
        block[..8].copy_from_slice(magic);
        block[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        block[16..24].copy_from_slice(&self.root_block.to_le_bytes());
        block[24..26].copy_from_slice(&self.tree_height.to_le_bytes());
        let crc = CRC.checksum(&block[..26]);
        block[26..30].copy_from_slice(&crc.to_le_bytes());
    }
    fn decode(magic: &[u8; 8], block: &[u8]) -> StorageResult<Self> {
        if &block[..8] != magic {
            return Err(StorageError::BadJournal);
        }
        let stored = u32::from_le_bytes([block[26], block[27], block[28], block[29]]);
        if CRC.checksum(&block[..26]) != stored {
            return Err(StorageError::BadChecksum);
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&block[8..16]);
        let sequence = u64::from_le_bytes(raw);
        raw.copy_from_slice(&block[16..24]);
        let root_block = u64::from_le_bytes(raw);
        Ok(Self {
            sequence,
            root_block,
            tree_height: u16::from_le_bytes([block[24], block[25]]),
        })
    }

    pub fn read_footer(dev: &dyn BlockDevice) -> StorageResult<Self> {
        let raw = dev.read_block(journal_footer_block(dev.block_size()))?;
        Self::decode(JOURNAL_FOOTER_MAGIC, &raw)
    }
    pub fn write_footer(&self, dev: &dyn BlockDevice) -> StorageResult<()> {
        let mut block = vec![0u8; dev.block_size()];
        self.encode(JOURNAL_FOOTER_MAGIC, &mut block);
        dev.write_block(journal_footer_block(dev.block_size()), &block)?;
        dev.sync()
    }
    pub fn read_header(dev: &dyn BlockDevice) -> StorageResult<Self> {
        let raw = dev.read_block(journal_header_block(dev.block_size()))?;
        Self::decode(JOURNAL_HEADER_MAGIC, &raw)
    }
    pub fn write_header(&self, dev: &dyn BlockDevice) -> StorageResult<()> {
        let mut block = vec![0u8; dev.block_size()];
        self.encode(JOURNAL_HEADER_MAGIC, &mut block);
        dev.write_block(journal_header_block(dev.block_size()), &block)?;
        dev.sync()
    }
}
