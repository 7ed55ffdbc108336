/*
 * Created on Tue Jan 23 2024
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
    Two headers rule the disk:
    - the master super-block at a fixed byte offset, which identifies the
      volume and selects plugins
    - the per-format super-block one block later, which holds the mutable
      tree state (root, height, counters) and is checksummed

    All fields little-endian.
*/

use {
    crate::engine::{
        error::{StorageError, StorageResult},
        key::KeyScheme,
        node::FS40_NODE_ID,
        storage::blockdev::BlockDevice,
    },
    crc::{Crc, CRC_32_ISO_HDLC},
    uuid::Uuid,
};

/// byte offset of the master super-block on the device
pub const MASTER_OFFSET: u64 = 65536;
pub const MASTER_MAGIC: &[u8; 8] = b"SkyFS40\0";
pub const FORMAT_MAGIC: &[u8; 8] = b"SkyF40Fm";

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// block index of the master super-block
pub const fn master_block(block_size: usize) -> u64 {
    MASTER_OFFSET / block_size as u64
}
/// block index of the format super-block
pub const fn format_block(block_size: usize) -> u64 {
    master_block(block_size) + 1
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Identifies the volume and fixes the plugin set for its lifetime
pub struct MasterSuper {
    pub uuid: Uuid,
    pub block_size: u32,
    /// disk format plugin id
    pub format_plugin: u16,
    /// node layout plugin id
    pub node_plugin: u16,
    /// default item plugin id for file bodies
    pub item_plugin: u16,
    /// key comparison scheme
    pub key_scheme: KeyScheme,
}

impl MasterSuper {
    pub const DISK_SIZE: usize = 8 + 16 + 4 + 2 + 2 + 2 + 1;

    pub fn new(block_size: u32) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            block_size,
            format_plugin: 0x4000,
            node_plugin: FS40_NODE_ID,
            item_plugin: 0x20,
            key_scheme: KeyScheme::PlanA,
        }
    }

    pub fn encode(&self, block: &mut [u8]) {
        block[..8].copy_from_slice(MASTER_MAGIC);
        block[8..24].copy_from_slice(self.uuid.as_bytes());
        block[24..28].copy_from_slice(&self.block_size.to_le_bytes());
        block[28..30].copy_from_slice(&self.format_plugin.to_le_bytes());
        block[30..32].copy_from_slice(&self.node_plugin.to_le_bytes());
        block[32..34].copy_from_slice(&self.item_plugin.to_le_bytes());
        block[34] = self.key_scheme as u8;
    }

    pub fn decode(block: &[u8]) -> StorageResult<Self> {
        if &block[..8] != MASTER_MAGIC {
            return Err(StorageError::BadMaster);
        }
        let mut raw16 = [0u8; 16];
        raw16.copy_from_slice(&block[8..24]);
        let block_size = u32::from_le_bytes([block[24], block[25], block[26], block[27]]);
        if !block_size.is_power_of_two() || block_size < 512 {
            return Err(StorageError::BadMaster);
        }
        let key_scheme = match block[34] {
            0 => KeyScheme::PlanA,
            1 => KeyScheme::V35,
            _ => return Err(StorageError::BadMaster),
        };
        Ok(Self {
            uuid: Uuid::from_bytes(raw16),
            block_size,
            format_plugin: u16::from_le_bytes([block[28], block[29]]),
            node_plugin: u16::from_le_bytes([block[30], block[31]]),
            item_plugin: u16::from_le_bytes([block[32], block[33]]),
            key_scheme,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The mutable head of the filesystem: where the tree is and how much
/// of the device it has eaten
pub struct FormatSuper {
    pub block_count: u64,
    pub free_blocks: u64,
    pub root_block: u64,
    pub tree_height: u16,
    pub next_oid: u64,
    pub file_count: u64,
    /// completed flush generation
    pub flush_gen: u64,
}

impl FormatSuper {
    pub const DISK_SIZE: usize = 8 + 8 * 6 + 2 + 4;

    pub fn encode(&self, block: &mut [u8]) {
        block[..8].copy_from_slice(FORMAT_MAGIC);
        block[8..16].copy_from_slice(&self.block_count.to_le_bytes());
        block[16..24].copy_from_slice(&self.free_blocks.to_le_bytes());
        block[24..32].copy_from_slice(&self.root_block.to_le_bytes());
        block[32..34].copy_from_slice(&self.tree_height.to_le_bytes());
        block[34..42].copy_from_slice(&self.next_oid.to_le_bytes());
        block[42..50].copy_from_slice(&self.file_count.to_le_bytes());
        block[50..58].copy_from_slice(&self.flush_gen.to_le_bytes());
        let crc = CRC.checksum(&block[..58]);
        block[58..62].copy_from_slice(&crc.to_le_bytes());
    }

    pub fn decode(block: &[u8]) -> StorageResult<Self> {
        if &block[..8] != FORMAT_MAGIC {
            return Err(StorageError::BadSuper);
        }
        let stored = u32::from_le_bytes([block[58], block[59], block[60], block[61]]);
        if CRC.checksum(&block[..58]) != stored {
            return Err(StorageError::BadChecksum);
        }
        let r64 = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&block[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Ok(Self {
            block_count: r64(8),
            free_blocks: r64(16),
            root_block: r64(24),
            tree_height: u16::from_le_bytes([block[32], block[33]]),
            next_oid: r64(34),
            file_count: r64(42),
            flush_gen: r64(50),
        })
    }

    pub fn read_from(dev: &dyn BlockDevice) -> StorageResult<Self> {
        let raw = dev.read_block(format_block(dev.block_size()))?;
        Self::decode(&raw)
    }

    pub fn write_to(&self, dev: &dyn BlockDevice) -> StorageResult<()> {
        let mut block = vec![0u8; dev.block_size()];
        self.encode(&mut block);
        dev.write_block(format_block(dev.block_size()), &block)?;
        dev.sync()
    }
}

impl MasterSuper {
    pub fn read_from(dev: &dyn BlockDevice) -> StorageResult<Self> {
        let raw = dev.read_block(master_block(dev.block_size()))?;
        let master = Self::decode(&raw)?;
        if master.block_size as usize != dev.block_size() {
            return Err(StorageError::BadMaster);
        }
        Ok(master)
    }
    pub fn write_to(&self, dev: &dyn BlockDevice) -> StorageResult<()> {
        let mut block = vec![0u8; dev.block_size()];
        self.encode(&mut block);
        dev.write_block(master_block(dev.block_size()), &block)?;
        dev.sync()
    }
}
