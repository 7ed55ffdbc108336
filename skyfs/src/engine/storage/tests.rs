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

use super::{
    blockdev::{BlockDevice, MemDisk},
    journal::{journal_footer_block, JournalRecord},
    superblock::{format_block, master_block, FormatSuper, MasterSuper},
};
use crate::engine::error::StorageError;

#[test]
fn memdisk_bounds() {
    let disk = MemDisk::new(512, 8);
    assert_eq!(disk.block_size(), 512);
    assert_eq!(disk.size_in_blocks(), 8);
    // unwritten blocks read as zeroes
    assert!(disk.read_block(3).unwrap().iter().all(|b| *b == 0));
    assert_eq!(disk.read_block(8).unwrap_err(), StorageError::OutOfBounds);
    assert_eq!(
        disk.write_block(9, &[0u8; 512]).unwrap_err(),
        StorageError::OutOfBounds
    );
    // short writes are refused
    assert_eq!(
        disk.write_block(1, &[0u8; 100]).unwrap_err(),
        StorageError::OutOfBounds
    );
    disk.write_block(1, &[7u8; 512]).unwrap();
    assert_eq!(disk.read_block(1).unwrap()[0], 7);
    assert_eq!(disk.write_count(), 1);
}

#[test]
fn master_super_roundtrip() {
    let disk = MemDisk::new(4096, 64);
    let master = MasterSuper::new(4096);
    master.write_to(&disk).unwrap();
    let read = MasterSuper::read_from(&disk).unwrap();
    assert_eq!(read, master);
    assert_eq!(master_block(4096), 16);
    assert_eq!(format_block(4096), 17);
}

#[test]
fn master_super_rejects_noise() {
    let disk = MemDisk::new(4096, 64);
    // nothing there
    assert_eq!(
        MasterSuper::read_from(&disk).unwrap_err(),
        StorageError::BadMaster
    );
    // block size mismatch between device and record
    let master = MasterSuper::new(512);
    let mut block = vec![0u8; 4096];
    master.encode(&mut block);
    disk.write_block(master_block(4096), &block).unwrap();
    assert_eq!(
        MasterSuper::read_from(&disk).unwrap_err(),
        StorageError::BadMaster
    );
}

#[test]
fn format_super_roundtrip_and_crc() {
    let disk = MemDisk::new(4096, 64);
    let format = FormatSuper {
        block_count: 64,
        free_blocks: 40,
        root_block: 20,
        tree_height: 3,
        next_oid: 1 << 16,
        file_count: 5,
        flush_gen: 9,
    };
    format.write_to(&disk).unwrap();
    assert_eq!(FormatSuper::read_from(&disk).unwrap(), format);

    // flip one byte: the checksum must catch it
    let mut raw = disk.read_block(format_block(4096)).unwrap().to_vec();
    raw[20] ^= 1;
    disk.write_block(format_block(4096), &raw).unwrap();
    assert_eq!(
        FormatSuper::read_from(&disk).unwrap_err(),
        StorageError::BadChecksum
    );
}

#[test]
fn journal_record_roundtrip() {
    let disk = MemDisk::new(4096, 64);
    let rec = JournalRecord {
        sequence: 4,
        root_block: 33,
        tree_height: 2,
    };
    rec.write_footer(&disk).unwrap();
    rec.write_header(&disk).unwrap();
    assert_eq!(JournalRecord::read_footer(&disk).unwrap(), rec);
    assert_eq!(JournalRecord::read_header(&disk).unwrap(), rec);

    // header and footer magics are not interchangeable
    let raw = disk.read_block(journal_footer_block(4096)).unwrap();
    disk.write_block(super::journal::journal_header_block(4096), &raw)
        .unwrap();
    assert_eq!(
        JournalRecord::read_header(&disk).unwrap_err(),
        StorageError::BadJournal
    );
}
