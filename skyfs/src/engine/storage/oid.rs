/*
 * Created on Wed Jan 24 2024
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
    parking_lot::Mutex,
};

pub type Oid = u64;

/// reserve 65k oids for internal use on both ends of the oid space.
/// There is no reason to be greedy here.
pub const OIDS_RESERVED: Oid = 1 << 16;

pub const ABSOLUTE_MIN_OID: Oid = 0;
pub const ABSOLUTE_MAX_OID: Oid = Oid::MAX;

#[derive(Debug)]
struct OidState {
    next_to_use: Oid,
    oids_in_use: u64,
}

#[derive(Debug)]
/// Monotone object id allocator
pub struct OidAllocator {
    s: Mutex<OidState>,
}

impl OidAllocator {
    /// state comes from the format super-block at mount
    pub fn new(nr_files: u64, next_oid: Oid) -> Self {
        Self {
            s: Mutex::new(OidState {
                next_to_use: next_oid.max(OIDS_RESERVED),
                oids_in_use: nr_files,
            }),
        }
    }
    /// oids still available to users
    pub fn free(&self) -> u64 {
        ABSOLUTE_MAX_OID - OIDS_RESERVED - self.s.lock().next_to_use
    }
    pub fn used(&self) -> u64 {
        self.s.lock().oids_in_use
    }
    pub fn next_oid(&self) -> Oid {
        self.s.lock().next_to_use
    }
    pub fn allocate(&self) -> StorageResult<Oid> {
        let mut s = self.s.lock();
        if s.next_to_use >= ABSOLUTE_MAX_OID - OIDS_RESERVED {
            return Err(StorageError::NoSpace);
        }
        let oid = s.next_to_use;
        s.next_to_use += 1;
        s.oids_in_use += 1;
        Ok(oid)
    }
    /// oids are not recycled; release only drops the usage count
    pub fn release(&self, _oid: Oid) {
        let mut s = self.s.lock();
        debug_assert!(s.oids_in_use > 0);
        s.oids_in_use -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{OidAllocator, OIDS_RESERVED};

    #[test]
    fn reserved_band_respected() {
        let a = OidAllocator::new(0, 0);
        let first = a.allocate().unwrap();
        assert_eq!(first, OIDS_RESERVED);
    }

    #[test]
    fn allocate_release_counts() {
        let a = OidAllocator::new(10, OIDS_RESERVED + 5);
        let o1 = a.allocate().unwrap();
        let o2 = a.allocate().unwrap();
        assert_eq!(o2, o1 + 1);
        assert_eq!(a.used(), 12);
        a.release(o1);
        assert_eq!(a.used(), 11);
        // monotone: released ids never come back
        assert_eq!(a.allocate().unwrap(), o2 + 1);
    }
}
