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

/*
    Block bitmap allocator
    ---
    Two bitmaps: the working map reflects every allocation the moment it
    is made, so an in-flight atom can never hand a block out twice. The
    commit map is the state the next committed generation will see.
    Deletions are deferred: a deleted block leaves the commit map at
    prepare_commit and only becomes reusable (cleared in the working
    map) at done_writeback, after the atom's wander set is safely on
    disk.
*/

use {
    crate::engine::error::{StorageError, StorageResult},
    parking_lot::Mutex,
};

#[derive(Debug)]
struct Maps {
    working: Vec<u8>,
    commit: Vec<u8>,
    free: u64,
}

impl Maps {
    fn get(map: &[u8], bit: u64) -> bool {
        map[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }
    fn set(map: &mut [u8], bit: u64) {
        map[(bit / 8) as usize] |= 1 << (bit % 8);
    }
    fn clear(map: &mut [u8], bit: u64) {
        map[(bit / 8) as usize] &= !(1 << (bit % 8));
    }
}

#[derive(Debug)]
pub struct BitmapAllocator {
    nblocks: u64,
    m: Mutex<Maps>,
}

impl BitmapAllocator {
    /// a fresh allocator; `reserved` ranges (superblocks, journal) are
    /// pre-marked in both maps
    pub fn new(nblocks: u64, reserved: &[(u64, u64)]) -> Self {
        let bytes = crate::util::div_ceil(nblocks as usize, 8);
        let mut working = vec![0u8; bytes];
        let mut taken = 0u64;
        for &(start, len) in reserved {
            for b in start..start + len {
                if !Maps::get(&working, b) {
                    Maps::set(&mut working, b);
                    taken += 1;
                }
            }
        }
        let commit = working.clone();
        Self {
            nblocks,
            m: Mutex::new(Maps {
                working,
                commit,
                free: nblocks - taken,
            }),
        }
    }

    pub fn free_blocks(&self) -> u64 {
        self.m.lock().free
    }

    pub fn is_allocated(&self, block: u64) -> bool {
        Maps::get(&self.m.lock().working, block)
    }

    /// Search `[*start, end)` for a free run of at least `min_len`
    /// blocks, claim up to `max_len` of them, write the run start back
    /// through `start` and return the claimed length (0 if nothing
    /// found).
    pub fn alloc(&self, start: &mut u64, end: u64, min_len: u64, max_len: u64) -> u64 {
        debug_assert!(min_len > 0 && min_len <= max_len);
        let end = end.min(self.nblocks);
        let mut m = self.m.lock();
        let mut run_start = *start;
        let mut run_len = 0u64;
        let mut b = *start;
        while b < end {
            if Maps::get(&m.working, b) {
                run_start = b + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == max_len {
                    break;
                }
            }
            b += 1;
        }
        if run_len < min_len {
            return 0;
        }
        for blk in run_start..run_start + run_len {
            Maps::set(&mut m.working, blk);
        }
        m.free -= run_len;
        *start = run_start;
        run_len
    }

    /// The one allocation entry point flush uses: search from `*start`
    /// toward the end of the device, then wrap to `[0, *start)`. On
    /// success the run start and actual length (>= 1, <= requested) are
    /// written back.
    pub fn alloc_blocks(&self, start: &mut u64, len: &mut u64) -> StorageResult<()> {
        debug_assert!(*len > 0);
        let want = *len;
        let hint = (*start).min(self.nblocks);
        let mut at = hint;
        let mut got = self.alloc(&mut at, self.nblocks, 1, want);
        if got == 0 {
            at = 0;
            got = self.alloc(&mut at, hint, 1, want);
        }
        if got == 0 {
            return Err(StorageError::NoSpace);
        }
        *start = at;
        *len = got;
        Ok(())
    }

    /// claim one specific block (journal replay, reserved structures)
    pub fn mark_allocated(&self, block: u64) {
        let mut m = self.m.lock();
        if !Maps::get(&m.working, block) {
            Maps::set(&mut m.working, block);
            m.free -= 1;
        }
    }

    /// immediately release one specific block. Regular deletion goes
    /// through the atom's deferred delete set instead.
    pub fn mark_deleted(&self, block: u64) {
        let mut m = self.m.lock();
        if Maps::get(&m.working, block) {
            Maps::clear(&mut m.working, block);
            m.free += 1;
        }
    }

    /*
        commit-time hooks, driven by the transaction manager
    */

    /// stage the atom's outcome into the commit map: allocations become
    /// permanent, deleted blocks leave the committed state
    pub fn prepare_commit(&self, deleted: &[(u64, u64)]) {
        let mut m = self.m.lock();
        let working = m.working.clone();
        m.commit.copy_from_slice(&working);
        for &(start, len) in deleted {
            for b in start..start + len {
                Maps::clear(&mut m.commit, b);
            }
        }
    }

    /// the commit record is durable; nothing to undo anymore
    pub fn done_commit(&self) {}

    /// writeback finished: deleted blocks become reusable in the
    /// working map
    pub fn done_writeback(&self, deleted: &[(u64, u64)]) {
        let mut m = self.m.lock();
        for &(start, len) in deleted {
            for b in start..start + len {
                if Maps::get(&m.working, b) {
                    Maps::clear(&mut m.working, b);
                    m.free += 1;
                }
            }
        }
    }
}
