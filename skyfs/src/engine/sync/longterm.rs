/*
 * Created on Sat Jan 13 2024
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
    Long-term locks
    ---
    Unlike the short spinlock-class guards (tree lock, dk lock, znode
    state), a long-term lock is held across suspension points: block
    I/O and further lock acquisitions. Requests carry a priority.
    Balancing code acquires left-side locks at low priority; flush and
    search acquire at high priority. A blocked low-priority waiter
    yields as soon as a high-priority waiter arrives; that yield is the
    deadlock signal the carry restart machinery is built on.

    Acquisition is reentrant per thread, the way lock stacks make it in
    the original: flush holds the leftpoint write-locked while the
    squeeze's carry fixups lock the very same node as somebody's
    parent.
*/

use {
    crate::engine::error::{TreeError, TreeResult},
    parking_lot::{Condvar, Mutex},
    std::thread::{self, ThreadId},
};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum LockPri {
    /// right, down and parent acquisitions
    Hi,
    /// left acquisitions; yields to arriving hi-pri waiters
    Lo,
}

#[derive(Debug, Default)]
struct LtState {
    readers: u32,
    writer: Option<ThreadId>,
    write_depth: u32,
    hipri_waiters: u32,
}

impl LtState {
    fn grantable(&self, mode: LockMode, me: ThreadId) -> bool {
        match mode {
            LockMode::Read => match self.writer {
                None => true,
                // nested read under our own write lock
                Some(owner) => owner == me,
            },
            LockMode::Write => match self.writer {
                None => self.readers == 0,
                Some(owner) => owner == me,
            },
        }
    }
    fn grant(&mut self, mode: LockMode, me: ThreadId) {
        match mode {
            LockMode::Read => self.readers += 1,
            LockMode::Write => {
                self.writer = Some(me);
                self.write_depth += 1;
            }
        }
    }
}

#[derive(Default)]
/// A per-znode long-term read/write lock with priority classes
pub struct LongTermLock {
    s: Mutex<LtState>,
    cv: Condvar,
}

impl LongTermLock {
    pub fn new() -> Self {
        Self::default()
    }
    /// Acquire the lock.
    ///
    /// Returns `WouldBlock` for contended non-blocking requests and
    /// `Deadlock` when a blocked low-priority waiter must yield to a
    /// high-priority one.
    pub fn acquire(&self, mode: LockMode, pri: LockPri, nonblock: bool) -> TreeResult<()> {
        let me = thread::current().id();
        let mut s = self.s.lock();
        loop {
            if s.grantable(mode, me) {
                s.grant(mode, me);
                return Ok(());
            }
            if nonblock {
                return Err(TreeError::WouldBlock);
            }
            match pri {
                LockPri::Hi => {
                    s.hipri_waiters += 1;
                    // wake lo-pri waiters so they can notice us and yield
                    self.cv.notify_all();
                    self.cv.wait(&mut s);
                    s.hipri_waiters -= 1;
                }
                LockPri::Lo => {
                    if s.hipri_waiters > 0 {
                        return Err(TreeError::Deadlock);
                    }
                    self.cv.wait(&mut s);
                    if s.hipri_waiters > 0 {
                        return Err(TreeError::Deadlock);
                    }
                }
            }
        }
    }
    pub fn release(&self, mode: LockMode) {
        let mut s = self.s.lock();
        match mode {
            LockMode::Read => {
                debug_assert!(s.readers > 0);
                s.readers -= 1;
            }
            LockMode::Write => {
                debug_assert!(s.writer == Some(thread::current().id()));
                debug_assert!(s.write_depth > 0);
                s.write_depth -= 1;
                if s.write_depth == 0 {
                    s.writer = None;
                }
            }
        }
        drop(s);
        self.cv.notify_all();
    }
    pub fn is_wlocked(&self) -> bool {
        self.s.lock().writer.is_some()
    }
    pub fn is_locked(&self) -> bool {
        let s = self.s.lock();
        s.writer.is_some() || s.readers > 0
    }
}

#[cfg(test)]
mod tests {
    use super::{LockMode, LockPri, LongTermLock};
    use crate::engine::error::TreeError;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn rw_exclusion_across_threads() {
        let l = Arc::new(LongTermLock::new());
        l.acquire(LockMode::Read, LockPri::Hi, false).unwrap();
        l.acquire(LockMode::Read, LockPri::Hi, false).unwrap();
        {
            let l = l.clone();
            thread::spawn(move || {
                assert_eq!(
                    l.acquire(LockMode::Write, LockPri::Hi, true),
                    Err(TreeError::WouldBlock)
                );
            })
            .join()
            .unwrap();
        }
        l.release(LockMode::Read);
        l.release(LockMode::Read);
        l.acquire(LockMode::Write, LockPri::Hi, false).unwrap();
        {
            let l = l.clone();
            thread::spawn(move || {
                assert_eq!(
                    l.acquire(LockMode::Read, LockPri::Hi, true),
                    Err(TreeError::WouldBlock)
                );
            })
            .join()
            .unwrap();
        }
        l.release(LockMode::Write);
    }

    #[test]
    fn same_thread_reentry() {
        let l = LongTermLock::new();
        l.acquire(LockMode::Write, LockPri::Hi, false).unwrap();
        // carry may relock what flush already holds
        l.acquire(LockMode::Write, LockPri::Hi, false).unwrap();
        l.acquire(LockMode::Read, LockPri::Hi, false).unwrap();
        l.release(LockMode::Read);
        l.release(LockMode::Write);
        assert!(l.is_wlocked());
        l.release(LockMode::Write);
        assert!(!l.is_locked());
    }

    #[test]
    fn lopri_waiter_yields_to_hipri() {
        let l = Arc::new(LongTermLock::new());
        l.acquire(LockMode::Write, LockPri::Hi, false).unwrap();

        let lo = {
            let l = l.clone();
            thread::spawn(move || l.acquire(LockMode::Write, LockPri::Lo, false))
        };
        // let the lo-pri request block
        thread::sleep(Duration::from_millis(50));
        let hi = {
            let l = l.clone();
            thread::spawn(move || l.acquire(LockMode::Write, LockPri::Hi, false))
        };
        // the arriving hi-pri waiter must bounce the lo-pri one
        assert_eq!(lo.join().unwrap(), Err(TreeError::Deadlock));
        // and must itself get the lock once the holder releases
        l.release(LockMode::Write);
        hi.join().unwrap().unwrap();
        assert!(l.is_wlocked());
    }

    #[test]
    fn nonblock_never_sleeps() {
        let l = Arc::new(LongTermLock::new());
        l.acquire(LockMode::Write, LockPri::Hi, false).unwrap();
        {
            let l = l.clone();
            thread::spawn(move || {
                assert_eq!(
                    l.acquire(LockMode::Read, LockPri::Lo, true),
                    Err(TreeError::WouldBlock)
                );
            })
            .join()
            .unwrap();
        }
        l.release(LockMode::Write);
        l.acquire(LockMode::Read, LockPri::Lo, true).unwrap();
        l.release(LockMode::Read);
    }
}
