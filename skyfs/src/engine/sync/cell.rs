/*
 * Created on Fri Jan 12 2024
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
    super::atm::{cpin, upin, Atomic, Owned, ORD_REL},
    parking_lot::Mutex,
};

/// A [`TMCell`] provides atomic reads and serialized writes; the `static`
/// is a CB hack.
///
/// The tree keeps its root descriptor in one of these so that readers
/// never take the tree lock just to learn where the root is.
pub struct TMCell<T: 'static> {
    a: Atomic<T>,
    g: Mutex<()>,
}

impl<T: 'static> TMCell<T> {
    pub fn new(v: T) -> Self {
        Self {
            a: Atomic::new_alloc(v),
            g: Mutex::new(()),
        }
    }
    /// Read the current snapshot. Fast path, lock free.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let g = cpin();
        let snapshot = self.a.ld_acq(&g);
        let data: &T = unsafe {
            // UNSAFE(@ohsayan): non-null (TMCell is never null) and the guard
            snapshot.deref()
        };
        f(data)
    }
    /// Publish a new snapshot. Writers are serialized against each other;
    /// readers continue on the old snapshot until the swap is visible.
    pub fn publish(&self, new: T) {
        let wg = self.g.lock();
        let g = cpin();
        let old = self.a.ld_acq(&g);
        self.a.store(Owned::new(new), ORD_REL);
        unsafe {
            // UNSAFE(@ohsayan): unlinked above, nobody can load it again
            g.defer_destroy(old);
        }
        drop(wg);
    }
    /// Read-modify-publish under the writer lock.
    pub fn update<R>(&self, f: impl FnOnce(&T) -> (T, R)) -> R {
        let wg = self.g.lock();
        let g = cpin();
        let old = self.a.ld_acq(&g);
        let cur: &T = unsafe {
            // UNSAFE(@ohsayan): non-null and the guard
            old.deref()
        };
        let (new, ret) = f(cur);
        self.a.store(Owned::new(new), ORD_REL);
        unsafe {
            // UNSAFE(@ohsayan): unlinked above
            g.defer_destroy(old);
        }
        drop(wg);
        ret
    }
}

impl<T: Copy + 'static> TMCell<T> {
    pub fn read_copy(&self) -> T {
        self.read(|v| *v)
    }
}

impl<T> Drop for TMCell<T> {
    fn drop(&mut self) {
        unsafe {
            // UNSAFE(@ohsayan): sole owner with mutable access
            let g = upin();
            let shptr = self.a.ld_rlx(g);
            g.defer_destroy(shptr);
        }
    }
}
