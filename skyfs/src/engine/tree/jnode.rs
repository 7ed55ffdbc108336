/*
 * Created on Fri Jan 26 2024
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
    crate::engine::{storage::fakeblock, txn::Atom},
    parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
    std::sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
};

/// jnode state bits
pub mod jflags {
    /// node content differs from disk
    pub const DIRTY: u32 = 1 << 0;
    /// allocation decided: node moves to a new location this atom
    pub const RELOC: u32 = 1 << 1;
    /// allocation decided: node overwrites its block in place
    pub const WANDER: u32 = 1 << 2;
    /// created this atom, never yet on disk
    pub const CREATED: u32 = 1 << 3;
    /// a data page, not a formatted tree node
    pub const UNFORMATTED: u32 = 1 << 4;
    /// scheduled for removal from the tree
    pub const HEARD_BANSHEE: u32 = 1 << 5;
    /// the left sibling pointer (or its absence) is confirmed
    pub const LEFT_CONNECTED: u32 = 1 << 6;
    /// the right sibling pointer (or its absence) is confirmed
    pub const RIGHT_CONNECTED: u32 = 1 << 7;
}

/// The generic in-memory node handle: disk address, state flags, atom
/// membership, and the page buffer. Formatted nodes embed one of these
/// in their znode.
pub struct Jnode {
    block: AtomicU64,
    flags: AtomicU32,
    atom: Mutex<Weak<Atom>>,
    /// owning object (unformatted nodes)
    oid: u64,
    /// page index within its mapping (unformatted nodes)
    index: u64,
    data: RwLock<Option<Box<[u8]>>>,
}

impl Jnode {
    pub fn new(block: u64, flags: u32) -> Self {
        Self {
            block: AtomicU64::new(block),
            flags: AtomicU32::new(flags),
            atom: Mutex::new(Weak::new()),
            oid: 0,
            index: 0,
            data: RwLock::new(None),
        }
    }
    pub fn new_unformatted(block: u64, oid: u64, index: u64) -> Self {
        Self {
            block: AtomicU64::new(block),
            flags: AtomicU32::new(jflags::UNFORMATTED),
            atom: Mutex::new(Weak::new()),
            oid,
            index,
            data: RwLock::new(None),
        }
    }
    pub fn oid(&self) -> u64 {
        self.oid
    }

    /*
        address
    */

    pub fn block(&self) -> u64 {
        self.block.load(Ordering::Acquire)
    }
    pub fn set_block(&self, block: u64) {
        self.block.store(block, Ordering::Release)
    }
    /// location finalized for this atom (a real device block)?
    pub fn is_allocated(&self) -> bool {
        !fakeblock::is_fake(self.block())
    }
    pub fn index(&self) -> u64 {
        self.index
    }

    /*
        flags
    */

    pub fn test(&self, bit: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }
    pub fn set(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }
    pub fn clear(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }
    pub fn is_dirty(&self) -> bool {
        self.test(jflags::DIRTY)
    }
    pub fn is_unformatted(&self) -> bool {
        self.test(jflags::UNFORMATTED)
    }
    pub fn is_banshee(&self) -> bool {
        self.test(jflags::HEARD_BANSHEE)
    }

    /*
        atom
    */

    pub fn atom(&self) -> Option<Arc<Atom>> {
        self.atom.lock().upgrade()
    }
    pub fn set_atom(&self, atom: Option<&Arc<Atom>>) {
        *self.atom.lock() = match atom {
            Some(a) => Arc::downgrade(a),
            None => Weak::new(),
        };
    }
    pub fn set_atom_weak(&self, atom: Weak<Atom>) {
        *self.atom.lock() = atom;
    }

    /*
        page data
    */

    pub fn is_loaded(&self) -> bool {
        self.data.read().is_some()
    }
    pub fn install_data(&self, buf: Box<[u8]>) {
        *self.data.write() = Some(buf);
    }
    pub fn drop_data(&self) {
        *self.data.write() = None;
    }
    /// borrow the page read-only; the node must be loaded
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.data.read(), |o| match o {
            Some(d) => &**d,
            None => impossible!("node data accessed while unloaded"),
        })
    }
    /// borrow the page for mutation; the node must be loaded
    pub fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.data.write(), |o| match o {
            Some(d) => &mut **d,
            None => impossible!("node data accessed while unloaded"),
        })
    }
}

/// A handle to either kind of node, the shape the atom and flush code
/// deal in
#[derive(Clone)]
pub enum JnodeRef {
    Z(Arc<super::znode::Znode>),
    U(Arc<Jnode>),
}

impl JnodeRef {
    pub fn j(&self) -> &Jnode {
        match self {
            Self::Z(z) => z.j(),
            Self::U(j) => j,
        }
    }
    pub fn as_znode(&self) -> Option<&Arc<super::znode::Znode>> {
        match self {
            Self::Z(z) => Some(z),
            Self::U(_) => None,
        }
    }
    pub fn level(&self) -> u8 {
        match self {
            Self::Z(z) => z.level(),
            Self::U(_) => super::LEAF_LEVEL,
        }
    }
    pub fn block(&self) -> u64 {
        self.j().block()
    }
}

/// are both nodes dirty members of the same atom?
pub fn same_atom_dirty(a: &Jnode, b: &Jnode) -> bool {
    if !a.is_dirty() || !b.is_dirty() {
        return false;
    }
    match (a.atom(), b.atom()) {
        (Some(x), Some(y)) => Arc::ptr_eq(&x, &y),
        _ => false,
    }
}
