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
    super::jnode::{jflags, Jnode},
    crate::engine::{
        error::{TreeError, TreeResult},
        key::{Key, MAX_KEY, MIN_KEY},
        sync::longterm::{LockMode, LockPri, LongTermLock},
    },
    parking_lot::{Mutex, RwLock},
    std::sync::{Arc, Weak},
};

#[derive(Default)]
/// Sibling web and parent hint. Mutated only while holding the tree
/// lock; the znodes themselves are owned by the tree's hash, so the
/// links stay weak.
pub struct ZLinks {
    pub left: Option<Weak<Znode>>,
    pub right: Option<Weak<Znode>>,
    pub parent: Option<Weak<Znode>>,
}

#[derive(Debug, Clone, Copy)]
pub struct DkPair {
    pub ld: Key,
    pub rd: Key,
}

impl Default for DkPair {
    fn default() -> Self {
        Self {
            ld: MIN_KEY,
            rd: MAX_KEY,
        }
    }
}

/// A formatted tree node: the generic jnode plus tree level, long-term
/// lock, sibling web and cached delimiting keys.
pub struct Znode {
    j: Jnode,
    level: u8,
    pub lock: LongTermLock,
    links: Mutex<ZLinks>,
    dk: RwLock<DkPair>,
}

impl Znode {
    pub fn new(block: u64, level: u8, flags: u32) -> Self {
        Self {
            j: Jnode::new(block, flags),
            level,
            lock: LongTermLock::new(),
            links: Mutex::new(ZLinks::default()),
            dk: RwLock::new(DkPair::default()),
        }
    }
    /// the generic part
    pub fn j(&self) -> &Jnode {
        &self.j
    }
    pub fn level(&self) -> u8 {
        self.level
    }
    pub fn block(&self) -> u64 {
        self.j.block()
    }

    /*
        sibling web (tree lock discipline)
    */

    pub fn left(&self) -> Option<Arc<Znode>> {
        self.links.lock().left.as_ref().and_then(Weak::upgrade)
    }
    pub fn right(&self) -> Option<Arc<Znode>> {
        self.links.lock().right.as_ref().and_then(Weak::upgrade)
    }
    pub fn parent(&self) -> Option<Arc<Znode>> {
        self.links.lock().parent.as_ref().and_then(Weak::upgrade)
    }
    pub fn set_left(&self, left: Option<&Arc<Znode>>) {
        self.links.lock().left = left.map(Arc::downgrade);
        self.j.set(jflags::LEFT_CONNECTED);
    }
    pub fn set_right(&self, right: Option<&Arc<Znode>>) {
        self.links.lock().right = right.map(Arc::downgrade);
        self.j.set(jflags::RIGHT_CONNECTED);
    }
    pub fn set_parent(&self, parent: Option<&Arc<Znode>>) {
        self.links.lock().parent = parent.map(Arc::downgrade);
    }
    pub fn is_left_connected(&self) -> bool {
        self.j.test(jflags::LEFT_CONNECTED)
    }
    pub fn is_right_connected(&self) -> bool {
        self.j.test(jflags::RIGHT_CONNECTED)
    }
    pub fn is_connected(&self) -> bool {
        self.is_left_connected() && self.is_right_connected()
    }

    /*
        delimiting keys (dk guard discipline for cross-node updates)
    */

    pub fn ld_key(&self) -> Key {
        self.dk.read().ld
    }
    pub fn rd_key(&self) -> Key {
        self.dk.read().rd
    }
    pub fn set_ld_key(&self, key: Key) {
        self.dk.write().ld = key;
    }
    pub fn set_rd_key(&self, key: Key) {
        self.dk.write().rd = key;
    }
    pub fn set_dk(&self, ld: Key, rd: Key) {
        let mut dk = self.dk.write();
        dk.ld = ld;
        dk.rd = rd;
    }
}

/// Unhook `node` from the sibling list prior to removal.
pub fn sibling_list_remove(node: &Arc<Znode>) {
    if !node.is_connected() {
        return;
    }
    let (left, right) = {
        let l = node.links.lock();
        (
            l.left.as_ref().and_then(Weak::upgrade),
            l.right.as_ref().and_then(Weak::upgrade),
        )
    };
    if let Some(r) = &right {
        r.links.lock().left = left.as_ref().map(Arc::downgrade);
    }
    if let Some(l) = &left {
        l.links.lock().right = right.as_ref().map(Arc::downgrade);
    }
    node.j.clear(jflags::LEFT_CONNECTED);
    node.j.clear(jflags::RIGHT_CONNECTED);
}

/// Insert `node` into the sibling list immediately right of `before`.
/// Regular balancing always adds new nodes on the right of a locked
/// existing one; `None` is the fresh-root case.
pub fn sibling_list_insert(node: &Arc<Znode>, before: Option<&Arc<Znode>>) {
    match before {
        Some(b) => {
            let right = b.links.lock().right.as_ref().and_then(Weak::upgrade);
            {
                let mut l = node.links.lock();
                l.left = Some(Arc::downgrade(b));
                l.right = right.as_ref().map(Arc::downgrade);
            }
            if let Some(r) = &right {
                r.links.lock().left = Some(Arc::downgrade(node));
            }
            b.links.lock().right = Some(Arc::downgrade(node));
        }
        None => {
            let mut l = node.links.lock();
            l.left = None;
            l.right = None;
        }
    }
    node.j.set(jflags::LEFT_CONNECTED);
    node.j.set(jflags::RIGHT_CONNECTED);
}

/// A held long-term lock on a znode. Dropping releases.
pub struct LockHandle {
    held: Option<(Arc<Znode>, LockMode)>,
}

impl LockHandle {
    pub const fn none() -> Self {
        Self { held: None }
    }
    pub fn is_none(&self) -> bool {
        self.held.is_none()
    }
    pub fn node(&self) -> &Arc<Znode> {
        match &self.held {
            Some((z, _)) => z,
            None => impossible!("empty lock handle dereferenced"),
        }
    }
    pub fn mode(&self) -> LockMode {
        match &self.held {
            Some((_, m)) => *m,
            None => impossible!("empty lock handle dereferenced"),
        }
    }
    /// release early (idempotent)
    pub fn done(&mut self) {
        if let Some((z, mode)) = self.held.take() {
            z.lock.release(mode);
        }
    }
    /// move the lock out of `other` into `self`
    pub fn take_from(&mut self, other: &mut LockHandle) {
        self.done();
        self.held = other.held.take();
    }
    /// replace this handle with a freshly acquired one
    pub fn set_from(&mut self, mut other: LockHandle) {
        self.done();
        self.held = other.held.take();
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.done();
    }
}

/// Acquire a long-term lock on `node`.
///
/// Fails with `NoNeighbor` when the node heard the banshee while we
/// were waiting: a node pending removal must not be relied upon.
pub fn longterm_lock(
    node: &Arc<Znode>,
    mode: LockMode,
    pri: LockPri,
    nonblock: bool,
) -> TreeResult<LockHandle> {
    node.lock.acquire(mode, pri, nonblock)?;
    if node.j().is_banshee() {
        node.lock.release(mode);
        return Err(TreeError::NoNeighbor);
    }
    Ok(LockHandle {
        held: Some((node.clone(), mode)),
    })
}
