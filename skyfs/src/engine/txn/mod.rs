/*
 * Created on Fri Feb 02 2024
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
    Atoms
    ---
    An atom is a set of dirty nodes that commit together. Dirtying a
    node captures it into the current atom; touching nodes of two
    different atoms fuses them. Once an atom enters the commit-prepared
    stage its operations are replayed-on-restart, never aborted.
*/

use {
    crate::{
        engine::{
            config::{EngineConfig, MAX_TREE_HEIGHT},
            error::TreeResult,
            tree::{jnode::JnodeRef, Jnode, Tree, Znode},
        },
        util::unix_now_millis,
    },
    parking_lot::{Condvar, Mutex},
    std::{
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Weak,
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
#[repr(u8)]
/// Atom lifecycle stages, strictly forward-moving
pub enum AtomStage {
    /// accepting captures
    Open = 0,
    /// flush is staging the atom's nodes
    Capturing = 1,
    /// no new members; allocator state staged
    CommitPrepared = 2,
    /// commit record durable
    Committed = 3,
    /// overwrite set going to its home locations
    Writeback = 4,
    /// everything durable, members released
    Done = 5,
}

struct AtomInner {
    stage: AtomStage,
    /// captured dirty nodes, one list per tree level
    dirty: Vec<Vec<JnodeRef>>,
    /// processed (clean, allocated) members awaiting writeback
    clean: Vec<JnodeRef>,
    /// deferred block deallocations
    deleted: Vec<(u64, u64)>,
    birth_ms: u64,
}

/// An in-progress transaction: the set of nodes that must reach disk
/// together.
pub struct Atom {
    id: u64,
    /// handle to ourselves for the backlinks captured nodes keep
    me: Weak<Atom>,
    inner: Mutex<AtomInner>,
}

impl Atom {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            inner: Mutex::new(AtomInner {
                stage: AtomStage::Open,
                dirty: (0..=MAX_TREE_HEIGHT as usize).map(|_| Vec::new()).collect(),
                clean: Vec::new(),
                deleted: Vec::new(),
                birth_ms: unix_now_millis(),
            }),
        })
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn stage(&self) -> AtomStage {
        self.inner.lock().stage
    }
    pub fn set_stage(&self, stage: AtomStage) {
        let mut inner = self.inner.lock();
        debug_assert!(stage >= inner.stage);
        inner.stage = stage;
    }
    pub fn age_ms(&self) -> u64 {
        unix_now_millis().saturating_sub(self.inner.lock().birth_ms)
    }

    /*
        capture
    */

    /// capture a dirty formatted node; fuses atoms when the node
    /// already belongs elsewhere
    pub fn capture_formatted(&self, z: &Arc<Znode>) {
        self.capture(JnodeRef::Z(z.clone()));
    }
    pub fn capture_unformatted(&self, j: &Arc<Jnode>) {
        self.capture(JnodeRef::U(j.clone()));
    }
    pub fn capture(&self, node: JnodeRef) {
        if let Some(existing) = node.j().atom() {
            if Arc::as_ptr(&existing) == self as *const Atom {
                return;
            }
            // two atoms touched one node: they commit together now
            self.fuse(&existing);
        }
        node.j().set_atom_weak(self.me.clone());
        let level = node.level() as usize;
        let mut inner = self.inner.lock();
        debug_assert!(inner.stage <= AtomStage::Capturing);
        let list = &mut inner.dirty[level];
        if !list.iter().any(|n| n.block() == node.block()) {
            list.push(node);
        }
    }

    /// merge every member of `other` into `self`
    pub fn fuse(&self, other: &Arc<Atom>) {
        if Arc::as_ptr(other) == self as *const Atom {
            return;
        }
        log::debug!("fusing atom {} into atom {}", other.id, self.id);
        let (dirty, clean, deleted) = {
            let mut o = other.inner.lock();
            o.stage = AtomStage::Done;
            (
                core::mem::take(&mut o.dirty),
                core::mem::take(&mut o.clean),
                core::mem::take(&mut o.deleted),
            )
        };
        let mut inner = self.inner.lock();
        for (level, list) in dirty.into_iter().enumerate() {
            for node in list {
                node.j().set_atom_weak(self.me.clone());
                if !inner.dirty[level].iter().any(|n| n.block() == node.block()) {
                    inner.dirty[level].push(node);
                }
            }
        }
        for node in clean {
            node.j().set_atom_weak(self.me.clone());
            inner.clean.push(node);
        }
        inner.deleted.extend(deleted);
    }

    /// a processed member moved from the dirty lists to the clean set
    pub fn mark_clean(&self, node: &JnodeRef) {
        let mut inner = self.inner.lock();
        let level = node.level() as usize;
        if let Some(at) = inner.dirty[level]
            .iter()
            .position(|n| n.block() == node.block())
        {
            let n = inner.dirty[level].remove(at);
            if !inner.clean.iter().any(|c| c.block() == n.block()) {
                inner.clean.push(n);
            }
        }
    }

    /// drop a member entirely (its node left the tree)
    pub fn forget(&self, block: u64) {
        let mut inner = self.inner.lock();
        for list in inner.dirty.iter_mut() {
            list.retain(|n| n.block() != block);
        }
        inner.clean.retain(|n| n.block() != block);
    }

    /// record blocks whose deallocation waits for commit
    pub fn defer_delete(&self, start: u64, len: u64) {
        if len > 0 {
            self.inner.lock().deleted.push((start, len));
        }
    }

    /*
        introspection for flush and commit
    */

    pub fn dirty_count_at(&self, level: u8) -> usize {
        self.inner.lock().dirty[level as usize].len()
    }
    pub fn dirty_at(&self, level: u8) -> Vec<JnodeRef> {
        self.inner.lock().dirty[level as usize].clone()
    }
    pub fn captured(&self) -> usize {
        let inner = self.inner.lock();
        inner.dirty.iter().map(Vec::len).sum::<usize>() + inner.clean.len()
    }
    pub fn deleted_runs(&self) -> Vec<(u64, u64)> {
        self.inner.lock().deleted.clone()
    }
    pub fn clean_members(&self) -> Vec<JnodeRef> {
        self.inner.lock().clean.clone()
    }
    /// release all members after writeback
    pub fn dissolve(&self) {
        let mut inner = self.inner.lock();
        inner.stage = AtomStage::Done;
        for list in inner.dirty.iter_mut() {
            for n in list.drain(..) {
                n.j().set_atom_weak(Weak::new());
            }
        }
        for n in inner.clean.drain(..) {
            n.j().set_atom_weak(Weak::new());
        }
    }
}

/// The transaction manager: hands out the current atom and runs the
/// commit daemon.
pub struct TxnMgr {
    next_id: AtomicU64,
    me: Weak<TxnMgr>,
    current: Mutex<Option<Arc<Atom>>>,
    cfg: EngineConfig,
    daemon: Mutex<Option<JoinHandle<()>>>,
    wakeup: Arc<(Mutex<bool>, Condvar)>,
}

impl TxnMgr {
    pub fn new(cfg: EngineConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            next_id: AtomicU64::new(1),
            me: me.clone(),
            current: Mutex::new(None),
            cfg,
            daemon: Mutex::new(None),
            wakeup: Arc::new((Mutex::new(false), Condvar::new())),
        })
    }

    /// the open atom new work captures into
    pub fn current_atom(&self) -> Arc<Atom> {
        let mut cur = self.current.lock();
        match cur.as_ref() {
            Some(a) if a.stage() == AtomStage::Open => a.clone(),
            _ => {
                let a = Atom::new(self.next_id.fetch_add(1, Ordering::Relaxed));
                *cur = Some(a.clone());
                a
            }
        }
    }

    /// captured-size soft trigger: should the caller commit early?
    pub fn over_budget(&self, atom: &Atom) -> bool {
        self.cfg.atom_max_size != 0 && atom.captured() > self.cfg.atom_max_size
    }

    /// Commit the current atom: flush every member, stage the
    /// allocator, write the commit record, write back, dissolve.
    pub fn commit_current(&self, tree: &Tree) -> TreeResult<u64> {
        let atom = {
            let mut cur = self.current.lock();
            match cur.take() {
                Some(a) => a,
                None => return Ok(0),
            }
        };
        self.commit_atom(tree, &atom)?;
        Ok(atom.id())
    }

    pub fn commit_atom(&self, tree: &Tree, atom: &Arc<Atom>) -> TreeResult<()> {
        log::debug!(
            "committing atom {} with {} captured nodes",
            atom.id(),
            atom.captured()
        );
        atom.set_stage(AtomStage::Capturing);
        crate::engine::flush::flush_atom(tree, atom)?;

        atom.set_stage(AtomStage::CommitPrepared);
        let deleted = atom.deleted_runs();
        tree.alloc.prepare_commit(&deleted);

        atom.set_stage(AtomStage::Committed);
        tree.alloc.done_commit();
        let gen = atom.id();
        tree.write_format_super(tree.oids.next_oid(), tree.oids.used(), gen)?;

        atom.set_stage(AtomStage::Writeback);
        crate::engine::flush::writeback_atom(tree, atom)?;
        tree.alloc.done_writeback(&deleted);

        atom.dissolve();
        Ok(())
    }

    /*
        the commit daemon
    */

    /// Background thread that wakes on a timer (or an explicit kick)
    /// and force-commits atoms that grew too old.
    pub fn start_daemon(&self, tree: Arc<Tree>) {
        let Some(mgr) = self.me.upgrade() else {
            return;
        };
        let wakeup = self.wakeup.clone();
        let tick = Duration::from_millis(self.cfg.txnmgr_tick_ms.max(1));
        let max_age = self.cfg.atom_max_age_ms;
        let handle = thread::Builder::new()
            .name("skyfs-txnmgrd".into())
            .spawn(move || {
                let (stop_lock, cv) = &*wakeup;
                loop {
                    {
                        let mut stop = stop_lock.lock();
                        if *stop {
                            break;
                        }
                        cv.wait_for(&mut stop, tick);
                        if *stop {
                            break;
                        }
                    }
                    let stale = {
                        let cur = mgr.current.lock();
                        match cur.as_ref() {
                            Some(a) if a.age_ms() >= max_age => true,
                            _ => false,
                        }
                    };
                    if stale {
                        if let Err(e) = mgr.commit_current(&tree) {
                            log::error!("daemon commit failed: {e:?}");
                        }
                    }
                }
            })
            .expect("failed to spawn txnmgrd");
        *self.daemon.lock() = Some(handle);
    }

    pub fn kick_daemon(&self) {
        self.wakeup.1.notify_all();
    }

    pub fn stop_daemon(&self) {
        {
            let (stop_lock, cv) = &*self.wakeup;
            *stop_lock.lock() = true;
            cv.notify_all();
        }
        if let Some(h) = self.daemon.lock().take() {
            let _ = h.join();
        }
    }
}

impl Drop for TxnMgr {
    fn drop(&mut self) {
        // the daemon thread holds a weak wakeup channel only; make sure
        // it is gone before the config goes away
        {
            let (stop_lock, cv) = &*self.wakeup;
            *stop_lock.lock() = true;
            cv.notify_all();
        }
        if let Some(h) = self.daemon.lock().take() {
            let _ = h.join();
        }
    }
}
