/*
 * Created on Tue Jan 30 2024
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
    Carry
    ---
    Tree operations that delete from a node do not re-balance their
    vicinity immediately; balancing work is expressed as operations in
    a level-structured queue and executed in batches. Executing the
    operations of one level produces new operations for the level
    above; the loop repeats until a level produces nothing.

    A level remains `restartable' until the first mutation happens on
    it. Low-priority left-neighbor acquisition that loses to a
    contender returns the distinguished restart code, and the driver
    re-enters the whole level.
*/

pub mod ops;
#[cfg(test)]
mod tests;

use {
    crate::engine::{
        config::{CARRIES_POOL_SIZE, CBK_ITERATIONS_LIMIT, NODES_LOCKED_POOL_SIZE},
        coord::Coord,
        error::{TreeError, TreeResult},
        key::Key,
        node::{CutRange, ItemData},
        sync::longterm::{LockMode, LockPri},
        tree::{longterm_lock, LockHandle, Tree, Znode},
        txn::Atom,
    },
    std::sync::Arc,
};

/*
    carry operation flags
*/

/// never shift into the left neighbor
pub const COPI_DONT_SHIFT_LEFT: u32 = 1 << 0;
/// never shift into the right neighbor
pub const COPI_DONT_SHIFT_RIGHT: u32 = 1 << 1;
/// fail with `NoSpace` rather than allocating fresh nodes (flush)
pub const COPI_DONT_ALLOCATE: u32 = 1 << 2;
/// the insertion coord may travel into the left neighbor
pub const COPI_GO_LEFT: u32 = 1 << 3;
/// the insertion coord may travel into the right neighbor
pub const COPI_GO_RIGHT: u32 = 1 << 4;

/// keep the node in the tree even when the cut empties it
pub const DELETE_RETAIN_EMPTY: u32 = 1 << 8;
/// cut must fire kill hooks (data leaves the tree for good)
pub const DELETE_KILL: u32 = 1 << 9;

/// default flag sets, in the shape the original tuning picked
pub const INSERT_FLAGS: u32 = COPI_GO_LEFT;
pub const PASTE_FLAGS: u32 = COPI_GO_LEFT;
pub const NEW_NODE_FLAGS: u32 = COPI_GO_LEFT;

/// Bounded transient-record budget for one carry invocation. A single
/// carry rarely needs more than a handful of records; the cap turns a
/// runaway into a clean error instead of unbounded allocation.
pub struct CarryPool {
    ops_avail: usize,
    nodes_avail: usize,
}

impl CarryPool {
    /// three levels' worth of the classic 5+5 sizing
    pub fn new() -> Self {
        Self {
            ops_avail: CARRIES_POOL_SIZE * 3,
            nodes_avail: NODES_LOCKED_POOL_SIZE * 3,
        }
    }
    fn take_op(&mut self) -> TreeResult<()> {
        if self.ops_avail == 0 {
            return Err(TreeError::NoMemory);
        }
        self.ops_avail -= 1;
        Ok(())
    }
    fn take_node(&mut self) -> TreeResult<()> {
        if self.nodes_avail == 0 {
            return Err(TreeError::NoMemory);
        }
        self.nodes_avail -= 1;
        Ok(())
    }
    fn put_ops(&mut self, n: usize) {
        self.ops_avail += n;
    }
    fn put_nodes(&mut self, n: usize) {
        self.nodes_avail += n;
    }
}

impl Default for CarryPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One znode touched at this carry level
pub struct CarryNode {
    /// the reference node the op was posted against
    pub node: Arc<Znode>,
    /// ops through this entry apply to `node`'s *parent*
    pub parent: bool,
    /// the resolved, locked node ops actually touch
    pub real: Option<Arc<Znode>>,
    /// our lock on `real` (empty when borrowed or aliased)
    pub lh: LockHandle,
    /// lock owned by the caller or by another entry, do not release
    pub borrowed: bool,
    /// free space in this node may be used by later operations
    pub free: bool,
    /// migrate the user-supplied lock handle with the insertion point
    pub track: bool,
}

impl CarryNode {
    /// the node operations apply to; only valid after locking
    pub fn real(&self) -> &Arc<Znode> {
        match &self.real {
            Some(z) => z,
            None => impossible!("carry node used before lock_carry_node"),
        }
    }
}

/// How an insertion target position is addressed
#[derive(Debug, Clone)]
pub enum InsertAddr {
    /// direct key + item image
    ItemData { key: Key, data: ItemData },
    /// resolve the coord by exact-key lookup in the target
    ByKey { key: Key, data: ItemData },
    /// insert a pointer to a fresh child; resolved against the pointer
    /// to `brother` (the node the child was split off of)
    Child { child: u64, brother: u64 },
}

#[derive(Debug, Clone)]
pub struct InsertOp {
    pub addr: InsertAddr,
    /// insertion coord within the target node (resolved lazily)
    pub coord: Coord,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct FlowOp {
    pub key: Key,
    pub flow: Vec<u8>,
    /// bytes of the flow already in the tree
    pub written: usize,
    pub coord: Coord,
    pub new_nodes: usize,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct CutOp {
    pub range: CutRange,
    pub kill: bool,
    pub flags: u32,
}

/// The operation kinds of the carry queue
pub enum OpArgs {
    Insert(InsertOp),
    Paste(InsertOp),
    Extent(InsertOp),
    InsertFlow(FlowOp),
    /// drop the pointer to this entry's (emptied) reference node from
    /// its parent
    Delete {
        flags: u32,
    },
    Cut(CutOp),
    /// refresh the delimiting key of the target's slot in its parent;
    /// `left` is the in-memory left neighbor if the poster knew it
    Update {
        left: Option<Arc<Znode>>,
    },
    Modify,
}

pub struct CarryOp {
    /// index of the carry node this op targets
    pub node_idx: usize,
    pub args: OpArgs,
}

/// Tracking state for the caller's lock handle. Relocking happens only
/// after carry released its own locks, so retargeting is recorded here
/// and applied at the very end.
pub struct TrackCtx<'a> {
    pub handle: &'a mut LockHandle,
    pub retarget: Option<Arc<Znode>>,
}

/// An ordered list of carry nodes plus the operations to run on one
/// tree level
pub struct CarryLevel {
    pub level_no: u8,
    pub nodes: Vec<CarryNode>,
    pub ops: Vec<CarryOp>,
    /// no mutation has happened here yet
    pub restartable: bool,
}

impl CarryLevel {
    pub fn new(level_no: u8) -> Self {
        Self {
            level_no,
            nodes: Vec::new(),
            ops: Vec::new(),
            restartable: true,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
    /// find the entry whose locked node is `z`
    pub fn find_real(&self, z: &Arc<Znode>) -> Option<usize> {
        self.nodes
            .iter()
            .position(|cn| matches!(&cn.real, Some(r) if Arc::ptr_eq(r, z)))
    }
    /// add an already write-locked node owned by the caller
    pub fn add_borrowed(&mut self, pool: &mut CarryPool, node: Arc<Znode>, track: bool) -> TreeResult<usize> {
        pool.take_node()?;
        self.nodes.push(CarryNode {
            real: Some(node.clone()),
            node,
            parent: false,
            lh: LockHandle::none(),
            borrowed: true,
            free: false,
            track,
        });
        Ok(self.nodes.len() - 1)
    }
    /// add a node carry will lock itself
    pub fn add_node(
        &mut self,
        pool: &mut CarryPool,
        node: Arc<Znode>,
        parent: bool,
    ) -> TreeResult<usize> {
        pool.take_node()?;
        self.nodes.push(CarryNode {
            node,
            parent,
            real: None,
            lh: LockHandle::none(),
            borrowed: false,
            free: false,
            track: false,
        });
        Ok(self.nodes.len() - 1)
    }
    /// add a node we locked on the spot (neighbors, fresh nodes)
    pub fn add_locked(
        &mut self,
        pool: &mut CarryPool,
        lh: LockHandle,
        free: bool,
    ) -> TreeResult<usize> {
        pool.take_node()?;
        self.nodes.push(CarryNode {
            node: lh.node().clone(),
            parent: false,
            real: Some(lh.node().clone()),
            lh,
            borrowed: false,
            free,
            track: false,
        });
        Ok(self.nodes.len() - 1)
    }
    pub fn post_op(&mut self, pool: &mut CarryPool, op: CarryOp) -> TreeResult<()> {
        pool.take_op()?;
        self.ops.push(op);
        Ok(())
    }
    /// release every lock this level owns; caller-borrowed locks stay
    fn unlock_all(&mut self) {
        for cn in self.nodes.iter_mut() {
            if !cn.borrowed {
                cn.lh.done();
                cn.real = None;
            }
        }
    }
    fn teardown(mut self, pool: &mut CarryPool) {
        self.unlock_all();
        pool.put_nodes(self.nodes.len());
        pool.put_ops(self.ops.len());
    }
}

/// Resolve and lock the node a carry entry operates on. Parent entries
/// lock the parent of their reference node, growing the tree when the
/// reference node turns out to be the root.
fn lock_carry_node(
    tree: &Tree,
    atom: &Arc<Atom>,
    level: &mut CarryLevel,
    idx: usize,
) -> TreeResult<()> {
    if level.nodes[idx].real.is_some() {
        return Ok(());
    }
    if level.nodes[idx].parent {
        let child = level.nodes[idx].node.clone();
        // a fresh split sibling has no parent pointer yet; its left
        // brothers know where the parent level is
        let candidate = {
            let mut found = child.parent();
            let mut cur = child.left();
            let mut hops = 0usize;
            while found.is_none() && hops < crate::engine::config::CBK_ITERATIONS_LIMIT {
                match cur {
                    Some(n) => {
                        found = n.parent();
                        cur = n.left();
                    }
                    None => break,
                }
                hops += 1;
            }
            found
        };
        match candidate {
            Some(p) => {
                // alias an entry that already locked the same parent;
                // the lock stays owned by that entry
                if let Some(other) = level.find_real(&p) {
                    if other != idx {
                        level.nodes[idx].real = Some(p);
                        return Ok(());
                    }
                }
                let lh = longterm_lock(&p, LockMode::Write, LockPri::Hi, false)?;
                tree.zload(&p)?;
                level.nodes[idx].real = Some(p);
                level.nodes[idx].lh = lh;
            }
            None => {
                // no parent level exists: the tree must grow first
                let desc = tree.root_desc();
                if child.level() != desc.height {
                    return Err(TreeError::NoNeighbor);
                }
                let old_root = tree.zget(desc.block, desc.height, None);
                let new_root = tree.grow_root(&old_root, atom)?;
                child.set_parent(Some(&new_root));
                let lh = longterm_lock(&new_root, LockMode::Write, LockPri::Hi, false)?;
                level.nodes[idx].real = Some(new_root);
                level.nodes[idx].lh = lh;
            }
        }
    } else {
        let node = level.nodes[idx].node.clone();
        if let Some(other) = level.find_real(&node) {
            if other != idx {
                level.nodes[idx].real = Some(node);
                return Ok(());
            }
        }
        let lh = longterm_lock(&node, LockMode::Write, LockPri::Hi, false)?;
        tree.zload(lh.node())?;
        level.nodes[idx].real = Some(node);
        level.nodes[idx].lh = lh;
    }
    Ok(())
}

/// Run every operation in `doing`; each may post new operations into
/// the next level up. Loop until a level produces nothing.
pub fn carry(
    tree: &Tree,
    atom: &Arc<Atom>,
    mut doing: CarryLevel,
    track: Option<&mut LockHandle>,
    pool: &mut CarryPool,
) -> TreeResult<()> {
    let mut track = track.map(|handle| TrackCtx {
        handle,
        retarget: None,
    });
    while !doing.is_empty() {
        let mut todo = CarryLevel::new(doing.level_no + 1);
        let mut attempts = 0usize;
        // what a restart rolls back to: the posted entries and their
        // op bindings, before any neighbors joined
        let seed_nodes = doing.nodes.len();
        let seed_bindings: Vec<usize> = doing.ops.iter().map(|op| op.node_idx).collect();
        loop {
            attempts += 1;
            if attempts > CBK_ITERATIONS_LIMIT {
                log::warn!("carry level {} livelocked, giving up", doing.level_no);
                doing.teardown(pool);
                todo.teardown(pool);
                return Err(TreeError::Io);
            }
            match carry_on_level(tree, atom, &mut doing, &mut todo, pool, &mut track) {
                Ok(()) => break,
                Err(TreeError::Restart) | Err(TreeError::Deadlock) if doing.restartable => {
                    // release, forget the neighbors gathered so far,
                    // give the contender room, and re-enter this level
                    // from the top
                    doing.unlock_all();
                    let extra = doing.nodes.len() - seed_nodes;
                    doing.nodes.truncate(seed_nodes);
                    pool.put_nodes(extra);
                    for (op, &bound) in doing.ops.iter_mut().zip(&seed_bindings) {
                        op.node_idx = bound;
                    }
                    pool.put_nodes(todo.nodes.len());
                    pool.put_ops(todo.ops.len());
                    todo = CarryLevel::new(doing.level_no + 1);
                    std::thread::sleep(std::time::Duration::from_millis(attempts.min(10) as u64));
                    continue;
                }
                Err(e) => {
                    doing.teardown(pool);
                    todo.teardown(pool);
                    return Err(e);
                }
            }
        }
        doing.teardown(pool);
        doing = todo;
    }
    doing.teardown(pool);
    // with every carry lock released, the caller's handle can follow
    // the insertion point
    if let Some(tc) = track {
        if let Some(node) = tc.retarget {
            tc.handle.done();
            tc.handle
                .set_from(longterm_lock(&node, LockMode::Write, LockPri::Hi, false)?);
        }
    }
    Ok(())
}

fn carry_on_level(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    track: &mut Option<TrackCtx<'_>>,
) -> TreeResult<()> {
    // lock the nodes posted ahead of time; neighbors and fresh nodes
    // join pre-locked as the ops run
    for idx in 0..doing.nodes.len() {
        lock_carry_node(tree, atom, doing, idx)?;
    }
    let mut op_i = 0;
    while op_i < doing.ops.len() {
        ops::dispatch(tree, atom, doing, todo, pool, op_i, track)?;
        op_i += 1;
    }
    Ok(())
}

/*
    seeding API: these are what the tree-level calls use to enter the
    carry machine
*/

/// Insert `(key, data)` at `coord` inside the write-locked node behind
/// `lh`. The handle tracks the insertion point: after a split it ends
/// up locking whichever node the new item landed in.
pub fn insert_by_coord(
    tree: &Tree,
    atom: &Arc<Atom>,
    coord: &Coord,
    lh: &mut LockHandle,
    key: &Key,
    data: ItemData,
    flags: u32,
) -> TreeResult<()> {
    let mut pool = CarryPool::new();
    let node = lh.node().clone();
    let mut doing = CarryLevel::new(node.level());
    let idx = doing.add_borrowed(&mut pool, node, true)?;
    doing.nodes[idx].track = true;
    doing.post_op(
        &mut pool,
        CarryOp {
            node_idx: idx,
            args: OpArgs::Insert(InsertOp {
                addr: InsertAddr::ItemData {
                    key: *key,
                    data,
                },
                coord: *coord,
                flags: flags | INSERT_FLAGS,
            }),
        },
    )?;
    carry(tree, atom, doing, Some(lh), &mut pool)
}

/// Paste `data` into the existing item at `coord`.
pub fn paste_into_item(
    tree: &Tree,
    atom: &Arc<Atom>,
    coord: &Coord,
    lh: &mut LockHandle,
    key: &Key,
    data: ItemData,
    flags: u32,
) -> TreeResult<()> {
    let mut pool = CarryPool::new();
    let node = lh.node().clone();
    let mut doing = CarryLevel::new(node.level());
    let idx = doing.add_borrowed(&mut pool, node, true)?;
    doing.post_op(
        &mut pool,
        CarryOp {
            node_idx: idx,
            args: OpArgs::Paste(InsertOp {
                addr: InsertAddr::ItemData {
                    key: *key,
                    data,
                },
                coord: *coord,
                flags: flags | PASTE_FLAGS,
            }),
        },
    )?;
    carry(tree, atom, doing, Some(lh), &mut pool)
}

/// Insert an extent item for `key`. The op is seeded at the leaf the
/// key range borders on; carry shifts the leaf until the insertion
/// point is utmost and then places the extent one level up, on the
/// twig.
pub fn insert_extent(
    tree: &Tree,
    atom: &Arc<Atom>,
    coord: &Coord,
    lh: &mut LockHandle,
    key: &Key,
    data: ItemData,
    flags: u32,
) -> TreeResult<()> {
    let mut pool = CarryPool::new();
    let node = lh.node().clone();
    let mut doing = CarryLevel::new(node.level());
    let idx = doing.add_borrowed(&mut pool, node, true)?;
    doing.post_op(
        &mut pool,
        CarryOp {
            node_idx: idx,
            args: OpArgs::Extent(InsertOp {
                addr: InsertAddr::ByKey {
                    key: *key,
                    data,
                },
                coord: *coord,
                flags: flags | NEW_NODE_FLAGS,
            }),
        },
    )?;
    carry(tree, atom, doing, Some(lh), &mut pool)
}

/// Remove the unit range `[from, to]` within one write-locked node.
/// Posts UPDATE/DELETE operations upward as required.
pub fn cut_node(
    tree: &Tree,
    atom: &Arc<Atom>,
    range: CutRange,
    lh: &mut LockHandle,
    flags: u32,
) -> TreeResult<()> {
    let mut pool = CarryPool::new();
    let node = lh.node().clone();
    let mut doing = CarryLevel::new(node.level());
    let idx = doing.add_borrowed(&mut pool, node, false)?;
    doing.post_op(
        &mut pool,
        CarryOp {
            node_idx: idx,
            args: OpArgs::Cut(CutOp {
                range,
                kill: flags & DELETE_KILL != 0,
                flags,
            }),
        },
    )?;
    carry(tree, atom, doing, Some(lh), &mut pool)
}

/// Pack a byte flow into successive tail items starting at `coord`.
pub fn insert_flow(
    tree: &Tree,
    atom: &Arc<Atom>,
    coord: &Coord,
    lh: &mut LockHandle,
    key: &Key,
    flow: Vec<u8>,
    flags: u32,
) -> TreeResult<()> {
    let mut pool = CarryPool::new();
    let node = lh.node().clone();
    let mut doing = CarryLevel::new(node.level());
    let idx = doing.add_borrowed(&mut pool, node, true)?;
    doing.post_op(
        &mut pool,
        CarryOp {
            node_idx: idx,
            args: OpArgs::InsertFlow(FlowOp {
                key: *key,
                flow,
                written: 0,
                coord: *coord,
                new_nodes: 0,
                flags,
            }),
        },
    )?;
    carry(tree, atom, doing, Some(lh), &mut pool)
}

/// Upper bound of block pressure needed to complete `op`.
pub fn op_estimate(op: &OpArgs, tree: &Tree) -> u64 {
    use crate::engine::config::{FLOW_NEW_NODES_LIMIT, MAX_TREE_HEIGHT};
    match op {
        OpArgs::Insert(_) | OpArgs::Paste(_) | OpArgs::Extent(_) => {
            // two blocks at each level, plus a new root
            2 * (tree.height() as u64 + 1)
        }
        OpArgs::Delete { .. } | OpArgs::Cut(_) | OpArgs::Update { .. } | OpArgs::Modify => 0,
        OpArgs::InsertFlow(_) => ((FLOW_NEW_NODES_LIMIT + 1) * MAX_TREE_HEIGHT as usize) as u64,
    }
}
