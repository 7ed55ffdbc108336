/*
 * Created on Mon Feb 05 2024
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
    Leftward flush scan
    ---
    Starting from the node being flushed, walk left along its level as
    long as the neighbor is dirty, belongs to the same atom, and has no
    finalized location yet. Formatted runs follow sibling pointers;
    unformatted runs follow page indices; at the boundary of a run one
    step through the parent level finds the utmost child on the other
    side. The left boundary does not need to be precise, so the walk
    stops rather than blocks wherever certainty would cost a lock.
*/

use {
    super::jnode_lock_parent_coord,
    crate::engine::{
        coord::Side,
        error::{TreeError, TreeResult},
        node::{
            fs40::NodeView,
            items::{item_ops, ItemId},
        },
        sync::longterm::LockMode,
        tree::{jnode::JnodeRef, same_atom_dirty, Tree, LEAF_LEVEL},
        txn::Atom,
    },
    std::sync::Arc,
};

pub struct ScanResult {
    /// the leftmost node the scan accepted
    pub node: JnodeRef,
    /// how many nodes the scan accepted
    pub size: usize,
}

struct FlushScan<'a> {
    tree: &'a Tree,
    atom: &'a Arc<Atom>,
    maxnodes: usize,
    size: usize,
    stop: bool,
    node: JnodeRef,
}

impl<'a> FlushScan<'a> {
    fn finished(&self) -> bool {
        self.stop || self.size >= self.maxnodes
    }
    /// should the scan proceed onto `left`? Only while the neighbor is
    /// dirty, in the same atom, and its location for this atom is
    /// still undecided.
    fn goleft(&mut self, left: &JnodeRef) -> bool {
        let decided = left
            .j()
            .test(crate::engine::tree::jflags::RELOC | crate::engine::tree::jflags::WANDER);
        let go = !decided && same_atom_dirty(self.node.j(), left.j());
        if !go {
            self.stop = true;
        }
        go
    }
    fn set_current(&mut self, node: JnodeRef) {
        self.size += 1;
        self.node = node;
    }
    fn same_atom(&self, node: &JnodeRef) -> bool {
        match node.j().atom() {
            Some(a) => Arc::ptr_eq(&a, self.atom),
            None => false,
        }
    }

    /// follow sibling pointers along a formatted run
    fn scan_formatted(&mut self) -> TreeResult<()> {
        loop {
            let z = match self.node.as_znode() {
                Some(z) => z.clone(),
                None => return Ok(()),
            };
            let left = match z.left() {
                Some(l) => l,
                None => break,
            };
            let left_ref = JnodeRef::Z(left);
            if !self.goleft(&left_ref) {
                return Ok(());
            }
            self.set_current(left_ref);
            if self.finished() {
                return Ok(());
            }
        }
        // end of the linked run; at the leaf level an extent may
        // continue to the left
        if self.node.level() == LEAF_LEVEL && !self.finished() {
            return self.scan_using_parent();
        }
        self.stop = true;
        Ok(())
    }

    /// follow page indices along an unformatted run
    fn scan_extent(&mut self) -> TreeResult<()> {
        loop {
            let (oid, index) = match &self.node {
                JnodeRef::U(j) => (j.oid(), j.index()),
                JnodeRef::Z(_) => return Ok(()),
            };
            if index == 0 || self.finished() {
                break;
            }
            let left = match self.tree.page_jnode(oid, index - 1) {
                Some(j) => JnodeRef::U(j),
                None => {
                    self.stop = true;
                    return Ok(());
                }
            };
            if !self.goleft(&left) {
                return Ok(());
            }
            self.set_current(left);
        }
        if !self.finished() {
            return self.scan_using_parent();
        }
        self.stop = true;
        Ok(())
    }

    /// One step left through the parent level, descending to the
    /// utmost child on the other side of the run boundary.
    fn scan_using_parent(&mut self) -> TreeResult<()> {
        let parent = match jnode_lock_parent_coord(self.tree, &self.node, LockMode::Read) {
            Ok(Some(p)) => p,
            Ok(None) => {
                // the root has nothing to its left
                self.stop = true;
                return Ok(());
            }
            Err(TreeError::NotFound) | Err(TreeError::NoNeighbor) => {
                self.stop = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let (parent_lock, mut coord) = parent;
        let parent_z = parent_lock.node().clone();

        let stepped_out = {
            let data = parent_z.j().data();
            let view = NodeView::new(self.tree.env, &data);
            coord.prev_unit(&view)
        };
        let mut far_lock = crate::engine::tree::LockHandle::none();
        let host = if stepped_out {
            // leftmost in this parent: look through the parent's left
            // neighbor, without reading anything new into memory
            match crate::engine::tree::walk::get_left_neighbor(
                self.tree,
                &parent_z,
                LockMode::Read,
                crate::engine::tree::walk::gn::TRY_LOCK,
            ) {
                Ok(lh) => {
                    if !lh.node().j().is_loaded() {
                        self.stop = true;
                        return Ok(());
                    }
                    let data = lh.node().j().data();
                    let view = NodeView::new(self.tree.env, &data);
                    coord = crate::engine::coord::Coord::last_unit(&view);
                    drop(data);
                    far_lock = lh;
                    far_lock.node().clone()
                }
                Err(_) => {
                    self.stop = true;
                    return Ok(());
                }
            }
        } else {
            parent_z.clone()
        };

        // utmost right child of the unit to the left
        let child = {
            let data = host.j().data();
            let Some(id) = ItemId::from_raw(self.tree.layout.item_id_at(&data, coord.item_pos))
            else {
                return Err(TreeError::Io);
            };
            let body = self.tree.layout.item_body(&data, coord.item_pos);
            match id {
                ItemId::Internal => item_ops(id)
                    .down_link(body)
                    .and_then(|b| self.tree.zlook(b))
                    .map(JnodeRef::Z),
                ItemId::Extent => {
                    // rightmost page of the rightmost run
                    let key = self.tree.layout.key_at(&data, coord.item_pos);
                    let total = crate::engine::node::items::ExtentItem::width_sum(body);
                    let first_index = key.offset() / self.tree.env.block_size as u64;
                    if total == 0 {
                        None
                    } else {
                        self.tree
                            .page_jnode(key.objectid(), first_index + total - 1)
                            .map(JnodeRef::U)
                    }
                }
                ItemId::Tail => {
                    let _ = item_ops(id).utmost_child_block(body, Side::Right);
                    None
                }
            }
        };
        match child {
            Some(c) => {
                if self.goleft(&c) {
                    self.set_current(c);
                }
            }
            None => {
                // the child is not in memory: the boundary is here
                self.stop = true;
            }
        }
        Ok(())
    }
}

/// Scan leftward from `start`, capped at `maxnodes` accepted nodes.
pub fn scan_left(
    tree: &Tree,
    atom: &Arc<Atom>,
    start: JnodeRef,
    maxnodes: usize,
) -> TreeResult<ScanResult> {
    let mut scan = FlushScan {
        tree,
        atom,
        maxnodes,
        size: 1,
        stop: false,
        node: start,
    };
    if !scan.same_atom(&scan.node.clone()) {
        // the caller's node must already belong to the atom
        return Ok(ScanResult {
            node: scan.node,
            size: 1,
        });
    }
    while !scan.finished() {
        let unformatted = scan.node.j().is_unformatted();
        if unformatted {
            scan.scan_extent()?;
        } else {
            scan.scan_formatted()?;
        }
    }
    Ok(ScanResult {
        node: scan.node,
        size: scan.size,
    })
}
