/*
 * Created on Sun Jan 28 2024
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
    Sibling web maintenance
    ---
    Every znode tracks a two-bit `connected' state per side: we never
    search the hash for a neighbor from a connected side, even when the
    pointer is null (null on a connected side means the neighbor is
    confirmed absent). Hash searches only happen when a fresh znode
    must be wired into the web, and that walk may climb the tree when
    the sibling does not share this node's parent.
*/

use {
    super::{
        jnode::jflags,
        znode::{longterm_lock, LockHandle, Znode},
        Tree,
    },
    crate::engine::{
        coord::{Coord, Side},
        error::{TreeError, TreeResult},
        node::{fs40::NodeView, items::{item_ops, ItemId}},
        sync::longterm::{LockMode, LockPri},
    },
    std::sync::Arc,
};

/// neighbor acquisition flag bits
pub mod gn {
    /// walk left instead of right
    pub const GO_LEFT: u32 = 1 << 0;
    /// fail with `WouldBlock` instead of sleeping on a held lock
    pub const TRY_LOCK: u32 = 1 << 1;
    /// never instantiate missing znodes, cache hits only
    pub const NO_ALLOC: u32 = 1 << 2;
    /// allowed to climb to the parent level to find the neighbor
    pub const DO_READ: u32 = 1 << 3;
    /// load the neighbor's data before returning it
    pub const LOAD_NEIGHBOR: u32 = 1 << 4;
}

/// Acquire the parent, `Ok(None)` for the root (the above-root case;
/// callers must check).
pub fn get_parent(
    tree: &Tree,
    node: &Arc<Znode>,
    mode: LockMode,
) -> TreeResult<Option<LockHandle>> {
    if tree.is_root(node) {
        return Ok(None);
    }
    loop {
        let parent = match node.parent() {
            Some(p) => p,
            None => return Err(TreeError::NoNeighbor),
        };
        let lh = longterm_lock(&parent, mode, LockPri::Hi, false)?;
        // the link could have changed while we slept
        match node.parent() {
            Some(p) if Arc::ptr_eq(&p, &parent) => return Ok(Some(lh)),
            _ => continue,
        }
    }
}

/// Sibling-pointer acquisition. Fails with `NotInCache` when the side
/// is not connected yet (the caller may renew through the parent) and
/// `NoNeighbor` when the neighbor is confirmed absent.
fn lock_side_neighbor(
    tree: &Tree,
    node: &Arc<Znode>,
    mode: LockMode,
    flags: u32,
) -> TreeResult<LockHandle> {
    let _ = tree;
    let go_left = flags & gn::GO_LEFT != 0;
    let pri = if go_left { LockPri::Lo } else { LockPri::Hi };
    loop {
        let connected = if go_left {
            node.is_left_connected()
        } else {
            node.is_right_connected()
        };
        if !connected {
            return Err(TreeError::NotInCache);
        }
        let neighbor = if go_left { node.left() } else { node.right() };
        let neighbor = match neighbor {
            Some(n) => n,
            // connected and null: confirmed absent
            None => return Err(TreeError::NoNeighbor),
        };
        let lh = longterm_lock(&neighbor, mode, pri, flags & gn::TRY_LOCK != 0)?;
        // is the link still pointing at what we locked?
        let still = if go_left { node.left() } else { node.right() };
        match still {
            Some(n) if Arc::ptr_eq(&n, &neighbor) => return Ok(lh),
            _ => continue,
        }
    }
}

/// One step in the horizontal direction when the sibling pointer is
/// not available: consult the parent (possibly the parent's neighbor)
/// and wire up the link. The only function that establishes sibling
/// pointers from disk data.
fn renew_sibling_link(
    tree: &Tree,
    parent_lh: &LockHandle,
    mut coord: Coord,
    child: &Arc<Znode>,
    flags: u32,
) -> TreeResult<()> {
    let go_left = flags & gn::GO_LEFT != 0;
    let parent = parent_lh.node().clone();

    // step the coord across, through the parent's neighbor if needed
    let mut far_lh = LockHandle::none();
    let stepped_out = {
        let data = parent.j().data();
        let view = NodeView::new(tree.env, &data);
        if go_left {
            coord.prev_unit(&view)
        } else {
            coord.next_unit(&view)
        }
    };
    let side_parent = if stepped_out {
        // leftmost/rightmost in this parent: the neighbor hangs off the
        // parent's sibling
        match get_neighbor(
            tree,
            &parent,
            LockMode::Read,
            (flags & gn::GO_LEFT) | gn::DO_READ | gn::LOAD_NEIGHBOR,
        ) {
            Ok(lh) => {
                let data = lh.node().j().data();
                let view = NodeView::new(tree.env, &data);
                coord = if go_left {
                    Coord::last_unit(&view)
                } else {
                    Coord::first_unit(&view)
                };
                drop(data);
                far_lh = lh;
                far_lh.node().clone()
            }
            Err(TreeError::NoNeighbor) => {
                // no parent-level neighbor: the child is at the edge of
                // the tree on this side
                if go_left {
                    child.set_left(None);
                } else {
                    child.set_right(None);
                }
                return Err(TreeError::NoNeighbor);
            }
            Err(e) => return Err(e),
        }
    } else {
        parent.clone()
    };

    // the unit we stepped onto must be a child pointer; extents mean
    // the neighbor is unformatted and formatted/unformatted nodes are
    // not linked
    let nb_block = {
        let data = side_parent.j().data();
        let raw = tree.layout.item_id_at(&data, coord.item_pos);
        match ItemId::from_raw(raw) {
            Some(id) if id.is_internal() => {
                match item_ops(id).down_link(tree.layout.item_body(&data, coord.item_pos)) {
                    Some(b) => b,
                    None => return Err(TreeError::Io),
                }
            }
            Some(_) => {
                if go_left {
                    child.set_left(None);
                } else {
                    child.set_right(None);
                }
                return Err(TreeError::NoNeighbor);
            }
            None => return Err(TreeError::Io),
        }
    };

    let neighbor = if flags & gn::NO_ALLOC != 0 {
        tree.zlook(nb_block)
    } else {
        Some(tree.zget(nb_block, child.level(), Some(&side_parent)))
    };

    if let Some(n) = &neighbor {
        // refresh the neighbor's delimiting keys from its slot
        let (ld, rd) = tree.child_dkeys(&side_parent, &coord);
        n.set_dk(ld, rd);
        if go_left {
            child.set_left(Some(n));
            n.set_right(Some(child));
        } else {
            child.set_right(Some(n));
            n.set_left(Some(child));
        }
    } else {
        // cache-only request and the neighbor is not in memory
        if go_left {
            child.j().clear(jflags::LEFT_CONNECTED);
        } else {
            child.j().clear(jflags::RIGHT_CONNECTED);
        }
        return Err(TreeError::NotInCache);
    }
    Ok(())
}

/// Lock `node`'s neighbor. When the sibling pointer is missing and
/// `DO_READ` allows it, walk up the tree, establishing sibling
/// pointers along the way.
pub fn get_neighbor(
    tree: &Tree,
    node: &Arc<Znode>,
    mode: LockMode,
    flags: u32,
) -> TreeResult<LockHandle> {
    loop {
        match lock_side_neighbor(tree, node, mode, flags) {
            Ok(lh) => {
                if flags & gn::LOAD_NEIGHBOR != 0 {
                    tree.zload(lh.node())?;
                }
                return Ok(lh);
            }
            Err(TreeError::NotInCache) if flags & gn::DO_READ != 0 => {}
            Err(e) => return Err(e),
        }
        // renewal through the parent level
        let parent_lh = match get_parent(tree, node, LockMode::Read)? {
            Some(lh) => lh,
            None => {
                // the root has no siblings
                node.set_left(None);
                node.set_right(None);
                return Err(TreeError::NoNeighbor);
            }
        };
        tree.zload(parent_lh.node())?;
        let coord = match tree.find_child_ptr(parent_lh.node(), node.block()) {
            Ok(c) => c,
            // reparented while we walked: treat as unreachable for now
            Err(TreeError::NotFound) => return Err(TreeError::NoNeighbor),
            Err(e) => return Err(e),
        };
        renew_sibling_link(tree, &parent_lh, coord, node, flags)?;
        // pointer established: take it on the next loop
    }
}

/// Make sure both sibling links of `node` are confirmed, using cache
/// hits only. `coord` is the node's pointer slot in the (locked,
/// loaded) parent.
pub fn connect_znode(
    tree: &Tree,
    parent_lh: &LockHandle,
    coord: &Coord,
    node: &Arc<Znode>,
) -> TreeResult<()> {
    if tree.is_root(node) {
        node.set_left(None);
        node.set_right(None);
        return Ok(());
    }
    // connection is advisory: a lost lock race here only means a later
    // hash search
    if !node.is_right_connected() {
        match renew_sibling_link(tree, parent_lh, *coord, node, gn::NO_ALLOC) {
            Ok(())
            | Err(TreeError::NoNeighbor)
            | Err(TreeError::NotInCache)
            | Err(TreeError::WouldBlock)
            | Err(TreeError::Deadlock) => {}
            Err(e) => return Err(e),
        }
    }
    if !node.is_left_connected() {
        match renew_sibling_link(tree, parent_lh, *coord, node, gn::NO_ALLOC | gn::GO_LEFT) {
            Ok(())
            | Err(TreeError::NoNeighbor)
            | Err(TreeError::NotInCache)
            | Err(TreeError::WouldBlock)
            | Err(TreeError::Deadlock) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// convenience wrappers in the direction-named shape the rest of the
/// core uses
pub fn get_left_neighbor(
    tree: &Tree,
    node: &Arc<Znode>,
    mode: LockMode,
    flags: u32,
) -> TreeResult<LockHandle> {
    get_neighbor(tree, node, mode, flags | gn::GO_LEFT)
}
pub fn get_right_neighbor(
    tree: &Tree,
    node: &Arc<Znode>,
    mode: LockMode,
    flags: u32,
) -> TreeResult<LockHandle> {
    get_neighbor(tree, node, mode, flags & !gn::GO_LEFT)
}

/// which side does `side` map to for the neighbor flags?
pub const fn side_flags(side: Side) -> u32 {
    match side {
        Side::Left => gn::GO_LEFT,
        Side::Right => 0,
    }
}
