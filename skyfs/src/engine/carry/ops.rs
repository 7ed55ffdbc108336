/*
 * Created on Wed Jan 31 2024
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
    Implementation of the carry operations.

    The shape of every insert-class op is the same: resolve the
    insertion coord (directly, by key, or by chasing a child pointer),
    then free enough space (shift left including the insertion point,
    shift right excluding it, then allocate at most two fresh right
    siblings), then run the node-layout primitive. Everything else is
    bookkeeping that keeps delimiting keys and parent pointers honest.
*/

use {
    super::{
        CarryLevel, CarryOp, CarryPool, CutOp, FlowOp, InsertAddr, InsertOp, OpArgs, TrackCtx,
        COPI_DONT_ALLOCATE, COPI_DONT_SHIFT_LEFT, COPI_DONT_SHIFT_RIGHT, COPI_GO_LEFT,
        COPI_GO_RIGHT, DELETE_RETAIN_EMPTY, NEW_NODE_FLAGS,
    },
    crate::engine::{
        config::{FLOW_NEW_NODES_LIMIT, MIN_TREE_HEIGHT},
        coord::{Between, Coord, CoordHost, CoordWrt, Side},
        error::{TreeError, TreeResult},
        key::Key,
        node::{
            fs40::NodeView,
            items::{item_ops, InternalItem, ItemId, KillCtx},
            CutRange, ItemData, NodeNotify,
        },
        sync::longterm::{LockMode, LockPri},
        tree::{jflags, longterm_lock, walk, walk::gn, LockHandle, Tree, Znode, TWIG_LEVEL},
        txn::Atom,
    },
    std::sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertKind {
    Insert,
    Paste,
    Extent,
}

/// run one operation of the `doing` queue
#[allow(clippy::too_many_arguments)]
pub(super) fn dispatch(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    op_i: usize,
    track: &mut Option<TrackCtx<'_>>,
) -> TreeResult<()> {
    let mut args = core::mem::replace(&mut doing.ops[op_i].args, OpArgs::Modify);
    let mut node_idx = doing.ops[op_i].node_idx;
    let res = match &mut args {
        OpArgs::Insert(op) => {
            carry_insert(tree, atom, doing, todo, pool, &mut node_idx, op, track, InsertKind::Insert)
        }
        OpArgs::Paste(op) => {
            carry_paste(tree, atom, doing, todo, pool, &mut node_idx, op, track)
        }
        OpArgs::Extent(op) => {
            carry_extent(tree, atom, doing, todo, pool, &mut node_idx, op, track)
        }
        OpArgs::InsertFlow(op) => {
            carry_insert_flow(tree, atom, doing, todo, pool, &mut node_idx, op, track)
        }
        OpArgs::Delete { flags } => carry_delete(tree, atom, doing, todo, pool, node_idx, *flags),
        OpArgs::Cut(op) => carry_cut(tree, atom, doing, todo, pool, node_idx, op),
        OpArgs::Update { left } => {
            carry_update(tree, atom, doing, todo, pool, node_idx, left.clone())
        }
        OpArgs::Modify => Ok(()),
    };
    doing.ops[op_i].node_idx = node_idx;
    doing.ops[op_i].args = args;
    res
}

/*
    posting helpers
*/

/// something changed the leftmost key of `right`: have the parent level
/// refresh the delimiting key
pub(crate) fn post_update(
    tree: &Tree,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    right: &Arc<Znode>,
    left: Option<&Arc<Znode>>,
) -> TreeResult<()> {
    if tree.is_root(right) {
        return Ok(());
    }
    // one refresh per node per level is enough
    for op in todo.ops.iter() {
        if matches!(op.args, OpArgs::Update { .. })
            && Arc::ptr_eq(&todo.nodes[op.node_idx].node, right)
        {
            return Ok(());
        }
    }
    let idx = todo.add_node(pool, right.clone(), true)?;
    todo.post_op(
        pool,
        CarryOp {
            node_idx: idx,
            args: OpArgs::Update {
                left: left.cloned(),
            },
        },
    )
}

/// `node` lost its last item: have the parent level drop the pointer
pub(crate) fn post_delete(
    tree: &Tree,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node: &Arc<Znode>,
    flags: u32,
) -> TreeResult<()> {
    if tree.is_root(node) {
        return Ok(());
    }
    let idx = todo.add_node(pool, node.clone(), true)?;
    todo.post_op(
        pool,
        CarryOp {
            node_idx: idx,
            args: OpArgs::Delete { flags },
        },
    )
}

/*
    space accounting
*/

fn insert_size(op: &InsertOp) -> usize {
    match &op.addr {
        InsertAddr::ItemData { data, .. } | InsertAddr::ByKey { data, .. } => data.len(),
        InsertAddr::Child { .. } => crate::engine::node::items::INTERNAL_UNIT_SIZE,
    }
}

/// additional free space `node` must offer before `op` can run; <= 0
/// means ready
fn free_space_shortage(tree: &Tree, node: &Arc<Znode>, op: &InsertOp, kind: InsertKind) -> isize {
    let data = node.j().data();
    match kind {
        InsertKind::Extent => {
            // when inserting an extent, shift data around until the
            // insertion point is utmost in the node
            let view = NodeView::new(tree.env, &data);
            if op.coord.wrt(&view) == CoordWrt::Inside {
                1
            } else {
                -1
            }
        }
        InsertKind::Insert => {
            (insert_size(op) + tree.layout.item_overhead()) as isize
                - tree.layout.free_space(&data) as isize
        }
        InsertKind::Paste => insert_size(op) as isize - tree.layout.free_space(&data) as isize,
    }
}

/*
    neighbors
*/

/// Left neighbor of the target, for shifting into. Consult the carry
/// queue first; otherwise try a non-blocking, cache-only lock. Losing
/// the lock race on a still-restartable level restarts the level.
fn find_left_neighbor(
    tree: &Tree,
    doing: &mut CarryLevel,
    pool: &mut CarryPool,
    node: &Arc<Znode>,
) -> TreeResult<Option<usize>> {
    if let Some(l) = node.left() {
        if let Some(i) = doing.find_real(&l) {
            return Ok(Some(i));
        }
    }
    match walk::get_left_neighbor(tree, node, LockMode::Write, gn::TRY_LOCK) {
        Ok(lh) => {
            tree.zload(lh.node())?;
            Ok(Some(doing.add_locked(pool, lh, true)?))
        }
        Err(TreeError::NoNeighbor) | Err(TreeError::NotInCache) => Ok(None),
        Err(TreeError::WouldBlock) | Err(TreeError::Deadlock) => {
            if doing.restartable {
                Err(TreeError::Restart)
            } else {
                // cannot restart anymore; balance without the left side
                Ok(None)
            }
        }
        Err(e) => Err(e),
    }
}

/// Right neighbor of the target. High priority, may read from disk.
fn find_right_neighbor(
    tree: &Tree,
    doing: &mut CarryLevel,
    pool: &mut CarryPool,
    node: &Arc<Znode>,
) -> TreeResult<Option<usize>> {
    if let Some(r) = node.right() {
        if let Some(i) = doing.find_real(&r) {
            return Ok(Some(i));
        }
    }
    match walk::get_right_neighbor(
        tree,
        node,
        LockMode::Write,
        gn::DO_READ | gn::LOAD_NEIGHBOR,
    ) {
        Ok(lh) => Ok(Some(doing.add_locked(pool, lh, true)?)),
        Err(TreeError::NoNeighbor) | Err(TreeError::NotInCache) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Allocate a fresh right sibling of `brother` and queue the insertion
/// of its pointer into the parent level.
fn add_new_znode(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    brother: &Arc<Znode>,
) -> TreeResult<usize> {
    let fresh = tree.new_node(brother.level())?;
    crate::engine::tree::znode::sibling_list_insert(&fresh, Some(brother));
    fresh.set_parent(brother.parent().as_ref());
    fresh.set_dk(brother.rd_key(), brother.rd_key());
    tree.make_dirty(&fresh, atom);
    let lh = longterm_lock(&fresh, LockMode::Write, LockPri::Hi, false)?;
    let idx = doing.add_locked(pool, lh, true)?;
    // pointer to the new node goes into its parent, in creation order
    let child_idx = todo.add_node(pool, fresh.clone(), true)?;
    todo.post_op(
        pool,
        CarryOp {
            node_idx: child_idx,
            args: OpArgs::Insert(InsertOp {
                addr: InsertAddr::Child {
                    child: fresh.block(),
                    brother: brother.block(),
                },
                coord: Coord::default(),
                flags: NEW_NODE_FLAGS,
            }),
        },
    )?;
    Ok(idx)
}

/*
    shifting
*/

/// move items between `src` (holding the insertion coord) and the
/// carry node `dst_idx`, updating delimiting keys and posting the
/// parent-level refresh
#[allow(clippy::too_many_arguments)]
fn carry_shift_data(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    side: Side,
    src: &Arc<Znode>,
    dst: &Arc<Znode>,
    coord: &mut Coord,
    move_coord: bool,
) -> TreeResult<bool> {
    let mut notify = NodeNotify::default();
    let outcome = {
        let mut s = src.j().data_mut();
        let mut d = dst.j().data_mut();
        tree.layout
            .shift(&tree.env, &mut s, &mut d, coord, side, move_coord, &mut notify)?
    };
    if outcome.bytes > 0 {
        doing.restartable = false;
        tree.make_dirty(src, atom);
        tree.make_dirty(dst, atom);
        let (left, right) = match side {
            Side::Left => (dst, src),
            Side::Right => (src, dst),
        };
        tree.update_dkeys(Some(left), right);
        post_update(tree, todo, pool, right, Some(left))?;
        log::trace!(
            "shift {:?}: [{:#x}] {} bytes [{:#x}]",
            side,
            left.block(),
            outcome.bytes,
            right.block()
        );
    }
    Ok(outcome.moved_coord)
}

/*
    make_space: the insertion policy
*/

/// Shift data to the neighbors of the insertion coord and allocate new
/// nodes until there is enough free space to complete `op`.
#[allow(clippy::too_many_arguments)]
fn make_space(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node_idx: &mut usize,
    op: &mut InsertOp,
    kind: InsertKind,
    track: &mut Option<TrackCtx<'_>>,
) -> TreeResult<()> {
    let orig = doing.nodes[*node_idx].real().clone();
    let was_tracked = doing.nodes[*node_idx].track;
    let mut node = orig.clone();
    let flags = op.flags;

    let mut shortage = free_space_shortage(tree, &node, op, kind);
    // carry can be entered with enough space already (e.g. leftmost
    // insertion that only needs a delimiting key refresh)
    if shortage > 0 && flags & COPI_DONT_SHIFT_LEFT == 0 {
        if let Some(left_idx) = find_left_neighbor(tree, doing, pool, &node)? {
            let left = doing.nodes[left_idx].real().clone();
            // shift everything up to and including the insertion coord
            let moved = carry_shift_data(
                tree,
                atom,
                doing,
                todo,
                pool,
                Side::Left,
                &node,
                &left,
                &mut op.coord,
                flags & COPI_GO_LEFT != 0,
            )?;
            if moved {
                *node_idx = left_idx;
                node = left;
            }
            shortage = free_space_shortage(tree, &node, op, kind);
        }
    }
    if shortage > 0 && flags & COPI_DONT_SHIFT_RIGHT == 0 {
        if let Some(right_idx) = find_right_neighbor(tree, doing, pool, &node)? {
            let right = doing.nodes[right_idx].real().clone();
            // shift everything after, but not including, the coord
            let moved = carry_shift_data(
                tree,
                atom,
                doing,
                todo,
                pool,
                Side::Right,
                &node,
                &right,
                &mut op.coord,
                flags & COPI_GO_RIGHT != 0,
            )?;
            if moved {
                *node_idx = right_idx;
                node = right;
            }
            shortage = free_space_shortage(tree, &node, op, kind);
        }
    }
    // allocate new node(s) on the right
    let mut blk_alloc = 0;
    while shortage > 0 && blk_alloc < 2 && flags & COPI_DONT_ALLOCATE == 0 {
        let fresh_idx = add_new_znode(tree, atom, doing, todo, pool, &node)?;
        let fresh = doing.nodes[fresh_idx].real().clone();
        let coord_shadow = op.coord;
        let node_shadow = *node_idx;
        let moved = carry_shift_data(
            tree,
            atom,
            doing,
            todo,
            pool,
            Side::Right,
            &node,
            &fresh,
            &mut op.coord,
            true,
        )?;
        if moved {
            *node_idx = fresh_idx;
            node = fresh;
        }
        shortage = free_space_shortage(tree, &node, op, kind);
        if shortage > 0 && !Arc::ptr_eq(&node, doing.nodes[node_shadow].real()) {
            // no luck in the new node either; step the insertion point
            // back so the next allocation lands between the original
            // and this one
            let mut back = coord_shadow;
            {
                let shadow_node = doing.nodes[node_shadow].real().clone();
                let data = shadow_node.j().data();
                let view = NodeView::new(tree.env, &data);
                back.normalize(&view);
            }
            op.coord = back;
            *node_idx = node_shadow;
            node = doing.nodes[node_shadow].real().clone();
            shortage = free_space_shortage(tree, &node, op, kind);
        }
        blk_alloc += 1;
    }
    if shortage > 0 {
        if flags & COPI_DONT_ALLOCATE == 0 {
            log::warn!("cannot make space for carry op in node {:#x}", node.block());
        }
        return Err(TreeError::NoSpace);
    }
    // inserting into a node different from the original one: the
    // caller's lock handle migrates with the insertion point once
    // carry lets go of its own locks
    if was_tracked && !Arc::ptr_eq(&node, &orig) {
        doing.nodes[*node_idx].track = true;
        if let Some(tc) = track.as_mut() {
            tc.retarget = Some(node.clone());
        }
    }
    Ok(())
}

/*
    insert / paste common resolution
*/

/// Resolve the target coord for an insert-class operation and make
/// space for it.
#[allow(clippy::too_many_arguments)]
fn insert_paste_common(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node_idx: &mut usize,
    op: &mut InsertOp,
    kind: InsertKind,
    track: &mut Option<TrackCtx<'_>>,
) -> TreeResult<()> {
    match &op.addr {
        InsertAddr::ItemData { .. } => {
            // coord supplied by the poster, relative to the target
        }
        InsertAddr::ByKey { key, .. } => {
            // the only locator stable across shifting of earlier
            // batched operations is the key itself
            let key = *key;
            let real = doing.nodes[*node_idx].real().clone();
            let (coord, _) = {
                let data = real.j().data();
                tree.layout.lookup(
                    &tree.env,
                    &data,
                    &key,
                    crate::engine::node::LookupBias::Exact,
                )?
            };
            op.coord = coord;
        }
        InsertAddr::Child { child, brother } => {
            let (child, brother) = (*child, *brother);
            // convert the child pointer into a coord within the parent;
            // if insertions of earlier new nodes already split the
            // parent, chase the brother's current parent
            loop {
                let parent = doing.nodes[*node_idx].real().clone();
                match tree.find_child_ptr(&parent, brother) {
                    Ok(mut c) => {
                        c.between = Between::AfterUnit;
                        op.coord = c;
                        break;
                    }
                    Err(TreeError::NotFound) => {
                        let bz = match tree.zlook(brother) {
                            Some(z) => z,
                            None => return Err(TreeError::Io),
                        };
                        let p = match bz.parent() {
                            Some(p) => p,
                            None => return Err(TreeError::Io),
                        };
                        if Arc::ptr_eq(&p, &parent) {
                            // the pointer is genuinely gone
                            return Err(TreeError::Io);
                        }
                        if let Some(i) = doing.find_real(&p) {
                            *node_idx = i;
                        } else {
                            let lh = longterm_lock(&p, LockMode::Write, LockPri::Hi, false)?;
                            tree.zload(lh.node())?;
                            *node_idx = doing.add_locked(pool, lh, true)?;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            let _ = child;
        }
    }
    make_space(tree, atom, doing, todo, pool, node_idx, op, kind, track)
}

/// key + item image an insert-class op will write
fn resolve_item(tree: &Tree, op: &InsertOp) -> TreeResult<(Key, ItemData)> {
    match &op.addr {
        InsertAddr::ItemData { key, data } | InsertAddr::ByKey { key, data } => {
            Ok((*key, data.clone()))
        }
        InsertAddr::Child { child, .. } => {
            let child_z = match tree.zlook(*child) {
                Some(z) => z,
                None => return Err(TreeError::Io),
            };
            let key = match tree.leftmost_key_in_node(&child_z) {
                Some(k) => k,
                // an empty fresh node delimits at its ld key
                None => child_z.ld_key(),
            };
            child_z.set_ld_key(key);
            Ok((
                key,
                ItemData::new(ItemId::Internal, InternalItem::encode(*child)),
            ))
        }
    }
}

/*
    the operations proper
*/

#[allow(clippy::too_many_arguments)]
fn carry_insert(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node_idx: &mut usize,
    op: &mut InsertOp,
    track: &mut Option<TrackCtx<'_>>,
    kind: InsertKind,
) -> TreeResult<()> {
    insert_paste_common(tree, atom, doing, todo, pool, node_idx, op, kind, track)?;
    let node = doing.nodes[*node_idx].real().clone();
    let (key, item) = resolve_item(tree, op)?;
    let mut notify = NodeNotify::default();
    {
        let mut data = node.j().data_mut();
        debug_assert!(
            tree.layout.free_space(&data) >= item.len() + tree.layout.item_overhead()
        );
        tree.layout
            .create_item(&tree.env, &mut data, &mut op.coord, &key, &item, &mut notify);
    }
    doing.restartable = false;
    tree.make_dirty(&node, atom);
    if let InsertAddr::Child { child, .. } = &op.addr {
        // the fresh node now has a parent
        if let Some(cz) = tree.zlook(*child) {
            cz.set_parent(Some(&node));
        }
    }
    if notify.first_key_changed {
        post_update(tree, todo, pool, &node, None)?;
    }
    Ok(())
}

/// can the insertion at `coord` continue as a paste into an existing
/// item? Adjusts the coord onto the item it would extend.
fn can_paste(tree: &Tree, data: &[u8], coord: &mut Coord, key: &Key, item: &ItemData) -> bool {
    let view = NodeView::new(tree.env, data);
    if view.is_empty() {
        return false;
    }
    let fits = |pos: usize| -> bool {
        let Some(id) = ItemId::from_raw(tree.layout.item_id_at(data, pos)) else {
            return false;
        };
        id == item.plugin
            && item_ops(id).can_contain_key(
                &tree.env,
                &tree.layout.key_at(data, pos),
                tree.layout.item_body(data, pos),
                key,
            )
    };
    if !coord.is_between_items(&view) {
        // the middle of an item can always be pasted into
        return true;
    }
    let mut circa = *coord;
    circa.between = Between::AtUnit;
    if circa.item_pos < view.num_items() && fits(circa.item_pos) {
        match coord.between {
            Between::BeforeItem => coord.between = Between::BeforeUnit,
            Between::AfterItem => coord.between = Between::AfterUnit,
            _ => {}
        }
        return true;
    }
    match coord.between {
        Between::BeforeUnit | Between::BeforeItem => {
            // glue to the item on the left
            let mut left = *coord;
            if left.set_to_left(&view) {
                return false;
            }
            if fits(left.item_pos) {
                left.between = Between::AfterUnit;
                *coord = left;
                return true;
            }
            false
        }
        Between::AfterUnit | Between::AfterItem => {
            let mut right = *coord;
            if right.set_to_right(&view) {
                return false;
            }
            if fits(right.item_pos) {
                right.between = Between::BeforeUnit;
                *coord = right;
                return true;
            }
            false
        }
        _ => false,
    }
}

/// write `bytes` into the item at `coord`, growing it in place
fn paste_bytes(
    tree: &Tree,
    data: &mut [u8],
    coord: &mut Coord,
    item: &ItemData,
    notify: &mut NodeNotify,
) {
    let pos = coord.item_pos;
    let Some(id) = ItemId::from_raw(tree.layout.item_id_at(data, pos)) else {
        impossible!("paste into an item with unknown plugin")
    };
    let usz = item_ops(id).unit_size();
    let old_len = tree.layout.item_len(data, pos);
    let at = match coord.between {
        Between::AfterUnit => (coord.unit_pos + 1) * usz,
        Between::BeforeUnit | Between::AtUnit => coord.unit_pos * usz,
        Between::BeforeItem => 0,
        Between::AfterItem | Between::EmptyNode | Between::Invalid => old_len,
    };
    tree.layout.change_item_size(data, pos, item.len() as isize);
    let body = tree.layout.item_body_mut(data, pos);
    // open the gap
    body.copy_within(at..old_len, at + item.len());
    body[at..at + item.len()].copy_from_slice(&item.bytes);
    coord.unit_pos = at / usz;
    coord.between = Between::AtUnit;
    let _ = notify;
}

#[allow(clippy::too_many_arguments)]
fn carry_paste(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node_idx: &mut usize,
    op: &mut InsertOp,
    track: &mut Option<TrackCtx<'_>>,
) -> TreeResult<()> {
    insert_paste_common(tree, atom, doing, todo, pool, node_idx, op, InsertKind::Paste, track)?;
    let node = doing.nodes[*node_idx].real().clone();
    let (key, item) = resolve_item(tree, op)?;

    // after shifting, the item we meant to paste into may live
    // elsewhere: morph into an insert
    let paste_ok = {
        let data = node.j().data();
        let mut coord = op.coord;
        let ok = can_paste(tree, &data, &mut coord, &key, &item);
        if ok {
            op.coord = coord;
        }
        ok
    };
    if !paste_ok {
        log::trace!("paste restarted as insert at {:#x}", node.block());
        make_space(tree, atom, doing, todo, pool, node_idx, op, InsertKind::Insert, track)?;
        return carry_insert_tail(tree, atom, doing, todo, pool, node_idx, op, &key, &item);
    }

    let mut notify = NodeNotify::default();
    {
        let mut data = node.j().data_mut();
        debug_assert!(tree.layout.free_space(&data) >= item.len());
        paste_bytes(tree, &mut data, &mut op.coord, &item, &mut notify);
    }
    doing.restartable = false;
    tree.make_dirty(&node, atom);
    // pasting at the head of the item changes its key
    if op.coord.unit_pos == 0 {
        let fixed = {
            let data = node.j().data();
            tree.layout.unit_key_at(&tree.env, &data, op.coord.item_pos, 0)
        };
        let mut data = node.j().data_mut();
        tree.layout
            .update_item_key(&mut data, op.coord.item_pos, &fixed, &mut notify);
    }
    if notify.first_key_changed {
        post_update(tree, todo, pool, &node, None)?;
    }
    Ok(())
}

/// the insert half of a paste that morphed
#[allow(clippy::too_many_arguments)]
fn carry_insert_tail(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node_idx: &mut usize,
    op: &mut InsertOp,
    key: &Key,
    item: &ItemData,
) -> TreeResult<()> {
    let node = doing.nodes[*node_idx].real().clone();
    let mut notify = NodeNotify::default();
    {
        let mut data = node.j().data_mut();
        tree.layout
            .create_item(&tree.env, &mut data, &mut op.coord, key, item, &mut notify);
    }
    doing.restartable = false;
    tree.make_dirty(&node, atom);
    if notify.first_key_changed {
        post_update(tree, todo, pool, &node, None)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn carry_extent(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node_idx: &mut usize,
    op: &mut InsertOp,
    track: &mut Option<TrackCtx<'_>>,
) -> TreeResult<()> {
    /*
        Extents live on the twig level. The key range the new extent
        covers sits between two leaf items that may share one formatted
        leaf: shift data around until those neighbors fall into
        different nodes (the insertion point becomes utmost in its
        node), then insert the extent item one level up.
    */
    insert_paste_common(tree, atom, doing, todo, pool, node_idx, op, InsertKind::Extent, track)?;
    let node = doing.nodes[*node_idx].real().clone();

    let (key, data) = match &op.addr {
        InsertAddr::ItemData { key, data } | InsertAddr::ByKey { key, data } => {
            (*key, data.clone())
        }
        InsertAddr::Child { .. } => return Err(TreeError::Io),
    };

    // search for adjacent extents had to "drill" to the leaf level,
    // creating an empty node; remove it, but retain it until carry
    // finishes
    let is_empty = {
        let d = node.j().data();
        tree.layout.is_empty(&d)
    };
    if is_empty {
        node.j().set(jflags::HEARD_BANSHEE);
        post_delete(tree, todo, pool, &node, DELETE_RETAIN_EMPTY)?;
    }

    // insert the extent item into the twig level by key
    let idx = todo.add_node(pool, node.clone(), true)?;
    todo.post_op(
        pool,
        CarryOp {
            node_idx: idx,
            args: OpArgs::Insert(InsertOp {
                addr: InsertAddr::ByKey { key, data },
                coord: Coord::default(),
                flags: NEW_NODE_FLAGS,
            }),
        },
    )?;
    Ok(())
}

fn carry_delete(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node_idx: usize,
    flags: u32,
) -> TreeResult<()> {
    let child = doing.nodes[node_idx].node.clone();
    let parent = doing.nodes[node_idx].real().clone();
    debug_assert!(parent.level() > crate::engine::tree::LEAF_LEVEL);

    let nitems = {
        let d = parent.j().data();
        tree.layout.num_items(&d)
    };

    // Tree must stay at least two levels tall: the last pointer in a
    // root at the twig level survives even over an empty child. Reset
    // the delimiting keys instead.
    if tree.is_root(&parent) && parent.level() <= MIN_TREE_HEIGHT && nitems == 1 {
        use crate::engine::key::{MAX_KEY, MIN_KEY};
        child.set_dk(MIN_KEY, MAX_KEY);
        parent.set_dk(MIN_KEY, MAX_KEY);
        return Ok(());
    }

    let coord = tree.find_child_ptr(&parent, child.block())?;
    let mut notify = NodeNotify::default();
    let mut kill = KillCtx::default();
    {
        let mut data = parent.j().data_mut();
        tree.layout.cut(
            &tree.env,
            &mut data,
            &CutRange {
                from: coord,
                to: coord,
            },
            Some(&mut kill),
            &mut notify,
        )?;
    }
    doing.restartable = false;
    tree.make_dirty(&parent, atom);
    for (start, len) in kill.dead_blocks {
        atom.defer_delete(start, len);
    }

    // the child leaves the tree
    atom.forget(child.block());
    tree.zdrop(&child);

    if notify.emptied && flags & DELETE_RETAIN_EMPTY == 0 {
        post_delete(tree, todo, pool, &parent, 0)?;
    } else if notify.first_key_changed {
        post_update(tree, todo, pool, &parent, None)?;
    }

    // root with a single pointer above the twig level dies, the tree
    // shrinks
    let nitems = {
        let d = parent.j().data();
        tree.layout.num_items(&d)
    };
    if tree.is_root(&parent) && parent.level() > TWIG_LEVEL && nitems == 1 {
        tree.kill_root(&parent, atom)?;
    }
    Ok(())
}

fn carry_cut(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node_idx: usize,
    op: &CutOp,
) -> TreeResult<()> {
    let node = doing.nodes[node_idx].real().clone();
    let mut notify = NodeNotify::default();
    let mut kill = KillCtx::default();
    {
        let mut data = node.j().data_mut();
        tree.layout.cut(
            &tree.env,
            &mut data,
            &op.range,
            if op.kill { Some(&mut kill) } else { None },
            &mut notify,
        )?;
    }
    doing.restartable = false;
    tree.make_dirty(&node, atom);
    for (start, len) in kill.dead_blocks {
        atom.defer_delete(start, len);
    }
    if notify.emptied && op.flags & DELETE_RETAIN_EMPTY == 0 {
        post_delete(tree, todo, pool, &node, 0)?;
    } else if notify.first_key_changed {
        post_update(tree, todo, pool, &node, None)?;
    }
    Ok(())
}

fn carry_update(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node_idx: usize,
    left: Option<Arc<Znode>>,
) -> TreeResult<()> {
    let right_child = doing.nodes[node_idx].node.clone();
    let mut parent = doing.nodes[node_idx].real().clone();
    let mut _chase_lh = LockHandle::none();

    // the parent may have split while this op sat in the queue and the
    // pointer migrated into a new node
    if let Some(p) = right_child.parent() {
        if !Arc::ptr_eq(&p, &parent) {
            if let Some(i) = doing.find_real(&p) {
                parent = doing.nodes[i].real().clone();
            } else {
                _chase_lh = longterm_lock(&p, LockMode::Write, LockPri::Hi, false)?;
                tree.zload(&p)?;
                parent = p;
            }
        }
    }

    let right_pos = tree.find_child_ptr(&parent, right_child.block())?;
    if let Some(l) = &left {
        // sanity: the children must be adjacent pointers
        if right_pos.item_pos > 0 {
            if let Ok(left_pos) = tree.find_child_ptr(&parent, l.block()) {
                debug_assert_eq!(left_pos.item_pos + 1, right_pos.item_pos);
            }
        }
    }

    tree.zload(&right_child)?;
    let ldkey = match tree.leftmost_key_in_node(&right_child) {
        Some(k) => k,
        None => right_child.ld_key(),
    };
    let mut notify = NodeNotify::default();
    {
        let mut data = parent.j().data_mut();
        tree.layout
            .update_item_key(&mut data, right_pos.item_pos, &ldkey, &mut notify);
    }
    // the cached delimiting keys follow the stored one
    right_child.set_ld_key(ldkey);
    if let Some(l) = &left {
        l.set_rd_key(ldkey);
    }
    doing.restartable = false;
    tree.make_dirty(&parent, atom);
    if notify.first_key_changed {
        post_update(tree, todo, pool, &parent, None)?;
    }
    Ok(())
}

/*
    flow insertion
*/

fn flow_remaining(op: &FlowOp) -> usize {
    op.flow.len() - op.written
}

/// free bytes at the insertion point after paying any item-creation
/// overhead
fn what_can_be_written(tree: &Tree, node: &Arc<Znode>, op: &FlowOp) -> usize {
    let data = node.j().data();
    let free = tree.layout.free_space(&data);
    let overhead = {
        let mut coord = op.coord;
        let key = op.key.with_offset(op.key.offset() + op.written as u64);
        let probe = ItemData::new(ItemId::Tail, Vec::new());
        if can_paste(tree, &data, &mut coord, &key, &probe) {
            0
        } else {
            tree.layout.item_overhead()
        }
    };
    free.saturating_sub(overhead).min(flow_remaining(op))
}

#[allow(clippy::too_many_arguments)]
fn carry_insert_flow(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node_idx: &mut usize,
    op: &mut FlowOp,
    track: &mut Option<TrackCtx<'_>>,
) -> TreeResult<()> {
    let mut something_written = false;
    while flow_remaining(op) > 0 {
        match make_space_for_flow(tree, atom, doing, todo, pool, node_idx, op) {
            Ok(()) => {}
            Err(e) => {
                if something_written && e == TreeError::NoSpace {
                    // part of the flow is in the tree already; let
                    // carry finish the bookkeeping for that part
                    break;
                }
                return Err(e);
            }
        }
        let node = doing.nodes[*node_idx].real().clone();
        let can = what_can_be_written(tree, &node, op);
        if can == 0 {
            return Err(TreeError::NoSpace);
        }
        let key = op.key.with_offset(op.key.offset() + op.written as u64);
        let chunk = ItemData::new(
            ItemId::Tail,
            op.flow[op.written..op.written + can].to_vec(),
        );
        let mut notify = NodeNotify::default();
        {
            let mut data = node.j().data_mut();
            let mut coord = op.coord;
            let pasteable = can_paste(tree, &data, &mut coord, &key, &chunk);
            if pasteable {
                paste_bytes(tree, &mut data, &mut coord, &chunk, &mut notify);
            } else {
                tree.layout
                    .create_item(&tree.env, &mut data, &mut coord, &key, &chunk, &mut notify);
            }
            // leave the coord after what we just wrote
            coord.unit_pos += can - 1;
            coord.between = Between::AfterUnit;
            op.coord = coord;
        }
        doing.restartable = false;
        tree.make_dirty(&node, atom);
        if notify.first_key_changed {
            post_update(tree, todo, pool, &node, None)?;
        }
        op.written += can;
        something_written = true;
    }
    let _ = track;
    Ok(())
}

/// four-step make-space for flow insertion: whole flow locally, shift
/// left including the insertion point, shift right excluding it, then
/// fresh nodes up to the configured limit
fn make_space_for_flow(
    tree: &Tree,
    atom: &Arc<Atom>,
    doing: &mut CarryLevel,
    todo: &mut CarryLevel,
    pool: &mut CarryPool,
    node_idx: &mut usize,
    op: &mut FlowOp,
) -> TreeResult<()> {
    let enough = |tree: &Tree, node: &Arc<Znode>, op: &FlowOp| {
        what_can_be_written(tree, node, op) == flow_remaining(op)
    };
    let mut node = doing.nodes[*node_idx].real().clone();
    if enough(tree, &node, op) {
        return Ok(());
    }

    // shift left, carrying the insertion point along
    if let Some(left_idx) = find_left_neighbor(tree, doing, pool, &node)? {
        let left = doing.nodes[left_idx].real().clone();
        let orig = node.clone();
        let moved = carry_shift_data(
            tree, atom, doing, todo, pool,
            Side::Left, &node, &left, &mut op.coord, true,
        )?;
        if moved {
            if what_can_be_written(tree, &left, op) >= 1 {
                // part of the flow goes to the end of the left node
                *node_idx = left_idx;
                return Ok(());
            }
            // not even a byte fits on the left; move the insertion
            // point back before the first remaining item
            let data = orig.j().data();
            let view = NodeView::new(tree.env, &data);
            op.coord = Coord::before_first_item(&view);
        }
    }
    if enough(tree, &node, op) {
        return Ok(());
    }

    // shift right of the insertion point away
    if let Some(right_idx) = find_right_neighbor(tree, doing, pool, &node)? {
        let right = doing.nodes[right_idx].real().clone();
        carry_shift_data(
            tree, atom, doing, todo, pool,
            Side::Right, &node, &right, &mut op.coord, false,
        )?;
    }
    {
        let data = node.j().data();
        let view = NodeView::new(tree.env, &data);
        if op.coord.is_after_rightmost(&view) && what_can_be_written(tree, &node, op) >= 1 {
            return Ok(());
        }
    }
    if enough(tree, &node, op) {
        return Ok(());
    }

    // new nodes, bounded
    for _ in 0..2 {
        if op.new_nodes == FLOW_NEW_NODES_LIMIT {
            return Err(TreeError::NoSpace);
        }
        let fresh_idx = add_new_znode(tree, atom, doing, todo, pool, &node)?;
        op.new_nodes += 1;
        let fresh = doing.nodes[fresh_idx].real().clone();
        let at_end = {
            let data = node.j().data();
            let view = NodeView::new(tree.env, &data);
            op.coord.is_after_rightmost(&view)
        };
        if !at_end {
            carry_shift_data(
                tree, atom, doing, todo, pool,
                Side::Right, &node, &fresh, &mut op.coord, false,
            )?;
            let ok = {
                let data = node.j().data();
                let view = NodeView::new(tree.env, &data);
                op.coord.is_after_rightmost(&view) && what_can_be_written(tree, &node, op) >= 1
            };
            if ok {
                return Ok(());
            }
            continue;
        }
        // move the insertion point into the fresh node
        {
            let data = fresh.j().data();
            let view = NodeView::new(tree.env, &data);
            op.coord = Coord::before_first_item(&view);
        }
        *node_idx = fresh_idx;
        return Ok(());
    }
    // both fresh nodes are in place; the point moves into the last one
    let node = doing.nodes[*node_idx].real().clone();
    let data = node.j().data();
    let view = NodeView::new(tree.env, &data);
    if op.coord.is_after_rightmost(&view) && what_can_be_written(tree, &node, op) >= 1 {
        return Ok(());
    }
    Err(TreeError::NoSpace)
}
