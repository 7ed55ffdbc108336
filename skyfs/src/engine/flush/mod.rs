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
    Flush: squeeze and allocate ("squalloc")
    ---
    The tree is not balanced on every operation; it is balanced here,
    on the way out of memory. Flushing a dirty node means:

    1. find the "leftpoint": walk left along the level while neighbors
       are dirty members of the same atom, then climb while the parent
       is dirty, deciding relocate-or-overwrite along the way;
    2. from that highest dirty ancestor, allocate parent-first,
       interleaved with squeezing right siblings leftward so that the
       subtree leaves memory both balanced and well placed on disk.
*/

mod scan;
#[cfg(test)]
mod tests;

pub use scan::scan_left;

use {
    crate::{
        engine::{
            carry::{self, CarryLevel, CarryPool},
            coord::{Between, Coord, CoordHost, Side},
            error::{TreeError, TreeResult},
            node::{
                fs40::NodeView,
                items::{item_ops, ExtentItem, ExtentUnit, ItemId},
                CutRange, NodeNotify,
            },
            sync::longterm::{LockMode, LockPri},
            tree::{
                jflags, jnode::JnodeRef, longterm_lock, same_atom_dirty, walk, walk::gn,
                LockHandle, Tree, Znode, LEAF_LEVEL, TWIG_LEVEL,
            },
            txn::Atom,
        },
        util::unix_now_secs,
    },
    bytes::Bytes,
    std::sync::Arc,
};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// outcome of squeezing one right neighbor
enum Squeeze {
    /// the right node was drained completely
    SourceEmpty,
    /// no more space on the left
    TargetFull,
    /// one internal unit moved; its subtree must be processed before
    /// squeezing continues
    SubtreeMoved,
}

/// Nodes gathered for submission. Flush defers every write until the
/// whole subtree has its final shape: entries hold node references and
/// the block images are captured at submit time, so pointer updates
/// made after queuing still reach the disk.
pub struct FlushQueue {
    batch: usize,
    queued: Vec<JnodeRef>,
    pub submitted: usize,
}

impl FlushQueue {
    pub fn new(batch: usize) -> Self {
        Self {
            batch: batch.max(1),
            queued: Vec::new(),
            submitted: 0,
        }
    }
    pub fn queue(&mut self, node: JnodeRef) {
        if self
            .queued
            .iter()
            .any(|n| core::ptr::eq(n.j() as *const _, node.j() as *const _))
        {
            return;
        }
        self.queued.push(node);
    }
    pub fn submit(&mut self, tree: &Tree) -> TreeResult<()> {
        let mut in_batch = 0usize;
        for node in self.queued.drain(..) {
            if !node.j().is_loaded() {
                continue;
            }
            let image: Bytes = {
                if node.as_znode().is_some() {
                    let mut data = node.j().data_mut();
                    tree.layout.flush_stamp(&mut data, unix_now_secs());
                }
                let data = node.j().data();
                Bytes::copy_from_slice(&data)
            };
            tree.dev.write_block(node.block(), &image)?;
            self.submitted += 1;
            in_batch += 1;
            if in_batch >= self.batch {
                tree.dev.sync()?;
                in_batch = 0;
            }
        }
        tree.dev.sync()?;
        Ok(())
    }
}

/// Flush the subtree a dirty node belongs to. The main entry point:
/// locate the leftpoint, then squeeze and allocate parent-first.
pub fn jnode_flush(tree: &Tree, atom: &Arc<Atom>, node: &JnodeRef) -> TreeResult<()> {
    let mut fq = FlushQueue::new(tree.cfg.flush_queue_size);
    jnode_flush_queued(tree, atom, node, &mut fq)?;
    fq.submit(tree)
}

pub fn jnode_flush_queued(
    tree: &Tree,
    atom: &Arc<Atom>,
    node: &JnodeRef,
    fq: &mut FlushQueue,
) -> TreeResult<()> {
    if !node.j().is_dirty() {
        return Ok(());
    }
    // already decided in a previous pass over this atom; a re-dirtied
    // relocated node only needs its (new) location rewritten
    if node.j().is_allocated() && node.j().test(jflags::WANDER | jflags::RELOC) {
        if node.j().test(jflags::RELOC) {
            fq.queue(node.clone());
        }
        atom.mark_clean(node);
        node.j().clear(jflags::DIRTY);
        return Ok(());
    }

    let mut preceder: u64 = 0;
    let (leftpoint, _leftpoint_lock) = lock_leftpoint(tree, atom, node.clone(), &mut preceder)?;
    squalloc_parent_first(tree, atom, &leftpoint, &mut preceder, fq)?;

    // a dirty unformatted node that survived squalloc sits under a
    // clean twig: it belongs to the overwrite set
    if node.j().is_dirty() && node.j().is_unformatted() {
        if !node.j().is_allocated() {
            let mut start = preceder;
            let mut len = 1u64;
            tree.alloc.alloc_blocks(&mut start, &mut len)?;
            node.j().set_block(start);
            node.j().set(jflags::RELOC);
        } else {
            node.j().set(jflags::WANDER);
        }
        atom.mark_clean(node);
        node.j().clear(jflags::DIRTY);
    }
    Ok(())
}

/*
    leftpoint location
*/

/// Climb from `start` to the leftmost, highest dirty ancestor: scan
/// left on each level, then ascend while the parent is dirty. Decides
/// relocate-or-overwrite for each level's left end and dirties the
/// parent when the child will move.
fn lock_leftpoint(
    tree: &Tree,
    atom: &Arc<Atom>,
    start: JnodeRef,
    preceder: &mut u64,
) -> TreeResult<(JnodeRef, LockHandle)> {
    let scan = scan::scan_left(tree, atom, start, tree.cfg.scan_maxnodes)?;
    let end = scan.node;

    // read-lock the end node so its parent can be examined. Flush is a
    // background job: it takes the low-priority class and steps aside
    // for foreground lockers instead of deadlocking with them.
    let mut end_lock = LockHandle::none();
    if let Some(z) = end.as_znode() {
        loop {
            match longterm_lock(z, LockMode::Read, LockPri::Lo, false) {
                Ok(lh) => {
                    end_lock = lh;
                    break;
                }
                Err(TreeError::Deadlock) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    let parent = jnode_lock_parent_coord(tree, &end, LockMode::Read)?;
    let Some((parent_lock, parent_coord)) = parent else {
        // the end node is the root: it is the leftpoint, relock it for
        // writing
        end_lock.done();
        let mut gda_lock = LockHandle::none();
        if let Some(z) = end.as_znode() {
            end.j().set(jflags::WANDER);
            gda_lock = longterm_lock(z, LockMode::Write, LockPri::Hi, false)?;
        }
        return Ok((end, gda_lock));
    };

    let relocate = should_relocate(tree, &end, parent_lock.node(), &parent_coord, scan.size)?;
    if relocate {
        end.j().set(jflags::RELOC);
        // the child's location will change, so the parent's pointer
        // item must too
        tree.make_dirty(parent_lock.node(), atom);
    } else {
        end.j().set(jflags::WANDER);
    }

    let parent_undecided = parent_lock.node().j().is_dirty()
        && !parent_lock
            .node()
            .j()
            .test(jflags::RELOC | jflags::WANDER);
    if parent_undecided {
        // the parent needs squeezing as well: recurse upward
        end_lock.done();
        let parent_ref = JnodeRef::Z(parent_lock.node().clone());
        drop(parent_lock);
        return lock_leftpoint(tree, atom, parent_ref, preceder);
    }

    // recursion ends here; seed the preceder while the parent is still
    // locked, then take the long-term write lock on the leftpoint
    preceder_hint(tree, &end, Some((parent_lock.node(), &parent_coord)), preceder)?;
    drop(parent_lock);
    end_lock.done();
    let mut gda_lock = LockHandle::none();
    if let Some(z) = end.as_znode() {
        gda_lock = longterm_lock(z, LockMode::Write, LockPri::Hi, false)?;
    }
    Ok((end, gda_lock))
}

/// Lock a node's parent and find the child's coord within it.
/// `Ok(None)` when the node is the root. For unformatted nodes the
/// parent is found by key search at the twig level.
fn jnode_lock_parent_coord(
    tree: &Tree,
    node: &JnodeRef,
    mode: LockMode,
) -> TreeResult<Option<(LockHandle, Coord)>> {
    match node {
        JnodeRef::Z(z) => {
            let Some(lh) = walk::get_parent(tree, z, mode)? else {
                return Ok(None);
            };
            tree.zload(lh.node())?;
            let coord = tree.find_child_ptr(lh.node(), z.block())?;
            Ok(Some((lh, coord)))
        }
        JnodeRef::U(j) => {
            // the extent entry covering this page lives at the twig
            // level
            let key = crate::engine::key::Key::build(
                j.oid(),
                crate::engine::key::KeyMinor::Body,
                j.oid(),
                j.index() * tree.env.block_size as u64,
            );
            let (found, tc, lh) = super::tree::search::coord_by_key(
                tree,
                &key,
                mode,
                crate::engine::node::LookupBias::MaxNotGreater,
                TWIG_LEVEL,
                TWIG_LEVEL,
            )?;
            if found != crate::engine::node::NodeSearch::Found {
                return Err(TreeError::NotFound);
            }
            Ok(Some((lh, tc.pos)))
        }
    }
}

/*
    relocation policy
*/

/// leftmost_of_parent && (leaf || leftmost child of parent is dirty);
/// never the root. The scan length feeds the relocate-threshold
/// heuristic for non-leftmost nodes.
fn should_relocate(
    tree: &Tree,
    node: &JnodeRef,
    parent: &Arc<Znode>,
    parent_coord: &Coord,
    scanned: usize,
) -> TreeResult<bool> {
    let mut coord = *parent_coord;
    let is_leftmost = {
        let data = parent.j().data();
        let view = NodeView::new(tree.env, &data);
        coord.prev_unit(&view)
    };
    if !is_leftmost {
        // advisory: a long dirty run is worth relocating for
        return Ok(scanned >= tree.cfg.relocate_threshold);
    }
    if node.level() == LEAF_LEVEL {
        return Ok(true);
    }
    // ask the leftmost child of the parent whether it is dirty
    let data = parent.j().data();
    let Some(id) = ItemId::from_raw(tree.layout.item_id_at(&data, 0)) else {
        return Err(TreeError::Io);
    };
    let body = tree.layout.item_body(&data, 0);
    let dirty = match item_ops(id).down_link(body) {
        Some(block) => tree
            .zlook(block)
            .map(|z| z.j().is_dirty() || z.j().test(jflags::RELOC))
            .unwrap_or(false),
        None => false,
    };
    Ok(dirty)
}

/*
    preceder hint
*/

/// Seed the block-allocator locality hint for a subtree:
/// - non-leftmost leaf: block of the child left of it in the parent
/// - leftmost child: the parent's own (already allocated) block
/// - non-leftmost internal: rightmost in-memory descendant of the left
///   neighbor
fn preceder_hint(
    tree: &Tree,
    node: &JnodeRef,
    parent: Option<(&Arc<Znode>, &Coord)>,
    preceder: &mut u64,
) -> TreeResult<()> {
    if node.j().is_allocated() || *preceder != 0 {
        return Ok(());
    }
    let mut own_lock = LockHandle::none();
    let (parent, coord) = match parent {
        Some((p, c)) => (p.clone(), *c),
        None => match jnode_lock_parent_coord(tree, node, LockMode::Read)? {
            Some((lh, c)) => {
                let p = lh.node().clone();
                own_lock = lh;
                (p, c)
            }
            // the root is always allocated, never reached here
            None => return Ok(()),
        },
    };
    let mut left = coord;
    let is_leftmost = {
        let data = parent.j().data();
        let view = NodeView::new(tree.env, &data);
        left.prev_unit(&view)
    };
    let is_leaf = node.level() == LEAF_LEVEL;

    if is_leftmost {
        // guaranteed allocated by the ancestor processing order
        debug_assert!(parent.j().is_allocated());
        *preceder = parent.block();
    } else if is_leaf {
        let data = parent.j().data();
        let Some(id) = ItemId::from_raw(tree.layout.item_id_at(&data, left.item_pos)) else {
            return Err(TreeError::Io);
        };
        let body = tree.layout.item_body(&data, left.item_pos);
        if let Some(b) = item_ops(id).utmost_child_block(body, Side::Right) {
            *preceder = b;
        }
    } else {
        preceder_rightmost(tree, &parent, &left, preceder)?;
    }
    own_lock.done();
    Ok(())
}

/// rightmost in-memory descendant under the unit at `coord`
fn preceder_rightmost(
    tree: &Tree,
    parent: &Arc<Znode>,
    coord: &Coord,
    preceder: &mut u64,
) -> TreeResult<()> {
    let (id, child_block) = {
        let data = parent.j().data();
        let Some(id) = ItemId::from_raw(tree.layout.item_id_at(&data, coord.item_pos)) else {
            return Err(TreeError::Io);
        };
        let body = tree.layout.item_body(&data, coord.item_pos);
        (id, item_ops(id).down_link(body))
    };
    if parent.level() == TWIG_LEVEL || !id.is_internal() {
        let data = parent.j().data();
        let body = tree.layout.item_body(&data, coord.item_pos);
        if let Some(b) = item_ops(id).utmost_child_block(body, Side::Right) {
            *preceder = b;
        }
        return Ok(());
    }
    // recurse down-right while the descendant is present and real
    let Some(block) = child_block else {
        return Ok(());
    };
    if crate::engine::storage::fakeblock::is_fake(block) {
        return Ok(());
    }
    let Some(child) = tree.zlook(block) else {
        return Ok(());
    };
    if !child.j().is_loaded() {
        return Ok(());
    }
    let last = {
        let data = child.j().data();
        let view = NodeView::new(tree.env, &data);
        Coord::last_unit(&view)
    };
    if matches!(last.between, Between::EmptyNode) {
        return Ok(());
    }
    preceder_rightmost(tree, &child, &last, preceder)
}

/*
    parent-first allocation
*/

fn squalloc_parent_first(
    tree: &Tree,
    atom: &Arc<Atom>,
    node: &JnodeRef,
    preceder: &mut u64,
    fq: &mut FlushQueue,
) -> TreeResult<()> {
    // a clean node means an overwrite boundary below this level; do
    // not descend
    if !node.j().is_dirty() {
        return Ok(());
    }
    // unformatted nodes in the overwrite set have nothing to allocate
    if node.j().is_unformatted() {
        return Ok(());
    }
    // finalize the location: relocate near the preceder or stay put
    preceder_hint(tree, node, None, preceder)?;
    allocate_node(tree, atom, node, preceder, fq)?;

    let Some(z) = node.as_znode() else {
        return Ok(());
    };

    // children, recursively, in key order
    if z.level() > LEAF_LEVEL {
        squalloc_children(tree, atom, z, preceder, fq)?;
    }

    // squeeze right siblings into this node for as long as progress is
    // made
    loop {
        let right = match z.right() {
            Some(r) => r,
            None => break,
        };
        if !same_atom_dirty(z.j(), right.j()) {
            break;
        }
        let right_lock =
            match walk::get_right_neighbor(tree, z, LockMode::Write, gn::LOAD_NEIGHBOR) {
                Ok(lh) => lh,
                Err(TreeError::NoNeighbor) | Err(TreeError::NotInCache) => break,
                Err(e) => return Err(e),
            };
        // the web may have changed while the lock was taken
        if !right_lock.node().j().is_dirty() {
            break;
        }
        let mut progressed = false;
        loop {
            match squalloc_right_neighbor(tree, atom, z, right_lock.node(), preceder, fq)? {
                Squeeze::SubtreeMoved => {
                    progressed = true;
                    // the moved subtree is now the last unit of @z;
                    // allocate it before squeezing further
                    let child = {
                        let data = z.j().data();
                        let view = NodeView::new(tree.env, &data);
                        let last = Coord::last_unit(&view);
                        drop(data);
                        tree.child_znode(z, &last, true)?
                    };
                    if child.j().is_dirty() {
                        squalloc_parent_first(tree, atom, &JnodeRef::Z(child), preceder, fq)?;
                    }
                }
                Squeeze::SourceEmpty => {
                    progressed = true;
                    break;
                }
                Squeeze::TargetFull => {
                    return Ok(());
                }
            }
        }
        drop(right_lock);
        if !progressed {
            break;
        }
    }
    Ok(())
}

/// Give the node its final location for this atom. Relocation targets
/// a block near the preceder; wandering keeps the block and defers the
/// write to post-commit writeback.
fn allocate_node(
    tree: &Tree,
    atom: &Arc<Atom>,
    node: &JnodeRef,
    preceder: &mut u64,
    fq: &mut FlushQueue,
) -> TreeResult<()> {
    let j = node.j();
    let reloc = j.test(jflags::RELOC) || !j.is_allocated();
    if reloc {
        let mut start = *preceder;
        let mut len = 1u64;
        tree.alloc.alloc_blocks(&mut start, &mut len)?;
        debug_assert_eq!(len, 1);
        let old_block = j.block();
        if j.is_allocated() {
            // the old location becomes free once this atom commits
            atom.defer_delete(old_block, 1);
        }
        match node {
            JnodeRef::Z(z) => {
                // the pointer to this node must follow it. The parent
                // sits earlier in the parent-first order, so its queued
                // image picks the new address up at submit time.
                if tree.root_desc().block == old_block {
                    tree.rekey(z, start);
                    tree.set_root_desc(start, tree.root_desc().height);
                } else {
                    if let Some(parent) = z.parent() {
                        if let Ok(coord) = tree.find_child_ptr(&parent, old_block) {
                            let mut data = parent.j().data_mut();
                            let body = tree.layout.item_body_mut(&mut data, coord.item_pos);
                            crate::engine::node::items::InternalItem::write(body, start);
                        }
                    }
                    tree.rekey(z, start);
                }
            }
            JnodeRef::U(u) => u.set_block(start),
        }
        j.clear(jflags::WANDER);
        j.set(jflags::RELOC);
        // relocated contents are safe to write before commit
        fq.queue(node.clone());
        *preceder = start;
    } else {
        j.set(jflags::WANDER);
        *preceder = j.block();
    }
    atom.mark_clean(node);
    j.clear(jflags::DIRTY);
    Ok(())
}

/// children of an internal node: allocate extent storage in place,
/// recurse into formatted children
fn squalloc_children(
    tree: &Tree,
    atom: &Arc<Atom>,
    node: &Arc<Znode>,
    preceder: &mut u64,
    fq: &mut FlushQueue,
) -> TreeResult<()> {
    // squeezing below this level deletes child pointers as it drains
    // their nodes, so the bounds must be re-read every step
    let mut pos = 0usize;
    loop {
        let id = {
            let data = node.j().data();
            if pos >= tree.layout.num_items(&data) {
                break;
            }
            ItemId::from_raw(tree.layout.item_id_at(&data, pos))
        };
        match id {
            Some(ItemId::Extent) => {
                allocate_extent_item_in_place(tree, atom, node, pos, preceder, fq)?;
            }
            Some(ItemId::Internal) => {
                let coord = Coord {
                    item_pos: pos,
                    unit_pos: 0,
                    between: Between::AtUnit,
                };
                let child = tree.child_znode(node, &coord, false)?;
                if child.j().is_dirty() {
                    tree.zload(&child)?;
                    squalloc_parent_first(tree, atom, &JnodeRef::Z(child), preceder, fq)?;
                }
            }
            Some(ItemId::Tail) | None => {
                log::warn!("unexpected item kind above the leaf level");
                return Err(TreeError::Io);
            }
        }
        pos += 1;
    }
    Ok(())
}

/// Replace unallocated extent units with real block runs, writing any
/// in-memory pages they cover.
fn allocate_extent_item_in_place(
    tree: &Tree,
    atom: &Arc<Atom>,
    node: &Arc<Znode>,
    pos: usize,
    preceder: &mut u64,
    fq: &mut FlushQueue,
) -> TreeResult<()> {
    let (key, units) = {
        let data = node.j().data();
        let body = tree.layout.item_body(&data, pos);
        let n = body.len() / crate::engine::node::items::EXTENT_UNIT_SIZE;
        (
            tree.layout.key_at(&data, pos),
            (0..n).map(|u| ExtentItem::unit(body, u)).collect::<Vec<_>>(),
        )
    };
    let oid = key.objectid();
    let mut page_index = key.offset() / tree.env.block_size as u64;
    let mut changed = false;
    let mut new_units = Vec::with_capacity(units.len());
    for unit in units {
        if !unit.is_unallocated() {
            if unit.is_real() {
                *preceder = unit.start + unit.width - 1;
            }
            page_index += unit.width;
            new_units.push(unit);
            continue;
        }
        // carve real runs out of the device until the whole unit is
        // backed
        let mut remaining = unit.width;
        while remaining > 0 {
            let mut start = *preceder;
            let mut len = remaining;
            tree.alloc.alloc_blocks(&mut start, &mut len)?;
            for i in 0..len {
                if let Some(page) = tree.page_jnode(oid, page_index + i) {
                    page.set_block(start + i);
                    page.set(jflags::RELOC);
                    page.clear(jflags::DIRTY);
                    atom.mark_clean(&JnodeRef::U(page.clone()));
                    fq.queue(JnodeRef::U(page));
                }
            }
            new_units.push(ExtentUnit { start, width: len });
            *preceder = start + len - 1;
            page_index += len;
            remaining -= len;
            changed = true;
        }
    }
    if changed {
        // the item may grow when one unallocated unit became several
        // runs
        let new_body = ExtentItem::build(&new_units);
        let mut data = node.j().data_mut();
        let old_len = tree.layout.item_len(&data, pos);
        let grow = new_body.len() as isize - old_len as isize;
        if grow > 0 && tree.layout.free_space(&data) < grow as usize {
            return Err(TreeError::NoSpace);
        }
        if grow != 0 {
            tree.layout.change_item_size(&mut data, pos, grow);
        }
        tree.layout.item_body_mut(&mut data, pos)[..new_body.len()].copy_from_slice(&new_body);
    }
    Ok(())
}

/*
    squeezing
*/

/// squeeze the right neighbor into `left` according to the level kind
fn squalloc_right_neighbor(
    tree: &Tree,
    atom: &Arc<Atom>,
    left: &Arc<Znode>,
    right: &Arc<Znode>,
    preceder: &mut u64,
    fq: &mut FlushQueue,
) -> TreeResult<Squeeze> {
    let right_empty = {
        let data = right.j().data();
        tree.layout.is_empty(&data)
    };
    if right_empty {
        return Ok(Squeeze::SourceEmpty);
    }
    let res = match left.level() {
        LEAF_LEVEL => squeeze_leaves(tree, atom, left, right),
        TWIG_LEVEL => squalloc_twig(tree, atom, left, right, preceder, fq),
        _ => shift_one_internal_unit(tree, atom, left, right),
    }?;
    if res == Squeeze::SourceEmpty {
        log::trace!("squeezed {:#x} completely into {:#x}", right.block(), left.block());
    }
    Ok(res)
}

/// run the posted parent-level fixups after a squeeze-shift
fn run_squeeze_carry(
    tree: &Tree,
    atom: &Arc<Atom>,
    pool: &mut CarryPool,
    todo: CarryLevel,
) -> TreeResult<()> {
    carry::carry(tree, atom, todo, None, pool)
}

/// bulk shift of the whole right leaf into the left one
fn squeeze_leaves(
    tree: &Tree,
    atom: &Arc<Atom>,
    left: &Arc<Znode>,
    right: &Arc<Znode>,
) -> TreeResult<Squeeze> {
    let mut pool = CarryPool::new();
    let mut todo = CarryLevel::new(left.level() + 1);
    let mut notify = NodeNotify::default();
    let outcome = {
        let mut src = right.j().data_mut();
        let mut dst = left.j().data_mut();
        let mut from = {
            let view = NodeView::new(tree.env, &src);
            Coord::last_unit(&view)
        };
        tree.layout.shift(
            &tree.env,
            &mut src,
            &mut dst,
            &mut from,
            Side::Left,
            true,
            &mut notify,
        )?
    };
    if outcome.bytes > 0 {
        tree.make_dirty(left, atom);
        tree.make_dirty(right, atom);
        tree.update_dkeys(Some(left), right);
        if outcome.source_emptied {
            carry::ops::post_delete(tree, &mut todo, &mut pool, right, 0)?;
        } else {
            carry::ops::post_update(tree, &mut todo, &mut pool, right, Some(left))?;
        }
        run_squeeze_carry(tree, atom, &mut pool, todo)?;
    }
    if outcome.source_emptied {
        Ok(Squeeze::SourceEmpty)
    } else {
        Ok(Squeeze::TargetFull)
    }
}

/// Copy leading extents from `right` to `left`, allocating storage as
/// they cross, then cut the copied prefix. Stops at an internal unit
/// (SUBTREE_MOVED), the end of the source, or a full target.
fn squalloc_twig(
    tree: &Tree,
    atom: &Arc<Atom>,
    left: &Arc<Znode>,
    right: &Arc<Znode>,
    preceder: &mut u64,
    fq: &mut FlushQueue,
) -> TreeResult<Squeeze> {
    let mut copied_items = 0usize;
    let mut target_full = false;

    loop {
        let nitems = {
            let data = right.j().data();
            tree.layout.num_items(&data)
        };
        if copied_items >= nitems {
            break;
        }
        let id = {
            let data = right.j().data();
            ItemId::from_raw(tree.layout.item_id_at(&data, copied_items))
        };
        if id != Some(ItemId::Extent) {
            break;
        }
        // allocate the extents of this item in place first, then try
        // to move the whole item leftward
        allocate_extent_item_in_place(tree, atom, right, copied_items, preceder, fq)?;
        let (key, body, len) = {
            let data = right.j().data();
            (
                tree.layout.key_at(&data, copied_items),
                tree.layout.item_body(&data, copied_items).to_vec(),
                tree.layout.item_len(&data, copied_items),
            )
        };
        // merge with the last item of the target when the key ranges
        // continue each other; adjacent mergeable items in one node
        // are forbidden
        let merge_into = {
            let data = left.j().data();
            let n = tree.layout.num_items(&data);
            if n == 0 {
                None
            } else {
                let lid = ItemId::from_raw(tree.layout.item_id_at(&data, n - 1));
                let lkey = tree.layout.key_at(&data, n - 1);
                let lbody = tree.layout.item_body(&data, n - 1);
                match lid {
                    Some(id)
                        if item_ops(id).mergeable(&tree.env, &lkey, lbody, ItemId::Extent, &key) =>
                    {
                        Some(n - 1)
                    }
                    _ => None,
                }
            }
        };
        let need = len + if merge_into.is_some() {
            0
        } else {
            tree.layout.item_overhead()
        };
        let fits = {
            let data = left.j().data();
            tree.layout.free_space(&data) >= need
        };
        if !fits {
            target_full = true;
            break;
        }
        {
            let mut data = left.j().data_mut();
            match merge_into {
                Some(pos) => {
                    let old_len = tree.layout.item_len(&data, pos);
                    tree.layout.change_item_size(&mut data, pos, len as isize);
                    tree.layout.item_body_mut(&mut data, pos)[old_len..old_len + len]
                        .copy_from_slice(&body);
                }
                None => {
                    let mut coord = {
                        let view = NodeView::new(tree.env, &data);
                        Coord::after_last_item(&view)
                    };
                    let item = crate::engine::node::ItemData::new(ItemId::Extent, body);
                    let mut notify = NodeNotify::default();
                    tree.layout
                        .create_item(&tree.env, &mut data, &mut coord, &key, &item, &mut notify);
                }
            }
        }
        tree.make_dirty(left, atom);
        copied_items += 1;
    }

    // cut the copied prefix out of the source
    if copied_items > 0 {
        let mut pool = CarryPool::new();
        let mut todo = CarryLevel::new(right.level() + 1);
        let mut notify = NodeNotify::default();
        {
            let mut data = right.j().data_mut();
            let to_unit = {
                let view = NodeView::new(tree.env, &data);
                view.num_units(copied_items - 1) - 1
            };
            tree.layout.cut(
                &tree.env,
                &mut data,
                &CutRange {
                    from: Coord {
                        item_pos: 0,
                        unit_pos: 0,
                        between: Between::AtUnit,
                    },
                    to: Coord {
                        item_pos: copied_items - 1,
                        unit_pos: to_unit,
                        between: Between::AtUnit,
                    },
                },
                None,
                &mut notify,
            )?;
        }
        tree.make_dirty(right, atom);
        tree.update_dkeys(Some(left), right);
        if notify.emptied {
            carry::ops::post_delete(tree, &mut todo, &mut pool, right, 0)?;
        } else {
            carry::ops::post_update(tree, &mut todo, &mut pool, right, Some(left))?;
        }
        run_squeeze_carry(tree, atom, &mut pool, todo)?;
    }

    let right_empty = {
        let data = right.j().data();
        tree.layout.is_empty(&data)
    };
    if right_empty {
        return Ok(Squeeze::SourceEmpty);
    }
    if target_full {
        return Ok(Squeeze::TargetFull);
    }
    // an internal unit stopped the extent run
    shift_one_internal_unit(tree, atom, left, right)
}

/// shift exactly one child pointer leftward so its subtree can be
/// processed parent-first
fn shift_one_internal_unit(
    tree: &Tree,
    atom: &Arc<Atom>,
    left: &Arc<Znode>,
    right: &Arc<Znode>,
) -> TreeResult<Squeeze> {
    let (first_id, size) = {
        let data = right.j().data();
        (
            ItemId::from_raw(tree.layout.item_id_at(&data, 0)),
            tree.layout.item_len(&data, 0),
        )
    };
    if first_id != Some(ItemId::Internal) {
        return Ok(Squeeze::TargetFull);
    }
    let mut pool = CarryPool::new();
    let mut todo = CarryLevel::new(left.level() + 1);
    let mut notify = NodeNotify::default();
    let outcome = {
        let mut src = right.j().data_mut();
        let mut dst = left.j().data_mut();
        let mut from = Coord {
            item_pos: 0,
            unit_pos: 0,
            between: Between::AtUnit,
        };
        tree.layout.shift(
            &tree.env,
            &mut src,
            &mut dst,
            &mut from,
            Side::Left,
            true,
            &mut notify,
        )?
    };
    if outcome.bytes == 0 {
        return Ok(Squeeze::TargetFull);
    }
    debug_assert_eq!(outcome.bytes, size);
    tree.make_dirty(left, atom);
    tree.make_dirty(right, atom);
    tree.update_dkeys(Some(left), right);
    // the moved child changed parents
    {
        let data = left.j().data();
        let view = NodeView::new(tree.env, &data);
        let last = Coord::last_unit(&view);
        drop(data);
        if let Ok(child) = tree.child_znode(left, &last, false) {
            child.set_parent(Some(left));
        }
    }
    if outcome.source_emptied {
        carry::ops::post_delete(tree, &mut todo, &mut pool, right, 0)?;
    } else {
        carry::ops::post_update(tree, &mut todo, &mut pool, right, Some(left))?;
    }
    run_squeeze_carry(tree, atom, &mut pool, todo)?;
    if outcome.source_emptied {
        Ok(Squeeze::SourceEmpty)
    } else {
        Ok(Squeeze::SubtreeMoved)
    }
}

/*
    atom-level driving, used by the transaction manager
*/

/// flush every dirty member of the atom, leaves upward
pub fn flush_atom(tree: &Tree, atom: &Arc<Atom>) -> TreeResult<()> {
    let mut fq = FlushQueue::new(tree.cfg.flush_queue_size);
    loop {
        let mut next: Option<JnodeRef> = None;
        for level in LEAF_LEVEL..=crate::engine::config::MAX_TREE_HEIGHT {
            for n in tree_level_dirty(tree, atom, level) {
                if n.j().is_dirty() {
                    next = Some(n);
                    break;
                }
            }
            if next.is_some() {
                break;
            }
        }
        let Some(node) = next else { break };
        jnode_flush_queued(tree, atom, &node, &mut fq)?;
    }
    fq.submit(tree)
}

fn tree_level_dirty(tree: &Tree, atom: &Arc<Atom>, level: u8) -> Vec<JnodeRef> {
    let _ = tree;
    atom.dirty_at(level)
}

/// post-commit: the overwrite (wander) set goes to its home locations
pub fn writeback_atom(tree: &Tree, atom: &Arc<Atom>) -> TreeResult<()> {
    let mut fq = FlushQueue::new(tree.cfg.flush_queue_size);
    for node in atom.clean_members() {
        if node.j().test(jflags::WANDER) {
            fq.queue(node.clone());
        }
    }
    fq.submit(tree)?;
    for node in atom.clean_members() {
        node.j().clear(jflags::WANDER | jflags::RELOC);
    }
    Ok(())
}
