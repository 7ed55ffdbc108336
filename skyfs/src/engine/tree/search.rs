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

use {
    super::{
        longterm_lock,
        walk::connect_znode,
        LockHandle, Tree, TreeCoord, Znode,
    },
    crate::engine::{
        config::{CBK_CACHE_SLOTS, CBK_ITERATIONS_LIMIT},
        coord::Between,
        error::{TreeError, TreeResult},
        key::Key,
        node::{LookupBias, NodeSearch},
        sync::longterm::{LockMode, LockPri},
    },
    parking_lot::Mutex,
    std::sync::{Arc, Weak},
};

/// Coord-by-key cache: remembers recently hit nodes so that searches
/// over a hot key range skip the root-to-leaf descent. Probing is
/// strictly opportunistic: a slot is only used when its node can be
/// locked without blocking and its cached delimiting keys still cover
/// the key.
pub struct CbkCache {
    slots: Mutex<Vec<Weak<Znode>>>,
}

impl CbkCache {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(CBK_CACHE_SLOTS)),
        }
    }
    /// try to satisfy a search for `key` at `stop_level` from the cache
    fn probe(
        &self,
        tree: &Tree,
        key: &Key,
        mode: LockMode,
        stop_level: u8,
    ) -> Option<(Arc<Znode>, LockHandle)> {
        let candidates: Vec<Arc<Znode>> = {
            let slots = self.slots.lock();
            slots.iter().filter_map(Weak::upgrade).collect()
        };
        let scheme = tree.env.scheme;
        for node in candidates {
            // only fully wired nodes may bypass the descent: a cached
            // hit skips connect_znode
            if node.level() != stop_level || node.j().is_banshee() || !node.is_connected() {
                continue;
            }
            let lh = match longterm_lock(&node, mode, LockPri::Hi, true) {
                Ok(lh) => lh,
                Err(_) => continue,
            };
            // re-check under the lock
            if node.j().is_banshee() || !node.j().is_loaded() {
                continue;
            }
            if scheme.keyle(&node.ld_key(), key) && scheme.keylt(key, &node.rd_key()) {
                return Some((node, lh));
            }
        }
        None
    }
    /// remember a node a search ended in
    fn record(&self, node: &Arc<Znode>) {
        let mut slots = self.slots.lock();
        slots.retain(|w| match w.upgrade() {
            Some(n) => !Arc::ptr_eq(&n, node) && !n.j().is_banshee(),
            None => false,
        });
        if slots.len() >= CBK_CACHE_SLOTS {
            slots.remove(0);
        }
        slots.push(Arc::downgrade(node));
    }
}

impl Default for CbkCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the tree root-to-leaf looking for `key`.
///
/// Levels above `lock_level` are taken with read locks and released
/// hand over hand; levels at or below it use `mode`. The walk stops at
/// `stop_level` and hands back the coord plus the lock pinning it.
pub fn coord_by_key(
    tree: &Tree,
    key: &Key,
    mode: LockMode,
    bias: LookupBias,
    lock_level: u8,
    stop_level: u8,
) -> TreeResult<(NodeSearch, TreeCoord, LockHandle)> {
    debug_assert!(stop_level >= super::LEAF_LEVEL);
    debug_assert!(lock_level >= stop_level);

    // hot ranges skip the descent entirely
    if lock_level == stop_level {
        if let Some((node, lh)) = tree.cbk.probe(tree, key, mode, stop_level) {
            let (coord, result) = {
                let data = node.j().data();
                tree.layout.lookup(&tree.env, &data, key, bias)?
            };
            return Ok((
                result,
                TreeCoord {
                    node: node.clone(),
                    pos: coord,
                },
                lh,
            ));
        }
    }

    'restart: for iteration in 0..CBK_ITERATIONS_LIMIT {
        if iteration > 0 {
            // give in-flight balancing a moment to finish its parent
            // level bookkeeping before retrying
            std::thread::sleep(std::time::Duration::from_millis(iteration.min(5) as u64));
        }
        if iteration > 10 {
            // incredibly heavy contention for this part of the tree,
            // or a bug
            log::warn!("coord_by_key restarted {iteration} times");
        }
        let desc = tree.root_desc();
        if desc.height < stop_level {
            return Err(TreeError::NotFound);
        }
        let mut level = desc.height;
        let mode_at = |lvl: u8| {
            if lvl <= lock_level {
                mode
            } else {
                LockMode::Read
            }
        };
        let node = tree.zget(desc.block, level, None);
        let mut lh = longterm_lock(&node, mode_at(level), LockPri::Hi, false)?;
        // the root may have moved while we were locking
        if tree.root_desc() != desc {
            continue 'restart;
        }
        tree.zload(&node)?;
        let mut node = node;

        loop {
            let level_bias = if level == stop_level {
                bias
            } else {
                LookupBias::MaxNotGreater
            };
            let (mut coord, result) = {
                let data = node.j().data();
                tree.layout.lookup(&tree.env, &data, key, level_bias)?
            };
            if level == stop_level {
                // a concurrent shift may have moved this key range away
                // while we waited for the lock; the cached delimiting
                // keys tell. Restart rather than miss.
                let scheme = tree.env.scheme;
                let covered = scheme.keyle(&node.ld_key(), key)
                    && scheme.keylt(key, &node.rd_key());
                if !covered && !tree.is_root(&node) {
                    continue 'restart;
                }
                tree.cbk.record(&node);
                return Ok((
                    result,
                    TreeCoord {
                        node: node.clone(),
                        pos: coord,
                    },
                    lh,
                ));
            }
            // internal level: descend through the pointer the lookup
            // landed on
            if matches!(coord.between, Between::EmptyNode) {
                // an empty internal node cannot happen in a healthy
                // tree
                log::warn!("empty internal node {:#x} during search", node.block());
                return Err(TreeError::Io);
            }
            coord.between = Between::AtUnit;
            coord.unit_pos = 0;
            let child = tree.child_znode(&node, &coord, true)?;
            let child_lh = longterm_lock(&child, mode_at(level - 1), LockPri::Hi, false)?;
            if let Err(e) = tree.zload(&child) {
                return Err(e);
            }
            // establish the child's sibling web from cache while the
            // parent is still locked
            connect_znode(tree, &lh, &coord, &child)?;
            // hand over hand
            lh = child_lh;
            node = child;
            level -= 1;
        }
    }
    log::warn!("search for {key:?} exceeded the restart limit");
    Err(TreeError::Io)
}

/// Read-only lookup at the leaf level.
pub fn lookup_key(
    tree: &Tree,
    key: &Key,
    bias: LookupBias,
) -> TreeResult<(NodeSearch, TreeCoord, LockHandle)> {
    coord_by_key(
        tree,
        key,
        LockMode::Read,
        bias,
        super::LEAF_LEVEL,
        super::LEAF_LEVEL,
    )
}

/// Write-mode descent to the leaf that should hold `key`.
pub fn lookup_for_modify(
    tree: &Tree,
    key: &Key,
) -> TreeResult<(NodeSearch, TreeCoord, LockHandle)> {
    coord_by_key(
        tree,
        key,
        LockMode::Write,
        LookupBias::Exact,
        super::LEAF_LEVEL,
        super::LEAF_LEVEL,
    )
}
