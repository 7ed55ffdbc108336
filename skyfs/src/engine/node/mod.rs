/*
 * Created on Mon Jan 15 2024
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

pub mod fs40;
pub mod items;
#[cfg(test)]
mod tests;

use {
    self::items::KillCtx,
    crate::engine::{
        coord::{Coord, Side},
        error::TreeResult,
        key::{Key, KeyScheme},
    },
};

/// plugin id of the one node layout we ship
pub const FS40_NODE_ID: u16 = 0x40;

/// Environment threaded through item/node primitives: the key scheme is
/// fixed per filesystem instance and extents need the block size for
/// their key arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct ItemEnv {
    pub scheme: KeyScheme,
    pub block_size: usize,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum LookupBias {
    /// find this exact key
    Exact,
    /// find the greatest position not greater than this key
    MaxNotGreater,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum NodeSearch {
    Found,
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
/// Data for a new item: the body image to copy in plus its item plugin
pub struct ItemData {
    pub plugin: items::ItemId,
    pub bytes: Vec<u8>,
}

impl ItemData {
    pub fn new(plugin: items::ItemId, bytes: Vec<u8>) -> Self {
        Self { plugin, bytes }
    }
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// What a node primitive observed that upper levels must react to.
/// The caller (carry) turns these into UPDATE/DELETE operations at the
/// parent level.
pub struct NodeNotify {
    /// the key of item 0 changed; the parent's delimiting key is stale
    pub first_key_changed: bool,
    /// the node lost its last item
    pub emptied: bool,
}

impl NodeNotify {
    pub fn fold(&mut self, other: NodeNotify) {
        self.first_key_changed |= other.first_key_changed;
        self.emptied |= other.emptied;
    }
    pub fn any(&self) -> bool {
        self.first_key_changed || self.emptied
    }
}

#[derive(Debug, Clone, Copy)]
/// Half-open unit range to cut, expressed as two coords in one node
pub struct CutRange {
    pub from: Coord,
    pub to: Coord,
}

#[derive(Debug, Default, Clone)]
pub struct CutOutcome {
    /// number of items removed entirely
    pub removed_items: usize,
    /// bytes freed from item bodies
    pub freed_bytes: usize,
    /// key of the smallest removed unit
    pub smallest_removed: Option<Key>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ShiftOutcome {
    /// item body bytes moved between the nodes
    pub bytes: usize,
    /// the source node lost its last item
    pub source_emptied: bool,
    /// the tracked insertion coord now lives in the target node
    pub moved_coord: bool,
}

/// The node layout contract. The rest of the core uses nodes only
/// through this trait; `fs40` is the only implementation shipped.
///
/// All methods operate on raw node images; the caller holds whatever
/// long-term lock the operation requires.
pub trait NodeLayout: Sync + Send {
    fn id(&self) -> u16;

    /*
        header
    */

    fn init(&self, data: &mut [u8], level: u8);
    /// validate magic/level; a failure here marks the node bad
    fn parse(&self, data: &[u8], expected_level: u8) -> TreeResult<()>;
    /// does this block look like one of ours?
    fn guess(&self, data: &[u8]) -> bool;
    fn free_space(&self, data: &[u8]) -> usize;
    fn num_items(&self, data: &[u8]) -> usize;
    fn is_empty(&self, data: &[u8]) -> bool {
        self.num_items(data) == 0
    }
    fn level(&self, data: &[u8]) -> u8;
    fn flush_stamp(&self, data: &mut [u8], stamp: u32);
    /// per-item bookkeeping overhead (the item header)
    fn item_overhead(&self) -> usize;
    fn max_item_size(&self, block_size: usize) -> usize;

    /*
        items
    */

    fn key_at(&self, data: &[u8], pos: usize) -> Key;
    fn item_id_at(&self, data: &[u8], pos: usize) -> u16;
    fn item_len(&self, data: &[u8], pos: usize) -> usize;
    fn item_body<'a>(&self, data: &'a [u8], pos: usize) -> &'a [u8];
    fn item_body_mut<'a>(&self, data: &'a mut [u8], pos: usize) -> &'a mut [u8];
    fn units_of(&self, env: &ItemEnv, data: &[u8], pos: usize) -> usize;
    /// key of a specific unit inside an item
    fn unit_key_at(&self, env: &ItemEnv, data: &[u8], pos: usize, unit: usize) -> Key;
    /// key of the leftmost unit in the node; `None` when empty
    fn leftmost_key(&self, env: &ItemEnv, data: &[u8]) -> Option<Key> {
        if self.is_empty(data) {
            None
        } else {
            Some(self.unit_key_at(env, data, 0, 0))
        }
    }

    /*
        search
    */

    fn lookup(
        &self,
        env: &ItemEnv,
        data: &[u8],
        key: &Key,
        bias: LookupBias,
    ) -> TreeResult<(Coord, NodeSearch)>;

    /*
        mutation
    */

    /// insert a new item at `coord` (caller verified space); the coord is
    /// left positioned at the new item's first unit
    fn create_item(
        &self,
        env: &ItemEnv,
        data: &mut [u8],
        coord: &mut Coord,
        key: &Key,
        item: &ItemData,
        notify: &mut NodeNotify,
    );
    fn update_item_key(&self, data: &mut [u8], pos: usize, key: &Key, notify: &mut NodeNotify);
    /// grow (`by > 0`) or shrink an item in place, sliding later items
    fn change_item_size(&self, data: &mut [u8], pos: usize, by: isize);
    /// remove a unit range; `kill` additionally fires per-item kill hooks
    fn cut(
        &self,
        env: &ItemEnv,
        data: &mut [u8],
        range: &CutRange,
        kill: Option<&mut KillCtx>,
        notify: &mut NodeNotify,
    ) -> TreeResult<CutOutcome>;
    /// move data between siblings; the single primitive carry rebalances
    /// with. `from` is the insertion coord being tracked: everything up
    /// to it (left shift, inclusive iff `move_coord`) or after it (right
    /// shift, exclusive) is considered for the move.
    fn shift(
        &self,
        env: &ItemEnv,
        src: &mut [u8],
        dst: &mut [u8],
        from: &mut Coord,
        side: Side,
        move_coord: bool,
        notify: &mut NodeNotify,
    ) -> TreeResult<ShiftOutcome>;

    /*
        integrity
    */

    /// Full structural check; returns a static reason on failure.
    /// When the caller knows the node's cached delimiting keys, passing
    /// them additionally verifies containment: `ld <= first key`,
    /// `last key <= rd` and `ld <= rd`.
    fn check(
        &self,
        env: &ItemEnv,
        data: &[u8],
        dk: Option<(&Key, &Key)>,
    ) -> Result<(), &'static str>;

    /*
        carry shortcut hints
    */

    fn fast_insert(&self) -> bool {
        true
    }
    fn fast_paste(&self) -> bool {
        true
    }
    fn fast_cut(&self) -> bool {
        true
    }
}

/// Node-plugin table, indexed by the 16-bit id stored in each node
/// header. Selection is fixed at mount time.
pub fn node_layout_by_id(id: u16) -> Option<&'static dyn NodeLayout> {
    match id {
        FS40_NODE_ID => Some(&fs40::Fs40),
        _ => None,
    }
}
