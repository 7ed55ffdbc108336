/*
 * Created on Tue Jan 16 2024
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
    Item plugins
    ---
    A node stores items; an item is a sequence of units. Three item
    kinds cover the whole tree: internal items (child pointers, any
    level above the leaves), tails (byte bodies at the leaf level) and
    extents (block runs at the twig level). Every kind has a fixed unit
    size, which is what lets shift and cut treat unit ranges as plain
    byte ranges.
*/

use {
    super::{ItemEnv, LookupBias},
    crate::engine::{
        coord::{Between, Side},
        key::Key,
    },
};

/// bytes per extent unit: (start, width) as two LE u64s
pub const EXTENT_UNIT_SIZE: usize = 16;
/// bytes per internal unit: the child block number
pub const INTERNAL_UNIT_SIZE: usize = 8;

/// an extent start denoting a hole
pub const EXTENT_HOLE: u64 = 0;
/// an extent start denoting storage not yet allocated
pub const EXTENT_UNALLOCATED: u64 = 1;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u16)]
/// 16-bit item plugin id as stored in item headers
pub enum ItemId {
    Internal = 0x10,
    Tail = 0x20,
    Extent = 0x30,
}

impl ItemId {
    pub const fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x10 => Self::Internal,
            0x20 => Self::Tail,
            0x30 => Self::Extent,
            _ => return None,
        })
    }
    pub const fn raw(&self) -> u16 {
        *self as u16
    }
    /// do items of this kind point down the tree?
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal)
    }
}

#[derive(Debug, Default)]
/// Collects resources released by kill hooks: block runs that the atom
/// must hand to the allocator's deleted set.
pub struct KillCtx {
    pub dead_blocks: Vec<(u64, u64)>,
}

impl KillCtx {
    pub fn record(&mut self, start: u64, width: u64) {
        if width > 0 {
            self.dead_blocks.push((start, width));
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct UnitLookup {
    pub unit_pos: usize,
    pub between: Between,
    pub found: bool,
}

/// The per-item capability set. One vtable entry per item kind.
pub trait ItemOps: Sync {
    fn id(&self) -> ItemId;
    /// fixed unit size in bytes
    fn unit_size(&self) -> usize;
    fn nr_units(&self, body: &[u8]) -> usize {
        debug_assert_eq!(body.len() % self.unit_size(), 0);
        body.len() / self.unit_size()
    }
    /// locate `key` inside this item
    fn lookup(&self, env: &ItemEnv, item_key: &Key, body: &[u8], key: &Key, bias: LookupBias)
        -> UnitLookup;
    /// can the item starting at `right_key` be glued to the end of the
    /// item `(left_key, left_body)`?
    fn mergeable(&self, env: &ItemEnv, left_key: &Key, left_body: &[u8], right_id: ItemId, right_key: &Key)
        -> bool;
    /// would this item logically contain `key` if extended?
    fn can_contain_key(&self, env: &ItemEnv, item_key: &Key, body: &[u8], key: &Key) -> bool;
    /// units are leaving the tree for good
    fn kill_units(&self, env: &ItemEnv, item_key: &Key, units: &[u8], ctx: &mut KillCtx) {
        let _ = (env, item_key, units, ctx);
    }
    /// child block number, for items that point down the tree
    fn down_link(&self, body: &[u8]) -> Option<u64> {
        let _ = body;
        None
    }
    /// real block number of the leftmost/rightmost child of this item,
    /// `None` if it has none or it is not backed by a real block
    fn utmost_child_block(&self, body: &[u8], side: Side) -> Option<u64> {
        let _ = (body, side);
        None
    }
}

/*
    internal
*/

pub struct InternalItem;

impl InternalItem {
    pub fn encode(child: u64) -> Vec<u8> {
        child.to_le_bytes().to_vec()
    }
    pub fn decode(body: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&body[..8]);
        u64::from_le_bytes(raw)
    }
    pub fn write(body: &mut [u8], child: u64) {
        body[..8].copy_from_slice(&child.to_le_bytes());
    }
}

impl ItemOps for InternalItem {
    fn id(&self) -> ItemId {
        ItemId::Internal
    }
    fn unit_size(&self) -> usize {
        INTERNAL_UNIT_SIZE
    }
    fn lookup(
        &self,
        env: &ItemEnv,
        item_key: &Key,
        _body: &[u8],
        key: &Key,
        bias: LookupBias,
    ) -> UnitLookup {
        // an internal item owns the whole key range up to the next item
        debug_assert!(env.scheme.keyge(key, item_key));
        UnitLookup {
            unit_pos: 0,
            between: Between::AfterUnit,
            found: matches!(bias, LookupBias::MaxNotGreater),
        }
    }
    fn mergeable(&self, _: &ItemEnv, _: &Key, _: &[u8], _: ItemId, _: &Key) -> bool {
        // child pointers never merge
        false
    }
    fn can_contain_key(&self, _: &ItemEnv, _: &Key, _: &[u8], _: &Key) -> bool {
        false
    }
    fn kill_units(&self, _: &ItemEnv, _: &Key, units: &[u8], ctx: &mut KillCtx) {
        for chunk in units.chunks_exact(INTERNAL_UNIT_SIZE) {
            let child = Self::decode(chunk);
            if !crate::engine::storage::fakeblock::is_fake(child) {
                ctx.record(child, 1);
            }
        }
    }
    fn down_link(&self, body: &[u8]) -> Option<u64> {
        Some(Self::decode(body))
    }
    fn utmost_child_block(&self, body: &[u8], _side: Side) -> Option<u64> {
        let child = Self::decode(body);
        if crate::engine::storage::fakeblock::is_fake(child) {
            None
        } else {
            Some(child)
        }
    }
}

/*
    tail
*/

pub struct TailItem;

impl ItemOps for TailItem {
    fn id(&self) -> ItemId {
        ItemId::Tail
    }
    fn unit_size(&self) -> usize {
        1
    }
    fn lookup(
        &self,
        env: &ItemEnv,
        item_key: &Key,
        body: &[u8],
        key: &Key,
        bias: LookupBias,
    ) -> UnitLookup {
        let nunits = self.nr_units(body) as u64;
        let same_object = key.locality() == item_key.locality()
            && key.objectid() == item_key.objectid()
            && key.el(0) == item_key.el(0);
        if same_object && key.offset() >= item_key.offset() {
            let off = key.offset() - item_key.offset();
            if off < nunits {
                return UnitLookup {
                    unit_pos: off as usize,
                    between: Between::AtUnit,
                    found: true,
                };
            }
        }
        let _ = env;
        UnitLookup {
            unit_pos: nunits as usize - 1,
            between: Between::AfterUnit,
            found: matches!(bias, LookupBias::MaxNotGreater),
        }
    }
    fn mergeable(
        &self,
        env: &ItemEnv,
        left_key: &Key,
        left_body: &[u8],
        right_id: ItemId,
        right_key: &Key,
    ) -> bool {
        let _ = env;
        right_id == ItemId::Tail
            && left_key.el(0) == right_key.el(0)
            && left_key.objectid() == right_key.objectid()
            && left_key.offset() + left_body.len() as u64 == right_key.offset()
    }
    fn can_contain_key(&self, _: &ItemEnv, item_key: &Key, body: &[u8], key: &Key) -> bool {
        item_key.el(0) == key.el(0)
            && item_key.objectid() == key.objectid()
            && key.offset() >= item_key.offset()
            && key.offset() <= item_key.offset() + body.len() as u64
    }
}

/*
    extent
*/

pub struct ExtentItem;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ExtentUnit {
    pub start: u64,
    pub width: u64,
}

impl ExtentUnit {
    pub const fn is_hole(&self) -> bool {
        self.start == EXTENT_HOLE
    }
    pub const fn is_unallocated(&self) -> bool {
        self.start == EXTENT_UNALLOCATED
    }
    pub const fn is_real(&self) -> bool {
        !self.is_hole() && !self.is_unallocated()
    }
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.start.to_le_bytes());
        buf[8..16].copy_from_slice(&self.width.to_le_bytes());
    }
    pub fn encode(&self) -> [u8; EXTENT_UNIT_SIZE] {
        let mut buf = [0u8; EXTENT_UNIT_SIZE];
        self.encode_into(&mut buf);
        buf
    }
}

impl ExtentItem {
    pub fn unit(body: &[u8], unit: usize) -> ExtentUnit {
        let at = unit * EXTENT_UNIT_SIZE;
        let mut s = [0u8; 8];
        let mut w = [0u8; 8];
        s.copy_from_slice(&body[at..at + 8]);
        w.copy_from_slice(&body[at + 8..at + 16]);
        ExtentUnit {
            start: u64::from_le_bytes(s),
            width: u64::from_le_bytes(w),
        }
    }
    pub fn set_unit(body: &mut [u8], unit: usize, v: ExtentUnit) {
        let at = unit * EXTENT_UNIT_SIZE;
        v.encode_into(&mut body[at..at + EXTENT_UNIT_SIZE]);
    }
    /// total blocks covered by the item
    pub fn width_sum(body: &[u8]) -> u64 {
        body.chunks_exact(EXTENT_UNIT_SIZE)
            .map(|c| Self::unit(c, 0).width)
            .sum()
    }
    /// blocks covered by the units before `unit`
    pub fn width_before(body: &[u8], unit: usize) -> u64 {
        (0..unit).map(|u| Self::unit(body, u).width).sum()
    }
    pub fn build(units: &[ExtentUnit]) -> Vec<u8> {
        let mut out = Vec::with_capacity(units.len() * EXTENT_UNIT_SIZE);
        for u in units {
            out.extend_from_slice(&u.encode());
        }
        out
    }
}

impl ItemOps for ExtentItem {
    fn id(&self) -> ItemId {
        ItemId::Extent
    }
    fn unit_size(&self) -> usize {
        EXTENT_UNIT_SIZE
    }
    fn lookup(
        &self,
        env: &ItemEnv,
        item_key: &Key,
        body: &[u8],
        key: &Key,
        bias: LookupBias,
    ) -> UnitLookup {
        let nunits = self.nr_units(body);
        let same_object = key.el(0) == item_key.el(0) && key.objectid() == item_key.objectid();
        if same_object && key.offset() >= item_key.offset() {
            let mut off = item_key.offset();
            for u in 0..nunits {
                let ext = Self::unit(body, u);
                let span = ext.width * env.block_size as u64;
                if key.offset() < off + span {
                    return UnitLookup {
                        unit_pos: u,
                        between: Between::AtUnit,
                        found: true,
                    };
                }
                off += span;
            }
        }
        UnitLookup {
            unit_pos: nunits - 1,
            between: Between::AfterUnit,
            found: matches!(bias, LookupBias::MaxNotGreater),
        }
    }
    fn mergeable(
        &self,
        env: &ItemEnv,
        left_key: &Key,
        left_body: &[u8],
        right_id: ItemId,
        right_key: &Key,
    ) -> bool {
        right_id == ItemId::Extent
            && left_key.el(0) == right_key.el(0)
            && left_key.objectid() == right_key.objectid()
            && left_key.offset() + Self::width_sum(left_body) * env.block_size as u64
                == right_key.offset()
    }
    fn can_contain_key(&self, env: &ItemEnv, item_key: &Key, body: &[u8], key: &Key) -> bool {
        let span = Self::width_sum(body) * env.block_size as u64;
        item_key.el(0) == key.el(0)
            && item_key.objectid() == key.objectid()
            && key.offset() >= item_key.offset()
            && key.offset() <= item_key.offset() + span
    }
    fn kill_units(&self, _: &ItemEnv, _: &Key, units: &[u8], ctx: &mut KillCtx) {
        for chunk in units.chunks_exact(EXTENT_UNIT_SIZE) {
            let ext = Self::unit(chunk, 0);
            if ext.is_real() {
                ctx.record(ext.start, ext.width);
            }
        }
    }
    fn utmost_child_block(&self, body: &[u8], side: Side) -> Option<u64> {
        if body.is_empty() {
            return None;
        }
        let unit = match side {
            Side::Left => Self::unit(body, 0),
            Side::Right => Self::unit(body, self.nr_units(body) - 1),
        };
        if unit.is_real() {
            // rightmost block of the run for the right side
            Some(match side {
                Side::Left => unit.start,
                Side::Right => unit.start + unit.width - 1,
            })
        } else {
            None
        }
    }
}

/*
    dispatch
*/

static INTERNAL: InternalItem = InternalItem;
static TAIL: TailItem = TailItem;
static EXTENT: ExtentItem = ExtentItem;

pub fn item_ops(id: ItemId) -> &'static dyn ItemOps {
    match id {
        ItemId::Internal => &INTERNAL,
        ItemId::Tail => &TAIL,
        ItemId::Extent => &EXTENT,
    }
}

/// Unit key computation that has the body at hand (extents advance by
/// run widths, everything else by fixed strides).
pub fn unit_key_by_body(env: &ItemEnv, id: ItemId, item_key: &Key, body: &[u8], unit: usize) -> Key {
    match id {
        ItemId::Extent => item_key.with_offset(
            item_key.offset() + ExtentItem::width_before(body, unit) * env.block_size as u64,
        ),
        ItemId::Tail => item_key.with_offset(item_key.offset() + unit as u64),
        ItemId::Internal => *item_key,
    }
}
