/*
 * Created on Wed Jan 17 2024
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
    fs40 node format:

    [ node header | item 0, item 1, .., item N-1 | free space | item_head N-1, .., item_head 1, item_head 0 ]

    node header                     item header
      plugin_id (16)                  key (192)
      free_space (16)                 plugin_id (16)
      free_space_start (16)           offset (16)
      level (8)
      num_items (16)
      magic (32)
      flush_time (32)

    All multi-byte fields little-endian. Free space is the contiguous
    gap between the end of the item region and the tail of the item
    header array.
*/

use {
    super::{
        items::{item_ops, unit_key_by_body, ItemId, KillCtx},
        CutOutcome, CutRange, ItemData, ItemEnv, LookupBias, NodeLayout, NodeNotify, NodeSearch,
        ShiftOutcome, FS40_NODE_ID,
    },
    crate::engine::{
        config::SEQ_SEARCH_BREAK,
        coord::{Between, Coord, CoordHost, Side},
        error::{TreeError, TreeResult},
        key::{Key, KeyScheme, KEY_SIZE},
    },
    core::cmp::Ordering,
};

/// magic stored in every node header
pub const NODE_MAGIC: u32 = 0x52344653;

pub const NODE_HEADER_SIZE: usize = 24;
pub const ITEM_HEADER_SIZE: usize = KEY_SIZE + 4;

// node header field offsets
const NH_PLUGIN: usize = 0;
const NH_FREE_SPACE: usize = 2;
const NH_FREE_START: usize = 4;
const NH_LEVEL: usize = 6;
const NH_NUM_ITEMS: usize = 8;
const NH_MAGIC: usize = 10;
const NH_FLUSH_TIME: usize = 14;

// item header field offsets (relative to the header)
const IH_KEY: usize = 0;
const IH_PLUGIN: usize = KEY_SIZE;
const IH_OFFSET: usize = KEY_SIZE + 2;

#[inline(always)]
fn r16(d: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([d[at], d[at + 1]])
}
#[inline(always)]
fn w16(d: &mut [u8], at: usize, v: u16) {
    d[at..at + 2].copy_from_slice(&v.to_le_bytes());
}
#[inline(always)]
fn r32(d: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([d[at], d[at + 1], d[at + 2], d[at + 3]])
}
#[inline(always)]
fn w32(d: &mut [u8], at: usize, v: u32) {
    d[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

/*
    header accessors
*/

fn nh_free_space(d: &[u8]) -> usize {
    r16(d, NH_FREE_SPACE) as usize
}
fn nh_set_free_space(d: &mut [u8], v: usize) {
    w16(d, NH_FREE_SPACE, v as u16)
}
fn nh_free_start(d: &[u8]) -> usize {
    r16(d, NH_FREE_START) as usize
}
fn nh_set_free_start(d: &mut [u8], v: usize) {
    w16(d, NH_FREE_START, v as u16)
}
fn nh_num_items(d: &[u8]) -> usize {
    r16(d, NH_NUM_ITEMS) as usize
}
fn nh_set_num_items(d: &mut [u8], v: usize) {
    w16(d, NH_NUM_ITEMS, v as u16)
}
fn nh_level(d: &[u8]) -> u8 {
    d[NH_LEVEL]
}

/*
    item header accessors
*/

#[inline(always)]
fn ih_at(d: &[u8], pos: usize) -> usize {
    d.len() - ITEM_HEADER_SIZE * (pos + 1)
}
fn ih_key(d: &[u8], pos: usize) -> Key {
    let at = ih_at(d, pos);
    Key::decode(&d[at + IH_KEY..at + IH_KEY + KEY_SIZE])
}
fn ih_set_key(d: &mut [u8], pos: usize, key: &Key) {
    let at = ih_at(d, pos);
    key.encode_into(&mut d[at + IH_KEY..at + IH_KEY + KEY_SIZE]);
}
fn ih_plugin(d: &[u8], pos: usize) -> u16 {
    r16(d, ih_at(d, pos) + IH_PLUGIN)
}
fn ih_set_plugin(d: &mut [u8], pos: usize, id: u16) {
    let at = ih_at(d, pos);
    w16(d, at + IH_PLUGIN, id)
}
fn ih_offset(d: &[u8], pos: usize) -> usize {
    r16(d, ih_at(d, pos) + IH_OFFSET) as usize
}
fn ih_set_offset(d: &mut [u8], pos: usize, v: usize) {
    let at = ih_at(d, pos);
    w16(d, at + IH_OFFSET, v as u16)
}

fn item_len(d: &[u8], pos: usize) -> usize {
    let end = if pos + 1 == nh_num_items(d) {
        nh_free_start(d)
    } else {
        ih_offset(d, pos + 1)
    };
    end - ih_offset(d, pos)
}

fn item_id(d: &[u8], pos: usize) -> ItemId {
    match ItemId::from_raw(ih_plugin(d, pos)) {
        Some(id) => id,
        None => impossible!("unknown item plugin in a validated node"),
    }
}

fn ops_at(d: &[u8], pos: usize) -> &'static dyn super::items::ItemOps {
    item_ops(item_id(d, pos))
}

fn units_at(d: &[u8], pos: usize) -> usize {
    ops_at(d, pos).nr_units(item_body_at(d, pos))
}

fn item_body_at(d: &[u8], pos: usize) -> &[u8] {
    let off = ih_offset(d, pos);
    &d[off..off + item_len(d, pos)]
}

fn unit_key_at(env: &ItemEnv, d: &[u8], pos: usize, unit: usize) -> Key {
    unit_key_by_body(
        env,
        item_id(d, pos),
        &ih_key(d, pos),
        item_body_at(d, pos),
        unit,
    )
}

/// are two adjacent items logically combinable?
fn items_mergeable(env: &ItemEnv, left: &[u8], lpos: usize, right: &[u8], rpos: usize) -> bool {
    item_ops(item_id(left, lpos)).mergeable(
        env,
        &ih_key(left, lpos),
        item_body_at(left, lpos),
        item_id(right, rpos),
        &ih_key(right, rpos),
    )
}

/// A borrowed view of a node that coords can navigate
pub struct NodeView<'a> {
    pub env: ItemEnv,
    pub data: &'a [u8],
}

impl<'a> NodeView<'a> {
    pub fn new(env: ItemEnv, data: &'a [u8]) -> Self {
        Self { env, data }
    }
}

impl<'a> CoordHost for NodeView<'a> {
    fn num_items(&self) -> usize {
        nh_num_items(self.data)
    }
    fn num_units(&self, item_pos: usize) -> usize {
        units_at(self.data, item_pos)
    }
}

/// The fs40 node layout plugin
pub struct Fs40;

impl Fs40 {
    pub fn view<'a>(env: ItemEnv, data: &'a [u8]) -> NodeView<'a> {
        NodeView::new(env, data)
    }
}

/*
    shift bookkeeping, mirrors what the estimation pass discovers
*/

#[derive(Debug, Default, Clone, Copy)]
struct ShiftPlan {
    /// last (left shift) or first (right shift) unit that will really move
    real_stop: Coord,
    /// units merged into the target's boundary item
    merging_units: usize,
    merging_bytes: usize,
    /// items moved in their entirety
    entire: usize,
    entire_bytes: usize,
    /// units of the one partially moved item
    part_units: usize,
    part_bytes: usize,
    /// total body bytes moving (headers not included)
    shift_bytes: usize,
    /// everything wanted was found movable
    everything: bool,
}

impl NodeLayout for Fs40 {
    fn id(&self) -> u16 {
        FS40_NODE_ID
    }

    fn init(&self, data: &mut [u8], level: u8) {
        let size = data.len();
        data[..NODE_HEADER_SIZE].fill(0);
        w16(data, NH_PLUGIN, FS40_NODE_ID);
        nh_set_free_space(data, size - NODE_HEADER_SIZE);
        nh_set_free_start(data, NODE_HEADER_SIZE);
        data[NH_LEVEL] = level;
        nh_set_num_items(data, 0);
        w32(data, NH_MAGIC, NODE_MAGIC);
    }

    fn parse(&self, data: &[u8], expected_level: u8) -> TreeResult<()> {
        if r32(data, NH_MAGIC) != NODE_MAGIC {
            log::warn!(
                "wrong magic in tree node: {:#x} != {:#x}",
                r32(data, NH_MAGIC),
                NODE_MAGIC
            );
            return Err(TreeError::Io);
        }
        if nh_level(data) != expected_level {
            log::warn!(
                "wrong level found in node: {} != {}",
                nh_level(data),
                expected_level
            );
            return Err(TreeError::Io);
        }
        Ok(())
    }

    fn guess(&self, data: &[u8]) -> bool {
        r32(data, NH_MAGIC) == NODE_MAGIC && r16(data, NH_PLUGIN) == FS40_NODE_ID
    }

    fn free_space(&self, data: &[u8]) -> usize {
        nh_free_space(data)
    }
    fn num_items(&self, data: &[u8]) -> usize {
        nh_num_items(data)
    }
    fn level(&self, data: &[u8]) -> u8 {
        nh_level(data)
    }
    fn flush_stamp(&self, data: &mut [u8], stamp: u32) {
        w32(data, NH_FLUSH_TIME, stamp);
    }
    fn item_overhead(&self) -> usize {
        ITEM_HEADER_SIZE
    }
    fn max_item_size(&self, block_size: usize) -> usize {
        block_size - NODE_HEADER_SIZE - ITEM_HEADER_SIZE
    }

    fn key_at(&self, data: &[u8], pos: usize) -> Key {
        ih_key(data, pos)
    }
    fn item_id_at(&self, data: &[u8], pos: usize) -> u16 {
        ih_plugin(data, pos)
    }
    fn item_len(&self, data: &[u8], pos: usize) -> usize {
        item_len(data, pos)
    }
    fn item_body<'a>(&self, data: &'a [u8], pos: usize) -> &'a [u8] {
        item_body_at(data, pos)
    }
    fn item_body_mut<'a>(&self, data: &'a mut [u8], pos: usize) -> &'a mut [u8] {
        let off = ih_offset(data, pos);
        let len = item_len(data, pos);
        &mut data[off..off + len]
    }
    fn units_of(&self, _env: &ItemEnv, data: &[u8], pos: usize) -> usize {
        units_at(data, pos)
    }
    fn unit_key_at(&self, env: &ItemEnv, data: &[u8], pos: usize, unit: usize) -> Key {
        unit_key_at(env, data, pos, unit)
    }

    fn lookup(
        &self,
        env: &ItemEnv,
        data: &[u8],
        key: &Key,
        bias: LookupBias,
    ) -> TreeResult<(Coord, NodeSearch)> {
        let nitems = nh_num_items(data);
        if nitems == 0 {
            return Ok((
                Coord {
                    item_pos: 0,
                    unit_pos: 0,
                    between: Between::EmptyNode,
                },
                NodeSearch::NotFound,
            ));
        }

        // Sequential scan beats binary search on small arrays: better
        // loop optimization and friendlier to the CPU cache. Keys are
        // scanned in descending item order because item headers grow
        // from the node's end toward its head.
        let mut left: usize = 0;
        let mut found = false;
        if nitems <= SEQ_SEARCH_BREAK {
            let mut pos = nitems;
            loop {
                if pos == 0 {
                    left = 0;
                    break;
                }
                pos -= 1;
                match env.scheme.keycmp(&ih_key(data, pos), key) {
                    Ordering::Greater => continue,
                    Ordering::Equal => {
                        left = pos;
                        found = true;
                        break;
                    }
                    Ordering::Less => {
                        left = pos;
                        break;
                    }
                }
            }
        } else {
            // greatest item whose key is not greater than the target;
            // converges on item 0 when every key is greater
            let mut lo: usize = 0;
            let mut hi: usize = nitems - 1;
            while lo < hi {
                let median = (lo + hi + 1) / 2;
                if env.scheme.keyle(&ih_key(data, median), key) {
                    lo = median;
                } else {
                    hi = median - 1;
                }
            }
            left = lo;
            found = env.scheme.keycmp(&ih_key(data, left), key) == Ordering::Equal;
        }

        let mut coord = Coord {
            item_pos: left,
            unit_pos: 0,
            between: Between::AtUnit,
        };

        let item_key = ih_key(data, left);
        if !found && env.scheme.keygt(&item_key, key) {
            // key is less than the leftmost key in the node. Valid only
            // for item 0; anywhere else the keys are out of order.
            if left != 0 {
                log::warn!("key less than {left} key in a node");
                return Err(TreeError::Io);
            }
            coord.between = Between::BeforeUnit;
            return Ok((coord, NodeSearch::NotFound));
        }

        let Some(id) = ItemId::from_raw(ih_plugin(data, left)) else {
            log::warn!("unknown item plugin {}", ih_plugin(data, left));
            return Err(TreeError::Io);
        };
        if found {
            return Ok((coord, NodeSearch::Found));
        }
        // delegate intra-item positioning to the item plugin
        let ul = item_ops(id).lookup(env, &item_key, item_body_at(data, left), key, bias);
        coord.unit_pos = ul.unit_pos;
        coord.between = ul.between;
        Ok((
            coord,
            if ul.found {
                NodeSearch::Found
            } else {
                NodeSearch::NotFound
            },
        ))
    }

    fn create_item(
        &self,
        env: &ItemEnv,
        data: &mut [u8],
        coord: &mut Coord,
        key: &Key,
        item: &ItemData,
        notify: &mut NodeNotify,
    ) {
        let nitems = nh_num_items(data);
        let len = item.len();
        debug_assert!(nh_free_space(data) >= len + ITEM_HEADER_SIZE);
        {
            let view = NodeView::new(*env, data);
            debug_assert!(coord.is_between_items(&view) || nitems == 0);
        }

        // the new item takes the position of whatever is to the right
        let pos = {
            let view = NodeView::new(*env, data);
            let mut probe = *coord;
            if probe.set_to_right(&view) {
                nitems
            } else {
                probe.item_pos
            }
        };

        let offset;
        if pos < nitems {
            // slide later items right to make room for the body
            offset = ih_offset(data, pos);
            let free_start = nh_free_start(data);
            data.copy_within(offset..free_start, offset + len);
            for i in pos..nitems {
                ih_set_offset(data, i, ih_offset(data, i) + len);
            }
            // slide their headers one slot toward the node head
            let hdr_lo = ih_at(data, nitems - 1);
            let hdr_hi = ih_at(data, pos) + ITEM_HEADER_SIZE;
            data.copy_within(hdr_lo..hdr_hi, hdr_lo - ITEM_HEADER_SIZE);
        } else {
            offset = nh_free_start(data);
        }

        nh_set_num_items(data, nitems + 1);
        ih_set_key(data, pos, key);
        ih_set_plugin(data, pos, item.plugin.raw());
        ih_set_offset(data, pos, offset);
        data[offset..offset + len].copy_from_slice(&item.bytes);

        nh_set_free_space(data, nh_free_space(data) - len - ITEM_HEADER_SIZE);
        nh_set_free_start(data, nh_free_start(data) + len);

        coord.item_pos = pos;
        coord.unit_pos = 0;
        coord.between = Between::AtUnit;

        if pos == 0 {
            // left delimiting key has to be updated
            notify.first_key_changed = true;
        }
    }

    fn update_item_key(&self, data: &mut [u8], pos: usize, key: &Key, notify: &mut NodeNotify) {
        ih_set_key(data, pos, key);
        if pos == 0 {
            notify.first_key_changed = true;
        }
    }

    fn change_item_size(&self, data: &mut [u8], pos: usize, by: isize) {
        let off = ih_offset(data, pos);
        let len = item_len(data, pos);
        let free_start = nh_free_start(data);
        let nitems = nh_num_items(data);
        debug_assert!(by >= 0 || len as isize + by >= 0);
        debug_assert!(by <= nh_free_space(data) as isize);

        // move everything after this item
        let src = off + len;
        let dst = (src as isize + by) as usize;
        data.copy_within(src..free_start, dst);
        for i in pos + 1..nitems {
            ih_set_offset(data, i, (ih_offset(data, i) as isize + by) as usize);
        }
        nh_set_free_space(data, (nh_free_space(data) as isize - by) as usize);
        nh_set_free_start(data, (free_start as isize + by) as usize);
    }

    fn cut(
        &self,
        env: &ItemEnv,
        data: &mut [u8],
        range: &CutRange,
        mut kill: Option<&mut KillCtx>,
        notify: &mut NodeNotify,
    ) -> TreeResult<CutOutcome> {
        let from = range.from;
        let to = range.to;
        let nitems = nh_num_items(data);
        debug_assert!(nitems > 0);
        debug_assert!(from.item_pos <= to.item_pos);
        debug_assert!(ergo!(
            from.item_pos == to.item_pos,
            from.unit_pos <= to.unit_pos
        ));

        let old_first_key = ih_key(data, 0);
        let smallest = unit_key_at(env, data, from.item_pos, from.unit_pos);

        let mut kill_item = |d: &[u8], pos: usize, from_u: usize, to_u: usize, k: &mut Option<&mut KillCtx>| {
            if let Some(ctx) = k.as_deref_mut() {
                let ops = ops_at(d, pos);
                let usz = ops.unit_size();
                let body = item_body_at(d, pos);
                ops.kill_units(
                    env,
                    &ih_key(d, pos),
                    &body[from_u * usz..(to_u + 1) * usz],
                    ctx,
                );
            }
        };

        let first_removed: usize;
        let mut removed: usize;
        let freed_start: usize;
        let freed_end: usize;
        // the rightmost item that keeps its offset; isize because the
        // answer can be "none" (-1)
        let rightmost_not_moved: isize;
        // item that may be left with a stale key
        let mut wrong_item: Option<usize> = None;

        if from.item_pos == to.item_pos {
            let pos = from.item_pos;
            let usz = ops_at(data, pos).unit_size();
            let len = item_len(data, pos);
            let nunits = units_at(data, pos);
            debug_assert!(to.unit_pos < nunits);
            let cut_size = (to.unit_pos - from.unit_pos + 1) * usz;
            kill_item(data, pos, from.unit_pos, to.unit_pos, &mut kill);
            let off = ih_offset(data, pos);

            if cut_size == len {
                // whole item goes
                first_removed = pos;
                removed = 1;
                freed_start = off;
                freed_end = off + cut_size;
                rightmost_not_moved = pos as isize - 1;
            } else if from.unit_pos == 0 {
                // head cut: freed space is at the item's beginning
                first_removed = pos;
                removed = 0;
                freed_start = off;
                freed_end = off + cut_size;
                rightmost_not_moved = pos as isize - 1;
                ih_set_offset(data, pos, freed_end);
                wrong_item = Some(pos);
            } else if to.unit_pos == nunits - 1 {
                // tail cut: freed space is at the item's end
                first_removed = pos;
                removed = 0;
                freed_start = off + len - cut_size;
                freed_end = off + len;
                rightmost_not_moved = pos as isize;
            } else {
                // middle cut: close the gap inside the item, leaving the
                // freed space at its end
                let suffix_at = off + (to.unit_pos + 1) * usz;
                let item_end = off + len;
                data.copy_within(suffix_at..item_end, off + from.unit_pos * usz);
                first_removed = pos;
                removed = 0;
                freed_start = off + len - cut_size;
                freed_end = off + len;
                rightmost_not_moved = pos as isize;
            }
        } else {
            first_removed = from.item_pos + 1;
            removed = to.item_pos - from.item_pos - 1;
            let mut first_removed = first_removed;
            let mut rightmost = from.item_pos as isize;

            // middle items are removed entirely; run their kill hooks
            for pos in from.item_pos + 1..to.item_pos {
                let n = units_at(data, pos);
                kill_item(data, pos, 0, n - 1, &mut kill);
            }

            // tail of the @from item
            let usz1 = ops_at(data, from.item_pos).unit_size();
            let len1 = item_len(data, from.item_pos);
            let last1 = units_at(data, from.item_pos) - 1;
            let cut1 = (last1 - from.unit_pos + 1) * usz1;
            kill_item(data, from.item_pos, from.unit_pos, last1, &mut kill);
            if cut1 == len1 {
                first_removed -= 1;
                removed += 1;
                rightmost -= 1;
            }
            freed_start = ih_offset(data, from.item_pos) + len1 - cut1;

            // head of the @to item
            let usz2 = ops_at(data, to.item_pos).unit_size();
            let len2 = item_len(data, to.item_pos);
            let cut2 = (to.unit_pos + 1) * usz2;
            kill_item(data, to.item_pos, 0, to.unit_pos, &mut kill);
            if cut2 == len2 {
                removed += 1;
            } else {
                wrong_item = Some(to.item_pos);
            }
            freed_end = ih_offset(data, to.item_pos) + cut2;
            ih_set_offset(data, to.item_pos, freed_end);

            rightmost_not_moved = rightmost;
            return self.cut_finish(
                env,
                data,
                CutFinish {
                    nitems,
                    first_removed,
                    removed,
                    freed_start,
                    freed_end,
                    rightmost_not_moved,
                    wrong_item,
                    old_first_key,
                    smallest,
                },
                notify,
            );
        }

        self.cut_finish(
            env,
            data,
            CutFinish {
                nitems,
                first_removed,
                removed,
                freed_start,
                freed_end,
                rightmost_not_moved,
                wrong_item,
                old_first_key,
                smallest,
            },
            notify,
        )
    }

    fn shift(
        &self,
        env: &ItemEnv,
        src: &mut [u8],
        dst: &mut [u8],
        from: &mut Coord,
        side: Side,
        move_coord: bool,
        notify: &mut NodeNotify,
    ) -> TreeResult<ShiftOutcome> {
        let mut out = ShiftOutcome::default();

        // resolve the stop coord: the rightmost/leftmost unit among the
        // units we are allowed to move
        let mut wish_stop = *from;
        let nothing = {
            let view = NodeView::new(*env, src);
            if view.is_empty() {
                true
            } else {
                match side {
                    Side::Left => wish_stop.set_to_left(&view),
                    Side::Right => wish_stop.set_to_right(&view),
                }
            }
        };
        if nothing {
            // move the insertion coord even though there is nothing to move
            if move_coord {
                let view = NodeView::new(*env, dst);
                match side {
                    Side::Left => {
                        *from = Coord::last_unit(&view);
                        from.between = Between::AfterUnit;
                    }
                    Side::Right => {
                        *from = Coord::first_unit(&view);
                        from.between = Between::BeforeUnit;
                    }
                }
                out.moved_coord = true;
            }
            return Ok(out);
        }

        let plan = self.estimate_shift(env, src, dst, &wish_stop, side);
        if plan.shift_bytes == 0 {
            return Ok(out);
        }

        self.copy_shifted(env, src, dst, &plan, side);

        // cut what was copied out of the source
        let removed = {
            let (cut_from, cut_to) = match side {
                Side::Left => {
                    let f = Coord {
                        item_pos: 0,
                        unit_pos: 0,
                        between: Between::AtUnit,
                    };
                    (f, plan.real_stop)
                }
                Side::Right => {
                    let view = NodeView::new(*env, src);
                    (plan.real_stop, Coord::last_unit(&view))
                }
            };
            let mut scratch = NodeNotify::default();
            let outcome = self.cut(
                env,
                src,
                &CutRange {
                    from: cut_from,
                    to: cut_to,
                },
                None,
                &mut scratch,
            )?;
            outcome.removed_items
        };

        out.bytes = plan.shift_bytes;
        out.source_emptied = nh_num_items(src) == 0;
        out.moved_coord = self.adjust_coord(env, src, dst, from, &plan, side, removed, move_coord);
        if out.bytes > 0 {
            // data moved between the nodes: both delimiting keys and the
            // parent pointers are now stale on one side
            notify.first_key_changed = true;
        }
        Ok(out)
    }

    fn check(
        &self,
        env: &ItemEnv,
        data: &[u8],
        dk: Option<(&Key, &Key)>,
    ) -> Result<(), &'static str> {
        if r32(data, NH_MAGIC) != NODE_MAGIC {
            return Err("bad magic");
        }
        let nitems = nh_num_items(data);
        let size = data.len();
        if nh_free_start(data) + nh_free_space(data) + nitems * ITEM_HEADER_SIZE != size {
            return Err("space accounting broken");
        }
        // with delimiting keys supplied, the whole key run must sit
        // inside [ld, rd]; seeding prev with ld covers the first item
        let mut prev = match dk {
            Some((ld, _)) => *ld,
            None => crate::engine::key::MIN_KEY,
        };
        let mut old_offset = 0usize;
        for pos in 0..nitems {
            let off = ih_offset(data, pos);
            if off >= size - nitems * ITEM_HEADER_SIZE || off < NODE_HEADER_SIZE {
                return Err("offset is out of bounds");
            }
            if off <= old_offset && pos != 0 {
                return Err("offsets are in wrong order");
            }
            if pos == 0 && off != NODE_HEADER_SIZE {
                return Err("wrong offset of first item");
            }
            old_offset = off;
            if ItemId::from_raw(ih_plugin(data, pos)).is_none() {
                return Err("unknown item plugin");
            }
            let key = ih_key(data, pos);
            if pos > 0 && env.scheme.keyge(&prev, &key) {
                return Err("keys are in wrong order");
            }
            if pos == 0 && dk.is_some() && env.scheme.keygt(&prev, &key) {
                return Err("first key is less than ldkey");
            }
            let units = units_at(data, pos);
            if units == 0 {
                return Err("item with no units");
            }
            let mut uprev = key;
            for u in 1..units {
                let uk = unit_key_at(env, data, pos, u);
                if env.scheme.keygt(&uprev, &uk) {
                    return Err("unit keys are in wrong order");
                }
                uprev = uk;
            }
            prev = uprev;
            if pos > 0 && items_mergeable(env, data, pos - 1, data, pos) {
                return Err("mergeable items in one node");
            }
        }
        if let Some((ld, rd)) = dk {
            if env.scheme.keygt(ld, rd) {
                return Err("ldkey is greater than rdkey");
            }
            if env.scheme.keygt(&prev, rd) {
                return Err("last key is greater than rdkey");
            }
        }
        Ok(())
    }
}

/// bookkeeping handed from the cut analysis to the compaction step
struct CutFinish {
    nitems: usize,
    first_removed: usize,
    removed: usize,
    freed_start: usize,
    freed_end: usize,
    rightmost_not_moved: isize,
    wrong_item: Option<usize>,
    old_first_key: Key,
    smallest: Key,
}

impl Fs40 {
    fn cut_finish(
        &self,
        env: &ItemEnv,
        data: &mut [u8],
        f: CutFinish,
        notify: &mut NodeNotify,
    ) -> TreeResult<CutOutcome> {
        let CutFinish {
            nitems,
            first_removed,
            removed,
            freed_start,
            freed_end,
            rightmost_not_moved,
            wrong_item,
            old_first_key,
            smallest,
        } = f;
        let gap = freed_end - freed_start;

        // compact item bodies over the freed gap
        let free_start = nh_free_start(data);
        data.copy_within(freed_end..free_start, freed_start);

        // offsets of every item past the gap shrink by the gap
        let first_moved = (rightmost_not_moved + 1) as usize + removed;
        for pos in first_moved..nitems {
            ih_set_offset(data, pos, ih_offset(data, pos) - gap);
        }

        // drop the headers of wholly removed items
        if removed > 0 {
            let lo = ih_at(data, nitems - 1);
            let hi = ih_at(data, first_removed + removed) + ITEM_HEADER_SIZE;
            if hi > lo {
                data.copy_within(lo..hi, lo + removed * ITEM_HEADER_SIZE);
            }
        }

        nh_set_num_items(data, nitems - removed);
        nh_set_free_start(data, free_start - gap);
        nh_set_free_space(
            data,
            nh_free_space(data) + gap + removed * ITEM_HEADER_SIZE,
        );

        // a partially cut item may be left with a stale key
        if let Some(wi) = wrong_item {
            let wi = wi - removed;
            debug_assert!(wi < nh_num_items(data));
            let fixed = unit_key_at(env, data, wi, 0);
            self.update_item_key(data, wi, &fixed, notify);
        }

        if nh_num_items(data) == 0 {
            notify.emptied = true;
        } else if ih_key(data, 0) != old_first_key {
            notify.first_key_changed = true;
        }

        Ok(CutOutcome {
            removed_items: removed,
            freed_bytes: gap,
            smallest_removed: Some(smallest),
        })
    }

    /// how many units of the item at `source` do we want moved, bounded
    /// by the stop coord
    fn wanted_units(src: &[u8], source: &Coord, stop: &Coord, side: Side) -> usize {
        if source.item_pos != stop.item_pos {
            return units_at(src, source.item_pos);
        }
        match side {
            Side::Left => stop.unit_pos + 1,
            Side::Right => source.unit_pos - stop.unit_pos + 1,
        }
    }

    /// figure out what can be moved from `src` into `dst`
    fn estimate_shift(
        &self,
        env: &ItemEnv,
        src: &[u8],
        dst: &[u8],
        wish_stop: &Coord,
        side: Side,
    ) -> ShiftPlan {
        let mut plan = ShiftPlan::default();
        let src_view = NodeView::new(*env, src);
        let mut source = match side {
            Side::Left => Coord::first_unit(&src_view),
            Side::Right => Coord::last_unit(&src_view),
        };
        plan.real_stop = source;

        let mut free = nh_free_space(dst);
        let dir: isize = match side {
            Side::Left => 1,
            Side::Right => -1,
        };

        // boundary merge: can the facing items be glued?
        if nh_num_items(dst) != 0 {
            let merge_ok = match side {
                Side::Left => items_mergeable(env, dst, nh_num_items(dst) - 1, src, 0),
                Side::Right => items_mergeable(env, src, nh_num_items(src) - 1, dst, 0),
            };
            if merge_ok {
                let want = Self::wanted_units(src, &source, wish_stop, side);
                let usz = ops_at(src, source.item_pos).unit_size();
                let can = want.min(free / usz);
                plan.merging_units = can;
                plan.merging_bytes = can * usz;
                plan.shift_bytes += plan.merging_bytes;
                plan.real_stop = source;
                plan.real_stop.unit_pos = match side {
                    Side::Left => can.wrapping_sub(1),
                    Side::Right => source.unit_pos + 1 - can,
                };
                if can != want {
                    return plan;
                }
                free -= plan.merging_bytes;
                source.item_pos = (source.item_pos as isize + dir) as usize;
            }
        }

        // whole items, then at most one partial item
        let stop_item = wish_stop.item_pos as isize + dir;
        let mut ipos = source.item_pos as isize;
        while ipos != stop_item && ipos >= 0 && (ipos as usize) < nh_num_items(src) {
            let pos = ipos as usize;
            source.item_pos = pos;
            source.unit_pos = match side {
                Side::Left => 0,
                Side::Right => units_at(src, pos) - 1,
            };
            let want = Self::wanted_units(src, &source, wish_stop, side);
            let nunits = units_at(src, pos);
            let len = item_len(src, pos);
            if want == nunits {
                let size = len + ITEM_HEADER_SIZE;
                if size <= free {
                    // fits entirely
                    free -= size;
                    plan.shift_bytes += len;
                    plan.entire_bytes += len;
                    plan.entire += 1;
                    plan.real_stop = source;
                    plan.real_stop.unit_pos = match side {
                        Side::Left => nunits - 1,
                        Side::Right => 0,
                    };
                    ipos += dir;
                    continue;
                }
            }
            // partial item: pay the creation overhead first
            let usz = ops_at(src, pos).unit_size();
            if free >= ITEM_HEADER_SIZE {
                free -= ITEM_HEADER_SIZE;
                plan.part_units = want.min(free / usz);
            } else {
                plan.part_units = 0;
            }
            plan.part_bytes = plan.part_units * usz;
            plan.shift_bytes += plan.part_bytes;
            if plan.part_units > 0 {
                plan.real_stop = source;
                plan.real_stop.unit_pos = match side {
                    Side::Left => plan.part_units - 1,
                    Side::Right => nunits - plan.part_units,
                };
            }
            if want != plan.part_units {
                return plan;
            }
            break;
        }
        plan.everything = true;
        plan
    }

    /// copy the planned region between the node images
    fn copy_shifted(&self, env: &ItemEnv, src: &[u8], dst: &mut [u8], plan: &ShiftPlan, side: Side) {
        match side {
            Side::Left => self.copy_left(env, src, dst, plan),
            Side::Right => self.copy_right(env, src, dst, plan),
        }
    }

    fn copy_left(&self, env: &ItemEnv, src: &[u8], dst: &mut [u8], plan: &ShiftPlan) {
        let mut from_item = 0usize;
        if plan.merging_units > 0 {
            // append to the target's last item
            let usz = ops_at(src, 0).unit_size();
            let body = item_body_at(src, 0);
            let at = nh_free_start(dst);
            dst[at..at + plan.merging_bytes]
                .copy_from_slice(&body[..plan.merging_units * usz]);
            nh_set_free_start(dst, at + plan.merging_bytes);
            nh_set_free_space(dst, nh_free_space(dst) - plan.merging_bytes);
            from_item = 1;
        }
        // whole items
        for k in 0..plan.entire {
            let spos = from_item + k;
            self.append_item_image(
                dst,
                &ih_key(src, spos),
                ih_plugin(src, spos),
                item_body_at(src, spos),
            );
        }
        // leading part of one more item as a fresh item
        if plan.part_units > 0 {
            let spos = from_item + plan.entire;
            let usz = ops_at(src, spos).unit_size();
            let body = item_body_at(src, spos);
            self.append_item_image(
                dst,
                &ih_key(src, spos),
                ih_plugin(src, spos),
                &body[..plan.part_bytes / usz * usz],
            );
        }
        let _ = env;
    }

    fn copy_right(&self, env: &ItemEnv, src: &[u8], dst: &mut [u8], plan: &ShiftPlan) {
        let old_items = nh_num_items(dst);
        let new_items = plan.entire + usize::from(plan.part_units > 0);
        let total = plan.shift_bytes;
        let old_free_start = nh_free_start(dst);

        // make room at the front of the body region
        dst.copy_within(NODE_HEADER_SIZE..old_free_start, NODE_HEADER_SIZE + total);
        // the first old item absorbs the merged units at its beginning
        if old_items > 0 {
            ih_set_offset(
                dst,
                0,
                ih_offset(dst, 0) + total - plan.merging_bytes,
            );
        }
        for i in 1..old_items {
            ih_set_offset(dst, i, ih_offset(dst, i) + total);
        }
        // shift old headers to higher positions
        if old_items > 0 && new_items > 0 {
            let lo = ih_at(dst, old_items - 1);
            let hi = ih_at(dst, 0) + ITEM_HEADER_SIZE;
            dst.copy_within(lo..hi, lo - new_items * ITEM_HEADER_SIZE);
        }
        nh_set_num_items(dst, old_items + new_items);
        nh_set_free_start(dst, old_free_start + total);
        nh_set_free_space(
            dst,
            nh_free_space(dst) - (total + new_items * ITEM_HEADER_SIZE),
        );

        // number of source items taking part
        let shifted_items = plan.entire
            + usize::from(plan.part_units > 0)
            + usize::from(plan.merging_units > 0);
        let first_src = nh_num_items(src) - shifted_items;

        let mut write_at = NODE_HEADER_SIZE;
        let mut dpos = 0usize;
        // partial item first (it holds the smallest shifted keys)
        if plan.part_units > 0 {
            let spos = first_src;
            let usz = ops_at(src, spos).unit_size();
            let body = item_body_at(src, spos);
            let nunits = units_at(src, spos);
            let tail = &body[(nunits - plan.part_units) * usz..];
            let key = unit_key_at(env, src, spos, nunits - plan.part_units);
            ih_set_key(dst, dpos, &key);
            ih_set_plugin(dst, dpos, ih_plugin(src, spos));
            ih_set_offset(dst, dpos, write_at);
            dst[write_at..write_at + tail.len()].copy_from_slice(tail);
            write_at += tail.len();
            dpos += 1;
        }
        // whole items
        for k in 0..plan.entire {
            let spos = first_src + usize::from(plan.part_units > 0) + k;
            let body = item_body_at(src, spos);
            ih_set_key(dst, dpos, &ih_key(src, spos));
            ih_set_plugin(dst, dpos, ih_plugin(src, spos));
            ih_set_offset(dst, dpos, write_at);
            dst[write_at..write_at + body.len()].copy_from_slice(body);
            write_at += body.len();
            dpos += 1;
        }
        // merged units prepended to the old first item
        if plan.merging_units > 0 {
            let spos = nh_num_items(src) - 1;
            let usz = ops_at(src, spos).unit_size();
            let body = item_body_at(src, spos);
            let nunits = units_at(src, spos);
            let tail = &body[(nunits - plan.merging_units) * usz..];
            dst[write_at..write_at + tail.len()].copy_from_slice(tail);
            // the absorbing item starts earlier now: fix its key
            let key = unit_key_at(env, src, spos, nunits - plan.merging_units);
            ih_set_key(dst, dpos, &key);
            debug_assert_eq!(ih_offset(dst, dpos), write_at);
        }
    }

    /// append one item image at the end of the node
    fn append_item_image(&self, dst: &mut [u8], key: &Key, plugin: u16, body: &[u8]) {
        let pos = nh_num_items(dst);
        let at = nh_free_start(dst);
        nh_set_num_items(dst, pos + 1);
        ih_set_key(dst, pos, key);
        ih_set_plugin(dst, pos, plugin);
        ih_set_offset(dst, pos, at);
        dst[at..at + body.len()].copy_from_slice(body);
        nh_set_free_start(dst, at + body.len());
        nh_set_free_space(
            dst,
            nh_free_space(dst) - body.len() - ITEM_HEADER_SIZE,
        );
    }

    /// fix the tracked insertion coord after a shift
    #[allow(clippy::too_many_arguments)]
    fn adjust_coord(
        &self,
        env: &ItemEnv,
        src: &[u8],
        dst: &[u8],
        coord: &mut Coord,
        plan: &ShiftPlan,
        side: Side,
        removed: usize,
        move_coord: bool,
    ) -> bool {
        let src_view = NodeView::new(*env, src);
        let dst_view = NodeView::new(*env, dst);

        if nh_num_items(src) == 0 {
            debug_assert!(plan.everything);
            return if move_coord {
                match side {
                    Side::Right => {
                        *coord = Coord::first_unit(&dst_view);
                        coord.between = Between::BeforeUnit;
                    }
                    Side::Left => {
                        *coord = Coord::last_unit(&dst_view);
                        coord.between = Between::AfterUnit;
                    }
                }
                true
            } else {
                *coord = Coord::first_unit(&src_view);
                false
            };
        }

        match side {
            Side::Right => {
                if plan.everything {
                    if move_coord {
                        *coord = Coord::first_unit(&dst_view);
                        coord.between = Between::BeforeUnit;
                        return true;
                    }
                    *coord = Coord::last_unit(&src_view);
                    coord.between = Between::AfterUnit;
                }
                false
            }
            Side::Left => {
                if plan.everything {
                    return if move_coord {
                        *coord = Coord::last_unit(&dst_view);
                        coord.between = Between::AfterUnit;
                        true
                    } else {
                        *coord = Coord::first_unit(&src_view);
                        coord.between = Between::BeforeUnit;
                        false
                    };
                }
                if removed == 0 {
                    debug_assert!(plan.merging_units == 0 || plan.part_units == 0);
                    if plan.real_stop.item_pos == coord.item_pos {
                        let gone = if plan.merging_units > 0 {
                            plan.merging_units
                        } else {
                            plan.part_units
                        };
                        debug_assert!(coord.unit_pos >= gone);
                        coord.unit_pos -= gone;
                    }
                    return false;
                }
                if plan.real_stop.item_pos == coord.item_pos {
                    coord.unit_pos -= plan.part_units;
                }
                coord.item_pos -= removed;
                false
            }
        }
    }
}
