/*
 * Created on Thu Jan 18 2024
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
        fs40::{Fs40, NodeView, ITEM_HEADER_SIZE, NODE_HEADER_SIZE},
        items::{ItemId, KillCtx},
        CutRange, ItemData, ItemEnv, LookupBias, NodeLayout, NodeNotify, NodeSearch,
    },
    crate::engine::{
        coord::{Between, Coord, CoordHost, Side},
        key::{Key, KeyMinor, KeyScheme},
    },
};

const SIZE: usize = 1024;

fn env() -> ItemEnv {
    ItemEnv {
        scheme: KeyScheme::PlanA,
        block_size: SIZE,
    }
}

fn new_leaf() -> Vec<u8> {
    let mut data = vec![0u8; SIZE];
    Fs40.init(&mut data, 1);
    data
}

fn bkey(oid: u64, off: u64) -> Key {
    Key::build(1, KeyMinor::Body, oid, off)
}

/// insert a tail item at wherever lookup says it belongs
fn put_tail(data: &mut [u8], key: Key, body: &[u8]) -> Coord {
    let env = env();
    let (mut coord, res) = Fs40.lookup(&env, data, &key, LookupBias::Exact).unwrap();
    assert_eq!(res, NodeSearch::NotFound, "key already present");
    let mut notify = NodeNotify::default();
    let item = ItemData::new(ItemId::Tail, body.to_vec());
    Fs40.create_item(&env, data, &mut coord, &key, &item, &mut notify);
    coord
}

/// free space + item bytes + header overhead must cover the node
fn space_accounted(data: &[u8]) -> usize {
    let n = Fs40.num_items(data);
    let bytes: usize = (0..n).map(|i| Fs40.item_len(data, i)).sum();
    Fs40.free_space(data) + bytes + n * ITEM_HEADER_SIZE + NODE_HEADER_SIZE
}

#[test]
fn fresh_node_accounting() {
    let data = new_leaf();
    assert_eq!(Fs40.num_items(&data), 0);
    assert_eq!(Fs40.free_space(&data), SIZE - NODE_HEADER_SIZE);
    assert!(Fs40.guess(&data));
    Fs40.parse(&data, 1).unwrap();
    assert!(Fs40.parse(&data, 2).is_err());
    Fs40.check(&env(), &data, None).unwrap();
}

#[test]
fn first_insert_and_lookup() {
    // empty-tree insert scenario, node level: key (1,0,1), 128 bytes
    let mut data = new_leaf();
    let key = bkey(77, 1);
    let body = vec![0xAB; 128];
    let coord = put_tail(&mut data, key, &body);
    assert_eq!((coord.item_pos, coord.unit_pos, coord.between), (0, 0, Between::AtUnit));
    assert_eq!(Fs40.num_items(&data), 1);
    assert_eq!(
        Fs40.free_space(&data),
        SIZE - NODE_HEADER_SIZE - 128 - ITEM_HEADER_SIZE
    );
    let (found, res) = Fs40.lookup(&env(), &data, &key, LookupBias::Exact).unwrap();
    assert_eq!(res, NodeSearch::Found);
    assert_eq!((found.item_pos, found.unit_pos, found.between), (0, 0, Between::AtUnit));
    // a unit in the middle of the tail is found through the item
    // plugin
    let (mid, res) = Fs40
        .lookup(&env(), &data, &key.with_offset(65), LookupBias::Exact)
        .unwrap();
    assert_eq!(res, NodeSearch::Found);
    assert_eq!((mid.item_pos, mid.unit_pos), (0, 64));
    Fs40.check(&env(), &data, None).unwrap();
}

#[test]
fn items_stay_key_ordered() {
    let mut data = new_leaf();
    // deliberately out of insertion order; keys far enough apart not
    // to be mergeable
    for oid in [5u64, 1, 9, 3, 7] {
        put_tail(&mut data, bkey(oid, 0), &[oid as u8; 16]);
    }
    assert_eq!(Fs40.num_items(&data), 5);
    for i in 1..5 {
        assert!(Fs40.key_at(&data, i - 1) < Fs40.key_at(&data, i));
    }
    Fs40.check(&env(), &data, None).unwrap();
    assert_eq!(space_accounted(&data), SIZE);
    // every key is found again at the position its order dictates
    for (pos, oid) in [1u64, 3, 5, 7, 9].iter().enumerate() {
        let (c, res) = Fs40
            .lookup(&env(), &data, &bkey(*oid, 0), LookupBias::Exact)
            .unwrap();
        assert_eq!(res, NodeSearch::Found);
        assert_eq!(c.item_pos, pos);
    }
}

#[test]
fn lookup_key_below_everything() {
    let mut data = new_leaf();
    put_tail(&mut data, bkey(10, 0), &[1; 8]);
    let (c, res) = Fs40
        .lookup(&env(), &data, &bkey(2, 0), LookupBias::Exact)
        .unwrap();
    assert_eq!(res, NodeSearch::NotFound);
    assert_eq!((c.item_pos, c.between), (0, Between::BeforeUnit));
}

#[test]
fn max_not_greater_bias() {
    let mut data = new_leaf();
    put_tail(&mut data, bkey(10, 0), &[1; 8]);
    put_tail(&mut data, bkey(20, 0), &[2; 8]);
    // between the two items: lands after the first
    let (c, res) = Fs40
        .lookup(&env(), &data, &bkey(15, 0), LookupBias::MaxNotGreater)
        .unwrap();
    assert_eq!(res, NodeSearch::Found);
    assert_eq!(c.item_pos, 0);
    assert_eq!(c.between, Between::AfterUnit);
}

#[test]
fn change_item_size_slides_tail() {
    let mut data = new_leaf();
    put_tail(&mut data, bkey(1, 0), &[0x11; 8]);
    put_tail(&mut data, bkey(9, 0), &[0x99; 8]);
    let before = Fs40.free_space(&data);
    Fs40.change_item_size(&mut data, 0, 4);
    assert_eq!(Fs40.item_len(&data, 0), 12);
    assert_eq!(Fs40.free_space(&data), before - 4);
    // the second item is untouched
    assert_eq!(Fs40.item_body(&data, 1), &[0x99; 8]);
    // and shrink it back
    Fs40.change_item_size(&mut data, 0, -4);
    assert_eq!(Fs40.item_len(&data, 0), 8);
    assert_eq!(Fs40.free_space(&data), before);
    assert_eq!(space_accounted(&data), SIZE);
}

/*
    cut
*/

#[test]
fn cut_head_tail_middle() {
    let env = env();
    // head
    let mut data = new_leaf();
    put_tail(&mut data, bkey(1, 0), &[0, 1, 2, 3, 4, 5, 6, 7]);
    let mut notify = NodeNotify::default();
    let range = CutRange {
        from: Coord { item_pos: 0, unit_pos: 0, between: Between::AtUnit },
        to: Coord { item_pos: 0, unit_pos: 2, between: Between::AtUnit },
    };
    let out = Fs40.cut(&env, &mut data, &range, None, &mut notify).unwrap();
    assert_eq!(out.removed_items, 0);
    assert_eq!(out.freed_bytes, 3);
    assert_eq!(Fs40.item_body(&data, 0), &[3, 4, 5, 6, 7]);
    // the head cut renamed the item
    assert_eq!(Fs40.key_at(&data, 0).offset(), 3);
    assert!(notify.first_key_changed);
    Fs40.check(&env, &data, None).unwrap();

    // tail
    let mut notify = NodeNotify::default();
    let range = CutRange {
        from: Coord { item_pos: 0, unit_pos: 3, between: Between::AtUnit },
        to: Coord { item_pos: 0, unit_pos: 4, between: Between::AtUnit },
    };
    Fs40.cut(&env, &mut data, &range, None, &mut notify).unwrap();
    assert_eq!(Fs40.item_body(&data, 0), &[3, 4, 5]);
    assert!(!notify.first_key_changed);

    // middle
    let mut notify = NodeNotify::default();
    let range = CutRange {
        from: Coord { item_pos: 0, unit_pos: 1, between: Between::AtUnit },
        to: Coord { item_pos: 0, unit_pos: 1, between: Between::AtUnit },
    };
    Fs40.cut(&env, &mut data, &range, None, &mut notify).unwrap();
    assert_eq!(Fs40.item_body(&data, 0), &[3, 5]);
    Fs40.check(&env, &data, None).unwrap();
    assert_eq!(space_accounted(&data), SIZE);
}

#[test]
fn cut_whole_item_empties_node() {
    let env = env();
    let mut data = new_leaf();
    put_tail(&mut data, bkey(1, 0), &[7; 4]);
    let mut notify = NodeNotify::default();
    let range = CutRange {
        from: Coord { item_pos: 0, unit_pos: 0, between: Between::AtUnit },
        to: Coord { item_pos: 0, unit_pos: 3, between: Between::AtUnit },
    };
    let out = Fs40.cut(&env, &mut data, &range, None, &mut notify).unwrap();
    assert_eq!(out.removed_items, 1);
    assert_eq!(out.smallest_removed.unwrap(), bkey(1, 0));
    assert!(notify.emptied);
    assert_eq!(Fs40.num_items(&data), 0);
    assert_eq!(Fs40.free_space(&data), SIZE - NODE_HEADER_SIZE);
}

#[test]
fn cut_crossing_two_items() {
    // two adjacent items; the cut removes the suffix of the first and
    // the prefix of the second. Item count and the node's first key
    // stay put.
    let env = env();
    let mut data = new_leaf();
    put_tail(&mut data, bkey(1, 0), &[0, 1, 2, 3]);
    put_tail(&mut data, bkey(3, 0), &[10, 11, 12, 13]);
    let mut notify = NodeNotify::default();
    let range = CutRange {
        from: Coord { item_pos: 0, unit_pos: 2, between: Between::AtUnit },
        to: Coord { item_pos: 1, unit_pos: 1, between: Between::AtUnit },
    };
    let out = Fs40.cut(&env, &mut data, &range, None, &mut notify).unwrap();
    assert_eq!(out.removed_items, 0);
    assert_eq!(Fs40.num_items(&data), 2);
    assert_eq!(Fs40.item_body(&data, 0), &[0, 1]);
    assert_eq!(Fs40.item_body(&data, 1), &[12, 13]);
    // first key of the node unchanged, the second item was renamed
    assert_eq!(Fs40.key_at(&data, 0), bkey(1, 0));
    assert_eq!(Fs40.key_at(&data, 1), bkey(3, 2));
    assert!(!notify.first_key_changed);
    assert_eq!(out.smallest_removed.unwrap(), bkey(1, 2));
    Fs40.check(&env, &data, None).unwrap();

    // if the cut empties the first item entirely, item count drops
    let mut data = new_leaf();
    put_tail(&mut data, bkey(1, 0), &[0, 1]);
    put_tail(&mut data, bkey(3, 0), &[10, 11]);
    let mut notify = NodeNotify::default();
    let range = CutRange {
        from: Coord { item_pos: 0, unit_pos: 0, between: Between::AtUnit },
        to: Coord { item_pos: 1, unit_pos: 0, between: Between::AtUnit },
    };
    let out = Fs40.cut(&env, &mut data, &range, None, &mut notify).unwrap();
    assert_eq!(out.removed_items, 1);
    assert_eq!(Fs40.num_items(&data), 1);
    assert_eq!(Fs40.item_body(&data, 0), &[11]);
    assert!(notify.first_key_changed);
    Fs40.check(&env, &data, None).unwrap();
}

#[test]
fn kill_hooks_record_extents() {
    let env = env();
    let mut data = vec![0u8; SIZE];
    Fs40.init(&mut data, 2);
    let units = super::items::ExtentItem::build(&[
        super::items::ExtentUnit { start: 100, width: 4 },
        super::items::ExtentUnit { start: 1, width: 2 }, // unallocated
        super::items::ExtentUnit { start: 300, width: 1 },
    ]);
    let key = bkey(5, 0);
    let mut coord = Coord::default();
    let mut notify = NodeNotify::default();
    let item = ItemData::new(ItemId::Extent, units);
    Fs40.create_item(&env, &mut data, &mut coord, &key, &item, &mut notify);
    let mut kill = KillCtx::default();
    let range = CutRange {
        from: Coord { item_pos: 0, unit_pos: 0, between: Between::AtUnit },
        to: Coord { item_pos: 0, unit_pos: 2, between: Between::AtUnit },
    };
    let mut notify = NodeNotify::default();
    Fs40.cut(&env, &mut data, &range, Some(&mut kill), &mut notify)
        .unwrap();
    // only real runs are recorded; the unallocated one has no blocks
    assert_eq!(kill.dead_blocks, vec![(100, 4), (300, 1)]);
}

/*
    shift
*/

fn pair_invariant(a: &[u8], b: &[u8]) -> usize {
    space_accounted(a) + space_accounted(b)
}

#[test]
fn shift_left_whole_items() {
    let env = env();
    let mut left = new_leaf();
    let mut right = new_leaf();
    put_tail(&mut left, bkey(1, 0), &[1; 10]);
    put_tail(&mut right, bkey(5, 0), &[5; 20]);
    put_tail(&mut right, bkey(7, 0), &[7; 20]);
    let before = pair_invariant(&left, &right);

    let mut from = Coord {
        item_pos: 1,
        unit_pos: 19,
        between: Between::AtUnit,
    };
    let mut notify = NodeNotify::default();
    let out = Fs40
        .shift(&env, &mut right, &mut left, &mut from, Side::Left, true, &mut notify)
        .unwrap();
    assert_eq!(out.bytes, 40);
    assert!(out.source_emptied);
    assert!(out.moved_coord);
    assert_eq!(Fs40.num_items(&left), 3);
    assert_eq!(Fs40.num_items(&right), 0);
    assert_eq!(pair_invariant(&left, &right), before);
    Fs40.check(&env, &left, None).unwrap();
    // no key, data byte or header lost
    assert_eq!(Fs40.key_at(&left, 1), bkey(5, 0));
    assert_eq!(Fs40.item_body(&left, 2), &[7; 20]);
}

#[test]
fn shift_left_partial_item() {
    let env = env();
    let mut left = new_leaf();
    let mut right = new_leaf();
    put_tail(&mut left, bkey(1, 0), &[1; 10]);
    // make left almost full
    let fill = Fs40.free_space(&left) - 2 * ITEM_HEADER_SIZE - 8;
    put_tail(&mut left, bkey(2, 0), &vec![2; fill]);
    put_tail(&mut right, bkey(5, 0), &[5; 64]);
    let before = pair_invariant(&left, &right);

    let mut from = Coord {
        item_pos: 0,
        unit_pos: 63,
        between: Between::AtUnit,
    };
    let mut notify = NodeNotify::default();
    let out = Fs40
        .shift(&env, &mut right, &mut left, &mut from, Side::Left, false, &mut notify)
        .unwrap();
    // only the head of the right item fit
    assert_eq!(out.bytes, 8);
    assert!(!out.source_emptied);
    assert_eq!(Fs40.num_items(&left), 3);
    assert_eq!(Fs40.item_body(&left, 2), &[5; 8]);
    // the source item was renamed after losing its head
    assert_eq!(Fs40.key_at(&right, 0), bkey(5, 8));
    assert_eq!(pair_invariant(&left, &right), before);
    Fs40.check(&env, &left, None).unwrap();
    Fs40.check(&env, &right, None).unwrap();
}

#[test]
fn shift_left_merges_mergeable_boundary() {
    let env = env();
    let mut left = new_leaf();
    let mut right = new_leaf();
    put_tail(&mut left, bkey(5, 0), &[1, 2, 3, 4]);
    // continues the same object at the continuation offset
    put_tail(&mut right, bkey(5, 4), &[5, 6, 7, 8]);
    let mut from = Coord {
        item_pos: 0,
        unit_pos: 3,
        between: Between::AtUnit,
    };
    let mut notify = NodeNotify::default();
    let out = Fs40
        .shift(&env, &mut right, &mut left, &mut from, Side::Left, true, &mut notify)
        .unwrap();
    assert_eq!(out.bytes, 4);
    // merged into the existing item, not appended as a new one
    assert_eq!(Fs40.num_items(&left), 1);
    assert_eq!(Fs40.item_body(&left, 0), &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert!(out.source_emptied);
    Fs40.check(&env, &left, None).unwrap();
}

#[test]
fn shift_right_whole_and_merge() {
    let env = env();
    let mut left = new_leaf();
    let mut right = new_leaf();
    put_tail(&mut left, bkey(3, 0), &[3; 8]);
    put_tail(&mut left, bkey(5, 0), &[1, 2, 3, 4]);
    put_tail(&mut right, bkey(5, 4), &[5, 6, 7, 8]);
    let before = pair_invariant(&left, &right);

    // shift everything from the insertion point on into the right
    // node
    let mut from = Coord {
        item_pos: 1,
        unit_pos: 0,
        between: Between::AtUnit,
    };
    let mut notify = NodeNotify::default();
    let out = Fs40
        .shift(&env, &mut left, &mut right, &mut from, Side::Right, false, &mut notify)
        .unwrap();
    assert_eq!(out.bytes, 4);
    assert_eq!(Fs40.num_items(&left), 1);
    assert_eq!(Fs40.num_items(&right), 1);
    // prepended to the mergeable right item, which was renamed
    assert_eq!(Fs40.item_body(&right, 0), &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(Fs40.key_at(&right, 0), bkey(5, 0));
    assert_eq!(pair_invariant(&left, &right), before);
    Fs40.check(&env, &left, None).unwrap();
    Fs40.check(&env, &right, None).unwrap();
}

#[test]
fn shift_nothing_moves_coord() {
    let env = env();
    let mut left = new_leaf();
    let mut right = new_leaf();
    put_tail(&mut right, bkey(5, 0), &[5; 8]);
    // coord before the first unit: a left shift has nothing to move
    let mut from = Coord {
        item_pos: 0,
        unit_pos: 0,
        between: Between::BeforeUnit,
    };
    let mut notify = NodeNotify::default();
    let out = Fs40
        .shift(&env, &mut right, &mut left, &mut from, Side::Left, true, &mut notify)
        .unwrap();
    assert_eq!(out.bytes, 0);
    assert!(out.moved_coord);
    // positioned in the (empty) target, after its nonexistent last
    // unit
    assert_eq!(from.between, Between::AfterUnit);
}

/*
    structural checks
*/

#[test]
fn check_rejects_corruption() {
    let env = env();
    let mut data = new_leaf();
    put_tail(&mut data, bkey(1, 0), &[1; 8]);
    put_tail(&mut data, bkey(5, 0), &[5; 8]);
    Fs40.check(&env, &data, None).unwrap();

    // bad magic
    let mut bad = data.clone();
    bad[10] ^= 0xFF;
    assert_eq!(Fs40.check(&env, &bad, None), Err("bad magic"));

    // swap the two item keys: ordering violated
    let mut bad = data.clone();
    let k0 = Fs40.key_at(&bad, 0);
    let k1 = Fs40.key_at(&bad, 1);
    let mut notify = NodeNotify::default();
    Fs40.update_item_key(&mut bad, 0, &k1, &mut notify);
    Fs40.update_item_key(&mut bad, 1, &k0, &mut notify);
    assert_eq!(Fs40.check(&env, &bad, None), Err("keys are in wrong order"));

    // mergeable neighbors may not sit in one node
    let mut bad = data.clone();
    let cont = bkey(1, 8);
    Fs40.update_item_key(&mut bad, 1, &cont, &mut notify);
    assert_eq!(Fs40.check(&env, &bad, None), Err("mergeable items in one node"));
}

#[test]
fn check_enforces_dkey_containment() {
    use crate::engine::key::{MAX_KEY, MIN_KEY};
    let env = env();
    let mut data = new_leaf();
    put_tail(&mut data, bkey(3, 0), &[3; 8]);
    put_tail(&mut data, bkey(7, 0), &[7; 8]);

    // the whole key run fits inside [ld, rd]
    Fs40.check(&env, &data, Some((&MIN_KEY, &MAX_KEY))).unwrap();
    Fs40.check(&env, &data, Some((&bkey(3, 0), &bkey(9, 0)))).unwrap();

    // ld above the first key
    assert_eq!(
        Fs40.check(&env, &data, Some((&bkey(4, 0), &MAX_KEY))),
        Err("first key is less than ldkey")
    );
    // rd below the last unit key
    assert_eq!(
        Fs40.check(&env, &data, Some((&MIN_KEY, &bkey(7, 4)))),
        Err("last key is greater than rdkey")
    );
    // inverted delimiting pair on an empty node
    let empty = new_leaf();
    assert_eq!(
        Fs40.check(&env, &empty, Some((&bkey(9, 0), &bkey(1, 0)))),
        Err("ldkey is greater than rdkey")
    );
    Fs40.check(&env, &empty, Some((&bkey(1, 0), &bkey(9, 0)))).unwrap();
}

#[test]
fn node_view_hosts_coords() {
    let mut data = new_leaf();
    put_tail(&mut data, bkey(1, 0), &[1; 3]);
    put_tail(&mut data, bkey(5, 0), &[5; 2]);
    let env = env();
    let view = NodeView::new(env, &data);
    assert_eq!(view.num_items(), 2);
    assert_eq!(view.num_units(0), 3);
    assert_eq!(view.num_units(1), 2);
    let mut c = Coord::first_unit(&view);
    let mut steps = 1;
    while !c.next_unit(&view) {
        steps += 1;
    }
    assert_eq!(steps, 5);
}
