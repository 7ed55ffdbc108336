/*
 * Created on Thu Feb 01 2024
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
    super::{cut_node, insert_by_coord, insert_flow, op_estimate, OpArgs, DELETE_KILL},
    crate::engine::{
        config::EngineConfig,
        coord::{Between, Coord},
        error::TreeError,
        key::{Key, KeyMinor},
        node::{items::ItemId, CutRange, ItemData, LookupBias, NodeSearch},
        storage::blockdev::MemDisk,
        sync::longterm::{LockMode, LockPri},
        tree::{longterm_lock, search, Tree, LEAF_LEVEL},
        txn::Atom,
    },
    std::sync::Arc,
};

fn testtree() -> Arc<Tree> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dev = Arc::new(MemDisk::new(4096, 512));
    Arc::new(Tree::format(dev, EngineConfig::default()).unwrap())
}

fn bkey(oid: u64) -> Key {
    Key::build(1, KeyMinor::Body, oid, 0)
}

fn put(tree: &Tree, atom: &Arc<Atom>, key: Key, body: &[u8]) {
    let (res, tc, mut lh) = search::lookup_for_modify(tree, &key).unwrap();
    assert_eq!(res, NodeSearch::NotFound);
    insert_by_coord(
        tree,
        atom,
        &tc.pos,
        &mut lh,
        &key,
        ItemData::new(ItemId::Tail, body.to_vec()),
        0,
    )
    .unwrap();
}

fn get(tree: &Tree, key: Key) -> Option<Vec<u8>> {
    let (res, tc, _lh) = search::lookup_key(tree, &key, LookupBias::Exact).unwrap();
    if res != NodeSearch::Found {
        return None;
    }
    let data = tc.node.j().data();
    Some(tree.layout.item_body(&data, tc.pos.item_pos).to_vec())
}

/// delete a whole leaf item by key
fn del(tree: &Tree, atom: &Arc<Atom>, key: Key) {
    let (res, tc, mut lh) = search::lookup_for_modify(tree, &key).unwrap();
    assert_eq!(res, NodeSearch::Found);
    let units = {
        let data = tc.node.j().data();
        tree.layout.units_of(&tree.env, &data, tc.pos.item_pos)
    };
    let range = CutRange {
        from: Coord {
            item_pos: tc.pos.item_pos,
            unit_pos: 0,
            between: Between::AtUnit,
        },
        to: Coord {
            item_pos: tc.pos.item_pos,
            unit_pos: units - 1,
            between: Between::AtUnit,
        },
    };
    cut_node(tree, atom, range, &mut lh, DELETE_KILL).unwrap();
}

#[test]
fn leaf_split_by_right_shift() {
    // fill a leaf until little space remains, then insert in the
    // middle: exactly one new right sibling appears and the parent
    // gets the pointer
    let tree = testtree();
    let atom = Atom::new(1);
    // four 975-byte items leave free space < 64
    for oid in [10u64, 20, 30, 40] {
        put(&tree, &atom, bkey(oid), &[oid as u8; 975]);
    }
    {
        let (_, tc, _lh) = search::lookup_key(&tree, &bkey(10), LookupBias::Exact).unwrap();
        let data = tc.node.j().data();
        assert!(tree.layout.free_space(&data) < 64);
    }
    assert_eq!(tree.root_desc().height, LEAF_LEVEL);

    put(&tree, &atom, bkey(25), &[25u8; 200]);

    // one split: the root grew and holds exactly two pointers
    assert_eq!(tree.root_desc().height, LEAF_LEVEL + 1);
    let root = tree.zget(tree.root_desc().block, tree.root_desc().height, None);
    {
        let data = root.j().data();
        assert_eq!(tree.layout.num_items(&data), 2);
    }
    // everything is still reachable
    for oid in [10u64, 20, 25, 30, 40] {
        assert!(get(&tree, bkey(oid)).is_some(), "lost key {oid}");
    }
    // the new key sits in whichever leaf covers it
    let (_, tc, _lh) = search::lookup_key(&tree, &bkey(25), LookupBias::Exact).unwrap();
    let ld = tc.node.ld_key();
    let rd = tc.node.rd_key();
    let scheme = tree.env.scheme;
    assert!(scheme.keyle(&ld, &bkey(25)) && scheme.keylt(&bkey(25), &rd));
}

#[test]
fn many_inserts_random_order() {
    let tree = testtree();
    let atom = Atom::new(1);
    use rand::{seq::SliceRandom, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xF5);
    let mut oids: Vec<u64> = (0..64).collect();
    oids.shuffle(&mut rng);
    for &oid in &oids {
        put(&tree, &atom, bkey(oid), &[oid as u8; 400]);
    }
    for oid in 0..64u64 {
        assert_eq!(get(&tree, bkey(oid)).unwrap(), vec![oid as u8; 400]);
    }
    assert!(tree.root_desc().height >= 2);
}

#[test]
fn cut_and_kill_removes_items() {
    let tree = testtree();
    let atom = Atom::new(1);
    for oid in 0..12u64 {
        put(&tree, &atom, bkey(oid), &[oid as u8; 700]);
    }
    for oid in (0..12u64).step_by(2) {
        del(&tree, &atom, bkey(oid));
    }
    for oid in 0..12u64 {
        let hit = get(&tree, bkey(oid)).is_some();
        assert_eq!(hit, oid % 2 == 1, "oid {oid}");
    }
}

#[test]
fn emptied_leaf_is_deleted_from_tree() {
    let tree = testtree();
    let atom = Atom::new(1);
    for oid in 0..10u64 {
        put(&tree, &atom, bkey(oid), &[1u8; 800]);
    }
    assert!(tree.root_desc().height > LEAF_LEVEL);
    // empty out the leaf holding the smallest keys
    let first_leaf = {
        let (_, tc, _lh) = search::lookup_key(&tree, &bkey(0), LookupBias::Exact).unwrap();
        tc.node.clone()
    };
    let victims: Vec<Key> = {
        let data = first_leaf.j().data();
        (0..tree.layout.num_items(&data))
            .map(|i| tree.layout.key_at(&data, i))
            .collect()
    };
    for key in victims {
        del(&tree, &atom, key);
    }
    // the emptied node heard the banshee and left the web
    assert!(first_leaf.j().is_banshee());
    // a 4K leaf holds at most four 800-byte items, so at least six
    // keys survive
    let survivors = (0..10u64).filter(|o| get(&tree, bkey(*o)).is_some()).count();
    assert!(survivors >= 6, "{survivors} survivors");
}

#[test]
fn left_shift_restart_under_contention() {
    // thread A inserts near the right end of a full leaf while the
    // test thread holds the leaf's left sibling write-locked. A's
    // make-space must bounce off the LOPRI left acquisition, restart,
    // and complete once the lock goes away.
    let tree = testtree();
    let atom = Atom::new(1);
    for oid in 0..10u64 {
        put(&tree, &atom, bkey(oid), &[1u8; 800]);
    }
    let left_leaf = {
        let (_, tc, _lh) = search::lookup_key(&tree, &bkey(0), LookupBias::Exact).unwrap();
        tc.node.clone()
    };
    let right_leaf = left_leaf.right().expect("splits must have linked siblings");
    // fill the right leaf to the brim so the insert needs balancing
    let first_right = {
        let data = right_leaf.j().data();
        tree.layout.key_at(&data, 0)
    };
    {
        let free = {
            let data = right_leaf.j().data();
            tree.layout.free_space(&data)
        };
        let pad = free.saturating_sub(tree.layout.item_overhead() + 64);
        put(
            &tree,
            &atom,
            first_right.with_offset(first_right.offset() + 1_000_000),
            &vec![2u8; pad],
        );
    }
    // a key that lands inside the stuffed right leaf
    let wedge = first_right.with_offset(first_right.offset() + 500_000);

    let guard = longterm_lock(&left_leaf, LockMode::Write, LockPri::Hi, false).unwrap();
    let handle = {
        let tree = tree.clone();
        let atom = atom.clone();
        std::thread::spawn(move || {
            put(&tree, &atom, wedge, &[9u8; 600]);
        })
    };
    // let A hit the contended left lock a few times
    std::thread::sleep(std::time::Duration::from_millis(30));
    drop(guard);
    handle.join().expect("no deadlock, no panic");
    assert_eq!(get(&tree, wedge).unwrap(), vec![9u8; 600]);
}

#[test]
fn flow_insertion_packs_tails() {
    let tree = testtree();
    let atom = Atom::new(1);
    let key = Key::build(9, KeyMinor::Body, 9, 0);
    let flow: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();

    let (res, tc, mut lh) = search::lookup_for_modify(&tree, &key).unwrap();
    assert_eq!(res, NodeSearch::NotFound);
    insert_flow(&tree, &atom, &tc.pos, &mut lh, &key, flow.clone(), 0).unwrap();
    drop(lh);

    // every byte of the flow is reachable at its offset
    for probe in [0u64, 1, 4000, 8999] {
        let (res, tc, _lh) = search::lookup_key(
            &tree,
            &key.with_offset(probe),
            LookupBias::Exact,
        )
        .unwrap();
        assert_eq!(res, NodeSearch::Found, "offset {probe} missing");
        let data = tc.node.j().data();
        let item_key = tree.layout.key_at(&data, tc.pos.item_pos);
        let body = tree.layout.item_body(&data, tc.pos.item_pos);
        let at = (probe - item_key.offset()) as usize;
        assert_eq!(body[at], flow[probe as usize]);
    }
}

#[test]
fn estimates_match_the_table() {
    let tree = testtree();
    let ins = OpArgs::Insert(super::InsertOp {
        addr: super::InsertAddr::ItemData {
            key: bkey(1),
            data: ItemData::new(ItemId::Tail, vec![0; 10]),
        },
        coord: Coord::default(),
        flags: 0,
    });
    assert_eq!(op_estimate(&ins, &tree), 2 * (tree.height() as u64 + 1));
    let del = OpArgs::Delete {
        flags: 0,
    };
    assert_eq!(op_estimate(&del, &tree), 0);
    let flow = OpArgs::InsertFlow(super::FlowOp {
        key: bkey(1),
        flow: vec![],
        written: 0,
        coord: Coord::default(),
        new_nodes: 0,
        flags: 0,
    });
    assert_eq!(
        op_estimate(&flow, &tree),
        ((crate::engine::config::FLOW_NEW_NODES_LIMIT + 1)
            * crate::engine::config::MAX_TREE_HEIGHT as usize) as u64
    );
}

#[test]
fn pool_exhaustion_is_a_clean_error() {
    let mut pool = super::CarryPool::new();
    let tree = testtree();
    let mut level = super::CarryLevel::new(LEAF_LEVEL);
    let mut last = Ok(0);
    for i in 0..100 {
        let z = tree.zget(10_000 + i, LEAF_LEVEL, None);
        last = level.add_node(&mut pool, z, false);
        if last.is_err() {
            break;
        }
    }
    assert_eq!(last.unwrap_err(), TreeError::NoMemory);
}
