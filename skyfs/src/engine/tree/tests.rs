/*
 * Created on Mon Jan 29 2024
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
    super::{search, walk, Tree, LEAF_LEVEL},
    crate::engine::{
        carry,
        config::EngineConfig,
        coord::Between,
        error::TreeError,
        key::{Key, KeyMinor, MAX_KEY, MIN_KEY},
        node::{items::ItemId, ItemData, LookupBias, NodeSearch},
        storage::blockdev::MemDisk,
        sync::longterm::LockMode,
        txn::{Atom, TxnMgr},
    },
    std::sync::Arc,
};

fn testtree() -> Arc<Tree> {
    let dev = Arc::new(MemDisk::new(4096, 512));
    Arc::new(Tree::format(dev, EngineConfig::default()).unwrap())
}

fn bkey(oid: u64) -> Key {
    Key::build(1, KeyMinor::Body, oid, 0)
}

fn put(tree: &Tree, atom: &Arc<Atom>, key: Key, body: &[u8]) {
    let (res, tc, mut lh) = search::lookup_for_modify(tree, &key).unwrap();
    assert_eq!(res, NodeSearch::NotFound);
    carry::insert_by_coord(
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

#[test]
fn format_and_mount() {
    let dev = Arc::new(MemDisk::new(4096, 512));
    {
        let t = Tree::format(dev.clone(), EngineConfig::default()).unwrap();
        let desc = t.root_desc();
        assert_eq!(desc.height, LEAF_LEVEL);
    }
    // a second mount reads the same state back
    let t = Tree::mount(dev, EngineConfig::default()).unwrap();
    assert_eq!(t.root_desc().height, LEAF_LEVEL);
    // the root is an empty leaf
    let root = t.zget(t.root_desc().block, LEAF_LEVEL, None);
    t.zload(&root).unwrap();
    let data = root.j().data();
    assert!(t.layout.is_empty(&data));
}

#[test]
fn empty_tree_lookup_misses() {
    let tree = testtree();
    let (res, tc, _lh) = search::lookup_key(&tree, &bkey(42), LookupBias::Exact).unwrap();
    assert_eq!(res, NodeSearch::NotFound);
    assert_eq!(tc.pos.between, Between::EmptyNode);
}

#[test]
fn znode_cache_is_keyed_by_block() {
    let tree = testtree();
    let a = tree.zget(1000, LEAF_LEVEL, None);
    let b = tree.zget(1000, LEAF_LEVEL, None);
    assert!(Arc::ptr_eq(&a, &b));
    assert!(tree.zlook(1000).is_some());
    tree.rekey(&a, 2000);
    assert!(tree.zlook(1000).is_none());
    assert!(Arc::ptr_eq(&tree.zlook(2000).unwrap(), &a));
    tree.zdrop(&a);
    assert!(tree.zlook(2000).is_none());
    assert!(a.j().is_banshee());
}

#[test]
fn empty_tree_insert_scenario() {
    // init with an empty leaf root; insert (1,0,1) with 128 bytes;
    // lookup finds it at (leaf, 0, 0, AT_UNIT)
    let tree = testtree();
    let atom = Atom::new(1);
    let key = Key::build(1, KeyMinor::FileName, 0, 1);
    put(&tree, &atom, key, &[7u8; 128]);

    let (res, tc, _lh) = search::lookup_key(&tree, &key, LookupBias::Exact).unwrap();
    assert_eq!(res, NodeSearch::Found);
    assert_eq!(
        (tc.pos.item_pos, tc.pos.unit_pos, tc.pos.between),
        (0, 0, Between::AtUnit)
    );
    let data = tc.node.j().data();
    assert_eq!(tree.layout.num_items(&data), 1);
    assert_eq!(
        tree.layout.free_space(&data),
        4096
            - crate::engine::node::fs40::NODE_HEADER_SIZE
            - 128
            - crate::engine::node::fs40::ITEM_HEADER_SIZE
    );
    // the tree did not grow for a single item
    assert_eq!(tree.root_desc().height, LEAF_LEVEL);
}

#[test]
fn inserts_split_and_grow_the_tree() {
    let tree = testtree();
    let atom = Atom::new(1);
    // ~800 byte items: five per leaf at most
    for oid in 0..24u64 {
        put(&tree, &atom, bkey(oid), &[oid as u8; 800]);
    }
    assert!(tree.root_desc().height > LEAF_LEVEL);
    // lookup idempotence: every key still resolves, twice
    for oid in 0..24u64 {
        let body = get(&tree, bkey(oid)).unwrap();
        assert_eq!(body, vec![oid as u8; 800]);
        let body = get(&tree, bkey(oid)).unwrap();
        assert_eq!(body, vec![oid as u8; 800]);
    }
    // and a key that was never inserted still misses
    assert!(get(&tree, bkey(999)).is_none());
}

#[test]
fn sibling_web_and_dkeys_after_splits() {
    let tree = testtree();
    let atom = Atom::new(1);
    for oid in 0..24u64 {
        put(&tree, &atom, bkey(oid), &[1u8; 800]);
    }
    // walk the leaf level left to right through the sibling pointers
    let (_, tc, lh) = search::lookup_key(&tree, &bkey(0), LookupBias::Exact).unwrap();
    drop(lh);
    let mut node = tc.node.clone();
    let mut leaves = 1;
    let mut prev_rd = node.rd_key();
    assert_eq!(node.ld_key(), MIN_KEY);
    // every leaf passes the structural check against its own dkeys
    tree.check_node(&node).unwrap();
    while let Some(right) = node.right() {
        tree.check_node(&right).unwrap();
        // delimiting key consistency between connected siblings
        assert_eq!(prev_rd, right.ld_key());
        // keys on the level ascend across nodes
        let last_left = {
            let d = node.j().data();
            let n = tree.layout.num_items(&d);
            tree.layout.key_at(&d, n - 1)
        };
        let first_right = {
            let d = right.j().data();
            tree.layout.key_at(&d, 0)
        };
        assert!(last_left < first_right);
        prev_rd = right.rd_key();
        node = right;
        leaves += 1;
    }
    assert!(leaves >= 4, "24 x 800B must span several leaves, got {leaves}");
    assert_eq!(node.rd_key(), MAX_KEY);
}

#[test]
fn walk_get_parent_and_neighbors() {
    let tree = testtree();
    let atom = Atom::new(1);
    for oid in 0..12u64 {
        put(&tree, &atom, bkey(oid), &[2u8; 800]);
    }
    let (_, tc, lh) = search::lookup_key(&tree, &bkey(0), LookupBias::Exact).unwrap();
    let leaf = tc.node.clone();
    drop(lh);

    // parent resolves and holds a pointer to this leaf
    let plh = walk::get_parent(&tree, &leaf, LockMode::Read).unwrap().unwrap();
    tree.zload(plh.node()).unwrap();
    tree.find_child_ptr(plh.node(), leaf.block()).unwrap();
    drop(plh);

    // the leftmost leaf has no left neighbor
    assert_eq!(
        walk::get_left_neighbor(&tree, &leaf, LockMode::Read, walk::gn::DO_READ)
            .map(|_| ())
            .unwrap_err(),
        TreeError::NoNeighbor
    );
    // but it has a right one, reachable through the web
    let rlh =
        walk::get_right_neighbor(&tree, &leaf, LockMode::Read, walk::gn::DO_READ).unwrap();
    assert!(Arc::ptr_eq(rlh.node(), &leaf.right().unwrap()));

    // the root has no parent
    let root = tree.zget(tree.root_desc().block, tree.root_desc().height, None);
    assert!(walk::get_parent(&tree, &root, LockMode::Read).unwrap().is_none());
}

#[test]
fn grow_and_kill_root() {
    let tree = testtree();
    let atom = Atom::new(1);
    let desc = tree.root_desc();
    let old_root = tree.zget(desc.block, desc.height, None);
    tree.zload(&old_root).unwrap();

    let new_root = tree.grow_root(&old_root, &atom).unwrap();
    assert_eq!(tree.root_desc().height, desc.height + 1);
    assert_eq!(tree.root_desc().block, new_root.block());
    assert!(new_root.j().is_dirty());
    assert!(Arc::ptr_eq(&old_root.parent().unwrap(), &new_root));
    {
        let data = new_root.j().data();
        assert_eq!(tree.layout.num_items(&data), 1);
    }
    // grow twice so killing stays above the twig level
    let mid_root = new_root;
    let top_root = tree.grow_root(&mid_root, &atom).unwrap();
    assert_eq!(tree.root_desc().height, desc.height + 2);

    tree.kill_root(&top_root, &atom).unwrap();
    assert_eq!(tree.root_desc().height, desc.height + 1);
    assert_eq!(tree.root_desc().block, mid_root.block());
    assert!(top_root.j().is_banshee());
    assert!(mid_root.parent().is_none());
}

#[test]
fn concurrent_search_during_shifts() {
    // readers chasing existing keys while a writer splits and shifts:
    // a key is observed pre-shift or post-shift, never "neither"
    let tree = testtree();
    let atom = Atom::new(1);
    for oid in 0..20u64 {
        put(&tree, &atom, bkey(oid), &[oid as u8; 400]);
    }
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut readers = vec![];
    for r in 0..3u64 {
        let tree = tree.clone();
        let stop = stop.clone();
        readers.push(std::thread::spawn(move || {
            let mut probe = r;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                probe = (probe + 7) % 20;
                let (res, _tc, _lh) =
                    search::lookup_key(&tree, &bkey(probe), LookupBias::Exact).unwrap();
                assert_eq!(res, NodeSearch::Found, "reader lost key {probe}");
            }
        }));
    }
    // the writer keeps the leaves dancing
    for oid in 100..160u64 {
        put(&tree, &atom, bkey(oid), &[1u8; 400]);
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }
    for oid in 0..20u64 {
        assert!(get(&tree, bkey(oid)).is_some());
    }
}

#[test]
fn txnmgr_hands_out_open_atoms() {
    let mgr = TxnMgr::new(EngineConfig::default());
    let a = mgr.current_atom();
    let b = mgr.current_atom();
    assert_eq!(a.id(), b.id());
}

#[test]
fn tracked_handle_follows_insertion_point() {
    // fill one leaf, then insert again: the split moves the insertion
    // point and the caller's lock handle must follow it
    let tree = testtree();
    let atom = Atom::new(1);
    for oid in 0..5u64 {
        put(&tree, &atom, bkey(oid), &[3u8; 800]);
    }
    let key = bkey(100);
    let (res, tc, mut lh) = search::lookup_for_modify(&tree, &key).unwrap();
    assert_eq!(res, NodeSearch::NotFound);
    carry::insert_by_coord(
        &tree,
        &atom,
        &tc.pos,
        &mut lh,
        &key,
        ItemData::new(ItemId::Tail, vec![9u8; 800]),
        0,
    )
    .unwrap();
    // the handle is still locked, on whichever node holds the new item
    assert!(!lh.is_none());
    let tracked_block = lh.node().block();
    drop(lh);
    let (res2, tc2, _lh2) = search::lookup_key(&tree, &key, LookupBias::Exact).unwrap();
    assert_eq!(res2, NodeSearch::Found);
    assert_eq!(tc2.node.block(), tracked_block);
}
