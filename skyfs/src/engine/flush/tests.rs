/*
 * Created on Tue Feb 06 2024
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
    crate::engine::{
        carry::{self, DELETE_KILL},
        config::EngineConfig,
        coord::{Between, Coord},
        key::{Key, KeyMinor},
        node::{items::ItemId, CutRange, ItemData, LookupBias, NodeSearch},
        storage::blockdev::{BlockDevice, MemDisk},
        tree::{jflags, jnode::JnodeRef, search, Tree, LEAF_LEVEL},
        txn::{Atom, AtomStage, TxnMgr},
    },
    std::sync::Arc,
};

fn testsetup() -> (Arc<MemDisk>, Arc<Tree>, Arc<TxnMgr>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dev = Arc::new(MemDisk::new(4096, 1024));
    let tree = Arc::new(Tree::format(dev.clone(), EngineConfig::default()).unwrap());
    let mgr = TxnMgr::new(EngineConfig::default());
    (dev, tree, mgr)
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
    carry::cut_node(tree, atom, range, &mut lh, DELETE_KILL).unwrap();
}

/// walk the leaf level left to right, counting nodes
fn count_leaves(tree: &Tree) -> usize {
    let (_, tc, _lh) = search::lookup_key(tree, &crate::engine::key::MIN_KEY, LookupBias::MaxNotGreater)
        .unwrap();
    let mut node = tc.node.clone();
    let mut count = 1;
    while let Some(r) = node.right() {
        node = r;
        count += 1;
    }
    count
}

#[test]
fn commit_then_remount_preserves_data() {
    let (dev, tree, mgr) = testsetup();
    let atom = mgr.current_atom();
    for oid in 0..20u64 {
        put(&tree, &atom, bkey(oid), &[oid as u8; 700]);
    }
    mgr.commit_current(&tree).unwrap();

    // every captured member ended clean and allocated
    assert_eq!(atom.stage(), AtomStage::Done);
    for oid in 0..20u64 {
        assert_eq!(get(&tree, bkey(oid)).unwrap(), vec![oid as u8; 700]);
    }

    // a cold mount from the same device sees the same tree
    drop(tree);
    let tree = Arc::new(Tree::mount(dev, EngineConfig::default()).unwrap());
    for oid in 0..20u64 {
        assert_eq!(
            get(&tree, bkey(oid)).unwrap(),
            vec![oid as u8; 700],
            "oid {oid} lost across remount"
        );
    }
}

#[test]
fn flush_allocates_every_member() {
    let (_dev, tree, mgr) = testsetup();
    let atom = mgr.current_atom();
    for oid in 0..16u64 {
        put(&tree, &atom, bkey(oid), &[3u8; 800]);
    }
    crate::engine::flush::flush_atom(&tree, &atom).unwrap();
    // no dirty member remains on any level, and nothing kept a fake
    // block number
    for level in LEAF_LEVEL..=crate::engine::config::MAX_TREE_HEIGHT {
        assert_eq!(atom.dirty_count_at(level), 0, "level {level} still dirty");
    }
    for member in atom.clean_members() {
        assert!(member.j().is_allocated());
        assert!(!member.j().is_dirty());
        assert!(member.j().test(jflags::RELOC) || member.j().test(jflags::WANDER));
    }
    // the root block in the descriptor is real as well
    assert!(!crate::engine::storage::fakeblock::is_fake(
        tree.root_desc().block
    ));
}

#[test]
fn squeeze_merges_sparse_leaves() {
    // dirty leaves at ~40% fill in one atom: flushing packs them
    // leftward and drops the emptied ones
    let (_dev, tree, mgr) = testsetup();
    let atom = mgr.current_atom();
    for oid in 0..16u64 {
        put(&tree, &atom, bkey(oid), &[oid as u8; 800]);
    }
    let leaves_before = count_leaves(&tree);
    assert!(leaves_before >= 4);
    // thin the leaves out: keep ~2 of 4 items per leaf
    for oid in (0..16u64).step_by(2) {
        del(&tree, &atom, bkey(oid));
    }
    // the dance: deletes did not rebalance anything
    assert_eq!(count_leaves(&tree), leaves_before);

    mgr.commit_atom(&tree, &atom).unwrap();

    let leaves_after = count_leaves(&tree);
    assert!(
        leaves_after < leaves_before,
        "squeeze failed: {leaves_before} -> {leaves_after}"
    );
    for oid in 0..16u64 {
        let hit = get(&tree, bkey(oid)).is_some();
        assert_eq!(hit, oid % 2 == 1, "oid {oid}");
    }
}

#[test]
fn relocation_decision_leftmost_leaf() {
    // after a commit everything is clean; re-dirtying the leftmost
    // leaf relocates it (leftmost-of-parent at the leaf level), the
    // parent gets dirtied, and untouched siblings keep their blocks
    let (_dev, tree, mgr) = testsetup();
    let atom = mgr.current_atom();
    for oid in 0..16u64 {
        put(&tree, &atom, bkey(oid), &[1u8; 800]);
    }
    mgr.commit_current(&tree).unwrap();

    let first_leaf = {
        let (_, tc, _lh) = search::lookup_key(&tree, &bkey(1), LookupBias::Exact).unwrap();
        tc.node.clone()
    };
    let old_block = first_leaf.block();
    let sibling_blocks: Vec<u64> = {
        let mut blocks = vec![];
        let mut n = first_leaf.clone();
        while let Some(r) = n.right() {
            blocks.push(r.block());
            n = r;
        }
        blocks
    };
    assert!(!sibling_blocks.is_empty());

    // dirty just the leftmost leaf with a key below every existing one
    let atom = mgr.current_atom();
    put(&tree, &atom, Key::build(0, KeyMinor::Body, 0, 1), &[9u8; 16]);
    assert!(Arc::ptr_eq(
        &{
            let (_, tc, _lh) = search::lookup_key(&tree, &bkey(1), LookupBias::Exact).unwrap();
            tc.node.clone()
        },
        &first_leaf
    ));
    crate::engine::flush::jnode_flush(&tree, &atom, &JnodeRef::Z(first_leaf.clone())).unwrap();

    // relocated: new block, old one is deferred for deallocation
    assert!(first_leaf.j().test(jflags::RELOC));
    assert_ne!(first_leaf.block(), old_block);
    assert!(atom
        .deleted_runs()
        .iter()
        .any(|&(start, len)| start == old_block && len == 1));
    // the untouched siblings kept their homes
    let mut n = first_leaf.clone();
    let mut after = vec![];
    while let Some(r) = n.right() {
        after.push(r.block());
        n = r;
    }
    assert_eq!(after, sibling_blocks);
    // the parent follows the child: its pointer holds the new address
    let parent = first_leaf.parent().unwrap();
    tree.find_child_ptr(&parent, first_leaf.block()).unwrap();
}

#[test]
fn scan_left_respects_the_cap() {
    let (_dev, tree, mgr) = testsetup();
    let atom = mgr.current_atom();
    for oid in 0..20u64 {
        put(&tree, &atom, bkey(oid), &[1u8; 800]);
    }
    // rightmost leaf
    let (_, tc, _lh) =
        search::lookup_key(&tree, &bkey(19), LookupBias::Exact).unwrap();
    let start = JnodeRef::Z(tc.node.clone());
    let capped = super::scan_left(&tree, &atom, start.clone(), 2).unwrap();
    assert!(capped.size <= 2);
    let full = super::scan_left(&tree, &atom, start, 10_000).unwrap();
    assert!(full.size >= capped.size);
    // the full scan reaches the leftmost dirty leaf
    let leftmost = full.node.as_znode().unwrap().clone();
    assert!(leftmost.left().is_none() || !leftmost.left().unwrap().j().is_dirty());
}

#[test]
fn random_workload_survives_commits() {
    use rand::{Rng, SeedableRng};
    let (dev, tree, mgr) = testsetup();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
    let mut model: std::collections::HashMap<u64, Vec<u8>> = Default::default();

    for step in 0..200usize {
        let oid = rng.gen_range(0..60u64);
        let atom = mgr.current_atom();
        match model.get(&oid) {
            None => {
                let len = rng.gen_range(50..600usize);
                let body = vec![(oid as u8) ^ (len as u8); len];
                put(&tree, &atom, bkey(oid), &body);
                model.insert(oid, body);
            }
            Some(_) => {
                del(&tree, &atom, bkey(oid));
                model.remove(&oid);
            }
        }
        if step % 50 == 49 {
            mgr.commit_current(&tree).unwrap();
        }
    }
    mgr.commit_current(&tree).unwrap();

    // the in-memory tree agrees with the model
    for oid in 0..60u64 {
        match model.get(&oid) {
            Some(body) => assert_eq!(get(&tree, bkey(oid)).as_ref(), Some(body), "oid {oid}"),
            None => assert!(get(&tree, bkey(oid)).is_none(), "oid {oid} undead"),
        }
    }
    // and so does a cold mount
    drop(tree);
    let tree = Arc::new(Tree::mount(dev, EngineConfig::default()).unwrap());
    for (oid, body) in &model {
        assert_eq!(
            get(&tree, bkey(*oid)).as_ref(),
            Some(body),
            "oid {oid} lost across remount"
        );
    }
}

#[test]
fn extents_allocate_in_place_on_flush() {
    // an unallocated extent at the twig level gets real storage during
    // squalloc, and the pages it covers land on those blocks
    let (dev, tree, mgr) = testsetup();
    let atom = mgr.current_atom();
    // something at the leaf level to anchor the tree
    put(&tree, &atom, bkey(1), &[1u8; 64]);

    // three dirty pages of object 9
    let oid = 9u64;
    let mut pages = vec![];
    for index in 0..3u64 {
        let page = tree.grab_page_jnode(oid, index);
        let mut buf = vec![0u8; 4096].into_boxed_slice();
        buf.fill(0xA0 + index as u8);
        page.install_data(buf);
        page.set(crate::engine::tree::jflags::DIRTY);
        atom.capture_unformatted(&page);
        pages.push(page);
    }

    // the extent entry covering them
    let ekey = Key::build(oid, KeyMinor::Body, oid, 0);
    let extent = crate::engine::node::items::ExtentItem::build(&[
        crate::engine::node::items::ExtentUnit {
            start: crate::engine::node::items::EXTENT_UNALLOCATED,
            width: 3,
        },
    ]);
    let (_, tc, mut lh) = search::lookup_for_modify(&tree, &ekey).unwrap();
    carry::insert_extent(
        &tree,
        &atom,
        &tc.pos,
        &mut lh,
        &ekey,
        crate::engine::node::ItemData::new(ItemId::Extent, extent),
        0,
    )
    .unwrap();
    drop(lh);
    // the extent lives one level above the leaves now
    assert!(tree.root_desc().height >= 2);

    mgr.commit_current(&tree).unwrap();

    // every page has a real home and its bytes are on the device
    for (index, page) in pages.iter().enumerate() {
        assert!(page.is_allocated(), "page {index} still fake");
        let on_disk = dev.read_block(page.block()).unwrap();
        assert!(on_disk.iter().all(|b| *b == 0xA0 + index as u8));
    }
    // the twig's extent unit points at the allocated run
    let (res, tc, _lh) = search::coord_by_key(
        &tree,
        &ekey,
        crate::engine::sync::longterm::LockMode::Read,
        LookupBias::MaxNotGreater,
        crate::engine::tree::TWIG_LEVEL,
        crate::engine::tree::TWIG_LEVEL,
    )
    .unwrap();
    assert_eq!(res, NodeSearch::Found);
    let data = tc.node.j().data();
    let body = tree.layout.item_body(&data, tc.pos.item_pos);
    let unit = crate::engine::node::items::ExtentItem::unit(body, 0);
    assert!(unit.is_real());
    assert_eq!(unit.start, pages[0].block());
}

#[test]
fn wander_set_written_at_writeback_only() {
    let (dev, tree, mgr) = testsetup();
    let atom = mgr.current_atom();
    // a single small item dirties only the root leaf, which never
    // relocates
    put(&tree, &atom, bkey(1), &[5u8; 64]);
    let root_block = tree.root_desc().block;
    let image_before = dev.read_block(root_block).unwrap();

    crate::engine::flush::flush_atom(&tree, &atom).unwrap();
    // flush allocated but did not overwrite in place yet
    let image_mid = dev.read_block(root_block).unwrap();
    assert_eq!(image_before, image_mid);

    crate::engine::flush::writeback_atom(&tree, &atom).unwrap();
    let image_after = dev.read_block(root_block).unwrap();
    assert_ne!(image_before, image_after);
}
