/*
 * Created on Sat Jan 27 2024
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

pub mod jnode;
pub mod search;
#[cfg(test)]
mod tests;
pub mod walk;
pub mod znode;

pub use {
    jnode::{jflags, same_atom_dirty, Jnode},
    znode::{longterm_lock, LockHandle, Znode},
};

use {
    crate::engine::{
        config::EngineConfig,
        coord::{Between, Coord},
        error::{TreeError, TreeResult},
        key::{Key, KeyScheme, MAX_KEY, MIN_KEY},
        node::{
            items::{item_ops, InternalItem, ItemId},
            node_layout_by_id, ItemData, ItemEnv, NodeLayout, NodeNotify,
        },
        storage::{
            bitmap::BitmapAllocator,
            blockdev::BlockDevice,
            fakeblock::FakeBlockGen,
            journal::{data_start_block, JournalRecord},
            superblock::{FormatSuper, MasterSuper},
        },
        sync::cell::TMCell,
        txn::Atom,
    },
    parking_lot::Mutex,
    std::{collections::HashMap, sync::Arc},
};

/// leaf nodes live here
pub const LEAF_LEVEL: u8 = 1;
/// the level just above the leaves, where extent pointers live
pub const TWIG_LEVEL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where the tree currently hangs: published through a TMCell so that
/// readers find the root without the tree lock.
pub struct RootDesc {
    pub block: u64,
    pub height: u8,
}

/// A coord pinned to a live znode
#[derive(Clone)]
pub struct TreeCoord {
    pub node: Arc<Znode>,
    pub pos: Coord,
}

/// The in-memory tree: znode cache, root descriptor, delimiting-key
/// guard, and the glue to the storage collaborators.
pub struct Tree {
    pub cfg: EngineConfig,
    pub env: ItemEnv,
    pub layout: &'static dyn NodeLayout,
    pub dev: Arc<dyn BlockDevice>,
    pub alloc: Arc<BitmapAllocator>,
    pub oids: Arc<crate::engine::storage::oid::OidAllocator>,
    pub fake: FakeBlockGen,
    root: TMCell<RootDesc>,
    /// the tree lock: znode hash plus structural link updates
    map: Mutex<HashMap<u64, Arc<Znode>>>,
    /// serializes cross-node delimiting key updates
    dk_guard: Mutex<()>,
    /// recently used search targets
    pub(crate) cbk: search::CbkCache,
    /// unformatted page jnodes by (mapping oid, page index)
    pages: Mutex<HashMap<(u64, u64), Arc<Jnode>>>,
}

impl Tree {
    /// Build the in-memory tree over an already-valid on-disk state.
    pub fn init(
        dev: Arc<dyn BlockDevice>,
        cfg: EngineConfig,
        scheme: KeyScheme,
        root_block: u64,
        height: u8,
        next_oid: u64,
        nr_files: u64,
    ) -> TreeResult<Self> {
        let layout = match node_layout_by_id(crate::engine::node::FS40_NODE_ID) {
            Some(l) => l,
            None => return Err(TreeError::Io),
        };
        let bs = dev.block_size();
        let nblocks = dev.size_in_blocks();
        let reserved_head = data_start_block(bs);
        let alloc = Arc::new(BitmapAllocator::new(
            nblocks,
            &[(0, reserved_head), (root_block, 1)],
        ));
        let oids = Arc::new(crate::engine::storage::oid::OidAllocator::new(
            nr_files, next_oid,
        ));
        Ok(Self {
            env: ItemEnv {
                scheme,
                block_size: bs,
            },
            cfg,
            layout,
            dev,
            alloc,
            oids,
            fake: FakeBlockGen::new(),
            root: TMCell::new(RootDesc {
                block: root_block,
                height,
            }),
            map: Mutex::new(HashMap::new()),
            dk_guard: Mutex::new(()),
            cbk: search::CbkCache::new(),
            pages: Mutex::new(HashMap::new()),
        })
    }

    /// mkfs: stamp a fresh filesystem with an empty leaf root and mount
    /// it
    pub fn format(dev: Arc<dyn BlockDevice>, cfg: EngineConfig) -> TreeResult<Self> {
        let bs = dev.block_size();
        let root_block = data_start_block(bs);
        let master = MasterSuper::new(bs as u32);
        master.write_to(&*dev)?;
        // the empty root leaf
        let mut buf = vec![0u8; bs];
        let layout = match node_layout_by_id(master.node_plugin) {
            Some(l) => l,
            None => return Err(TreeError::Io),
        };
        layout.init(&mut buf, LEAF_LEVEL);
        dev.write_block(root_block, &buf)?;
        let format = FormatSuper {
            block_count: dev.size_in_blocks(),
            free_blocks: dev.size_in_blocks() - root_block - 1,
            root_block,
            tree_height: LEAF_LEVEL as u16,
            next_oid: crate::engine::storage::oid::OIDS_RESERVED,
            file_count: 0,
            flush_gen: 0,
        };
        format.write_to(&*dev)?;
        JournalRecord {
            sequence: 0,
            root_block,
            tree_height: LEAF_LEVEL as u16,
        }
        .write_footer(&*dev)?;
        Self::mount(dev, cfg)
    }

    /// mount: master super at byte 65536 selects the plugins; the
    /// format super (as left by journal replay) tells us where the tree
    /// is
    pub fn mount(dev: Arc<dyn BlockDevice>, cfg: EngineConfig) -> TreeResult<Self> {
        let master = MasterSuper::read_from(&*dev)?;
        let format = FormatSuper::read_from(&*dev)?;
        if node_layout_by_id(master.node_plugin).is_none() {
            log::error!("unknown node plugin {:#x}", master.node_plugin);
            return Err(TreeError::Io);
        }
        Self::init(
            dev,
            cfg,
            master.key_scheme,
            format.root_block,
            format.tree_height as u8,
            format.next_oid,
            format.file_count,
        )
    }

    /*
        root descriptor
    */

    pub fn root_desc(&self) -> RootDesc {
        self.root.read_copy()
    }
    pub fn height(&self) -> u8 {
        self.root_desc().height
    }
    pub fn is_root(&self, z: &Znode) -> bool {
        self.root_desc().block == z.block()
    }
    pub(crate) fn set_root_desc(&self, block: u64, height: u8) {
        self.root.publish(RootDesc { block, height });
    }

    /*
        znode cache
    */

    /// find or create the znode for `block`; does not load data
    pub fn zget(&self, block: u64, level: u8, parent: Option<&Arc<Znode>>) -> Arc<Znode> {
        let mut map = self.map.lock();
        if let Some(z) = map.get(&block) {
            if let Some(p) = parent {
                z.set_parent(Some(p));
            }
            return z.clone();
        }
        let z = Arc::new(Znode::new(block, level, 0));
        if let Some(p) = parent {
            z.set_parent(Some(p));
        }
        map.insert(block, z.clone());
        z
    }

    /// cache-only lookup
    pub fn zlook(&self, block: u64) -> Option<Arc<Znode>> {
        self.map.lock().get(&block).cloned()
    }

    /// drop a node from the cache (it heard the banshee)
    pub fn zdrop(&self, z: &Arc<Znode>) {
        z.j().set(jflags::HEARD_BANSHEE);
        znode::sibling_list_remove(z);
        self.map.lock().remove(&z.block());
    }

    /// the znode hash is keyed by block number; relocation re-keys
    pub fn rekey(&self, z: &Arc<Znode>, new_block: u64) {
        let mut map = self.map.lock();
        map.remove(&z.block());
        z.j().set_block(new_block);
        map.insert(new_block, z.clone());
    }

    /// make sure node data is in memory
    pub fn zload(&self, z: &Arc<Znode>) -> TreeResult<()> {
        if z.j().is_loaded() {
            return Ok(());
        }
        if !z.j().is_allocated() {
            // a fresh node must have been born loaded
            log::warn!("fake-numbered node {:#x} has no data", z.block());
            return Err(TreeError::Io);
        }
        let raw = self.dev.read_block(z.block())?;
        let mut buf = vec![0u8; self.env.block_size].into_boxed_slice();
        buf.copy_from_slice(&raw);
        self.layout.parse(&buf, z.level())?;
        z.j().install_data(buf);
        Ok(())
    }

    /// allocate a fresh formatted node at `level` with a fake block
    /// number
    pub fn new_node(&self, level: u8) -> TreeResult<Arc<Znode>> {
        let block = self.fake.next_formatted();
        let z = Arc::new(Znode::new(block, level, jflags::CREATED));
        let mut buf = vec![0u8; self.env.block_size].into_boxed_slice();
        self.layout.init(&mut buf, level);
        z.j().install_data(buf);
        self.map.lock().insert(block, z.clone());
        Ok(z)
    }

    /// number of cached znodes, for tests
    pub fn cached_nodes(&self) -> usize {
        self.map.lock().len()
    }

    /*
        dirtying and capture
    */

    /// mark dirty and capture into the atom
    pub fn make_dirty(&self, z: &Arc<Znode>, atom: &Arc<Atom>) {
        if !z.j().is_dirty() {
            z.j().set(jflags::DIRTY);
        }
        atom.capture_formatted(z);
    }

    /*
        delimiting keys
    */

    pub fn leftmost_key_in_node(&self, z: &Arc<Znode>) -> Option<Key> {
        let data = z.j().data();
        self.layout.leftmost_key(&self.env, &data)
    }

    /// structural check of a loaded node, including containment within
    /// its cached delimiting keys
    pub fn check_node(&self, z: &Arc<Znode>) -> Result<(), &'static str> {
        let (ld, rd) = (z.ld_key(), z.rd_key());
        let data = z.j().data();
        self.layout.check(&self.env, &data, Some((&ld, &rd)))
    }

    /// data moved between two siblings: refresh the delimiting keys
    /// between them
    pub fn update_dkeys(&self, left: Option<&Arc<Znode>>, right: &Arc<Znode>) {
        let _g = self.dk_guard.lock();
        let key = match self.leftmost_key_in_node(right) {
            Some(k) => k,
            None => {
                // right became empty: it covers nothing anymore
                if let Some(l) = left {
                    let rd = right.rd_key();
                    l.set_rd_key(rd);
                    right.set_ld_key(rd);
                }
                return;
            }
        };
        if let Some(l) = left {
            let l_empty = {
                let d = l.j().data();
                self.layout.is_empty(&d)
            };
            if !l_empty {
                l.set_rd_key(key);
            } else {
                l.set_rd_key(l.ld_key());
            }
        }
        right.set_ld_key(key);
    }

    /*
        parent/child resolution
    */

    /// coord of the pointer to `child_block` inside the (loaded,
    /// locked) parent
    pub fn find_child_ptr(&self, parent: &Arc<Znode>, child_block: u64) -> TreeResult<Coord> {
        let data = parent.j().data();
        let nitems = self.layout.num_items(&data);
        for pos in 0..nitems {
            let Some(id) = ItemId::from_raw(self.layout.item_id_at(&data, pos)) else {
                return Err(TreeError::Io);
            };
            if !id.is_internal() {
                continue;
            }
            let body = self.layout.item_body(&data, pos);
            if item_ops(id).down_link(body) == Some(child_block) {
                return Ok(Coord {
                    item_pos: pos,
                    unit_pos: 0,
                    between: Between::AtUnit,
                });
            }
        }
        Err(TreeError::NotFound)
    }

    /// delimiting keys a child inherits from its pointer's position in
    /// the parent
    pub fn child_dkeys(&self, parent: &Arc<Znode>, coord: &Coord) -> (Key, Key) {
        let data = parent.j().data();
        let nitems = self.layout.num_items(&data);
        let ld = if coord.item_pos == 0 {
            parent.ld_key()
        } else {
            self.layout.key_at(&data, coord.item_pos)
        };
        let rd = if coord.item_pos + 1 < nitems {
            self.layout.key_at(&data, coord.item_pos + 1)
        } else {
            parent.rd_key()
        };
        (ld, rd)
    }

    /// child znode behind the internal item at `coord` in `parent`
    pub fn child_znode(
        &self,
        parent: &Arc<Znode>,
        coord: &Coord,
        set_dkeys: bool,
    ) -> TreeResult<Arc<Znode>> {
        let child_block = {
            let data = parent.j().data();
            let Some(id) = ItemId::from_raw(self.layout.item_id_at(&data, coord.item_pos)) else {
                return Err(TreeError::Io);
            };
            if !id.is_internal() {
                return Err(TreeError::NotFound);
            }
            match item_ops(id).down_link(self.layout.item_body(&data, coord.item_pos)) {
                Some(b) => b,
                None => return Err(TreeError::NotFound),
            }
        };
        let child = self.zget(child_block, parent.level() - 1, Some(parent));
        if set_dkeys {
            let _g = self.dk_guard.lock();
            let (ld, rd) = self.child_dkeys(parent, coord);
            child.set_dk(ld, rd);
        }
        Ok(child)
    }

    /*
        root growth and shrinking
    */

    /// the tree got taller: hang a fresh root above the old one
    pub fn grow_root(&self, old_root: &Arc<Znode>, atom: &Arc<Atom>) -> TreeResult<Arc<Znode>> {
        let desc = self.root_desc();
        debug_assert_eq!(old_root.block(), desc.block);
        let new_root = self.new_node(desc.height + 1)?;
        {
            let mut data = new_root.j().data_mut();
            let mut coord = Coord::default();
            let mut notify = NodeNotify::default();
            let item = ItemData::new(ItemId::Internal, InternalItem::encode(old_root.block()));
            self.layout
                .create_item(&self.env, &mut data, &mut coord, &MIN_KEY, &item, &mut notify);
        }
        new_root.set_dk(MIN_KEY, MAX_KEY);
        new_root.set_left(None);
        new_root.set_right(None);
        old_root.set_parent(Some(&new_root));
        self.make_dirty(&new_root, atom);
        self.set_root_desc(new_root.block(), desc.height + 1);
        log::debug!(
            "tree grew to height {} with root {:#x}",
            desc.height + 1,
            new_root.block()
        );
        Ok(new_root)
    }

    /// the root holds a single pointer and sits above the twig level:
    /// promote its only child
    pub fn kill_root(&self, root: &Arc<Znode>, atom: &Arc<Atom>) -> TreeResult<()> {
        let desc = self.root_desc();
        debug_assert!(desc.height > TWIG_LEVEL);
        let child_block = {
            let data = root.j().data();
            debug_assert_eq!(self.layout.num_items(&data), 1);
            let body = self.layout.item_body(&data, 0);
            InternalItem::decode(body)
        };
        let child = self.zget(child_block, desc.height - 1, None);
        child.set_parent(None);
        child.set_dk(MIN_KEY, MAX_KEY);
        self.set_root_desc(child_block, desc.height - 1);
        if root.j().is_allocated() {
            atom.defer_delete(root.block(), 1);
        }
        self.zdrop(root);
        atom.forget(root.block());
        log::debug!(
            "tree shrank to height {} with root {:#x}",
            desc.height - 1,
            child_block
        );
        Ok(())
    }

    /*
        unformatted page jnodes (the page-cache contract)
    */

    pub fn page_jnode(&self, oid: u64, index: u64) -> Option<Arc<Jnode>> {
        self.pages.lock().get(&(oid, index)).cloned()
    }
    pub fn grab_page_jnode(&self, oid: u64, index: u64) -> Arc<Jnode> {
        let mut pages = self.pages.lock();
        if let Some(j) = pages.get(&(oid, index)) {
            return j.clone();
        }
        let j = Arc::new(Jnode::new_unformatted(
            self.fake.next_unformatted(),
            oid,
            index,
        ));
        pages.insert((oid, index), j.clone());
        j
    }

    /*
        superblock round trips
    */

    /// persist the tree head after a completed flush generation
    pub fn write_format_super(&self, next_oid: u64, file_count: u64, flush_gen: u64) -> TreeResult<()> {
        let desc = self.root_desc();
        let format = FormatSuper {
            block_count: self.dev.size_in_blocks(),
            free_blocks: self.alloc.free_blocks(),
            root_block: desc.block,
            tree_height: desc.height as u16,
            next_oid,
            file_count,
            flush_gen,
        };
        format.write_to(&*self.dev)?;
        JournalRecord {
            sequence: flush_gen,
            root_block: desc.block,
            tree_height: desc.height as u16,
        }
        .write_footer(&*self.dev)?;
        Ok(())
    }
}
