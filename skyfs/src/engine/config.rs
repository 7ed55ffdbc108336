/*
 * Created on Tue Jan 09 2024
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
    crate::engine::error::{StorageError, StorageResult},
    serde::Deserialize,
    std::fs,
};

/// don't allow the tree to be lower than this (the twig level)
pub const MIN_TREE_HEIGHT: u8 = 2;
/// a ridiculously high limit on tree height, used to size per-level arrays
pub const MAX_TREE_HEIGHT: u8 = 10;
/// elementary tree operations carried to the next level per carry call
pub const CARRIES_POOL_SIZE: usize = 5;
/// preallocated carry node records per carry call
pub const NODES_LOCKED_POOL_SIZE: usize = 5;
/// below this many items sequential scan beats binary search in a node
pub const SEQ_SEARCH_BREAK: usize = 3;
/// slots in the coord-by-key cache
pub const CBK_CACHE_SLOTS: usize = 16;
/// flow insertion may add at most this many fresh nodes at the leaf level
pub const FLOW_NEW_NODES_LIMIT: usize = 4;
/// give up after this many top-level search restarts
pub const CBK_ITERATIONS_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
/// Mount-time tunables for the tree engine.
///
/// Everything here is advisory except `block_size`: the normative
/// behavior of the engine (carry semantics, relocation rule, lock
/// ordering) does not change with these knobs.
pub struct EngineConfig {
    /// bytes per formatted node; must match the device page size
    pub block_size: usize,
    /// maximum nodes visited by the leftward flush scan on one level
    pub scan_maxnodes: usize,
    /// this many adjacent dirty leaves force relocation
    pub relocate_threshold: usize,
    /// accept an allocation at most this far from the preceder
    pub relocate_distance: u64,
    /// blocks gathered before flush submits I/O
    pub flush_queue_size: usize,
    /// soft cap on captured nodes before an early commit is suggested;
    /// 0 means auto-adjusted to memory pressure
    pub atom_max_size: usize,
    /// atoms older than this many milliseconds are force-committed
    pub atom_max_age_ms: u64,
    /// commit daemon wakeup period in milliseconds
    pub txnmgr_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            scan_maxnodes: 10_000,
            relocate_threshold: 64,
            relocate_distance: 64,
            flush_queue_size: 256,
            atom_max_size: 0,
            atom_max_age_ms: 600_000,
            txnmgr_tick_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn read_from_yaml(path: &str) -> StorageResult<Self> {
        let raw = fs::read_to_string(path)?;
        Self::decode_yaml(&raw)
    }
    pub fn decode_yaml(raw: &str) -> StorageResult<Self> {
        serde_yaml::from_str(raw).map_err(|e| {
            log::error!("failed to decode engine config: {e}");
            StorageError::BadSuper
        })
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;
    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.block_size, 4096);
        assert_eq!(cfg.scan_maxnodes, 10_000);
        assert_eq!(cfg.relocate_threshold, 64);
    }
    #[test]
    fn decode_partial_yaml() {
        let cfg = EngineConfig::decode_yaml("block_size: 8192\nscan_maxnodes: 128\n").unwrap();
        assert_eq!(cfg.block_size, 8192);
        assert_eq!(cfg.scan_maxnodes, 128);
        // untouched knobs keep their defaults
        assert_eq!(cfg.relocate_threshold, EngineConfig::default().relocate_threshold);
    }
    #[test]
    fn decode_rejects_unknown() {
        assert!(EngineConfig::decode_yaml("not_a_knob: 1\n").is_err());
    }
}
