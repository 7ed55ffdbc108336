/*
 * Created on Mon Jan 08 2024
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

//! # Skyfs
//!
//! The core of a copy-on-write filesystem: an in-memory height-balanced
//! ordered tree ("dancing tree") with per-node long-term locks, deferred
//! multi-level balancing (carry), and a squeeze-and-allocate flush engine
//! that stages dirty subtrees onto a block device under a transactional
//! atom model.
//!
//! The tree is *not* balanced on every operation. Operations that free
//! space leave their vicinity alone; the tree is balanced when dirty
//! memory is flushed. A dancer has a sense of balance, but is not balanced
//! most of the time.

#![deny(unreachable_patterns)]

pub mod engine;
mod util;

pub use engine::{
    error::{TreeError, TreeResult},
    key::Key,
    tree::Tree,
};
