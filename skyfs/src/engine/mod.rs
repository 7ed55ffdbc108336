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

#![allow(dead_code)]

#[macro_use]
pub mod macros;
pub mod carry;
pub mod config;
pub mod coord;
pub mod error;
pub mod flush;
pub mod key;
pub mod node;
pub mod storage;
pub mod sync;
pub mod tree;
pub mod txn;

/*

    A word on tests:

    Most assertions made here are about quiescent states: a tree that no
    other thread is dancing with at that point in time. We do emulate
    contention where it matters (lock priorities, restart paths), but
    remember that any observation of a live tree is only atomically
    correct at a point in time.
*/
