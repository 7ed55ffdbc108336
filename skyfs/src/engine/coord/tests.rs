/*
 * Created on Thu Jan 11 2024
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

use super::{Between, Coord, CoordHost, CoordWrt};

/// stub host: a node shape given as units-per-item
struct Shape(&'static [usize]);
impl CoordHost for Shape {
    fn num_items(&self) -> usize {
        self.0.len()
    }
    fn num_units(&self, item_pos: usize) -> usize {
        self.0[item_pos]
    }
}

const EMPTY: Shape = Shape(&[]);
const ONE: Shape = Shape(&[1]);
const MIXED: Shape = Shape(&[3, 1, 2]);

#[test]
fn empty_node_has_no_positions() {
    let mut c = Coord::first_unit(&EMPTY);
    assert_eq!(c.between, Between::EmptyNode);
    multi_assert_eq!(
        c.next_unit(&EMPTY),
        c.prev_unit(&EMPTY),
        c.next_item(&EMPTY),
        c.prev_item(&EMPTY) => true
    );
    assert_eq!(c.between, Between::EmptyNode);
}

#[test]
fn forward_walk_visits_every_unit() {
    let mut c = Coord::first_unit(&MIXED);
    let mut visited = vec![(c.item_pos, c.unit_pos)];
    while !c.next_unit(&MIXED) {
        visited.push((c.item_pos, c.unit_pos));
    }
    assert_eq!(
        visited,
        vec![(0, 0), (0, 1), (0, 2), (1, 0), (2, 0), (2, 1)]
    );
    assert!(c.is_after_rightmost(&MIXED));
}

#[test]
fn backward_walk_visits_every_unit() {
    let mut c = Coord::last_unit(&MIXED);
    let mut visited = vec![(c.item_pos, c.unit_pos)];
    while !c.prev_unit(&MIXED) {
        visited.push((c.item_pos, c.unit_pos));
    }
    assert_eq!(
        visited,
        vec![(2, 1), (2, 0), (1, 0), (0, 2), (0, 1), (0, 0)]
    );
    assert!(c.is_before_leftmost(&MIXED));
}

#[test]
fn next_then_prev_restores_inside_item() {
    let mut c = Coord::first_unit(&MIXED);
    let snap = c;
    assert!(!c.next_unit(&MIXED));
    assert!(!c.prev_unit(&MIXED));
    assert_eq!(c, snap);
}

#[test]
fn item_walk() {
    let mut c = Coord::first_unit(&MIXED);
    assert!(!c.next_item(&MIXED));
    assert_eq!((c.item_pos, c.unit_pos, c.between), (1, 0, Between::AtUnit));
    assert!(!c.next_item(&MIXED));
    assert_eq!(c.item_pos, 2);
    assert!(c.next_item(&MIXED));
    assert_eq!(c.between, Between::AfterItem);
    // and back
    assert!(!c.prev_item(&MIXED));
    assert_eq!((c.item_pos, c.unit_pos), (2, 0));
    assert!(!c.prev_item(&MIXED));
    assert!(!c.prev_item(&MIXED));
    assert_eq!(c.item_pos, 0);
    assert!(c.prev_item(&MIXED));
    assert_eq!(c.between, Between::BeforeItem);
}

#[test]
fn before_unit_moves() {
    let mut c = Coord {
        item_pos: 0,
        unit_pos: 2,
        between: Between::BeforeUnit,
    };
    // next_unit lands on the same unit
    assert!(!c.next_unit(&MIXED));
    assert_eq!((c.item_pos, c.unit_pos, c.between), (0, 2, Between::AtUnit));
    // prev_unit from BeforeUnit(u) lands on u-1
    let mut c = Coord {
        item_pos: 0,
        unit_pos: 2,
        between: Between::BeforeUnit,
    };
    assert!(!c.prev_unit(&MIXED));
    assert_eq!((c.item_pos, c.unit_pos, c.between), (0, 1, Between::AtUnit));
}

#[test]
fn set_to_left_and_right() {
    // between items 0 and 1
    let mut c = Coord {
        item_pos: 0,
        unit_pos: 0,
        between: Between::AfterItem,
    };
    let mut r = c;
    assert!(!c.set_to_left(&MIXED));
    assert_eq!((c.item_pos, c.unit_pos, c.between), (0, 2, Between::AtUnit));
    assert!(!r.set_to_right(&MIXED));
    assert_eq!((r.item_pos, r.unit_pos, r.between), (1, 0, Between::AtUnit));
    // after the very last unit there is nothing to the right
    let mut e = Coord::after_last_item(&MIXED);
    assert!(e.set_to_right(&MIXED));
    // before the very first unit there is nothing to the left
    let mut b = Coord::before_first_item(&MIXED);
    assert!(b.set_to_left(&MIXED));
}

#[test]
fn wrt_classification() {
    let inside = Coord::first_unit(&MIXED);
    assert_eq!(inside.wrt(&MIXED), CoordWrt::Inside);
    let left = Coord::before_first_item(&MIXED);
    assert_eq!(left.wrt(&MIXED), CoordWrt::OnTheLeft);
    let mut right = Coord::last_unit(&MIXED);
    right.next_unit(&MIXED);
    assert_eq!(right.wrt(&MIXED), CoordWrt::OnTheRight);
}

#[test]
fn neighbors_across_item_boundary() {
    let a = Coord {
        item_pos: 0,
        unit_pos: 2,
        between: Between::AtUnit,
    };
    let b = Coord {
        item_pos: 1,
        unit_pos: 0,
        between: Between::AtUnit,
    };
    assert!(a.are_neighbors(&b, &MIXED));
    assert!(b.are_neighbors(&a, &MIXED));
    let c = Coord {
        item_pos: 2,
        unit_pos: 0,
        between: Between::AtUnit,
    };
    assert!(!a.are_neighbors(&c, &MIXED));
    assert!(!a.are_neighbors(&a.clone(), &MIXED));
}

#[test]
fn normalize_collapses_past_end() {
    let mut c = Coord {
        item_pos: 3,
        unit_pos: 0,
        between: Between::BeforeItem,
    };
    c.normalize(&MIXED);
    assert_eq!((c.item_pos, c.between), (2, Between::AfterItem));
    let mut u = Coord {
        item_pos: 1,
        unit_pos: 1,
        between: Between::BeforeUnit,
    };
    u.normalize(&MIXED);
    assert_eq!((u.unit_pos, u.between), (0, Between::AfterUnit));
}

#[test]
fn eq_position_between_units() {
    let before = Coord {
        item_pos: 0,
        unit_pos: 1,
        between: Between::BeforeUnit,
    };
    let after = Coord {
        item_pos: 0,
        unit_pos: 0,
        between: Between::AfterUnit,
    };
    assert!(before.eq_position(&after));
    assert!(after.eq_position(&before));
    let at = Coord::first_unit(&ONE);
    assert!(!at.eq_position(&before));
}
