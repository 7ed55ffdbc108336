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

/*
    Coords are logical positions inside one node: (item_pos, unit_pos,
    between). They are pure node-local state machines; nothing here takes
    a lock or touches the tree. The host of a coord (anything that can
    count items and units) is passed in explicitly, which keeps the state
    machine testable against stub hosts.
*/

/// Anything a coord can navigate: it counts items, and units per item.
pub trait CoordHost {
    fn num_items(&self) -> usize;
    fn num_units(&self, item_pos: usize) -> usize;
    fn is_empty(&self) -> bool {
        self.num_items() == 0
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[repr(u8)]
/// Where a coord sits relative to its indices
pub enum Between {
    #[default]
    AtUnit = 0,
    BeforeUnit = 1,
    AfterUnit = 2,
    BeforeItem = 3,
    AfterItem = 4,
    EmptyNode = 5,
    Invalid = 6,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Classification of a coord relative to the node as a whole
pub enum CoordWrt {
    OnTheLeft,
    Inside,
    OnTheRight,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum CoordCmp {
    OnLeft,
    Same,
    OnRight,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct Coord {
    pub item_pos: usize,
    pub unit_pos: usize,
    pub between: Between,
}

impl Coord {
    const fn new(item_pos: usize, unit_pos: usize, between: Between) -> Self {
        Self {
            item_pos,
            unit_pos,
            between,
        }
    }

    /*
        constructors
    */

    pub const fn invalid() -> Self {
        Self::new(0, 0, Between::Invalid)
    }
    /// first unit of the first item; `EmptyNode` when the host is empty
    pub fn first_unit(host: &impl CoordHost) -> Self {
        if host.is_empty() {
            Self::new(0, 0, Between::EmptyNode)
        } else {
            Self::new(0, 0, Between::AtUnit)
        }
    }
    /// last unit of the last item; `EmptyNode` when the host is empty
    pub fn last_unit(host: &impl CoordHost) -> Self {
        if host.is_empty() {
            Self::new(0, 0, Between::EmptyNode)
        } else {
            let item = host.num_items() - 1;
            Self::new(item, host.num_units(item) - 1, Between::AtUnit)
        }
    }
    pub fn before_first_item(host: &impl CoordHost) -> Self {
        if host.is_empty() {
            Self::new(0, 0, Between::EmptyNode)
        } else {
            Self::new(0, 0, Between::BeforeItem)
        }
    }
    pub fn after_last_item(host: &impl CoordHost) -> Self {
        if host.is_empty() {
            Self::new(0, 0, Between::EmptyNode)
        } else {
            Self::new(host.num_items() - 1, 0, Between::AfterItem)
        }
    }
    pub fn sideof_unit(host: &impl CoordHost, side: Side) -> Self {
        match side {
            Side::Left => Self::first_unit(host),
            Side::Right => Self::last_unit(host),
        }
    }

    /*
        predicates
    */

    pub const fn is_invalid(&self) -> bool {
        matches!(self.between, Between::Invalid)
    }
    pub fn last_unit_pos(&self, host: &impl CoordHost) -> usize {
        host.num_units(self.item_pos) - 1
    }
    pub fn is_existing_item(&self, host: &impl CoordHost) -> bool {
        match self.between {
            Between::EmptyNode | Between::BeforeItem | Between::AfterItem | Between::Invalid => {
                false
            }
            Between::BeforeUnit | Between::AtUnit | Between::AfterUnit => {
                self.item_pos < host.num_items()
            }
        }
    }
    pub fn is_existing_unit(&self, host: &impl CoordHost) -> bool {
        match self.between {
            Between::AtUnit => {
                self.item_pos < host.num_items() && self.unit_pos < host.num_units(self.item_pos)
            }
            _ => false,
        }
    }
    pub fn is_leftmost_unit(&self) -> bool {
        matches!(self.between, Between::AtUnit) && self.item_pos == 0 && self.unit_pos == 0
    }
    /// positioned after the last unit/item, or the node is empty
    pub fn is_after_rightmost(&self, host: &impl CoordHost) -> bool {
        match self.between {
            Between::Invalid | Between::AtUnit | Between::BeforeUnit | Between::BeforeItem => false,
            Between::EmptyNode => true,
            Between::AfterItem => self.item_pos == host.num_items() - 1,
            Between::AfterUnit => {
                self.item_pos == host.num_items() - 1 && self.unit_pos == self.last_unit_pos(host)
            }
        }
    }
    /// positioned before the first item, or the node is empty
    pub fn is_before_leftmost(&self, host: &impl CoordHost) -> bool {
        let _ = host;
        match self.between {
            Between::Invalid | Between::AtUnit | Between::AfterItem | Between::AfterUnit => false,
            Between::EmptyNode => true,
            Between::BeforeItem | Between::BeforeUnit => self.item_pos == 0 && self.unit_pos == 0,
        }
    }
    /// between two items (or before the first / after the last)
    pub fn is_between_items(&self, host: &impl CoordHost) -> bool {
        match self.between {
            Between::Invalid | Between::AtUnit => false,
            Between::AfterItem | Between::BeforeItem | Between::EmptyNode => true,
            Between::BeforeUnit => self.unit_pos == 0,
            Between::AfterUnit => self.unit_pos == self.last_unit_pos(host),
        }
    }
    pub fn wrt(&self, host: &impl CoordHost) -> CoordWrt {
        if self.is_before_leftmost(host) {
            CoordWrt::OnTheLeft
        } else if self.is_after_rightmost(host) {
            CoordWrt::OnTheRight
        } else {
            CoordWrt::Inside
        }
    }

    /*
        movement
    */

    /// Common bounds adjustment before next/prev moves. Returns `true`
    /// when the move cannot yield a position.
    fn adjust_items(&mut self, items: usize, is_next: bool) -> bool {
        if matches!(self.between, Between::Invalid) {
            return true;
        }
        if items == 0 {
            self.between = Between::EmptyNode;
            self.item_pos = 0;
            self.unit_pos = 0;
            return true;
        }
        if matches!(self.between, Between::EmptyNode) {
            // it was empty and no longer is
            self.between = if is_next {
                Between::BeforeItem
            } else {
                Between::AfterItem
            };
            self.item_pos = 0;
            self.unit_pos = 0;
            return false;
        }
        if self.item_pos >= items {
            self.between = Between::AfterItem;
            self.item_pos = items - 1;
            self.unit_pos = 0;
            return is_next;
        }
        false
    }

    /// Advance one unit right. Returns `true` if the new position does
    /// not exist (moved past the end).
    pub fn next_unit(&mut self, host: &impl CoordHost) -> bool {
        let items = host.num_items();
        if self.adjust_items(items, true) {
            return true;
        }
        match self.between {
            Between::BeforeUnit => {
                self.between = Between::AtUnit;
                false
            }
            Between::AfterUnit | Between::AtUnit => {
                if self.unit_pos < self.last_unit_pos(host) {
                    self.unit_pos += 1;
                    self.between = Between::AtUnit;
                    return false;
                }
                // crossing an item boundary
                self.between = Between::AfterItem;
                self.unit_pos = 0;
                if self.item_pos == items - 1 {
                    return true;
                }
                self.item_pos += 1;
                self.unit_pos = 0;
                self.between = Between::AtUnit;
                false
            }
            Between::AfterItem => {
                if self.item_pos == items - 1 {
                    return true;
                }
                self.item_pos += 1;
                self.unit_pos = 0;
                self.between = Between::AtUnit;
                false
            }
            Between::BeforeItem => {
                self.unit_pos = 0;
                self.between = Between::AtUnit;
                false
            }
            Between::Invalid | Between::EmptyNode => impossible!(),
        }
    }

    /// Advance one item right. Returns `true` if the new position does
    /// not exist.
    pub fn next_item(&mut self, host: &impl CoordHost) -> bool {
        let items = host.num_items();
        if self.adjust_items(items, true) {
            return true;
        }
        match self.between {
            Between::AfterUnit | Between::AtUnit | Between::BeforeUnit | Between::AfterItem => {
                if self.item_pos == items - 1 {
                    self.between = Between::AfterItem;
                    self.unit_pos = 0;
                    return true;
                }
                self.between = Between::AtUnit;
                self.item_pos += 1;
                self.unit_pos = 0;
                false
            }
            Between::BeforeItem => {
                self.unit_pos = 0;
                self.between = Between::AtUnit;
                false
            }
            Between::Invalid | Between::EmptyNode => impossible!(),
        }
    }

    /// Move one unit left. Returns `true` if the new position does not
    /// exist.
    pub fn prev_unit(&mut self, host: &impl CoordHost) -> bool {
        let items = host.num_items();
        if self.adjust_items(items, false) {
            return true;
        }
        match self.between {
            Between::AtUnit | Between::BeforeUnit => {
                if self.unit_pos > 0 {
                    self.unit_pos -= 1;
                    self.between = Between::AtUnit;
                    return false;
                }
                if self.item_pos == 0 {
                    self.between = Between::BeforeItem;
                    return true;
                }
                self.item_pos -= 1;
                self.unit_pos = self.last_unit_pos(host);
                self.between = Between::AtUnit;
                false
            }
            Between::AfterUnit => {
                self.between = Between::AtUnit;
                false
            }
            Between::BeforeItem => {
                if self.item_pos == 0 {
                    return true;
                }
                self.item_pos -= 1;
                self.between = Between::AtUnit;
                self.unit_pos = self.last_unit_pos(host);
                false
            }
            Between::AfterItem => {
                self.between = Between::AtUnit;
                self.unit_pos = self.last_unit_pos(host);
                false
            }
            Between::Invalid | Between::EmptyNode => impossible!(),
        }
    }

    /// Move one item left. Returns `true` if the new position does not
    /// exist.
    pub fn prev_item(&mut self, host: &impl CoordHost) -> bool {
        let items = host.num_items();
        if self.adjust_items(items, false) {
            return true;
        }
        match self.between {
            Between::AtUnit | Between::AfterUnit | Between::BeforeUnit | Between::BeforeItem => {
                if self.item_pos == 0 {
                    self.between = Between::BeforeItem;
                    self.unit_pos = 0;
                    return true;
                }
                self.item_pos -= 1;
                self.unit_pos = 0;
                self.between = Between::AtUnit;
                false
            }
            Between::AfterItem => {
                self.between = Between::AtUnit;
                self.unit_pos = 0;
                false
            }
            Between::Invalid | Between::EmptyNode => impossible!(),
        }
    }

    pub fn sideof(&mut self, host: &impl CoordHost, side: Side) -> bool {
        match side {
            Side::Left => self.prev_unit(host),
            Side::Right => self.next_unit(host),
        }
    }
    pub fn is_after_sideof_unit(&self, host: &impl CoordHost, side: Side) -> bool {
        match side {
            Side::Left => self.is_before_leftmost(host),
            Side::Right => self.is_after_rightmost(host),
        }
    }

    /// Snap to the existing unit nearest to the left. Returns `true` if
    /// there is none.
    pub fn set_to_left(&mut self, host: &impl CoordHost) -> bool {
        if host.is_empty() {
            return true;
        }
        if self.is_between_items(host) {
            // item to the left of the boundary this coord sits on
            let left_item = match self.between {
                Between::EmptyNode => return true,
                Between::BeforeItem => {
                    if self.item_pos == 0 {
                        return true;
                    }
                    self.item_pos - 1
                }
                Between::BeforeUnit => {
                    debug_assert_eq!(self.unit_pos, 0);
                    if self.item_pos == 0 {
                        return true;
                    }
                    self.item_pos - 1
                }
                Between::AfterItem | Between::AfterUnit => self.item_pos,
                Between::AtUnit | Between::Invalid => impossible!(),
            };
            self.item_pos = left_item;
            self.unit_pos = host.num_units(left_item) - 1;
        } else if matches!(self.between, Between::BeforeUnit) {
            debug_assert_ne!(self.unit_pos, 0);
            self.unit_pos -= 1;
        }
        self.between = Between::AtUnit;
        false
    }

    /// Snap to the existing unit nearest to the right. Returns `true` if
    /// there is none.
    pub fn set_to_right(&mut self, host: &impl CoordHost) -> bool {
        if host.is_empty() {
            return true;
        }
        if self.is_between_items(host) {
            let right_item = match self.between {
                Between::EmptyNode => return true,
                Between::BeforeItem => self.item_pos,
                Between::BeforeUnit => self.item_pos,
                Between::AfterItem | Between::AfterUnit => self.item_pos + 1,
                Between::AtUnit | Between::Invalid => impossible!(),
            };
            if right_item >= host.num_items() {
                return true;
            }
            self.item_pos = right_item;
            self.unit_pos = 0;
        } else if matches!(self.between, Between::AfterUnit) {
            debug_assert!(self.unit_pos < self.last_unit_pos(host));
            self.unit_pos += 1;
        }
        self.between = Between::AtUnit;
        false
    }

    /// Collapse redundant representations after a shift invalidated the
    /// coord (e.g. `BeforeItem` at `num_items`).
    pub fn normalize(&mut self, host: &impl CoordHost) {
        if host.is_empty() {
            *self = Self::first_unit(host);
        } else if self.item_pos == host.num_items() && matches!(self.between, Between::BeforeItem) {
            self.item_pos -= 1;
            self.between = Between::AfterItem;
        } else if self.is_existing_item(host)
            && self.unit_pos == host.num_units(self.item_pos)
            && matches!(self.between, Between::BeforeUnit)
        {
            self.unit_pos -= 1;
            self.between = Between::AfterUnit;
        }
    }

    /*
        relations
    */

    /// Both coords must be existing units of the same host.
    pub fn compare(&self, other: &Self) -> CoordCmp {
        if self.item_pos > other.item_pos {
            return CoordCmp::OnRight;
        }
        if self.item_pos < other.item_pos {
            return CoordCmp::OnLeft;
        }
        if self.unit_pos > other.unit_pos {
            return CoordCmp::OnRight;
        }
        if self.unit_pos < other.unit_pos {
            return CoordCmp::OnLeft;
        }
        CoordCmp::Same
    }

    /// True iff the two coords refer to consecutive units, possibly
    /// across an item boundary. Both must be existing units.
    pub fn are_neighbors(&self, other: &Self, host: &impl CoordHost) -> bool {
        debug_assert!(self.is_existing_unit(host));
        debug_assert!(other.is_existing_unit(host));
        let (left, right) = match self.compare(other) {
            CoordCmp::OnLeft => (self, other),
            CoordCmp::OnRight => (other, self),
            CoordCmp::Same => return false,
        };
        if left.item_pos == right.item_pos {
            left.unit_pos + 1 == right.unit_pos
        } else if left.item_pos + 1 == right.item_pos {
            left.unit_pos == left.last_unit_pos(host) && right.unit_pos == 0
        } else {
            false
        }
    }

    /// Positional equality: coords between units/items that denote the
    /// same boundary count as equal.
    pub fn eq_position(&self, other: &Self) -> bool {
        if self == other {
            return true;
        }
        match self.between {
            Between::Invalid | Between::EmptyNode | Between::AtUnit => false,
            Between::BeforeUnit => {
                self.item_pos == other.item_pos
                    && matches!(other.between, Between::AfterUnit)
                    && other.unit_pos + 1 == self.unit_pos
            }
            Between::AfterUnit => {
                self.item_pos == other.item_pos
                    && matches!(other.between, Between::BeforeUnit)
                    && other.unit_pos == self.unit_pos + 1
            }
            Between::BeforeItem => {
                self.item_pos == other.item_pos + 1 && matches!(other.between, Between::AfterItem)
            }
            Between::AfterItem => {
                self.item_pos + 1 == other.item_pos && matches!(other.between, Between::BeforeItem)
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const fn other(&self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

#[cfg(test)]
mod tests;
