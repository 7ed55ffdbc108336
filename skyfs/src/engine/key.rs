/*
 * Created on Wed Jan 10 2024
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

use core::{cmp::Ordering, fmt};

/// Size of an encoded key on disk
pub const KEY_SIZE: usize = 24;

/// Minimal possible key: all components zero. Independent of key scheme.
pub const MIN_KEY: Key = Key { el: [0, 0, 0] };
/// Maximal possible key: all components all-ones. Independent of key scheme.
pub const MAX_KEY: Key = Key {
    el: [u64::MAX, u64::MAX, u64::MAX],
};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
/// Minor key type, stored in the low nibble of the first key element
pub enum KeyMinor {
    FileName = 0,
    StatData = 1,
    AttrName = 2,
    AttrBody = 3,
    Body = 4,
}

impl KeyMinor {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::FileName => "file name",
            Self::StatData => "stat data",
            Self::AttrName => "attr name",
            Self::AttrBody => "attr body",
            Self::Body => "file body",
        }
    }
    const fn from_nibble(v: u64) -> Option<Self> {
        Some(match v {
            0 => Self::FileName,
            1 => Self::StatData,
            2 => Self::AttrName,
            3 => Self::AttrBody,
            4 => Self::Body,
            _ => return None,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// The key comparison scheme, fixed per filesystem instance.
pub enum KeyScheme {
    /// physical field order equals logical order (locality+type,
    /// objectid+band, offset), so comparison is three u64 compares
    PlanA = 0,
    /// the 3.5-era order: locality, objectid, type, offset
    V35 = 1,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
/// A composite totally-ordered identifier: three 64-bit words holding
/// locality, type+objectid and offset.
pub struct Key {
    el: [u64; 3],
}

impl Key {
    const MINOR_MASK: u64 = 0xF;
    const BAND_SHIFT: u32 = 60;

    pub const fn zero() -> Self {
        MIN_KEY
    }
    /// Build a key in plan-a packing
    pub fn build(locality: u64, minor: KeyMinor, objectid: u64, offset: u64) -> Self {
        Self {
            el: [
                (locality << 4) | (minor as u64),
                objectid & !(Self::MINOR_MASK << Self::BAND_SHIFT),
                offset,
            ],
        }
    }
    pub const fn el(&self, i: usize) -> u64 {
        self.el[i]
    }
    pub const fn locality(&self) -> u64 {
        self.el[0] >> 4
    }
    pub fn minor(&self) -> Option<KeyMinor> {
        KeyMinor::from_nibble(self.el[0] & Self::MINOR_MASK)
    }
    pub const fn band(&self) -> u64 {
        self.el[1] >> Self::BAND_SHIFT
    }
    pub const fn objectid(&self) -> u64 {
        self.el[1] & !(Self::MINOR_MASK << Self::BAND_SHIFT)
    }
    pub const fn offset(&self) -> u64 {
        self.el[2]
    }
    pub fn set_offset(&mut self, offset: u64) {
        self.el[2] = offset;
    }
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.el[2] = offset;
        self
    }

    /*
        codec
    */

    pub fn encode(&self) -> [u8; KEY_SIZE] {
        let mut buf = [0u8; KEY_SIZE];
        self.encode_into(&mut buf);
        buf
    }
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= KEY_SIZE);
        for (i, el) in self.el.iter().enumerate() {
            buf[i * 8..(i + 1) * 8].copy_from_slice(&el.to_le_bytes());
        }
    }
    pub fn decode(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= KEY_SIZE);
        let mut el = [0u64; 3];
        for (i, w) in el.iter_mut().enumerate() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[i * 8..(i + 1) * 8]);
            *w = u64::from_le_bytes(raw);
        }
        Self { el }
    }
}

impl KeyScheme {
    /// The heart of the key allocation policy. Implementing a new policy
    /// is adding another arm here.
    pub fn keycmp(&self, k1: &Key, k2: &Key) -> Ordering {
        match self {
            Self::PlanA => k1.el.cmp(&k2.el),
            Self::V35 => k1
                .locality()
                .cmp(&k2.locality())
                .then_with(|| k1.objectid().cmp(&k2.objectid()))
                .then_with(|| (k1.el(0) & Key::MINOR_MASK).cmp(&(k2.el(0) & Key::MINOR_MASK)))
                .then_with(|| k1.offset().cmp(&k2.offset())),
        }
    }
    pub fn keylt(&self, k1: &Key, k2: &Key) -> bool {
        self.keycmp(k1, k2) == Ordering::Less
    }
    pub fn keyle(&self, k1: &Key, k2: &Key) -> bool {
        self.keycmp(k1, k2) != Ordering::Greater
    }
    pub fn keygt(&self, k1: &Key, k2: &Key) -> bool {
        self.keycmp(k1, k2) == Ordering::Greater
    }
    pub fn keyge(&self, k1: &Key, k2: &Key) -> bool {
        self.keycmp(k1, k2) != Ordering::Less
    }
}

// plan-a is the compiled default ordering; tree-level comparisons go
// through the instance scheme
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.el.cmp(&other.el)
    }
}
impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:x}:{:x}:{:x}:{:x}:{:x})",
            self.locality(),
            self.el[0] & Self::MINOR_MASK,
            self.band(),
            self.objectid(),
            self.offset()
        )
    }
}
