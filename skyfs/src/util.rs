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

pub type IoResult<T> = std::io::Result<T>;

/// Seconds since the UNIX epoch, truncated to 32 bits. Stamped into node
/// headers at flush time.
pub fn unix_now_secs() -> u32 {
    chrono::Utc::now().timestamp() as u32
}

/// Milliseconds since the UNIX epoch. Used for atom age accounting.
pub fn unix_now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[inline(always)]
pub const fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}
