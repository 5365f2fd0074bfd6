// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{InvalidParallelismSnafu, Result};
use crate::ids::SubtaskIndex;

/// Smallest atomic unit of keyed state redistribution. Every key maps to
/// exactly one key group in `[0, max_parallelism)`.
pub type KeyGroupId = u32;

/// Smallest max parallelism derived for an operator when the user leaves it
/// unset.
pub const MIN_DEFAULT_MAX_PARALLELISM: u32 = 1 << 7;

/// Hard upper bound for the max parallelism of any operator.
pub const UPPER_BOUND_MAX_PARALLELISM: u32 = 1 << 15;

/// Closed interval of key group ids, `start..=end`. The empty range is a
/// sentinel that contains nothing and intersects nothing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct KeyGroupRange {
    start: KeyGroupId,
    end: KeyGroupId,
}

impl KeyGroupRange {
    /// The empty range.
    pub const EMPTY: KeyGroupRange = KeyGroupRange { start: 1, end: 0 };

    /// Creates the range `start..=end`. Callers must pass `start <= end`;
    /// use [`KeyGroupRange::EMPTY`] for the empty case.
    pub fn new(start: KeyGroupId, end: KeyGroupId) -> Self {
        debug_assert!(start <= end, "invalid key group range [{start}, {end}]");
        Self { start, end }
    }

    /// First key group of the range (inclusive).
    pub fn start(&self) -> KeyGroupId {
        self.start
    }

    /// Last key group of the range (inclusive).
    pub fn end(&self) -> KeyGroupId {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn num_key_groups(&self) -> u32 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn contains(&self, key_group: KeyGroupId) -> bool {
        self.start <= key_group && key_group <= self.end
    }

    /// Intersection of two ranges, empty when they are disjoint.
    pub fn intersect(&self, other: KeyGroupRange) -> KeyGroupRange {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start > end {
            KeyGroupRange::EMPTY
        } else {
            KeyGroupRange { start, end }
        }
    }

    /// Whether `other` lies entirely inside this range.
    pub fn covers(&self, other: KeyGroupRange) -> bool {
        other.is_empty() || (self.start <= other.start && other.end <= self.end)
    }

    /// Iterates the contained key group ids in ascending order.
    pub fn key_groups(&self) -> impl Iterator<Item = KeyGroupId> {
        self.start..=self.end
    }
}

impl Display for KeyGroupRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "KeyGroupRange(empty)")
        } else {
            write!(f, "KeyGroupRange[{}, {}]", self.start, self.end)
        }
    }
}

/// Computes the key group range owned by one subtask.
///
/// This is the write-time contract: snapshot producers use the same formula to
/// decide which key groups a subtask writes, so the restore side reproduces
/// their ranges bit for bit. Changing it invalidates all stored keyed state.
///
/// Callers must pass `max_parallelism >= parallelism > 0` and
/// `subtask_index < parallelism`.
pub fn range_for_subtask(
    max_parallelism: u32,
    parallelism: u32,
    subtask_index: SubtaskIndex,
) -> KeyGroupRange {
    let max = max_parallelism as u64;
    let index = subtask_index as u64;
    let parallelism = parallelism as u64;
    KeyGroupRange::new(
        (index * max / parallelism) as u32,
        ((index + 1) * max / parallelism - 1) as u32,
    )
}

/// Computes the subtask that owns `key_group`, the dual of
/// [`range_for_subtask`].
pub fn compute_subtask_for_key_group(
    max_parallelism: u32,
    parallelism: u32,
    key_group: KeyGroupId,
) -> SubtaskIndex {
    (key_group as u64 * parallelism as u64 / max_parallelism as u64) as SubtaskIndex
}

/// Splits `[0, max_parallelism)` into one contiguous range per subtask.
///
/// The ranges are gap free, non overlapping and cover all key groups.
pub fn compute_key_group_partitions(
    max_parallelism: u32,
    parallelism: u32,
) -> Result<Vec<KeyGroupRange>> {
    ensure!(
        parallelism > 0 && max_parallelism >= parallelism,
        InvalidParallelismSnafu {
            max_parallelism,
            parallelism,
        }
    );

    Ok((0..parallelism)
        .map(|index| range_for_subtask(max_parallelism, parallelism, index))
        .collect())
}

/// Derives a max parallelism for an operator whose user left it unset: the
/// next power of two of `1.5 * parallelism`, clamped to
/// `[MIN_DEFAULT_MAX_PARALLELISM, UPPER_BOUND_MAX_PARALLELISM]`.
pub fn compute_default_max_parallelism(parallelism: u32) -> u32 {
    (parallelism + parallelism / 2)
        .next_power_of_two()
        .clamp(MIN_DEFAULT_MAX_PARALLELISM, UPPER_BOUND_MAX_PARALLELISM)
}
