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

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::ensure;
use strum::Display;
use uuid::Uuid;

use crate::error::{MismatchedOffsetsSnafu, Result};
use crate::ids::CheckpointId;
use crate::key_group::{KeyGroupId, KeyGroupRange};

/// Descriptor of one blob of persisted state bytes in durable storage. The
/// restore path never dereferences it, only forwards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStateHandle {
    pub location: String,
    pub size: u64,
}

impl StreamStateHandle {
    pub fn new(location: impl Into<String>, size: u64) -> Self {
        Self {
            location: location.into(),
            size,
        }
    }
}

/// A key group range plus one byte offset per contained key group, pointing
/// into the stream a subtask wrote at checkpoint time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGroupRangeOffsets {
    range: KeyGroupRange,
    offsets: Vec<u64>,
}

impl KeyGroupRangeOffsets {
    pub fn new(range: KeyGroupRange, offsets: Vec<u64>) -> Result<Self> {
        ensure!(
            offsets.len() == range.num_key_groups() as usize,
            MismatchedOffsetsSnafu {
                expected: range.num_key_groups() as usize,
                actual: offsets.len(),
            }
        );
        Ok(Self { range, offsets })
    }

    pub fn range(&self) -> KeyGroupRange {
        self.range
    }

    pub fn offset_for(&self, key_group: KeyGroupId) -> Option<u64> {
        if !self.range.contains(key_group) {
            return None;
        }
        Some(self.offsets[(key_group - self.range.start()) as usize])
    }

    /// Narrows range and offsets to the intersection with `range`, `None`
    /// when disjoint.
    pub fn intersect(&self, range: KeyGroupRange) -> Option<KeyGroupRangeOffsets> {
        let intersection = self.range.intersect(range);
        if intersection.is_empty() {
            return None;
        }
        let skip = (intersection.start() - self.range.start()) as usize;
        let offsets = self.offsets[skip..skip + intersection.num_key_groups() as usize].to_vec();
        Some(Self {
            range: intersection,
            offsets,
        })
    }
}

/// Keyed state written as one stream with per key group offsets. Splittable:
/// intersecting keeps the delegate and narrows the offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGroupsStateHandle {
    range_offsets: KeyGroupRangeOffsets,
    delegate: Arc<StreamStateHandle>,
}

impl KeyGroupsStateHandle {
    pub fn new(range_offsets: KeyGroupRangeOffsets, delegate: Arc<StreamStateHandle>) -> Self {
        Self {
            range_offsets,
            delegate,
        }
    }

    pub fn range_offsets(&self) -> &KeyGroupRangeOffsets {
        &self.range_offsets
    }

    pub fn delegate(&self) -> &Arc<StreamStateHandle> {
        &self.delegate
    }

    pub fn key_group_range(&self) -> KeyGroupRange {
        self.range_offsets.range()
    }

    pub fn intersect(&self, range: KeyGroupRange) -> Option<KeyGroupsStateHandle> {
        self.range_offsets
            .intersect(range)
            .map(|range_offsets| Self {
                range_offsets,
                delegate: self.delegate.clone(),
            })
    }
}

/// Keyed state captured as a base plus deltas by an incremental backend. The
/// payload cannot be split; intersecting narrows only the advertised range
/// and the backend prunes on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalStateHandle {
    backend_id: Uuid,
    checkpoint_id: CheckpointId,
    range: KeyGroupRange,
    delegate: Arc<StreamStateHandle>,
}

impl IncrementalStateHandle {
    pub fn new(
        backend_id: Uuid,
        checkpoint_id: CheckpointId,
        range: KeyGroupRange,
        delegate: Arc<StreamStateHandle>,
    ) -> Self {
        Self {
            backend_id,
            checkpoint_id,
            range,
            delegate,
        }
    }

    pub fn key_group_range(&self) -> KeyGroupRange {
        self.range
    }

    pub fn intersect(&self, range: KeyGroupRange) -> Option<IncrementalStateHandle> {
        let intersection = self.range.intersect(range);
        if intersection.is_empty() {
            return None;
        }
        Some(Self {
            range: intersection,
            ..self.clone()
        })
    }
}

/// Descriptor of keyed state written by one subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyedStateHandle {
    KeyGroups(KeyGroupsStateHandle),
    Incremental(IncrementalStateHandle),
}

impl KeyedStateHandle {
    /// Total key group range this handle covers.
    pub fn key_group_range(&self) -> KeyGroupRange {
        match self {
            KeyedStateHandle::KeyGroups(handle) => handle.key_group_range(),
            KeyedStateHandle::Incremental(handle) => handle.key_group_range(),
        }
    }

    /// A handle restricted to the intersection with `range`, `None` when
    /// disjoint. Intersecting a handle with its own range yields an equal
    /// handle.
    pub fn intersect(&self, range: KeyGroupRange) -> Option<KeyedStateHandle> {
        match self {
            KeyedStateHandle::KeyGroups(handle) => {
                handle.intersect(range).map(KeyedStateHandle::KeyGroups)
            }
            KeyedStateHandle::Incremental(handle) => {
                handle.intersect(range).map(KeyedStateHandle::Incremental)
            }
        }
    }
}

/// How the sub partitions of one operator state stream are spread over
/// subtasks on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributionMode {
    /// Sub partitions are dealt round robin over the new subtasks.
    SplitDistribute,
    /// Every new subtask receives all sub partitions of all old subtasks.
    Union,
    /// Every new subtask receives the copy one old subtask held.
    Broadcast,
}

/// Placement of one named state stream inside an operator state handle:
/// `offsets` point at the starts of its sub partitions in the delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMeta {
    pub distribution_mode: DistributionMode,
    pub offsets: Vec<u64>,
}

impl StateMeta {
    pub fn new(distribution_mode: DistributionMode, offsets: Vec<u64>) -> Self {
        Self {
            distribution_mode,
            offsets,
        }
    }
}

/// Descriptor of the operator (non keyed) state one subtask wrote: a single
/// stream carrying named sub partitioned states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStateHandle {
    delegate: Arc<StreamStateHandle>,
    state_meta: BTreeMap<String, StateMeta>,
}

impl OperatorStateHandle {
    pub fn new(delegate: Arc<StreamStateHandle>, state_meta: BTreeMap<String, StateMeta>) -> Self {
        Self {
            delegate,
            state_meta,
        }
    }

    pub fn delegate(&self) -> &Arc<StreamStateHandle> {
        &self.delegate
    }

    pub fn state_meta(&self) -> &BTreeMap<String, StateMeta> {
        &self.state_meta
    }

    /// Iterates `(stream name, distribution mode, sub partition offsets)` in
    /// stream name order.
    pub fn streams(&self) -> impl Iterator<Item = (&str, DistributionMode, &[u64])> {
        self.state_meta.iter().map(|(name, meta)| {
            (
                name.as_str(),
                meta.distribution_mode,
                meta.offsets.as_slice(),
            )
        })
    }

    pub fn contains_mode(&self, mode: DistributionMode) -> bool {
        self.state_meta
            .values()
            .any(|meta| meta.distribution_mode == mode)
    }
}
