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

//! Value types and handle contracts shared between snapshot producers and the
//! checkpoint restore path. Snapshot producers describe persisted state with
//! the handle types defined here; the restore side only ever compares,
//! intersects and regroups those descriptors, it never touches payload bytes.

pub mod error;
pub mod handle;
pub mod ids;
pub mod key_group;
pub mod snapshot;

pub use error::{Error, Result};
pub use handle::{
    DistributionMode, IncrementalStateHandle, KeyGroupRangeOffsets, KeyGroupsStateHandle,
    KeyedStateHandle, OperatorStateHandle, StateMeta, StreamStateHandle,
};
pub use ids::{CheckpointId, OperatorId, OperatorInstanceId, SubtaskIndex, VertexId};
pub use key_group::{KeyGroupId, KeyGroupRange};
pub use snapshot::{SubtaskState, TaskStateSnapshot};
