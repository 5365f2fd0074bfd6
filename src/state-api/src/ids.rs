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
use uuid::Uuid;

/// Index of one parallel subtask of a vertex, in `[0, parallelism)`.
pub type SubtaskIndex = u32;

/// Id of the checkpoint a restore reads from.
pub type CheckpointId = u64;

/// Stable 128-bit identifier of a single operator. The id survives job
/// restarts and rescaling, it is the key under which checkpointed state is
/// recorded and looked up again.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OperatorId(Uuid);

impl OperatorId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Display for OperatorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Stable 128-bit identifier of a task vertex (one chain of operators).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct VertexId(Uuid);

impl VertexId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Display for VertexId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Addresses one parallel instance of one operator. The `Ord` impl orders by
/// subtask index first so instance-keyed maps iterate subtask by subtask,
/// which keeps every derived mapping reproducible across processes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OperatorInstanceId {
    pub subtask_index: SubtaskIndex,
    pub operator_id: OperatorId,
}

impl OperatorInstanceId {
    pub fn of(subtask_index: SubtaskIndex, operator_id: OperatorId) -> Self {
        Self {
            subtask_index,
            operator_id,
        }
    }
}

impl Display for OperatorInstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.operator_id, self.subtask_index)
    }
}
