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

use serde::{Deserialize, Serialize};
use snafu::ensure;
use state_api::ids::{CheckpointId, OperatorId, SubtaskIndex};
use state_api::snapshot::SubtaskState;

use crate::error::{Result, UnexpectedSnafu};

/// Everything one operator checkpointed: the parallelism the snapshot was
/// taken with, the max parallelism fixed for it, and the state of each of its
/// subtasks. The subtask map is sparse, a subtask that wrote nothing has no
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorState {
    operator_id: OperatorId,
    parallelism: u32,
    max_parallelism: u32,
    subtask_states: BTreeMap<SubtaskIndex, SubtaskState>,
}

impl OperatorState {
    pub fn new(operator_id: OperatorId, parallelism: u32, max_parallelism: u32) -> Self {
        Self {
            operator_id,
            parallelism,
            max_parallelism,
            subtask_states: BTreeMap::new(),
        }
    }

    pub fn operator_id(&self) -> OperatorId {
        self.operator_id
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn max_parallelism(&self) -> u32 {
        self.max_parallelism
    }

    pub fn put_state(&mut self, subtask_index: SubtaskIndex, state: SubtaskState) -> Result<()> {
        ensure!(
            subtask_index < self.parallelism,
            UnexpectedSnafu {
                err_msg: format!(
                    "subtask index {subtask_index} out of bounds for operator {} with \
                     parallelism {}",
                    self.operator_id, self.parallelism
                ),
            }
        );
        self.subtask_states.insert(subtask_index, state);
        Ok(())
    }

    pub fn state(&self, subtask_index: SubtaskIndex) -> Option<&SubtaskState> {
        self.subtask_states.get(&subtask_index)
    }

    /// Recorded subtask states in subtask index order.
    pub fn subtask_states(&self) -> impl Iterator<Item = (SubtaskIndex, &SubtaskState)> {
        self.subtask_states.iter().map(|(index, state)| (*index, state))
    }

    pub fn subtask_count(&self) -> usize {
        self.subtask_states.len()
    }

    pub fn has_state(&self) -> bool {
        self.subtask_states.values().any(SubtaskState::has_state)
    }
}

/// The metadata record of one completed checkpoint, as read back from durable
/// storage by the outer restore tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: CheckpointId,
    pub operator_states: Vec<OperatorState>,
}

/// Index over the prior execution's operator states. Operators are matched by
/// elimination during reassignment, whatever remains unclaimed at the end had
/// no place in the new topology.
#[derive(Debug, Clone, Default)]
pub struct OperatorStates {
    states: BTreeMap<OperatorId, OperatorState>,
}

impl OperatorStates {
    pub fn get(&self, operator_id: &OperatorId) -> Option<&OperatorState> {
        self.states.get(operator_id)
    }

    pub fn contains(&self, operator_id: &OperatorId) -> bool {
        self.states.contains_key(operator_id)
    }

    pub fn remove(&mut self, operator_id: &OperatorId) -> Option<OperatorState> {
        self.states.remove(operator_id)
    }

    pub fn operator_ids(&self) -> impl Iterator<Item = &OperatorId> {
        self.states.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OperatorId, &OperatorState)> {
        self.states.iter()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl From<CheckpointMetadata> for OperatorStates {
    fn from(metadata: CheckpointMetadata) -> Self {
        let states = metadata
            .operator_states
            .into_iter()
            .map(|state| (state.operator_id(), state))
            .collect();
        Self { states }
    }
}
