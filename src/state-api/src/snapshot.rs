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

use crate::handle::{KeyedStateHandle, OperatorStateHandle};
use crate::ids::OperatorId;

/// The four handle collections one operator instance wrote (or is to be
/// seeded with): operator state and keyed state, each in a managed and a raw
/// flavor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskState {
    pub managed_operator: Vec<OperatorStateHandle>,
    pub raw_operator: Vec<OperatorStateHandle>,
    pub managed_keyed: Vec<KeyedStateHandle>,
    pub raw_keyed: Vec<KeyedStateHandle>,
}

impl SubtaskState {
    pub fn has_state(&self) -> bool {
        !self.managed_operator.is_empty()
            || !self.raw_operator.is_empty()
            || !self.managed_keyed.is_empty()
            || !self.raw_keyed.is_empty()
    }

    pub fn has_keyed_state(&self) -> bool {
        !self.managed_keyed.is_empty() || !self.raw_keyed.is_empty()
    }

    /// Raw keyed state may only exist next to managed keyed state.
    pub fn keyed_state_consistent(&self) -> bool {
        !self.managed_keyed.is_empty() || self.raw_keyed.is_empty()
    }
}

/// The state one subtask attempt is seeded with on restore, keyed by the
/// operators of its chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateSnapshot {
    subtask_states: BTreeMap<OperatorId, SubtaskState>,
}

impl TaskStateSnapshot {
    pub fn put_subtask_state(
        &mut self,
        operator_id: OperatorId,
        state: SubtaskState,
    ) -> Option<SubtaskState> {
        self.subtask_states.insert(operator_id, state)
    }

    pub fn subtask_state(&self, operator_id: &OperatorId) -> Option<&SubtaskState> {
        self.subtask_states.get(operator_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OperatorId, &SubtaskState)> {
        self.subtask_states.iter()
    }

    pub fn len(&self) -> usize {
        self.subtask_states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtask_states.is_empty()
    }

    pub fn has_state(&self) -> bool {
        self.subtask_states.values().any(SubtaskState::has_state)
    }
}
