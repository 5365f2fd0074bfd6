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

//! Reassigns the persisted state of a previous execution to the subtasks of a
//! restarted (and possibly rescaled) job. The input is a checkpoint metadata
//! record and a read-only view of the new topology; the output is one
//! [`TaskStateSnapshot`](state_api::TaskStateSnapshot) per stateful subtask,
//! pushed through a scheduler sink. Everything runs synchronously on the
//! coordinator, and either every subtask is seeded or none is.

pub mod assigner;
pub mod error;
mod keyed;
pub mod metadata;
mod repartition;
pub mod topology;

pub use assigner::StateAssigner;
pub use error::{Error, Result};
pub use metadata::{CheckpointMetadata, OperatorState, OperatorStates};
pub use topology::{
    Diagnostic, DiagnosticKind, JobTopology, SchedulerSink, StaticJobTopology, VertexDesc,
};
