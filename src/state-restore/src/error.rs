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

use snafu::{Location, Snafu};
use state_api::ids::{OperatorId, VertexId};
use state_api::key_group::KeyGroupRange;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to compute key group partitions for vertex {vertex_id}"))]
    InvalidParallelism {
        vertex_id: VertexId,
        source: state_api::error::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Restored max parallelism {max_parallelism} of vertex {vertex_id} is lower than \
         the configured parallelism {parallelism}"
    ))]
    MaxParallelismTooLow {
        vertex_id: VertexId,
        max_parallelism: u32,
        parallelism: u32,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Checkpoint of vertex {vertex_id} was taken with max parallelism {restored}, but \
         the user fixed it to {configured}"
    ))]
    MaxParallelismMismatch {
        vertex_id: VertexId,
        restored: u32,
        configured: u32,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("No operator in the new topology for the state of operator {operator_id}"))]
    UnmappedState {
        operator_id: OperatorId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Operator {operator_id} carries keyed state but is not the head of its chain"
    ))]
    KeyedStateOnNonHeadOperator {
        operator_id: OperatorId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Expect an operator chain of length {expected} for vertex {vertex_id}, actual {actual}"
    ))]
    ChainLengthMismatch {
        vertex_id: VertexId,
        expected: usize,
        actual: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Intersecting a handle covering {handle_range} with {requested} produced {produced}"
    ))]
    IntersectionOutOfRange {
        handle_range: KeyGroupRange,
        requested: KeyGroupRange,
        produced: KeyGroupRange,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Unexpected: {err_msg}"))]
    Unexpected {
        err_msg: String,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
