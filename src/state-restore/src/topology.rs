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

use snafu::ensure;
use state_api::ids::{CheckpointId, OperatorId, SubtaskIndex, VertexId};
use state_api::snapshot::TaskStateSnapshot;
use strum::Display;

use crate::error::{ChainLengthMismatchSnafu, Result};

/// Read-only view of the new execution the state is assigned to. One vertex
/// is one chain of operators running with some parallelism; the chain's head
/// sits at the last index.
///
/// All vertex ids passed to the per-vertex methods must come from
/// [`JobTopology::vertices`].
pub trait JobTopology {
    /// Vertex ids in a stable order; assignment results are emitted in this
    /// order.
    fn vertices(&self) -> Vec<VertexId>;

    /// The operator chain of a vertex.
    fn operator_ids(&self, vertex_id: VertexId) -> &[OperatorId];

    /// Compatibility ids, one entry per chain position. A `Some` entry
    /// replaces the primary id when restored state is looked up, so state
    /// written by a renamed operator still finds its new position.
    fn alt_operator_ids(&self, vertex_id: VertexId) -> &[Option<OperatorId>];

    fn parallelism(&self, vertex_id: VertexId) -> u32;

    fn max_parallelism(&self, vertex_id: VertexId) -> u32;

    /// Whether the max parallelism was fixed by the user at submission time,
    /// as opposed to derived from the parallelism.
    fn is_max_parallelism_configured(&self, vertex_id: VertexId) -> bool;

    /// Overrides a derived max parallelism with the restored one. Only called
    /// during reassignment, before any scheduler reads the vertex.
    fn set_max_parallelism(&mut self, vertex_id: VertexId, max_parallelism: u32);
}

/// Receives the per-subtask snapshots once the whole assignment succeeded.
/// Submissions arrive in `(vertex, subtask index)` ascending order.
pub trait SchedulerSink {
    fn set_initial_state(
        &mut self,
        vertex_id: VertexId,
        subtask_index: SubtaskIndex,
        snapshot: TaskStateSnapshot,
        restore_checkpoint_id: CheckpointId,
    );
}

/// Description of one vertex of the new topology.
#[derive(Debug, Clone)]
pub struct VertexDesc {
    pub vertex_id: VertexId,
    /// Chain in execution order, head operator last.
    pub operator_ids: Vec<OperatorId>,
    /// Same length as `operator_ids`; `None` where no compatibility id is
    /// set.
    pub alt_operator_ids: Vec<Option<OperatorId>>,
    pub parallelism: u32,
    pub max_parallelism: u32,
    pub max_parallelism_configured: bool,
}

impl VertexDesc {
    /// A vertex without compatibility ids.
    pub fn new(
        vertex_id: VertexId,
        operator_ids: Vec<OperatorId>,
        parallelism: u32,
        max_parallelism: u32,
    ) -> Self {
        let alt_operator_ids = vec![None; operator_ids.len()];
        Self {
            vertex_id,
            operator_ids,
            alt_operator_ids,
            parallelism,
            max_parallelism,
            max_parallelism_configured: false,
        }
    }
}

/// In-memory [`JobTopology`] built from vertex descriptions; vertex order is
/// insertion order.
#[derive(Debug, Default)]
pub struct StaticJobTopology {
    order: Vec<VertexId>,
    vertices: BTreeMap<VertexId, VertexDesc>,
}

impl StaticJobTopology {
    pub fn new(descs: Vec<VertexDesc>) -> Result<Self> {
        let mut order = Vec::with_capacity(descs.len());
        let mut vertices = BTreeMap::new();
        for desc in descs {
            ensure!(
                desc.alt_operator_ids.len() == desc.operator_ids.len(),
                ChainLengthMismatchSnafu {
                    vertex_id: desc.vertex_id,
                    expected: desc.operator_ids.len(),
                    actual: desc.alt_operator_ids.len(),
                }
            );
            order.push(desc.vertex_id);
            vertices.insert(desc.vertex_id, desc);
        }
        Ok(Self { order, vertices })
    }
}

impl JobTopology for StaticJobTopology {
    fn vertices(&self) -> Vec<VertexId> {
        self.order.clone()
    }

    fn operator_ids(&self, vertex_id: VertexId) -> &[OperatorId] {
        &self.vertices[&vertex_id].operator_ids
    }

    fn alt_operator_ids(&self, vertex_id: VertexId) -> &[Option<OperatorId>] {
        &self.vertices[&vertex_id].alt_operator_ids
    }

    fn parallelism(&self, vertex_id: VertexId) -> u32 {
        self.vertices[&vertex_id].parallelism
    }

    fn max_parallelism(&self, vertex_id: VertexId) -> u32 {
        self.vertices[&vertex_id].max_parallelism
    }

    fn is_max_parallelism_configured(&self, vertex_id: VertexId) -> bool {
        self.vertices[&vertex_id].max_parallelism_configured
    }

    fn set_max_parallelism(&mut self, vertex_id: VertexId, max_parallelism: u32) {
        let desc = self
            .vertices
            .get_mut(&vertex_id)
            .expect("vertex id not part of this topology");
        desc.max_parallelism = max_parallelism;
    }
}

/// What kind of non-fatal observation the reassignment recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DiagnosticKind {
    /// A derived max parallelism was replaced by the restored one.
    MaxParallelismOverridden,
    /// State without an operator in the new topology was dropped on request.
    SkippedNonRestoredState,
}

/// A non-fatal observation surfaced next to the assignment result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub operator_id: Option<OperatorId>,
    pub kind: DiagnosticKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_order_is_insertion_order() {
        let v1 = VertexId::from_bytes([9; 16]);
        let v2 = VertexId::from_bytes([1; 16]);
        let topology = StaticJobTopology::new(vec![
            VertexDesc::new(v1, vec![OperatorId::from_bytes([1; 16])], 1, 4),
            VertexDesc::new(v2, vec![OperatorId::from_bytes([2; 16])], 1, 4),
        ])
        .unwrap();

        assert_eq!(topology.vertices(), vec![v1, v2]);
    }

    #[test]
    fn test_rejects_mismatched_alt_ids() {
        let desc = VertexDesc {
            alt_operator_ids: vec![],
            ..VertexDesc::new(
                VertexId::from_bytes([3; 16]),
                vec![OperatorId::from_bytes([1; 16])],
                1,
                4,
            )
        };
        assert!(StaticJobTopology::new(vec![desc]).is_err());
    }

    #[test]
    fn test_set_max_parallelism() {
        let vertex_id = VertexId::from_bytes([5; 16]);
        let mut topology = StaticJobTopology::new(vec![VertexDesc::new(
            vertex_id,
            vec![OperatorId::from_bytes([1; 16])],
            2,
            4,
        )])
        .unwrap();

        assert!(!topology.is_max_parallelism_configured(vertex_id));
        topology.set_max_parallelism(vertex_id, 16);
        assert_eq!(topology.max_parallelism(vertex_id), 16);
    }
}
