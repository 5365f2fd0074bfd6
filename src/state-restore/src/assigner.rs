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

use std::collections::{BTreeMap, BTreeSet};

use snafu::{ensure, ResultExt};
use state_api::handle::{KeyedStateHandle, OperatorStateHandle};
use state_api::ids::{OperatorId, OperatorInstanceId, SubtaskIndex, VertexId};
use state_api::key_group::compute_key_group_partitions;
use state_api::snapshot::{SubtaskState, TaskStateSnapshot};
use tracing::{debug, info};

use crate::error::{
    ChainLengthMismatchSnafu, InvalidParallelismSnafu, KeyedStateOnNonHeadOperatorSnafu,
    MaxParallelismMismatchSnafu, MaxParallelismTooLowSnafu, Result, UnexpectedSnafu,
    UnmappedStateSnafu,
};
use crate::keyed;
use crate::metadata::{CheckpointMetadata, OperatorState, OperatorStates};
use crate::repartition;
use crate::topology::{Diagnostic, DiagnosticKind, JobTopology, SchedulerSink};

/// Assigns the state recorded in a checkpoint to the subtasks of the new
/// execution.
///
/// The whole operation is synchronous and all or nothing: the scheduler sink
/// only sees submissions once every vertex of the job was assigned
/// successfully, any error discards everything computed so far.
pub struct StateAssigner {
    allow_non_restored_state: bool,
}

impl StateAssigner {
    pub fn new(allow_non_restored_state: bool) -> Self {
        Self {
            allow_non_restored_state,
        }
    }

    /// Assigns the checkpointed state to every subtask of the new topology.
    pub fn assign_states<T, S>(
        &self,
        metadata: CheckpointMetadata,
        topology: &mut T,
        sink: &mut S,
    ) -> Result<Vec<Diagnostic>>
    where
        T: JobTopology,
        S: SchedulerSink,
    {
        self.assign(metadata, topology, sink, None)
    }

    /// Assigns state to a subset of subtasks only, e.g. when single attempts
    /// are restarted. Vertices missing from `subtasks_by_vertex` are skipped
    /// entirely; the completeness and parallelism checks still cover the
    /// whole job.
    pub fn assign_states_for<T, S>(
        &self,
        metadata: CheckpointMetadata,
        topology: &mut T,
        sink: &mut S,
        subtasks_by_vertex: &BTreeMap<VertexId, BTreeSet<SubtaskIndex>>,
    ) -> Result<Vec<Diagnostic>>
    where
        T: JobTopology,
        S: SchedulerSink,
    {
        self.assign(metadata, topology, sink, Some(subtasks_by_vertex))
    }

    fn assign<T, S>(
        &self,
        metadata: CheckpointMetadata,
        topology: &mut T,
        sink: &mut S,
        filter: Option<&BTreeMap<VertexId, BTreeSet<SubtaskIndex>>>,
    ) -> Result<Vec<Diagnostic>>
    where
        T: JobTopology,
        S: SchedulerSink,
    {
        let restore_checkpoint_id = metadata.checkpoint_id;
        let mut operator_states = OperatorStates::from(metadata);
        let mut diagnostics = Vec::new();

        self.check_state_mapping_completeness(&operator_states, topology, &mut diagnostics)?;

        let mut submissions = Vec::new();
        for vertex_id in topology.vertices() {
            // consume the vertex's states even when the filter skips it, so
            // the matching by elimination stays intact
            let Some(chain) = collect_chain_states(&mut operator_states, topology, vertex_id)?
            else {
                continue;
            };

            let allowed_subtasks = match filter {
                Some(subtasks_by_vertex) => match subtasks_by_vertex.get(&vertex_id) {
                    Some(subtasks) => Some(subtasks),
                    None => continue,
                },
                None => None,
            };

            assign_vertex_state(
                vertex_id,
                chain,
                topology,
                allowed_subtasks,
                &mut diagnostics,
                &mut submissions,
            )?;
        }

        debug!(
            "Assigned state of checkpoint {restore_checkpoint_id} to {} subtasks",
            submissions.len()
        );
        for (vertex_id, subtask_index, snapshot) in submissions {
            sink.set_initial_state(vertex_id, subtask_index, snapshot, restore_checkpoint_id);
        }
        Ok(diagnostics)
    }

    /// Every checkpointed operator must have a place in the new topology,
    /// after compatibility id substitution. Leftovers are fatal unless the
    /// caller opted into dropping them.
    fn check_state_mapping_completeness<T: JobTopology>(
        &self,
        operator_states: &OperatorStates,
        topology: &T,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let mut known_ids = BTreeSet::new();
        for vertex_id in topology.vertices() {
            let primary = topology.operator_ids(vertex_id);
            let alt = topology.alt_operator_ids(vertex_id);
            ensure!(
                alt.len() == primary.len(),
                ChainLengthMismatchSnafu {
                    vertex_id,
                    expected: primary.len(),
                    actual: alt.len(),
                }
            );
            for (position, operator_id) in primary.iter().enumerate() {
                known_ids.insert(alt[position].unwrap_or(*operator_id));
            }
        }

        for (operator_id, operator_state) in operator_states.iter() {
            if known_ids.contains(operator_id) {
                continue;
            }
            ensure!(
                self.allow_non_restored_state,
                UnmappedStateSnafu {
                    operator_id: *operator_id,
                }
            );
            info!("Skipped checkpoint state for operator {operator_id}.");
            diagnostics.push(Diagnostic {
                operator_id: Some(*operator_id),
                kind: DiagnosticKind::SkippedNonRestoredState,
                message: format!(
                    "dropped state of operator {operator_id} with {} recorded subtasks",
                    operator_state.subtask_count()
                ),
            });
        }
        Ok(())
    }
}

/// One position of a vertex's operator chain: the prior state matched to it,
/// or an empty placeholder when the checkpoint recorded nothing for it.
struct ChainPosition {
    state: OperatorState,
    restored: bool,
}

/// Collects the prior states of a vertex's chain in chain order, `None` when
/// no position had recorded state. Matched states are removed from the index.
fn collect_chain_states<T: JobTopology>(
    operator_states: &mut OperatorStates,
    topology: &T,
    vertex_id: VertexId,
) -> Result<Option<Vec<ChainPosition>>> {
    let primary = topology.operator_ids(vertex_id).to_vec();
    let alt = topology.alt_operator_ids(vertex_id).to_vec();

    let mut chain = Vec::with_capacity(primary.len());
    let mut stateless = true;
    for (position, operator_id) in primary.iter().enumerate() {
        let lookup_id = alt[position].unwrap_or(*operator_id);
        let chain_position = match operator_states.remove(&lookup_id) {
            Some(state) => {
                stateless = false;
                ChainPosition {
                    state,
                    restored: true,
                }
            }
            None => ChainPosition {
                state: OperatorState::new(
                    lookup_id,
                    topology.parallelism(vertex_id),
                    topology.max_parallelism(vertex_id),
                ),
                restored: false,
            },
        };
        chain.push(chain_position);
    }

    Ok(if stateless { None } else { Some(chain) })
}

/// Enforces the parallelism preconditions of every restored chain position,
/// overriding a derived max parallelism where the checkpoint disagrees.
fn check_parallelism_preconditions<T: JobTopology>(
    chain: &[ChainPosition],
    topology: &mut T,
    vertex_id: VertexId,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<()> {
    for position in chain {
        if !position.restored {
            continue;
        }
        let operator_state = &position.state;

        ensure!(
            operator_state.max_parallelism() >= topology.parallelism(vertex_id),
            MaxParallelismTooLowSnafu {
                vertex_id,
                max_parallelism: operator_state.max_parallelism(),
                parallelism: topology.parallelism(vertex_id),
            }
        );

        if operator_state.max_parallelism() != topology.max_parallelism(vertex_id) {
            ensure!(
                !topology.is_max_parallelism_configured(vertex_id),
                MaxParallelismMismatchSnafu {
                    vertex_id,
                    restored: operator_state.max_parallelism(),
                    configured: topology.max_parallelism(vertex_id),
                }
            );

            // the max parallelism was derived, not fixed by the user: adopt
            // the restored one so the key group spaces line up
            debug!(
                "Overriding max parallelism for vertex {vertex_id} from {} to {}",
                topology.max_parallelism(vertex_id),
                operator_state.max_parallelism()
            );
            diagnostics.push(Diagnostic {
                operator_id: Some(operator_state.operator_id()),
                kind: DiagnosticKind::MaxParallelismOverridden,
                message: format!(
                    "max parallelism of vertex {vertex_id} overridden from {} to {}",
                    topology.max_parallelism(vertex_id),
                    operator_state.max_parallelism()
                ),
            });
            topology.set_max_parallelism(vertex_id, operator_state.max_parallelism());
        }
    }
    Ok(())
}

fn assign_vertex_state<T: JobTopology>(
    vertex_id: VertexId,
    chain: Vec<ChainPosition>,
    topology: &mut T,
    allowed_subtasks: Option<&BTreeSet<SubtaskIndex>>,
    diagnostics: &mut Vec<Diagnostic>,
    submissions: &mut Vec<(VertexId, SubtaskIndex, TaskStateSnapshot)>,
) -> Result<()> {
    let operator_ids = topology.operator_ids(vertex_id).to_vec();
    ensure!(
        chain.len() == operator_ids.len(),
        ChainLengthMismatchSnafu {
            vertex_id,
            expected: operator_ids.len(),
            actual: chain.len(),
        }
    );

    check_parallelism_preconditions(&chain, topology, vertex_id, diagnostics)?;

    let new_parallelism = topology.parallelism(vertex_id);
    let key_group_partitions =
        compute_key_group_partitions(topology.max_parallelism(vertex_id), new_parallelism)
            .context(InvalidParallelismSnafu { vertex_id })?;

    // operator (non keyed) state of every chain position
    let mut managed_operator: BTreeMap<OperatorInstanceId, Vec<OperatorStateHandle>> =
        BTreeMap::new();
    let mut raw_operator: BTreeMap<OperatorInstanceId, Vec<OperatorStateHandle>> = BTreeMap::new();
    for (position, chain_position) in chain.iter().enumerate() {
        redistribute_operator_state(
            &chain_position.state,
            operator_ids[position],
            new_parallelism,
            &mut managed_operator,
            &mut raw_operator,
        )?;
    }

    // keyed state, carried by the chain head alone
    let mut managed_keyed: BTreeMap<OperatorInstanceId, Vec<KeyedStateHandle>> = BTreeMap::new();
    let mut raw_keyed: BTreeMap<OperatorInstanceId, Vec<KeyedStateHandle>> = BTreeMap::new();
    let head_position = chain.len() - 1;
    for (position, chain_position) in chain.iter().enumerate() {
        if position != head_position {
            ensure!(
                chain_position
                    .state
                    .subtask_states()
                    .all(|(_, state)| !state.has_keyed_state()),
                KeyedStateOnNonHeadOperatorSnafu {
                    operator_id: chain_position.state.operator_id(),
                }
            );
            continue;
        }

        let old_parallelism = chain_position.state.parallelism();
        for subtask_index in 0..new_parallelism {
            let (managed, raw) = keyed::reassign_subtask_keyed_states(
                &chain_position.state,
                &key_group_partitions,
                subtask_index,
                new_parallelism,
                old_parallelism,
            )?;
            let instance_id = OperatorInstanceId::of(subtask_index, operator_ids[position]);
            managed_keyed.insert(instance_id, managed);
            raw_keyed.insert(instance_id, raw);
        }
    }

    // compose one snapshot per subtask; the snapshot is keyed by the new
    // (primary) operator ids
    for subtask_index in 0..new_parallelism {
        if allowed_subtasks.is_some_and(|subtasks| !subtasks.contains(&subtask_index)) {
            continue;
        }

        let mut snapshot = TaskStateSnapshot::default();
        for operator_id in &operator_ids {
            let instance_id = OperatorInstanceId::of(subtask_index, *operator_id);
            let state = SubtaskState {
                managed_operator: managed_operator.remove(&instance_id).unwrap_or_default(),
                raw_operator: raw_operator.remove(&instance_id).unwrap_or_default(),
                managed_keyed: managed_keyed.remove(&instance_id).unwrap_or_default(),
                raw_keyed: raw_keyed.remove(&instance_id).unwrap_or_default(),
            };
            ensure!(
                state.keyed_state_consistent(),
                UnexpectedSnafu {
                    err_msg: format!(
                        "raw keyed state without managed keyed state for instance {instance_id}"
                    ),
                }
            );
            snapshot.put_subtask_state(*operator_id, state);
        }

        if snapshot.has_state() {
            submissions.push((vertex_id, subtask_index, snapshot));
        }
    }
    Ok(())
}

/// Repartitions the managed and raw operator state of one chain position and
/// records the per-instance handle lists.
fn redistribute_operator_state(
    operator_state: &OperatorState,
    operator_id: OperatorId,
    new_parallelism: u32,
    managed: &mut BTreeMap<OperatorInstanceId, Vec<OperatorStateHandle>>,
    raw: &mut BTreeMap<OperatorInstanceId, Vec<OperatorStateHandle>>,
) -> Result<()> {
    let old_parallelism = operator_state.parallelism() as usize;
    let mut managed_per_subtask = vec![Vec::new(); old_parallelism];
    let mut raw_per_subtask = vec![Vec::new(); old_parallelism];
    for (index, state) in operator_state.subtask_states() {
        managed_per_subtask[index as usize] = state.managed_operator.clone();
        raw_per_subtask[index as usize] = state.raw_operator.clone();
    }

    let redistributed = repartition::apply_repartitioner(&managed_per_subtask, new_parallelism)?;
    for (subtask_index, handles) in redistributed.into_iter().enumerate() {
        if !handles.is_empty() {
            managed.insert(
                OperatorInstanceId::of(subtask_index as SubtaskIndex, operator_id),
                handles,
            );
        }
    }
    let redistributed = repartition::apply_repartitioner(&raw_per_subtask, new_parallelism)?;
    for (subtask_index, handles) in redistributed.into_iter().enumerate() {
        if !handles.is_empty() {
            raw.insert(
                OperatorInstanceId::of(subtask_index as SubtaskIndex, operator_id),
                handles,
            );
        }
    }
    Ok(())
}
