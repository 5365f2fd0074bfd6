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

use snafu::ensure;
use state_api::handle::KeyedStateHandle;
use state_api::ids::SubtaskIndex;
use state_api::key_group::KeyGroupRange;

use crate::error::{IntersectionOutOfRangeSnafu, Result};
use crate::metadata::OperatorState;

/// Computes the keyed state of one new subtask of a chain head.
///
/// When the parallelism did not change the old subtask's handles are reused
/// verbatim, so backend-local artifacts referenced by them stay valid.
/// Otherwise every old handle is intersected with the new subtask's key group
/// range.
pub(crate) fn reassign_subtask_keyed_states(
    operator_state: &OperatorState,
    partitions: &[KeyGroupRange],
    subtask_index: SubtaskIndex,
    new_parallelism: u32,
    old_parallelism: u32,
) -> Result<(Vec<KeyedStateHandle>, Vec<KeyedStateHandle>)> {
    if new_parallelism == old_parallelism {
        return Ok(match operator_state.state(subtask_index) {
            Some(state) => (state.managed_keyed.clone(), state.raw_keyed.clone()),
            None => (Vec::new(), Vec::new()),
        });
    }

    let range = partitions[subtask_index as usize];
    Ok((
        managed_keyed_handles_for_range(operator_state, range)?,
        raw_keyed_handles_for_range(operator_state, range)?,
    ))
}

/// All managed keyed handles of `operator_state` overlapping `range`,
/// restricted to the overlap.
pub(crate) fn managed_keyed_handles_for_range(
    operator_state: &OperatorState,
    range: KeyGroupRange,
) -> Result<Vec<KeyedStateHandle>> {
    let mut extracted = Vec::new();
    for (_, state) in operator_state.subtask_states() {
        extract_intersecting(&state.managed_keyed, range, &mut extracted)?;
    }
    Ok(extracted)
}

/// All raw keyed handles of `operator_state` overlapping `range`, restricted
/// to the overlap.
pub(crate) fn raw_keyed_handles_for_range(
    operator_state: &OperatorState,
    range: KeyGroupRange,
) -> Result<Vec<KeyedStateHandle>> {
    let mut extracted = Vec::new();
    for (_, state) in operator_state.subtask_states() {
        extract_intersecting(&state.raw_keyed, range, &mut extracted)?;
    }
    Ok(extracted)
}

fn extract_intersecting(
    handles: &[KeyedStateHandle],
    range: KeyGroupRange,
    extracted: &mut Vec<KeyedStateHandle>,
) -> Result<()> {
    for handle in handles {
        if let Some(intersected) = handle.intersect(range) {
            let produced = intersected.key_group_range();
            ensure!(
                !produced.is_empty()
                    && range.covers(produced)
                    && handle.key_group_range().covers(produced),
                IntersectionOutOfRangeSnafu {
                    handle_range: handle.key_group_range(),
                    requested: range,
                    produced,
                }
            );
            extracted.push(intersected);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use state_api::handle::{
        KeyGroupRangeOffsets, KeyGroupsStateHandle, StreamStateHandle,
    };
    use state_api::ids::OperatorId;
    use state_api::key_group::compute_key_group_partitions;
    use state_api::snapshot::SubtaskState;

    use super::*;

    fn handle(start: u32, end: u32, location: &str) -> KeyedStateHandle {
        let range = KeyGroupRange::new(start, end);
        let offsets = (0..range.num_key_groups() as u64).collect();
        KeyedStateHandle::KeyGroups(KeyGroupsStateHandle::new(
            KeyGroupRangeOffsets::new(range, offsets).unwrap(),
            Arc::new(StreamStateHandle::new(location, 4096)),
        ))
    }

    /// One keyed operator with `old_parallelism` subtasks, subtask `i`
    /// holding the managed handle `handles[i]`.
    fn operator_state(
        max_parallelism: u32,
        handles: Vec<KeyedStateHandle>,
    ) -> OperatorState {
        let old_parallelism = handles.len() as u32;
        let mut state = OperatorState::new(
            OperatorId::from_bytes([1; 16]),
            old_parallelism,
            max_parallelism,
        );
        for (index, handle) in handles.into_iter().enumerate() {
            state
                .put_state(
                    index as u32,
                    SubtaskState {
                        managed_keyed: vec![handle],
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        state
    }

    #[test]
    fn test_identity_parallelism_reuses_handles() {
        let h0 = handle(0, 1, "chk/sub-0");
        let h1 = handle(2, 3, "chk/sub-1");
        let state = operator_state(4, vec![h0.clone(), h1.clone()]);
        let partitions = compute_key_group_partitions(4, 2).unwrap();

        for (index, expected) in [(0, h0), (1, h1)] {
            let (managed, raw) =
                reassign_subtask_keyed_states(&state, &partitions, index, 2, 2).unwrap();
            assert_eq!(managed, vec![expected]);
            assert!(raw.is_empty());
        }
    }

    #[test]
    fn test_scale_up_splits_handles() {
        let h0 = handle(0, 1, "chk/sub-0");
        let h1 = handle(2, 3, "chk/sub-1");
        let state = operator_state(4, vec![h0.clone(), h1.clone()]);
        let partitions = compute_key_group_partitions(4, 4).unwrap();

        let expectations = [
            (0, h0.intersect(KeyGroupRange::new(0, 0)).unwrap()),
            (1, h0.intersect(KeyGroupRange::new(1, 1)).unwrap()),
            (2, h1.intersect(KeyGroupRange::new(2, 2)).unwrap()),
            (3, h1.intersect(KeyGroupRange::new(3, 3)).unwrap()),
        ];
        for (index, expected) in expectations {
            let (managed, raw) =
                reassign_subtask_keyed_states(&state, &partitions, index, 4, 2).unwrap();
            assert_eq!(managed, vec![expected], "subtask {index}");
            assert!(raw.is_empty());
        }
    }

    #[test]
    fn test_scale_down_merges_handles() {
        let handles = (0..4)
            .map(|group| handle(group, group, &format!("chk/sub-{group}")))
            .collect::<Vec<_>>();
        let state = operator_state(4, handles.clone());
        let partitions = compute_key_group_partitions(4, 2).unwrap();

        let (managed, _) = reassign_subtask_keyed_states(&state, &partitions, 0, 2, 4).unwrap();
        assert_eq!(managed, vec![handles[0].clone(), handles[1].clone()]);

        let (managed, _) = reassign_subtask_keyed_states(&state, &partitions, 1, 2, 4).unwrap();
        assert_eq!(managed, vec![handles[2].clone(), handles[3].clone()]);
    }

    #[test]
    fn test_coverage_and_non_overlap_after_rescale() {
        // 3 old subtasks over 8 key groups, rescaled to 5 subtasks: every key
        // group must end up with exactly one new subtask.
        let max_parallelism = 8;
        let old_partitions = compute_key_group_partitions(max_parallelism, 3).unwrap();
        let handles = old_partitions
            .iter()
            .enumerate()
            .map(|(index, range)| {
                handle(range.start(), range.end(), &format!("chk/sub-{index}"))
            })
            .collect::<Vec<_>>();
        let state = operator_state(max_parallelism, handles);

        let new_partitions = compute_key_group_partitions(max_parallelism, 5).unwrap();
        let mut owners = vec![0usize; max_parallelism as usize];
        for index in 0..5 {
            let (managed, _) =
                reassign_subtask_keyed_states(&state, &new_partitions, index, 5, 3).unwrap();
            for assigned in &managed {
                for group in assigned.key_group_range().key_groups() {
                    assert!(
                        new_partitions[index as usize].contains(group),
                        "subtask {index} received foreign key group {group}"
                    );
                    owners[group as usize] += 1;
                }
            }
        }
        assert_eq!(owners, vec![1; max_parallelism as usize]);
    }

    #[test]
    fn test_sparse_old_subtasks() {
        let mut state = OperatorState::new(OperatorId::from_bytes([1; 16]), 2, 4);
        state
            .put_state(
                1,
                SubtaskState {
                    managed_keyed: vec![handle(2, 3, "chk/sub-1")],
                    ..Default::default()
                },
            )
            .unwrap();
        let partitions = compute_key_group_partitions(4, 2).unwrap();

        // identity path: the subtask that wrote nothing gets nothing
        let (managed, raw) = reassign_subtask_keyed_states(&state, &partitions, 0, 2, 2).unwrap();
        assert!(managed.is_empty());
        assert!(raw.is_empty());

        // rescale path: only the recorded subtask contributes
        let partitions = compute_key_group_partitions(4, 4).unwrap();
        let (managed, _) = reassign_subtask_keyed_states(&state, &partitions, 3, 4, 2).unwrap();
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].key_group_range(), KeyGroupRange::new(3, 3));
    }
}
