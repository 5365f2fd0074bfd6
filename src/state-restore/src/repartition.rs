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
use state_api::handle::{DistributionMode, OperatorStateHandle, StateMeta};

use crate::error::{Result, UnexpectedSnafu};

/// Redistributes the operator state of one chain position from the old
/// parallelism (`per_old_subtask.len()`) to `new_parallelism`.
///
/// When the parallelism is unchanged and no stream needs union fan-out, every
/// old subtask's handles are forwarded untouched. Otherwise the handles are
/// taken apart into their named sub partitions and dealt out again per
/// distribution mode.
pub(crate) fn apply_repartitioner(
    per_old_subtask: &[Vec<OperatorStateHandle>],
    new_parallelism: u32,
) -> Result<Vec<Vec<OperatorStateHandle>>> {
    let old_parallelism = per_old_subtask.len() as u32;
    if old_parallelism == new_parallelism && !contains_union_stream(per_old_subtask) {
        return Ok(per_old_subtask.to_vec());
    }
    repartition(per_old_subtask, new_parallelism)
}

fn contains_union_stream(per_old_subtask: &[Vec<OperatorStateHandle>]) -> bool {
    per_old_subtask
        .iter()
        .flatten()
        .any(|handle| handle.contains_mode(DistributionMode::Union))
}

/// The sub partitions of one state stream name and the mode they are dealt
/// out with. Entries keep the global write order: old subtask ascending, then
/// handle order within a subtask, then offset order.
struct StreamInfo<'a> {
    mode: DistributionMode,
    /// `(source handle index, sub partition offsets)` per writing handle.
    entries: Vec<(usize, &'a [u64])>,
}

fn repartition(
    per_old_subtask: &[Vec<OperatorStateHandle>],
    new_parallelism: u32,
) -> Result<Vec<Vec<OperatorStateHandle>>> {
    // source handles in global order, each remembering its old subtask
    let sources = per_old_subtask
        .iter()
        .enumerate()
        .flat_map(|(old_index, handles)| {
            handles.iter().map(move |handle| (old_index as u32, handle))
        })
        .collect::<Vec<_>>();

    let mut streams: BTreeMap<&str, StreamInfo> = BTreeMap::new();
    for (source_index, (_, handle)) in sources.iter().enumerate() {
        for (name, mode, offsets) in handle.streams() {
            let info = streams.entry(name).or_insert_with(|| StreamInfo {
                mode,
                entries: Vec::new(),
            });
            ensure!(
                info.mode == mode,
                UnexpectedSnafu {
                    err_msg: format!(
                        "state stream {name} written with conflicting distribution \
                         modes {} and {mode}",
                        info.mode
                    ),
                }
            );
            info.entries.push((source_index, offsets));
        }
    }

    // per new subtask: the stream subsets assigned to it, grouped by the
    // source handle they came from so each source yields at most one output
    // handle per subtask
    let mut assigned: Vec<BTreeMap<usize, BTreeMap<String, StateMeta>>> =
        vec![BTreeMap::new(); new_parallelism as usize];

    fn push(
        assigned: &mut [BTreeMap<usize, BTreeMap<String, StateMeta>>],
        subtask: usize,
        source_index: usize,
        name: &str,
        mode: DistributionMode,
        offset: u64,
    ) {
        assigned[subtask]
            .entry(source_index)
            .or_default()
            .entry(name.to_string())
            .or_insert_with(|| StateMeta::new(mode, Vec::new()))
            .offsets
            .push(offset);
    }

    for (name, info) in &streams {
        match info.mode {
            DistributionMode::SplitDistribute => {
                let mut counter = 0usize;
                for (source_index, offsets) in &info.entries {
                    for &offset in *offsets {
                        let subtask = counter % new_parallelism as usize;
                        push(&mut assigned, subtask, *source_index, name, info.mode, offset);
                        counter += 1;
                    }
                }
            }
            DistributionMode::Union => {
                for subtask in 0..new_parallelism as usize {
                    for (source_index, offsets) in &info.entries {
                        for &offset in *offsets {
                            push(&mut assigned, subtask, *source_index, name, info.mode, offset);
                        }
                    }
                }
            }
            DistributionMode::Broadcast => {
                // the producer guarantees all copies are identical; take the
                // one of the lowest old subtask that wrote the stream
                let lowest = sources[info.entries[0].0].0;
                for (source_index, offsets) in &info.entries {
                    if sources[*source_index].0 != lowest {
                        continue;
                    }
                    for subtask in 0..new_parallelism as usize {
                        for &offset in *offsets {
                            push(&mut assigned, subtask, *source_index, name, info.mode, offset);
                        }
                    }
                }
            }
        }
    }

    Ok(assigned
        .into_iter()
        .map(|by_source| {
            by_source
                .into_iter()
                .map(|(source_index, state_meta)| {
                    OperatorStateHandle::new(sources[source_index].1.delegate().clone(), state_meta)
                })
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use itertools::Itertools;
    use state_api::handle::StreamStateHandle;

    use super::*;

    fn handle(location: &str, streams: Vec<(&str, DistributionMode, Vec<u64>)>) -> OperatorStateHandle {
        let state_meta = streams
            .into_iter()
            .map(|(name, mode, offsets)| (name.to_string(), StateMeta::new(mode, offsets)))
            .collect();
        OperatorStateHandle::new(Arc::new(StreamStateHandle::new(location, 8192)), state_meta)
    }

    /// All `(stream, offset)` sub partitions assigned to one subtask, in
    /// handle order.
    fn sub_partitions(handles: &[OperatorStateHandle]) -> Vec<(String, u64)> {
        handles
            .iter()
            .flat_map(|handle| {
                handle.streams().flat_map(|(name, _, offsets)| {
                    offsets.iter().map(move |offset| (name.to_string(), *offset))
                })
            })
            .collect()
    }

    #[test]
    fn test_split_distribute_round_robin() {
        // five sub partitions a..e in write order, dealt over two subtasks
        let per_old_subtask = vec![
            vec![handle(
                "chk/op-0",
                vec![("buffered", DistributionMode::SplitDistribute, vec![0, 1, 2])],
            )],
            vec![handle(
                "chk/op-1",
                vec![("buffered", DistributionMode::SplitDistribute, vec![3, 4])],
            )],
        ];

        let result = apply_repartitioner(&per_old_subtask, 2).unwrap();
        assert_eq!(
            sub_partitions(&result[0]),
            vec![
                ("buffered".to_string(), 0),
                ("buffered".to_string(), 2),
                ("buffered".to_string(), 4),
            ]
        );
        assert_eq!(
            sub_partitions(&result[1]),
            vec![("buffered".to_string(), 1), ("buffered".to_string(), 3)]
        );
    }

    #[test]
    fn test_union_fans_out_everything() {
        // [x, y] from subtask 0 and [z] from subtask 1, three new subtasks
        let per_old_subtask = vec![
            vec![handle(
                "chk/op-0",
                vec![("seen", DistributionMode::Union, vec![10, 20])],
            )],
            vec![handle(
                "chk/op-1",
                vec![("seen", DistributionMode::Union, vec![30])],
            )],
        ];

        let result = apply_repartitioner(&per_old_subtask, 3).unwrap();
        assert_eq!(result.len(), 3);
        for handles in &result {
            assert_eq!(
                sub_partitions(handles),
                vec![
                    ("seen".to_string(), 10),
                    ("seen".to_string(), 20),
                    ("seen".to_string(), 30),
                ]
            );
        }
    }

    #[test]
    fn test_broadcast_copies_lowest_subtask() {
        let per_old_subtask = vec![
            vec![handle(
                "chk/op-0",
                vec![("rules", DistributionMode::Broadcast, vec![0, 8])],
            )],
            vec![handle(
                "chk/op-1",
                vec![("rules", DistributionMode::Broadcast, vec![100, 108])],
            )],
        ];

        let result = apply_repartitioner(&per_old_subtask, 3).unwrap();
        for handles in &result {
            assert_eq!(handles.len(), 1);
            assert_eq!(handles[0].delegate().location, "chk/op-0");
            assert_eq!(
                sub_partitions(handles),
                vec![("rules".to_string(), 0), ("rules".to_string(), 8)]
            );
        }
    }

    #[test]
    fn test_identity_fast_path_forwards_handles() {
        let per_old_subtask = vec![
            vec![handle(
                "chk/op-0",
                vec![
                    ("buffered", DistributionMode::SplitDistribute, vec![0, 1]),
                    ("rules", DistributionMode::Broadcast, vec![64]),
                ],
            )],
            vec![handle(
                "chk/op-1",
                vec![("buffered", DistributionMode::SplitDistribute, vec![2])],
            )],
        ];

        let result = apply_repartitioner(&per_old_subtask, 2).unwrap();
        assert_eq!(result, per_old_subtask);
    }

    #[test]
    fn test_union_stream_defeats_fast_path() {
        let per_old_subtask = vec![
            vec![handle(
                "chk/op-0",
                vec![("seen", DistributionMode::Union, vec![0])],
            )],
            vec![handle(
                "chk/op-1",
                vec![("seen", DistributionMode::Union, vec![16])],
            )],
        ];

        let result = apply_repartitioner(&per_old_subtask, 2).unwrap();
        for handles in &result {
            assert_eq!(
                sub_partitions(handles),
                vec![("seen".to_string(), 0), ("seen".to_string(), 16)]
            );
        }
    }

    #[test]
    fn test_split_distribute_conserves_sub_partitions() {
        let per_old_subtask = vec![
            vec![handle(
                "chk/op-0",
                vec![("buffered", DistributionMode::SplitDistribute, vec![0, 1, 2, 3])],
            )],
            vec![],
            vec![handle(
                "chk/op-2",
                vec![("buffered", DistributionMode::SplitDistribute, vec![4, 5, 6])],
            )],
        ];

        for new_parallelism in [1, 2, 5, 9] {
            let result = apply_repartitioner(&per_old_subtask, new_parallelism).unwrap();
            let assigned = result
                .iter()
                .flat_map(|handles| sub_partitions(handles))
                .sorted()
                .collect::<Vec<_>>();
            let expected = (0..7u64)
                .map(|offset| ("buffered".to_string(), offset))
                .collect::<Vec<_>>();
            assert_eq!(assigned, expected, "new parallelism {new_parallelism}");
        }
    }

    #[test]
    fn test_conflicting_modes_are_rejected() {
        let per_old_subtask = vec![
            vec![handle(
                "chk/op-0",
                vec![("seen", DistributionMode::Union, vec![0])],
            )],
            vec![handle(
                "chk/op-1",
                vec![("seen", DistributionMode::Broadcast, vec![16])],
            )],
        ];

        assert!(apply_repartitioner(&per_old_subtask, 2).is_err());
    }

    #[test]
    fn test_streams_of_one_handle_stay_grouped() {
        // a handle carrying both a broadcast and a split stream re-emerges as
        // a single handle per new subtask
        let per_old_subtask = vec![vec![handle(
            "chk/op-0",
            vec![
                ("buffered", DistributionMode::SplitDistribute, vec![0, 1]),
                ("rules", DistributionMode::Broadcast, vec![64]),
            ],
        )]];

        let result = apply_repartitioner(&per_old_subtask, 2).unwrap();
        assert_eq!(result[0].len(), 1);
        assert_eq!(
            sub_partitions(&result[0]),
            vec![("buffered".to_string(), 0), ("rules".to_string(), 64)]
        );
        assert_eq!(result[1].len(), 1);
        assert_eq!(
            sub_partitions(&result[1]),
            vec![("buffered".to_string(), 1), ("rules".to_string(), 64)]
        );
    }
}
