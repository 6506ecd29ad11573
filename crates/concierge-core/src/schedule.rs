//! Dependency-ordered scheduling of sub-tasks
//!
//! Orders sub-tasks into levels: every task in a level has all of its
//! dependencies satisfied by earlier levels, so tasks within one level can
//! run concurrently. Kahn's algorithm, generalized to collect all
//! zero-in-degree tasks per round.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;
use tracing::debug;

use crate::types::SubTask;

/// Scheduling failure. A cycle is fatal for the whole request; no partial
/// leveling is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("dependency cycle among sub-tasks {remaining:?}")]
    Cycle {
        /// Ids that could not be placed in any level, sorted
        remaining: Vec<u32>,
    },
}

/// Order sub-tasks into parallel-executable levels.
///
/// Dependencies referencing ids absent from the input are ignored rather
/// than treated as errors; a dangling reference cannot hold anything back.
/// Within a level, tasks are sorted by id for determinism. A
/// self-dependency is a one-node cycle and is detected like any other.
pub fn level(sub_tasks: &[SubTask]) -> Result<Vec<Vec<SubTask>>, ScheduleError> {
    let ids: HashSet<u32> = sub_tasks.iter().map(|t| t.id).collect();

    // In-degree per task, counting only dependencies on existing ids;
    // dependents is the reverse adjacency used to decrement after each round
    let mut in_degree: BTreeMap<u32, usize> = BTreeMap::new();
    let mut dependents: HashMap<u32, Vec<u32>> = HashMap::new();
    for task in sub_tasks {
        let degree = task.depends_on.iter().filter(|d| ids.contains(d)).count();
        in_degree.insert(task.id, degree);
        for dep in &task.depends_on {
            if ids.contains(dep) {
                dependents.entry(*dep).or_default().push(task.id);
            }
        }
    }

    let mut remaining: BTreeMap<u32, SubTask> =
        sub_tasks.iter().map(|t| (t.id, t.clone())).collect();

    let mut levels: Vec<Vec<SubTask>> = Vec::new();
    while !remaining.is_empty() {
        // BTreeMap iteration keeps each level sorted by id
        let ready: Vec<u32> = remaining
            .keys()
            .filter(|id| in_degree.get(id).copied() == Some(0))
            .copied()
            .collect();

        if ready.is_empty() {
            let unresolved: Vec<u32> = remaining.keys().copied().collect();
            return Err(ScheduleError::Cycle {
                remaining: unresolved,
            });
        }

        let mut current: Vec<SubTask> = Vec::with_capacity(ready.len());
        for id in &ready {
            if let Some(task) = remaining.remove(id) {
                current.push(task);
            }
        }
        for id in &ready {
            if let Some(children) = dependents.get(id) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
        }

        levels.push(current);
    }

    debug!(
        "Leveled {} sub-tasks into {} levels",
        sub_tasks.len(),
        levels.len()
    );
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Domain;

    fn task(id: u32, deps: &[u32]) -> SubTask {
        let mut t = SubTask::new(id, format!("task {}", id), Domain::General);
        for d in deps {
            t = t.depends_on(*d);
        }
        t
    }

    #[test]
    fn test_empty_input() {
        let levels = level(&[]).unwrap();
        assert!(levels.is_empty());
    }

    #[test]
    fn test_single_task() {
        let levels = level(&[task(1, &[])]).unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0][0].id, 1);
    }

    #[test]
    fn test_diamond() {
        // 1 -> {2, 3} -> 4
        let tasks = vec![task(1, &[]), task(2, &[1]), task(3, &[1]), task(4, &[2, 3])];
        let levels = level(&tasks).unwrap();

        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0].iter().map(|t| t.id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(
            levels[1].iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(levels[2].iter().map(|t| t.id).collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn test_independent_tasks_one_level() {
        let tasks = vec![task(3, &[]), task(1, &[]), task(2, &[])];
        let levels = level(&tasks).unwrap();
        assert_eq!(levels.len(), 1);
        // sorted by id regardless of input order
        assert_eq!(
            levels[0].iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_two_node_cycle() {
        let tasks = vec![task(1, &[2]), task(2, &[1])];
        let err = level(&tasks).unwrap_err();
        assert_eq!(
            err,
            ScheduleError::Cycle {
                remaining: vec![1, 2]
            }
        );
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let tasks = vec![task(1, &[1])];
        let err = level(&tasks).unwrap_err();
        assert_eq!(err, ScheduleError::Cycle { remaining: vec![1] });
    }

    #[test]
    fn test_cycle_names_only_unresolved_ids() {
        // 1 is placeable, 2 and 3 form a cycle
        let tasks = vec![task(1, &[]), task(2, &[3]), task(3, &[2])];
        let err = level(&tasks).unwrap_err();
        assert_eq!(
            err,
            ScheduleError::Cycle {
                remaining: vec![2, 3]
            }
        );
    }

    #[test]
    fn test_dangling_dependency_ignored() {
        let tasks = vec![task(1, &[99]), task(2, &[1])];
        let levels = level(&tasks).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0][0].id, 1);
        assert_eq!(levels[1][0].id, 2);
    }

    #[test]
    fn test_chain() {
        let tasks = vec![task(1, &[]), task(2, &[1]), task(3, &[2]), task(4, &[3])];
        let levels = level(&tasks).unwrap();
        assert_eq!(levels.len(), 4);
        for (index, lvl) in levels.iter().enumerate() {
            assert_eq!(lvl.len(), 1);
            assert_eq!(lvl[0].id, index as u32 + 1);
        }
    }

    #[test]
    fn test_levels_are_exhaustive_and_disjoint() {
        let tasks = vec![
            task(1, &[]),
            task(2, &[1]),
            task(3, &[1]),
            task(4, &[2, 3]),
            task(5, &[]),
            task(6, &[5, 4]),
        ];
        let levels = level(&tasks).unwrap();

        let mut seen: Vec<u32> = levels
            .iter()
            .flat_map(|l| l.iter().map(|t| t.id))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_task_level_exceeds_dependency_levels() {
        let tasks = vec![
            task(1, &[]),
            task(2, &[1]),
            task(3, &[1]),
            task(4, &[2, 3]),
            task(5, &[]),
            task(6, &[5, 4]),
        ];
        let levels = level(&tasks).unwrap();

        let level_of = |id: u32| {
            levels
                .iter()
                .position(|l| l.iter().any(|t| t.id == id))
                .unwrap()
        };
        for t in &tasks {
            for dep in &t.depends_on {
                assert!(
                    level_of(t.id) > level_of(*dep),
                    "task {} must come after dependency {}",
                    t.id,
                    dep
                );
            }
        }
    }

    #[test]
    fn test_concatenation_is_topological_order() {
        let tasks = vec![task(1, &[]), task(2, &[1]), task(3, &[1]), task(4, &[2, 3])];
        let levels = level(&tasks).unwrap();

        let order: Vec<u32> = levels
            .iter()
            .flat_map(|l| l.iter().map(|t| t.id))
            .collect();
        for t in &tasks {
            let own = order.iter().position(|id| *id == t.id).unwrap();
            for dep in &t.depends_on {
                let dep_pos = order.iter().position(|id| id == dep).unwrap();
                assert!(dep_pos < own);
            }
        }
    }
}
