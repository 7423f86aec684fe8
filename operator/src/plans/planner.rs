//! Compiles an execution strategy into ordered stages with concurrency
//! bounds. Pure; the reconciler rebuilds the plan on every pass instead of
//! persisting it.

use hibernator_types::{ExecutionStrategy, Operation, Target};
use std::collections::{BTreeMap, BTreeSet};

use crate::util::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionStage {
    pub targets: Vec<String>,
    pub max_concurrency: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ExecutionPlan {
    pub stages: Vec<ExecutionStage>,
}

impl ExecutionPlan {
    pub fn stage(&self, index: usize) -> Option<&ExecutionStage> {
        self.stages.get(index)
    }

    /// Stage index of a target, if the plan contains it.
    pub fn stage_of(&self, target: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.targets.iter().any(|t| t == target))
    }
}

/// Builds the staged walk for one operation. Wake-up replays the shutdown
/// stages in reverse order, so dependents come back before their
/// dependencies are touched.
pub fn build_execution_plan(
    targets: &[Target],
    strategy: &ExecutionStrategy,
    operation: Operation,
) -> Result<ExecutionPlan, Error> {
    let mut plan = match strategy {
        ExecutionStrategy::Sequential => ExecutionPlan {
            stages: targets
                .iter()
                .map(|t| ExecutionStage {
                    targets: vec![t.name.clone()],
                    max_concurrency: 1,
                })
                .collect(),
        },
        ExecutionStrategy::Parallel { max_concurrency } => {
            let names: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();
            let bound = max_concurrency
                .map(|m| m as usize)
                .unwrap_or(names.len())
                .max(1);
            ExecutionPlan {
                stages: vec![ExecutionStage {
                    targets: names,
                    max_concurrency: bound,
                }],
            }
        }
        ExecutionStrategy::Staged {
            stages,
            max_concurrency,
        } => ExecutionPlan {
            stages: stages
                .iter()
                .map(|stage| ExecutionStage {
                    targets: stage.targets.clone(),
                    max_concurrency: if stage.parallel {
                        max_concurrency
                            .map(|m| m as usize)
                            .unwrap_or(stage.targets.len())
                            .max(1)
                    } else {
                        1
                    },
                })
                .collect(),
        },
        ExecutionStrategy::Dag {
            dependencies,
            max_concurrency,
        } => build_dag_stages(targets, dependencies, *max_concurrency)?,
    };

    if operation == Operation::Wakeup {
        plan.stages.reverse();
    }
    Ok(plan)
}

/// Kahn's algorithm over `from -> to` edges. Every topological level becomes
/// one stage; targets within a level are sorted for determinism.
fn build_dag_stages(
    targets: &[Target],
    dependencies: &[hibernator_types::Dependency],
    max_concurrency: Option<u32>,
) -> Result<ExecutionPlan, Error> {
    let known: BTreeSet<&str> = targets.iter().map(|t| t.name.as_str()).collect();
    let mut indegree: BTreeMap<&str, usize> = known.iter().map(|name| (*name, 0)).collect();
    let mut downstream: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for dep in dependencies {
        for name in [dep.from.as_str(), dep.to.as_str()] {
            if !known.contains(name) {
                return Err(Error::UserInput(format!(
                    "dependency references unknown target {:?}",
                    name
                )));
            }
        }
        downstream
            .entry(dep.from.as_str())
            .or_default()
            .push(dep.to.as_str());
        *indegree.entry(dep.to.as_str()).or_default() += 1;
    }

    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut stages = Vec::new();
    let mut placed = 0usize;

    while !ready.is_empty() {
        ready.sort_unstable();
        placed += ready.len();
        let mut next: Vec<&str> = Vec::new();
        for name in &ready {
            for succ in downstream.get(name).into_iter().flatten() {
                let d = indegree.get_mut(succ).unwrap();
                *d -= 1;
                if *d == 0 {
                    next.push(succ);
                }
            }
        }
        let bound = max_concurrency
            .map(|m| m as usize)
            .unwrap_or(ready.len())
            .max(1);
        stages.push(ExecutionStage {
            targets: ready.iter().map(|s| s.to_string()).collect(),
            max_concurrency: bound,
        });
        ready = next;
    }

    if placed != known.len() {
        return Err(Error::UserInput(
            "dependency graph contains a cycle".to_string(),
        ));
    }
    Ok(ExecutionPlan { stages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hibernator_types::{ConnectorRef, Dependency, StageSpec};

    fn target(name: &str) -> Target {
        Target {
            name: name.to_string(),
            target_type: "eks".to_string(),
            connector_ref: ConnectorRef {
                kind: "aws".to_string(),
                name: "default".to_string(),
                namespace: None,
            },
            parameters: None,
        }
    }

    fn dep(from: &str, to: &str) -> Dependency {
        Dependency {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    fn names(stage: &ExecutionStage) -> Vec<&str> {
        stage.targets.iter().map(|s| s.as_str()).collect()
    }

    #[test]
    fn sequential_yields_one_stage_per_target() {
        let targets = vec![target("db"), target("cache"), target("api")];
        let plan =
            build_execution_plan(&targets, &ExecutionStrategy::Sequential, Operation::Shutdown)
                .unwrap();
        assert_eq!(plan.stages.len(), 3);
        assert_eq!(names(&plan.stages[0]), ["db"]);
        assert_eq!(names(&plan.stages[1]), ["cache"]);
        assert_eq!(names(&plan.stages[2]), ["api"]);
        assert!(plan.stages.iter().all(|s| s.max_concurrency == 1));
    }

    #[test]
    fn parallel_defaults_concurrency_to_target_count() {
        let targets = vec![target("a"), target("b"), target("c")];
        let plan = build_execution_plan(
            &targets,
            &ExecutionStrategy::Parallel {
                max_concurrency: None,
            },
            Operation::Shutdown,
        )
        .unwrap();
        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.stages[0].max_concurrency, 3);
        let plan = build_execution_plan(
            &targets,
            &ExecutionStrategy::Parallel {
                max_concurrency: Some(2),
            },
            Operation::Shutdown,
        )
        .unwrap();
        assert_eq!(plan.stages[0].max_concurrency, 2);
    }

    #[test]
    fn staged_respects_declared_order_and_parallel_flag() {
        let targets = vec![target("a"), target("b"), target("c")];
        let strategy = ExecutionStrategy::Staged {
            stages: vec![
                StageSpec {
                    name: Some("first".to_string()),
                    targets: vec!["a".to_string(), "b".to_string()],
                    parallel: true,
                },
                StageSpec {
                    name: None,
                    targets: vec!["c".to_string()],
                    parallel: false,
                },
            ],
            max_concurrency: Some(4),
        };
        let plan = build_execution_plan(&targets, &strategy, Operation::Shutdown).unwrap();
        assert_eq!(names(&plan.stages[0]), ["a", "b"]);
        assert_eq!(plan.stages[0].max_concurrency, 4);
        assert_eq!(plan.stages[1].max_concurrency, 1);
    }

    #[test]
    fn dag_produces_topological_levels() {
        let targets = vec![target("a"), target("b"), target("c"), target("d")];
        let strategy = ExecutionStrategy::Dag {
            dependencies: vec![dep("a", "b"), dep("a", "c"), dep("b", "d"), dep("c", "d")],
            max_concurrency: Some(2),
        };
        let plan = build_execution_plan(&targets, &strategy, Operation::Shutdown).unwrap();
        assert_eq!(plan.stages.len(), 3);
        assert_eq!(names(&plan.stages[0]), ["a"]);
        assert_eq!(names(&plan.stages[1]), ["b", "c"]);
        assert_eq!(names(&plan.stages[2]), ["d"]);
        assert!(plan.stages.iter().all(|s| s.max_concurrency == 2));
    }

    #[test]
    fn dag_wakeup_reverses_the_stages() {
        let targets = vec![target("a"), target("b"), target("c"), target("d")];
        let strategy = ExecutionStrategy::Dag {
            dependencies: vec![dep("a", "b"), dep("a", "c"), dep("b", "d"), dep("c", "d")],
            max_concurrency: Some(2),
        };
        let plan = build_execution_plan(&targets, &strategy, Operation::Wakeup).unwrap();
        assert_eq!(names(&plan.stages[0]), ["d"]);
        assert_eq!(names(&plan.stages[1]), ["b", "c"]);
        assert_eq!(names(&plan.stages[2]), ["a"]);
    }

    #[test]
    fn reversing_twice_restores_the_shutdown_order() {
        let targets = vec![target("a"), target("b"), target("c"), target("d")];
        for strategy in [
            ExecutionStrategy::Sequential,
            ExecutionStrategy::Parallel {
                max_concurrency: Some(2),
            },
            ExecutionStrategy::Dag {
                dependencies: vec![dep("a", "b"), dep("b", "c")],
                max_concurrency: None,
            },
        ] {
            let shutdown =
                build_execution_plan(&targets, &strategy, Operation::Shutdown).unwrap();
            let mut wakeup =
                build_execution_plan(&targets, &strategy, Operation::Wakeup).unwrap();
            wakeup.stages.reverse();
            assert_eq!(shutdown, wakeup);
        }
    }

    #[test]
    fn dag_edges_always_point_to_later_stages() {
        let targets = vec![
            target("a"),
            target("b"),
            target("c"),
            target("d"),
            target("e"),
        ];
        let deps = vec![dep("a", "c"), dep("b", "c"), dep("c", "d"), dep("a", "e")];
        let strategy = ExecutionStrategy::Dag {
            dependencies: deps.clone(),
            max_concurrency: None,
        };
        let plan = build_execution_plan(&targets, &strategy, Operation::Shutdown).unwrap();
        for d in &deps {
            assert!(plan.stage_of(&d.from).unwrap() < plan.stage_of(&d.to).unwrap());
        }
    }

    #[test]
    fn dag_rejects_cycles() {
        let targets = vec![target("a"), target("b"), target("c")];
        let strategy = ExecutionStrategy::Dag {
            dependencies: vec![dep("a", "b"), dep("b", "c"), dep("c", "a")],
            max_concurrency: None,
        };
        assert!(matches!(
            build_execution_plan(&targets, &strategy, Operation::Shutdown),
            Err(Error::UserInput(_))
        ));
    }

    #[test]
    fn dag_rejects_unknown_targets() {
        let targets = vec![target("a"), target("b")];
        let strategy = ExecutionStrategy::Dag {
            dependencies: vec![dep("a", "ghost")],
            max_concurrency: None,
        };
        assert!(matches!(
            build_execution_plan(&targets, &strategy, Operation::Shutdown),
            Err(Error::UserInput(_))
        ));
    }

    #[test]
    fn dag_without_edges_is_one_wide_stage() {
        let targets = vec![target("b"), target("a")];
        let strategy = ExecutionStrategy::Dag {
            dependencies: vec![],
            max_concurrency: None,
        };
        let plan = build_execution_plan(&targets, &strategy, Operation::Shutdown).unwrap();
        assert_eq!(plan.stages.len(), 1);
        // Levels are sorted for determinism.
        assert_eq!(names(&plan.stages[0]), ["a", "b"]);
    }
}
