//! Execution strategies.
//!
//! A strategy fixes two things about a run: how far ahead tasks may be
//! dispatched (layer by layer, or as soon as their requirements complete)
//! and which ref each task branch starts from (the shared trunk, or the
//! branch of the task it requires). The dispatch loop itself is shared;
//! see [`crate::orchestration::dispatch`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::core::dag::TaskGraph;
use crate::core::plan::{ExecutionPlan, IsolationMode};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::isolation::worktree::task_branch_name;
use crate::orchestration::dispatch::{Barrier, DispatchProfile, Dispatcher, RunContext, Topology};
use crate::orchestration::orchestrator::Orchestrator;
use crate::orchestration::runner::Services;

/// Fixed cost of creating, committing and cleaning up one task branch.
pub const BRANCH_OVERHEAD: Duration = Duration::from_secs(5);

/// Strategy as requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Parallel,
    Stacked,
    Sequential,
    /// Stacked when the isolation mode is `stacked`, parallel otherwise.
    Hybrid,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StrategyKind::Parallel => "parallel",
            StrategyKind::Stacked => "stacked",
            StrategyKind::Sequential => "sequential",
            StrategyKind::Hybrid => "hybrid",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parallel" => Ok(StrategyKind::Parallel),
            "stacked" => Ok(StrategyKind::Stacked),
            "sequential" => Ok(StrategyKind::Sequential),
            "hybrid" => Ok(StrategyKind::Hybrid),
            other => Err(format!(
                "unknown strategy '{}' (expected parallel, stacked, sequential or hybrid)",
                other
            )),
        }
    }
}

/// The strategy a run actually executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Layer by layer; every task branch starts from trunk.
    Parallel,
    /// As soon as requirements complete; each branch starts from the
    /// branch of the task it requires.
    Stacked,
    /// One task at a time, layer by layer.
    Sequential,
}

impl ExecutionStrategy {
    pub fn resolve(kind: StrategyKind, isolation: IsolationMode) -> Result<Self> {
        let strategy = match kind {
            StrategyKind::Parallel => ExecutionStrategy::Parallel,
            StrategyKind::Stacked => ExecutionStrategy::Stacked,
            StrategyKind::Sequential => ExecutionStrategy::Sequential,
            StrategyKind::Hybrid if isolation == IsolationMode::Stacked => {
                ExecutionStrategy::Stacked
            }
            StrategyKind::Hybrid => ExecutionStrategy::Parallel,
        };
        if !strategy.can_handle(isolation) {
            return Err(Error::UnsupportedCombination(format!(
                "{} strategy needs worktree isolation, got '{}'",
                strategy.name(),
                isolation
            )));
        }
        Ok(strategy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionStrategy::Parallel => "parallel",
            ExecutionStrategy::Stacked => "stacked",
            ExecutionStrategy::Sequential => "sequential",
        }
    }

    /// Whether this strategy can run under `isolation`. Stacking needs a
    /// branch per task, which in-place execution cannot give.
    pub fn can_handle(&self, isolation: IsolationMode) -> bool {
        match self {
            ExecutionStrategy::Stacked => isolation.uses_worktrees(),
            ExecutionStrategy::Parallel | ExecutionStrategy::Sequential => true,
        }
    }

    pub fn profile(&self, isolation: IsolationMode, max_concurrency: usize) -> DispatchProfile {
        let in_place = !isolation.uses_worktrees();
        let workers = if in_place { 1 } else { max_concurrency.max(1) };
        match self {
            ExecutionStrategy::Parallel => DispatchProfile {
                barrier: Barrier::Layered,
                topology: Topology::Trunk,
                workers,
                in_place,
            },
            ExecutionStrategy::Stacked => DispatchProfile {
                barrier: Barrier::Dynamic,
                topology: Topology::Stacked,
                workers,
                in_place,
            },
            ExecutionStrategy::Sequential => DispatchProfile {
                barrier: Barrier::Layered,
                topology: if isolation == IsolationMode::Stacked {
                    Topology::Stacked
                } else {
                    Topology::Trunk
                },
                workers: 1,
                in_place,
            },
        }
    }

    pub async fn execute(
        &self,
        orchestrator: &mut Orchestrator,
        services: &Services,
        ctx: RunContext,
    ) -> Result<()> {
        let profile = self.profile(orchestrator.plan().isolation, ctx.max_concurrency);
        Dispatcher::new(orchestrator, services, profile, ctx)
            .run()
            .await
    }

    /// Rough wall-clock estimate: total estimated size divided by the
    /// parallelism this strategy can use, plus [`BRANCH_OVERHEAD`] for every
    /// branch it creates.
    pub fn estimate_execution_time(&self, plan: &ExecutionPlan, max_concurrency: usize) -> Duration {
        let total: Duration = plan
            .tasks
            .values()
            .map(|t| t.task.estimated_duration())
            .sum();
        let tasks = plan.total_tasks;
        let layers = plan.execution_layers.len().max(1);
        let width = match self {
            ExecutionStrategy::Sequential => 1.0,
            _ if !plan.isolation.uses_worktrees() => 1.0,
            _ => (tasks as f64 / layers as f64).min(max_concurrency.max(1) as f64).max(1.0),
        };
        let branches = if plan.isolation.uses_worktrees() {
            tasks as u32
        } else {
            0
        };
        total.div_f64(width) + BRANCH_OVERHEAD * branches
    }

    /// Where each task would run, without touching the repository.
    pub fn preview(
        &self,
        plan: &ExecutionPlan,
        branch_prefix: &str,
        trunk: &str,
    ) -> Vec<PreviewEntry> {
        let topology = self.profile(plan.isolation, 1).topology;
        let mut entries = Vec::new();
        for (layer, ids) in plan.execution_layers.iter().enumerate() {
            for id in ids {
                let Ok(task) = plan.task(id) else { continue };
                let (branch, base) = if !plan.isolation.uses_worktrees() {
                    (trunk.to_string(), trunk.to_string())
                } else {
                    let base = match (topology, primary_parent(plan, id)) {
                        (Topology::Stacked, Some(parent)) => {
                            task_branch_name(branch_prefix, &plan.id, &parent)
                        }
                        _ => trunk.to_string(),
                    };
                    (task_branch_name(branch_prefix, &plan.id, id), base)
                };
                let mut merges = stack_picks(plan, id);
                if topology != Topology::Stacked {
                    merges.clear();
                }
                entries.push(PreviewEntry {
                    task_id: id.clone(),
                    title: task.task.title.clone(),
                    layer,
                    branch,
                    base,
                    merges,
                    max_attempts: task.max_retries + 1,
                    estimated_duration: task.task.estimated_duration(),
                });
            }
        }
        entries
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One line of a dry-run preview.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewEntry {
    pub task_id: TaskId,
    pub title: String,
    pub layer: usize,
    pub branch: String,
    pub base: String,
    /// Tasks outside the base branch's history whose commits get
    /// cherry-picked in before the run, in pick order.
    pub merges: Vec<TaskId>,
    pub max_attempts: u32,
    pub estimated_duration: Duration,
}

/// Direct requirements ordered deepest layer first, then by id.
fn parents_by_depth(plan: &ExecutionPlan, graph: &TaskGraph, id: &TaskId) -> Vec<TaskId> {
    let mut parents = graph.dependencies(id);
    parents.sort_by(|a, b| {
        let (la, lb) = (plan.layer_of(a), plan.layer_of(b));
        lb.cmp(&la).then_with(|| a.cmp(b))
    });
    parents
}

/// The requirement a stacked branch starts from: the one in the deepest
/// layer, ties broken by id.
pub fn primary_parent(plan: &ExecutionPlan, id: &TaskId) -> Option<TaskId> {
    let graph = TaskGraph::build(&plan.definitions());
    parents_by_depth(plan, &graph, id).into_iter().next()
}

/// Tasks whose work a stacked branch needs but does not inherit from its
/// primary parent: every other parent together with its own ancestry,
/// minus whatever the primary parent already carries. Shallow layers come
/// first so each pick applies on top of its requirements.
pub fn stack_picks(plan: &ExecutionPlan, id: &TaskId) -> Vec<TaskId> {
    let graph = TaskGraph::build(&plan.definitions());
    let mut parents = parents_by_depth(plan, &graph, id).into_iter();
    let Some(primary) = parents.next() else {
        return Vec::new();
    };

    let mut inherited: BTreeSet<TaskId> =
        graph.transitive_requirements(&primary).into_iter().collect();
    inherited.insert(primary);

    let mut picks = BTreeSet::new();
    for parent in parents {
        for task in graph.transitive_requirements(&parent) {
            if !inherited.contains(&task) {
                picks.insert(task);
            }
        }
        if !inherited.contains(&parent) {
            picks.insert(parent);
        }
    }

    let mut picks: Vec<TaskId> = picks.into_iter().collect();
    picks.sort_by(|a, b| {
        plan.layer_of(a)
            .cmp(&plan.layer_of(b))
            .then_with(|| a.cmp(b))
    });
    picks
}
