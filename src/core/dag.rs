//! Task dependency graph: validation, layering and scheduling metrics.
//!
//! `TaskGraph` stores the plan as a petgraph `DiGraph` whose edges point
//! from a required task to the task that requires it. Everything here is a
//! pure function of the task list; nothing touches the repository.

use petgraph::algo::{has_path_connecting, DfsSpace};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use crate::core::task::{Task, TaskId};
use crate::util::sanitize_ref_component;

/// A problem that makes a plan unexecutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValidationIssue {
    /// A dependency cycle, listed in traversal order with the first task
    /// repeated at the end.
    Cycle { tasks: Vec<TaskId> },
    /// Two unrelated tasks declare overlapping paths.
    FileConflict {
        first: TaskId,
        second: TaskId,
        paths: Vec<String>,
    },
    DuplicateTask { id: TaskId },
    MissingDependency { task: TaskId, requires: TaskId },
    /// Distinct ids that would share a branch and worktree name.
    NameCollision {
        first: TaskId,
        second: TaskId,
        name: String,
    },
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationIssue::Cycle { tasks } => {
                let path: Vec<&str> = tasks.iter().map(TaskId::as_str).collect();
                write!(f, "dependency cycle: {}", path.join(" -> "))
            }
            ValidationIssue::FileConflict {
                first,
                second,
                paths,
            } => write!(
                f,
                "file conflict between {} and {} on {}",
                first,
                second,
                paths.join(", ")
            ),
            ValidationIssue::DuplicateTask { id } => write!(f, "duplicate task id {}", id),
            ValidationIssue::MissingDependency { task, requires } => {
                write!(f, "task {} requires unknown task {}", task, requires)
            }
            ValidationIssue::NameCollision {
                first,
                second,
                name,
            } => write!(
                f,
                "tasks '{}' and '{}' both map to branch name '{}'",
                first, second, name
            ),
        }
    }
}

/// Something suspicious that does not block execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValidationWarning {
    /// No touched or produced paths, so conflicts cannot be checked.
    NoDeclaredFiles { task: TaskId },
    ZeroSize { task: TaskId },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationWarning::NoDeclaredFiles { task } => {
                write!(f, "task {} declares no touched or produced paths", task)
            }
            ValidationWarning::ZeroSize { task } => {
                write!(f, "task {} has no size estimate", task)
            }
        }
    }
}

/// Outcome of [`TaskGraph::validate`].
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationWarning>,
    /// Best-effort layering, present even when the plan is invalid.
    pub layers: Vec<Vec<TaskId>>,
}

impl ValidationReport {
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

/// Kahn-style layering result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layering {
    pub layers: Vec<Vec<TaskId>>,
    /// Tasks that could not be placed (cycles or unknown requirements).
    pub unresolved: Vec<TaskId>,
}

/// Scheduling metrics for a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanMetrics {
    pub total_tasks: usize,
    pub layer_count: usize,
    /// Width of the widest layer.
    pub max_parallelism: usize,
    pub total_estimated_duration: Duration,
    pub average_estimated_duration: Duration,
    pub critical_path_duration: Duration,
    pub critical_path: Vec<TaskId>,
    /// `1 - layers / tasks`: 0 for a fully serial plan, approaching 1 as
    /// more tasks share each layer.
    pub parallelization_efficiency: f64,
}

/// The task dependency graph.
pub struct TaskGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    tasks: BTreeMap<TaskId, Task>,
    duplicates: Vec<TaskId>,
    missing: Vec<(TaskId, TaskId)>,
}

impl TaskGraph {
    /// Build the graph. Nodes are inserted in id order so every traversal
    /// below is deterministic regardless of input order.
    pub fn build(tasks: &[Task]) -> Self {
        let mut by_id: BTreeMap<TaskId, Task> = BTreeMap::new();
        let mut duplicates = Vec::new();
        for task in tasks {
            if by_id.contains_key(&task.id) {
                duplicates.push(task.id.clone());
            } else {
                by_id.insert(task.id.clone(), task.clone());
            }
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for id in by_id.keys() {
            index.insert(id.clone(), graph.add_node(id.clone()));
        }

        let mut missing = Vec::new();
        for task in by_id.values() {
            let to = index[&task.id];
            let requires: BTreeSet<&TaskId> = task.requires.iter().collect();
            for req in requires {
                match index.get(req) {
                    Some(&from) => {
                        graph.add_edge(from, to, ());
                    }
                    None => missing.push((task.id.clone(), req.clone())),
                }
            }
        }

        Self {
            graph,
            index,
            tasks: by_id,
            duplicates,
            missing,
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Direct requirements of `id` that exist in the graph, in id order.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &TaskId, dir: Direction) -> Vec<TaskId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<TaskId> = self
            .graph
            .neighbors_directed(node, dir)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Every task `id` reaches through its requirements, excluding `id`.
    pub fn transitive_requirements(&self, id: &TaskId) -> Vec<TaskId> {
        let mut seen = BTreeSet::new();
        let mut stack = self.dependencies(id);
        while let Some(next) = stack.pop() {
            if &next != id && seen.insert(next.clone()) {
                stack.extend(self.dependencies(&next));
            }
        }
        seen.into_iter().collect()
    }

    /// Run every check and compute best-effort layers.
    pub fn validate(&self) -> ValidationReport {
        let mut errors: Vec<ValidationIssue> = self
            .duplicates
            .iter()
            .map(|id| ValidationIssue::DuplicateTask { id: id.clone() })
            .collect();
        errors.extend(
            self.missing
                .iter()
                .map(|(task, requires)| ValidationIssue::MissingDependency {
                    task: task.clone(),
                    requires: requires.clone(),
                }),
        );
        errors.extend(
            self.find_cycles()
                .into_iter()
                .map(|tasks| ValidationIssue::Cycle { tasks }),
        );
        errors.extend(self.find_conflicts());
        errors.extend(self.find_name_collisions());

        let mut warnings = Vec::new();
        for task in self.tasks.values() {
            if task.touches.is_empty() && task.produces.is_empty() {
                warnings.push(ValidationWarning::NoDeclaredFiles {
                    task: task.id.clone(),
                });
            }
            if task.estimated_size == 0 {
                warnings.push(ValidationWarning::ZeroSize {
                    task: task.id.clone(),
                });
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
            layers: self.layers().layers,
        }
    }

    /// Ids that sanitize to the same ref component. Compared without case
    /// so case-insensitive filesystems cannot merge two worktree paths.
    pub fn find_name_collisions(&self) -> Vec<ValidationIssue> {
        let mut seen: BTreeMap<String, &TaskId> = BTreeMap::new();
        let mut issues = Vec::new();
        for id in self.tasks.keys() {
            let name = sanitize_ref_component(id.as_str());
            match seen.get(&name.to_ascii_lowercase()) {
                Some(first) => issues.push(ValidationIssue::NameCollision {
                    first: (*first).clone(),
                    second: id.clone(),
                    name,
                }),
                None => {
                    seen.insert(name.to_ascii_lowercase(), id);
                }
            }
        }
        issues
    }

    /// Depth-first search with an on-stack marker; each back-edge yields
    /// one cycle.
    pub fn find_cycles(&self) -> Vec<Vec<TaskId>> {
        let mut finished = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();
        let mut cycles = Vec::new();

        let mut roots: Vec<NodeIndex> = self.graph.node_indices().collect();
        roots.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        for root in roots {
            if !finished.contains(&root) {
                self.dfs_cycles(root, &mut finished, &mut on_stack, &mut path, &mut cycles);
            }
        }
        cycles
    }

    fn dfs_cycles(
        &self,
        node: NodeIndex,
        finished: &mut HashSet<NodeIndex>,
        on_stack: &mut HashSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
        cycles: &mut Vec<Vec<TaskId>>,
    ) {
        on_stack.insert(node);
        path.push(node);

        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        next.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        next.dedup();

        for child in next {
            if on_stack.contains(&child) {
                if let Some(start) = path.iter().position(|n| *n == child) {
                    let mut cycle: Vec<TaskId> =
                        path[start..].iter().map(|n| self.graph[*n].clone()).collect();
                    cycle.push(self.graph[child].clone());
                    cycles.push(cycle);
                }
            } else if !finished.contains(&child) {
                self.dfs_cycles(child, finished, on_stack, path, cycles);
            }
        }

        path.pop();
        on_stack.remove(&node);
        finished.insert(node);
    }

    /// Pairs of tasks with no ancestor/descendant relation whose declared
    /// paths overlap.
    pub fn find_conflicts(&self) -> Vec<ValidationIssue> {
        let footprints: Vec<(&TaskId, BTreeSet<String>)> = self
            .tasks
            .values()
            .map(|t| (&t.id, t.footprint()))
            .collect();
        let mut space = DfsSpace::new(&self.graph);
        let mut conflicts = Vec::new();

        for (i, (a, fa)) in footprints.iter().enumerate() {
            for (b, fb) in footprints.iter().skip(i + 1) {
                let shared: Vec<String> = fa.intersection(fb).cloned().collect();
                if shared.is_empty() {
                    continue;
                }
                let (na, nb) = (self.index[*a], self.index[*b]);
                let related = has_path_connecting(&self.graph, na, nb, Some(&mut space))
                    || has_path_connecting(&self.graph, nb, na, Some(&mut space));
                if !related {
                    conflicts.push(ValidationIssue::FileConflict {
                        first: (*a).clone(),
                        second: (*b).clone(),
                        paths: shared,
                    });
                }
            }
        }
        conflicts
    }

    /// Repeatedly peel off every task whose requirements were all placed
    /// in earlier layers. Ties are broken by task id.
    pub fn layers(&self) -> Layering {
        let mut remaining: BTreeSet<&TaskId> = self.tasks.keys().collect();
        let mut placed: HashSet<&TaskId> = HashSet::new();
        let mut layers = Vec::new();

        loop {
            let layer: Vec<&TaskId> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    self.tasks[*id]
                        .requires
                        .iter()
                        .all(|req| placed.contains(req))
                })
                .collect();
            if layer.is_empty() {
                break;
            }
            for id in &layer {
                remaining.remove(id);
                placed.insert(id);
            }
            layers.push(layer.into_iter().cloned().collect());
        }

        Layering {
            layers,
            unresolved: remaining.into_iter().cloned().collect(),
        }
    }

    pub fn metrics(&self) -> PlanMetrics {
        let layering = self.layers();
        let total_tasks = self.tasks.len();
        let total: Duration = self.tasks.values().map(Task::estimated_duration).sum();
        let average = if total_tasks == 0 {
            Duration::ZERO
        } else {
            total / total_tasks as u32
        };

        // Longest cumulative duration ending at each task, walking layers
        // in order so every requirement is already scored.
        let mut longest: HashMap<&TaskId, (Duration, Option<&TaskId>)> = HashMap::new();
        for id in layering.layers.iter().flatten() {
            let task = &self.tasks[id];
            let best_parent = task
                .requires
                .iter()
                .filter_map(|req| longest.get(req).map(|(d, _)| (*d, req)))
                .max_by(|(da, ra), (db, rb)| da.cmp(db).then_with(|| rb.cmp(ra)));
            let (base, parent) = match best_parent {
                Some((d, req)) => (d, Some(req)),
                None => (Duration::ZERO, None),
            };
            longest.insert(id, (base + task.estimated_duration(), parent));
        }

        let end = longest
            .iter()
            .max_by(|(ia, (da, _)), (ib, (db, _))| da.cmp(db).then_with(|| ib.cmp(ia)))
            .map(|(id, (d, _))| (*id, *d));
        let (critical_path, critical_path_duration) = match end {
            Some((mut id, duration)) => {
                let mut path = vec![id.clone()];
                while let Some((_, Some(parent))) = longest.get(id) {
                    path.push((*parent).clone());
                    id = parent;
                }
                path.reverse();
                (path, duration)
            }
            None => (Vec::new(), Duration::ZERO),
        };

        let layer_count = layering.layers.len();
        PlanMetrics {
            total_tasks,
            layer_count,
            max_parallelism: layering.layers.iter().map(Vec::len).max().unwrap_or(0),
            total_estimated_duration: total,
            average_estimated_duration: average,
            critical_path_duration,
            critical_path,
            parallelization_efficiency: parallelization_efficiency(total_tasks, layer_count),
        }
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}

/// Efficiency from the tasks-per-layer ratio `r`: `1 - 1/r`.
pub fn parallelization_efficiency(tasks: usize, layers: usize) -> f64 {
    if tasks == 0 || layers == 0 {
        return 0.0;
    }
    1.0 - layers as f64 / tasks as f64
}

/// Validate a task list.
pub fn validate(tasks: &[Task]) -> ValidationReport {
    TaskGraph::build(tasks).validate()
}

/// Scheduling metrics for a task list.
pub fn calculate_metrics(tasks: &[Task]) -> PlanMetrics {
    TaskGraph::build(tasks).metrics()
}
