//! Execution plan: the accepted task set plus its run-level state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use crate::core::dag::TaskGraph;
use crate::core::task::{ExecutionTask, Task, TaskId, TaskState};
use crate::error::{Error, Result};

/// Unique identifier for a plan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display and branch names.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a plan in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Pending => write!(f, "pending"),
            PlanStatus::Running => write!(f, "running"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Failed => write!(f, "failed"),
            PlanStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How task working copies are isolated from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Tasks run one at a time in the repository's own working copy.
    Simple,
    /// One git worktree per task attempt.
    #[default]
    Worktree,
    /// Worktrees, with branches registered with the stack tool.
    Stacked,
}

impl IsolationMode {
    pub fn uses_worktrees(self) -> bool {
        !matches!(self, IsolationMode::Simple)
    }
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationMode::Simple => write!(f, "simple"),
            IsolationMode::Worktree => write!(f, "worktree"),
            IsolationMode::Stacked => write!(f, "stacked"),
        }
    }
}

impl std::str::FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Ok(IsolationMode::Simple),
            "worktree" => Ok(IsolationMode::Worktree),
            "stacked" => Ok(IsolationMode::Stacked),
            other => Err(format!(
                "unknown isolation mode '{}' (expected simple, worktree or stacked)",
                other
            )),
        }
    }
}

/// On-disk plan shape: either a bare task array or `{ "tasks": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlanDocument {
    Tasks(Vec<Task>),
    Wrapped { tasks: Vec<Task> },
}

/// Load a task list from a JSON or TOML file (by extension; JSON otherwise).
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let raw = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    let doc: PlanDocument = if is_toml {
        toml::from_str(&raw)?
    } else {
        serde_json::from_str(&raw)?
    };
    let tasks = match doc {
        PlanDocument::Tasks(tasks) | PlanDocument::Wrapped { tasks } => tasks,
    };
    if tasks.is_empty() {
        return Err(Error::Validation(format!(
            "plan {} contains no tasks",
            path.display()
        )));
    }
    Ok(tasks)
}

/// A plan accepted for execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub id: PlanId,
    pub created_at: DateTime<Utc>,
    pub tasks: BTreeMap<TaskId, ExecutionTask>,
    /// Layer k only depends on layers before it.
    pub execution_layers: Vec<Vec<TaskId>>,
    pub status: PlanStatus,
    pub isolation: IsolationMode,
    pub total_tasks: usize,
}

impl ExecutionPlan {
    /// Wrap `tasks` for execution. Layers are computed from the graph; an
    /// invalid graph yields best-effort layers and must not be executed.
    pub fn new(tasks: Vec<Task>, isolation: IsolationMode, max_retries: u32) -> Self {
        let graph = TaskGraph::build(&tasks);
        let execution_layers = graph.layers().layers;
        let total_tasks = tasks.len();
        let tasks = tasks
            .into_iter()
            .map(|t| (t.id.clone(), ExecutionTask::new(t, max_retries)))
            .collect();
        Self {
            id: PlanId::new(),
            created_at: Utc::now(),
            tasks,
            execution_layers,
            status: PlanStatus::Pending,
            isolation,
            total_tasks,
        }
    }

    pub fn task(&self, id: &TaskId) -> Result<&ExecutionTask> {
        self.tasks.get(id).ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut ExecutionTask> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// The immutable task definitions, in id order.
    pub fn definitions(&self) -> Vec<Task> {
        self.tasks.values().map(|t| t.task.clone()).collect()
    }

    /// Index of the layer containing `id`.
    pub fn layer_of(&self, id: &TaskId) -> Option<usize> {
        self.execution_layers
            .iter()
            .position(|layer| layer.contains(id))
    }

    pub fn count_in(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|t| t.state == state).count()
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.state.is_terminal())
    }
}
