//! Task data model and the per-task state machine.
//!
//! A [`Task`] is what the decomposer hands us and never changes once a plan
//! is accepted. An [`ExecutionTask`] wraps it with run state: the current
//! [`TaskState`], an append-only transition history, retry bookkeeping and
//! the branch/commit/worktree produced by the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Wall-clock estimate for one unit of a task's size.
pub const SECONDS_PER_SIZE_UNIT: u64 = 60;

/// Identifier of a task within a plan, as given by the decomposer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A code-change task as declared in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Paths the task reads or modifies.
    #[serde(default)]
    pub touches: Vec<String>,
    /// Paths the task creates.
    #[serde(default)]
    pub produces: Vec<String>,
    /// Tasks that must complete first.
    #[serde(default)]
    pub requires: Vec<TaskId>,
    #[serde(
        default,
        alias = "estimatedSize",
        alias = "estimatedLines",
        alias = "size"
    )]
    pub estimated_size: u32,
    /// Instruction payload handed to the adapter; opaque to the core.
    #[serde(default, alias = "instructions")]
    pub prompt: String,
}

impl Task {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: TaskId::from(id),
            title: title.to_string(),
            description: String::new(),
            touches: Vec::new(),
            produces: Vec::new(),
            requires: Vec::new(),
            estimated_size: 1,
            prompt: String::new(),
        }
    }

    pub fn with_requires(mut self, requires: &[&str]) -> Self {
        self.requires = requires.iter().map(|r| TaskId::from(*r)).collect();
        self
    }

    pub fn with_touches(mut self, touches: &[&str]) -> Self {
        self.touches = touches.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_produces(mut self, produces: &[&str]) -> Self {
        self.produces = produces.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.estimated_size = size;
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = prompt.to_string();
        self
    }

    /// Every path the task reads, modifies or creates, normalized.
    pub fn footprint(&self) -> std::collections::BTreeSet<String> {
        self.touches
            .iter()
            .chain(self.produces.iter())
            .map(|p| normalize_path(p))
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Size-based duration estimate. Zero-sized tasks count as one unit.
    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.estimated_size.max(1)) * SECONDS_PER_SIZE_UNIT)
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    trimmed.trim_end_matches('/').to_string()
}

/// Task state in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on required tasks.
    #[default]
    Pending,
    /// Every required task completed.
    Ready,
    /// Selected for dispatch by the strategy.
    Queued,
    /// Adapter invoked.
    Running,
    Completed,
    Failed,
    /// A required task failed or was skipped.
    Blocked,
    /// Explicitly bypassed, or never started because the run stopped.
    Skipped,
}

impl TaskState {
    /// Whether the state machine allows `self -> next`.
    ///
    /// `Failed -> Queued` is the only backward edge and is reserved for
    /// retries; callers go through [`ExecutionTask::retry`].
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready | Blocked | Skipped)
                | (Ready, Queued | Blocked | Skipped)
                | (Queued, Running | Failed | Skipped)
                | (Running, Completed | Failed)
                | (Failed, Queued)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Blocked | TaskState::Skipped
        )
    }

    /// Terminal states that make dependents unrunnable.
    pub fn poisons_dependents(self) -> bool {
        matches!(
            self,
            TaskState::Failed | TaskState::Blocked | TaskState::Skipped
        )
    }

    /// Not yet handed to the adapter in any attempt.
    pub fn is_unstarted(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Ready)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Blocked => "blocked",
            TaskState::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// One entry of a task's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// A task plus its mutable run state.
///
/// The history grows for the whole run and is dropped with the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub task: Task,
    pub state: TaskState,
    pub state_history: Vec<StateTransition>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Instructions for the next attempt: the task prompt plus failure
    /// context from earlier attempts.
    pub instructions: String,
    pub branch_name: Option<String>,
    pub base_ref: Option<String>,
    pub commit_hash: Option<String>,
    pub worktree_dir: Option<PathBuf>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
}

impl ExecutionTask {
    pub fn new(task: Task, max_retries: u32) -> Self {
        let instructions = if task.prompt.trim().is_empty() {
            format!("{}\n\n{}", task.title, task.description).trim().to_string()
        } else {
            task.prompt.clone()
        };
        Self {
            task,
            state: TaskState::Pending,
            state_history: Vec::new(),
            retry_count: 0,
            max_retries,
            instructions,
            branch_name: None,
            base_ref: None,
            commit_hash: None,
            worktree_dir: None,
            start_time: None,
            end_time: None,
            error: None,
            exit_code: None,
            output: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.task.id
    }

    /// Attempt number of the current (or next) run, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Move to `to`, recording the transition.
    pub fn transition(&mut self, to: TaskState, reason: Option<String>) -> Result<()> {
        if !self.state.can_transition_to(to) || (self.state == TaskState::Failed && !self.can_retry())
        {
            return Err(Error::InvalidTransition {
                task: self.task.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state_history.push(StateTransition {
            from: self.state,
            to,
            at: Utc::now(),
            reason,
        });
        self.state = to;
        Ok(())
    }

    pub fn mark_ready(&mut self) -> Result<()> {
        self.transition(TaskState::Ready, Some("all required tasks completed".into()))
    }

    pub fn queue(&mut self) -> Result<()> {
        self.transition(TaskState::Queued, Some("selected for dispatch".into()))
    }

    /// Record that the adapter is about to run in `worktree` on `branch`.
    pub fn start(&mut self, worktree: Option<PathBuf>, branch: Option<String>) -> Result<()> {
        self.transition(
            TaskState::Running,
            Some(format!("attempt {} started", self.attempt())),
        )?;
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
        self.worktree_dir = worktree;
        if branch.is_some() {
            self.branch_name = branch;
        }
        Ok(())
    }

    pub fn complete(&mut self, commit: Option<String>, output: Option<String>) -> Result<()> {
        self.transition(TaskState::Completed, Some("adapter reported success".into()))?;
        self.commit_hash = commit;
        self.output = output;
        self.error = None;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: &str, exit_code: Option<i32>) -> Result<()> {
        self.transition(TaskState::Failed, Some(error.to_string()))?;
        self.error = Some(error.to_string());
        self.exit_code = exit_code;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    /// `Failed -> Queued` for another attempt, with the failure detail
    /// appended to the instructions.
    pub fn retry(&mut self, detail: &str) -> Result<()> {
        let failed_attempt = self.attempt();
        self.transition(
            TaskState::Queued,
            Some(format!(
                "retry {}/{} after: {}",
                self.retry_count + 1,
                self.max_retries,
                detail
            )),
        )?;
        self.retry_count += 1;
        self.end_time = None;
        self.worktree_dir = None;
        self.instructions.push_str(&format!(
            "\n\n---\nPrevious attempt {} failed:\n{}\nAddress this failure in this attempt.",
            failed_attempt,
            detail.trim()
        ));
        Ok(())
    }

    pub fn block(&mut self, reason: &str) -> Result<()> {
        self.transition(TaskState::Blocked, Some(reason.to_string()))?;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    pub fn skip(&mut self, reason: &str) -> Result<()> {
        self.transition(TaskState::Skipped, Some(reason.to_string()))?;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    pub fn duration(&self) -> Option<Duration> {
        let start = self.start_time?;
        let end = self.end_time?;
        (end - start).to_std().ok()
    }
}
