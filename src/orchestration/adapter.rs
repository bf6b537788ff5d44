//! Task-execution adapters.
//!
//! An adapter performs a task's code changes inside the working copy it is
//! handed. The core never looks inside the instructions; it only cares
//! whether the adapter reports success and what it left on disk.
//!
//! [`CommandAdapter`] is the stock implementation: it runs an agent CLI in
//! headless mode (`<command> -p <instructions>`) in the task's worktree.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::event::{EventBus, EventKind};
use crate::core::plan::PlanId;
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// Everything an adapter needs to run one attempt of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub title: String,
    pub description: String,
    /// Prompt for this attempt, including failure context from earlier
    /// attempts.
    pub instructions: String,
    pub working_dir: PathBuf,
    pub branch_name: String,
    pub attempt: u32,
    pub touches: Vec<String>,
    pub produces: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
}

/// What the adapter reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

impl TaskResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            output: Some(output.into()),
            error: None,
            exit_code: Some(0),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            output: None,
            error: Some(error.into()),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    /// Best description of a failure for logs and retry instructions.
    pub fn failure_detail(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.output.clone())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| match self.exit_code {
                Some(code) => format!("adapter exited with code {}", code),
                None => "adapter reported failure".to_string(),
            })
    }
}

/// Lets an adapter publish progress for the task it is running.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    events: EventBus,
    plan_id: PlanId,
    task_id: TaskId,
}

impl ProgressReporter {
    pub fn new(events: EventBus, plan_id: PlanId, task_id: TaskId) -> Self {
        Self {
            events,
            plan_id,
            task_id,
        }
    }

    pub fn update(&self, message: &str) {
        self.events.emit(
            EventKind::ProgressUpdate,
            self.plan_id,
            Some(&self.task_id),
            serde_json::json!({ "message": message }),
        );
    }

    pub fn output(&self, chunk: &str) {
        self.events.emit(
            EventKind::TaskOutput,
            self.plan_id,
            Some(&self.task_id),
            serde_json::json!({ "output": chunk }),
        );
    }
}

/// Performs a task's changes in its working copy.
#[async_trait]
pub trait TaskAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Run one attempt. `Err` means the adapter itself broke; a task that
    /// ran and failed is `Ok` with [`TaskStatus::Failure`].
    async fn execute_task(&self, request: TaskRequest, progress: ProgressReporter)
        -> Result<TaskResult>;

    /// Ask a running attempt to stop. Returns whether one was running.
    async fn stop_task(&self, task_id: &TaskId) -> bool;
}

/// Runs an agent CLI once per attempt.
///
/// The command line is `<binary> [args...] -p <instructions>`, run in the
/// task's worktree. The child is killed when the attempt is stopped or its
/// future is dropped.
#[derive(Debug)]
pub struct CommandAdapter {
    binary: PathBuf,
    args: Vec<String>,
    running: Mutex<HashMap<TaskId, CancellationToken>>,
}

impl CommandAdapter {
    /// Locate `command` on `PATH`.
    ///
    /// # Errors
    ///
    /// [`Error::AdapterNotAvailable`] if the binary cannot be found.
    pub fn detect(command: &str) -> Result<Self> {
        let binary = which::which(command)
            .map_err(|_| Error::AdapterNotAvailable(format!("'{}' not found on PATH", command)))?;
        Ok(Self::with_binary(binary))
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            args: Vec::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Arguments placed before `-p <instructions>`.
    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn binary(&self) -> &std::path::Path {
        &self.binary
    }

    fn register(&self, task: &TaskId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut running) = self.running.lock() {
            running.insert(task.clone(), token.clone());
        }
        token
    }

    fn unregister(&self, task: &TaskId) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(task);
        }
    }
}

#[async_trait]
impl TaskAdapter for CommandAdapter {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute_task(
        &self,
        request: TaskRequest,
        progress: ProgressReporter,
    ) -> Result<TaskResult> {
        debug!(
            task = %request.task_id,
            attempt = request.attempt,
            cwd = %request.working_dir.display(),
            "spawning agent"
        );
        // Registered before the spawn so a stop request never finds a
        // running child without a token.
        let token = self.register(&request.task_id);
        let spawned = Command::new(&self.binary)
            .args(&self.args)
            .arg("-p")
            .arg(&request.instructions)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.unregister(&request.task_id);
                return Err(Error::Adapter(format!(
                    "failed to spawn {}: {}",
                    self.binary.display(),
                    e
                )));
            }
        };
        progress.update(&format!("attempt {} running", request.attempt));

        let outcome = tokio::select! {
            out = child.wait_with_output() => Some(out),
            _ = token.cancelled() => None,
        };
        self.unregister(&request.task_id);

        let Some(output) = outcome else {
            warn!(task = %request.task_id, "agent stopped");
            return Ok(TaskResult::failure("stopped before completion"));
        };
        let output = output?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stdout.is_empty() {
            progress.output(&stdout);
        }

        if output.status.success() {
            Ok(TaskResult::success(stdout))
        } else {
            let error = if stderr.is_empty() {
                format!(
                    "agent exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr
            };
            Ok(TaskResult {
                output: (!stdout.is_empty()).then_some(stdout),
                ..TaskResult::failure(error).with_exit_code(output.status.code())
            })
        }
    }

    async fn stop_task(&self, task_id: &TaskId) -> bool {
        let token = self
            .running
            .lock()
            .ok()
            .and_then(|mut running| running.remove(task_id));
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
