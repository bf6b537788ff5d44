//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A scripted task adapter that edits files instead of running an agent
//! - A stack tool that records calls instead of shelling out

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use stackwise::config::RunOptions;
use stackwise::core::event::{EventBus, ExecutionEvent};
use stackwise::core::task::{Task, TaskId};
use stackwise::git::GitOps;
use stackwise::isolation::{IsolationEngine, StackBackend, StackTool};
use stackwise::orchestration::{
    run_plan, ProgressReporter, RunReport, Services, TaskAdapter, TaskRequest, TaskResult,
};
use stackwise::Result;

pub const BRANCH_PREFIX: &str = "sw";

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
    /// Separate directory that holds task worktrees.
    pub worktrees: TempDir,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let worktrees = TempDir::new().expect("Failed to create worktree directory");
        let path = temp_dir.path().to_path_buf();

        let repo = Self {
            temp_dir,
            path,
            worktrees,
        };
        repo.git(&["init"]);
        repo.git(&["config", "user.email", "test@test.com"]);
        repo.git(&["config", "user.name", "Test User"]);
        repo.git(&["config", "commit.gpgsign", "false"]);

        std::fs::write(repo.path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-m", "Initial commit"]);
        repo
    }

    /// Run git in the repository and return trimmed stdout. Panics on failure.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Whether a git command exits successfully.
    pub fn git_ok(&self, args: &[&str]) -> bool {
        Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn head_branch(&self) -> String {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn head_commit(&self) -> String {
        self.git(&["rev-parse", "HEAD"])
    }

    pub fn rev_parse(&self, rev: &str) -> String {
        self.git(&["rev-parse", rev])
    }

    /// Contents of `file` at `rev`, if it exists there.
    pub fn show(&self, rev: &str, file: &str) -> Option<String> {
        let spec = format!("{}:{}", rev, file);
        if !self.git_ok(&["cat-file", "-e", &spec]) {
            return None;
        }
        Some(self.git(&["show", &spec]))
    }

    /// Branches created under the test prefix.
    pub fn task_branches(&self) -> Vec<String> {
        self.git(&[
            "for-each-ref",
            "--format=%(refname:short)",
            &format!("refs/heads/{}/", BRANCH_PREFIX),
        ])
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// Number of worktrees git knows about, the main checkout included.
    pub fn worktree_count(&self) -> usize {
        self.git(&["worktree", "list", "--porcelain"])
            .lines()
            .filter(|l| l.starts_with("worktree "))
            .count()
    }

    /// Directories left under the worktree root, one level below the plan
    /// directories.
    pub fn leftover_worktree_dirs(&self) -> Vec<PathBuf> {
        let mut left = Vec::new();
        let Ok(plans) = std::fs::read_dir(self.worktrees.path()) else {
            return left;
        };
        for plan in plans.flatten() {
            if let Ok(entries) = std::fs::read_dir(plan.path()) {
                left.extend(entries.flatten().map(|e| e.path()));
            }
        }
        left
    }

    pub fn engine(&self) -> IsolationEngine {
        let git = GitOps::new(&self.path).expect("Failed to open repository");
        IsolationEngine::new(git, self.worktrees.path(), BRANCH_PREFIX)
    }

    pub fn stacked_engine(&self, tool: Arc<RecordingStackTool>) -> IsolationEngine {
        let backend = StackBackend::new(tool, &self.path);
        self.engine().with_stack(Arc::new(backend))
    }
}

/// What the scripted adapter does for one task.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Attempts up to and including this one report failure.
    pub fail_times: u32,
    /// Files to write, relative to the working directory. Defaults to
    /// `<task id>.txt` holding the task title.
    pub files: Vec<(String, String)>,
    /// Time spent "working" before acting.
    pub delay: Option<Duration>,
    /// Succeed without touching the working copy.
    pub no_changes: bool,
}

impl Script {
    pub fn failing(times: u32) -> Self {
        Self {
            fail_times: times,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn writes(file: &str, contents: &str) -> Self {
        Self {
            files: vec![(file.to_string(), contents.to_string())],
            ..Self::default()
        }
    }
}

/// Adapter that follows a per-task [`Script`] and records every request.
#[derive(Default)]
pub struct MockAdapter {
    scripts: Mutex<HashMap<TaskId, Script>>,
    calls: Mutex<Vec<TaskRequest>>,
    stops: Mutex<Vec<TaskId>>,
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, task: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(TaskId::from(task), script);
        self
    }

    pub fn calls(&self) -> Vec<TaskRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task: &str) -> Vec<TaskRequest> {
        self.calls()
            .into_iter()
            .filter(|r| r.task_id.as_str() == task)
            .collect()
    }

    pub fn stops(&self) -> Vec<TaskId> {
        self.stops.lock().unwrap().clone()
    }

    /// Highest number of attempts observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute_task(
        &self,
        request: TaskRequest,
        progress: ProgressReporter,
    ) -> Result<TaskResult> {
        self.calls.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.task_id)
            .cloned()
            .unwrap_or_default();
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap()
            .insert(request.task_id.clone(), token.clone());

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        progress.update("working");

        let stopped = match script.delay {
            Some(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = token.cancelled() => true,
            },
            // Yield so sibling attempts overlap.
            None => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                false
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);

        if stopped {
            return Ok(TaskResult::failure("stopped before completion"));
        }
        if request.attempt <= script.fail_times {
            return Ok(TaskResult::failure(format!(
                "scripted failure on attempt {}",
                request.attempt
            ))
            .with_exit_code(Some(2)));
        }
        if !script.no_changes {
            let files = if script.files.is_empty() {
                vec![(format!("{}.txt", request.task_id), request.title.clone())]
            } else {
                script.files.clone()
            };
            for (file, contents) in files {
                let path = request.working_dir.join(&file);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, contents)?;
            }
        }
        progress.output("done");
        Ok(TaskResult::success(format!("{} done", request.task_id)))
    }

    async fn stop_task(&self, task_id: &TaskId) -> bool {
        self.stops.lock().unwrap().push(task_id.clone());
        match self.tokens.lock().unwrap().remove(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Calls the stack tool received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCall {
    Track { branch: String, parent: String },
    Restack,
    Submit,
}

/// Stack tool that records calls and answers `submit` with canned output.
#[derive(Default)]
pub struct RecordingStackTool {
    calls: Mutex<Vec<StackCall>>,
    submit_output: String,
    fail_submit: bool,
}

impl RecordingStackTool {
    pub fn new(submit_output: &str) -> Self {
        Self {
            submit_output: submit_output.to_string(),
            ..Self::default()
        }
    }

    pub fn failing_submit() -> Self {
        Self {
            fail_submit: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<StackCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StackTool for RecordingStackTool {
    fn name(&self) -> &str {
        "recording"
    }

    async fn track_branch(&self, _cwd: &Path, branch: &str, parent: &str) -> Result<()> {
        self.calls.lock().unwrap().push(StackCall::Track {
            branch: branch.to_string(),
            parent: parent.to_string(),
        });
        Ok(())
    }

    async fn restack(&self, _cwd: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(StackCall::Restack);
        Ok(())
    }

    async fn submit(&self, _cwd: &Path) -> Result<String> {
        self.calls.lock().unwrap().push(StackCall::Submit);
        if self.fail_submit {
            return Err(stackwise::Error::StackTool("remote rejected push".into()));
        }
        Ok(self.submit_output.clone())
    }
}

/// Run `tasks` against `engine` and collect the report plus every event.
pub async fn run_with(
    engine: IsolationEngine,
    adapter: Arc<MockAdapter>,
    tasks: Vec<Task>,
    options: &RunOptions,
) -> (Result<RunReport>, Vec<ExecutionEvent>, Services) {
    run_with_cancel(engine, adapter, tasks, options, CancellationToken::new()).await
}

pub async fn run_with_cancel(
    engine: IsolationEngine,
    adapter: Arc<MockAdapter>,
    tasks: Vec<Task>,
    options: &RunOptions,
    cancel: CancellationToken,
) -> (Result<RunReport>, Vec<ExecutionEvent>, Services) {
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let services = Services::new(engine, adapter, events);
    let report = run_plan(tasks, options, &services, cancel).await;

    let mut collected = Vec::new();
    while let Ok(event) = rx.try_recv() {
        collected.push(event);
    }
    (report, collected, services)
}

/// Options with a short timeout suitable for tests.
pub fn options() -> RunOptions {
    RunOptions {
        timeout: Duration::from_secs(30),
        max_retries: 0,
        ..RunOptions::default()
    }
}

/// A diamond on disjoint files: T1, then T2 and T3, then T4.
pub fn diamond_tasks() -> Vec<Task> {
    vec![
        Task::new("T1", "User model").with_produces(&["src/user.rs"]),
        Task::new("T2", "User API")
            .with_requires(&["T1"])
            .with_produces(&["src/api.rs"]),
        Task::new("T3", "User tests")
            .with_requires(&["T1"])
            .with_produces(&["tests/user.rs"]),
        Task::new("T4", "Docs")
            .with_requires(&["T2", "T3"])
            .with_produces(&["docs/user.md"]),
    ]
}
