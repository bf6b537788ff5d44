//! Stack composition and upstream submission.
//!
//! A stack is the chain of per-task branches built by the stacked strategy,
//! each branch parented on the branch of the task it requires. The
//! [`StackBackend`] keeps the run's view of that chain and drives an external
//! stack tool (the Graphite CLI by default) to register branches, restack
//! them and submit them for review.

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::task::TaskId;
use crate::{Error, Result};

/// External tool that manages stacked branches.
#[async_trait]
pub trait StackTool: Send + Sync {
    fn name(&self) -> &str;

    /// Register `branch` as stacked on `parent`.
    async fn track_branch(&self, cwd: &Path, branch: &str, parent: &str) -> Result<()>;

    /// Rebase every tracked branch onto its parent.
    async fn restack(&self, cwd: &Path) -> Result<()>;

    /// Push the stack and open or update review requests. Returns the
    /// tool's combined output.
    async fn submit(&self, cwd: &Path) -> Result<String>;
}

/// The Graphite CLI (`gt`).
#[derive(Debug, Clone)]
pub struct GraphiteCli {
    binary: PathBuf,
}

impl GraphiteCli {
    /// Locate `command` on `PATH`.
    pub fn detect(command: &str) -> Result<Self> {
        let binary = which::which(command)
            .map_err(|_| Error::StackTool(format!("'{}' not found on PATH", command)))?;
        Ok(Self { binary })
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        debug!(tool = %self.binary.display(), ?args, "running stack tool");
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(cwd)
            .kill_on_drop(true)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::StackTool(format!(
                "{} {} exited with {}: {}",
                self.binary.display(),
                args.join(" "),
                output.status.code().unwrap_or(-1),
                detail
            )));
        }
        Ok(format!("{}{}", stdout, stderr))
    }
}

#[async_trait]
impl StackTool for GraphiteCli {
    fn name(&self) -> &str {
        "graphite"
    }

    async fn track_branch(&self, cwd: &Path, branch: &str, parent: &str) -> Result<()> {
        self.run(cwd, &["track", branch, "--parent", parent]).await?;
        Ok(())
    }

    async fn restack(&self, cwd: &Path) -> Result<()> {
        self.run(cwd, &["restack"]).await?;
        Ok(())
    }

    async fn submit(&self, cwd: &Path) -> Result<String> {
        self.run(cwd, &["submit", "--stack", "--no-interactive"]).await
    }
}

/// One branch of the stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackEntry {
    pub task_id: TaskId,
    pub branch: String,
    pub parent_branch: String,
    pub commit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackState {
    pub trunk: String,
    /// In the order tasks were added, which is a dependency order.
    pub entries: Vec<StackEntry>,
}

impl StackState {
    /// Longest parent chain length, counted in branches.
    pub fn depth(&self) -> usize {
        self.entries
            .iter()
            .map(|e| {
                let mut depth = 1;
                let mut parent = &e.parent_branch;
                while let Some(p) = self.entries.iter().find(|x| &x.branch == parent) {
                    depth += 1;
                    parent = &p.parent_branch;
                    if depth > self.entries.len() {
                        break;
                    }
                }
                depth
            })
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResult {
    pub output: String,
    /// Review URLs found in the output, deduplicated in first-seen order.
    pub urls: Vec<String>,
}

pub struct StackBackend {
    tool: Arc<dyn StackTool>,
    repo_root: PathBuf,
    state: Mutex<Option<StackState>>,
}

impl StackBackend {
    pub fn new(tool: Arc<dyn StackTool>, repo_root: &Path) -> Self {
        Self {
            tool,
            repo_root: repo_root.to_path_buf(),
            state: Mutex::new(None),
        }
    }

    pub fn tool_name(&self) -> &str {
        self.tool.name()
    }

    /// Start a fresh stack rooted at `trunk`.
    pub async fn initialize_stack_state(&self, trunk: &str) {
        info!(trunk, tool = self.tool.name(), "initializing stack");
        *self.state.lock().await = Some(StackState {
            trunk: trunk.to_string(),
            entries: Vec::new(),
        });
    }

    /// Register a committed task branch with the tool and record it. A
    /// task that is added again (after a retry) replaces its old entry.
    pub async fn add_task_to_stack(&self, entry: StackEntry) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::StackTool("stack state not initialized".into()))?;
        self.tool
            .track_branch(&self.repo_root, &entry.branch, &entry.parent_branch)
            .await?;
        debug!(task = %entry.task_id, branch = %entry.branch, parent = %entry.parent_branch, "branch stacked");
        state.entries.retain(|e| e.task_id != entry.task_id);
        state.entries.push(entry);
        Ok(())
    }

    pub async fn restack(&self) -> Result<()> {
        if self.state.lock().await.is_none() {
            return Err(Error::StackTool("stack state not initialized".into()));
        }
        self.tool.restack(&self.repo_root).await
    }

    pub async fn get_stack_info(&self) -> Option<StackState> {
        self.state.lock().await.clone()
    }

    pub async fn submit_stack(&self) -> Result<SubmitResult> {
        let entries = self
            .state
            .lock()
            .await
            .as_ref()
            .map(|s| s.entries.len())
            .unwrap_or(0);
        if entries == 0 {
            return Err(Error::StackTool("no branches to submit".into()));
        }
        info!(branches = entries, "submitting stack");
        let output = self.tool.submit(&self.repo_root).await?;
        let urls = parse_submit_output(&output);
        info!(urls = urls.len(), "stack submitted");
        Ok(SubmitResult { output, urls })
    }
}

impl std::fmt::Debug for StackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackBackend")
            .field("tool", &self.tool.name())
            .field("repo_root", &self.repo_root)
            .finish()
    }
}

/// Any http(s) URL, stopping at whitespace, quotes and brackets.
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'()\[\]]+"#).unwrap());

/// Review-request path shapes used by common forges.
static REVIEW_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(pull|pulls|merge_requests|pr)/\d+").unwrap());

/// Extract review URLs from stack tool output.
///
/// A URL counts when its line carries a `Pull Request:` or `PR:` marker,
/// or when the URL itself has a review-request shape (`/pull/N`,
/// `/merge_requests/N`, `/pr/N`).
pub fn parse_submit_output(output: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for line in output.lines() {
        let lower = line.to_ascii_lowercase();
        let marked = lower.contains("pull request:") || lower.contains("pr:");
        for m in URL_RE.find_iter(line) {
            let url = m.as_str().trim_end_matches(['.', ',', ';', ':']);
            if (marked || REVIEW_PATH_RE.is_match(url)) && !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        }
    }
    urls
}
