//! Per-task working copies and the branch/commit primitives around them.
//!
//! Every task attempt gets its own git worktree on its own branch under
//! `<worktrees_root>/<plan>/<task>-a<attempt>`. Branch creation and worktree
//! registration mutate the repository's shared ref namespace, so they go
//! through one async mutex; everything else (the agent editing files,
//! committing on a worktree's own HEAD) runs concurrently.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::core::plan::PlanId;
use crate::core::task::TaskId;
use crate::git::GitOps;
use crate::isolation::stack::{StackBackend, StackEntry};
use crate::util::{blocking, sanitize_ref_component};
use crate::{Error, Result};

/// A working copy created for one task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeContext {
    pub task_id: TaskId,
    pub branch_name: String,
    /// Ref the branch was created from (a branch name or commit).
    pub base_ref: String,
    /// Commit `base_ref` resolved to at creation time.
    pub base_commit: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub attempt: u32,
    /// False for in-place contexts pointing at the main checkout; those
    /// are never removed.
    pub managed: bool,
}

/// `<prefix>/<plan short id>/<task id>`, made ref-safe.
pub fn task_branch_name(prefix: &str, plan: &PlanId, task: &TaskId) -> String {
    format!(
        "{}/{}/{}",
        prefix.trim_matches('/'),
        plan.short(),
        sanitize_ref_component(task.as_str())
    )
}

/// Owns every worktree a run creates.
pub struct IsolationEngine {
    git: GitOps,
    worktrees_root: PathBuf,
    branch_prefix: String,
    ref_lock: tokio::sync::Mutex<()>,
    live: Mutex<BTreeMap<PathBuf, WorktreeContext>>,
    stack: Option<Arc<StackBackend>>,
}

impl IsolationEngine {
    pub fn new(git: GitOps, worktrees_root: &Path, branch_prefix: &str) -> Self {
        Self {
            git,
            worktrees_root: worktrees_root.to_path_buf(),
            branch_prefix: branch_prefix.trim_matches('/').to_string(),
            ref_lock: tokio::sync::Mutex::new(()),
            live: Mutex::new(BTreeMap::new()),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: Arc<StackBackend>) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    pub fn stack(&self) -> Option<&Arc<StackBackend>> {
        self.stack.as_ref()
    }

    pub fn worktrees_root(&self) -> &Path {
        &self.worktrees_root
    }

    pub fn branch_name(&self, plan: &PlanId, task: &TaskId) -> String {
        task_branch_name(&self.branch_prefix, plan, task)
    }

    pub fn worktree_path(&self, plan: &PlanId, task: &TaskId, attempt: u32) -> PathBuf {
        self.worktrees_root.join(plan.short()).join(format!(
            "{}-a{}",
            sanitize_ref_component(task.as_str()),
            attempt
        ))
    }

    fn worktree_name(plan: &PlanId, task: &TaskId, attempt: u32) -> String {
        format!(
            "{}-{}-a{}",
            plan.short(),
            sanitize_ref_component(task.as_str()),
            attempt
        )
    }

    /// Number of managed worktrees not yet cleaned up.
    pub fn live_count(&self) -> usize {
        self.live
            .lock()
            .map(|live| live.values().filter(|c| c.managed).count())
            .unwrap_or(0)
    }

    pub fn live_contexts(&self) -> Vec<WorktreeContext> {
        self.live
            .lock()
            .map(|live| live.values().cloned().collect())
            .unwrap_or_default()
    }

    fn register(&self, ctx: &WorktreeContext) {
        if let Ok(mut live) = self.live.lock() {
            live.insert(ctx.path.clone(), ctx.clone());
        }
    }

    fn unregister(&self, path: &Path) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(path);
        }
    }

    /// Create (or reset) the task's branch at `parent_ref` and check it out
    /// into a fresh worktree for `attempt`.
    ///
    /// Any worktree still registered for the same task is removed first so
    /// the branch is free to move.
    pub async fn create_worktree(
        &self,
        plan: &PlanId,
        task: &TaskId,
        parent_ref: &str,
        attempt: u32,
    ) -> Result<WorktreeContext> {
        let stale: Vec<WorktreeContext> = self
            .live_contexts()
            .into_iter()
            .filter(|c| &c.task_id == task && c.managed)
            .collect();
        self.cleanup_worktrees(&stale).await;

        let branch = self.branch_name(plan, task);
        let path = self.worktree_path(plan, task, attempt);
        let name = Self::worktree_name(plan, task, attempt);

        let _guard = self.ref_lock.lock().await;
        let git = self.git.clone();
        let (b, p, parent) = (branch.clone(), path.clone(), parent_ref.to_string());
        let base_commit = blocking(move || {
            if p.exists() {
                git.remove_worktree(&p)?;
            }
            let commit = git.create_branch(&b, &parent, true)?;
            git.add_worktree(&name, &b, &p)?;
            Ok(commit)
        })
        .await?;

        let ctx = WorktreeContext {
            task_id: task.clone(),
            branch_name: branch,
            base_ref: parent_ref.to_string(),
            base_commit,
            path,
            created_at: Utc::now(),
            attempt,
            managed: true,
        };
        info!(task = %task, branch = %ctx.branch_name, base = %ctx.base_ref, path = %ctx.path.display(), "worktree created");
        self.register(&ctx);
        Ok(ctx)
    }

    /// Worktrees for several independent tasks from one parent ref. If any
    /// creation fails, the ones already created are removed and the error
    /// is returned.
    pub async fn create_worktrees_for_tasks(
        &self,
        plan: &PlanId,
        tasks: &[TaskId],
        parent_ref: &str,
    ) -> Result<Vec<WorktreeContext>> {
        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.create_worktree(plan, task, parent_ref, 1).await {
                Ok(ctx) => created.push(ctx),
                Err(e) => {
                    self.cleanup_worktrees(&created).await;
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    /// Context for running in the main checkout on its current branch.
    pub async fn in_place(&self, task: &TaskId, attempt: u32) -> Result<WorktreeContext> {
        let git = self.git.clone();
        let (branch, commit) = blocking(move || Ok((git.current_head()?, git.head_commit()?))).await?;
        let ctx = WorktreeContext {
            task_id: task.clone(),
            branch_name: branch.clone(),
            base_ref: branch,
            base_commit: commit,
            path: self.git.repo_path().to_path_buf(),
            created_at: Utc::now(),
            attempt,
            managed: false,
        };
        self.register(&ctx);
        Ok(ctx)
    }

    /// Create a branch without a worktree. Fails if it already exists.
    pub async fn create_stack_branch(&self, name: &str, parent_ref: &str) -> Result<String> {
        let _guard = self.ref_lock.lock().await;
        let git = self.git.clone();
        let (name, parent) = (name.to_string(), parent_ref.to_string());
        blocking(move || git.create_branch(&name, &parent, false)).await
    }

    /// Apply another branch's commit on top of the worktree's HEAD.
    pub async fn cherry_pick_into(&self, ctx: &WorktreeContext, commit: &str) -> Result<String> {
        let git = self.git.clone();
        let (path, commit) = (ctx.path.clone(), commit.to_string());
        blocking(move || git.cherry_pick(&path, &commit)).await
    }

    /// Commit everything in the worktree on the task branch.
    pub async fn commit_task_changes(&self, ctx: &WorktreeContext, message: &str) -> Result<String> {
        let git = self.git.clone();
        let (path, message) = (ctx.path.clone(), message.to_string());
        let commit = blocking(move || git.commit_all(&path, &message)).await?;
        debug!(task = %ctx.task_id, commit = %commit, "task changes committed");
        Ok(commit)
    }

    /// Commit, then register the branch with the stack on `parent_branch`.
    /// A branch with nothing to commit is still registered at its current
    /// head so branches stacked on it keep a tracked parent; that case
    /// returns `None`.
    pub async fn commit_in_stack(
        &self,
        ctx: &WorktreeContext,
        message: &str,
        parent_branch: &str,
    ) -> Result<Option<String>> {
        let commit = match self.commit_task_changes(ctx, message).await {
            Ok(commit) => Some(commit),
            Err(Error::NothingToCommit { .. }) => None,
            Err(e) => return Err(e),
        };
        if let Some(stack) = &self.stack {
            let head = match &commit {
                Some(commit) => commit.clone(),
                None => {
                    let git = self.git.clone();
                    let branch = ctx.branch_name.clone();
                    blocking(move || git.branch_head(&branch)).await?
                }
            };
            stack
                .add_task_to_stack(StackEntry {
                    task_id: ctx.task_id.clone(),
                    branch: ctx.branch_name.clone(),
                    parent_branch: parent_branch.to_string(),
                    commit: head,
                })
                .await?;
        }
        Ok(commit)
    }

    /// Force-remove worktrees. Failures are logged, never returned.
    pub async fn cleanup_worktrees(&self, contexts: &[WorktreeContext]) -> usize {
        let mut removed = 0;
        for ctx in contexts {
            self.unregister(&ctx.path);
            if !ctx.managed {
                continue;
            }
            let git = self.git.clone();
            let path = ctx.path.clone();
            match blocking(move || git.remove_worktree(&path)).await {
                Ok(()) => {
                    removed += 1;
                    debug!(task = %ctx.task_id, path = %ctx.path.display(), "worktree removed");
                }
                Err(e) => {
                    warn!(task = %ctx.task_id, path = %ctx.path.display(), error = %e, "worktree cleanup failed");
                }
            }
        }
        removed
    }

    /// Remove every worktree this engine still tracks.
    pub async fn cleanup_all(&self) -> usize {
        let contexts = self.live_contexts();
        if contexts.is_empty() {
            return 0;
        }
        let removed = self.cleanup_worktrees(&contexts).await;
        info!(removed, "cleaned up remaining worktrees");
        removed
    }

    /// Remove registered worktrees under the worktree root left behind by
    /// earlier runs, then prune dangling registrations.
    pub async fn prune_stale(&self) -> Result<usize> {
        let git = self.git.clone();
        let root = self.worktrees_root.clone();
        blocking(move || {
            let mut removed = 0;
            for entry in git.list_worktrees()? {
                if entry.path.starts_with(&root) {
                    match git.remove_worktree(&entry.path) {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(path = %entry.path.display(), error = %e, "could not remove stale worktree"),
                    }
                }
            }
            Ok(removed + git.prune_worktrees()?)
        })
        .await
    }
}

impl std::fmt::Debug for IsolationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationEngine")
            .field("repo", &self.git.repo_path())
            .field("worktrees_root", &self.worktrees_root)
            .field("live", &self.live_count())
            .finish()
    }
}
