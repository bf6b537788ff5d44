//! The dispatch loop shared by every strategy.
//!
//! One driver owns the [`Orchestrator`] and a `FuturesUnordered` of
//! in-flight work. Each task attempt runs as two futures: *prepare*
//! (create the worktree, cherry-pick secondary parents) and *attempt* (run
//! the adapter under a timeout, then commit). Both report back to the
//! driver, which performs every state transition, so state changes and
//! their events happen in one place and in causal order.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::event::EventKind;
use crate::core::plan::PlanId;
use crate::core::task::{TaskId, TaskState};
use crate::error::{Error, Result};
use crate::isolation::worktree::{IsolationEngine, WorktreeContext};
use crate::orchestration::adapter::{ProgressReporter, TaskAdapter, TaskRequest};
use crate::orchestration::orchestrator::{Orchestrator, RetryDecision};
use crate::orchestration::runner::Services;
use crate::orchestration::strategy::{primary_parent, stack_picks};

/// When tasks may be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Only tasks of the current layer; the next layer starts when every
    /// task of this one is terminal.
    Layered,
    /// Any task whose requirements completed.
    Dynamic,
}

/// Which ref a task branch starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// The run's trunk commit.
    Trunk,
    /// The branch of the task's primary parent; trunk for root tasks.
    Stacked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchProfile {
    pub barrier: Barrier,
    pub topology: Topology,
    /// Upper bound on attempts in flight.
    pub workers: usize,
    /// Run in the main checkout instead of worktrees.
    pub in_place: bool,
}

/// Per-run inputs for the dispatch loop.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Trunk branch name, used as the stack root.
    pub trunk: String,
    /// Commit trunk pointed at when the run started.
    pub trunk_commit: String,
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub cancel: CancellationToken,
}

struct Prepared {
    ctx: WorktreeContext,
    /// Branch the task branch is stacked on.
    parent_branch: String,
}

enum AttemptOutcome {
    Success {
        commit: Option<String>,
        output: Option<String>,
    },
    Failure {
        error: String,
        exit_code: Option<i32>,
    },
}

enum Step {
    Prepared {
        task: TaskId,
        result: Result<Prepared>,
    },
    Finished {
        task: TaskId,
        ctx: WorktreeContext,
        outcome: AttemptOutcome,
    },
}

/// Where a task's attempt starts from.
struct Base {
    base_ref: String,
    parent_branch: String,
    picks: Vec<String>,
}

pub struct Dispatcher<'a> {
    orch: &'a mut Orchestrator,
    services: &'a Services,
    profile: DispatchProfile,
    ctx: RunContext,
    inflight: FuturesUnordered<BoxFuture<'static, Step>>,
    /// Tasks with a prepare or attempt future in flight.
    active: BTreeSet<TaskId>,
    /// Tasks whose adapter is running.
    running: BTreeSet<TaskId>,
    /// Worktrees created and not yet cleaned up by this dispatcher.
    created: Vec<WorktreeContext>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        orch: &'a mut Orchestrator,
        services: &'a Services,
        profile: DispatchProfile,
        ctx: RunContext,
    ) -> Self {
        Self {
            orch,
            services,
            profile,
            ctx,
            inflight: FuturesUnordered::new(),
            active: BTreeSet::new(),
            running: BTreeSet::new(),
            created: Vec::new(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        debug!(profile = ?self.profile, "dispatch starting");
        let result = match self.profile.barrier {
            Barrier::Layered => self.run_layers().await,
            Barrier::Dynamic => self.pump(None).await,
        };
        let leftover = std::mem::take(&mut self.created);
        self.services.isolation.cleanup_worktrees(&leftover).await;
        result
    }

    async fn run_layers(&mut self) -> Result<()> {
        let layers = self.orch.plan().execution_layers.clone();
        for (index, layer) in layers.iter().enumerate() {
            if self.ctx.cancel.is_cancelled() && !self.orch.is_cancelled() {
                self.on_cancel().await?;
            }
            if self.orch.is_halted() {
                break;
            }
            self.orch.emit_layer(EventKind::LayerStart, index, layer);
            let scope: BTreeSet<TaskId> = layer.iter().cloned().collect();
            let result = self.pump(Some(&scope)).await;

            let contexts = std::mem::take(&mut self.created);
            self.services.isolation.cleanup_worktrees(&contexts).await;
            result?;
            self.orch.emit_layer(EventKind::LayerComplete, index, layer);
        }
        Ok(())
    }

    /// Dispatch and collect until nothing in `scope` is runnable and
    /// nothing is in flight.
    async fn pump(&mut self, scope: Option<&BTreeSet<TaskId>>) -> Result<()> {
        let cancel = self.ctx.cancel.clone();
        loop {
            if cancel.is_cancelled() && !self.orch.is_cancelled() {
                self.on_cancel().await?;
            }
            if self.orch.is_halted() {
                self.skip_waiting()?;
            } else {
                self.dispatch(scope)?;
            }
            if self.inflight.is_empty() {
                return Ok(());
            }

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !self.orch.is_cancelled() => None,
                step = self.inflight.next() => step,
            };
            if let Some(step) = step {
                self.handle(step).await?;
            }
        }
    }

    fn dispatch(&mut self, scope: Option<&BTreeSet<TaskId>>) -> Result<()> {
        let in_scope = |id: &TaskId| scope.map_or(true, |s| s.contains(id));
        self.orch.refresh_readiness()?;

        // Retries waiting for a worker go first.
        let mut candidates: Vec<TaskId> = self
            .orch
            .in_state(TaskState::Queued)
            .into_iter()
            .filter(|id| in_scope(id) && !self.active.contains(id))
            .collect();
        candidates.extend(self.orch.ready_tasks().into_iter().filter(|id| in_scope(id)));

        for id in candidates {
            if self.active.len() >= self.profile.workers {
                break;
            }
            if self.orch.task(&id)?.state == TaskState::Ready {
                self.orch.queue(&id)?;
            }
            self.launch_prepare(id)?;
        }
        Ok(())
    }

    fn base_for(&self, id: &TaskId) -> Result<Base> {
        let trunk = Base {
            base_ref: self.ctx.trunk_commit.clone(),
            parent_branch: self.ctx.trunk.clone(),
            picks: Vec::new(),
        };
        if self.profile.topology == Topology::Trunk {
            return Ok(trunk);
        }
        let plan = self.orch.plan();
        let Some(primary) = primary_parent(plan, id) else {
            return Ok(trunk);
        };
        let branch = plan.task(&primary)?.branch_name.clone().ok_or_else(|| {
            Error::Validation(format!("required task {} has no branch", primary))
        })?;
        let mut picks = Vec::new();
        for task in stack_picks(plan, id) {
            if let Some(commit) = &plan.task(&task)?.commit_hash {
                picks.push(commit.clone());
            }
        }
        Ok(Base {
            base_ref: branch.clone(),
            parent_branch: branch,
            picks,
        })
    }

    fn launch_prepare(&mut self, id: TaskId) -> Result<()> {
        let attempt = self.orch.task(&id)?.attempt();
        let base = self.base_for(&id)?;
        let engine = self.services.isolation.clone();
        let plan_id = self.orch.plan_id();
        let in_place = self.profile.in_place;
        debug!(task = %id, attempt, base = %base.base_ref, "preparing attempt");

        self.active.insert(id.clone());
        self.inflight.push(
            async move {
                let result = prepare(engine, plan_id, &id, attempt, base, in_place).await;
                Step::Prepared { task: id, result }
            }
            .boxed(),
        );
        Ok(())
    }

    fn launch_attempt(&mut self, id: TaskId, prepared: Prepared) -> Result<()> {
        let exec = self.orch.task(&id)?;
        let request = TaskRequest {
            task_id: id.clone(),
            title: exec.task.title.clone(),
            description: exec.task.description.clone(),
            instructions: exec.instructions.clone(),
            working_dir: prepared.ctx.path.clone(),
            branch_name: prepared.ctx.branch_name.clone(),
            attempt: exec.attempt(),
            touches: exec.task.touches.clone(),
            produces: exec.task.produces.clone(),
        };
        let message = format!("{}: {}", id, exec.task.title);
        let progress =
            ProgressReporter::new(self.orch.events().clone(), self.orch.plan_id(), id.clone());
        let adapter = self.services.adapter.clone();
        let engine = self.services.isolation.clone();
        let limit = self.ctx.timeout;

        self.running.insert(id.clone());
        self.inflight.push(
            async move {
                let outcome =
                    run_attempt(adapter, engine, request, progress, &prepared, limit, message)
                        .await;
                Step::Finished {
                    task: id,
                    ctx: prepared.ctx,
                    outcome,
                }
            }
            .boxed(),
        );
        Ok(())
    }

    async fn handle(&mut self, step: Step) -> Result<()> {
        match step {
            Step::Prepared {
                task,
                result: Ok(prepared),
            } => {
                self.created.push(prepared.ctx.clone());
                if self.orch.is_halted() {
                    self.active.remove(&task);
                    self.release(&prepared.ctx).await;
                    return self.orch.skip_queued(&task, "run stopped before dispatch");
                }
                self.orch.start(
                    &task,
                    prepared.ctx.path.clone(),
                    &prepared.ctx.branch_name,
                    &prepared.ctx.base_ref,
                )?;
                self.launch_attempt(task, prepared)
            }
            Step::Prepared {
                task,
                result: Err(e),
            } => {
                self.active.remove(&task);
                error!(task = %task, error = %e, "could not prepare working copy");
                self.orch.record_failure(&task, &e.to_string(), None, false)?;
                Ok(())
            }
            Step::Finished { task, ctx, outcome } => {
                self.active.remove(&task);
                self.running.remove(&task);
                let terminal = match outcome {
                    AttemptOutcome::Success { commit, output } => {
                        self.orch.record_success(&task, commit, output)?;
                        true
                    }
                    AttemptOutcome::Failure { error, exit_code } => {
                        let retryable = !self.orch.is_halted();
                        let decision =
                            self.orch.record_failure(&task, &error, exit_code, retryable)?;
                        decision == RetryDecision::Exhausted
                    }
                };
                if terminal && self.profile.barrier == Barrier::Dynamic {
                    self.release(&ctx).await;
                }
                Ok(())
            }
        }
    }

    /// Clean up one worktree now instead of at the end of the layer.
    async fn release(&mut self, ctx: &WorktreeContext) {
        self.created.retain(|c| c.path != ctx.path);
        self.services
            .isolation
            .cleanup_worktrees(std::slice::from_ref(ctx))
            .await;
    }

    fn skip_waiting(&mut self) -> Result<()> {
        let waiting: Vec<TaskId> = self
            .orch
            .in_state(TaskState::Queued)
            .into_iter()
            .filter(|id| !self.active.contains(id))
            .collect();
        for id in waiting {
            self.orch.skip_queued(&id, "run stopped before dispatch")?;
        }
        Ok(())
    }

    async fn on_cancel(&mut self) -> Result<()> {
        self.orch.cancel()?;
        for id in self.running.clone() {
            let stopped = self.services.adapter.stop_task(&id).await;
            debug!(task = %id, stopped, "stop requested");
        }
        Ok(())
    }
}

async fn prepare(
    engine: Arc<IsolationEngine>,
    plan_id: PlanId,
    task: &TaskId,
    attempt: u32,
    base: Base,
    in_place: bool,
) -> Result<Prepared> {
    if in_place {
        let ctx = engine.in_place(task, attempt).await?;
        let parent_branch = ctx.branch_name.clone();
        return Ok(Prepared { ctx, parent_branch });
    }

    let ctx = engine
        .create_worktree(&plan_id, task, &base.base_ref, attempt)
        .await?;
    for commit in &base.picks {
        if let Err(e) = engine.cherry_pick_into(&ctx, commit).await {
            engine.cleanup_worktrees(std::slice::from_ref(&ctx)).await;
            return Err(e);
        }
    }
    Ok(Prepared {
        ctx,
        parent_branch: base.parent_branch,
    })
}

async fn run_attempt(
    adapter: Arc<dyn TaskAdapter>,
    engine: Arc<IsolationEngine>,
    request: TaskRequest,
    progress: ProgressReporter,
    prepared: &Prepared,
    limit: Duration,
    message: String,
) -> AttemptOutcome {
    let task_id = request.task_id.clone();
    let result = match tokio::time::timeout(limit, adapter.execute_task(request, progress)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            return AttemptOutcome::Failure {
                error: e.to_string(),
                exit_code: None,
            }
        }
        Err(_) => {
            adapter.stop_task(&task_id).await;
            return AttemptOutcome::Failure {
                error: Error::Timeout(limit).to_string(),
                exit_code: None,
            };
        }
    };

    if !result.is_success() {
        return AttemptOutcome::Failure {
            error: result.failure_detail(),
            exit_code: result.exit_code,
        };
    }

    match engine
        .commit_in_stack(&prepared.ctx, &message, &prepared.parent_branch)
        .await
    {
        Ok(Some(commit)) => AttemptOutcome::Success {
            commit: Some(commit),
            output: result.output,
        },
        Ok(None) => {
            warn!(task = %task_id, "adapter succeeded without changes; nothing committed");
            AttemptOutcome::Success {
                commit: None,
                output: result.output,
            }
        }
        Err(e) => AttemptOutcome::Failure {
            error: format!("commit failed: {}", e),
            exit_code: None,
        },
    }
}
