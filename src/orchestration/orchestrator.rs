//! Plan-level state machine.
//!
//! The [`Orchestrator`] owns the [`ExecutionPlan`] for a run and is the only
//! thing that changes task state. Strategies decide *what* to run next;
//! every resulting transition goes through here, which is also where the
//! matching lifecycle event is emitted. Because emission happens at the
//! transition, event order is the causal order of the run.

use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::core::event::{EventBus, EventKind};
use crate::core::plan::{ExecutionPlan, PlanId, PlanStatus};
use crate::core::task::{ExecutionTask, TaskId, TaskState};
use crate::Result;

/// What happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back in `queued` for the given attempt number.
    Retry { attempt: u32 },
    /// Terminally failed.
    Exhausted,
}

pub struct Orchestrator {
    plan: ExecutionPlan,
    events: EventBus,
    continue_on_error: bool,
    halted: bool,
    cancelled: bool,
}

impl Orchestrator {
    pub fn new(plan: ExecutionPlan, events: EventBus, continue_on_error: bool) -> Self {
        Self {
            plan,
            events,
            continue_on_error,
            halted: false,
            cancelled: false,
        }
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan.id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn into_plan(self) -> ExecutionPlan {
        self.plan
    }

    pub fn task(&self, id: &TaskId) -> Result<&ExecutionTask> {
        self.plan.task(id)
    }

    /// True once the run stopped dispatching (failure without
    /// `continue_on_error`, or cancellation).
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn emit(&self, kind: EventKind, task: Option<&TaskId>, payload: serde_json::Value) {
        self.events.emit(kind, self.plan.id, task, payload);
    }

    pub fn emit_layer(&self, kind: EventKind, index: usize, tasks: &[TaskId]) {
        self.emit(kind, None, json!({ "layer": index, "tasks": tasks }));
    }

    pub fn begin(&mut self) {
        self.plan.status = PlanStatus::Running;
        info!(plan = %self.plan.id, tasks = self.plan.total_tasks, "plan started");
        self.emit(
            EventKind::PlanStart,
            None,
            json!({
                "total_tasks": self.plan.total_tasks,
                "layers": self.plan.execution_layers.len(),
                "isolation": self.plan.isolation.to_string(),
            }),
        );
    }

    /// Skip tasks up front. Their dependents are blocked on the next
    /// readiness pass.
    pub fn apply_skip_list(&mut self, skip: &[TaskId]) -> Result<()> {
        for id in skip {
            let task = self.plan.task_mut(id)?;
            if task.state.is_unstarted() {
                task.skip("skipped by request")?;
                self.emit(EventKind::TaskSkip, Some(id), json!({ "reason": "skipped by request" }));
            }
        }
        Ok(())
    }

    /// Promote pending tasks whose requirements all completed, and block
    /// pending tasks with a failed, blocked or skipped requirement. Runs to
    /// a fixpoint so blocking propagates transitively. Returns the tasks
    /// that became ready.
    pub fn refresh_readiness(&mut self) -> Result<Vec<TaskId>> {
        let mut ready = Vec::new();
        loop {
            let mut changed = false;
            let pending: Vec<TaskId> = self
                .plan
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Pending)
                .map(|t| t.id().clone())
                .collect();

            for id in pending {
                let requires = self.plan.task(&id)?.task.requires.clone();
                let mut poisoned = None;
                let mut all_done = true;
                for req in &requires {
                    let state = self.plan.task(req)?.state;
                    if state.poisons_dependents() {
                        poisoned = Some((req.clone(), state));
                        break;
                    }
                    if state != TaskState::Completed {
                        all_done = false;
                    }
                }

                if let Some((req, state)) = poisoned {
                    let reason = format!("required task {} is {}", req, state);
                    self.plan.task_mut(&id)?.block(&reason)?;
                    warn!(task = %id, %reason, "task blocked");
                    self.emit(EventKind::TaskBlocked, Some(&id), json!({ "reason": reason }));
                    changed = true;
                } else if all_done {
                    self.plan.task_mut(&id)?.mark_ready()?;
                    ready.push(id);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Ok(ready)
    }

    /// Ready tasks in id order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.in_state(TaskState::Ready)
    }

    pub fn in_state(&self, state: TaskState) -> Vec<TaskId> {
        self.plan
            .tasks
            .values()
            .filter(|t| t.state == state)
            .map(|t| t.id().clone())
            .collect()
    }

    pub fn queue(&mut self, id: &TaskId) -> Result<()> {
        self.plan.task_mut(id)?.queue()
    }

    /// `queued -> running`: the adapter is about to be invoked.
    pub fn start(
        &mut self,
        id: &TaskId,
        worktree: PathBuf,
        branch: &str,
        base_ref: &str,
    ) -> Result<()> {
        let task = self.plan.task_mut(id)?;
        task.start(Some(worktree.clone()), Some(branch.to_string()))?;
        task.base_ref = Some(base_ref.to_string());
        let attempt = task.attempt();
        info!(task = %id, attempt, branch, "task started");
        self.emit(
            EventKind::TaskStart,
            Some(id),
            json!({
                "attempt": attempt,
                "branch": branch,
                "base": base_ref,
                "worktree": worktree,
            }),
        );
        Ok(())
    }

    pub fn record_success(
        &mut self,
        id: &TaskId,
        commit: Option<String>,
        output: Option<String>,
    ) -> Result<()> {
        let task = self.plan.task_mut(id)?;
        task.complete(commit.clone(), output)?;
        let attempt = task.attempt();
        let duration = task.duration().map(|d| d.as_secs_f64());
        info!(task = %id, attempt, commit = ?commit, "task completed");
        self.emit(
            EventKind::TaskComplete,
            Some(id),
            json!({ "attempt": attempt, "commit": commit, "duration_secs": duration }),
        );
        Ok(())
    }

    /// Record a failed attempt (from `queued` or `running`).
    ///
    /// A retryable failure with budget left goes back to `queued` with the
    /// failure detail appended to its instructions. Otherwise the task
    /// fails terminally: its dependents are blocked, and without
    /// `continue_on_error` the run halts.
    pub fn record_failure(
        &mut self,
        id: &TaskId,
        error: &str,
        exit_code: Option<i32>,
        retryable: bool,
    ) -> Result<RetryDecision> {
        let cancelled = self.cancelled;
        let task = self.plan.task_mut(id)?;
        task.fail(error, exit_code)?;
        let attempt = task.attempt();
        let will_retry = retryable && !cancelled && task.can_retry();
        warn!(task = %id, attempt, will_retry, error, "task attempt failed");
        self.emit(
            EventKind::TaskFail,
            Some(id),
            json!({
                "attempt": attempt,
                "error": error,
                "exit_code": exit_code,
                "will_retry": will_retry,
            }),
        );

        if will_retry {
            let task = self.plan.task_mut(id)?;
            task.retry(error)?;
            let (next, max_retries) = (task.attempt(), task.max_retries);
            self.emit(
                EventKind::TaskRetry,
                Some(id),
                json!({ "attempt": next, "max_retries": max_retries }),
            );
            return Ok(RetryDecision::Retry { attempt: next });
        }

        self.refresh_readiness()?;
        if !self.continue_on_error {
            self.halt(&format!("task {} failed", id))?;
        }
        Ok(RetryDecision::Exhausted)
    }

    /// Stop dispatching: every task that has not started is skipped.
    /// Tasks already queued for dispatch are skipped by
    /// [`Orchestrator::skip_queued`] once the strategy confirms they are
    /// not in flight.
    pub fn halt(&mut self, reason: &str) -> Result<()> {
        if !self.halted {
            info!(plan = %self.plan.id, reason, "run halted");
        }
        self.halted = true;
        let unstarted: Vec<TaskId> = self
            .plan
            .tasks
            .values()
            .filter(|t| t.state.is_unstarted())
            .map(|t| t.id().clone())
            .collect();
        for id in unstarted {
            self.plan.task_mut(&id)?.skip(reason)?;
            self.emit(EventKind::TaskSkip, Some(&id), json!({ "reason": reason }));
        }
        Ok(())
    }

    /// Skip a task that was queued but never handed to the adapter.
    pub fn skip_queued(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        self.plan.task_mut(id)?.skip(reason)?;
        self.emit(EventKind::TaskSkip, Some(id), json!({ "reason": reason }));
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        self.cancelled = true;
        warn!(plan = %self.plan.id, "run cancelled");
        self.halt("run cancelled")
    }

    /// Settle the plan status and emit `plan-complete`.
    ///
    /// Tasks still non-terminal at this point (an internal error cut the
    /// run short) are skipped first.
    pub fn finish(&mut self) -> Result<PlanStatus> {
        let leftover: Vec<TaskId> = self
            .plan
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Pending | TaskState::Ready | TaskState::Queued))
            .map(|t| t.id().clone())
            .collect();
        for id in leftover {
            self.skip_queued(&id, "run ended before dispatch")?;
        }

        let status = if self.cancelled {
            PlanStatus::Cancelled
        } else if self.plan.count_in(TaskState::Completed) == self.plan.total_tasks {
            PlanStatus::Completed
        } else {
            PlanStatus::Failed
        };
        self.plan.status = status;
        info!(plan = %self.plan.id, %status, "plan finished");
        self.emit(
            EventKind::PlanComplete,
            None,
            json!({
                "status": status,
                "completed": self.plan.count_in(TaskState::Completed),
                "failed": self.plan.count_in(TaskState::Failed),
                "blocked": self.plan.count_in(TaskState::Blocked),
                "skipped": self.plan.count_in(TaskState::Skipped),
            }),
        );
        Ok(status)
    }

}
