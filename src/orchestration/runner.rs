//! Entry points for a whole run: validate, plan, execute, report.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RunOptions;
use crate::core::dag::{self, PlanMetrics, TaskGraph};
use crate::core::event::EventBus;
use crate::core::plan::{ExecutionPlan, IsolationMode, PlanId, PlanStatus};
use crate::core::task::{Task, TaskId, TaskState};
use crate::error::{Error, Result};
use crate::isolation::stack::{StackBackend, StackState, SubmitResult};
use crate::isolation::worktree::IsolationEngine;
use crate::orchestration::adapter::TaskAdapter;
use crate::orchestration::dispatch::RunContext;
use crate::orchestration::orchestrator::Orchestrator;
use crate::orchestration::strategy::{ExecutionStrategy, PreviewEntry};
use crate::util::blocking;

/// Collaborators for one run, passed explicitly.
#[derive(Clone)]
pub struct Services {
    pub isolation: Arc<IsolationEngine>,
    pub adapter: Arc<dyn TaskAdapter>,
    pub events: EventBus,
}

impl Services {
    pub fn new(isolation: IsolationEngine, adapter: Arc<dyn TaskAdapter>, events: EventBus) -> Self {
        Self {
            isolation: Arc::new(isolation),
            adapter,
            events,
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("isolation", &self.isolation)
            .field("adapter", &self.adapter.name())
            .finish()
    }
}

/// Final state of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub title: String,
    pub state: TaskState,
    pub attempts: u32,
    pub branch: Option<String>,
    pub base_ref: Option<String>,
    pub commit: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub duration_secs: Option<f64>,
}

/// Outcome of [`run_plan`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan_id: PlanId,
    pub strategy: ExecutionStrategy,
    pub isolation: IsolationMode,
    pub status: PlanStatus,
    pub layers: Vec<Vec<TaskId>>,
    pub tasks: Vec<TaskReport>,
    pub stack: Option<StackState>,
    pub review_urls: Vec<String>,
    pub stack_error: Option<String>,
    pub warnings: Vec<String>,
    pub duration_secs: f64,
}

impl RunReport {
    pub fn task(&self, id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.id.as_str() == id)
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }

    /// Some tasks completed and some did not.
    pub fn is_partial(&self) -> bool {
        let completed = self.count(TaskState::Completed);
        completed > 0 && completed < self.tasks.len()
    }

    /// 0 on full success; 1 on failure, cancellation or a failed stack
    /// submission. A partial run exits 0 only when `fail_on_partial` is off.
    pub fn exit_code(&self, fail_on_partial: bool) -> u8 {
        if self.stack_error.is_some() {
            return 1;
        }
        match self.status {
            PlanStatus::Completed => 0,
            PlanStatus::Failed if self.is_partial() && !fail_on_partial => 0,
            _ => 1,
        }
    }
}

/// Dry-run view of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub plan_id: PlanId,
    pub strategy: ExecutionStrategy,
    pub isolation: IsolationMode,
    pub layers: Vec<Vec<TaskId>>,
    pub metrics: PlanMetrics,
    pub estimated_duration: Duration,
    pub entries: Vec<PreviewEntry>,
    pub warnings: Vec<String>,
}

/// Validate `tasks` and resolve the strategy. Nothing touches the
/// repository; an invalid plan is rejected here.
pub fn prepare_plan(
    tasks: Vec<Task>,
    options: &RunOptions,
) -> Result<(ExecutionPlan, ExecutionStrategy, Vec<String>)> {
    let report = dag::validate(&tasks);
    if !report.valid {
        return Err(Error::PlanRejected {
            errors: report.error_messages(),
        });
    }
    for id in &options.skip {
        if !tasks.iter().any(|t| &t.id == id) {
            return Err(Error::Validation(format!(
                "cannot skip unknown task {}",
                id
            )));
        }
    }
    let strategy = ExecutionStrategy::resolve(options.strategy, options.isolation)?;
    let warnings = report.warnings.iter().map(ToString::to_string).collect();
    let plan = ExecutionPlan::new(tasks, options.isolation, options.max_retries);
    Ok((plan, strategy, warnings))
}

pub fn preview_plan(
    tasks: Vec<Task>,
    options: &RunOptions,
    branch_prefix: &str,
    trunk: &str,
) -> Result<PlanPreview> {
    let metrics = TaskGraph::build(&tasks).metrics();
    let (plan, strategy, warnings) = prepare_plan(tasks, options)?;
    Ok(PlanPreview {
        plan_id: plan.id,
        strategy,
        isolation: plan.isolation,
        layers: plan.execution_layers.clone(),
        estimated_duration: strategy.estimate_execution_time(&plan, options.max_concurrency),
        entries: strategy.preview(&plan, branch_prefix, trunk),
        metrics,
        warnings,
    })
}

/// Execute a plan end to end.
///
/// Validation happens before any side effect. Every worktree the run
/// created is removed before this returns, whether the run succeeded,
/// failed or was cancelled through `cancel`.
pub async fn run_plan(
    tasks: Vec<Task>,
    options: &RunOptions,
    services: &Services,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let started = Instant::now();
    let (plan, strategy, warnings) = prepare_plan(tasks, options)?;
    for warning in &warnings {
        warn!(%warning, "plan warning");
    }

    let git = services.isolation.git().clone();
    let trunk_spec = options.trunk.clone();
    let (trunk, trunk_commit) = blocking(move || {
        let trunk = match trunk_spec {
            Some(t) => t,
            None => git.current_head()?,
        };
        let commit = git.resolve_commit(&trunk)?;
        Ok((trunk, commit))
    })
    .await?;

    let stack = services
        .isolation
        .stack()
        .filter(|_| plan.isolation == IsolationMode::Stacked)
        .cloned();
    if let Some(stack) = &stack {
        stack.initialize_stack_state(&trunk).await;
    }

    info!(
        plan = %plan.id,
        strategy = %strategy,
        isolation = %plan.isolation,
        trunk = %trunk,
        tasks = plan.total_tasks,
        "starting run"
    );
    let mut orch = Orchestrator::new(plan, services.events.clone(), options.continue_on_error);
    orch.begin();

    let ctx = RunContext {
        trunk,
        trunk_commit,
        timeout: options.timeout,
        max_concurrency: options.max_concurrency,
        cancel,
    };
    let outcome = match orch.apply_skip_list(&options.skip) {
        Ok(()) => strategy.execute(&mut orch, services, ctx).await,
        Err(e) => Err(e),
    };
    services.isolation.cleanup_all().await;
    let status = orch.finish()?;
    outcome?;

    let mut review_urls = Vec::new();
    let mut stack_error = None;
    if options.submit {
        match &stack {
            Some(stack) if status == PlanStatus::Completed => {
                match restack_and_submit(stack).await {
                    Ok(result) => review_urls = result.urls,
                    Err(e) => {
                        error!(error = %e, "stack submission failed");
                        stack_error = Some(e.to_string());
                    }
                }
            }
            Some(_) => warn!(%status, "not submitting an incomplete stack"),
            None => warn!("submit requested without stacked isolation; ignoring"),
        }
    }
    let stack_state = match &stack {
        Some(stack) => stack.get_stack_info().await,
        None => None,
    };

    let plan = orch.into_plan();
    let tasks = plan
        .tasks
        .values()
        .map(|t| TaskReport {
            id: t.id().clone(),
            title: t.task.title.clone(),
            state: t.state,
            attempts: if t.start_time.is_some() { t.attempt() } else { 0 },
            branch: t.branch_name.clone(),
            base_ref: t.base_ref.clone(),
            commit: t.commit_hash.clone(),
            error: t.error.clone(),
            exit_code: t.exit_code,
            duration_secs: t.duration().map(|d| d.as_secs_f64()),
        })
        .collect();

    Ok(RunReport {
        plan_id: plan.id,
        strategy,
        isolation: plan.isolation,
        status,
        layers: plan.execution_layers,
        tasks,
        stack: stack_state,
        review_urls,
        stack_error,
        warnings,
        duration_secs: started.elapsed().as_secs_f64(),
    })
}

async fn restack_and_submit(stack: &StackBackend) -> Result<SubmitResult> {
    stack.restack().await?;
    stack.submit_stack().await
}
