//! Core domain model: tasks, plans, the dependency graph and run events.
//!
//! Nothing in here touches the repository.

pub mod dag;
pub mod event;
pub mod plan;
pub mod task;

pub use dag::{PlanMetrics, TaskGraph, ValidationIssue, ValidationReport, ValidationWarning};
pub use event::{EventBus, EventKind, ExecutionEvent};
pub use plan::{ExecutionPlan, IsolationMode, PlanId, PlanStatus};
pub use task::{ExecutionTask, Task, TaskId, TaskState};
