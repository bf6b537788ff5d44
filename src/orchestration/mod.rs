//! Orchestration: strategies, the dispatch loop, the plan state machine
//! and the adapter seam.

pub mod adapter;
pub mod dispatch;
pub mod orchestrator;
pub mod runner;
pub mod strategy;

pub use adapter::{CommandAdapter, ProgressReporter, TaskAdapter, TaskRequest, TaskResult, TaskStatus};
pub use dispatch::{Barrier, DispatchProfile, RunContext, Topology};
pub use orchestrator::{Orchestrator, RetryDecision};
pub use runner::{preview_plan, prepare_plan, run_plan, PlanPreview, RunReport, Services, TaskReport};
pub use strategy::{ExecutionStrategy, PreviewEntry, StrategyKind};
