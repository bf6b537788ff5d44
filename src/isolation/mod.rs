//! Isolation of concurrent task runs: worktrees, branches and stacks.

pub mod stack;
pub mod worktree;

pub use stack::{GraphiteCli, StackBackend, StackEntry, StackState, StackTool, SubmitResult};
pub use worktree::{IsolationEngine, WorktreeContext};
