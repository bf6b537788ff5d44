//! Integration test suite for stackwise.
//!
//! These tests run whole plans against throwaway git repositories with a
//! scripted adapter standing in for the agent, and check the resulting
//! branches, commits, worktrees and events.
//!
//! # Test Categories
//!
//! - `graph_validation`: Plan acceptance and layering
//! - `parallel_execution`: Trunk-based strategies and worktree isolation
//! - `stacked_execution`: Stacked branches and stack submission
//! - `recovery`: Retries, timeouts, partial failure and cancellation
//!
//! # CI Compatibility
//!
//! No agent or stack tool binaries are needed; only `git` must be on PATH.

mod fixtures;

mod recovery;
mod stacked_execution;
