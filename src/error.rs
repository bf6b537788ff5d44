use std::path::PathBuf;

use thiserror::Error;

use crate::core::task::{TaskId, TaskState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Plan rejected with {} error(s): {}", errors.len(), errors.join("; "))]
    PlanRejected { errors: Vec<String> },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid transition for task {task} from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Nothing to commit in {}", path.display())]
    NothingToCommit { path: PathBuf },

    #[error("Cherry-pick of {commit} conflicted on: {}", files.join(", "))]
    CherryPickConflict { commit: String, files: Vec<String> },

    #[error("Stack tool error: {0}")]
    StackTool(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Adapter not available: {0}")]
    AdapterNotAvailable(String),

    #[error("Unsupported combination: {0}")]
    UnsupportedCombination(String),
}

impl Error {
    /// Process exit code for an error that reaches the top-level boundary.
    pub fn exit_code(&self) -> u8 {
        1
    }

}

pub type Result<T> = std::result::Result<T, Error>;
