use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::core::plan::IsolationMode;
use crate::core::task::TaskId;
use crate::orchestration::strategy::StrategyKind;
use crate::{Error, Result};

pub const DEFAULT_BRANCH_PREFIX: &str = "stackwise";
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 600;

/// User configuration loaded from `~/.stackwise/stackwise.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub worktree_dir: Option<String>,
    pub branch_prefix: Option<String>,
    pub max_concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub task_timeout_secs: Option<u64>,
    /// Agent command the default adapter invokes.
    pub command: Option<String>,
    /// Stack tool binary (Graphite CLI by default).
    pub stack_command: Option<String>,
    pub fail_on_partial: Option<bool>,
    pub trunk: Option<String>,
}

impl Config {
    pub fn stackwise_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".stackwise"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::stackwise_dir()?.join("stackwise.toml"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::stackwise_dir()?.join("worktrees")),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn effective_stack_command(&self) -> &str {
        self.stack_command.as_deref().unwrap_or("gt")
    }

    pub fn effective_branch_prefix(&self) -> &str {
        self.branch_prefix.as_deref().unwrap_or(DEFAULT_BRANCH_PREFIX)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(?config, "config loaded");
        Ok(config)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// What a run should do with the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Print layers and metrics.
    Plan,
    /// Preview branch topology without touching the repository.
    DryRun,
    /// Run every task.
    #[default]
    Execute,
    /// Validate the plan and stop.
    Validate,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Plan => write!(f, "plan"),
            ExecutionMode::DryRun => write!(f, "dry-run"),
            ExecutionMode::Execute => write!(f, "execute"),
            ExecutionMode::Validate => write!(f, "validate"),
        }
    }
}

/// Options for a single run, merged from config defaults and CLI flags.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: ExecutionMode,
    pub strategy: StrategyKind,
    pub isolation: IsolationMode,
    pub continue_on_error: bool,
    pub max_retries: u32,
    pub timeout: Duration,
    pub dry_run: bool,
    pub verbose: bool,
    /// Worker bound for concurrent task attempts.
    pub max_concurrency: usize,
    /// Base ref for the run; current HEAD when unset.
    pub trunk: Option<String>,
    /// Submit the composed stack upstream after a stacked run.
    pub submit: bool,
    /// Tasks bypassed before the run starts.
    pub skip: Vec<TaskId>,
    /// Exit non-zero when some tasks completed and others did not.
    pub fail_on_partial: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Execute,
            strategy: StrategyKind::Parallel,
            isolation: IsolationMode::Worktree,
            continue_on_error: false,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            dry_run: false,
            verbose: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            trunk: None,
            submit: false,
            skip: Vec::new(),
            fail_on_partial: true,
        }
    }
}

impl RunOptions {
    /// Start from the config file's defaults.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: config.max_retries.unwrap_or(defaults.max_retries),
            timeout: config
                .task_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_concurrency: config
                .max_concurrency
                .unwrap_or(defaults.max_concurrency)
                .max(1),
            trunk: config.trunk.clone(),
            fail_on_partial: config.fail_on_partial.unwrap_or(defaults.fail_on_partial),
            ..defaults
        }
    }

    /// The effective mode: `dry_run` downgrades an execute request.
    pub fn effective_mode(&self) -> ExecutionMode {
        if self.dry_run && self.mode == ExecutionMode::Execute {
            ExecutionMode::DryRun
        } else {
            self.mode
        }
    }
}
