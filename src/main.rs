use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stackwise::config::{Config, ExecutionMode, RunOptions};
use stackwise::core::dag;
use stackwise::core::event::EventBus;
use stackwise::core::plan::{load_tasks, IsolationMode};
use stackwise::core::task::{TaskId, TaskState};
use stackwise::git::GitOps;
use stackwise::isolation::{GraphiteCli, IsolationEngine, StackBackend};
use stackwise::orchestration::{
    preview_plan, run_plan, CommandAdapter, PlanPreview, RunReport, Services, StrategyKind,
};
use stackwise::Result;

/// Stackwise - run a dependency-ordered task plan concurrently against git
#[derive(Parser, Debug)]
#[command(name = "stackwise")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    STACKWISE_DEBUG=1    Enable debug logging (alternative to --verbose)\n    STACKWISE_LOG=...    tracing filter directive, overrides both")]
pub struct Cli {
    /// Enable debug logging and mirror logs to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Check a plan for cycles, file conflicts and unknown requirements
    Validate {
        /// Plan file (JSON or TOML)
        plan: PathBuf,
    },

    /// Show execution layers, metrics and a time estimate
    Plan {
        /// Plan file (JSON or TOML)
        plan: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Show the branch each task would get and what it would start from
    DryRun {
        /// Plan file (JSON or TOML)
        plan: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Execute the plan
    Execute {
        /// Plan file (JSON or TOML)
        plan: PathBuf,

        #[command(flatten)]
        run: RunArgs,

        /// Preview instead of executing
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove worktrees left behind by interrupted runs
    Cleanup,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Execution strategy: parallel, stacked, sequential or hybrid
    #[arg(short, long, default_value = "parallel")]
    pub strategy: StrategyKind,

    /// Isolation mode: simple, worktree or stacked
    #[arg(short, long, default_value = "worktree")]
    pub isolation: IsolationMode,

    /// Keep running independent tasks after a task exhausts its retries
    #[arg(long)]
    pub continue_on_error: bool,

    /// Retries per task after the first attempt
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Maximum concurrent task attempts
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Base ref for the run (defaults to the current branch)
    #[arg(long)]
    pub trunk: Option<String>,

    /// Submit the stack for review after a stacked run
    #[arg(long)]
    pub submit: bool,

    /// Task ids to skip (comma separated or repeated)
    #[arg(long, value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Exit 0 when some tasks completed and others did not
    #[arg(long)]
    pub allow_partial: bool,
}

impl RunArgs {
    fn into_options(self, config: &Config, mode: ExecutionMode, verbose: bool) -> RunOptions {
        let base = RunOptions::from_config(config);
        RunOptions {
            mode,
            strategy: self.strategy,
            isolation: self.isolation,
            continue_on_error: self.continue_on_error,
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            timeout: self.timeout.map(Duration::from_secs).unwrap_or(base.timeout),
            verbose,
            max_concurrency: self.concurrency.unwrap_or(base.max_concurrency).max(1),
            trunk: self.trunk.or(base.trunk),
            submit: self.submit,
            skip: self.skip.into_iter().map(TaskId::from).collect(),
            fail_on_partial: base.fail_on_partial && !self.allow_partial,
            ..base
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    stackwise::log::init(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "stackwise failed");
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let config = Config::load()?;
    let json = cli.json;

    match cli.command {
        Command::Validate { plan } => run_validate(&plan, json),
        Command::Plan { plan, run } => {
            let options = run.into_options(&config, ExecutionMode::Plan, cli.verbose);
            run_preview(&plan, &options, &config, json)
        }
        Command::DryRun { plan, run } => {
            let options = run.into_options(&config, ExecutionMode::DryRun, cli.verbose);
            run_preview(&plan, &options, &config, json)
        }
        Command::Execute { plan, run, dry_run } => {
            let mut options = run.into_options(&config, ExecutionMode::Execute, cli.verbose);
            options.dry_run = dry_run;
            match options.effective_mode() {
                ExecutionMode::Execute => run_execute(&plan, &options, &config, json),
                _ => run_preview(&plan, &options, &config, json),
            }
        }
        Command::Cleanup => run_cleanup(&config, json),
    }
}

fn run_validate(path: &Path, json: bool) -> Result<u8> {
    let tasks = load_tasks(path)?;
    let report = dag::validate(&tasks);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if report.valid {
            println!("Plan is valid: {} tasks in {} layers", tasks.len(), report.layers.len());
        } else {
            println!("Plan is invalid:");
            for message in report.error_messages() {
                println!("  ✗ {}", message);
            }
        }
        for warning in &report.warnings {
            println!("  ! {}", warning);
        }
    }
    Ok(if report.valid { 0 } else { 1 })
}

fn run_preview(path: &Path, options: &RunOptions, config: &Config, json: bool) -> Result<u8> {
    let tasks = load_tasks(path)?;
    let trunk = match &options.trunk {
        Some(trunk) => trunk.clone(),
        None => std::env::current_dir()
            .ok()
            .and_then(|dir| GitOps::new(&dir).ok())
            .and_then(|git| git.current_head().ok())
            .unwrap_or_else(|| "HEAD".to_string()),
    };
    let preview = preview_plan(tasks, options, config.effective_branch_prefix(), &trunk)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&preview)?);
    } else {
        print_preview(&preview, options.effective_mode());
    }
    Ok(0)
}

fn run_execute(path: &Path, options: &RunOptions, config: &Config, json: bool) -> Result<u8> {
    let tasks = load_tasks(path)?;
    let repo_path = std::env::current_dir()?;
    let git = GitOps::new(&repo_path)?;

    let mut engine = IsolationEngine::new(
        git,
        &config.worktrees_dir()?,
        config.effective_branch_prefix(),
    );
    if options.isolation == IsolationMode::Stacked {
        let tool = GraphiteCli::detect(config.effective_stack_command())?;
        engine = engine.with_stack(Arc::new(StackBackend::new(Arc::new(tool), &repo_path)));
    }
    let adapter = CommandAdapter::detect(config.effective_command())?;
    let events = EventBus::new();
    let services = Services::new(engine, Arc::new(adapter), events.clone());

    info!(plan = %path.display(), repo = %repo_path.display(), "executing plan");

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let log_task = events.spawn_log_subscriber();
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                on_signal.cancel();
            }
        });
        let report = run_plan(tasks, options, &services, cancel).await;
        events.close();
        if let Err(e) = log_task.await {
            warn!(error = %e, "event log subscriber ended abnormally");
        }
        report
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.exit_code(options.fail_on_partial))
}

fn run_cleanup(config: &Config, json: bool) -> Result<u8> {
    let repo_path = std::env::current_dir()?;
    let git = GitOps::new(&repo_path)?;
    let engine = IsolationEngine::new(
        git,
        &config.worktrees_dir()?,
        config.effective_branch_prefix(),
    );

    let rt = tokio::runtime::Runtime::new()?;
    let removed = rt.block_on(engine.prune_stale())?;

    if json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("Removed {} stale worktree(s)", removed);
    }
    Ok(0)
}

fn print_preview(preview: &PlanPreview, mode: ExecutionMode) {
    println!();
    println!("  Plan:        {}", preview.plan_id.short());
    println!("  Strategy:    {}", preview.strategy);
    println!("  Isolation:   {}", preview.isolation);
    println!("  Tasks:       {}", preview.metrics.total_tasks);
    println!("  Layers:      {}", preview.metrics.layer_count);
    println!("  Parallelism: {}", preview.metrics.max_parallelism);
    println!(
        "  Efficiency:  {:.0}%",
        preview.metrics.parallelization_efficiency * 100.0
    );
    println!("  Estimate:    {}", format_duration(preview.estimated_duration));
    println!(
        "  Critical:    {} ({})",
        join_ids(&preview.metrics.critical_path),
        format_duration(preview.metrics.critical_path_duration)
    );
    println!();

    for (index, layer) in preview.layers.iter().enumerate() {
        println!("  Layer {}: {}", index, join_ids(layer));
    }

    if mode == ExecutionMode::DryRun {
        println!();
        for entry in &preview.entries {
            println!("  {} {}", entry.task_id, entry.title);
            println!("      branch: {}", entry.branch);
            println!("      base:   {}", entry.base);
            if !entry.merges.is_empty() {
                println!("      merges: {}", join_ids(&entry.merges));
            }
            println!("      attempts: up to {}", entry.max_attempts);
        }
    }

    for warning in &preview.warnings {
        println!("  ! {}", warning);
    }
    println!();
}

fn print_report(report: &RunReport) {
    println!();
    println!("  Plan:      {}", report.plan_id.short());
    println!("  Strategy:  {}", report.strategy);
    println!("  Status:    {}", report.status);
    println!(
        "  Tasks:     {} completed, {} failed, {} blocked, {} skipped",
        report.count(TaskState::Completed),
        report.count(TaskState::Failed),
        report.count(TaskState::Blocked),
        report.count(TaskState::Skipped),
    );
    println!("  Duration:  {:.1}s", report.duration_secs);
    println!();

    for task in &report.tasks {
        let marker = match task.state {
            TaskState::Completed => "✓",
            TaskState::Failed => "✗",
            _ => "-",
        };
        println!("  {} {} [{}] {}", marker, task.id, task.state, task.title);
        if let Some(branch) = &task.branch {
            let commit = task.commit.as_deref().map(short_sha).unwrap_or("no commit");
            println!("      {} @ {}", branch, commit);
        }
        if let Some(err) = &task.error {
            println!("      {}", err);
        }
    }

    if !report.review_urls.is_empty() {
        println!();
        println!("  Review:");
        for url in &report.review_urls {
            println!("    {}", url);
        }
    }
    if let Some(err) = &report.stack_error {
        println!();
        println!("  Stack submission failed: {}", err);
    }
    println!();
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
