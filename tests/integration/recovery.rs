//! Failure handling: retries, timeouts, partial failure, halting and
//! cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stackwise::config::RunOptions;
use stackwise::core::event::EventKind;
use stackwise::core::plan::{IsolationMode, PlanStatus};
use stackwise::core::task::{Task, TaskState};
use stackwise::orchestration::StrategyKind;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{
    options, run_with, run_with_cancel, MockAdapter, RecordingStackTool, Script, TestRepo,
};

fn single() -> Vec<Task> {
    vec![Task::new("T1", "Flaky change").with_produces(&["T1.txt"])]
}

#[tokio::test]
async fn test_retry_enriches_instructions_and_uses_fresh_worktree() {
    let repo = TestRepo::new();
    let trunk = repo.head_commit();
    let adapter = Arc::new(MockAdapter::new().script("T1", Script::failing(2)));
    let opts = RunOptions {
        max_retries: 2,
        ..options()
    };

    let (result, events, services) = run_with(repo.engine(), adapter.clone(), single(), &opts).await;
    let report = result.unwrap();

    let t1 = report.task("T1").unwrap();
    assert_eq!(t1.state, TaskState::Completed);
    assert_eq!(t1.attempts, 3);
    assert_eq!(report.status, PlanStatus::Completed);

    let calls = adapter.calls_for("T1");
    assert_eq!(calls.iter().map(|c| c.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(!calls[0].instructions.contains("Previous attempt"));
    assert!(calls[1].instructions.contains("Previous attempt 1 failed"));
    assert!(calls[1].instructions.contains("scripted failure on attempt 1"));
    assert!(calls[2].instructions.contains("scripted failure on attempt 2"));
    assert!(calls[2].working_dir.ends_with("T1-a3"));
    assert_ne!(calls[0].working_dir, calls[1].working_dir);

    // The branch was reset for each attempt, so only the last one shows.
    let commit = t1.commit.clone().unwrap();
    assert_eq!(repo.rev_parse(t1.branch.as_deref().unwrap()), commit);
    assert_eq!(repo.rev_parse(&format!("{}^", commit)), trunk);

    let retries = events.iter().filter(|e| e.kind == EventKind::TaskRetry).count();
    assert_eq!(retries, 2);
    assert_eq!(repo.worktree_count(), 1);
    assert_eq!(services.isolation.live_count(), 0);
}

#[tokio::test]
async fn test_retries_stop_at_the_cap() {
    let repo = TestRepo::new();
    let adapter = Arc::new(MockAdapter::new().script("T1", Script::failing(5)));
    let opts = RunOptions {
        max_retries: 1,
        ..options()
    };

    let (result, _, _) = run_with(repo.engine(), adapter.clone(), single(), &opts).await;
    let report = result.unwrap();

    let t1 = report.task("T1").unwrap();
    assert_eq!(t1.state, TaskState::Failed);
    assert_eq!(t1.attempts, 2);
    assert_eq!(t1.exit_code, Some(2));
    assert!(t1.error.as_deref().unwrap().contains("attempt 2"));
    assert_eq!(adapter.calls_for("T1").len(), 2);
    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(report.exit_code(false), 1);
}

#[tokio::test]
async fn test_continue_on_error_runs_independent_work() {
    let repo = TestRepo::new();
    let adapter = Arc::new(MockAdapter::new().script("T2", Script::failing(u32::MAX)));
    let tasks = vec![
        Task::new("T1", "Independent A").with_produces(&["a.txt"]),
        Task::new("T2", "Broken").with_produces(&["b.txt"]),
        Task::new("T3", "Needs broken")
            .with_requires(&["T2"])
            .with_produces(&["c.txt"]),
        Task::new("T4", "Independent B").with_produces(&["d.txt"]),
    ];
    let opts = RunOptions {
        continue_on_error: true,
        max_retries: 1,
        ..options()
    };

    let (result, _, _) = run_with(repo.engine(), adapter.clone(), tasks, &opts).await;
    let report = result.unwrap();

    assert_eq!(report.task("T1").unwrap().state, TaskState::Completed);
    assert_eq!(report.task("T4").unwrap().state, TaskState::Completed);
    assert_eq!(report.task("T2").unwrap().state, TaskState::Failed);
    assert_eq!(report.task("T3").unwrap().state, TaskState::Blocked);
    assert!(adapter.calls_for("T3").is_empty());

    assert_eq!(report.status, PlanStatus::Failed);
    assert!(report.is_partial());
    assert_eq!(report.exit_code(true), 1);
    assert_eq!(report.exit_code(false), 0);
}

#[tokio::test]
async fn test_failure_halts_without_continue_on_error() {
    let repo = TestRepo::new();
    let adapter = Arc::new(MockAdapter::new().script("T1", Script::failing(u32::MAX)));
    let tasks = vec![
        Task::new("T1", "Broken root").with_produces(&["a.txt"]),
        Task::new("T2", "Needs broken")
            .with_requires(&["T1"])
            .with_produces(&["b.txt"]),
        Task::new("T3", "Other root").with_produces(&["c.txt"]),
        Task::new("T4", "Needs other")
            .with_requires(&["T3"])
            .with_produces(&["d.txt"]),
    ];

    let (result, _, services) = run_with(repo.engine(), adapter.clone(), tasks, &options()).await;
    let report = result.unwrap();

    assert_eq!(report.task("T1").unwrap().state, TaskState::Failed);
    assert_eq!(report.task("T2").unwrap().state, TaskState::Blocked);
    assert!(matches!(
        report.task("T3").unwrap().state,
        TaskState::Completed | TaskState::Skipped
    ));
    assert_eq!(report.task("T4").unwrap().state, TaskState::Skipped);
    assert!(adapter.calls_for("T2").is_empty());
    assert!(adapter.calls_for("T4").is_empty());
    assert_eq!(report.status, PlanStatus::Failed);
    assert!(report.tasks.iter().all(|t| t.state.is_terminal()));
    assert_eq!(services.isolation.live_count(), 0);
}

#[tokio::test]
async fn test_timeout_stops_attempt_and_retries() {
    let repo = TestRepo::new();
    let adapter = Arc::new(MockAdapter::new().script("T1", Script::slow(Duration::from_secs(5))));
    let opts = RunOptions {
        timeout: Duration::from_millis(300),
        max_retries: 1,
        ..options()
    };

    let started = Instant::now();
    let (result, _, services) = run_with(repo.engine(), adapter.clone(), single(), &opts).await;
    let report = result.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    let t1 = report.task("T1").unwrap();
    assert_eq!(t1.state, TaskState::Failed);
    assert_eq!(t1.attempts, 2);
    assert!(t1.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(adapter.stops().len(), 2);
    assert_eq!(repo.worktree_count(), 1);
    assert_eq!(services.isolation.live_count(), 0);
}

#[tokio::test]
async fn test_cancellation_stops_running_tasks_and_cleans_up() {
    let repo = TestRepo::new();
    let slow = Script::slow(Duration::from_secs(10));
    let adapter = Arc::new(
        MockAdapter::new()
            .script("T1", slow.clone())
            .script("T2", slow),
    );
    let tasks = vec![
        Task::new("T1", "Long A").with_produces(&["a.txt"]),
        Task::new("T2", "Long B").with_produces(&["b.txt"]),
        Task::new("T3", "After A")
            .with_requires(&["T1"])
            .with_produces(&["c.txt"]),
    ];
    let opts = RunOptions {
        max_retries: 3,
        ..options()
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watched = adapter.clone();
    tokio::spawn(async move {
        while watched.calls().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        trigger.cancel();
    });

    let started = Instant::now();
    let (result, events, services) =
        run_with_cancel(repo.engine(), adapter.clone(), tasks, &opts, cancel).await;
    let report = result.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.status, PlanStatus::Cancelled);
    assert_eq!(report.exit_code(false), 1);
    assert_eq!(report.task("T1").unwrap().state, TaskState::Failed);
    assert_eq!(report.task("T2").unwrap().state, TaskState::Failed);
    assert_eq!(report.task("T3").unwrap().state, TaskState::Skipped);
    // Cancelled attempts are not retried.
    assert_eq!(adapter.calls().len(), 2);

    let mut stopped: Vec<String> = adapter.stops().iter().map(|t| t.to_string()).collect();
    stopped.sort();
    assert_eq!(stopped, vec!["T1", "T2"]);

    assert_eq!(events.last().unwrap().kind, EventKind::PlanComplete);
    assert_eq!(repo.worktree_count(), 1);
    assert!(repo.leftover_worktree_dirs().is_empty());
    assert_eq!(services.isolation.live_count(), 0);
}

#[tokio::test]
async fn test_conflicting_parents_fail_without_retry() {
    let repo = TestRepo::new();
    let tool = Arc::new(RecordingStackTool::default());
    let adapter = Arc::new(
        MockAdapter::new()
            .script("T1", Script::writes("shared.txt", "from T1\n"))
            .script("T2", Script::writes("shared.txt", "from T2\n")),
    );
    // The shared file is undeclared, so validation cannot catch it.
    let tasks = vec![
        Task::new("T1", "Left").with_produces(&["left.txt"]),
        Task::new("T2", "Right").with_produces(&["right.txt"]),
        Task::new("T3", "Join")
            .with_requires(&["T1", "T2"])
            .with_produces(&["join.txt"]),
    ];
    let opts = RunOptions {
        strategy: StrategyKind::Stacked,
        isolation: IsolationMode::Stacked,
        max_retries: 2,
        ..options()
    };

    let (result, _, services) =
        run_with(repo.stacked_engine(tool), adapter.clone(), tasks, &opts).await;
    let report = result.unwrap();

    let t3 = report.task("T3").unwrap();
    assert_eq!(t3.state, TaskState::Failed);
    assert!(t3.error.as_deref().unwrap().contains("shared.txt"));
    assert_eq!(t3.attempts, 0);
    assert!(adapter.calls_for("T3").is_empty());
    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(services.isolation.live_count(), 0);
    assert_eq!(repo.worktree_count(), 1);
}
