//! Stacked execution: branches parented on their requirements, stack
//! registration and submission.

use std::sync::Arc;
use std::time::Duration;

use stackwise::config::RunOptions;
use stackwise::core::event::EventKind;
use stackwise::core::plan::{IsolationMode, PlanStatus};
use stackwise::core::task::{Task, TaskState};
use stackwise::orchestration::{ExecutionStrategy, StrategyKind};
use stackwise::Error;

use crate::fixtures::{
    options, run_with, MockAdapter, RecordingStackTool, Script, StackCall, TestRepo,
};

fn stacked() -> RunOptions {
    RunOptions {
        strategy: StrategyKind::Stacked,
        isolation: IsolationMode::Stacked,
        ..options()
    }
}

fn model_then_api() -> Vec<Task> {
    vec![
        Task::new("T1", "Add user model").with_produces(&["src/user.rs"]),
        Task::new("T2", "Add user API")
            .with_requires(&["T1"])
            .with_produces(&["src/api.rs"]),
    ]
}

#[tokio::test]
async fn test_stacked_branches_chain_on_requirements() {
    let repo = TestRepo::new();
    let trunk = repo.head_commit();
    let trunk_branch = repo.head_branch();
    let tool = Arc::new(RecordingStackTool::new(
        "Pushed sw branches\n\
         pull request: https://github.com/acme/app/pull/41\n\
         https://github.com/acme/app/pull/42 (created)\n",
    ));
    let adapter = Arc::new(
        MockAdapter::new()
            .script("T1", Script::writes("src/user.rs", "pub struct User;\n"))
            .script("T2", Script::writes("src/api.rs", "pub fn get_user() {}\n")),
    );
    let opts = RunOptions {
        submit: true,
        ..stacked()
    };

    let (result, _, services) = run_with(
        repo.stacked_engine(tool.clone()),
        adapter.clone(),
        model_then_api(),
        &opts,
    )
    .await;
    let report = result.unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.strategy, ExecutionStrategy::Stacked);

    let t1 = report.task("T1").unwrap();
    let t2 = report.task("T2").unwrap();
    let (t1_branch, t1_commit) = (t1.branch.clone().unwrap(), t1.commit.clone().unwrap());
    let (t2_branch, t2_commit) = (t2.branch.clone().unwrap(), t2.commit.clone().unwrap());

    assert_eq!(repo.rev_parse(&format!("{}^", t1_commit)), trunk);
    assert_eq!(repo.rev_parse(&format!("{}^", t2_commit)), t1_commit);
    assert_eq!(t2.base_ref.as_deref(), Some(t1_branch.as_str()));
    assert_eq!(
        repo.show(&t2_branch, "src/user.rs").as_deref(),
        Some("pub struct User;")
    );
    assert!(repo.show(&t1_branch, "src/api.rs").is_none());

    // The agent for T2 ran on top of T1's work.
    let t2_call = &adapter.calls_for("T2")[0];
    assert_eq!(t2_call.branch_name, t2_branch);

    let stack = report.stack.clone().unwrap();
    assert_eq!(stack.trunk, trunk_branch);
    assert_eq!(stack.depth(), 2);
    assert_eq!(stack.entries[0].parent_branch, trunk_branch);
    assert_eq!(stack.entries[1].parent_branch, t1_branch);

    assert_eq!(
        tool.calls(),
        vec![
            StackCall::Track {
                branch: t1_branch.clone(),
                parent: trunk_branch.clone(),
            },
            StackCall::Track {
                branch: t2_branch.clone(),
                parent: t1_branch.clone(),
            },
            StackCall::Restack,
            StackCall::Submit,
        ]
    );
    assert_eq!(
        report.review_urls,
        vec![
            "https://github.com/acme/app/pull/41".to_string(),
            "https://github.com/acme/app/pull/42".to_string(),
        ]
    );
    assert_eq!(report.exit_code(true), 0);

    assert_eq!(repo.worktree_count(), 1);
    assert!(repo.leftover_worktree_dirs().is_empty());
    assert_eq!(services.isolation.live_count(), 0);
}

#[tokio::test]
async fn test_second_parent_is_cherry_picked() {
    let repo = TestRepo::new();
    let tool = Arc::new(RecordingStackTool::default());
    let adapter = Arc::new(MockAdapter::new());
    let tasks = vec![
        Task::new("T1", "Schema").with_produces(&["T1.txt"]),
        Task::new("T2", "Fixtures").with_produces(&["T2.txt"]),
        Task::new("T3", "Seed")
            .with_requires(&["T1", "T2"])
            .with_produces(&["T3.txt"]),
    ];

    let (result, _, _) = run_with(repo.stacked_engine(tool), adapter, tasks, &stacked()).await;
    let report = result.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let t1 = report.task("T1").unwrap();
    let t3 = report.task("T3").unwrap();
    let t3_branch = t3.branch.clone().unwrap();
    let t3_commit = t3.commit.clone().unwrap();

    assert_eq!(t3.base_ref, t1.branch);
    assert!(repo.git_ok(&[
        "merge-base",
        "--is-ancestor",
        t1.commit.as_deref().unwrap(),
        &t3_commit
    ]));
    assert_eq!(repo.show(&t3_branch, "T1.txt").as_deref(), Some("Schema"));
    assert_eq!(repo.show(&t3_branch, "T2.txt").as_deref(), Some("Fixtures"));
    assert_eq!(repo.show(&t3_branch, "T3.txt").as_deref(), Some("Seed"));
}

#[tokio::test]
async fn test_second_parent_brings_its_own_requirements() {
    let repo = TestRepo::new();
    let tool = Arc::new(RecordingStackTool::default());
    let adapter = Arc::new(MockAdapter::new());
    let tasks = vec![
        Task::new("Q", "Queue table").with_produces(&["Q.txt"]),
        Task::new("P", "Producer")
            .with_requires(&["Q"])
            .with_produces(&["P.txt"]),
        Task::new("R", "Reader table").with_produces(&["R.txt"]),
        Task::new("S", "Subscriber")
            .with_requires(&["R"])
            .with_produces(&["S.txt"]),
        Task::new("T", "Wire together")
            .with_requires(&["P", "S"])
            .with_produces(&["T.txt"]),
    ];

    let (result, _, _) = run_with(repo.stacked_engine(tool), adapter, tasks, &stacked()).await;
    let report = result.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let t = report.task("T").unwrap();
    assert_eq!(t.base_ref, report.task("P").unwrap().branch);
    let t_branch = t.branch.clone().unwrap();
    assert_eq!(repo.show(&t_branch, "Q.txt").as_deref(), Some("Queue table"));
    assert_eq!(repo.show(&t_branch, "P.txt").as_deref(), Some("Producer"));
    assert_eq!(repo.show(&t_branch, "R.txt").as_deref(), Some("Reader table"));
    assert_eq!(repo.show(&t_branch, "S.txt").as_deref(), Some("Subscriber"));
    assert_eq!(repo.show(&t_branch, "T.txt").as_deref(), Some("Wire together"));
}

#[tokio::test]
async fn test_branch_without_changes_is_still_tracked() {
    let repo = TestRepo::new();
    let trunk = repo.head_commit();
    let trunk_branch = repo.head_branch();
    let tool = Arc::new(RecordingStackTool::default());
    let adapter = Arc::new(MockAdapter::new().script(
        "T1",
        Script {
            no_changes: true,
            ..Script::default()
        },
    ));

    let (result, _, _) = run_with(
        repo.stacked_engine(tool.clone()),
        adapter,
        model_then_api(),
        &stacked(),
    )
    .await;
    let report = result.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let t1 = report.task("T1").unwrap();
    let t1_branch = t1.branch.clone().unwrap();
    let t2_branch = report.task("T2").unwrap().branch.clone().unwrap();
    assert!(t1.commit.is_none());

    assert_eq!(
        tool.calls(),
        vec![
            StackCall::Track {
                branch: t1_branch.clone(),
                parent: trunk_branch.clone(),
            },
            StackCall::Track {
                branch: t2_branch,
                parent: t1_branch,
            },
        ]
    );
    let stack = report.stack.clone().unwrap();
    assert_eq!(stack.depth(), 2);
    assert_eq!(stack.entries[0].commit, trunk);
}

#[tokio::test]
async fn test_stacked_dispatch_does_not_wait_for_layer() {
    let repo = TestRepo::new();
    let tool = Arc::new(RecordingStackTool::default());
    let adapter = Arc::new(
        MockAdapter::new().script("T3", Script::slow(Duration::from_millis(800))),
    );
    let tasks = vec![
        Task::new("T1", "Quick root").with_produces(&["T1.txt"]),
        Task::new("T2", "Quick child")
            .with_requires(&["T1"])
            .with_produces(&["T2.txt"]),
        Task::new("T3", "Slow root").with_produces(&["T3.txt"]),
    ];

    let (result, events, _) =
        run_with(repo.stacked_engine(tool), adapter, tasks, &stacked()).await;
    assert_eq!(result.unwrap().status, PlanStatus::Completed);

    let position = |kind: EventKind, task: &str| {
        events
            .iter()
            .position(|e| e.kind == kind && e.task_id.as_ref().map(|t| t.as_str()) == Some(task))
            .unwrap()
    };
    assert!(position(EventKind::TaskStart, "T2") < position(EventKind::TaskComplete, "T3"));
    assert!(position(EventKind::TaskComplete, "T1") < position(EventKind::TaskStart, "T2"));
}

#[tokio::test]
async fn test_failed_submission_is_reported() {
    let repo = TestRepo::new();
    let tool = Arc::new(RecordingStackTool::failing_submit());
    let adapter = Arc::new(MockAdapter::new());
    let opts = RunOptions {
        submit: true,
        ..stacked()
    };

    let (result, _, _) = run_with(
        repo.stacked_engine(tool.clone()),
        adapter,
        model_then_api(),
        &opts,
    )
    .await;
    let report = result.unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert!(report.stack_error.as_deref().unwrap().contains("remote rejected push"));
    assert!(report.review_urls.is_empty());
    assert_eq!(report.exit_code(false), 1);
    assert!(tool.calls().contains(&StackCall::Restack));
}

#[tokio::test]
async fn test_hybrid_resolves_by_isolation() {
    let repo = TestRepo::new();
    let tool = Arc::new(RecordingStackTool::default());
    let opts = RunOptions {
        strategy: StrategyKind::Hybrid,
        ..stacked()
    };

    let (result, _, _) = run_with(
        repo.stacked_engine(tool),
        Arc::new(MockAdapter::new()),
        model_then_api(),
        &opts,
    )
    .await;
    let report = result.unwrap();
    assert_eq!(report.strategy, ExecutionStrategy::Stacked);
    assert_eq!(report.task("T2").unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn test_stacked_strategy_needs_worktrees() {
    let repo = TestRepo::new();
    let adapter = Arc::new(MockAdapter::new());
    let opts = RunOptions {
        isolation: IsolationMode::Simple,
        ..stacked()
    };

    let (result, _, _) = run_with(repo.engine(), adapter.clone(), model_then_api(), &opts).await;

    assert!(matches!(result, Err(Error::UnsupportedCombination(_))));
    assert!(adapter.calls().is_empty());
    assert!(repo.task_branches().is_empty());
}
