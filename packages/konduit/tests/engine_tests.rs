//! End-to-end scenarios: workflows run through a real worker pool against
//! PostgreSQL, with coordination disabled (poll-only mode).

mod common;

use std::time::Duration;

use serde_json::json;

use konduit::{
    BackoffStrategy, BranchArm, ExecutionStatus, KonduitError, RetryPolicy, StepDefinition,
    TaskStatus, WorkflowDefinition,
};

use common::{
    create_test_db, drop_test_db, failing_handler, start_engine, static_handler,
    wait_for_terminal, CapturingHandler, FlakyHandler, SlowHandler,
};

fn fast_policy(max_attempts: i32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        strategy: BackoffStrategy::Fixed,
        base_delay_ms: 25,
        max_delay_ms: 500,
        jitter: false,
    }
}

#[tokio::test]
async fn sequential_workflow_runs_steps_in_order() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    engine
        .register(
            WorkflowDefinition::new("pipeline", 1)
                .step(StepDefinition::new("a", static_handler(json!("a"))))
                .step(StepDefinition::new("b", static_handler(json!("b"))))
                .step(StepDefinition::new("c", static_handler(json!("c")))),
        )
        .await
        .unwrap();

    let id = engine
        .trigger("pipeline", Some(json!({"x": 1})), None)
        .await
        .unwrap();
    let execution = wait_for_terminal(&engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(json!("c")));
    assert!(execution.started_at.is_some());
    assert!(execution.completed_at.is_some());

    let tasks = engine.execution_tasks(id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    let names: Vec<&str> = tasks.iter().map(|t| t.step_name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    for task in &tasks {
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt, 1);
    }
    assert_eq!(tasks[0].input, Some(json!({"x": 1})));
    assert_eq!(tasks[1].input, Some(json!("a")));
    assert_eq!(tasks[2].input, Some(json!("b")));

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn flaky_step_retries_then_succeeds() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    let flaky = FlakyHandler::new(2, json!("ok"));
    engine
        .register(
            WorkflowDefinition::new("flaky", 1).step(
                StepDefinition::new("wobbly", flaky.clone()).with_retry_policy(fast_policy(3)),
            ),
        )
        .await
        .unwrap();

    let id = engine.trigger("flaky", None, None).await.unwrap();
    let execution = wait_for_terminal(&engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(json!("ok")));
    assert_eq!(flaky.calls(), 3);

    let tasks = engine.execution_tasks(id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt, 3);

    let history = task.error_entries();
    assert_eq!(history.len(), 2);
    assert!(history[0].error.contains("induced failure #1"));
    assert!(history[1].error.contains("induced failure #2"));

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn exhausted_step_dead_letters_and_fails_the_execution() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    engine
        .register(
            WorkflowDefinition::new("doomed", 1).step(
                StepDefinition::new("always_fails", failing_handler("no such host"))
                    .with_retry_policy(fast_policy(2)),
            ),
        )
        .await
        .unwrap();

    let id = engine.trigger("doomed", None, None).await.unwrap();
    let execution = wait_for_terminal(&engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.error.expect("failed execution carries an error");
    assert!(error.contains("always_fails"));

    let tasks = engine.execution_tasks(id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::DeadLetter);
    assert_eq!(tasks[0].attempt, 2);

    let dead_letters = engine.list_dead_letters(10).await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    let dead_letter = &dead_letters[0];
    assert_eq!(dead_letter.task_id, tasks[0].id);
    assert_eq!(dead_letter.workflow_name, "doomed");
    assert_eq!(dead_letter.total_attempts, 2);
    let history: Vec<konduit::ErrorHistoryEntry> =
        serde_json::from_value(dead_letter.error_history.clone()).unwrap();
    assert_eq!(history.len(), 2);

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn parallel_fan_in_aggregates_outputs_by_step_name() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    let merge = CapturingHandler::new(json!("merged"));
    engine
        .register(
            WorkflowDefinition::new("fanout", 1)
                .step(StepDefinition::new("seed", static_handler(json!("seeded"))))
                .parallel(vec![
                    StepDefinition::new("p1", static_handler(json!({"i": 1}))),
                    StepDefinition::new("p2", static_handler(json!({"i": 2}))),
                    StepDefinition::new("p3", static_handler(json!({"i": 3}))),
                ])
                .step(StepDefinition::new("merge", merge.clone())),
        )
        .await
        .unwrap();

    let input = json!({"order": 7});
    let id = engine.trigger("fanout", Some(input.clone()), None).await.unwrap();
    let execution = wait_for_terminal(&engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(json!("merged")));

    // The merge step dispatched exactly once, after every sibling landed.
    let tasks = engine.execution_tasks(id).await.unwrap();
    assert_eq!(tasks.len(), 5);
    let merges: Vec<_> = tasks.iter().filter(|t| t.step_name == "merge").collect();
    assert_eq!(merges.len(), 1);
    assert_eq!(
        merges[0].input,
        Some(json!({"p1": {"i": 1}, "p2": {"i": 2}, "p3": {"i": 3}}))
    );

    // All siblings share one group id.
    let groups: Vec<_> = tasks
        .iter()
        .filter(|t| t.step_name.starts_with('p'))
        .map(|t| t.parallel_group.expect("parallel task has a group"))
        .collect();
    assert_eq!(groups.len(), 3);
    assert!(groups.iter().all(|g| *g == groups[0]));

    // The merge handler saw the sibling map and the original input.
    let contexts = merge.contexts();
    assert_eq!(contexts.len(), 1);
    let ctx = &contexts[0];
    assert_eq!(ctx.parallel_outputs.len(), 3);
    assert_eq!(ctx.parallel_outputs["p2"], json!({"i": 2}));
    assert_eq!(ctx.input, Some(input.clone()));
    assert_eq!(ctx.execution_input, Some(input));

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failed_parallel_sibling_does_not_cancel_the_others() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    engine
        .register(
            WorkflowDefinition::new("fragile_fanout", 1)
                .parallel(vec![
                    StepDefinition::new("p1", static_handler(json!(1))),
                    StepDefinition::new("p2", failing_handler("shard offline"))
                        .with_retry_policy(fast_policy(2)),
                    StepDefinition::new("p3", static_handler(json!(3))),
                ])
                .step(StepDefinition::new("merge", static_handler(json!("merged")))),
        )
        .await
        .unwrap();

    let id = engine.trigger("fragile_fanout", None, None).await.unwrap();
    let execution = wait_for_terminal(&engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.unwrap().contains("p2"));

    let tasks = engine.execution_tasks(id).await.unwrap();
    // No post-parallel task was ever created.
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.step_name != "merge"));

    let status_of = |name: &str| {
        tasks
            .iter()
            .find(|t| t.step_name == name)
            .map(|t| t.status)
            .unwrap()
    };
    assert_eq!(status_of("p1"), TaskStatus::Completed);
    assert_eq!(status_of("p2"), TaskStatus::DeadLetter);
    assert_eq!(status_of("p3"), TaskStatus::Completed);

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn branch_materializes_only_the_matched_arm() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    engine
        .register(
            WorkflowDefinition::new("tiered", 1)
                .step(StepDefinition::new("evaluate", static_handler(json!("LOW"))))
                .branch(
                    vec![
                        BranchArm::new("LOW", vec![StepDefinition::new(
                            "fast_path",
                            static_handler(json!("fast")),
                        )]),
                        BranchArm::new("HIGH", vec![
                            StepDefinition::new("review", static_handler(json!("reviewed"))),
                            StepDefinition::new("escalate", static_handler(json!("escalated"))),
                        ]),
                    ],
                    Some(vec![StepDefinition::new(
                        "manual",
                        static_handler(json!("manual")),
                    )]),
                )
                .step(StepDefinition::new("finish", static_handler(json!("done")))),
        )
        .await
        .unwrap();

    let id = engine.trigger("tiered", None, None).await.unwrap();
    let execution = wait_for_terminal(&engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(json!("done")));

    let tasks = engine.execution_tasks(id).await.unwrap();
    let mut names: Vec<&str> = tasks.iter().map(|t| t.step_name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["evaluate", "fast_path", "finish"]);

    let fast_path = tasks.iter().find(|t| t.step_name == "fast_path").unwrap();
    assert_eq!(fast_path.branch_key.as_deref(), Some("LOW"));
    assert_eq!(fast_path.input, Some(json!("LOW")));

    // The post-branch step receives the arm's final output.
    let finish = tasks.iter().find(|t| t.step_name == "finish").unwrap();
    assert_eq!(finish.input, Some(json!("fast")));

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn branch_walks_a_multi_step_arm_in_order() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    engine
        .register(
            WorkflowDefinition::new("tiered", 1)
                .step(StepDefinition::new("evaluate", static_handler(json!("HIGH"))))
                .branch(
                    vec![
                        BranchArm::new("LOW", vec![StepDefinition::new(
                            "fast_path",
                            static_handler(json!("fast")),
                        )]),
                        BranchArm::new("HIGH", vec![
                            StepDefinition::new("review", static_handler(json!("reviewed"))),
                            StepDefinition::new("escalate", static_handler(json!("escalated"))),
                        ]),
                    ],
                    None,
                )
                .step(StepDefinition::new("finish", static_handler(json!("done")))),
        )
        .await
        .unwrap();

    let id = engine.trigger("tiered", None, None).await.unwrap();
    let execution = wait_for_terminal(&engine, id).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let tasks = engine.execution_tasks(id).await.unwrap();
    let mut names: Vec<&str> = tasks.iter().map(|t| t.step_name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["escalate", "evaluate", "finish", "review"]);

    let escalate = tasks.iter().find(|t| t.step_name == "escalate").unwrap();
    assert_eq!(escalate.input, Some(json!("reviewed")));
    assert_eq!(escalate.branch_key.as_deref(), Some("HIGH"));
    let finish = tasks.iter().find(|t| t.step_name == "finish").unwrap();
    assert_eq!(finish.input, Some(json!("escalated")));

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn branch_without_a_matching_arm_fails_the_execution() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    engine
        .register(
            WorkflowDefinition::new("no_match", 1)
                .step(StepDefinition::new("evaluate", static_handler(json!("MEDIUM"))))
                .branch(
                    vec![BranchArm::new("LOW", vec![StepDefinition::new(
                        "fast_path",
                        static_handler(json!("fast")),
                    )])],
                    None,
                ),
        )
        .await
        .unwrap();

    let id = engine.trigger("no_match", None, None).await.unwrap();
    let execution = wait_for_terminal(&engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.unwrap().contains("MEDIUM"));

    // No branch task was ever created.
    let tasks = engine.execution_tasks(id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].step_name, "evaluate");

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn trigger_deduplicates_by_idempotency_key() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    engine
        .register(
            WorkflowDefinition::new("once", 1)
                .step(StepDefinition::new("only", static_handler(json!("done")))),
        )
        .await
        .unwrap();

    let first = engine
        .trigger("once", Some(json!({"n": 1})), Some("order-42"))
        .await
        .unwrap();
    let second = engine
        .trigger("once", Some(json!({"n": 2})), Some("order-42"))
        .await
        .unwrap();
    assert_eq!(first, second);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM executions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn triggering_an_unregistered_workflow_is_rejected() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    let err = engine.trigger("ghost", None, None).await.unwrap_err();
    assert!(matches!(err, KonduitError::WorkflowNotFound(name) if name == "ghost"));

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancelled_execution_stays_cancelled() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    engine
        .register(
            WorkflowDefinition::new("slow", 1)
                .step(StepDefinition::new(
                    "crawl",
                    std::sync::Arc::new(SlowHandler(Duration::from_millis(500))),
                ))
                .step(StepDefinition::new("after", static_handler(json!("after")))),
        )
        .await
        .unwrap();

    let id = engine.trigger("slow", Some(json!("payload")), None).await.unwrap();
    let cancelled = engine.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    // The in-flight task finishes and reports, but the terminal execution
    // blocks any further advancement.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let execution = engine.execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    let tasks = engine.execution_tasks(id).await.unwrap();
    assert!(tasks.iter().all(|t| t.step_name != "after"));

    // Terminal states are absorbing.
    let err = engine.cancel(id).await.unwrap_err();
    assert!(matches!(err, KonduitError::StateTransition { .. }));

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn execution_past_its_deadline_times_out() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    engine
        .register(
            WorkflowDefinition::new("deadline", 1)
                .with_timeout(Duration::from_millis(200))
                .step(StepDefinition::new(
                    "dawdle",
                    std::sync::Arc::new(SlowHandler(Duration::from_secs(2))),
                )),
        )
        .await
        .unwrap();

    let id = engine.trigger("deadline", None, None).await.unwrap();
    let execution = wait_for_terminal(&engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::TimedOut);
    assert!(execution.error.unwrap().contains("deadline"));

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn per_attempt_timeout_drives_the_retry_pipeline() {
    let (pool, url, db_name) = create_test_db().await;
    let engine = start_engine(&url).await;

    engine
        .register(
            WorkflowDefinition::new("watchdog", 1).step(
                StepDefinition::new(
                    "stuck",
                    std::sync::Arc::new(SlowHandler(Duration::from_secs(30))),
                )
                .with_timeout(Duration::from_millis(100))
                .with_retry_policy(fast_policy(2)),
            ),
        )
        .await
        .unwrap();

    let id = engine.trigger("watchdog", None, None).await.unwrap();
    let execution = wait_for_terminal(&engine, id).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);

    let tasks = engine.execution_tasks(id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::DeadLetter);
    let history = tasks[0].error_entries();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|entry| entry.error == "task timed out"));

    engine.shutdown().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}
