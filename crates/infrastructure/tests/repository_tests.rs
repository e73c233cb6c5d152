use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use taskhub_domain::entities::*;
use taskhub_domain::repositories::*;
use taskhub_infrastructure::database::ensure_schema;
use taskhub_infrastructure::database::sqlite::{
    SqliteProjectRepository, SqliteRunRepository, SqliteStepLogRepository, SqliteTaskRepository,
};

async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    ensure_schema(&pool).await.unwrap();
    pool
}

fn sample_project() -> Project {
    Project {
        id: 0,
        name: "数据仓库".to_string(),
        description: Some("夜间抽取".to_string()),
        sequence_mode: SequenceMode::Parallel,
        params: vec![Param::new("env", "prod")],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn sample_task(project_id: i64) -> Task {
    Task {
        id: 0,
        project_id,
        name: "nightly_extract".to_string(),
        enabled: true,
        rank: 0,
        overlap_policy: OverlapPolicy::Skip,
        max_retries: 1,
        timeout_seconds: None,
        params: vec![],
        triggers: vec![Trigger::Interval {
            every_seconds: 3600,
            start_at: None,
            end_at: None,
        }],
        next_fire_at: None,
        last_fired_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_project_crud() {
    let pool = test_pool().await;
    let repo = SqliteProjectRepository::new(pool);

    let created = repo.create(&sample_project()).await.unwrap();
    assert!(created.id > 0);
    assert_eq!(created.params.len(), 1);

    let mut updated = created.clone();
    updated.sequence_mode = SequenceMode::Sequential;
    let updated = repo.update(&updated).await.unwrap();
    assert_eq!(updated.sequence_mode, SequenceMode::Sequential);

    assert!(repo.delete(created.id).await.unwrap());
    assert!(repo.find_by_id(created.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_task_triggers_roundtrip() {
    let pool = test_pool().await;
    let projects = SqliteProjectRepository::new(pool.clone());
    let tasks = SqliteTaskRepository::new(pool);

    let project = projects.create(&sample_project()).await.unwrap();
    let created = tasks.create(&sample_task(project.id)).await.unwrap();

    let loaded = tasks.find_by_id(created.id).await.unwrap().unwrap();
    assert_eq!(loaded.triggers.len(), 1);
    assert!(matches!(
        loaded.triggers[0],
        Trigger::Interval { every_seconds: 3600, .. }
    ));
    assert_eq!(loaded.overlap_policy, OverlapPolicy::Skip);
}

#[tokio::test]
async fn test_find_due_respects_enabled_and_time() {
    let pool = test_pool().await;
    let projects = SqliteProjectRepository::new(pool.clone());
    let tasks = SqliteTaskRepository::new(pool);

    let project = projects.create(&sample_project()).await.unwrap();
    let now = Utc::now();

    let due = tasks.create(&sample_task(project.id)).await.unwrap();
    tasks
        .update_fire_times(due.id, Some(now - Duration::seconds(5)), None)
        .await
        .unwrap();

    let future = tasks.create(&sample_task(project.id)).await.unwrap();
    tasks
        .update_fire_times(future.id, Some(now + Duration::hours(1)), None)
        .await
        .unwrap();

    let disabled = tasks.create(&sample_task(project.id)).await.unwrap();
    tasks
        .update_fire_times(disabled.id, Some(now - Duration::seconds(5)), None)
        .await
        .unwrap();
    tasks.set_enabled(disabled.id, false).await.unwrap();

    let found = tasks.find_due(now, 10).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, due.id);
}

#[tokio::test]
async fn test_run_claim_is_exclusive() {
    let pool = test_pool().await;
    let projects = SqliteProjectRepository::new(pool.clone());
    let tasks = SqliteTaskRepository::new(pool.clone());
    let runs = SqliteRunRepository::new(pool);

    let project = projects.create(&sample_project()).await.unwrap();
    let task = tasks.create(&sample_task(project.id)).await.unwrap();
    let run = runs
        .create(&Run::new(task.id, RunCause::Scheduled, Utc::now()))
        .await
        .unwrap();

    assert!(runs.claim(run.id, "runner-a").await.unwrap());
    // 同一runner重复认领幂等，其他runner被拒绝
    assert!(runs.claim(run.id, "runner-a").await.unwrap());
    assert!(!runs.claim(run.id, "runner-b").await.unwrap());
}

#[tokio::test]
async fn test_run_status_is_monotonic() {
    let pool = test_pool().await;
    let projects = SqliteProjectRepository::new(pool.clone());
    let tasks = SqliteTaskRepository::new(pool.clone());
    let runs = SqliteRunRepository::new(pool);

    let project = projects.create(&sample_project()).await.unwrap();
    let task = tasks.create(&sample_task(project.id)).await.unwrap();
    let run = runs
        .create(&Run::new(task.id, RunCause::Manual, Utc::now()))
        .await
        .unwrap();

    assert!(runs
        .update_status(run.id, RunStatus::Running, None)
        .await
        .unwrap());
    assert!(runs
        .update_status(run.id, RunStatus::Success, None)
        .await
        .unwrap());

    // 终态后迟到的上报被忽略
    assert!(!runs
        .update_status(run.id, RunStatus::Failed, Some("late"))
        .await
        .unwrap());
    let current = runs.find_by_id(run.id).await.unwrap().unwrap();
    assert_eq!(current.status, RunStatus::Success);
    assert!(current.error_message.is_none());
}

#[tokio::test]
async fn test_cancel_allowed_from_queued() {
    let pool = test_pool().await;
    let projects = SqliteProjectRepository::new(pool.clone());
    let tasks = SqliteTaskRepository::new(pool.clone());
    let runs = SqliteRunRepository::new(pool);

    let project = projects.create(&sample_project()).await.unwrap();
    let task = tasks.create(&sample_task(project.id)).await.unwrap();
    let run = runs
        .create(&Run::new(task.id, RunCause::Manual, Utc::now()))
        .await
        .unwrap();

    assert!(runs
        .update_status(run.id, RunStatus::Cancelled, None)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_step_log_create_is_idempotent() {
    let pool = test_pool().await;
    let step_logs = SqliteStepLogRepository::new(pool);

    let first = step_logs.create(&StepLog::pending(1, 10)).await.unwrap();
    let second = step_logs.create(&StepLog::pending(1, 10)).await.unwrap();
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn test_step_log_status_guard() {
    let pool = test_pool().await;
    let step_logs = SqliteStepLogRepository::new(pool);

    step_logs.create(&StepLog::pending(1, 10)).await.unwrap();
    assert!(step_logs
        .update_status(1, 10, StepLogStatus::Running, None, None)
        .await
        .unwrap());
    assert!(step_logs
        .update_status(1, 10, StepLogStatus::Failed, Some(1), Some("exit 1"))
        .await
        .unwrap());
    // 终态后不再接受状态变化
    assert!(!step_logs
        .update_status(1, 10, StepLogStatus::Success, Some(0), None)
        .await
        .unwrap());

    let log = step_logs.find_by_run_and_step(1, 10).await.unwrap().unwrap();
    assert_eq!(log.status, StepLogStatus::Failed);
    assert_eq!(log.exit_code, Some(1));
    assert!(log.completed_at.is_some());
}

#[tokio::test]
async fn test_log_lines_dedupe_and_incremental_read() {
    let pool = test_pool().await;
    let step_logs = SqliteStepLogRepository::new(pool);

    let lines: Vec<LogLine> = (1..=3)
        .map(|seq| LogLine {
            run_id: 1,
            step_id: 10,
            seq,
            stream: OutputStream::Stdout,
            line: format!("line {seq}"),
            logged_at: Utc::now(),
        })
        .collect();

    assert_eq!(step_logs.append_lines(&lines).await.unwrap(), 3);
    // 重复投递同一批行不产生新记录
    assert_eq!(step_logs.append_lines(&lines).await.unwrap(), 0);

    let tail = step_logs.find_lines_after(1, 10, 1, 100).await.unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].seq, 2);
    assert_eq!(tail[1].seq, 3);
}
