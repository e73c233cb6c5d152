use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, watch, Mutex};

use taskhub_config::{QueueConfig, RunnerConfig, SecretCipher};
use taskhub_domain::entities::*;
use taskhub_domain::messages::{Message, MessageType, RunStatusMessage, StepStatusMessage};
use taskhub_domain::messaging::{queues, MessageQueue};
use taskhub_domain::repositories::*;
use taskhub_errors::{HubError, HubResult};
use taskhub_infrastructure::database::ensure_schema;
use taskhub_infrastructure::database::sqlite::{
    SqliteProjectRepository, SqliteRunRepository, SqliteStepLogRepository, SqliteTaskRepository,
};
use taskhub_infrastructure::InMemoryMessageQueue;
use taskhub_runner::{
    ExecutorRegistry, OutputLine, RunnerService, StepContext, StepExecutor, StepOrchestrator,
    StepOutcome,
};

/// 按步骤config脚本化行为的测试执行器，并记录启动顺序
struct ScriptedExecutor {
    started: Arc<Mutex<Vec<i64>>>,
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Shell
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        output: mpsc::Sender<OutputLine>,
    ) -> HubResult<StepOutcome> {
        self.started.lock().await.push(ctx.step.id);
        match ctx.step.config["mode"].as_str().unwrap_or("ok") {
            "fail" => Ok(StepOutcome::failed(Some(1), "scripted failure")),
            "hang" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(StepOutcome::ok(Some(0)))
            }
            _ => {
                let line = match ctx.step.config["note"].as_str() {
                    Some(note) => taskhub_runner::params::apply_placeholders(note, &ctx.params),
                    None => format!("done {}", ctx.step.name),
                };
                let _ = output
                    .send(OutputLine {
                        stream: OutputStream::Stdout,
                        line,
                    })
                    .await;
                Ok(StepOutcome::ok(Some(0)))
            }
        }
    }
}

struct Harness {
    projects: Arc<dyn ProjectRepository>,
    tasks: Arc<dyn TaskRepository>,
    runs: Arc<dyn RunRepository>,
    step_logs: Arc<dyn StepLogRepository>,
    queue: Arc<dyn MessageQueue>,
    orchestrator: Arc<StepOrchestrator>,
    started: Arc<Mutex<Vec<i64>>>,
}

fn runner_config() -> RunnerConfig {
    RunnerConfig {
        enabled: true,
        runner_id: Some("runner-test".to_string()),
        max_concurrent_runs: 2,
        poll_interval_seconds: 1,
        cancel_grace_seconds: 0,
        python_bin: "python3".to_string(),
        work_dir: std::env::temp_dir().to_string_lossy().to_string(),
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        capacity: 1000,
        poll_interval_ms: 10,
        max_retries: 3,
    }
}

/// 日志批次首次入队失败的队列，其余消息直通
struct FlakyQueue {
    inner: InMemoryMessageQueue,
    chunk_failures_left: AtomicI32,
}

#[async_trait]
impl MessageQueue for FlakyQueue {
    async fn publish_message(&self, queue: &str, message: &Message) -> HubResult<()> {
        if matches!(message.message_type, MessageType::LogChunk(_))
            && self.chunk_failures_left.fetch_sub(1, Ordering::SeqCst) > 0
        {
            return Err(HubError::queue_error("queue full"));
        }
        self.inner.publish_message(queue, message).await
    }
    async fn consume_messages(&self, queue: &str) -> HubResult<Vec<Message>> {
        self.inner.consume_messages(queue).await
    }
    async fn create_queue(&self, queue: &str) -> HubResult<()> {
        self.inner.create_queue(queue).await
    }
    async fn get_queue_size(&self, queue: &str) -> HubResult<u32> {
        self.inner.get_queue_size(queue).await
    }
    async fn purge_queue(&self, queue: &str) -> HubResult<()> {
        self.inner.purge_queue(queue).await
    }
}

async fn harness() -> Harness {
    let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryMessageQueue::new(&queue_config()));
    harness_with_queue(queue).await
}

async fn harness_with_queue(queue: Arc<dyn MessageQueue>) -> Harness {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    ensure_schema(&pool).await.unwrap();

    let projects: Arc<dyn ProjectRepository> =
        Arc::new(SqliteProjectRepository::new(pool.clone()));
    let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let runs: Arc<dyn RunRepository> = Arc::new(SqliteRunRepository::new(pool.clone()));
    let step_logs: Arc<dyn StepLogRepository> =
        Arc::new(SqliteStepLogRepository::new(pool.clone()));

    let started = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(ScriptedExecutor {
        started: started.clone(),
    }));

    let orchestrator = Arc::new(StepOrchestrator::new(
        "runner-test".to_string(),
        runner_config(),
        projects.clone(),
        tasks.clone(),
        step_logs.clone(),
        queue.clone(),
        Arc::new(registry),
        None,
    ));

    Harness {
        projects,
        tasks,
        runs,
        step_logs,
        queue,
        orchestrator,
        started,
    }
}

async fn seed_task(h: &Harness) -> Task {
    let project = h
        .projects
        .create(&Project {
            id: 0,
            name: format!("proj-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
            description: None,
            sequence_mode: SequenceMode::Parallel,
            params: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    h.tasks
        .create(&Task {
            id: 0,
            project_id: project.id,
            name: "pipeline".to_string(),
            enabled: true,
            rank: 0,
            overlap_policy: OverlapPolicy::Skip,
            max_retries: 0,
            timeout_seconds: None,
            params: vec![],
            triggers: vec![],
            next_fire_at: None,
            last_fired_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap()
}

fn step(task_id: i64, name: &str, rank: i32, mode: &str, required: bool, depends: bool) -> Step {
    Step {
        id: 0,
        task_id,
        name: name.to_string(),
        rank,
        kind: StepKind::Shell,
        config: json!({ "mode": mode }),
        required,
        depends_on_previous: depends,
        timeout_seconds: None,
    }
}

async fn seed_run(h: &Harness, task_id: i64) -> Run {
    h.runs
        .create(&Run::new(task_id, RunCause::Manual, Utc::now()))
        .await
        .unwrap()
}

async fn status_events(
    queue: &Arc<dyn MessageQueue>,
) -> (Vec<StepStatusMessage>, Vec<RunStatusMessage>) {
    let mut steps = Vec::new();
    let mut runs = Vec::new();
    for message in queue.consume_messages(queues::STATUS).await.unwrap() {
        match message.message_type {
            MessageType::StepStatus(msg) => steps.push(msg),
            MessageType::RunStatusUpdate(msg) => runs.push(msg),
            _ => {}
        }
    }
    (steps, runs)
}

fn step_status(
    events: &[StepStatusMessage],
    step_id: i64,
    status: StepLogStatus,
) -> Option<StepStatusMessage> {
    events
        .iter()
        .find(|e| e.step_id == step_id && e.status == status)
        .cloned()
}

#[tokio::test]
async fn test_successful_run_walks_ranks_in_order() {
    let h = harness().await;
    let task = seed_task(&h).await;
    let extract = h
        .tasks
        .create_step(&step(task.id, "extract", 0, "ok", true, true))
        .await
        .unwrap();
    let transform = h
        .tasks
        .create_step(&step(task.id, "transform", 0, "ok", true, true))
        .await
        .unwrap();
    let load = h
        .tasks
        .create_step(&step(task.id, "load", 1, "ok", true, true))
        .await
        .unwrap();
    let run = seed_run(&h, task.id).await;

    let (_tx, cancel) = watch::channel(false);
    let status = h.orchestrator.execute_run(&run, cancel).await.unwrap();
    assert_eq!(status, RunStatus::Success);

    // rank 0 全部启动后才轮到rank 1
    let order = h.started.lock().await.clone();
    assert_eq!(order.len(), 3);
    assert_eq!(order[2], load.id);
    assert!(order[..2].contains(&extract.id) && order[..2].contains(&transform.id));

    let (step_events, run_events) = status_events(&h.queue).await;
    assert!(step_status(&step_events, extract.id, StepLogStatus::Success).is_some());
    assert!(step_status(&step_events, load.id, StepLogStatus::Success).is_some());
    assert_eq!(run_events.first().unwrap().status, RunStatus::Running);
    assert_eq!(run_events.last().unwrap().status, RunStatus::Success);

    // pending步骤记录由编排器直接创建
    assert_eq!(h.step_logs.find_by_run(run.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_log_lines_are_numbered_from_one() {
    let h = harness().await;
    let task = seed_task(&h).await;
    let only = h
        .tasks
        .create_step(&step(task.id, "emit", 0, "ok", true, true))
        .await
        .unwrap();
    let run = seed_run(&h, task.id).await;

    let (_tx, cancel) = watch::channel(false);
    h.orchestrator.execute_run(&run, cancel).await.unwrap();

    let chunks: Vec<_> = h
        .queue
        .consume_messages(queues::STATUS)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m.message_type {
            MessageType::LogChunk(chunk) => Some(chunk),
            _ => None,
        })
        .collect();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].step_id, only.id);
    assert_eq!(chunks[0].lines[0].seq, 1);
    assert_eq!(chunks[0].lines[0].line, "done emit");
}

#[tokio::test]
async fn test_required_failure_skips_dependent_steps() {
    let h = harness().await;
    let task = seed_task(&h).await;
    let failing = h
        .tasks
        .create_step(&step(task.id, "extract", 0, "fail", true, true))
        .await
        .unwrap();
    let dependent = h
        .tasks
        .create_step(&step(task.id, "load", 1, "ok", true, true))
        .await
        .unwrap();
    let independent = h
        .tasks
        .create_step(&step(task.id, "notify", 1, "ok", false, false))
        .await
        .unwrap();
    let run = seed_run(&h, task.id).await;

    let (_tx, cancel) = watch::channel(false);
    let status = h.orchestrator.execute_run(&run, cancel).await.unwrap();
    assert_eq!(status, RunStatus::Failed);

    let (step_events, _) = status_events(&h.queue).await;
    assert!(step_status(&step_events, failing.id, StepLogStatus::Failed).is_some());
    // depends_on_previous的步骤被跳过，不依赖前置的照常执行
    assert!(step_status(&step_events, dependent.id, StepLogStatus::Skipped).is_some());
    assert!(step_status(&step_events, independent.id, StepLogStatus::Success).is_some());
    assert!(!h.started.lock().await.contains(&dependent.id));
}

#[tokio::test]
async fn test_optional_failure_degrades_to_warning() {
    let h = harness().await;
    let task = seed_task(&h).await;
    h.tasks
        .create_step(&step(task.id, "optional", 0, "fail", false, true))
        .await
        .unwrap();
    let main = h
        .tasks
        .create_step(&step(task.id, "main", 1, "ok", true, true))
        .await
        .unwrap();
    let run = seed_run(&h, task.id).await;

    let (_tx, cancel) = watch::channel(false);
    let status = h.orchestrator.execute_run(&run, cancel).await.unwrap();
    assert_eq!(status, RunStatus::Warning);

    // 非必需步骤失败不阻断后续rank
    let (step_events, _) = status_events(&h.queue).await;
    assert!(step_status(&step_events, main.id, StepLogStatus::Success).is_some());
}

#[tokio::test]
async fn test_step_timeout_fails_run() {
    let h = harness().await;
    let task = seed_task(&h).await;
    let mut hung = step(task.id, "hang", 0, "hang", true, true);
    hung.timeout_seconds = Some(1);
    let hung = h.tasks.create_step(&hung).await.unwrap();
    let run = seed_run(&h, task.id).await;

    let (_tx, cancel) = watch::channel(false);
    let status = h.orchestrator.execute_run(&run, cancel).await.unwrap();
    assert_eq!(status, RunStatus::Failed);

    let (step_events, _) = status_events(&h.queue).await;
    let failed = step_status(&step_events, hung.id, StepLogStatus::Failed).unwrap();
    assert_eq!(failed.error_message.as_deref(), Some("步骤执行超时"));
}

#[tokio::test]
async fn test_cancellation_fails_running_and_skips_pending() {
    let h = harness().await;
    let task = seed_task(&h).await;
    let hung = h
        .tasks
        .create_step(&step(task.id, "hang", 0, "hang", true, true))
        .await
        .unwrap();
    let pending = h
        .tasks
        .create_step(&step(task.id, "later", 1, "ok", true, true))
        .await
        .unwrap();
    let run = seed_run(&h, task.id).await;

    let (cancel_tx, cancel) = watch::channel(false);
    let orchestrator = h.orchestrator.clone();
    let run_clone = run.clone();
    let handle =
        tokio::spawn(async move { orchestrator.execute_run(&run_clone, cancel).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel_tx.send(true).unwrap();

    let status = handle.await.unwrap().unwrap();
    assert_eq!(status, RunStatus::Cancelled);

    let (step_events, run_events) = status_events(&h.queue).await;
    let failed = step_status(&step_events, hung.id, StepLogStatus::Failed).unwrap();
    assert_eq!(failed.error_message.as_deref(), Some("运行被取消"));
    assert!(step_status(&step_events, pending.id, StepLogStatus::Skipped).is_some());
    assert_eq!(run_events.last().unwrap().status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_rerun_failed_skips_previously_succeeded_steps() {
    let h = harness().await;
    let task = seed_task(&h).await;
    let extract = h
        .tasks
        .create_step(&step(task.id, "extract", 0, "ok", true, true))
        .await
        .unwrap();
    let load = h
        .tasks
        .create_step(&step(task.id, "load", 1, "ok", true, true))
        .await
        .unwrap();

    // 源运行：extract成功、load失败
    let source = seed_run(&h, task.id).await;
    h.step_logs
        .create(&StepLog::pending(source.id, extract.id))
        .await
        .unwrap();
    h.step_logs
        .create(&StepLog::pending(source.id, load.id))
        .await
        .unwrap();
    h.step_logs
        .update_status(source.id, extract.id, StepLogStatus::Running, None, None)
        .await
        .unwrap();
    h.step_logs
        .update_status(source.id, extract.id, StepLogStatus::Success, Some(0), None)
        .await
        .unwrap();
    h.step_logs
        .update_status(source.id, load.id, StepLogStatus::Running, None, None)
        .await
        .unwrap();
    h.step_logs
        .update_status(source.id, load.id, StepLogStatus::Failed, Some(1), Some("boom"))
        .await
        .unwrap();

    let mut rerun = Run::new(task.id, RunCause::Manual, Utc::now());
    rerun.rerun_failed_of = Some(source.id);
    let rerun = h.runs.create(&rerun).await.unwrap();

    let (_tx, cancel) = watch::channel(false);
    let status = h.orchestrator.execute_run(&rerun, cancel).await.unwrap();
    assert_eq!(status, RunStatus::Success);

    // 源运行中已成功的步骤不再执行
    assert_eq!(h.started.lock().await.as_slice(), &[load.id]);
    let (step_events, _) = status_events(&h.queue).await;
    assert!(step_status(&step_events, extract.id, StepLogStatus::Skipped).is_some());
    assert!(step_status(&step_events, load.id, StepLogStatus::Success).is_some());
}

#[tokio::test]
async fn test_unregistered_step_kind_fails_step() {
    let h = harness().await;
    let task = seed_task(&h).await;
    let mut email = step(task.id, "mail", 0, "ok", true, true);
    email.kind = StepKind::Email;
    let email = h.tasks.create_step(&email).await.unwrap();
    let run = seed_run(&h, task.id).await;

    let (_tx, cancel) = watch::channel(false);
    let status = h.orchestrator.execute_run(&run, cancel).await.unwrap();
    assert_eq!(status, RunStatus::Failed);

    let (step_events, _) = status_events(&h.queue).await;
    let failed = step_status(&step_events, email.id, StepLogStatus::Failed).unwrap();
    assert!(failed.error_message.unwrap().contains("未注册"));
}

#[tokio::test]
async fn test_project_params_reach_executor_env() {
    let h = harness().await;
    let project = h
        .projects
        .create(&Project {
            id: 0,
            name: "with-params".to_string(),
            description: None,
            sequence_mode: SequenceMode::Parallel,
            params: vec![Param::new("TARGET", "warehouse")],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    let task = h
        .tasks
        .create(&Task {
            id: 0,
            project_id: project.id,
            name: "pipeline".to_string(),
            enabled: true,
            rank: 0,
            overlap_policy: OverlapPolicy::Skip,
            max_retries: 0,
            timeout_seconds: None,
            params: vec![Param::new("TARGET", "staging")],
            triggers: vec![],
            next_fire_at: None,
            last_fired_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    // 任务参数覆盖项目参数，{{TARGET}}展开进配置
    let mut emit = step(task.id, "emit", 0, "ok", true, true);
    emit.config = json!({ "mode": "ok", "note": "{{TARGET}}" });
    h.tasks.create_step(&emit).await.unwrap();
    let run = seed_run(&h, task.id).await;

    let (_tx, cancel) = watch::channel(false);
    let status = h.orchestrator.execute_run(&run, cancel).await.unwrap();
    assert_eq!(status, RunStatus::Success);

    let chunk = h
        .queue
        .consume_messages(queues::STATUS)
        .await
        .unwrap()
        .into_iter()
        .find_map(|m| match m.message_type {
            MessageType::LogChunk(chunk) => Some(chunk),
            _ => None,
        })
        .unwrap();
    assert_eq!(chunk.lines[0].line, "staging");
}

#[tokio::test]
async fn test_service_claims_and_executes_run() {
    let h = harness().await;
    let task = seed_task(&h).await;
    h.tasks
        .create_step(&step(task.id, "only", 0, "ok", true, true))
        .await
        .unwrap();
    let run = seed_run(&h, task.id).await;

    let service = RunnerService::new(
        "runner-test".to_string(),
        runner_config(),
        h.runs.clone(),
        h.queue.clone(),
        h.orchestrator.clone(),
    );

    h.queue
        .publish_message(
            queues::RUNS,
            &taskhub_domain::messages::Message::execute_run(
                taskhub_domain::messages::ExecuteRunMessage {
                    run_id: run.id,
                    task_id: task.id,
                    task_name: task.name.clone(),
                },
            ),
        )
        .await
        .unwrap();
    service.poll_once().await.unwrap();

    // 等待后台执行结束
    for _ in 0..50 {
        if service.active_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(service.active_count().await, 0);

    let claimed = h.runs.find_by_id(run.id).await.unwrap().unwrap();
    assert_eq!(claimed.runner_id.as_deref(), Some("runner-test"));
    let (_, run_events) = status_events(&h.queue).await;
    assert_eq!(run_events.last().unwrap().status, RunStatus::Success);
}

#[tokio::test]
async fn test_orchestration_error_reports_failed_terminal_status() {
    let h = harness().await;
    // 损坏的密文让参数解析在任何步骤执行之前出错
    let project = h
        .projects
        .create(&Project {
            id: 0,
            name: "secret-proj".to_string(),
            description: None,
            sequence_mode: SequenceMode::Parallel,
            params: vec![Param {
                key: "db_password".to_string(),
                value: "enc:!!!".to_string(),
                secret: true,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    let task = h
        .tasks
        .create(&Task {
            id: 0,
            project_id: project.id,
            name: "pipeline".to_string(),
            enabled: true,
            rank: 0,
            overlap_policy: OverlapPolicy::Skip,
            max_retries: 0,
            timeout_seconds: None,
            params: vec![],
            triggers: vec![],
            next_fire_at: None,
            last_fired_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    h.tasks
        .create_step(&step(task.id, "emit", 0, "ok", true, true))
        .await
        .unwrap();
    let run = seed_run(&h, task.id).await;

    let key = general_purpose::STANDARD.encode([5u8; 32]);
    let cipher = SecretCipher::from_base64_key(&key).unwrap();
    let orchestrator = StepOrchestrator::new(
        "runner-test".to_string(),
        runner_config(),
        h.projects.clone(),
        h.tasks.clone(),
        h.step_logs.clone(),
        h.queue.clone(),
        Arc::new(ExecutorRegistry::new()),
        Some(Arc::new(cipher)),
    );

    let (_tx, cancel) = watch::channel(false);
    let status = orchestrator.execute_run(&run, cancel).await.unwrap();
    assert_eq!(status, RunStatus::Failed);

    // 编排出错的运行也上报终态，不会停留在running
    let (_, run_events) = status_events(&h.queue).await;
    assert_eq!(run_events.first().unwrap().status, RunStatus::Running);
    let last = run_events.last().unwrap();
    assert_eq!(last.status, RunStatus::Failed);
    assert!(last.error_message.is_some());
}

#[tokio::test]
async fn test_run_deadline_skips_later_ranks() {
    let h = harness().await;
    let base = seed_task(&h).await;
    let mut timed = base.clone();
    timed.timeout_seconds = Some(1);
    let task = h.tasks.update(&timed).await.unwrap();

    let hung = h
        .tasks
        .create_step(&step(task.id, "hang", 0, "hang", false, true))
        .await
        .unwrap();
    let later = h
        .tasks
        .create_step(&step(task.id, "later", 1, "ok", true, false))
        .await
        .unwrap();
    let run = seed_run(&h, task.id).await;

    let (_tx, cancel) = watch::channel(false);
    let status = h.orchestrator.execute_run(&run, cancel).await.unwrap();
    assert_eq!(status, RunStatus::Failed);

    // deadline已过：未开始的步骤跳过，而不是逐个启动再超时
    let (step_events, run_events) = status_events(&h.queue).await;
    let timed_out = step_status(&step_events, hung.id, StepLogStatus::Failed).unwrap();
    assert_eq!(timed_out.error_message.as_deref(), Some("步骤执行超时"));
    assert!(step_status(&step_events, later.id, StepLogStatus::Skipped).is_some());
    assert!(!h.started.lock().await.contains(&later.id));
    assert_eq!(
        run_events.last().unwrap().error_message.as_deref(),
        Some("运行执行超时")
    );
}

#[tokio::test]
async fn test_log_batch_survives_transient_queue_error() {
    let queue: Arc<dyn MessageQueue> = Arc::new(FlakyQueue {
        inner: InMemoryMessageQueue::new(&queue_config()),
        chunk_failures_left: AtomicI32::new(1),
    });
    let h = harness_with_queue(queue).await;
    let task = seed_task(&h).await;
    h.tasks
        .create_step(&step(task.id, "emit", 0, "ok", true, true))
        .await
        .unwrap();
    let run = seed_run(&h, task.id).await;

    let (_tx, cancel) = watch::channel(false);
    let status = h.orchestrator.execute_run(&run, cancel).await.unwrap();
    assert_eq!(status, RunStatus::Success);

    // 首次入队失败后退避重试，日志批次最终送达
    let chunks: Vec<_> = h
        .queue
        .consume_messages(queues::STATUS)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m.message_type {
            MessageType::LogChunk(chunk) => Some(chunk),
            _ => None,
        })
        .collect();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].lines[0].line, "done emit");
}
