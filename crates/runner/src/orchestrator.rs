//! 步骤编排
//!
//! 同rank步骤并发执行，rank之间串行推进。状态与日志经status队列上报，
//! 由状态监听器幂等落库；编排器只直接写入pending步骤记录。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use taskhub_config::{RunnerConfig, SecretCipher};
use taskhub_domain::entities::{LogLine, Run, RunStatus, Step, StepLog, StepLogStatus, Task};
use taskhub_domain::messages::{LogChunkMessage, Message, RunStatusMessage, StepStatusMessage};
use taskhub_domain::messaging::{queues, MessageQueue};
use taskhub_domain::repositories::{
    ProjectRepository, StepLogRepository, TaskRepository,
};
use taskhub_errors::{HubError, HubResult};

use crate::executors::{OutputLine, StepContext};
use crate::params;
use crate::registry::ExecutorRegistry;

/// 日志行攒批上限，达到即发送一个LogChunk
const LOG_BATCH_SIZE: usize = 50;

/// 日志批次入队的重试次数
const LOG_PUBLISH_ATTEMPTS: u32 = 3;

/// 单个步骤的执行结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepResult {
    Success,
    Failed { required: bool },
    Cancelled,
}

pub struct StepOrchestrator {
    runner_id: String,
    config: RunnerConfig,
    project_repo: Arc<dyn ProjectRepository>,
    task_repo: Arc<dyn TaskRepository>,
    step_log_repo: Arc<dyn StepLogRepository>,
    message_queue: Arc<dyn MessageQueue>,
    registry: Arc<ExecutorRegistry>,
    cipher: Option<Arc<SecretCipher>>,
}

impl StepOrchestrator {
    pub fn new(
        runner_id: String,
        config: RunnerConfig,
        project_repo: Arc<dyn ProjectRepository>,
        task_repo: Arc<dyn TaskRepository>,
        step_log_repo: Arc<dyn StepLogRepository>,
        message_queue: Arc<dyn MessageQueue>,
        registry: Arc<ExecutorRegistry>,
        cipher: Option<Arc<SecretCipher>>,
    ) -> Self {
        Self {
            runner_id,
            config,
            project_repo,
            task_repo,
            step_log_repo,
            message_queue,
            registry,
            cipher,
        }
    }

    /// 执行一次运行直至终态，返回上报的终态
    pub async fn execute_run(
        &self,
        run: &Run,
        cancel: watch::Receiver<bool>,
    ) -> HubResult<RunStatus> {
        let task = match self.task_repo.find_by_id(run.task_id).await? {
            Some(task) => task,
            None => {
                self.publish_run_status(run.id, RunStatus::Failed, Some("任务不存在"))
                    .await?;
                return Ok(RunStatus::Failed);
            }
        };

        info!(
            "开始执行运行: run={} task={} cause={:?}",
            run.id, task.name, run.cause
        );
        self.publish_run_status(run.id, RunStatus::Running, None)
            .await?;

        // 编排环节出错同样要落一个终态，运行不能停留在running
        let status = match self.drive_run(run, &task, cancel).await {
            Ok(status) => status,
            Err(e) => {
                error!("运行编排出错: run={} {}", run.id, e);
                self.publish_run_status(run.id, RunStatus::Failed, Some(&e.to_string()))
                    .await?;
                RunStatus::Failed
            }
        };

        info!("运行结束: run={} status={:?}", run.id, status);
        Ok(status)
    }

    async fn drive_run(
        &self,
        run: &Run,
        task: &Task,
        cancel: watch::Receiver<bool>,
    ) -> HubResult<RunStatus> {
        let started_at = Utc::now();
        let resolved_params = self.resolve_params(task, started_at).await?;
        let steps = self.task_repo.find_steps(task.id).await?;
        for step in &steps {
            self.step_log_repo
                .create(&StepLog::pending(run.id, step.id))
                .await?;
        }

        // 重跑失败步骤：源运行中已成功的步骤直接跳过
        let pre_skipped = self.pre_skipped_steps(run, &steps).await?;

        let deadline = task
            .timeout_seconds
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs.max(0) as u64));

        self.run_ranks(run, &steps, &pre_skipped, resolved_params, deadline, cancel)
            .await
    }

    async fn resolve_params(
        &self,
        task: &Task,
        started_at: chrono::DateTime<Utc>,
    ) -> HubResult<std::collections::HashMap<String, String>> {
        let project = self
            .project_repo
            .find_by_id(task.project_id)
            .await?
            .ok_or_else(|| HubError::ProjectNotFound { id: task.project_id })?;
        params::resolve(
            &project.params,
            &task.params,
            started_at,
            self.cipher.as_deref(),
        )
    }

    async fn pre_skipped_steps(&self, run: &Run, steps: &[Step]) -> HubResult<HashSet<i64>> {
        let mut skipped = HashSet::new();
        let Some(source_run_id) = run.rerun_failed_of else {
            return Ok(skipped);
        };
        let source_logs = self.step_log_repo.find_by_run(source_run_id).await?;
        let succeeded: HashSet<i64> = source_logs
            .iter()
            .filter(|log| log.status == StepLogStatus::Success)
            .map(|log| log.step_id)
            .collect();
        for step in steps {
            if succeeded.contains(&step.id) {
                debug!(
                    "步骤在源运行中已成功，跳过: run={} step={} source={}",
                    run.id, step.id, source_run_id
                );
                self.publish_step_status(run.id, step.id, StepLogStatus::Skipped, None, None)
                    .await?;
                skipped.insert(step.id);
            }
        }
        Ok(skipped)
    }

    async fn run_ranks(
        &self,
        run: &Run,
        steps: &[Step],
        pre_skipped: &HashSet<i64>,
        resolved_params: std::collections::HashMap<String, String>,
        deadline: Option<tokio::time::Instant>,
        cancel: watch::Receiver<bool>,
    ) -> HubResult<RunStatus> {
        let mut required_failed: Option<String> = None;
        let mut optional_failed = false;
        let mut cancelled = false;
        let mut deadline_exceeded = false;

        let mut ranks: Vec<i32> = steps.iter().map(|s| s.rank).collect();
        ranks.sort_unstable();
        ranks.dedup();

        for rank in ranks {
            let rank_steps: Vec<&Step> = steps.iter().filter(|s| s.rank == rank).collect();
            if deadline.is_some_and(|at| tokio::time::Instant::now() >= at) {
                deadline_exceeded = true;
            }

            let mut executable = Vec::new();
            for step in rank_steps {
                if pre_skipped.contains(&step.id) {
                    continue;
                }
                if cancelled || *cancel.borrow() {
                    cancelled = true;
                    self.publish_step_status(run.id, step.id, StepLogStatus::Skipped, None, None)
                        .await?;
                    continue;
                }
                // 整体deadline已过，等同取消：未开始的步骤跳过而非逐个超时
                if deadline_exceeded {
                    self.publish_step_status(run.id, step.id, StepLogStatus::Skipped, None, None)
                        .await?;
                    continue;
                }
                if required_failed.is_some() && step.depends_on_previous {
                    debug!("前置必需步骤失败，跳过: run={} step={}", run.id, step.id);
                    self.publish_step_status(run.id, step.id, StepLogStatus::Skipped, None, None)
                        .await?;
                    continue;
                }
                executable.push(step);
            }

            // 同rank并发，全部结束后才进入下一rank
            let futures = executable.iter().map(|step| {
                self.execute_step(run, step, &resolved_params, deadline, cancel.clone())
            });
            for result in join_all(futures).await {
                match result? {
                    StepResult::Success => {}
                    StepResult::Failed { required: true } => {
                        if required_failed.is_none() {
                            required_failed = Some("必需步骤失败".to_string());
                        }
                    }
                    StepResult::Failed { required: false } => optional_failed = true,
                    StepResult::Cancelled => cancelled = true,
                }
            }
        }

        let (status, error_message) = if cancelled {
            (RunStatus::Cancelled, Some("运行被取消".to_string()))
        } else if let Some(message) = required_failed {
            (RunStatus::Failed, Some(message))
        } else if deadline_exceeded {
            (RunStatus::Failed, Some("运行执行超时".to_string()))
        } else if optional_failed {
            (RunStatus::Warning, Some("非必需步骤失败".to_string()))
        } else {
            (RunStatus::Success, None)
        };
        self.publish_run_status(run.id, status, error_message.as_deref())
            .await?;
        Ok(status)
    }

    async fn execute_step(
        &self,
        run: &Run,
        step: &Step,
        resolved_params: &std::collections::HashMap<String, String>,
        deadline: Option<tokio::time::Instant>,
        mut cancel: watch::Receiver<bool>,
    ) -> HubResult<StepResult> {
        self.publish_step_status(run.id, step.id, StepLogStatus::Running, None, None)
            .await?;

        let executor = match self.registry.get(step.kind) {
            Ok(executor) => executor,
            Err(e) => {
                error!("步骤无可用执行器: run={} step={} {}", run.id, step.id, e);
                self.publish_step_status(
                    run.id,
                    step.id,
                    StepLogStatus::Failed,
                    None,
                    Some(&e.to_string()),
                )
                .await?;
                return Ok(StepResult::Failed {
                    required: step.required,
                });
            }
        };

        let ctx = StepContext {
            run_id: run.id,
            step: step.clone(),
            params: resolved_params.clone(),
            work_dir: PathBuf::from(&self.config.work_dir),
            python_bin: self.config.python_bin.clone(),
        };

        let (tx, rx) = mpsc::channel::<OutputLine>(256);
        let forwarder = self.spawn_log_forwarder(run.id, step.id, rx);

        // 生效超时取步骤超时与运行整体deadline中更早者
        let step_deadline = step
            .timeout_seconds
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs.max(0) as u64));
        let effective = match (step_deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        enum Interruption {
            Timeout,
            Cancelled,
        }

        let exec_fut = executor.execute(&ctx, tx);
        tokio::pin!(exec_fut);
        let outcome = tokio::select! {
            res = &mut exec_fut => Ok(res),
            _ = async {
                match effective {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending::<()>().await,
                }
            } => Err(Interruption::Timeout),
            _ = async {
                loop {
                    if *cancel.borrow() {
                        break;
                    }
                    if cancel.changed().await.is_err() {
                        futures::future::pending::<()>().await;
                    }
                }
            } => Err(Interruption::Cancelled),
        };

        let result = match outcome {
            Ok(Ok(outcome)) => {
                if outcome.success {
                    self.publish_step_status(
                        run.id,
                        step.id,
                        StepLogStatus::Success,
                        outcome.exit_code,
                        None,
                    )
                    .await?;
                    StepResult::Success
                } else {
                    let message = outcome
                        .error_message
                        .unwrap_or_else(|| "步骤执行失败".to_string());
                    warn!("步骤失败: run={} step={} {}", run.id, step.id, message);
                    self.publish_step_status(
                        run.id,
                        step.id,
                        StepLogStatus::Failed,
                        outcome.exit_code,
                        Some(&message),
                    )
                    .await?;
                    StepResult::Failed {
                        required: step.required,
                    }
                }
            }
            Ok(Err(e)) => {
                error!("步骤执行出错: run={} step={} {}", run.id, step.id, e);
                self.publish_step_status(
                    run.id,
                    step.id,
                    StepLogStatus::Failed,
                    None,
                    Some(&e.to_string()),
                )
                .await?;
                StepResult::Failed {
                    required: step.required,
                }
            }
            Err(interruption) => {
                // 中断路径：先终止子进程，宽限期后记录终态
                self.registry.cancel_step(run.id, step.id).await;
                tokio::time::sleep(Duration::from_secs(self.config.cancel_grace_seconds)).await;
                match interruption {
                    Interruption::Timeout => {
                        warn!("步骤超时: run={} step={}", run.id, step.id);
                        self.publish_step_status(
                            run.id,
                            step.id,
                            StepLogStatus::Failed,
                            None,
                            Some("步骤执行超时"),
                        )
                        .await?;
                        StepResult::Failed {
                            required: step.required,
                        }
                    }
                    Interruption::Cancelled => {
                        info!("步骤被取消: run={} step={}", run.id, step.id);
                        self.publish_step_status(
                            run.id,
                            step.id,
                            StepLogStatus::Failed,
                            None,
                            Some("运行被取消"),
                        )
                        .await?;
                        StepResult::Cancelled
                    }
                }
            }
        };

        // 发送端已关闭，等待日志批次全部入队
        if let Err(e) = forwarder.await {
            warn!("日志转发任务异常: run={} step={} {}", run.id, step.id, e);
        }
        Ok(result)
    }

    /// 输出行编号并攒批为LogChunk
    fn spawn_log_forwarder(
        &self,
        run_id: i64,
        step_id: i64,
        mut rx: mpsc::Receiver<OutputLine>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.message_queue);
        let runner_id = self.runner_id.clone();
        tokio::spawn(async move {
            let mut seq = 0i64;
            let mut batch: Vec<LogLine> = Vec::with_capacity(LOG_BATCH_SIZE);
            while let Some(output) = rx.recv().await {
                seq += 1;
                batch.push(LogLine {
                    run_id,
                    step_id,
                    seq,
                    stream: output.stream,
                    line: output.line,
                    logged_at: Utc::now(),
                });
                if batch.len() >= LOG_BATCH_SIZE {
                    flush_batch(&queue, run_id, step_id, &runner_id, &mut batch).await;
                }
            }
            if !batch.is_empty() {
                flush_batch(&queue, run_id, step_id, &runner_id, &mut batch).await;
            }
        })
    }

    async fn publish_step_status(
        &self,
        run_id: i64,
        step_id: i64,
        status: StepLogStatus,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> HubResult<()> {
        let message = Message::step_status(StepStatusMessage {
            run_id,
            step_id,
            status,
            exit_code,
            error_message: error_message.map(|s| s.to_string()),
            runner_id: self.runner_id.clone(),
            timestamp: Utc::now(),
        });
        self.message_queue
            .publish_message(queues::STATUS, &message)
            .await
    }

    async fn publish_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> HubResult<()> {
        let message = Message::run_status(RunStatusMessage {
            run_id,
            status,
            error_message: error_message.map(|s| s.to_string()),
            runner_id: self.runner_id.clone(),
            timestamp: Utc::now(),
        });
        self.message_queue
            .publish_message(queues::STATUS, &message)
            .await
    }
}

async fn flush_batch(
    queue: &Arc<dyn MessageQueue>,
    run_id: i64,
    step_id: i64,
    runner_id: &str,
    batch: &mut Vec<LogLine>,
) {
    let count = batch.len();
    let message = Message::log_chunk(LogChunkMessage {
        run_id,
        step_id,
        lines: std::mem::take(batch),
        runner_id: runner_id.to_string(),
    });
    for attempt in 1..=LOG_PUBLISH_ATTEMPTS {
        match queue.publish_message(queues::STATUS, &message).await {
            Ok(()) => return,
            Err(e) if attempt < LOG_PUBLISH_ATTEMPTS => {
                warn!(
                    "日志批次入队失败(第{}次), 退避后重试: run={} step={} {}",
                    attempt, run_id, step_id, e
                );
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
            Err(e) => {
                error!(
                    "日志批次入队失败, {} 行输出丢失: run={} step={} {}",
                    count, run_id, step_id, e
                );
            }
        }
    }
}
