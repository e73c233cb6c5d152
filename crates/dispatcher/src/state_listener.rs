use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use taskhub_config::QueueConfig;
use taskhub_domain::entities::RunStatus;
use taskhub_domain::messages::{
    LogChunkMessage, Message, MessageType, RunRequestMessage, RunStatusMessage, StepStatusMessage,
};
use taskhub_domain::messaging::{queues, MessageQueue};
use taskhub_domain::repositories::{RunRepository, StepLogRepository, TaskRepository};
use taskhub_errors::{HubError, HubResult};

use crate::dispatch::RunDispatcher;

/// 状态监听器
///
/// 消费runner上报的状态与日志并落库。队列是至少一次投递，
/// 所有写入幂等：日志行按(run_id, step_id, seq)去重，状态写入有单向推进保护。
pub struct StateListener {
    run_repo: Arc<dyn RunRepository>,
    step_log_repo: Arc<dyn StepLogRepository>,
    task_repo: Arc<dyn TaskRepository>,
    message_queue: Arc<dyn MessageQueue>,
    dispatcher: Arc<RunDispatcher>,
    poll_interval: Duration,
    max_retries: i32,
}

impl StateListener {
    pub fn new(
        run_repo: Arc<dyn RunRepository>,
        step_log_repo: Arc<dyn StepLogRepository>,
        task_repo: Arc<dyn TaskRepository>,
        message_queue: Arc<dyn MessageQueue>,
        dispatcher: Arc<RunDispatcher>,
        queue_config: &QueueConfig,
    ) -> Self {
        Self {
            run_repo,
            step_log_repo,
            task_repo,
            message_queue,
            dispatcher,
            poll_interval: Duration::from_millis(queue_config.poll_interval_ms),
            max_retries: queue_config.max_retries,
        }
    }

    pub async fn process_message(&self, message: &Message) -> HubResult<()> {
        match &message.message_type {
            MessageType::StepStatus(status) => self.process_step_status(status).await,
            MessageType::RunStatusUpdate(status) => self.process_run_status(status).await,
            MessageType::LogChunk(chunk) => self.process_log_chunk(chunk).await,
            _ => {
                debug!("状态队列忽略消息类型: {}", message.message_type_str());
                Ok(())
            }
        }
    }

    async fn process_step_status(&self, status: &StepStatusMessage) -> HubResult<()> {
        let updated = self
            .step_log_repo
            .update_status(
                status.run_id,
                status.step_id,
                status.status,
                status.exit_code,
                status.error_message.as_deref(),
            )
            .await?;
        if updated {
            debug!(
                "步骤状态已更新: run={} step={} status={}",
                status.run_id,
                status.step_id,
                status.status.as_str()
            );
        }
        Ok(())
    }

    async fn process_log_chunk(&self, chunk: &LogChunkMessage) -> HubResult<()> {
        let inserted = self.step_log_repo.append_lines(&chunk.lines).await?;
        debug!(
            "日志写入: run={} step={} 新增{}行(共{}行)",
            chunk.run_id,
            chunk.step_id,
            inserted,
            chunk.lines.len()
        );
        Ok(())
    }

    async fn process_run_status(&self, status: &RunStatusMessage) -> HubResult<()> {
        let updated = self
            .run_repo
            .update_status(status.run_id, status.status, status.error_message.as_deref())
            .await?;
        if !updated {
            // 重复或迟到的上报，幂等忽略
            return Ok(());
        }

        match status.status {
            RunStatus::Running => {
                self.run_repo
                    .mark_started(status.run_id, status.timestamp)
                    .await?;
            }
            s if s.is_terminal() => {
                self.run_repo
                    .mark_completed(status.run_id, status.timestamp)
                    .await?;
                self.after_terminal(status.run_id, s).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// 终态后置动作：失败重试派生 + 排队运行晋升
    async fn after_terminal(&self, run_id: i64, status: RunStatus) -> HubResult<()> {
        let Some(run) = self.run_repo.find_by_id(run_id).await? else {
            return Ok(());
        };

        if status == RunStatus::Failed {
            if let Some(task) = self.task_repo.find_by_id(run.task_id).await? {
                if run.retry_count < task.max_retries {
                    info!(
                        "运行 {} 失败, 派生重试 {}/{}",
                        run.id,
                        run.retry_count + 1,
                        task.max_retries
                    );
                    let message = Message::run_request(RunRequestMessage {
                        task_id: task.id,
                        cause: taskhub_domain::entities::RunCause::Retry,
                        scheduled_at: Utc::now(),
                        rerun_failed_of: run.rerun_failed_of,
                        retry_count: run.retry_count + 1,
                    });
                    self.message_queue
                        .publish_message(queues::DISPATCH, &message)
                        .await?;
                } else if task.max_retries > 0 {
                    warn!("运行 {} 失败且重试次数已用尽", run.id);
                }
            }
        }

        self.dispatcher.on_run_terminal(run.task_id).await
    }

    /// 消费一轮状态队列
    pub async fn poll_once(&self) -> HubResult<()> {
        let messages = self.message_queue.consume_messages(queues::STATUS).await?;
        for message in &messages {
            if let Err(e) = self.process_message(message).await {
                self.requeue_or_drop(message, &e).await;
            }
        }
        Ok(())
    }

    /// 状态与日志上报重投回队列，落库幂等所以重复投递无害
    async fn requeue_or_drop(&self, message: &Message, error: &HubError) {
        if !error.is_retryable() || message.is_retry_exhausted(self.max_retries) {
            error!(
                "处理状态消息失败, 不再重投(已重试{}次): message={} {}",
                message.retry_count, message.id, error
            );
            return;
        }
        let mut retry = message.clone();
        retry.increment_retry();
        warn!(
            "处理状态消息失败, 重投({}/{}): message={} {}",
            retry.retry_count, self.max_retries, message.id, error
        );
        if let Err(e) = self
            .message_queue
            .publish_message(queues::STATUS, &retry)
            .await
        {
            error!("消息重投失败: message={} {}", message.id, e);
        }
    }

    /// 消费循环，直到收到停机信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> HubResult<()> {
        info!("状态监听器已启动");
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("消费状态队列失败: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("状态监听器收到停机信号");
                    break;
                }
            }
        }
        Ok(())
    }
}
