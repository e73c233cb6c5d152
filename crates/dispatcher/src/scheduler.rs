use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use taskhub_config::SchedulerConfig;
use taskhub_domain::entities::{RunCause, Task};
use taskhub_domain::messages::{Message, RunRequestMessage};
use taskhub_domain::messaging::{queues, MessageQueue};
use taskhub_domain::repositories::TaskRepository;
use taskhub_errors::HubResult;

use crate::trigger::TriggerEngine;

/// 调度器守护进程
///
/// 周期扫描`next_fire_at`已到期的任务，向分发队列投递RunRequest。
/// 只有投递成功才推进触发时间水位，投递失败时本次触发延迟而非丢失。
pub struct TaskScheduler {
    task_repo: Arc<dyn TaskRepository>,
    message_queue: Arc<dyn MessageQueue>,
    config: SchedulerConfig,
}

const ENQUEUE_ATTEMPTS: u32 = 3;

impl TaskScheduler {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        message_queue: Arc<dyn MessageQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            task_repo,
            message_queue,
            config,
        }
    }

    /// 启动时从存储重算全部任务的下次触发时间（重启安全）
    pub async fn rebuild_schedule(&self) -> HubResult<()> {
        info!("开始重建调度表");
        let tasks = self.task_repo.find_all().await?;
        let now = Utc::now();
        let mut armed = 0usize;

        for task in &tasks {
            if !task.is_schedulable() {
                if task.next_fire_at.is_some() {
                    self.task_repo.update_fire_times(task.id, None, None).await?;
                }
                continue;
            }
            match self.compute_next_fire(task, now) {
                Ok(next) => {
                    self.task_repo.update_fire_times(task.id, next, None).await?;
                    if next.is_some() {
                        armed += 1;
                    }
                }
                Err(e) => {
                    // 无效触发器不允许拖垮守护进程
                    warn!("任务 {} 的触发器无效, 清除调度: {}", task.id, e);
                    self.task_repo.update_fire_times(task.id, None, None).await?;
                }
            }
        }
        info!("调度表重建完成, {} 个任务已编排", armed);
        Ok(())
    }

    /// 任务变更后重算单个任务
    pub async fn rearm_task(&self, task_id: i64) -> HubResult<()> {
        let Some(task) = self.task_repo.find_by_id(task_id).await? else {
            return Ok(());
        };
        let next = if task.is_schedulable() {
            self.compute_next_fire(&task, Utc::now()).unwrap_or_else(|e| {
                warn!("任务 {} 的触发器无效: {}", task.id, e);
                None
            })
        } else {
            None
        };
        self.task_repo.update_fire_times(task.id, next, None).await
    }

    fn compute_next_fire(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> HubResult<Option<DateTime<Utc>>> {
        // 未触发过的任务以当前时间为基准；已触发的以水位为基准，
        // 保证宕机期间错过的触发在重启后仍然补发一次
        let after = task.last_fired_at.unwrap_or(now);
        TriggerEngine::next_fire_of(&task.triggers, after, task.last_fired_at)
    }

    /// 单轮扫描；返回本轮触发的任务数
    pub async fn scan_once(&self, now: DateTime<Utc>) -> HubResult<usize> {
        let due_tasks = self
            .task_repo
            .find_due(now, self.config.scan_batch_size)
            .await?;
        let mut fired = 0usize;

        for task in due_tasks {
            match self.fire_task(&task, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => error!("任务 {} 触发失败: {}", task.id, e),
            }
        }

        if fired > 0 {
            info!("本轮调度触发了 {} 个任务", fired);
        }
        Ok(fired)
    }

    /// 先入队后推进水位；入队彻底失败时水位不动，下一轮重试
    async fn fire_task(&self, task: &Task, now: DateTime<Utc>) -> HubResult<bool> {
        let message = Message::run_request(RunRequestMessage {
            task_id: task.id,
            cause: RunCause::Scheduled,
            scheduled_at: task.next_fire_at.unwrap_or(now),
            rerun_failed_of: None,
            retry_count: 0,
        });

        let mut published = false;
        for attempt in 1..=ENQUEUE_ATTEMPTS {
            match self.message_queue.publish_message(queues::DISPATCH, &message).await {
                Ok(()) => {
                    published = true;
                    break;
                }
                Err(e) if attempt < ENQUEUE_ATTEMPTS => {
                    warn!("任务 {} 入队失败(第{}次), 退避后重试: {}", task.id, attempt, e);
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => {
                    warn!("任务 {} 入队失败, 本次触发推迟到下一轮: {}", task.id, e);
                }
            }
        }
        if !published {
            return Ok(false);
        }

        let next = TriggerEngine::next_fire_of(&task.triggers, now, Some(now))?;
        self.task_repo
            .update_fire_times(task.id, next, Some(now))
            .await?;
        debug!(
            "任务 {} 已触发, 下次触发: {:?}",
            task.id,
            next.map(|t| t.to_rfc3339())
        );
        Ok(true)
    }

    /// 手动触发（run-now / 重跑失败步骤），绕过触发器直接入队
    pub async fn trigger_manual(
        &self,
        task_id: i64,
        rerun_failed_of: Option<i64>,
    ) -> HubResult<()> {
        let message = Message::run_request(RunRequestMessage {
            task_id,
            cause: RunCause::Manual,
            scheduled_at: Utc::now(),
            rerun_failed_of,
            retry_count: 0,
        });
        self.message_queue
            .publish_message(queues::DISPATCH, &message)
            .await?;
        info!("任务 {} 已手动触发", task_id);
        Ok(())
    }

    /// 扫描循环，直到收到停机信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> HubResult<()> {
        if let Err(e) = self.rebuild_schedule().await {
            error!("调度表重建失败: {}", e);
            return Err(e);
        }

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.scan_interval_seconds));
        info!(
            "调度器已启动, 扫描间隔 {} 秒",
            self.config.scan_interval_seconds
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once(Utc::now()).await {
                        error!("调度扫描出错: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("调度器收到停机信号");
                    break;
                }
            }
        }
        Ok(())
    }
}
