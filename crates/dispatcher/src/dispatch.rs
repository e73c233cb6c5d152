use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use taskhub_config::QueueConfig;
use taskhub_domain::entities::{OverlapPolicy, Run, RunCause, RunStatus, SequenceMode, Task};
use taskhub_domain::messages::{
    ExecuteRunMessage, Message, MessageType, RunRequestMessage, RunStatusMessage,
};
use taskhub_domain::messaging::{queues, MessageQueue};
use taskhub_domain::repositories::{ProjectRepository, RunRepository, TaskRepository};
use taskhub_errors::{HubError, HubResult};

/// 运行分发器
///
/// 消费RunRequest，按并发策略与项目串行门控决定：丢弃、入库排队、
/// 或入库并立即下发ExecuteRun。下发是非阻塞交接，不等待执行结束。
pub struct RunDispatcher {
    project_repo: Arc<dyn ProjectRepository>,
    task_repo: Arc<dyn TaskRepository>,
    run_repo: Arc<dyn RunRepository>,
    message_queue: Arc<dyn MessageQueue>,
    poll_interval: Duration,
    max_retries: i32,
}

impl RunDispatcher {
    pub fn new(
        project_repo: Arc<dyn ProjectRepository>,
        task_repo: Arc<dyn TaskRepository>,
        run_repo: Arc<dyn RunRepository>,
        message_queue: Arc<dyn MessageQueue>,
        queue_config: &QueueConfig,
    ) -> Self {
        Self {
            project_repo,
            task_repo,
            run_repo,
            message_queue,
            poll_interval: Duration::from_millis(queue_config.poll_interval_ms),
            max_retries: queue_config.max_retries,
        }
    }

    /// 启动恢复：队列在进程内，宕机时在途消息随进程一并丢失，以存储为准重建。
    /// 上一进程遗留的running运行标记失败，queued运行重新放行。
    pub async fn recover(&self) -> HubResult<()> {
        let active = self.run_repo.find_active().await?;
        if active.is_empty() {
            return Ok(());
        }

        let mut queued_tasks = Vec::new();
        for run in &active {
            match run.status {
                RunStatus::Running => {
                    warn!("发现上一进程遗留的running运行 {}, 标记失败", run.id);
                    let message = Message::run_status(RunStatusMessage {
                        run_id: run.id,
                        status: RunStatus::Failed,
                        error_message: Some("进程重启时运行中断".to_string()),
                        runner_id: run.runner_id.clone().unwrap_or_default(),
                        timestamp: Utc::now(),
                    });
                    self.message_queue
                        .publish_message(queues::STATUS, &message)
                        .await?;
                }
                RunStatus::Queued => {
                    if !queued_tasks.contains(&run.task_id) {
                        queued_tasks.push(run.task_id);
                    }
                }
                _ => {}
            }
        }
        for task_id in queued_tasks {
            if let Some(task) = self.task_repo.find_by_id(task_id).await? {
                self.release_task(&task).await?;
            }
        }
        info!("启动恢复完成, 处理了 {} 个未终态运行", active.len());
        Ok(())
    }

    /// 处理一条触发请求；返回创建的运行（被跳过时为None）
    pub async fn handle_request(&self, request: &RunRequestMessage) -> HubResult<Option<Run>> {
        let Some(task) = self.task_repo.find_by_id(request.task_id).await? else {
            warn!("触发请求指向不存在的任务 {}, 忽略", request.task_id);
            return Ok(None);
        };
        if !task.enabled && request.cause == RunCause::Scheduled {
            // 触发与分发之间任务被禁用
            debug!("任务 {} 已禁用, 跳过调度触发", task.id);
            return Ok(None);
        }

        let active = self.run_repo.find_active_by_task(task.id).await?;
        if task.overlap_policy == OverlapPolicy::Skip && !active.is_empty() {
            info!(
                "任务 {} 已有活动运行, skip策略本次触发按无操作跳过",
                task.id
            );
            return Ok(None);
        }

        let mut run = Run::new(task.id, request.cause, request.scheduled_at);
        run.retry_count = request.retry_count;
        run.rerun_failed_of = request.rerun_failed_of;
        let run = self.run_repo.create(&run).await?;
        info!(
            "为任务 '{}' 创建运行 {} (cause: {})",
            task.name,
            run.id,
            request.cause.as_str()
        );

        if task.overlap_policy == OverlapPolicy::Allow {
            if self.sequential_clear(&task).await? {
                self.publish_execute(&task, run.id).await?;
            }
        } else {
            self.release_task(&task).await?;
        }
        Ok(Some(run))
    }

    /// 尝试放行任务最早的queued运行
    async fn release_task(&self, task: &Task) -> HubResult<()> {
        let Some(next) = self.run_repo.find_oldest_queued_by_task(task.id).await? else {
            return Ok(());
        };
        if task.overlap_policy != OverlapPolicy::Allow {
            let active = self.run_repo.find_active_by_task(task.id).await?;
            let has_running = active.iter().any(|r| r.status == RunStatus::Running);
            if has_running {
                debug!("任务 {} 有执行中的运行, 运行 {} 继续排队", task.id, next.id);
                return Ok(());
            }
        }
        if !self.sequential_clear(task).await? {
            debug!("任务 {} 被项目串行门控挡住, 运行 {} 继续排队", task.id, next.id);
            return Ok(());
        }
        self.publish_execute(task, next.id).await
    }

    /// 串行项目中rank更低的任务有活动运行时不放行
    async fn sequential_clear(&self, task: &Task) -> HubResult<bool> {
        let Some(project) = self.project_repo.find_by_id(task.project_id).await? else {
            return Ok(true);
        };
        if project.sequence_mode != SequenceMode::Sequential {
            return Ok(true);
        }
        let siblings = self.task_repo.find_by_project(project.id).await?;
        for sibling in siblings.iter().filter(|t| t.rank < task.rank) {
            let active = self.run_repo.find_active_by_task(sibling.id).await?;
            if !active.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn publish_execute(&self, task: &Task, run_id: i64) -> HubResult<()> {
        let message = Message::execute_run(ExecuteRunMessage {
            run_id,
            task_id: task.id,
            task_name: task.name.clone(),
        });
        self.message_queue
            .publish_message(queues::RUNS, &message)
            .await?;
        debug!("运行 {} 已下发到执行队列", run_id);
        Ok(())
    }

    /// 运行终态后的晋升：同任务queue策略的下一个排队运行，
    /// 以及串行项目中被门控的其他任务
    pub async fn on_run_terminal(&self, task_id: i64) -> HubResult<()> {
        let Some(task) = self.task_repo.find_by_id(task_id).await? else {
            return Ok(());
        };
        self.release_task(&task).await?;

        if let Some(project) = self.project_repo.find_by_id(task.project_id).await? {
            if project.sequence_mode == SequenceMode::Sequential {
                let siblings = self.task_repo.find_by_project(project.id).await?;
                for sibling in siblings.iter().filter(|t| t.id != task.id) {
                    self.release_task(sibling).await?;
                }
            }
        }
        Ok(())
    }

    /// 消费一轮分发队列
    pub async fn poll_once(&self) -> HubResult<()> {
        let messages = self.message_queue.consume_messages(queues::DISPATCH).await?;
        for message in &messages {
            match &message.message_type {
                MessageType::RunRequest(request) => {
                    if let Err(e) = self.handle_request(request).await {
                        self.requeue_or_drop(message, &e).await;
                    }
                }
                _ => {
                    debug!("分发队列忽略消息类型: {}", message.message_type_str());
                }
            }
        }
        Ok(())
    }

    /// 消费端已取走消息，瞬时错误必须重投回队列，触发不能因一次故障丢失
    async fn requeue_or_drop(&self, message: &Message, error: &HubError) {
        if !error.is_retryable() || message.is_retry_exhausted(self.max_retries) {
            error!(
                "处理触发请求失败, 不再重投(已重试{}次): message={} {}",
                message.retry_count, message.id, error
            );
            return;
        }
        let mut retry = message.clone();
        retry.increment_retry();
        warn!(
            "处理触发请求失败, 重投({}/{}): message={} {}",
            retry.retry_count, self.max_retries, message.id, error
        );
        if let Err(e) = self
            .message_queue
            .publish_message(queues::DISPATCH, &retry)
            .await
        {
            error!("消息重投失败: message={} {}", message.id, e);
        }
    }

    /// 分发循环，直到收到停机信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> HubResult<()> {
        self.recover().await?;
        info!("运行分发器已启动");
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("消费分发队列失败: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("运行分发器收到停机信号");
                    break;
                }
            }
        }
        Ok(())
    }
}
