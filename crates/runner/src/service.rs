//! Runner守护进程
//!
//! 从runs队列认领运行并交给编排器执行，同时消费control队列响应取消。
//! 认领走数据库CAS，重复投递的执行消息最多被一个runner接受。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use taskhub_config::RunnerConfig;
use taskhub_domain::entities::RunStatus;
use taskhub_domain::messages::{ExecuteRunMessage, MessageType, RunControlAction};
use taskhub_domain::messaging::{queues, MessageQueue};
use taskhub_domain::repositories::RunRepository;
use taskhub_errors::HubResult;

use crate::orchestrator::StepOrchestrator;

pub struct RunnerService {
    runner_id: String,
    config: RunnerConfig,
    run_repo: Arc<dyn RunRepository>,
    message_queue: Arc<dyn MessageQueue>,
    orchestrator: Arc<StepOrchestrator>,
    concurrency: Arc<Semaphore>,
    /// 进行中运行的取消信号发送端
    active: Arc<RwLock<HashMap<i64, watch::Sender<bool>>>>,
}

impl RunnerService {
    pub fn new(
        runner_id: String,
        config: RunnerConfig,
        run_repo: Arc<dyn RunRepository>,
        message_queue: Arc<dyn MessageQueue>,
        orchestrator: Arc<StepOrchestrator>,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            runner_id,
            config,
            run_repo,
            message_queue,
            orchestrator,
            concurrency,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> HubResult<()> {
        info!(
            "runner启动: id={} 并发上限={}",
            self.runner_id, self.config.max_concurrent_runs
        );
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("runner收到停止信号: id={}", self.runner_id);
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("runner轮询出错: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    /// 消费一轮runs与control队列
    pub async fn poll_once(&self) -> HubResult<()> {
        for message in self.message_queue.consume_messages(queues::RUNS).await? {
            if let MessageType::ExecuteRun(execute) = message.message_type {
                self.handle_execute(execute).await?;
            } else {
                warn!("runs队列收到意外消息: {}", message.message_type_str());
            }
        }
        for message in self.message_queue.consume_messages(queues::CONTROL).await? {
            if let MessageType::RunControl(control) = message.message_type {
                match control.action {
                    RunControlAction::Cancel => {
                        self.cancel_run(control.run_id, &control.requester).await;
                    }
                }
            } else {
                warn!("control队列收到意外消息: {}", message.message_type_str());
            }
        }
        Ok(())
    }

    async fn handle_execute(&self, execute: ExecuteRunMessage) -> HubResult<()> {
        let run = match self.run_repo.find_by_id(execute.run_id).await? {
            Some(run) => run,
            None => {
                warn!("执行消息指向不存在的运行: run={}", execute.run_id);
                return Ok(());
            }
        };
        if run.status != RunStatus::Queued {
            debug!(
                "运行已不在queued状态，忽略执行消息: run={} status={:?}",
                run.id, run.status
            );
            return Ok(());
        }
        if !self.run_repo.claim(run.id, &self.runner_id).await? {
            debug!("运行已被其他runner认领: run={}", run.id);
            return Ok(());
        }

        let permit = Arc::clone(&self.concurrency)
            .acquire_owned()
            .await
            .map_err(|_| taskhub_errors::HubError::Internal("并发信号量已关闭".to_string()))?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active.write().await.insert(run.id, cancel_tx);

        let orchestrator = Arc::clone(&self.orchestrator);
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            let run_id = run.id;
            if let Err(e) = orchestrator.execute_run(&run, cancel_rx).await {
                error!("运行执行出错: run={} {}", run_id, e);
            }
            active.write().await.remove(&run_id);
            drop(permit);
        });
        Ok(())
    }

    async fn cancel_run(&self, run_id: i64, requester: &str) {
        let active = self.active.read().await;
        match active.get(&run_id) {
            Some(cancel_tx) => {
                info!("取消运行: run={} requester={}", run_id, requester);
                let _ = cancel_tx.send(true);
            }
            None => {
                // queued的运行由API直接改库，这里只可能是已结束的迟到取消
                debug!("取消指令未命中进行中的运行: run={}", run_id);
            }
        }
    }

    /// 当前进行中的运行数
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }
}
