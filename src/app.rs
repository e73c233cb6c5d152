use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use taskhub_api::AppState;
use taskhub_config::{AppConfig, SecretCipher};
use taskhub_dispatcher::{RunDispatcher, StateListener, TaskScheduler};
use taskhub_domain::messaging::{queues, MessageQueue};
use taskhub_domain::repositories::{
    ProjectRepository, RunRepository, StepLogRepository, TaskRepository,
};
use taskhub_infrastructure::database::sqlite::{
    SqliteProjectRepository, SqliteRunRepository, SqliteStepLogRepository, SqliteTaskRepository,
};
use taskhub_infrastructure::{connect_sqlite, InMemoryMessageQueue};
use taskhub_runner::{ExecutorRegistry, RunnerService, StepOrchestrator};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Scheduler,
    Runner,
    Api,
    All,
}

impl AppMode {
    fn scheduler_enabled(&self) -> bool {
        matches!(self, AppMode::Scheduler | AppMode::All)
    }
    fn runner_enabled(&self) -> bool {
        matches!(self, AppMode::Runner | AppMode::All)
    }
    fn api_enabled(&self) -> bool {
        matches!(self, AppMode::Api | AppMode::All)
    }
}

/// 主应用：按模式装配并启动各组件
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    project_repo: Arc<dyn ProjectRepository>,
    task_repo: Arc<dyn TaskRepository>,
    run_repo: Arc<dyn RunRepository>,
    step_log_repo: Arc<dyn StepLogRepository>,
    message_queue: Arc<dyn MessageQueue>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用，模式: {:?}", mode);

        let pool = connect_sqlite(&config.database)
            .await
            .context("初始化数据库失败")?;

        let message_queue: Arc<dyn MessageQueue> =
            Arc::new(InMemoryMessageQueue::new(&config.queue));
        for queue in [queues::DISPATCH, queues::RUNS, queues::STATUS, queues::CONTROL] {
            message_queue.create_queue(queue).await?;
        }

        Ok(Self {
            config,
            mode,
            project_repo: Arc::new(SqliteProjectRepository::new(pool.clone())),
            task_repo: Arc::new(SqliteTaskRepository::new(pool.clone())),
            run_repo: Arc::new(SqliteRunRepository::new(pool.clone())),
            step_log_repo: Arc::new(SqliteStepLogRepository::new(pool)),
            message_queue,
        })
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut handles = Vec::new();

        if self.mode.scheduler_enabled() {
            handles.extend(self.start_scheduler(&shutdown_rx));
        }
        if self.mode.runner_enabled() {
            handles.push(self.start_runner(&shutdown_rx)?);
        }
        if self.mode.api_enabled() {
            handles.push(self.start_api(&shutdown_rx));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("组件任务异常退出: {e}");
            }
        }
        info!("所有组件已停止");
        Ok(())
    }

    /// 调度守护进程：调度器、分发器、状态监听器
    fn start_scheduler(
        &self,
        shutdown_rx: &broadcast::Receiver<()>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        info!("启动调度守护进程");
        let scheduler = TaskScheduler::new(
            self.task_repo.clone(),
            self.message_queue.clone(),
            self.config.scheduler.clone(),
        );
        let dispatcher = Arc::new(RunDispatcher::new(
            self.project_repo.clone(),
            self.task_repo.clone(),
            self.run_repo.clone(),
            self.message_queue.clone(),
            &self.config.queue,
        ));
        let listener = StateListener::new(
            self.run_repo.clone(),
            self.step_log_repo.clone(),
            self.task_repo.clone(),
            self.message_queue.clone(),
            dispatcher.clone(),
            &self.config.queue,
        );

        let scheduler_rx = shutdown_rx.resubscribe();
        let dispatcher_rx = shutdown_rx.resubscribe();
        let listener_rx = shutdown_rx.resubscribe();
        vec![
            tokio::spawn(async move {
                if let Err(e) = scheduler.run(scheduler_rx).await {
                    error!("调度器退出: {e}");
                }
            }),
            tokio::spawn(async move {
                if let Err(e) = dispatcher.run(dispatcher_rx).await {
                    error!("分发器退出: {e}");
                }
            }),
            tokio::spawn(async move {
                if let Err(e) = listener.run(listener_rx).await {
                    error!("状态监听器退出: {e}");
                }
            }),
        ]
    }

    fn start_runner(
        &self,
        shutdown_rx: &broadcast::Receiver<()>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let runner_id = self.config.effective_runner_id();
        info!("启动runner: {runner_id}");

        // 未配置密钥时机密参数以密文传给步骤
        let cipher = match SecretCipher::from_env() {
            Ok(cipher) => Some(Arc::new(cipher)),
            Err(e) => {
                warn!("未启用机密参数解密: {e}");
                None
            }
        };
        std::fs::create_dir_all(&self.config.runner.work_dir)
            .with_context(|| format!("创建工作目录失败: {}", self.config.runner.work_dir))?;

        let orchestrator = Arc::new(StepOrchestrator::new(
            runner_id.clone(),
            self.config.runner.clone(),
            self.project_repo.clone(),
            self.task_repo.clone(),
            self.step_log_repo.clone(),
            self.message_queue.clone(),
            Arc::new(ExecutorRegistry::with_defaults()),
            cipher,
        ));
        let service = RunnerService::new(
            runner_id,
            self.config.runner.clone(),
            self.run_repo.clone(),
            self.message_queue.clone(),
            orchestrator,
        );

        let rx = shutdown_rx.resubscribe();
        Ok(tokio::spawn(async move {
            if let Err(e) = service.run(rx).await {
                error!("runner退出: {e}");
            }
        }))
    }

    fn start_api(&self, shutdown_rx: &broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let state = AppState {
            task_repo: self.task_repo.clone(),
            run_repo: self.run_repo.clone(),
            step_log_repo: self.step_log_repo.clone(),
            message_queue: self.message_queue.clone(),
        };
        let api_config = self.config.api.clone();
        let mut rx = shutdown_rx.resubscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = taskhub_api::serve(&api_config, state) => {
                    if let Err(e) = result {
                        error!("API服务退出: {e}");
                    }
                }
                _ = rx.recv() => {
                    info!("API服务收到停止信号");
                }
            }
        })
    }
}
