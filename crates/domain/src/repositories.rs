//! 领域仓储抽象
//!
//! 定义数据访问的抽象接口，遵循依赖倒置原则

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{LogLine, Project, Run, RunStatus, Step, StepLog, StepLogStatus, Task};
use taskhub_errors::HubResult;

/// 项目仓储抽象
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn create(&self, project: &Project) -> HubResult<Project>;
    async fn find_by_id(&self, id: i64) -> HubResult<Option<Project>>;
    async fn find_all(&self) -> HubResult<Vec<Project>>;
    async fn update(&self, project: &Project) -> HubResult<Project>;
    async fn delete(&self, id: i64) -> HubResult<bool>;
}

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> HubResult<Task>;
    async fn find_by_id(&self, id: i64) -> HubResult<Option<Task>>;
    async fn find_all(&self) -> HubResult<Vec<Task>>;
    async fn find_by_project(&self, project_id: i64) -> HubResult<Vec<Task>>;
    async fn update(&self, task: &Task) -> HubResult<Task>;
    async fn delete(&self, id: i64) -> HubResult<bool>;
    async fn set_enabled(&self, id: i64, enabled: bool) -> HubResult<bool>;
    /// 返回next_fire_at已到期且启用的任务，按到期时间升序
    async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> HubResult<Vec<Task>>;
    /// 入队成功后推进触发时间水位；next为空表示不再触发
    async fn update_fire_times(
        &self,
        id: i64,
        next_fire_at: Option<DateTime<Utc>>,
        last_fired_at: Option<DateTime<Utc>>,
    ) -> HubResult<()>;
    async fn create_step(&self, step: &Step) -> HubResult<Step>;
    async fn find_step(&self, step_id: i64) -> HubResult<Option<Step>>;
    /// 任务的全部步骤，按(rank, id)升序
    async fn find_steps(&self, task_id: i64) -> HubResult<Vec<Step>>;
    async fn update_step(&self, step: &Step) -> HubResult<Step>;
    async fn delete_step(&self, step_id: i64) -> HubResult<bool>;
}

/// 运行仓储抽象
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create(&self, run: &Run) -> HubResult<Run>;
    async fn find_by_id(&self, id: i64) -> HubResult<Option<Run>>;
    async fn find_by_task(&self, task_id: i64, limit: i64) -> HubResult<Vec<Run>>;
    async fn find_recent(&self, limit: i64) -> HubResult<Vec<Run>>;
    /// 全部未终态（queued或running）的运行
    async fn find_active(&self) -> HubResult<Vec<Run>>;
    /// 某任务的未终态运行
    async fn find_active_by_task(&self, task_id: i64) -> HubResult<Vec<Run>>;
    /// 按调度时间取该任务最早的queued运行
    async fn find_oldest_queued_by_task(&self, task_id: i64) -> HubResult<Option<Run>>;
    /// CAS认领：仅当runner_id仍为空时写入，返回是否认领成功。
    /// 至少一次投递下保证重复的执行消息只被一个runner接受
    async fn claim(&self, id: i64, runner_id: &str) -> HubResult<bool>;
    /// 单向状态推进；当前状态已在目标之后时不写入并返回false
    async fn update_status(
        &self,
        id: i64,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> HubResult<bool>;
    async fn mark_started(&self, id: i64, started_at: DateTime<Utc>) -> HubResult<()>;
    async fn mark_completed(&self, id: i64, completed_at: DateTime<Utc>) -> HubResult<()>;
}

/// 步骤日志与输出行仓储抽象
#[async_trait]
pub trait StepLogRepository: Send + Sync {
    async fn create(&self, step_log: &StepLog) -> HubResult<StepLog>;
    async fn find_by_id(&self, id: i64) -> HubResult<Option<StepLog>>;
    async fn find_by_run(&self, run_id: i64) -> HubResult<Vec<StepLog>>;
    async fn find_by_run_and_step(&self, run_id: i64, step_id: i64) -> HubResult<Option<StepLog>>;
    /// 单向状态推进；违反推进方向的写入被忽略并返回false
    async fn update_status(
        &self,
        run_id: i64,
        step_id: i64,
        status: StepLogStatus,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> HubResult<bool>;
    /// 幂等追加输出行；(run_id, step_id, seq)已存在的行静默去重
    async fn append_lines(&self, lines: &[LogLine]) -> HubResult<u64>;
    /// 返回seq大于after_seq的输出行，按seq升序，用于增量拉取
    async fn find_lines_after(
        &self,
        run_id: i64,
        step_id: i64,
        after_seq: i64,
        limit: i64,
    ) -> HubResult<Vec<LogLine>>;
}
