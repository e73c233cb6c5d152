use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 项目：一组相关任务的分组，共享全局参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub sequence_mode: SequenceMode,
    /// 项目级全局参数，任务参数可覆盖同名键
    pub params: Vec<Param>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SequenceMode {
    /// 项目内任务各自独立运行
    #[serde(rename = "parallel")]
    Parallel,
    /// 按任务rank串行：高rank任务等待低rank任务全部终态
    #[serde(rename = "sequential")]
    Sequential,
}

impl SequenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceMode::Parallel => "parallel",
            SequenceMode::Sequential => "sequential",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parallel" => Some(SequenceMode::Parallel),
            "sequential" => Some(SequenceMode::Sequential),
            _ => None,
        }
    }
}

/// 键值参数；secret参数落库时为密文，只在步骤执行时解密
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Param {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub secret: bool,
}

impl Param {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            secret: false,
        }
    }
}

/// 任务：可调度的执行单元，由触发器和分rank的步骤组成
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub enabled: bool,
    /// 项目串行模式下的排序键，相同rank并发
    pub rank: i32,
    pub overlap_policy: OverlapPolicy,
    /// 失败后由分发器重试的最大次数，0表示不重试
    pub max_retries: i32,
    /// 整个运行的超时（秒），未设置时只受步骤级超时约束
    pub timeout_seconds: Option<i64>,
    pub params: Vec<Param>,
    pub triggers: Vec<Trigger>,
    /// 调度器维护的下次触发时间；无有效触发器时为空
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.triggers.is_empty()
    }
    pub fn entity_description(&self) -> String {
        format!("任务 '{}' (ID: {}, 项目: {})", self.name, self.id, self.project_id)
    }
}

/// 任务并发策略；默认skip，即同任务已有活动运行时本次触发按无操作跳过
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OverlapPolicy {
    #[serde(rename = "skip")]
    Skip,
    #[serde(rename = "queue")]
    Queue,
    #[serde(rename = "allow")]
    Allow,
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        OverlapPolicy::Skip
    }
}

impl OverlapPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlapPolicy::Skip => "skip",
            OverlapPolicy::Queue => "queue",
            OverlapPolicy::Allow => "allow",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "skip" => Some(OverlapPolicy::Skip),
            "queue" => Some(OverlapPolicy::Queue),
            "allow" => Some(OverlapPolicy::Allow),
            _ => None,
        }
    }
}

/// 触发器定义；一个任务可同时挂多种触发器，任一到期即触发
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Cron {
        expr: String,
        start_at: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
    },
    Interval {
        every_seconds: i64,
        start_at: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
    },
    /// 一次性触发；触发过后永久失效，重启后不得重复触发
    Once { at: DateTime<Utc> },
}

/// 步骤：任务内的单个可执行动作
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub task_id: i64,
    pub name: String,
    /// 同rank步骤并发执行，rank之间严格升序串行
    pub rank: i32,
    pub kind: StepKind,
    /// 类型相关配置（命令、查询文本、连接串等）
    pub config: serde_json::Value,
    /// 必需步骤失败导致运行failed；非必需步骤失败只降级为warning
    pub required: bool,
    /// 前置rank中有必需步骤失败时，本步骤跳过不执行
    pub depends_on_previous: bool,
    pub timeout_seconds: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Sql,
    Shell,
    Python,
    Http,
    FileTransfer,
    Email,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Sql => "sql",
            StepKind::Shell => "shell",
            StepKind::Python => "python",
            StepKind::Http => "http",
            StepKind::FileTransfer => "file_transfer",
            StepKind::Email => "email",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sql" => Some(StepKind::Sql),
            "shell" => Some(StepKind::Shell),
            "python" => Some(StepKind::Python),
            "http" => Some(StepKind::Http),
            "file_transfer" => Some(StepKind::FileTransfer),
            "email" => Some(StepKind::Email),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行：任务的一次执行实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub task_id: i64,
    pub status: RunStatus,
    pub cause: RunCause,
    /// 认领本次运行的runner进程标识
    pub runner_id: Option<String>,
    pub retry_count: i32,
    /// 仅重跑失败步骤时，指向作为基准的源运行
    pub rerun_failed_of: Option<i64>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(task_id: i64, cause: RunCause, scheduled_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 由数据库生成
            task_id,
            status: RunStatus::Queued,
            cause,
            runner_id: None,
            retry_count: 0,
            rerun_failed_of: None,
            scheduled_at,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: now,
        }
    }
    pub fn is_active(&self) -> bool {
        matches!(self.status, RunStatus::Queued | RunStatus::Running)
    }
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
    pub fn entity_description(&self) -> String {
        match &self.runner_id {
            Some(runner_id) => format!(
                "运行实例 (ID: {}, 任务ID: {}, Runner: {})",
                self.id, self.task_id, runner_id
            ),
            None => format!("运行实例 (ID: {}, 任务ID: {})", self.id, self.task_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Warning | RunStatus::Failed | RunStatus::Cancelled
        )
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Warning => "WARNING",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(RunStatus::Queued),
            "RUNNING" => Some(RunStatus::Running),
            "SUCCESS" => Some(RunStatus::Success),
            "WARNING" => Some(RunStatus::Warning),
            "FAILED" => Some(RunStatus::Failed),
            "CANCELLED" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for RunStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for RunStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        RunStatus::parse(s).ok_or_else(|| format!("Invalid run status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for RunStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunCause {
    #[serde(rename = "SCHEDULED")]
    Scheduled,
    #[serde(rename = "MANUAL")]
    Manual,
    #[serde(rename = "RETRY")]
    Retry,
}

impl RunCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunCause::Scheduled => "SCHEDULED",
            RunCause::Manual => "MANUAL",
            RunCause::Retry => "RETRY",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(RunCause::Scheduled),
            "MANUAL" => Some(RunCause::Manual),
            "RETRY" => Some(RunCause::Retry),
            _ => None,
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for RunCause {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for RunCause {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        RunCause::parse(s).ok_or_else(|| format!("Invalid run cause: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for RunCause {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 步骤日志：一次运行中单个步骤的执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLog {
    pub id: i64,
    pub run_id: i64,
    pub step_id: i64,
    pub status: StepLogStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepLog {
    pub fn pending(run_id: i64, step_id: i64) -> Self {
        Self {
            id: 0, // 由数据库生成
            run_id,
            step_id,
            status: StepLogStatus::Pending,
            exit_code: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StepLogStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "SKIPPED")]
    Skipped,
}

impl StepLogStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepLogStatus::Success | StepLogStatus::Failed | StepLogStatus::Skipped
        )
    }
    /// 状态只允许单向推进：pending → running → {success, failed, skipped}
    pub fn can_transition_to(&self, next: StepLogStatus) -> bool {
        use StepLogStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Pending, Skipped) => true,
            (Pending, Failed) => true,
            (Running, Success) => true,
            (Running, Failed) => true,
            (a, b) if *a == b => true,
            _ => false,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            StepLogStatus::Pending => "PENDING",
            StepLogStatus::Running => "RUNNING",
            StepLogStatus::Success => "SUCCESS",
            StepLogStatus::Failed => "FAILED",
            StepLogStatus::Skipped => "SKIPPED",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(StepLogStatus::Pending),
            "RUNNING" => Some(StepLogStatus::Running),
            "SUCCESS" => Some(StepLogStatus::Success),
            "FAILED" => Some(StepLogStatus::Failed),
            "SKIPPED" => Some(StepLogStatus::Skipped),
            _ => None,
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for StepLogStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for StepLogStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        StepLogStatus::parse(s).ok_or_else(|| format!("Invalid step log status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for StepLogStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 步骤输出的一行；seq在(run_id, step_id)内从1起单调递增
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub run_id: i64,
    pub step_id: i64,
    pub seq: i64,
    pub stream: OutputStream,
    pub line: String,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputStream {
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "stderr")]
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(OutputStream::Stdout),
            "stderr" => Some(OutputStream::Stderr),
            _ => None,
        }
    }
}
