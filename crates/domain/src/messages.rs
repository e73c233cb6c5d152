use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{LogLine, RunCause, RunStatus, StepLogStatus};

/// 队列消息信封；投递语义为至少一次，消费端必须幂等
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageType {
    /// 调度器→分发器：某任务的一次触发
    RunRequest(RunRequestMessage),
    /// 分发器→runner：已创建的运行待执行
    ExecuteRun(ExecuteRunMessage),
    /// runner→状态监听器：步骤状态变化
    StepStatus(StepStatusMessage),
    /// runner→状态监听器：运行级状态变化
    RunStatusUpdate(RunStatusMessage),
    /// runner→状态监听器：一批输出日志行
    LogChunk(LogChunkMessage),
    /// 控制面→runner：取消等控制动作
    RunControl(RunControlMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequestMessage {
    pub task_id: i64,
    pub cause: RunCause,
    pub scheduled_at: DateTime<Utc>,
    /// 仅重跑失败步骤时携带源运行ID
    pub rerun_failed_of: Option<i64>,
    /// 重试派生的新运行继承的重试计数
    pub retry_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRunMessage {
    pub run_id: i64,
    pub task_id: i64,
    pub task_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatusMessage {
    pub run_id: i64,
    pub step_id: i64,
    pub status: StepLogStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub runner_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusMessage {
    pub run_id: i64,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub runner_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunkMessage {
    pub run_id: i64,
    pub step_id: i64,
    pub lines: Vec<LogLine>,
    pub runner_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunControlMessage {
    pub run_id: i64,
    pub action: RunControlAction,
    pub requester: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunControlAction {
    Cancel,
}

impl Message {
    fn envelope(message_type: MessageType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn run_request(message: RunRequestMessage) -> Self {
        Self::envelope(MessageType::RunRequest(message))
    }
    pub fn execute_run(message: ExecuteRunMessage) -> Self {
        Self::envelope(MessageType::ExecuteRun(message))
    }
    pub fn step_status(message: StepStatusMessage) -> Self {
        Self::envelope(MessageType::StepStatus(message))
    }
    pub fn run_status(message: RunStatusMessage) -> Self {
        Self::envelope(MessageType::RunStatusUpdate(message))
    }
    pub fn log_chunk(message: LogChunkMessage) -> Self {
        Self::envelope(MessageType::LogChunk(message))
    }
    pub fn run_control(message: RunControlMessage) -> Self {
        Self::envelope(MessageType::RunControl(message))
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }
    pub fn is_retry_exhausted(&self, max_retries: i32) -> bool {
        self.retry_count >= max_retries
    }
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
    pub fn message_type_str(&self) -> &'static str {
        match &self.message_type {
            MessageType::RunRequest(_) => "run_request",
            MessageType::ExecuteRun(_) => "execute_run",
            MessageType::StepStatus(_) => "step_status",
            MessageType::RunStatusUpdate(_) => "run_status",
            MessageType::LogChunk(_) => "log_chunk",
            MessageType::RunControl(_) => "run_control",
        }
    }
}
