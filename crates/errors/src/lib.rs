use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("项目未找到: {id}")]
    ProjectNotFound { id: i64 },
    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("运行实例未找到: {id}")]
    RunNotFound { id: i64 },
    #[error("步骤未找到: {id}")]
    StepNotFound { id: i64 },
    #[error("无效的触发器定义: {spec} - {message}")]
    InvalidTrigger { spec: String, message: String },
    #[error("无效的步骤配置: {0}")]
    InvalidStepConfig(String),
    #[error("步骤执行错误: {0}")]
    StepExecution(String),
    #[error("运行冲突: {0}")]
    RunConflict(String),
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("密文处理错误: {0}")]
    Crypto(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }
    pub fn run_not_found(id: i64) -> Self {
        Self::RunNotFound { id }
    }
    pub fn invalid_trigger<S: Into<String>, M: Into<String>>(spec: S, message: M) -> Self {
        Self::InvalidTrigger {
            spec: spec.into(),
            message: message.into(),
        }
    }
    pub fn queue_error<S: Into<String>>(msg: S) -> Self {
        Self::MessageQueue(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn execution_error<S: Into<String>>(msg: S) -> Self {
        Self::StepExecution(msg.into())
    }

    /// 是否为不可恢复的致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HubError::Internal(_) | HubError::Configuration(_) | HubError::Crypto(_)
        )
    }

    /// 瞬时错误可以按退避策略重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HubError::Database(_)
                | HubError::DatabaseOperation(_)
                | HubError::MessageQueue(_)
                | HubError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        HubError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(HubError::MessageQueue("queue down".into()).is_retryable());
        assert!(HubError::DatabaseOperation("lock".into()).is_retryable());
        assert!(!HubError::TaskNotFound { id: 1 }.is_retryable());
        assert!(!HubError::InvalidStepConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(HubError::Configuration("missing key".into()).is_fatal());
        assert!(!HubError::StepExecution("exit 1".into()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = HubError::invalid_trigger("bad cron", "expected 6 fields");
        assert_eq!(err.to_string(), "无效的触发器定义: bad cron - expected 6 fields");
    }
}
