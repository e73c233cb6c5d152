use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use taskhub_errors::HubError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度中心错误: {0}")]
    Hub(#[from] HubError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("请求冲突: {0}")]
    Conflict(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            ApiError::Hub(HubError::ProjectNotFound { id }) => (
                StatusCode::NOT_FOUND,
                "PROJECT_NOT_FOUND",
                format!("项目 {} 不存在", id),
            ),
            ApiError::Hub(HubError::TaskNotFound { id }) => (
                StatusCode::NOT_FOUND,
                "TASK_NOT_FOUND",
                format!("任务 {} 不存在", id),
            ),
            ApiError::Hub(HubError::RunNotFound { id }) => (
                StatusCode::NOT_FOUND,
                "RUN_NOT_FOUND",
                format!("运行 {} 不存在", id),
            ),
            ApiError::Hub(HubError::StepNotFound { id }) => (
                StatusCode::NOT_FOUND,
                "STEP_NOT_FOUND",
                format!("步骤 {} 不存在", id),
            ),
            ApiError::Hub(HubError::InvalidTrigger { spec, message }) => (
                StatusCode::BAD_REQUEST,
                "INVALID_TRIGGER",
                format!("触发器 '{}' 无效: {}", spec, message),
            ),
            ApiError::Hub(HubError::InvalidStepConfig(message)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_STEP_CONFIG",
                message.clone(),
            ),
            ApiError::Hub(HubError::RunConflict(message)) => {
                (StatusCode::CONFLICT, "RUN_CONFLICT", message.clone())
            }
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", message.clone())
            }
            ApiError::Conflict(message) => (StatusCode::CONFLICT, "CONFLICT", message.clone()),
            ApiError::Hub(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                e.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
