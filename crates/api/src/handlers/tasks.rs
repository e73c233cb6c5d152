use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use taskhub_dispatcher::TriggerEngine;
use taskhub_domain::entities::RunCause;
use taskhub_domain::messages::{Message, RunRequestMessage};
use taskhub_domain::messaging::queues;
use taskhub_errors::HubError;

use crate::{
    error::ApiResult,
    response::{accepted, success},
    routes::AppState,
};

#[derive(Debug, Serialize)]
pub struct NextFireResponse {
    pub task_id: i64,
    pub enabled: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    /// 每个触发器的人读描述
    pub triggers: Vec<String>,
}

/// 下次触发时间与触发器描述
pub async fn next_fire(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let task = state
        .task_repo
        .find_by_id(id)
        .await?
        .ok_or(HubError::TaskNotFound { id })?;
    let next_fire_at = TriggerEngine::next_fire_of(&task.triggers, Utc::now(), task.last_fired_at)?;
    let triggers = task.triggers.iter().map(TriggerEngine::describe).collect();
    Ok(success(NextFireResponse {
        task_id: task.id,
        enabled: task.enabled,
        next_fire_at,
        triggers,
    }))
}

/// 立即触发一次运行；并发策略照常生效
pub async fn run_now(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let task = state
        .task_repo
        .find_by_id(id)
        .await?
        .ok_or(HubError::TaskNotFound { id })?;

    let message = Message::run_request(RunRequestMessage {
        task_id: task.id,
        cause: RunCause::Manual,
        scheduled_at: Utc::now(),
        rerun_failed_of: None,
        retry_count: 0,
    });
    state
        .message_queue
        .publish_message(queues::DISPATCH, &message)
        .await?;
    Ok(accepted("触发请求已入队"))
}

pub async fn enable_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    if !state.task_repo.set_enabled(id, true).await? {
        return Err(HubError::TaskNotFound { id }.into());
    }
    // 启用即重新武装触发时间，无需等调度器重建
    let task = state
        .task_repo
        .find_by_id(id)
        .await?
        .ok_or(HubError::TaskNotFound { id })?;
    match TriggerEngine::next_fire_of(&task.triggers, Utc::now(), task.last_fired_at) {
        Ok(next) => {
            state
                .task_repo
                .update_fire_times(id, next, task.last_fired_at)
                .await?;
        }
        Err(e) => warn!("任务 {} 触发器无效，保持未武装: {}", id, e),
    }
    Ok(accepted("任务已启用"))
}

pub async fn disable_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    if !state.task_repo.set_enabled(id, false).await? {
        return Err(HubError::TaskNotFound { id }.into());
    }
    Ok(accepted("任务已停用"))
}
