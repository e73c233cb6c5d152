use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use taskhub_domain::entities::{LogLine, Run, RunStatus, StepLog};
use taskhub_domain::messages::{
    Message, RunControlAction, RunControlMessage, RunRequestMessage, RunStatusMessage,
};
use taskhub_domain::messaging::queues;
use taskhub_errors::HubError;

use crate::{
    error::{ApiError, ApiResult},
    response::{accepted, success},
    routes::AppState,
};

/// 运行详情：运行本身加步骤执行记录
#[derive(Debug, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub steps: Vec<StepLog>,
}

#[derive(Debug, Deserialize)]
pub struct LogQueryParams {
    pub step_id: i64,
    pub after_seq: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LogPage {
    pub lines: Vec<LogLine>,
    /// 下次轮询的after_seq取值
    pub last_seq: i64,
}

/// 活动运行概览：运行ID到人读状态描述的映射
pub async fn active_runs(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let runs = state.run_repo.find_active().await?;
    let mut overview = BTreeMap::new();
    for run in runs {
        let task_name = state
            .task_repo
            .find_by_id(run.task_id)
            .await?
            .map(|t| t.name)
            .unwrap_or_else(|| format!("任务{}", run.task_id));
        let step_logs = state.step_log_repo.find_by_run(run.id).await?;
        let done = step_logs.iter().filter(|s| s.status.is_terminal()).count();
        overview.insert(
            run.id,
            format!(
                "{} - {} ({}/{} 步骤完成)",
                task_name,
                run.status.as_str(),
                done,
                step_logs.len()
            ),
        );
    }
    Ok(success(overview))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let run = state
        .run_repo
        .find_by_id(id)
        .await?
        .ok_or(HubError::RunNotFound { id })?;
    let steps = state.step_log_repo.find_by_run(id).await?;
    Ok(success(RunDetail { run, steps }))
}

/// 增量拉取日志行；seq从after_seq之后开始，已完成步骤无空洞
pub async fn run_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<LogQueryParams>,
) -> ApiResult<impl IntoResponse> {
    state
        .run_repo
        .find_by_id(id)
        .await?
        .ok_or(HubError::RunNotFound { id })?;
    let after_seq = params.after_seq.unwrap_or(0);
    let limit = params.limit.unwrap_or(1000).clamp(1, 10_000);
    let lines = state
        .step_log_repo
        .find_lines_after(id, params.step_id, after_seq, limit)
        .await?;
    let last_seq = lines.last().map(|l| l.seq).unwrap_or(after_seq);
    Ok(success(LogPage { lines, last_seq }))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let run = state
        .run_repo
        .find_by_id(id)
        .await?
        .ok_or(HubError::RunNotFound { id })?;

    if run.status.is_terminal() {
        // 已终态，取消是无操作
        return Ok(accepted("运行已结束"));
    }
    let was_queued = run.status == RunStatus::Queued;
    if was_queued {
        // 终态经status队列落库，监听器顺带完成排队运行晋升等后置动作
        let message = Message::run_status(RunStatusMessage {
            run_id: id,
            status: RunStatus::Cancelled,
            error_message: Some("API取消".to_string()),
            runner_id: "api".to_string(),
            timestamp: Utc::now(),
        });
        state
            .message_queue
            .publish_message(queues::STATUS, &message)
            .await?;
    }
    // 进行中（或检查后恰好被认领）的运行经控制通道中断执行
    let message = Message::run_control(RunControlMessage {
        run_id: id,
        action: RunControlAction::Cancel,
        requester: "api".to_string(),
        timestamp: Utc::now(),
    });
    state
        .message_queue
        .publish_message(queues::CONTROL, &message)
        .await?;
    Ok(accepted(if was_queued {
        "已取消排队中的运行"
    } else {
        "取消指令已下发"
    }))
}

/// 以源运行为基准重跑失败步骤
pub async fn rerun_failed(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let run = state
        .run_repo
        .find_by_id(id)
        .await?
        .ok_or(HubError::RunNotFound { id })?;
    if !run.status.is_terminal() {
        return Err(ApiError::Conflict("运行尚未结束，无法重跑".to_string()));
    }

    let message = Message::run_request(RunRequestMessage {
        task_id: run.task_id,
        cause: taskhub_domain::entities::RunCause::Manual,
        scheduled_at: Utc::now(),
        rerun_failed_of: Some(run.id),
        retry_count: 0,
    });
    state
        .message_queue
        .publish_message(queues::DISPATCH, &message)
        .await?;
    Ok(accepted("重跑请求已入队"))
}
