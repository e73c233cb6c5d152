use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use taskhub_config::ApiConfig;
use taskhub_domain::messaging::MessageQueue;
use taskhub_domain::repositories::{RunRepository, StepLogRepository, TaskRepository};
use taskhub_errors::{HubError, HubResult};

use crate::handlers::{
    health::health_check,
    runs::{active_runs, cancel_run, get_run, rerun_failed, run_logs},
    tasks::{disable_task, enable_task, next_fire, run_now},
};

#[derive(Clone)]
pub struct AppState {
    pub task_repo: Arc<dyn TaskRepository>,
    pub run_repo: Arc<dyn RunRepository>,
    pub step_log_repo: Arc<dyn StepLogRepository>,
    pub message_queue: Arc<dyn MessageQueue>,
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // 轮询端点
        .route("/api/runs/active", get(active_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/logs", get(run_logs))
        .route("/api/tasks/{id}/next-fire", get(next_fire))
        // 控制动作，均幂等
        .route("/api/tasks/{id}/run-now", post(run_now))
        .route("/api/tasks/{id}/enable", post(enable_task))
        .route("/api/tasks/{id}/disable", post(disable_task))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/rerun-failed", post(rerun_failed))
        .with_state(state)
}

/// 绑定地址并服务到进程退出
pub async fn serve(config: &ApiConfig, state: AppState) -> HubResult<()> {
    let mut app = create_routes(state).layer(TraceLayer::new_for_http());
    if config.cors_enabled {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .max_age(Duration::from_secs(3600)),
        );
    }

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|e| {
            HubError::config_error(format!("无法绑定API地址 {}: {e}", config.bind_address))
        })?;
    info!("API服务启动: {}", config.bind_address);
    axum::serve(listener, app)
        .await
        .map_err(|e| HubError::Internal(format!("API服务异常退出: {e}")))
}
