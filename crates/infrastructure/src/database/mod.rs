pub mod sqlite;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use taskhub_config::DatabaseConfig;
use taskhub_errors::{HubError, HubResult};

/// 建立SQLite连接池并完成建表
pub async fn connect_sqlite(config: &DatabaseConfig) -> HubResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| HubError::config_error(format!("无效的数据库URL '{}': {e}", config.url)))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
        .connect_with(options)
        .await?;

    ensure_schema(&pool).await?;
    info!("数据库连接池就绪: {}", config.url);
    Ok(pool)
}

/// 建表与索引；全部IF NOT EXISTS，重复执行安全
pub async fn ensure_schema(pool: &SqlitePool) -> HubResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            sequence_mode TEXT NOT NULL DEFAULT 'parallel',
            params TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            rank INTEGER NOT NULL DEFAULT 0,
            overlap_policy TEXT NOT NULL DEFAULT 'skip',
            max_retries INTEGER NOT NULL DEFAULT 0,
            timeout_seconds INTEGER,
            params TEXT NOT NULL DEFAULT '[]',
            triggers TEXT NOT NULL DEFAULT '[]',
            next_fire_at TEXT,
            last_fired_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(enabled, next_fire_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            rank INTEGER NOT NULL DEFAULT 0,
            kind TEXT NOT NULL,
            config TEXT NOT NULL DEFAULT '{}',
            required INTEGER NOT NULL DEFAULT 1,
            depends_on_previous INTEGER NOT NULL DEFAULT 1,
            timeout_seconds INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            status TEXT NOT NULL DEFAULT 'QUEUED',
            cause TEXT NOT NULL,
            runner_id TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            rerun_failed_of INTEGER,
            scheduled_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_task_status ON runs(task_id, status)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS step_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            step_id INTEGER NOT NULL REFERENCES steps(id) ON DELETE CASCADE,
            status TEXT NOT NULL DEFAULT 'PENDING',
            exit_code INTEGER,
            error_message TEXT,
            started_at TEXT,
            completed_at TEXT,
            UNIQUE(run_id, step_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // (run_id, step_id, seq)唯一约束保证日志重复投递时静默去重
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS log_lines (
            run_id INTEGER NOT NULL,
            step_id INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            stream TEXT NOT NULL,
            line TEXT NOT NULL,
            logged_at TEXT NOT NULL,
            PRIMARY KEY (run_id, step_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
