use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use taskhub_domain::entities::{Run, RunCause, RunStatus};
use taskhub_domain::repositories::RunRepository;
use taskhub_errors::{HubError, HubResult};

pub struct SqliteRunRepository {
    pool: SqlitePool,
}

const RUN_COLUMNS: &str = "id, task_id, status, cause, runner_id, retry_count, rerun_failed_of, \
     scheduled_at, started_at, completed_at, error_message, created_at";

impl SqliteRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> HubResult<Run> {
        let cause: String = row.try_get("cause")?;
        Ok(Run {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            status: row.try_get("status")?,
            cause: RunCause::parse(&cause)
                .ok_or_else(|| HubError::database_error(format!("非法的cause值: {cause}")))?,
            runner_id: row.try_get("runner_id")?,
            retry_count: row.try_get("retry_count")?,
            rerun_failed_of: row.try_get("rerun_failed_of")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }

    /// 目标状态允许的前置状态；空表示不允许写入
    fn allowed_predecessors(status: RunStatus) -> &'static [RunStatus] {
        match status {
            RunStatus::Queued => &[],
            RunStatus::Running => &[RunStatus::Queued],
            RunStatus::Success | RunStatus::Warning | RunStatus::Failed => &[RunStatus::Running],
            RunStatus::Cancelled => &[RunStatus::Queued, RunStatus::Running],
        }
    }
}

#[async_trait]
impl RunRepository for SqliteRunRepository {
    async fn create(&self, run: &Run) -> HubResult<Run> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO runs (task_id, status, cause, runner_id, retry_count, rerun_failed_of,
                              scheduled_at, started_at, completed_at, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run.task_id)
        .bind(run.status)
        .bind(run.cause.as_str())
        .bind(&run.runner_id)
        .bind(run.retry_count)
        .bind(run.rerun_failed_of)
        .bind(run.scheduled_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.error_message)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        let created = Self::row_to_run(&row)?;
        debug!("创建{}成功", created.entity_description());
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> HubResult<Option<Run>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_task(&self, task_id: i64, limit: i64) -> HubResult<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE task_id = $1 ORDER BY id DESC LIMIT $2"
        ))
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn find_recent(&self, limit: i64) -> HubResult<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn find_active(&self) -> HubResult<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE status IN ('QUEUED', 'RUNNING')
             ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn find_active_by_task(&self, task_id: i64) -> HubResult<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE task_id = $1 AND status IN ('QUEUED', 'RUNNING')
             ORDER BY id"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn find_oldest_queued_by_task(&self, task_id: i64) -> HubResult<Option<Run>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE task_id = $1 AND status = 'QUEUED'
             ORDER BY scheduled_at, id LIMIT 1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    async fn claim(&self, id: i64, runner_id: &str) -> HubResult<bool> {
        // CAS写入；重复投递时同一runner可重复认领，其他runner失败
        let result = sqlx::query(
            "UPDATE runs SET runner_id = $2
             WHERE id = $1 AND (runner_id IS NULL OR runner_id = $2)",
        )
        .bind(id)
        .bind(runner_id)
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() > 0;
        if !claimed {
            debug!("运行 {} 已被其他runner认领, 本次跳过", id);
        }
        Ok(claimed)
    }

    async fn update_status(
        &self,
        id: i64,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> HubResult<bool> {
        let predecessors = Self::allowed_predecessors(status);
        if predecessors.is_empty() {
            return Err(HubError::RunConflict(format!(
                "运行状态不允许写回为 {}",
                status.as_str()
            )));
        }

        let placeholders: Vec<String> = (0..predecessors.len())
            .map(|i| format!("${}", i + 4))
            .collect();
        let sql = format!(
            "UPDATE runs SET status = $2, error_message = COALESCE($3, error_message)
             WHERE id = $1 AND status IN ({})",
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(id).bind(status).bind(error_message);
        for prev in predecessors {
            query = query.bind(*prev);
        }
        let result = query.execute(&self.pool).await?;

        let updated = result.rows_affected() > 0;
        if !updated {
            // 迟到的状态上报，当前状态已在目标之后
            warn!("忽略运行 {} 的过期状态写入: {}", id, status.as_str());
        }
        Ok(updated)
    }

    async fn mark_started(&self, id: i64, started_at: DateTime<Utc>) -> HubResult<()> {
        sqlx::query("UPDATE runs SET started_at = COALESCE(started_at, $2) WHERE id = $1")
            .bind(id)
            .bind(started_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_completed(&self, id: i64, completed_at: DateTime<Utc>) -> HubResult<()> {
        sqlx::query("UPDATE runs SET completed_at = COALESCE(completed_at, $2) WHERE id = $1")
            .bind(id)
            .bind(completed_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
