use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use taskhub_domain::entities::{LogLine, OutputStream, StepLog, StepLogStatus};
use taskhub_domain::repositories::StepLogRepository;
use taskhub_errors::{HubError, HubResult};

pub struct SqliteStepLogRepository {
    pool: SqlitePool,
}

const STEP_LOG_COLUMNS: &str =
    "id, run_id, step_id, status, exit_code, error_message, started_at, completed_at";

impl SqliteStepLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_step_log(row: &sqlx::sqlite::SqliteRow) -> HubResult<StepLog> {
        Ok(StepLog {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            status: row.try_get("status")?,
            exit_code: row.try_get("exit_code")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_log_line(row: &sqlx::sqlite::SqliteRow) -> HubResult<LogLine> {
        let stream: String = row.try_get("stream")?;
        Ok(LogLine {
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            seq: row.try_get("seq")?,
            stream: OutputStream::parse(&stream)
                .ok_or_else(|| HubError::database_error(format!("非法的stream值: {stream}")))?,
            line: row.try_get("line")?,
            logged_at: row.try_get("logged_at")?,
        })
    }

    fn allowed_predecessors(status: StepLogStatus) -> &'static [StepLogStatus] {
        match status {
            StepLogStatus::Pending => &[],
            StepLogStatus::Running => &[StepLogStatus::Pending],
            StepLogStatus::Success => &[StepLogStatus::Running],
            StepLogStatus::Failed => &[StepLogStatus::Pending, StepLogStatus::Running],
            StepLogStatus::Skipped => &[StepLogStatus::Pending],
        }
    }
}

#[async_trait]
impl StepLogRepository for SqliteStepLogRepository {
    async fn create(&self, step_log: &StepLog) -> HubResult<StepLog> {
        // (run_id, step_id)唯一；重复投递时返回已有记录
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO step_logs (run_id, step_id, status, exit_code, error_message,
                                   started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT(run_id, step_id) DO NOTHING
            RETURNING {STEP_LOG_COLUMNS}
            "#
        ))
        .bind(step_log.run_id)
        .bind(step_log.step_id)
        .bind(step_log.status)
        .bind(step_log.exit_code)
        .bind(&step_log.error_message)
        .bind(step_log.started_at)
        .bind(step_log.completed_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_step_log(&row),
            None => self
                .find_by_run_and_step(step_log.run_id, step_log.step_id)
                .await?
                .ok_or_else(|| {
                    HubError::database_error("步骤日志插入冲突后查询不到已有记录")
                }),
        }
    }

    async fn find_by_id(&self, id: i64) -> HubResult<Option<StepLog>> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_LOG_COLUMNS} FROM step_logs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_step_log(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_run(&self, run_id: i64) -> HubResult<Vec<StepLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_LOG_COLUMNS} FROM step_logs WHERE run_id = $1 ORDER BY id"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_step_log).collect()
    }

    async fn find_by_run_and_step(&self, run_id: i64, step_id: i64) -> HubResult<Option<StepLog>> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_LOG_COLUMNS} FROM step_logs WHERE run_id = $1 AND step_id = $2"
        ))
        .bind(run_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_step_log(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        run_id: i64,
        step_id: i64,
        status: StepLogStatus,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> HubResult<bool> {
        let predecessors = Self::allowed_predecessors(status);
        if predecessors.is_empty() {
            return Err(HubError::RunConflict(format!(
                "步骤状态不允许写回为 {}",
                status.as_str()
            )));
        }

        let now = Utc::now();
        let started_at = if status == StepLogStatus::Running {
            Some(now)
        } else {
            None
        };
        let completed_at = if status.is_terminal() { Some(now) } else { None };

        let placeholders: Vec<String> = (0..predecessors.len())
            .map(|i| format!("${}", i + 8))
            .collect();
        let sql = format!(
            r#"
            UPDATE step_logs
            SET status = $3,
                exit_code = COALESCE($4, exit_code),
                error_message = COALESCE($5, error_message),
                started_at = COALESCE(started_at, $6),
                completed_at = COALESCE(completed_at, $7)
            WHERE run_id = $1 AND step_id = $2 AND status IN ({})
            "#,
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql)
            .bind(run_id)
            .bind(step_id)
            .bind(status)
            .bind(exit_code)
            .bind(error_message)
            .bind(started_at)
            .bind(completed_at);
        for prev in predecessors {
            query = query.bind(*prev);
        }
        let result = query.execute(&self.pool).await?;

        let updated = result.rows_affected() > 0;
        if !updated {
            warn!(
                "忽略步骤的过期状态写入: run={} step={} status={}",
                run_id,
                step_id,
                status.as_str()
            );
        }
        Ok(updated)
    }

    async fn append_lines(&self, lines: &[LogLine]) -> HubResult<u64> {
        if lines.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for line in lines {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO log_lines (run_id, step_id, seq, stream, line, logged_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(line.run_id)
            .bind(line.step_id)
            .bind(line.seq)
            .bind(line.stream.as_str())
            .bind(&line.line)
            .bind(line.logged_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn find_lines_after(
        &self,
        run_id: i64,
        step_id: i64,
        after_seq: i64,
        limit: i64,
    ) -> HubResult<Vec<LogLine>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, step_id, seq, stream, line, logged_at
            FROM log_lines
            WHERE run_id = $1 AND step_id = $2 AND seq > $3
            ORDER BY seq
            LIMIT $4
            "#,
        )
        .bind(run_id)
        .bind(step_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_log_line).collect()
    }
}
