use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use taskhub_domain::entities::{OverlapPolicy, Param, Step, StepKind, Task, Trigger};
use taskhub_domain::repositories::TaskRepository;
use taskhub_errors::{HubError, HubResult};

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> HubResult<Task> {
        let policy: String = row.try_get("overlap_policy")?;
        let params_json: String = row.try_get("params")?;
        let triggers_json: String = row.try_get("triggers")?;
        let params: Vec<Param> = serde_json::from_str(&params_json)?;
        let triggers: Vec<Trigger> = serde_json::from_str(&triggers_json)?;
        Ok(Task {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            enabled: row.try_get("enabled")?,
            rank: row.try_get("rank")?,
            overlap_policy: OverlapPolicy::parse(&policy).ok_or_else(|| {
                HubError::database_error(format!("非法的overlap_policy值: {policy}"))
            })?,
            max_retries: row.try_get("max_retries")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            params,
            triggers,
            next_fire_at: row.try_get("next_fire_at")?,
            last_fired_at: row.try_get("last_fired_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> HubResult<Step> {
        let kind: String = row.try_get("kind")?;
        let config_json: String = row.try_get("config")?;
        Ok(Step {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            name: row.try_get("name")?,
            rank: row.try_get("rank")?,
            kind: StepKind::parse(&kind)
                .ok_or_else(|| HubError::database_error(format!("非法的步骤类型: {kind}")))?,
            config: serde_json::from_str(&config_json)?,
            required: row.try_get("required")?,
            depends_on_previous: row.try_get("depends_on_previous")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
        })
    }
}

const TASK_COLUMNS: &str = "id, project_id, name, enabled, rank, overlap_policy, max_retries, \
     timeout_seconds, params, triggers, next_fire_at, last_fired_at, created_at, updated_at";

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> HubResult<Task> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO tasks (project_id, name, enabled, rank, overlap_policy, max_retries,
                               timeout_seconds, params, triggers, next_fire_at, last_fired_at,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task.project_id)
        .bind(&task.name)
        .bind(task.enabled)
        .bind(task.rank)
        .bind(task.overlap_policy.as_str())
        .bind(task.max_retries)
        .bind(task.timeout_seconds)
        .bind(serde_json::to_string(&task.params)?)
        .bind(serde_json::to_string(&task.triggers)?)
        .bind(task.next_fire_at)
        .bind(task.last_fired_at)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let created = Self::row_to_task(&row)?;
        debug!("创建{}成功", created.entity_description());
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> HubResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_all(&self) -> HubResult<Vec<Task>> {
        let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn find_by_project(&self, project_id: i64) -> HubResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = $1 ORDER BY rank, id"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn update(&self, task: &Task) -> HubResult<Task> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET name = $2, enabled = $3, rank = $4, overlap_policy = $5, max_retries = $6,
                timeout_seconds = $7, params = $8, triggers = $9, updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(&task.name)
        .bind(task.enabled)
        .bind(task.rank)
        .bind(task.overlap_policy.as_str())
        .bind(task.max_retries)
        .bind(task.timeout_seconds)
        .bind(serde_json::to_string(&task.params)?)
        .bind(serde_json::to_string(&task.triggers)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HubError::task_not_found(task.id));
        }
        self.find_by_id(task.id)
            .await?
            .ok_or_else(|| HubError::task_not_found(task.id))
    }

    async fn delete(&self, id: i64) -> HubResult<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> HubResult<bool> {
        let result = sqlx::query("UPDATE tasks SET enabled = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> HubResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE enabled = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= $1
            ORDER BY next_fire_at
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn update_fire_times(
        &self,
        id: i64,
        next_fire_at: Option<DateTime<Utc>>,
        last_fired_at: Option<DateTime<Utc>>,
    ) -> HubResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET next_fire_at = $2, last_fired_at = COALESCE($3, last_fired_at) WHERE id = $1",
        )
        .bind(id)
        .bind(next_fire_at)
        .bind(last_fired_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HubError::task_not_found(id));
        }
        Ok(())
    }

    async fn create_step(&self, step: &Step) -> HubResult<Step> {
        let row = sqlx::query(
            r#"
            INSERT INTO steps (task_id, name, rank, kind, config, required, depends_on_previous,
                               timeout_seconds)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, task_id, name, rank, kind, config, required, depends_on_previous,
                      timeout_seconds
            "#,
        )
        .bind(step.task_id)
        .bind(&step.name)
        .bind(step.rank)
        .bind(step.kind.as_str())
        .bind(serde_json::to_string(&step.config)?)
        .bind(step.required)
        .bind(step.depends_on_previous)
        .bind(step.timeout_seconds)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_step(&row)
    }

    async fn find_step(&self, step_id: i64) -> HubResult<Option<Step>> {
        let row = sqlx::query(
            "SELECT id, task_id, name, rank, kind, config, required, depends_on_previous,
                    timeout_seconds
             FROM steps WHERE id = $1",
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_step(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_steps(&self, task_id: i64) -> HubResult<Vec<Step>> {
        let rows = sqlx::query(
            "SELECT id, task_id, name, rank, kind, config, required, depends_on_previous,
                    timeout_seconds
             FROM steps WHERE task_id = $1 ORDER BY rank, id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_step).collect()
    }

    async fn update_step(&self, step: &Step) -> HubResult<Step> {
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET name = $2, rank = $3, kind = $4, config = $5, required = $6,
                depends_on_previous = $7, timeout_seconds = $8
            WHERE id = $1
            "#,
        )
        .bind(step.id)
        .bind(&step.name)
        .bind(step.rank)
        .bind(step.kind.as_str())
        .bind(serde_json::to_string(&step.config)?)
        .bind(step.required)
        .bind(step.depends_on_previous)
        .bind(step.timeout_seconds)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HubError::StepNotFound { id: step.id });
        }
        self.find_step(step.id)
            .await?
            .ok_or(HubError::StepNotFound { id: step.id })
    }

    async fn delete_step(&self, step_id: i64) -> HubResult<bool> {
        let result = sqlx::query("DELETE FROM steps WHERE id = $1")
            .bind(step_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
