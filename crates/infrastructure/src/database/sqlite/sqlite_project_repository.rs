use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use taskhub_domain::entities::{Param, Project, SequenceMode};
use taskhub_domain::repositories::ProjectRepository;
use taskhub_errors::{HubError, HubResult};

pub struct SqliteProjectRepository {
    pool: SqlitePool,
}

impl SqliteProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_project(row: &sqlx::sqlite::SqliteRow) -> HubResult<Project> {
        let mode: String = row.try_get("sequence_mode")?;
        let params_json: String = row.try_get("params")?;
        let params: Vec<Param> = serde_json::from_str(&params_json)?;
        Ok(Project {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            sequence_mode: SequenceMode::parse(&mode).ok_or_else(|| {
                HubError::database_error(format!("非法的sequence_mode值: {mode}"))
            })?,
            params,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ProjectRepository for SqliteProjectRepository {
    async fn create(&self, project: &Project) -> HubResult<Project> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO projects (name, description, sequence_mode, params, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, description, sequence_mode, params, created_at, updated_at
            "#,
        )
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.sequence_mode.as_str())
        .bind(serde_json::to_string(&project.params)?)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let created = Self::row_to_project(&row)?;
        debug!("创建项目成功: '{}' (ID: {})", created.name, created.id);
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> HubResult<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, name, description, sequence_mode, params, created_at, updated_at
             FROM projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_project(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_all(&self) -> HubResult<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, name, description, sequence_mode, params, created_at, updated_at
             FROM projects ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_project).collect()
    }

    async fn update(&self, project: &Project) -> HubResult<Project> {
        let result = sqlx::query(
            r#"
            UPDATE projects
            SET name = $2, description = $3, sequence_mode = $4, params = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.sequence_mode.as_str())
        .bind(serde_json::to_string(&project.params)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HubError::ProjectNotFound { id: project.id });
        }
        self.find_by_id(project.id)
            .await?
            .ok_or(HubError::ProjectNotFound { id: project.id })
    }

    async fn delete(&self, id: i64) -> HubResult<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
