use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "workflow_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Created => "created",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkflow {
    pub name: String,
    pub description: Option<String>,
}

impl Workflow {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateWorkflow,
        workflow_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Workflow>(
            r#"
            INSERT INTO workflows (id, name, description)
            VALUES (?1, ?2, ?3)
            RETURNING *
            "#,
        )
        .bind(workflow_id)
        .bind(&data.name)
        .bind(&data.description)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Workflow>(r#"SELECT * FROM workflows WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// created -> running. `false` if the workflow was already started.
    pub async fn try_start(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'running',
                started_at = datetime('now', 'subsec'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'created'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Writes a derived status. Only touches the row when the value changes,
    /// so repeated recomputation is a no-op.
    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: WorkflowStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET status = ?2,
                completed_at = CASE
                    WHEN ?2 IN ('completed', 'failed')
                        THEN COALESCE(completed_at, datetime('now', 'subsec'))
                    ELSE completed_at
                END,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status != ?2
            "#,
        )
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
