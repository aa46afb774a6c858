use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type, types::Json};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkflowPhaseError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Phase '{0}' already exists in this workflow")]
    Duplicate(String),
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "phase_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub workflow_id: Uuid,
    pub phase_id: String,
    pub name: String,
    pub depends_on: Json<Vec<String>>,
    pub status: PhaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkflowPhase {
    pub phase_id: String,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A prerequisite of some phase, with the prerequisite's status (`None` if
/// it was never declared).
#[derive(Debug, Clone, FromRow)]
pub struct PrerequisiteState {
    pub phase_id: String,
    pub status: Option<PhaseStatus>,
}

impl WorkflowPhase {
    pub async fn create(
        pool: &SqlitePool,
        workflow_id: Uuid,
        data: &CreateWorkflowPhase,
    ) -> Result<Self, WorkflowPhaseError> {
        let result = sqlx::query_as::<_, WorkflowPhase>(
            r#"
            INSERT INTO workflow_phases (workflow_id, phase_id, name, depends_on)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING *
            "#,
        )
        .bind(workflow_id)
        .bind(&data.phase_id)
        .bind(&data.name)
        .bind(Json(&data.depends_on))
        .fetch_one(pool)
        .await;

        match result {
            Ok(phase) => Ok(phase),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(WorkflowPhaseError::Duplicate(data.phase_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find(
        pool: &SqlitePool,
        workflow_id: Uuid,
        phase_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowPhase>(
            r#"SELECT * FROM workflow_phases WHERE workflow_id = ?1 AND phase_id = ?2"#,
        )
        .bind(workflow_id)
        .bind(phase_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_workflow(
        pool: &SqlitePool,
        workflow_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowPhase>(
            r#"SELECT * FROM workflow_phases WHERE workflow_id = ?1 ORDER BY rowid"#,
        )
        .bind(workflow_id)
        .fetch_all(pool)
        .await
    }

    pub async fn prerequisite_states<'e, E>(
        executor: E,
        workflow_id: Uuid,
        phase_id: &str,
    ) -> Result<Vec<PrerequisiteState>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, PrerequisiteState>(
            r#"
            SELECT pre.value AS phase_id, prereq.status AS status
            FROM workflow_phases p
            JOIN json_each(p.depends_on) pre
            LEFT JOIN workflow_phases prereq
                   ON prereq.workflow_id = p.workflow_id
                  AND prereq.phase_id = pre.value
            WHERE p.workflow_id = ?1 AND p.phase_id = ?2
            ORDER BY pre.key
            "#,
        )
        .bind(workflow_id)
        .bind(phase_id)
        .fetch_all(executor)
        .await
    }

    /// Takes the write lock on a phase row inside a transaction, so reads
    /// that follow see no concurrent writer until commit.
    pub async fn lock(
        conn: &mut sqlx::SqliteConnection,
        workflow_id: Uuid,
        phase_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE workflow_phases SET status = status WHERE workflow_id = ?1 AND phase_id = ?2"#,
        )
        .bind(workflow_id)
        .bind(phase_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Writes a derived status if it differs from the stored one.
    /// `started_at` and `completed_at` are stamped at most once.
    pub async fn update_status<'e, E>(
        executor: E,
        workflow_id: Uuid,
        phase_id: &str,
        status: PhaseStatus,
    ) -> Result<bool, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE workflow_phases
            SET status = ?3,
                started_at = CASE
                    WHEN ?3 != 'pending' THEN COALESCE(started_at, datetime('now', 'subsec'))
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN ?3 IN ('completed', 'failed')
                        THEN COALESCE(completed_at, datetime('now', 'subsec'))
                    ELSE completed_at
                END,
                updated_at = datetime('now', 'subsec')
            WHERE workflow_id = ?1 AND phase_id = ?2 AND status != ?3
            "#,
        )
        .bind(workflow_id)
        .bind(phase_id)
        .bind(status)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::workflow_with_phases;
    use crate::models::test_utils::setup_test_db;

    #[tokio::test]
    async fn duplicate_phase_is_rejected() {
        let (db, _dir) = setup_test_db().await;
        let workflow = workflow_with_phases(&db, &[("build", &[])]).await;

        let err = WorkflowPhase::create(
            &db.pool,
            workflow.id,
            &CreateWorkflowPhase {
                phase_id: "build".to_string(),
                name: "again".to_string(),
                depends_on: vec![],
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkflowPhaseError::Duplicate(id) if id == "build"));
    }

    #[tokio::test]
    async fn prerequisites_report_missing_and_incomplete() {
        let (db, _dir) = setup_test_db().await;
        let workflow =
            workflow_with_phases(&db, &[("a", &[]), ("b", &["a", "ghost"])]).await;

        let states = WorkflowPhase::prerequisite_states(&db.pool, workflow.id, "b")
            .await
            .unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].phase_id, "a");
        assert_eq!(states[0].status, Some(PhaseStatus::Pending));
        assert_eq!(states[1].phase_id, "ghost");
        assert_eq!(states[1].status, None);

        let phase = WorkflowPhase::find(&db.pool, workflow.id, "b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(phase.depends_on.0, vec!["a".to_string(), "ghost".to_string()]);
    }
}
