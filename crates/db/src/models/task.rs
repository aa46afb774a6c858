use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type, types::Json};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[sqlx(type_name = "task_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[sqlx(type_name = "task_priority", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Larger runs first.
    pub fn weight(self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 5,
            TaskPriority::High => 10,
            TaskPriority::Critical => 20,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub workflow_id: Option<Uuid>,
    pub phase_id: Option<String>,
    pub executor: String,
    pub instructions: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[sqlx(skip)]
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub webhook_url: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub timeout_seconds: i64,
    pub metadata: Json<Value>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fully resolved insert; defaults are applied by the caller.
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub name: String,
    pub description: Option<String>,
    pub workflow_id: Option<Uuid>,
    pub phase_id: Option<String>,
    pub executor: String,
    pub instructions: String,
    pub priority: TaskPriority,
    pub dependencies: Vec<Uuid>,
    pub webhook_url: Option<String>,
    pub max_retries: i64,
    pub timeout_seconds: i64,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub workflow_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// Status of one declared dependency; `status` is `None` when the referenced
/// task does not exist.
#[derive(Debug, Clone, FromRow)]
pub struct DependencyState {
    pub depends_on_id: Uuid,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskProgress {
    pub status: TaskStatus,
    pub started: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct DependencyEdge {
    pub task_id: Uuid,
    pub depends_on_id: Uuid,
}

const DEFAULT_LIST_LIMIT: i64 = 100;

fn delay_modifier(delay: Duration) -> String {
    format!("+{:.3} seconds", delay.as_secs_f64())
}

impl Task {
    /// Inserts the task and its dependency edges atomically.
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateTask,
        task_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let mut task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (
                id, name, description, workflow_id, phase_id, executor, instructions,
                priority, webhook_url, max_retries, timeout_seconds, metadata
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(&data.name)
        .bind(&data.description)
        .bind(data.workflow_id)
        .bind(&data.phase_id)
        .bind(&data.executor)
        .bind(&data.instructions)
        .bind(data.priority)
        .bind(&data.webhook_url)
        .bind(data.max_retries)
        .bind(data.timeout_seconds)
        .bind(Json(&data.metadata))
        .fetch_one(&mut *tx)
        .await?;

        for dependency in &data.dependencies {
            sqlx::query(
                r#"INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)"#,
            )
            .bind(task_id)
            .bind(dependency)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let mut seen = std::collections::HashSet::new();
        task.dependencies = data
            .dependencies
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        Ok(task)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        let task = sqlx::query_as::<_, Task>(r#"SELECT * FROM tasks WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await?;

        match task {
            Some(task) => Ok(Some(task.with_dependencies(pool).await?)),
            None => Ok(None),
        }
    }

    pub async fn exists(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(r#"SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)"#)
            .bind(id)
            .fetch_one(pool)
            .await
    }

    pub async fn with_dependencies(mut self, pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        self.dependencies = Self::dependencies_of(pool, self.id).await?;
        Ok(self)
    }

    pub async fn dependencies_of(pool: &SqlitePool, id: Uuid) -> Result<Vec<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            r#"SELECT depends_on_id FROM task_dependencies WHERE task_id = ?1 ORDER BY rowid"#,
        )
        .bind(id)
        .fetch_all(pool)
        .await
    }

    pub async fn dependency_states(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Vec<DependencyState>, sqlx::Error> {
        sqlx::query_as::<_, DependencyState>(
            r#"
            SELECT d.depends_on_id, dep.status
            FROM task_dependencies d
            LEFT JOIN tasks dep ON dep.id = d.depends_on_id
            WHERE d.task_id = ?1
            ORDER BY d.rowid
            "#,
        )
        .bind(id)
        .fetch_all(pool)
        .await
    }

    /// Dependency edges of every task in the workflow, including edges that
    /// point outside it.
    pub async fn dependency_edges_in_workflow(
        pool: &SqlitePool,
        workflow_id: Uuid,
    ) -> Result<Vec<DependencyEdge>, sqlx::Error> {
        sqlx::query_as::<_, DependencyEdge>(
            r#"
            SELECT d.task_id, d.depends_on_id
            FROM task_dependencies d
            JOIN tasks t ON t.id = d.task_id
            WHERE t.workflow_id = ?1
            ORDER BY d.rowid
            "#,
        )
        .bind(workflow_id)
        .fetch_all(pool)
        .await
    }

    /// Pending tasks that may be claimed right now, highest priority first,
    /// FIFO within a priority.
    ///
    /// A task qualifies when its backoff has elapsed, every dependency exists
    /// and is completed, its workflow (if any) is running and every
    /// prerequisite of its phase (if any) is completed.
    pub async fn find_ready(pool: &SqlitePool, limit: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(
            r#"
            SELECT t.*
            FROM tasks t
            WHERE t.status = 'pending'
              AND t.available_at <= datetime('now', 'subsec')
              AND NOT EXISTS (
                  SELECT 1
                  FROM task_dependencies d
                  LEFT JOIN tasks dep ON dep.id = d.depends_on_id
                  WHERE d.task_id = t.id
                    AND (dep.id IS NULL OR dep.status != 'completed')
              )
              AND (
                  t.workflow_id IS NULL
                  OR EXISTS (
                      SELECT 1 FROM workflows w
                      WHERE w.id = t.workflow_id AND w.status = 'running'
                  )
              )
              AND (
                  t.phase_id IS NULL
                  OR NOT EXISTS (
                      SELECT 1
                      FROM workflow_phases p
                      JOIN json_each(p.depends_on) pre
                      LEFT JOIN workflow_phases prereq
                             ON prereq.workflow_id = p.workflow_id
                            AND prereq.phase_id = pre.value
                      WHERE p.workflow_id = t.workflow_id
                        AND p.phase_id = t.phase_id
                        AND (prereq.phase_id IS NULL OR prereq.status != 'completed')
                  )
              )
            ORDER BY
                CASE t.priority
                    WHEN 'critical' THEN 0
                    WHEN 'high' THEN 1
                    WHEN 'normal' THEN 2
                    WHEN 'low' THEN 3
                    ELSE 4
                END,
                t.created_at ASC,
                t.rowid ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Pending tasks that can never become ready: a dependency is missing or
    /// ended without completing.
    pub async fn find_pending_with_broken_dependencies(
        pool: &SqlitePool,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(
            r#"
            SELECT t.*
            FROM tasks t
            WHERE t.status = 'pending'
              AND EXISTS (
                  SELECT 1
                  FROM task_dependencies d
                  LEFT JOIN tasks dep ON dep.id = d.depends_on_id
                  WHERE d.task_id = t.id
                    AND (dep.id IS NULL OR dep.status IN ('failed', 'cancelled'))
              )
            ORDER BY t.created_at ASC
            "#,
        )
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_status(
        pool: &SqlitePool,
        status: TaskStatus,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(
            r#"SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at ASC"#,
        )
        .bind(status)
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_workflow(
        pool: &SqlitePool,
        workflow_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"SELECT * FROM tasks WHERE workflow_id = ?1 ORDER BY created_at ASC, rowid ASC"#,
        )
        .bind(workflow_id)
        .fetch_all(pool)
        .await?;

        let mut loaded = Vec::with_capacity(tasks.len());
        for task in tasks {
            loaded.push(task.with_dependencies(pool).await?);
        }
        Ok(loaded)
    }

    pub async fn find_filtered(
        pool: &SqlitePool,
        filter: &TaskFilter,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR workflow_id = ?2)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?3
            "#,
        )
        .bind(filter.status)
        .bind(filter.workflow_id)
        .bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .fetch_all(pool)
        .await
    }

    pub async fn phase_progress<'e, E>(
        executor: E,
        workflow_id: Uuid,
        phase_id: &str,
    ) -> Result<Vec<TaskProgress>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, TaskProgress>(
            r#"
            SELECT status, started_at IS NOT NULL AS started
            FROM tasks
            WHERE workflow_id = ?1 AND phase_id = ?2
            "#,
        )
        .bind(workflow_id)
        .bind(phase_id)
        .fetch_all(executor)
        .await
    }

    /// Compare-and-swap on `status`. Returns `false` when the task was not in
    /// `expected`, which is how a losing claimer finds out.
    ///
    /// Entering `running` stamps `started_at`. Entering a terminal status
    /// stamps `completed_at` once, and only for a task that has started.
    pub async fn try_transition(
        pool: &SqlitePool,
        id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?3,
                started_at = CASE
                    WHEN ?3 = 'running' THEN datetime('now', 'subsec')
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN ?3 IN ('completed', 'failed', 'cancelled') AND started_at IS NOT NULL
                        THEN COALESCE(completed_at, datetime('now', 'subsec'))
                    ELSE completed_at
                END,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = ?2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// running -> completed with the executor's output.
    pub async fn complete_running(
        pool: &SqlitePool,
        id: Uuid,
        result: &str,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed',
                result = ?2,
                error = NULL,
                completed_at = COALESCE(completed_at, datetime('now', 'subsec')),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    /// running -> failed, no further attempts.
    pub async fn fail_running(
        pool: &SqlitePool,
        id: Uuid,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed',
                error = ?2,
                completed_at = COALESCE(completed_at, datetime('now', 'subsec')),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    /// running -> pending for another attempt, claimable again after `delay`.
    pub async fn requeue_running(
        pool: &SqlitePool,
        id: Uuid,
        error: &str,
        delay: Duration,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                error = ?2,
                retry_count = retry_count + 1,
                available_at = datetime('now', 'subsec', ?3),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(delay_modifier(delay))
        .execute(pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    /// pending -> failed for a task that can never run.
    pub async fn fail_pending(
        pool: &SqlitePool,
        id: Uuid,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed',
                error = ?2,
                completed_at = CASE
                    WHEN started_at IS NOT NULL THEN COALESCE(completed_at, datetime('now', 'subsec'))
                    ELSE completed_at
                END,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    /// Cancels a pending or running task. `None` means the task is missing or
    /// already terminal.
    pub async fn cancel(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'cancelled',
                completed_at = CASE
                    WHEN started_at IS NOT NULL THEN COALESCE(completed_at, datetime('now', 'subsec'))
                    ELSE completed_at
                END,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status IN ('pending', 'running')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// failed or cancelled -> pending with a fresh retry budget. `None` means
    /// the task is missing or not in a retryable status.
    pub async fn reset_for_retry<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'pending',
                retry_count = 0,
                result = NULL,
                error = NULL,
                started_at = NULL,
                completed_at = NULL,
                available_at = datetime('now', 'subsec'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status IN ('failed', 'cancelled')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    /// Cancels every task of the workflow still waiting to run.
    pub async fn cancel_pending_in_workflow(
        pool: &SqlitePool,
        workflow_id: Uuid,
        reason: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'cancelled',
                error = ?2,
                completed_at = CASE
                    WHEN started_at IS NOT NULL THEN COALESCE(completed_at, datetime('now', 'subsec'))
                    ELSE completed_at
                END,
                updated_at = datetime('now', 'subsec')
            WHERE workflow_id = ?1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(workflow_id)
        .bind(reason)
        .fetch_all(pool)
        .await
    }
}
