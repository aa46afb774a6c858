use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "log_level", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Append-only execution history of a task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl TaskLog {
    pub async fn append(
        pool: &SqlitePool,
        task_id: Uuid,
        level: LogLevel,
        message: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, TaskLog>(
            r#"
            INSERT INTO task_logs (task_id, level, message)
            VALUES (?1, ?2, ?3)
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(level)
        .bind(message)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, TaskLog>(
            r#"SELECT * FROM task_logs WHERE task_id = ?1 ORDER BY id ASC"#,
        )
        .bind(task_id)
        .fetch_all(pool)
        .await
    }
}
