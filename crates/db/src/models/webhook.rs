use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type, types::Json};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "webhook_job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WebhookJobStatus {
    Pending,
    Delivered,
    Abandoned,
}

/// Durable notification owed for a finished task. One per task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookJob {
    pub task_id: Uuid,
    pub url: String,
    pub payload: Json<Value>,
    pub attempts: i64,
    pub status: WebhookJobStatus,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One POST to a webhook endpoint, successful or not. Never updated.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: i64,
    pub task_id: Uuid,
    pub attempt: i64,
    pub url: String,
    pub payload: String,
    pub status_code: Option<i64>,
    pub response: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateWebhookDelivery {
    pub task_id: Uuid,
    pub attempt: i64,
    pub url: String,
    pub payload: String,
    pub status_code: Option<i64>,
    pub response: Option<String>,
    pub delivered: bool,
}

impl WebhookJob {
    /// Queues the notification unless one already exists for the task.
    /// Returns whether a new job was created.
    pub async fn enqueue(
        pool: &SqlitePool,
        task_id: Uuid,
        url: &str,
        payload: &Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO webhook_jobs (task_id, url, payload)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(task_id)
        .bind(url)
        .bind(Json(payload))
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Drops the task's notification job so its next terminal status queues
    /// a new one. Delivery history is kept.
    pub async fn discard<'e, E>(executor: E, task_id: Uuid) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(r#"DELETE FROM webhook_jobs WHERE task_id = ?1"#)
            .bind(task_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn find_by_task(pool: &SqlitePool, task_id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, WebhookJob>(r#"SELECT * FROM webhook_jobs WHERE task_id = ?1"#)
            .bind(task_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_due(pool: &SqlitePool, limit: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, WebhookJob>(
            r#"
            SELECT * FROM webhook_jobs
            WHERE status = 'pending' AND next_attempt_at <= datetime('now', 'subsec')
            ORDER BY next_attempt_at ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    pub async fn mark_delivered(
        pool: &SqlitePool,
        task_id: Uuid,
        attempts: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_jobs
            SET status = 'delivered', attempts = ?2, updated_at = datetime('now', 'subsec')
            WHERE task_id = ?1 AND status = 'pending'
            "#,
        )
        .bind(task_id)
        .bind(attempts)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn schedule_retry(
        pool: &SqlitePool,
        task_id: Uuid,
        attempts: i64,
        delay: std::time::Duration,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_jobs
            SET attempts = ?2,
                next_attempt_at = datetime('now', 'subsec', ?3),
                updated_at = datetime('now', 'subsec')
            WHERE task_id = ?1 AND status = 'pending'
            "#,
        )
        .bind(task_id)
        .bind(attempts)
        .bind(format!("+{:.3} seconds", delay.as_secs_f64()))
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn abandon(pool: &SqlitePool, task_id: Uuid, attempts: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_jobs
            SET status = 'abandoned', attempts = ?2, updated_at = datetime('now', 'subsec')
            WHERE task_id = ?1 AND status = 'pending'
            "#,
        )
        .bind(task_id)
        .bind(attempts)
        .execute(pool)
        .await?;
        Ok(())
    }
}

impl WebhookDelivery {
    pub async fn record(
        pool: &SqlitePool,
        data: &CreateWebhookDelivery,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, WebhookDelivery>(
            r#"
            INSERT INTO webhook_deliveries
                (task_id, attempt, url, payload, status_code, response, delivered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                    CASE WHEN ?7 THEN datetime('now', 'subsec') ELSE NULL END)
            RETURNING *
            "#,
        )
        .bind(data.task_id)
        .bind(data.attempt)
        .bind(&data.url)
        .bind(&data.payload)
        .bind(data.status_code)
        .bind(&data.response)
        .bind(data.delivered)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, WebhookDelivery>(
            r#"SELECT * FROM webhook_deliveries WHERE task_id = ?1 ORDER BY id ASC"#,
        )
        .bind(task_id)
        .fetch_all(pool)
        .await
    }
}
