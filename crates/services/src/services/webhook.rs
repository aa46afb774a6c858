use std::time::Duration;

use db::{
    DBService,
    models::webhook::{CreateWebhookDelivery, WebhookDelivery, WebhookJob},
};
use futures::{StreamExt, stream};
use reqwest::Client;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::WebhookSettings;

const MAX_RESPONSE_LEN: usize = 2000;
const CONCURRENT_DELIVERIES: usize = 8;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    Retrying { next_attempt_in: Duration },
    Abandoned,
}

/// Delivers queued task notifications. A failed POST is retried with a
/// linearly growing delay until the attempt budget runs out; the task itself
/// is never touched.
#[derive(Clone)]
pub struct WebhookService {
    db: DBService,
    client: Client,
    settings: WebhookSettings,
}

impl WebhookService {
    pub fn new(db: DBService, settings: WebhookSettings) -> Result<Self, WebhookError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            db,
            client,
            settings,
        })
    }

    /// Initial attempt plus `max_retries`.
    pub fn max_attempts(&self) -> i64 {
        i64::from(self.settings.max_retries) + 1
    }

    /// Wait after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: i64) -> Duration {
        let attempt = u32::try_from(attempt.max(1)).unwrap_or(u32::MAX);
        Duration::from_millis(self.settings.retry_delay_ms.max(1)).saturating_mul(attempt)
    }

    pub async fn history(&self, task_id: Uuid) -> Result<Vec<WebhookDelivery>, WebhookError> {
        Ok(WebhookDelivery::find_by_task(&self.db.pool, task_id).await?)
    }

    /// Attempts every job that is due. Returns how many were delivered.
    pub async fn run_once(&self) -> Result<usize, WebhookError> {
        let due = WebhookJob::find_due(&self.db.pool, i64::from(self.settings.batch_size)).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Delivering due webhooks");

        let results: Vec<_> = stream::iter(due)
            .map(|job| async move {
                let task_id = job.task_id;
                (task_id, self.deliver(job).await)
            })
            .buffer_unordered(CONCURRENT_DELIVERIES)
            .collect()
            .await;

        let mut delivered = 0;
        for (task_id, result) in results {
            match result {
                Ok(DeliveryResult::Delivered) => delivered += 1,
                Ok(_) => {}
                Err(e) => error!(%task_id, "Webhook bookkeeping failed: {}", e),
            }
        }
        Ok(delivered)
    }

    /// Makes one attempt and records it.
    pub async fn deliver(&self, job: WebhookJob) -> Result<DeliveryResult, WebhookError> {
        let attempt = job.attempts + 1;
        let body = serde_json::to_string(&job.payload.0)?;

        let (status_code, response, delivered) = match self
            .client
            .post(&job.url)
            .header("content-type", "application/json")
            .body(body.clone())
            .send()
            .await
        {
            Ok(res) => {
                let status = res.status();
                let text = match res.text().await {
                    Ok(text) => text,
                    Err(e) => format!("Failed to read response body: {e}"),
                };
                (
                    Some(i64::from(status.as_u16())),
                    Some(truncate(text)),
                    status.is_success(),
                )
            }
            Err(e) => (None, Some(truncate(e.to_string())), false),
        };

        WebhookDelivery::record(
            &self.db.pool,
            &CreateWebhookDelivery {
                task_id: job.task_id,
                attempt,
                url: job.url.clone(),
                payload: body,
                status_code,
                response,
                delivered,
            },
        )
        .await?;

        if delivered {
            WebhookJob::mark_delivered(&self.db.pool, job.task_id, attempt).await?;
            info!(task_id = %job.task_id, attempt, url = %job.url, "Webhook delivered");
            return Ok(DeliveryResult::Delivered);
        }

        if attempt >= self.max_attempts() {
            WebhookJob::abandon(&self.db.pool, job.task_id, attempt).await?;
            error!(
                task_id = %job.task_id,
                attempts = attempt,
                url = %job.url,
                "Webhook delivery abandoned"
            );
            return Ok(DeliveryResult::Abandoned);
        }

        let delay = self.delay_for_attempt(attempt);
        WebhookJob::schedule_retry(&self.db.pool, job.task_id, attempt, delay).await?;
        warn!(
            task_id = %job.task_id,
            attempt,
            status = ?status_code,
            "Webhook delivery failed, retrying in {}ms",
            delay.as_millis()
        );
        Ok(DeliveryResult::Retrying {
            next_attempt_in: delay,
        })
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        let interval = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        tokio::spawn(async move {
            info!("[WEBHOOKS] Started - polling every {}ms", interval.as_millis());
            loop {
                if let Err(e) = service.run_once().await {
                    error!("[WEBHOOKS] Delivery pass failed: {}", e);
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("[WEBHOOKS] Stopped");
        })
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_RESPONSE_LEN {
        let mut end = MAX_RESPONSE_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
