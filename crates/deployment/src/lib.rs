use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use db::{
    DBService,
    models::task::{Task, TaskStatus},
};
use executors::executors::ExecutorError;
use services::services::{
    config::ConfigError,
    result_processor::{Disposition, ResultProcessor},
    scheduler::Scheduler,
    tasks::TaskService,
    webhook::{WebhookError, WebhookService},
    worker_pool::WorkerPool,
    workflow::WorkflowService,
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[async_trait]
pub trait Deployment: Clone + Send + Sync + 'static {
    async fn new() -> Result<Self, DeploymentError>;

    fn db(&self) -> &DBService;

    fn tasks(&self) -> &TaskService;

    fn workflows(&self) -> &WorkflowService;

    fn webhooks(&self) -> &WebhookService;

    fn results(&self) -> &ResultProcessor;

    fn scheduler(&self) -> &Scheduler;

    fn workers(&self) -> &WorkerPool {
        self.scheduler().workers()
    }

    /// Tasks still marked `running` were interrupted by the last shutdown.
    /// Each counts as a failed attempt: requeued if it has retries left,
    /// failed otherwise. Call at startup, before the scheduler runs.
    async fn recover_orphaned_tasks(&self) -> Result<usize, DeploymentError> {
        let running = Task::find_by_status(&self.db().pool, TaskStatus::Running).await?;
        let mut recovered = 0;
        for task in running {
            tracing::info!(task_id = %task.id, "Found orphaned running task");
            match self.results().recover_orphan(&task).await {
                Ok(Disposition::Discarded) => {}
                Ok(disposition) => {
                    tracing::info!(task_id = %task.id, ?disposition, "Recovered orphaned task");
                    recovered += 1;
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, "Failed to recover orphaned task: {}", e);
                }
            }
        }
        Ok(recovered)
    }

    fn spawn_background_services(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.scheduler().spawn(shutdown.clone()),
            self.webhooks().spawn(shutdown),
        ]
    }

    /// Waits for the loops to stop, then for in-flight attempts to record
    /// their outcome.
    async fn drain(&self, handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Background service ended abnormally: {}", e);
            }
        }
        self.workers().shutdown().await;
    }
}
