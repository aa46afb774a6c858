use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use db::DBService;
use deployment::{Deployment, DeploymentError};
use executors::executors::{CommandExecutor, TaskExecutor};
use services::services::{
    config::{Config, load_config_from_file, save_config_to_file},
    result_processor::{ResultProcessor, RetryPolicy},
    scheduler::Scheduler,
    tasks::{TaskDefaults, TaskService},
    webhook::WebhookService,
    worker_pool::WorkerPool,
    workflow::WorkflowService,
};
use utils::assets::{config_path, database_path};

/// Single-process deployment: one SQLite file, one scheduler, one worker
/// pool running the configured command.
#[derive(Clone)]
pub struct LocalDeployment {
    db: DBService,
    tasks: TaskService,
    workflows: WorkflowService,
    webhooks: WebhookService,
    results: ResultProcessor,
    scheduler: Scheduler,
}

impl LocalDeployment {
    /// Wires every service from an already loaded config.
    pub fn from_parts(
        config: Config,
        db: DBService,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self, DeploymentError> {
        let results = ResultProcessor::new(db.clone(), RetryPolicy::from(&config.retry));
        let workers = WorkerPool::new(config.workers, executor, results.clone(), db.clone());
        let scheduler = Scheduler::new(
            db.clone(),
            workers,
            results.clone(),
            Duration::from_millis(config.scheduler.poll_interval_ms.max(1)),
        );
        let tasks = TaskService::new(db.clone(), results.clone(), TaskDefaults::from(&config));
        let workflows = WorkflowService::new(db.clone(), tasks.clone(), results.clone());
        let webhooks = WebhookService::new(db.clone(), config.webhook.clone())?;

        Ok(Self {
            db,
            tasks,
            workflows,
            webhooks,
            results,
            scheduler,
        })
    }
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn new() -> Result<Self, DeploymentError> {
        let mut raw_config = load_config_from_file(&config_path()).await;
        raw_config.apply_env_overrides(|key| std::env::var(key).ok())?;

        // Always save config (may have been migrated)
        save_config_to_file(&raw_config, &config_path()).await?;

        let db = DBService::new_with_path(&database_path(), raw_config.database.max_connections)
            .await?;
        let executor = CommandExecutor::new(&raw_config.executor.command)?;
        tracing::info!(
            workers = raw_config.workers,
            executor = %raw_config.executor.command,
            "Local deployment ready"
        );

        Self::from_parts(raw_config, db, Arc::new(executor))
    }

    fn db(&self) -> &DBService {
        &self.db
    }

    fn tasks(&self) -> &TaskService {
        &self.tasks
    }

    fn workflows(&self) -> &WorkflowService {
        &self.workflows
    }

    fn webhooks(&self) -> &WebhookService {
        &self.webhooks
    }

    fn results(&self) -> &ResultProcessor {
        &self.results
    }

    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use db::models::task::{CreateTask, Task, TaskPriority, TaskStatus};
    use executors::executors::{ExecutionOutput, ExecutionRequest, ExecutorError};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    struct Unused;

    #[async_trait]
    impl TaskExecutor for Unused {
        async fn execute(
            &self,
            _request: ExecutionRequest,
        ) -> Result<ExecutionOutput, ExecutorError> {
            Err(ExecutorError::Other("not expected to run".to_string()))
        }
    }

    fn orphan(name: &str, max_retries: i64) -> CreateTask {
        CreateTask {
            name: name.to_string(),
            description: None,
            workflow_id: None,
            phase_id: None,
            executor: "test".to_string(),
            instructions: String::new(),
            priority: TaskPriority::Normal,
            dependencies: Vec::new(),
            webhook_url: None,
            max_retries,
            timeout_seconds: 30,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn orphaned_running_tasks_are_treated_as_failed_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let db = DBService::new_with_path(&dir.path().join("db.sqlite"), 4)
            .await
            .unwrap();
        let deployment =
            LocalDeployment::from_parts(Config::default(), db.clone(), Arc::new(Unused)).unwrap();

        let mut ids = Vec::new();
        for (name, retries) in [("retryable", 2), ("exhausted", 0)] {
            let task = Task::create(&db.pool, &orphan(name, retries), Uuid::new_v4())
                .await
                .unwrap();
            Task::try_transition(&db.pool, task.id, TaskStatus::Pending, TaskStatus::Running)
                .await
                .unwrap();
            ids.push(task.id);
        }

        assert_eq!(deployment.recover_orphaned_tasks().await.unwrap(), 2);

        let retryable = Task::find_by_id(&db.pool, ids[0]).await.unwrap().unwrap();
        assert_eq!(retryable.status, TaskStatus::Pending);
        assert_eq!(retryable.retry_count, 1);

        let exhausted = Task::find_by_id(&db.pool, ids[1]).await.unwrap().unwrap();
        assert_eq!(exhausted.status, TaskStatus::Failed);
        assert!(exhausted.error.unwrap().contains("restart"));

        assert_eq!(deployment.recover_orphaned_tasks().await.unwrap(), 0);
    }
}
