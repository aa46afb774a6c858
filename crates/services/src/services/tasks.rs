use db::{
    DBService,
    models::{
        task::{CreateTask, Task, TaskFilter, TaskPriority, TaskStatus},
        task_log::{LogLevel, TaskLog},
        webhook::{WebhookDelivery, WebhookJob},
    },
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::{
    config::Config,
    result_processor::{ResultProcessor, ResultProcessorError},
};

const MAX_LIST_LIMIT: i64 = 1000;

#[derive(Debug, Error)]
pub enum TaskServiceError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Results(#[from] ResultProcessorError),
    #[error("Task {0} not found")]
    NotFound(Uuid),
    #[error("Invalid task: {0}")]
    Validation(String),
    #[error("Unknown dependency {0}")]
    UnknownDependency(Uuid),
    #[error("Task {id} is already {status} and cannot be cancelled")]
    NotCancellable { id: Uuid, status: TaskStatus },
    #[error("Task {id} is {status}; only failed or cancelled tasks can be retried")]
    NotRetryable { id: Uuid, status: TaskStatus },
    #[error("Task {0} belongs to a workflow and cannot be retried on its own")]
    InWorkflow(Uuid),
}

/// Submission body. `instructions` is opaque: a JSON string is stored as is,
/// any other JSON value is stored serialized.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitTask {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub executor: String,
    pub instructions: Value,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskDefaults {
    pub max_retries: u32,
    pub timeout_seconds: u64,
}

impl From<&Config> for TaskDefaults {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.retry.default_max_retries,
            timeout_seconds: config.default_timeout_secs,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub logs: Vec<TaskLog>,
    pub webhook: Option<WebhookJob>,
    pub webhook_deliveries: Vec<WebhookDelivery>,
}

#[derive(Clone)]
pub struct TaskService {
    db: DBService,
    processor: ResultProcessor,
    defaults: TaskDefaults,
}

impl TaskService {
    pub fn new(db: DBService, processor: ResultProcessor, defaults: TaskDefaults) -> Self {
        Self {
            db,
            processor,
            defaults,
        }
    }

    pub async fn create_task(&self, submission: SubmitTask) -> Result<Task, TaskServiceError> {
        let data = self.resolve(submission, None, None).await?;
        self.insert(&data).await
    }

    /// Validates a submission and fills in defaults.
    pub(crate) async fn resolve(
        &self,
        submission: SubmitTask,
        workflow_id: Option<Uuid>,
        phase_id: Option<String>,
    ) -> Result<CreateTask, TaskServiceError> {
        let name = submission.name.trim();
        if name.is_empty() {
            return Err(TaskServiceError::Validation("name must not be empty".into()));
        }
        let executor = submission.executor.trim();
        if executor.is_empty() {
            return Err(TaskServiceError::Validation(
                "executor must not be empty".into(),
            ));
        }
        if let Some(url) = submission.webhook_url.as_deref() {
            validate_webhook_url(url)?;
        }
        let timeout_seconds = submission
            .timeout_seconds
            .unwrap_or(self.defaults.timeout_seconds);
        if timeout_seconds == 0 {
            return Err(TaskServiceError::Validation(
                "timeout_seconds must be positive".into(),
            ));
        }
        let metadata = submission.metadata.unwrap_or_else(|| Value::Object(Default::default()));
        if !metadata.is_object() {
            return Err(TaskServiceError::Validation(
                "metadata must be a JSON object".into(),
            ));
        }

        for dependency in &submission.dependencies {
            if !Task::exists(&self.db.pool, *dependency).await? {
                return Err(TaskServiceError::UnknownDependency(*dependency));
            }
        }

        let instructions = match submission.instructions {
            Value::String(text) => text,
            other => other.to_string(),
        };

        Ok(CreateTask {
            name: name.to_string(),
            description: submission.description,
            workflow_id,
            phase_id,
            executor: executor.to_string(),
            instructions,
            priority: submission.priority.unwrap_or_default(),
            dependencies: submission.dependencies,
            webhook_url: submission.webhook_url,
            max_retries: i64::from(submission.max_retries.unwrap_or(self.defaults.max_retries)),
            timeout_seconds: i64::try_from(timeout_seconds).unwrap_or(i64::MAX),
            metadata,
        })
    }

    pub(crate) async fn insert(&self, data: &CreateTask) -> Result<Task, TaskServiceError> {
        let task = Task::create(&self.db.pool, data, Uuid::new_v4()).await?;
        TaskLog::append(&self.db.pool, task.id, LogLevel::Info, "Task submitted").await?;
        info!(
            task_id = %task.id,
            name = %task.name,
            priority = ?task.priority,
            dependencies = task.dependencies.len(),
            "Task created"
        );
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<TaskDetail, TaskServiceError> {
        let task = Task::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(TaskServiceError::NotFound(id))?;
        let logs = TaskLog::find_by_task(&self.db.pool, id).await?;
        let webhook = WebhookJob::find_by_task(&self.db.pool, id).await?;
        let webhook_deliveries = WebhookDelivery::find_by_task(&self.db.pool, id).await?;
        Ok(TaskDetail {
            task,
            logs,
            webhook,
            webhook_deliveries,
        })
    }

    pub async fn list_tasks(&self, mut filter: TaskFilter) -> Result<Vec<Task>, TaskServiceError> {
        filter.limit = filter.limit.map(|l| l.clamp(1, MAX_LIST_LIMIT));
        Ok(Task::find_filtered(&self.db.pool, &filter).await?)
    }

    pub async fn task_logs(&self, id: Uuid) -> Result<Vec<TaskLog>, TaskServiceError> {
        self.ensure_exists(id).await?;
        Ok(TaskLog::find_by_task(&self.db.pool, id).await?)
    }

    pub async fn webhook_history(
        &self,
        id: Uuid,
    ) -> Result<Vec<WebhookDelivery>, TaskServiceError> {
        self.ensure_exists(id).await?;
        Ok(WebhookDelivery::find_by_task(&self.db.pool, id).await?)
    }

    /// Moves a pending or running task to `cancelled`. A running attempt is
    /// left to finish; its result is discarded.
    pub async fn cancel_task(&self, id: Uuid) -> Result<Task, TaskServiceError> {
        let Some(task) = Task::cancel(&self.db.pool, id).await? else {
            return match Task::find_by_id(&self.db.pool, id).await? {
                Some(task) => Err(TaskServiceError::NotCancellable {
                    id,
                    status: task.status,
                }),
                None => Err(TaskServiceError::NotFound(id)),
            };
        };

        TaskLog::append(&self.db.pool, id, LogLevel::Warn, "Task cancelled").await?;
        info!(task_id = %id, "Task cancelled");
        self.processor.on_terminal(id).await?;
        Ok(task.with_dependencies(&self.db.pool).await?)
    }

    /// Puts a failed or cancelled standalone task back in the queue with a
    /// fresh retry budget. Its notification job is dropped so the new
    /// outcome is delivered too.
    pub async fn retry_task(&self, id: Uuid) -> Result<Task, TaskServiceError> {
        let existing = Task::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(TaskServiceError::NotFound(id))?;
        if existing.workflow_id.is_some() {
            return Err(TaskServiceError::InWorkflow(id));
        }

        let mut tx = self.db.pool.begin().await?;
        let Some(task) = Task::reset_for_retry(&mut *tx, id).await? else {
            tx.rollback().await?;
            return Err(TaskServiceError::NotRetryable {
                id,
                status: existing.status,
            });
        };
        WebhookJob::discard(&mut *tx, id).await?;
        tx.commit().await?;

        TaskLog::append(&self.db.pool, id, LogLevel::Info, "Task manually retried").await?;
        info!(task_id = %id, previous = %existing.status, "Task manually retried");
        Ok(task.with_dependencies(&self.db.pool).await?)
    }

    async fn ensure_exists(&self, id: Uuid) -> Result<(), TaskServiceError> {
        if Task::exists(&self.db.pool, id).await? {
            Ok(())
        } else {
            Err(TaskServiceError::NotFound(id))
        }
    }
}

fn validate_webhook_url(url: &str) -> Result<(), TaskServiceError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| TaskServiceError::Validation(format!("invalid webhook_url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(TaskServiceError::Validation(format!(
            "webhook_url scheme '{other}' is not supported"
        ))),
    }
}
