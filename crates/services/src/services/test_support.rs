use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use db::{
    DBService,
    models::{
        task::{CreateTask, Task, TaskPriority, TaskStatus},
        workflow::{CreateWorkflow, Workflow},
        workflow_phase::{CreateWorkflowPhase, WorkflowPhase},
    },
};
use executors::executors::{ExecutionOutput, ExecutionRequest, ExecutorError, TaskExecutor};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use super::result_processor::{ResultProcessor, RetryPolicy};

pub(crate) async fn setup_db() -> (DBService, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = DBService::new_with_path(&dir.path().join("test.sqlite"), 8)
        .await
        .expect("failed to open test database");
    (db, dir)
}

pub(crate) fn instant_retries(db: &DBService) -> ResultProcessor {
    ResultProcessor::new(db.clone(), RetryPolicy::new(Duration::ZERO, Duration::ZERO))
}

pub(crate) fn standalone(name: &str) -> CreateTask {
    CreateTask {
        name: name.to_string(),
        description: None,
        workflow_id: None,
        phase_id: None,
        executor: "test".to_string(),
        instructions: name.to_string(),
        priority: TaskPriority::Normal,
        dependencies: Vec::new(),
        webhook_url: None,
        max_retries: 3,
        timeout_seconds: 30,
        metadata: json!({}),
    }
}

pub(crate) fn workflow_task(workflow_id: Uuid, phase_id: &str, name: &str) -> CreateTask {
    CreateTask {
        workflow_id: Some(workflow_id),
        phase_id: Some(phase_id.to_string()),
        ..standalone(name)
    }
}

/// Inserts a task and moves it to `running`, as a winning claim would.
pub(crate) async fn claim(db: &DBService, data: &CreateTask) -> Task {
    let task = Task::create(&db.pool, data, Uuid::new_v4())
        .await
        .expect("failed to create task");
    assert!(
        Task::try_transition(&db.pool, task.id, TaskStatus::Pending, TaskStatus::Running)
            .await
            .expect("claim failed")
    );
    Task::find_by_id(&db.pool, task.id)
        .await
        .expect("lookup failed")
        .expect("task vanished")
}

/// Creates a workflow with the given phases, lets `tasks` build its tasks
/// and starts it.
pub(crate) async fn start_workflow_with_phases<F>(
    db: &DBService,
    phases: &[(&str, &[&str])],
    tasks: F,
) -> Uuid
where
    F: FnOnce(Uuid) -> Vec<CreateTask>,
{
    let workflow = Workflow::create(
        &db.pool,
        &CreateWorkflow {
            name: "pipeline".to_string(),
            description: None,
        },
        Uuid::new_v4(),
    )
    .await
    .expect("failed to create workflow");

    for (phase_id, depends_on) in phases {
        WorkflowPhase::create(
            &db.pool,
            workflow.id,
            &CreateWorkflowPhase {
                phase_id: phase_id.to_string(),
                name: phase_id.to_string(),
                depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            },
        )
        .await
        .expect("failed to create phase");
    }
    for data in tasks(workflow.id) {
        Task::create(&db.pool, &data, Uuid::new_v4())
            .await
            .expect("failed to create task");
    }
    assert!(Workflow::try_start(&db.pool, workflow.id).await.unwrap());
    workflow.id
}

pub(crate) async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

/// Echoes the instructions back, counting calls.
#[derive(Default)]
pub(crate) struct EchoExecutor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionOutput {
            output: request.instructions,
        })
    }
}

#[derive(Default)]
pub(crate) struct FailingExecutor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for FailingExecutor {
    async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionOutput, ExecutorError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(ExecutorError::Other(format!("failure #{n}")))
    }
}

/// Sleeps for `delay` before echoing.
pub(crate) struct SlowExecutor {
    pub delay: Duration,
}

#[async_trait]
impl TaskExecutor for SlowExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutorError> {
        tokio::time::sleep(self.delay).await;
        Ok(ExecutionOutput {
            output: request.instructions,
        })
    }
}
