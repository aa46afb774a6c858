use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use super::{
    task::{CreateTask, TaskPriority},
    workflow::{CreateWorkflow, Workflow},
    workflow_phase::{CreateWorkflowPhase, WorkflowPhase},
};
use crate::DBService;

/// Fresh file-backed database with migrations applied. Keep the `TempDir`
/// alive for the duration of the test.
pub(crate) async fn setup_test_db() -> (DBService, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = DBService::new_with_path(&dir.path().join("test.sqlite"), 8)
        .await
        .expect("failed to open test database");
    (db, dir)
}

pub(crate) fn standalone_task(name: &str) -> CreateTask {
    CreateTask {
        name: name.to_string(),
        description: None,
        workflow_id: None,
        phase_id: None,
        executor: "echo".to_string(),
        instructions: format!("run {name}"),
        priority: TaskPriority::Normal,
        dependencies: Vec::new(),
        webhook_url: None,
        max_retries: 3,
        timeout_seconds: 30,
        metadata: json!({}),
    }
}

pub(crate) async fn workflow_with_phases(
    db: &DBService,
    phases: &[(&str, &[&str])],
) -> Workflow {
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
                name: phase_id.to_uppercase(),
                depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            },
        )
        .await
        .expect("failed to create phase");
    }

    workflow
}
