use axum::{
    Json, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    task::Task,
    workflow::{CreateWorkflow, Workflow},
    workflow_phase::{CreateWorkflowPhase, WorkflowPhase},
};
use deployment::Deployment;
use services::services::workflow::{AddWorkflowTask, WorkflowStatusReport};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

pub async fn create_workflow(
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<CreateWorkflow>,
) -> Result<ResponseJson<ApiResponse<Workflow>>, ApiError> {
    let workflow = deployment.workflows().create_workflow(payload).await?;
    Ok(ResponseJson(ApiResponse::success(workflow)))
}

pub async fn get_workflow(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Workflow>>, ApiError> {
    let workflow = deployment.workflows().get_workflow(workflow_id).await?;
    Ok(ResponseJson(ApiResponse::success(workflow)))
}

pub async fn add_phase(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<Uuid>,
    Json(payload): Json<CreateWorkflowPhase>,
) -> Result<ResponseJson<ApiResponse<WorkflowPhase>>, ApiError> {
    let phase = deployment
        .workflows()
        .add_phase(workflow_id, payload)
        .await?;
    Ok(ResponseJson(ApiResponse::success(phase)))
}

pub async fn add_task(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<Uuid>,
    Json(payload): Json<AddWorkflowTask>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = deployment.workflows().add_task(workflow_id, payload).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn list_workflow_tasks(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<Task>>>, ApiError> {
    let tasks = deployment
        .workflows()
        .list_workflow_tasks(workflow_id)
        .await?;
    Ok(ResponseJson(ApiResponse::success(tasks)))
}

pub async fn start_workflow(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Workflow>>, ApiError> {
    let workflow = deployment.workflows().start_workflow(workflow_id).await?;
    Ok(ResponseJson(ApiResponse::success(workflow)))
}

pub async fn get_workflow_status(
    State(deployment): State<DeploymentImpl>,
    Path(workflow_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<WorkflowStatusReport>>, ApiError> {
    let report = deployment
        .workflows()
        .get_workflow_status(workflow_id)
        .await?;
    Ok(ResponseJson(ApiResponse::success(report)))
}

pub fn router() -> Router<DeploymentImpl> {
    let workflow_id_router = Router::new()
        .route("/", get(get_workflow))
        .route("/phases", post(add_phase))
        .route("/tasks", get(list_workflow_tasks).post(add_task))
        .route("/start", post(start_workflow))
        .route("/status", get(get_workflow_status));

    let inner = Router::new()
        .route("/", post(create_workflow))
        .nest("/{workflow_id}", workflow_id_router);

    Router::new().nest("/workflows", inner)
}
