use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    task::{Task, TaskFilter},
    task_log::TaskLog,
    webhook::WebhookDelivery,
};
use deployment::Deployment;
use services::services::tasks::{SubmitTask, TaskDetail};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

pub async fn create_task(
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<SubmitTask>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    tracing::debug!("Submitting task '{}' for executor {}", payload.name, payload.executor);
    let task = deployment.tasks().create_task(payload).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn list_tasks(
    State(deployment): State<DeploymentImpl>,
    Query(filter): Query<TaskFilter>,
) -> Result<ResponseJson<ApiResponse<Vec<Task>>>, ApiError> {
    let tasks = deployment.tasks().list_tasks(filter).await?;
    Ok(ResponseJson(ApiResponse::success(tasks)))
}

pub async fn get_task(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<TaskDetail>>, ApiError> {
    let detail = deployment.tasks().get_task(task_id).await?;
    Ok(ResponseJson(ApiResponse::success(detail)))
}

pub async fn cancel_task(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = deployment.tasks().cancel_task(task_id).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn retry_task(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = deployment.tasks().retry_task(task_id).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn get_task_logs(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<TaskLog>>>, ApiError> {
    let logs = deployment.tasks().task_logs(task_id).await?;
    Ok(ResponseJson(ApiResponse::success(logs)))
}

pub async fn get_webhook_history(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<WebhookDelivery>>>, ApiError> {
    let deliveries = deployment.tasks().webhook_history(task_id).await?;
    Ok(ResponseJson(ApiResponse::success(deliveries)))
}

pub fn router() -> Router<DeploymentImpl> {
    let task_id_router = Router::new()
        .route("/", get(get_task).delete(cancel_task))
        .route("/retry", post(retry_task))
        .route("/logs", get(get_task_logs))
        .route("/webhooks", get(get_webhook_history));

    let inner = Router::new()
        .route("/", get(list_tasks).post(create_task))
        .nest("/{task_id}", task_id_router);

    Router::new().nest("/tasks", inner)
}
