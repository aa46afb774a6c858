use axum::{
    http::StatusCode,
    response::{IntoResponse, Json as ResponseJson, Response},
};
use db::models::workflow_phase::WorkflowPhaseError;
use deployment::DeploymentError;
use services::services::{tasks::TaskServiceError, workflow::WorkflowServiceError};
use sqlx::Error as SqlxError;
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Task(#[from] TaskServiceError),
    #[error(transparent)]
    Workflow(#[from] WorkflowServiceError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Database(#[from] SqlxError),
}

fn task_error_status(err: &TaskServiceError) -> (StatusCode, &'static str) {
    match err {
        TaskServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "TaskNotFound"),
        TaskServiceError::Validation(_)
        | TaskServiceError::UnknownDependency(_)
        | TaskServiceError::NotCancellable { .. }
        | TaskServiceError::NotRetryable { .. }
        | TaskServiceError::InWorkflow(_) => (StatusCode::BAD_REQUEST, "TaskError"),
        TaskServiceError::Database(_) | TaskServiceError::Results(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "TaskError")
        }
    }
}

fn workflow_error_status(err: &WorkflowServiceError) -> (StatusCode, &'static str) {
    match err {
        WorkflowServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "WorkflowNotFound"),
        WorkflowServiceError::Task(inner) => task_error_status(inner),
        WorkflowServiceError::Phase(WorkflowPhaseError::Duplicate(_))
        | WorkflowServiceError::Graph(_)
        | WorkflowServiceError::PhaseNotFound(_)
        | WorkflowServiceError::InvalidState { .. }
        | WorkflowServiceError::Validation(_) => (StatusCode::BAD_REQUEST, "WorkflowError"),
        WorkflowServiceError::Phase(WorkflowPhaseError::Database(_))
        | WorkflowServiceError::Database(_)
        | WorkflowServiceError::Results(_) => (StatusCode::INTERNAL_SERVER_ERROR, "WorkflowError"),
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Task(err) => task_error_status(err),
            ApiError::Workflow(err) => workflow_error_status(err),
            ApiError::Deployment(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DeploymentError"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = self.status();

        let error_message = if status_code.is_server_error() {
            tracing::error!(error_type, "Request failed: {}", self);
            format!("{}: {}", error_type, self)
        } else {
            self.to_string()
        };

        let response = ApiResponse::<()>::error(&error_message);
        (status_code, ResponseJson(response)).into_response()
    }
}
