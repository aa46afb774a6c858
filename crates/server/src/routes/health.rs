use axum::{extract::State, response::Json as ResponseJson};
use deployment::Deployment;
use serde::Serialize;
use utils::response::ApiResponse;

use crate::{DeploymentImpl, error::ApiError};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub workers: usize,
    pub idle_workers: usize,
}

/// Answers once the store is reachable.
pub async fn health_check(
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<HealthStatus>>, ApiError> {
    sqlx::query("SELECT 1").execute(&deployment.db().pool).await?;
    let workers = deployment.workers();
    Ok(ResponseJson(ApiResponse::success(HealthStatus {
        status: "ok",
        workers: workers.size(),
        idle_workers: workers.available(),
    })))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use crate::routes::test_support::{send, test_app};

    #[tokio::test]
    async fn reports_worker_capacity() {
        let (app, _deployment, _dir) = test_app().await;
        let (status, body) = send(&app, Method::GET, "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["workers"], 2);
        assert_eq!(body["data"]["idle_workers"], 2);
    }
}
