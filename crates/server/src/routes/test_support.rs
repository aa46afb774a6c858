use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use db::DBService;
use executors::executors::{ExecutionOutput, ExecutionRequest, ExecutorError, TaskExecutor};
use serde_json::Value;
use services::services::config::Config;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::{DeploymentImpl, routes};

struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutorError> {
        Ok(ExecutionOutput {
            output: request.instructions,
        })
    }
}

/// App over a fresh store. Background loops are not started, so submitted
/// tasks stay where the test puts them.
pub(crate) async fn test_app() -> (Router, DeploymentImpl, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = DBService::new_with_path(&dir.path().join("conductor.sqlite"), 4)
        .await
        .unwrap();
    let config = Config {
        workers: 2,
        ..Config::default()
    };
    let deployment = DeploymentImpl::from_parts(config, db, Arc::new(EchoExecutor)).unwrap();
    (routes::app(deployment.clone()), deployment, dir)
}

pub(crate) async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}
