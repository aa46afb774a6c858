//! The boundary between the engine and whatever actually performs a task.
//!
//! The engine never interprets `instructions`; it hands them, together with
//! the executor identity, to a [`TaskExecutor`] and records what comes back.

pub mod command;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use command::CommandExecutor;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid executor command: {0}")]
    InvalidCommand(String),
    #[error("Executor exited with status {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("Execution failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: Uuid,
    pub executor: String,
    pub instructions: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub output: String,
}

/// Runs one task attempt. Implementations must be safe to drop mid-flight:
/// a timed-out attempt is cancelled by dropping its future.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutorError>;
}
