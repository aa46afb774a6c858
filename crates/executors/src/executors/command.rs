use std::process::Stdio;

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, process::Command};

use super::{ExecutionOutput, ExecutionRequest, ExecutorError, TaskExecutor};

pub const TASK_ID_ENV: &str = "CONDUCTOR_TASK_ID";
pub const EXECUTOR_ENV: &str = "CONDUCTOR_EXECUTOR";
const STDERR_LIMIT: usize = 2000;

/// Spawns a configured program per attempt.
///
/// Instructions are written to stdin, the executor identity and task id are
/// exported as environment variables, and stdout becomes the task result. A
/// non-zero exit is a failure. The child is killed if the attempt is dropped.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(command: &str) -> Result<Self, ExecutorError> {
        let mut argv = shlex::split(command)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| ExecutorError::InvalidCommand(command.to_string()))?;
        let program = argv.remove(0);
        Ok(Self {
            program,
            args: argv,
        })
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env(TASK_ID_ENV, request.task_id.to_string())
            .env(EXECUTOR_ENV, &request.executor)
            .spawn()?;

        // Feed stdin while stdout is drained, or a child that echoes more
        // than a pipe buffer of input blocks forever.
        let stdin = child.stdin.take();
        let input = request.instructions.as_bytes();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(input).await {
                // The program may exit without reading its input.
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        fed?;
        if output.status.success() {
            return Ok(ExecutionOutput {
                output: String::from_utf8_lossy(&output.stdout).into_owned(),
            });
        }

        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.len() > STDERR_LIMIT {
            let mut cut = STDERR_LIMIT;
            while !stderr.is_char_boundary(cut) {
                cut -= 1;
            }
            stderr.truncate(cut);
            stderr.push_str("...[truncated]");
        }
        tracing::debug!(
            task_id = %request.task_id,
            exit_code = ?output.status.code(),
            "Executor command failed"
        );
        Err(ExecutorError::Failed {
            exit_code: output.status.code(),
            stderr,
        })
    }
}
