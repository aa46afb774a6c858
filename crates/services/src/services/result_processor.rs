use std::{collections::BTreeSet, time::Duration};

use backon::{BackoffBuilder, ExponentialBuilder};
use db::{
    DBService,
    models::{
        task::{Task, TaskProgress, TaskStatus},
        task_log::{LogLevel, TaskLog},
        webhook::WebhookJob,
        workflow::{Workflow, WorkflowStatus},
        workflow_phase::{PhaseStatus, WorkflowPhase},
    },
};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::RetrySettings;

#[derive(Debug, Error)]
pub enum ResultProcessorError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// What a worker observed for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded(String),
    Failed(String),
    TimedOut(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Requeued { retry: i64, delay: Duration },
    Failed,
    /// The task left `running` (cancelled) before the outcome arrived.
    Discarded,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    min_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
        }
    }

    /// Delay before retry number `retry_count + 1`.
    pub fn backoff(&self, retry_count: i64) -> Duration {
        let steps = usize::try_from(retry_count.max(0)).unwrap_or(usize::MAX - 1) + 1;
        ExponentialBuilder::default()
            .with_min_delay(self.min_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(steps)
            .build()
            .last()
            .unwrap_or(self.min_backoff)
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            Duration::from_millis(settings.min_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
        )
    }
}

/// Phase status from its tasks. Any failed or cancelled task fails the
/// phase. A phase without tasks completes once its prerequisites have.
pub fn derive_phase_status(tasks: &[TaskProgress], prerequisites_done: bool) -> PhaseStatus {
    if tasks
        .iter()
        .any(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
    {
        return PhaseStatus::Failed;
    }
    if tasks.is_empty() {
        return if prerequisites_done {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Pending
        };
    }
    if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
        return PhaseStatus::Completed;
    }
    if tasks
        .iter()
        .any(|t| t.started || t.status != TaskStatus::Pending)
    {
        return PhaseStatus::Running;
    }
    PhaseStatus::Pending
}

/// Terminal workflow statuses never change; a workflow that was never
/// started stays `created`.
pub fn derive_workflow_status(current: WorkflowStatus, phases: &[PhaseStatus]) -> WorkflowStatus {
    if current != WorkflowStatus::Running {
        return current;
    }
    if phases.contains(&PhaseStatus::Failed) {
        WorkflowStatus::Failed
    } else if phases.iter().all(|p| *p == PhaseStatus::Completed) {
        WorkflowStatus::Completed
    } else {
        WorkflowStatus::Running
    }
}

pub fn webhook_payload(task: &Task) -> Value {
    json!({
        "task_id": task.id,
        "task_name": task.name,
        "status": task.status,
        "result": task.result,
        "error": task.error,
        "completed_at": task.completed_at,
        "metadata": task.metadata.0,
    })
}

/// Records attempt outcomes and keeps phase and workflow status in step
/// with their tasks.
#[derive(Clone)]
pub struct ResultProcessor {
    db: DBService,
    retry: RetryPolicy,
}

impl ResultProcessor {
    pub fn new(db: DBService, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    pub async fn handle_outcome(
        &self,
        task: &Task,
        outcome: ExecutionOutcome,
    ) -> Result<Disposition, ResultProcessorError> {
        let pool = &self.db.pool;
        let attempt = task.retry_count + 1;

        let message = match outcome {
            ExecutionOutcome::Succeeded(output) => return self.record_success(task, &output).await,
            ExecutionOutcome::Failed(message) => message,
            ExecutionOutcome::TimedOut(after) => {
                format!("Timed out after {}s", after.as_secs_f64())
            }
        };

        if task.retry_count < task.max_retries {
            let delay = self.retry.backoff(task.retry_count);
            if !Task::requeue_running(pool, task.id, &message, delay).await? {
                info!(task_id = %task.id, "Discarding failure of task no longer running");
                return Ok(Disposition::Discarded);
            }
            TaskLog::append(
                pool,
                task.id,
                LogLevel::Warn,
                &format!(
                    "Attempt {attempt} failed: {message}; retrying in {:.1}s",
                    delay.as_secs_f64()
                ),
            )
            .await?;
            warn!(
                task_id = %task.id,
                attempt,
                max_retries = task.max_retries,
                "Task attempt failed, requeued: {}",
                message
            );
            return Ok(Disposition::Requeued {
                retry: attempt,
                delay,
            });
        }

        if !Task::fail_running(pool, task.id, &message).await? {
            info!(task_id = %task.id, "Discarding failure of task no longer running");
            return Ok(Disposition::Discarded);
        }
        TaskLog::append(
            pool,
            task.id,
            LogLevel::Error,
            &format!("Attempt {attempt} failed: {message}; no retries left"),
        )
        .await?;
        warn!(task_id = %task.id, attempt, "Task failed permanently: {}", message);
        self.on_terminal(task.id).await?;
        Ok(Disposition::Failed)
    }

    async fn record_success(
        &self,
        task: &Task,
        output: &str,
    ) -> Result<Disposition, ResultProcessorError> {
        if !Task::complete_running(&self.db.pool, task.id, output).await? {
            info!(task_id = %task.id, "Discarding result of task no longer running");
            return Ok(Disposition::Discarded);
        }
        let attempt = task.retry_count + 1;
        TaskLog::append(
            &self.db.pool,
            task.id,
            LogLevel::Info,
            &format!("Attempt {attempt} completed"),
        )
        .await?;
        info!(task_id = %task.id, attempt, "Task completed");
        self.on_terminal(task.id).await?;
        Ok(Disposition::Completed)
    }

    /// Fails a pending task whose dependencies can never be satisfied.
    /// Never retried.
    pub async fn fail_unrunnable(
        &self,
        task: &Task,
        reason: &str,
    ) -> Result<bool, ResultProcessorError> {
        let message = format!("Configuration error: {reason}");
        if !Task::fail_pending(&self.db.pool, task.id, &message).await? {
            return Ok(false);
        }
        TaskLog::append(&self.db.pool, task.id, LogLevel::Error, &message).await?;
        warn!(task_id = %task.id, "Task cannot run: {}", reason);
        self.on_terminal(task.id).await?;
        Ok(true)
    }

    /// Treats a task left `running` by a previous process as a failed
    /// attempt.
    pub async fn recover_orphan(&self, task: &Task) -> Result<Disposition, ResultProcessorError> {
        self.handle_outcome(
            task,
            ExecutionOutcome::Failed("Interrupted by engine restart".to_string()),
        )
        .await
    }

    /// Follow-up for a task that just reached a terminal status: queue its
    /// webhook and cascade status to its phase and workflow.
    pub async fn on_terminal(&self, task_id: Uuid) -> Result<(), ResultProcessorError> {
        let Some(task) = Task::find_by_id(&self.db.pool, task_id).await? else {
            return Ok(());
        };
        self.enqueue_webhook(&task).await?;
        if let Some(workflow_id) = task.workflow_id {
            self.recompute_workflow(workflow_id).await?;
        }
        Ok(())
    }

    async fn enqueue_webhook(&self, task: &Task) -> Result<(), ResultProcessorError> {
        if let Some(url) = task.webhook_url.as_deref() {
            let payload = webhook_payload(task);
            if WebhookJob::enqueue(&self.db.pool, task.id, url, &payload).await? {
                debug!(task_id = %task.id, url, "Webhook queued");
            }
        }
        Ok(())
    }

    /// Recomputes one phase. Returns the derived status and whether it was
    /// written.
    pub async fn recompute_phase(
        &self,
        workflow_id: Uuid,
        phase_id: &str,
    ) -> Result<(PhaseStatus, bool), ResultProcessorError> {
        // Derive and write under one write lock so a slower recompute cannot
        // overwrite a newer status with one derived from older progress.
        let mut tx = self.db.pool.begin().await?;
        WorkflowPhase::lock(&mut *tx, workflow_id, phase_id).await?;
        let progress = Task::phase_progress(&mut *tx, workflow_id, phase_id).await?;
        let prerequisites_done =
            WorkflowPhase::prerequisite_states(&mut *tx, workflow_id, phase_id)
                .await?
                .iter()
                .all(|p| p.status == Some(PhaseStatus::Completed));

        let status = derive_phase_status(&progress, prerequisites_done);
        let changed = WorkflowPhase::update_status(&mut *tx, workflow_id, phase_id, status).await?;
        tx.commit().await?;
        if changed {
            info!(%workflow_id, phase_id, %status, "Phase status changed");
        }
        Ok((status, changed))
    }

    /// Recomputes every phase until nothing changes, then the workflow.
    /// Safe to call any number of times.
    pub async fn recompute_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowStatus>, ResultProcessorError> {
        let pool = &self.db.pool;
        let Some(workflow) = Workflow::find_by_id(pool, workflow_id).await? else {
            return Ok(None);
        };
        if workflow.status == WorkflowStatus::Created {
            return Ok(Some(workflow.status));
        }

        let phases = WorkflowPhase::find_by_workflow(pool, workflow_id).await?;
        let mut statuses = Vec::with_capacity(phases.len());
        // Each pass can complete at least one more empty phase, so the loop
        // is bounded by the phase count.
        for _ in 0..=phases.len() {
            statuses.clear();
            let mut changed_any = false;
            for phase in &phases {
                let (status, changed) = self.recompute_phase(workflow_id, &phase.phase_id).await?;
                statuses.push(status);
                changed_any |= changed;
            }
            if !changed_any {
                break;
            }
        }

        let derived = derive_workflow_status(workflow.status, &statuses);
        if derived != workflow.status && Workflow::update_status(pool, workflow_id, derived).await?
        {
            info!(%workflow_id, status = %derived, "Workflow status changed");
            if derived == WorkflowStatus::Failed {
                self.cancel_remaining(workflow_id).await?;
            }
        }
        Ok(Some(derived))
    }

    /// Fail-fast: once a workflow fails, nothing else in it is started.
    async fn cancel_remaining(&self, workflow_id: Uuid) -> Result<(), ResultProcessorError> {
        let pool = &self.db.pool;
        let cancelled =
            Task::cancel_pending_in_workflow(pool, workflow_id, "Workflow failed").await?;
        if cancelled.is_empty() {
            return Ok(());
        }

        let mut phases = BTreeSet::new();
        for task in &cancelled {
            TaskLog::append(
                pool,
                task.id,
                LogLevel::Warn,
                "Cancelled because the workflow failed",
            )
            .await?;
            self.enqueue_webhook(task).await?;
            if let Some(phase_id) = &task.phase_id {
                phases.insert(phase_id.clone());
            }
        }
        for phase_id in phases {
            self.recompute_phase(workflow_id, &phase_id).await?;
        }
        info!(%workflow_id, count = cancelled.len(), "Cancelled pending tasks of failed workflow");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use db::models::{task::TaskStatus, webhook::WebhookJob};

    use super::*;
    use crate::services::test_support::{
        claim, instant_retries, setup_db, standalone, start_workflow_with_phases,
        workflow_task,
    };

    fn progress(statuses: &[(TaskStatus, bool)]) -> Vec<TaskProgress> {
        statuses
            .iter()
            .map(|(status, started)| TaskProgress {
                status: *status,
                started: *started,
            })
            .collect()
    }

    #[test]
    fn phase_status_rules() {
        use TaskStatus::*;
        assert_eq!(derive_phase_status(&[], true), PhaseStatus::Completed);
        assert_eq!(derive_phase_status(&[], false), PhaseStatus::Pending);
        assert_eq!(
            derive_phase_status(&progress(&[(Pending, false), (Pending, false)]), true),
            PhaseStatus::Pending
        );
        assert_eq!(
            derive_phase_status(&progress(&[(Completed, true), (Pending, false)]), true),
            PhaseStatus::Running
        );
        assert_eq!(
            derive_phase_status(&progress(&[(Pending, true)]), true),
            PhaseStatus::Running
        );
        assert_eq!(
            derive_phase_status(&progress(&[(Completed, true), (Completed, true)]), true),
            PhaseStatus::Completed
        );
        assert_eq!(
            derive_phase_status(&progress(&[(Completed, true), (Cancelled, false)]), true),
            PhaseStatus::Failed
        );
        assert_eq!(
            derive_phase_status(&progress(&[(Running, true), (Failed, true)]), true),
            PhaseStatus::Failed
        );
    }

    #[test]
    fn workflow_status_rules() {
        use PhaseStatus::*;
        assert_eq!(
            derive_workflow_status(WorkflowStatus::Running, &[Completed, Completed]),
            WorkflowStatus::Completed
        );
        assert_eq!(
            derive_workflow_status(WorkflowStatus::Running, &[Completed, Running]),
            WorkflowStatus::Running
        );
        assert_eq!(
            derive_workflow_status(WorkflowStatus::Running, &[Failed, Running]),
            WorkflowStatus::Failed
        );
        assert_eq!(
            derive_workflow_status(WorkflowStatus::Created, &[Completed]),
            WorkflowStatus::Created
        );
        assert_eq!(
            derive_workflow_status(WorkflowStatus::Completed, &[Failed]),
            WorkflowStatus::Completed
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(10), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn success_completes_and_queues_webhook() {
        let (db, _dir) = setup_db().await;
        let processor = instant_retries(&db);
        let mut data = standalone("hooked");
        data.webhook_url = Some("http://127.0.0.1:1/hook".to_string());
        let task = claim(&db, &data).await;

        let disposition = processor
            .handle_outcome(&task, ExecutionOutcome::Succeeded("42".to_string()))
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Completed);

        let stored = Task::find_by_id(&db.pool, task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result.as_deref(), Some("42"));

        let job = WebhookJob::find_by_task(&db.pool, task.id).await.unwrap().unwrap();
        assert_eq!(job.payload.0["status"], "completed");
        assert_eq!(job.payload.0["result"], "42");
        assert_eq!(job.payload.0["task_name"], "hooked");
    }

    #[tokio::test]
    async fn failure_requeues_until_budget_is_spent() {
        let (db, _dir) = setup_db().await;
        let processor = instant_retries(&db);
        let mut data = standalone("flaky");
        data.max_retries = 1;
        let task = claim(&db, &data).await;

        let first = processor
            .handle_outcome(&task, ExecutionOutcome::Failed("boom".to_string()))
            .await
            .unwrap();
        assert!(matches!(first, Disposition::Requeued { retry: 1, .. }));

        let requeued = Task::find_by_id(&db.pool, task.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert!(Task::try_transition(&db.pool, task.id, TaskStatus::Pending, TaskStatus::Running)
            .await
            .unwrap());

        let second = processor
            .handle_outcome(&requeued, ExecutionOutcome::TimedOut(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(second, Disposition::Failed);

        let failed = Task::find_by_id(&db.pool, task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.error.unwrap().contains("Timed out"));
        assert!(failed.completed_at.unwrap() >= failed.started_at.unwrap());
    }

    #[tokio::test]
    async fn late_result_after_cancel_is_discarded() {
        let (db, _dir) = setup_db().await;
        let processor = instant_retries(&db);
        let task = claim(&db, &standalone("cancel-me")).await;
        Task::cancel(&db.pool, task.id).await.unwrap().unwrap();

        let disposition = processor
            .handle_outcome(&task, ExecutionOutcome::Succeeded("late".to_string()))
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Discarded);

        let stored = Task::find_by_id(&db.pool, task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(stored.result.is_none());
    }

    #[tokio::test]
    async fn recompute_is_idempotent() {
        let (db, _dir) = setup_db().await;
        let processor = instant_retries(&db);
        let workflow = start_workflow_with_phases(&db, &[("a", &[]), ("b", &["a"])], |wf| {
            vec![workflow_task(wf, "a", "a1")]
        })
        .await;

        let a1 = Task::find_by_workflow(&db.pool, workflow).await.unwrap().remove(0);
        Task::try_transition(&db.pool, a1.id, TaskStatus::Pending, TaskStatus::Running)
            .await
            .unwrap();
        Task::complete_running(&db.pool, a1.id, "ok").await.unwrap();

        let first = processor.recompute_workflow(workflow).await.unwrap();
        let phases_after_first = WorkflowPhase::find_by_workflow(&db.pool, workflow)
            .await
            .unwrap();
        let wf_after_first = Workflow::find_by_id(&db.pool, workflow).await.unwrap().unwrap();

        let second = processor.recompute_workflow(workflow).await.unwrap();
        let phases_after_second = WorkflowPhase::find_by_workflow(&db.pool, workflow)
            .await
            .unwrap();
        let wf_after_second = Workflow::find_by_id(&db.pool, workflow).await.unwrap().unwrap();

        assert_eq!(first, Some(WorkflowStatus::Completed));
        assert_eq!(first, second);
        for (a, b) in phases_after_first.iter().zip(&phases_after_second) {
            assert_eq!(a.status, PhaseStatus::Completed);
            assert_eq!(a.status, b.status);
            assert_eq!(a.updated_at, b.updated_at);
            assert_eq!(a.completed_at, b.completed_at);
        }
        assert_eq!(wf_after_first.completed_at, wf_after_second.completed_at);
        assert_eq!(wf_after_first.updated_at, wf_after_second.updated_at);
    }

    #[tokio::test]
    async fn concurrent_phase_recomputes_agree() {
        let (db, _dir) = setup_db().await;
        let processor = instant_retries(&db);
        let workflow = start_workflow_with_phases(&db, &[("a", &[])], |wf| {
            vec![workflow_task(wf, "a", "a1")]
        })
        .await;

        let a1 = Task::find_by_workflow(&db.pool, workflow).await.unwrap().remove(0);
        Task::try_transition(&db.pool, a1.id, TaskStatus::Pending, TaskStatus::Running)
            .await
            .unwrap();
        Task::complete_running(&db.pool, a1.id, "ok").await.unwrap();

        let results = futures::future::join_all(
            (0..16).map(|_| processor.recompute_phase(workflow, "a")),
        )
        .await;

        let mut writes = 0;
        for result in results {
            let (status, changed) = result.unwrap();
            assert_eq!(status, PhaseStatus::Completed);
            writes += usize::from(changed);
        }
        assert_eq!(writes, 1);

        let phase = WorkflowPhase::find(&db.pool, workflow, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(phase.status, PhaseStatus::Completed);
        assert!(phase.completed_at.is_some());
    }

    #[tokio::test]
    async fn failed_phase_fails_workflow_and_cancels_the_rest() {
        let (db, _dir) = setup_db().await;
        let processor = instant_retries(&db);
        let workflow = start_workflow_with_phases(&db, &[("a", &[]), ("b", &["a"])], |wf| {
            let mut a1 = workflow_task(wf, "a", "a1");
            a1.max_retries = 0;
            vec![a1, workflow_task(wf, "b", "b1")]
        })
        .await;

        let tasks = Task::find_by_workflow(&db.pool, workflow).await.unwrap();
        let a1 = tasks.iter().find(|t| t.name == "a1").unwrap().clone();
        Task::try_transition(&db.pool, a1.id, TaskStatus::Pending, TaskStatus::Running)
            .await
            .unwrap();
        processor
            .handle_outcome(&a1, ExecutionOutcome::Failed("bad".to_string()))
            .await
            .unwrap();

        let wf = Workflow::find_by_id(&db.pool, workflow).await.unwrap().unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        let b1 = Task::find_by_workflow(&db.pool, workflow)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.name == "b1")
            .unwrap();
        assert_eq!(b1.status, TaskStatus::Cancelled);
        assert!(b1.completed_at.is_none());
    }
}
