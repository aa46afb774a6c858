//! Poll loop that moves ready tasks onto workers.
//!
//! Any number of schedulers may share one store. The only thing that decides
//! who runs a task is the `pending -> running` compare-and-swap, so a task is
//! dispatched at most once per attempt no matter how many loops see it.

use std::time::Duration;

use db::{
    DBService,
    models::task::{Task, TaskStatus},
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    dependency::{DependencyResolver, Readiness, ReadinessSnapshot},
    result_processor::{ResultProcessor, ResultProcessorError},
    worker_pool::WorkerPool,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Results(#[from] ResultProcessorError),
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub lost_races: usize,
    pub unrunnable: usize,
    /// Parked attempt outcomes written this cycle.
    pub recorded: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    db: DBService,
    workers: WorkerPool,
    processor: ResultProcessor,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        db: DBService,
        workers: WorkerPool,
        processor: ResultProcessor,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            workers,
            processor,
            poll_interval,
        }
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        let mut report = CycleReport {
            recorded: self.workers.retry_unrecorded().await,
            unrunnable: self.sweep_unrunnable().await?,
            ..CycleReport::default()
        };

        let free = self.workers.available();
        if free == 0 {
            return Ok(report);
        }

        let candidates = Task::find_ready(&self.db.pool, free as i64).await?;
        for mut task in candidates {
            let snapshot = ReadinessSnapshot::load(&self.db.pool, &task).await?;
            match DependencyResolver::readiness(&task, &snapshot) {
                Readiness::Ready => {}
                Readiness::Invalid(reason) => {
                    if self
                        .processor
                        .fail_unrunnable(&task, &reason.to_string())
                        .await?
                    {
                        report.unrunnable += 1;
                    }
                    continue;
                }
                Readiness::Waiting(blockers) => {
                    debug!(task_id = %task.id, ?blockers, "Task no longer ready");
                    continue;
                }
            }

            let Some(slot) = self.workers.try_reserve() else {
                break;
            };
            if !Task::try_transition(
                &self.db.pool,
                task.id,
                TaskStatus::Pending,
                TaskStatus::Running,
            )
            .await?
            {
                debug!(task_id = %task.id, "Lost claim to another scheduler");
                report.lost_races += 1;
                continue;
            }

            task.status = TaskStatus::Running;
            let workflow_id = task.workflow_id;
            info!(task_id = %task.id, name = %task.name, priority = ?task.priority, "Claimed task");
            self.workers.dispatch(slot, task);
            report.claimed += 1;

            if let Some(workflow_id) = workflow_id
                && let Err(e) = self.processor.recompute_workflow(workflow_id).await
            {
                warn!(%workflow_id, "Failed to update workflow after claim: {}", e);
            }
        }

        Ok(report)
    }

    /// Fails pending tasks whose dependencies are missing or ended without
    /// completing. Nothing else would ever move them.
    async fn sweep_unrunnable(&self) -> Result<usize, SchedulerError> {
        let mut failed = 0;
        for task in Task::find_pending_with_broken_dependencies(&self.db.pool).await? {
            let snapshot = ReadinessSnapshot::load(&self.db.pool, &task).await?;
            if let Readiness::Invalid(reason) = DependencyResolver::readiness(&task, &snapshot)
                && self
                    .processor
                    .fail_unrunnable(&task, &reason.to_string())
                    .await?
            {
                failed += 1;
            }
        }
        Ok(failed)
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!(
                "[SCHEDULER] Started - {} workers, polling every {}ms",
                scheduler.workers.size(),
                scheduler.poll_interval.as_millis()
            );
            loop {
                match scheduler.run_cycle().await {
                    Ok(report) if report != CycleReport::default() => {
                        debug!(
                            claimed = report.claimed,
                            lost_races = report.lost_races,
                            unrunnable = report.unrunnable,
                            recorded = report.recorded,
                            "[SCHEDULER] Cycle finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("[SCHEDULER] Cycle failed: {}", e),
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(scheduler.poll_interval) => {}
                }
            }
            info!("[SCHEDULER] Stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, atomic::Ordering};

    use db::models::{
        task::CreateTask,
        task_log::TaskLog,
        workflow::{Workflow, WorkflowStatus},
    };
    use executors::executors::TaskExecutor;
    use uuid::Uuid;

    use super::*;
    use crate::services::test_support::{
        EchoExecutor, FailingExecutor, SlowExecutor, instant_retries, setup_db, standalone,
        start_workflow_with_phases, wait_for, workflow_task,
    };

    fn scheduler_with(
        db: &DBService,
        size: usize,
        executor: Arc<dyn TaskExecutor>,
    ) -> Scheduler {
        let processor = instant_retries(db);
        let workers = WorkerPool::new(size, executor, processor.clone(), db.clone());
        Scheduler::new(db.clone(), workers, processor, Duration::from_millis(10))
    }

    async fn create(db: &DBService, data: &CreateTask) -> Task {
        Task::create(&db.pool, data, Uuid::new_v4()).await.unwrap()
    }

    async fn status_of(db: &DBService, id: Uuid) -> TaskStatus {
        Task::find_by_id(&db.pool, id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn competing_schedulers_run_each_task_once() {
        let (db, _dir) = setup_db().await;
        let executor = Arc::new(EchoExecutor::default());
        let first = scheduler_with(&db, 3, executor.clone());
        let second = scheduler_with(&db, 3, executor.clone());

        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(create(&db, &standalone(&format!("job-{i}"))).await.id);
        }

        let shutdown = CancellationToken::new();
        let handles = [first.spawn(shutdown.clone()), second.spawn(shutdown.clone())];
        wait_for(|| {
            let db = db.clone();
            async move {
                Task::find_by_status(&db.pool, TaskStatus::Completed)
                    .await
                    .unwrap()
                    .len()
                    == 20
            }
        })
        .await;
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        first.workers().shutdown().await;
        second.workers().shutdown().await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 20);
        for id in ids {
            let starts = TaskLog::find_by_task(&db.pool, id)
                .await
                .unwrap()
                .into_iter()
                .filter(|log| log.message.ends_with("started"))
                .count();
            assert_eq!(starts, 1);
        }
    }

    #[tokio::test]
    async fn claims_no_more_than_free_workers() {
        let (db, _dir) = setup_db().await;
        let scheduler = scheduler_with(
            &db,
            2,
            Arc::new(SlowExecutor {
                delay: Duration::from_millis(300),
            }),
        );
        for i in 0..5 {
            create(&db, &standalone(&format!("job-{i}"))).await;
        }

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(Task::find_by_status(&db.pool, TaskStatus::Running).await.unwrap().len(), 2);

        let again = scheduler.run_cycle().await.unwrap();
        assert_eq!(again.claimed, 0);
        scheduler.workers().shutdown().await;
    }

    #[tokio::test]
    async fn missing_dependency_fails_without_running() {
        let (db, _dir) = setup_db().await;
        let executor = Arc::new(EchoExecutor::default());
        let scheduler = scheduler_with(&db, 2, executor.clone());

        let mut data = standalone("orphan");
        data.dependencies = vec![Uuid::new_v4()];
        let task = create(&db, &data).await;

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.unrunnable, 1);
        assert_eq!(report.claimed, 0);

        let stored = Task::find_by_id(&db.pool, task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error.unwrap().starts_with("Configuration error"));
        assert!(stored.started_at.is_none());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dependent_waits_for_dependency() {
        let (db, _dir) = setup_db().await;
        let executor = Arc::new(EchoExecutor::default());
        let scheduler = scheduler_with(&db, 4, executor.clone());

        let first = create(&db, &standalone("first")).await;
        let mut second = standalone("second");
        second.dependencies = vec![first.id];
        let second = create(&db, &second).await;

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 1);
        scheduler.workers().wait_idle().await;
        assert_eq!(status_of(&db, first.id).await, TaskStatus::Completed);
        assert_eq!(status_of(&db, second.id).await, TaskStatus::Pending);

        scheduler.run_cycle().await.unwrap();
        scheduler.workers().wait_idle().await;

        let first = Task::find_by_id(&db.pool, first.id).await.unwrap().unwrap();
        let second = Task::find_by_id(&db.pool, second.id).await.unwrap().unwrap();
        assert_eq!(second.status, TaskStatus::Completed);
        assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
    }

    #[tokio::test]
    async fn retries_until_budget_then_fails() {
        let (db, _dir) = setup_db().await;
        let executor = Arc::new(FailingExecutor::default());
        let scheduler = scheduler_with(&db, 1, executor.clone());

        let mut data = standalone("doomed");
        data.max_retries = 2;
        let task_id = create(&db, &data).await.id;

        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn(shutdown.clone());
        wait_for(|| {
            let db = db.clone();
            async move { status_of(&db, task_id).await == TaskStatus::Failed }
        })
        .await;
        shutdown.cancel();
        handle.await.unwrap();
        scheduler.workers().shutdown().await;

        let stored = Task::find_by_id(&db.pool, task_id).await.unwrap().unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.error.as_deref(), Some("Execution failed: failure #3"));
    }

    #[tokio::test]
    async fn later_phase_starts_after_earlier_phase_completes() {
        let (db, _dir) = setup_db().await;
        let executor = Arc::new(EchoExecutor::default());
        let scheduler = scheduler_with(&db, 4, executor.clone());

        let workflow_id = start_workflow_with_phases(&db, &[("a", &[]), ("b", &["a"])], |wf| {
            vec![
                workflow_task(wf, "b", "b1"),
                workflow_task(wf, "a", "a1"),
                workflow_task(wf, "a", "a2"),
            ]
        })
        .await;

        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn(shutdown.clone());
        wait_for(|| {
            let db = db.clone();
            async move {
                Workflow::find_by_id(&db.pool, workflow_id)
                    .await
                    .unwrap()
                    .is_some_and(|w| w.status.is_terminal())
            }
        })
        .await;
        shutdown.cancel();
        handle.await.unwrap();
        scheduler.workers().shutdown().await;

        let workflow = Workflow::find_by_id(&db.pool, workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);

        let tasks = Task::find_by_workflow(&db.pool, workflow_id).await.unwrap();
        let last_a = tasks
            .iter()
            .filter(|t| t.phase_id.as_deref() == Some("a"))
            .filter_map(|t| t.completed_at)
            .max()
            .unwrap();
        let b1 = tasks.iter().find(|t| t.name == "b1").unwrap();
        assert!(b1.started_at.unwrap() >= last_a);
        assert!(workflow.completed_at.unwrap() >= b1.completed_at.unwrap());
    }
}
