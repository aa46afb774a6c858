use std::{sync::Arc, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use db::{
    DBService,
    models::{
        task::Task,
        task_log::{LogLevel, TaskLog},
    },
};
use executors::executors::{ExecutionRequest, TaskExecutor};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::result_processor::{Disposition, ExecutionOutcome, ResultProcessor};

/// A reserved worker. Dropping it frees the worker again.
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

/// Fixed number of workers sharing one executor. At most `size` attempts run
/// at any moment.
#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
    executor: Arc<dyn TaskExecutor>,
    processor: ResultProcessor,
    db: DBService,
    tracker: TaskTracker,
    /// Finished attempts whose outcome the store refused. The task stays
    /// `running` until one of these is recorded.
    unrecorded: Arc<Mutex<Vec<(Task, ExecutionOutcome)>>>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        executor: Arc<dyn TaskExecutor>,
        processor: ResultProcessor,
        db: DBService,
    ) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
            executor,
            processor,
            db,
            tracker: TaskTracker::new(),
            unrecorded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn try_reserve(&self) -> Option<WorkerSlot> {
        self.slots
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| WorkerSlot { _permit: permit })
    }

    /// Runs one attempt of an already claimed task on a reserved worker.
    pub fn dispatch(&self, slot: WorkerSlot, task: Task) {
        let pool = self.clone();
        self.tracker.spawn(async move {
            let _slot = slot;
            pool.run_attempt(task).await;
        });
    }

    /// Resolves once no attempt is running.
    pub async fn wait_idle(&self) {
        let permits = u32::try_from(self.size).unwrap_or(u32::MAX);
        if let Ok(all) = self.slots.acquire_many(permits).await {
            drop(all);
        }
    }

    /// Waits for in-flight attempts to finish and record their outcome.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;

        self.retry_unrecorded().await;
        let left = self.unrecorded.lock().await.len();
        if left > 0 {
            error!(
                "{} task outcomes could not be recorded; those tasks are recovered at next startup",
                left
            );
        }
    }

    /// Outcomes still waiting for the store.
    pub async fn unrecorded(&self) -> usize {
        self.unrecorded.lock().await.len()
    }

    /// Tries every parked outcome once more. Returns how many were recorded;
    /// the rest stay parked for the next call.
    pub async fn retry_unrecorded(&self) -> usize {
        let parked = std::mem::take(&mut *self.unrecorded.lock().await);
        if parked.is_empty() {
            return 0;
        }

        let mut recorded = 0;
        let mut still_failing = Vec::new();
        for (task, outcome) in parked {
            match self.processor.handle_outcome(&task, outcome.clone()).await {
                Ok(disposition) => {
                    info!(task_id = %task.id, ?disposition, "Recorded parked task outcome");
                    recorded += 1;
                }
                Err(e) => {
                    debug!(task_id = %task.id, "Parked outcome still not recorded: {}", e);
                    still_failing.push((task, outcome));
                }
            }
        }
        self.unrecorded.lock().await.extend(still_failing);
        recorded
    }

    async fn run_attempt(&self, task: Task) {
        let attempt = task.retry_count + 1;
        let timeout = Duration::from_secs(u64::try_from(task.timeout_seconds.max(1)).unwrap_or(1));

        if let Err(e) = TaskLog::append(
            &self.db.pool,
            task.id,
            LogLevel::Info,
            &format!("Attempt {attempt} started"),
        )
        .await
        {
            warn!(task_id = %task.id, "Failed to write task log: {}", e);
        }
        info!(task_id = %task.id, executor = %task.executor, attempt, "Starting task attempt");

        let request = ExecutionRequest {
            task_id: task.id,
            executor: task.executor.clone(),
            instructions: task.instructions.clone(),
            timeout,
        };
        let outcome = match tokio::time::timeout(timeout, self.executor.execute(request)).await {
            Ok(Ok(output)) => ExecutionOutcome::Succeeded(output.output),
            Ok(Err(e)) => ExecutionOutcome::Failed(e.to_string()),
            Err(_) => {
                warn!(task_id = %task.id, attempt, "Task attempt timed out after {}s", timeout.as_secs());
                ExecutionOutcome::TimedOut(timeout)
            }
        };
        self.record(&task, outcome).await;
    }

    /// Hands the outcome to the result processor. A few quick retries cover
    /// a busy store; after that the outcome is parked for the scheduler to
    /// retry each cycle.
    async fn record(&self, task: &Task, outcome: ExecutionOutcome) {
        let result = (|| self.processor.handle_outcome(task, outcome.clone()))
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(50))
                    .with_max_delay(Duration::from_millis(500))
                    .with_max_times(3),
            )
            .notify(|err, dur| {
                warn!(
                    task_id = %task.id,
                    "Recording task outcome failed: {}. Retrying after {:.2}s",
                    err,
                    dur.as_secs_f64()
                );
            })
            .await;

        match result {
            Ok(Disposition::Discarded) => {
                debug!(task_id = %task.id, "Outcome discarded");
            }
            Ok(disposition) => {
                debug!(task_id = %task.id, ?disposition, "Outcome recorded");
            }
            Err(e) => {
                error!(
                    task_id = %task.id,
                    "Could not record task outcome, retrying next cycle: {}",
                    e
                );
                self.unrecorded.lock().await.push((task.clone(), outcome));
            }
        }
    }
}
