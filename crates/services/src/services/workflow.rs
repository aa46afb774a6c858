//! Building, starting and inspecting workflows.
//!
//! A workflow is assembled while `created`: phases and tasks may only be
//! added before it starts. Starting validates both graphs and from then on
//! the result processor owns phase and workflow status.

use std::collections::HashMap;

use db::{
    DBService,
    models::{
        task::{Task, TaskStatus},
        workflow::{CreateWorkflow, Workflow, WorkflowStatus},
        workflow_phase::{CreateWorkflowPhase, PhaseStatus, WorkflowPhase, WorkflowPhaseError},
    },
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::{
    dependency::{DependencyGraph, GraphError, incomplete_prerequisites},
    result_processor::{ResultProcessor, ResultProcessorError},
    tasks::{SubmitTask, TaskService, TaskServiceError},
};

#[derive(Debug, Error)]
pub enum WorkflowServiceError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Phase(#[from] WorkflowPhaseError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Task(#[from] TaskServiceError),
    #[error(transparent)]
    Results(#[from] ResultProcessorError),
    #[error("Workflow {0} not found")]
    NotFound(Uuid),
    #[error("Phase '{0}' not found in this workflow")]
    PhaseNotFound(String),
    #[error("Workflow {id} is {status}; only created workflows can be changed")]
    InvalidState { id: Uuid, status: WorkflowStatus },
    #[error("Invalid workflow: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddWorkflowTask {
    pub phase_id: String,
    #[serde(flatten)]
    pub task: SubmitTask,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    fn add(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase_id: String,
    pub name: String,
    pub status: PhaseStatus,
    pub depends_on: Vec<String>,
    /// Prerequisites that have not completed yet.
    pub waiting_on: Vec<String>,
    pub tasks: TaskCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatusReport {
    pub workflow: Workflow,
    pub phases: Vec<PhaseReport>,
    pub tasks: TaskCounts,
    /// Unfinished phases that are holding back progress: failed, or still
    /// waiting on a prerequisite.
    pub blocking_phases: Vec<String>,
}

#[derive(Clone)]
pub struct WorkflowService {
    db: DBService,
    tasks: TaskService,
    processor: ResultProcessor,
}

impl WorkflowService {
    pub fn new(db: DBService, tasks: TaskService, processor: ResultProcessor) -> Self {
        Self {
            db,
            tasks,
            processor,
        }
    }

    pub async fn create_workflow(
        &self,
        data: CreateWorkflow,
    ) -> Result<Workflow, WorkflowServiceError> {
        if data.name.trim().is_empty() {
            return Err(WorkflowServiceError::Validation(
                "name must not be empty".into(),
            ));
        }
        let workflow = Workflow::create(&self.db.pool, &data, Uuid::new_v4()).await?;
        info!(workflow_id = %workflow.id, name = %workflow.name, "Workflow created");
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Workflow, WorkflowServiceError> {
        Workflow::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(WorkflowServiceError::NotFound(id))
    }

    async fn editable(&self, id: Uuid) -> Result<Workflow, WorkflowServiceError> {
        let workflow = self.get_workflow(id).await?;
        if workflow.status != WorkflowStatus::Created {
            return Err(WorkflowServiceError::InvalidState {
                id,
                status: workflow.status,
            });
        }
        Ok(workflow)
    }

    /// Adds a phase after checking that the phase graph stays a DAG.
    pub async fn add_phase(
        &self,
        workflow_id: Uuid,
        data: CreateWorkflowPhase,
    ) -> Result<WorkflowPhase, WorkflowServiceError> {
        self.editable(workflow_id).await?;
        if data.phase_id.trim().is_empty() {
            return Err(WorkflowServiceError::Validation(
                "phase_id must not be empty".into(),
            ));
        }

        let existing = WorkflowPhase::find_by_workflow(&self.db.pool, workflow_id).await?;
        let mut graph = phase_graph(&existing);
        graph.add_node(data.phase_id.clone(), data.depends_on.iter().cloned());
        graph.validate()?;

        let phase = WorkflowPhase::create(&self.db.pool, workflow_id, &data).await?;
        info!(%workflow_id, phase_id = %phase.phase_id, "Phase added");
        Ok(phase)
    }

    pub async fn add_task(
        &self,
        workflow_id: Uuid,
        data: AddWorkflowTask,
    ) -> Result<Task, WorkflowServiceError> {
        self.editable(workflow_id).await?;
        if WorkflowPhase::find(&self.db.pool, workflow_id, &data.phase_id)
            .await?
            .is_none()
        {
            return Err(WorkflowServiceError::PhaseNotFound(data.phase_id));
        }

        let create = self
            .tasks
            .resolve(data.task, Some(workflow_id), Some(data.phase_id))
            .await?;
        Ok(self.tasks.insert(&create).await?)
    }

    pub async fn list_workflow_tasks(&self, id: Uuid) -> Result<Vec<Task>, WorkflowServiceError> {
        self.get_workflow(id).await?;
        Ok(Task::find_by_workflow(&self.db.pool, id).await?)
    }

    /// Validates the phase and task graphs and moves the workflow to
    /// `running`. Phase and workflow status are derived immediately, so a
    /// workflow with only empty phases completes here.
    pub async fn start_workflow(&self, id: Uuid) -> Result<Workflow, WorkflowServiceError> {
        self.editable(id).await?;

        let phases = WorkflowPhase::find_by_workflow(&self.db.pool, id).await?;
        if phases.is_empty() {
            return Err(WorkflowServiceError::Validation(
                "workflow has no phases".into(),
            ));
        }
        phase_graph(&phases).validate()?;

        let tasks = Task::find_by_workflow(&self.db.pool, id).await?;
        let mut task_graph = DependencyGraph::new();
        for task in &tasks {
            task_graph.add_node(task.id, task.dependencies.iter().copied());
        }
        // Dependencies outside the workflow are leaves as far as this graph
        // is concerned.
        for task in &tasks {
            for dependency in &task.dependencies {
                if !task_graph.contains(dependency) && Task::exists(&self.db.pool, *dependency).await? {
                    task_graph.add_node(*dependency, std::iter::empty());
                }
            }
        }
        task_graph.validate()?;

        if !Workflow::try_start(&self.db.pool, id).await? {
            let workflow = self.get_workflow(id).await?;
            return Err(WorkflowServiceError::InvalidState {
                id,
                status: workflow.status,
            });
        }
        info!(workflow_id = %id, phases = phases.len(), tasks = tasks.len(), "Workflow started");

        self.processor.recompute_workflow(id).await?;
        self.get_workflow(id).await
    }

    pub async fn get_workflow_status(
        &self,
        id: Uuid,
    ) -> Result<WorkflowStatusReport, WorkflowServiceError> {
        let workflow = self.get_workflow(id).await?;
        let phases = WorkflowPhase::find_by_workflow(&self.db.pool, id).await?;
        let tasks = Task::find_by_workflow(&self.db.pool, id).await?;

        let statuses: HashMap<&str, PhaseStatus> = phases
            .iter()
            .map(|p| (p.phase_id.as_str(), p.status))
            .collect();

        let mut per_phase: HashMap<&str, TaskCounts> = HashMap::new();
        let mut totals = TaskCounts::default();
        for task in &tasks {
            totals.add(task.status);
            if let Some(phase_id) = task.phase_id.as_deref() {
                per_phase.entry(phase_id).or_default().add(task.status);
            }
        }

        let mut blocking_phases = Vec::new();
        let reports = phases
            .iter()
            .map(|phase| {
                let waiting_on = incomplete_prerequisites(phase, &statuses);
                let blocked = match phase.status {
                    PhaseStatus::Failed => true,
                    PhaseStatus::Completed => false,
                    PhaseStatus::Pending | PhaseStatus::Running => !waiting_on.is_empty(),
                };
                if blocked {
                    blocking_phases.push(phase.phase_id.clone());
                }
                PhaseReport {
                    phase_id: phase.phase_id.clone(),
                    name: phase.name.clone(),
                    status: phase.status,
                    depends_on: phase.depends_on.0.clone(),
                    waiting_on,
                    tasks: per_phase
                        .get(phase.phase_id.as_str())
                        .copied()
                        .unwrap_or_default(),
                }
            })
            .collect();

        Ok(WorkflowStatusReport {
            workflow,
            phases: reports,
            tasks: totals,
            blocking_phases,
        })
    }
}

fn phase_graph(phases: &[WorkflowPhase]) -> DependencyGraph<String> {
    let mut graph = DependencyGraph::new();
    for phase in phases {
        graph.add_node(phase.phase_id.clone(), phase.depends_on.0.iter().cloned());
    }
    graph
}
