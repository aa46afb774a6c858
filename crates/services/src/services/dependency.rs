//! Dependency graphs and readiness.
//!
//! Graph validation runs when a workflow is built or started and rejects
//! dangling references and cycles. Readiness is a pure predicate over a
//! snapshot of dependency, phase and workflow state loaded from the store.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    hash::Hash,
};

use db::models::{
    task::{DependencyState, Task, TaskStatus},
    workflow::{Workflow, WorkflowStatus},
    workflow_phase::{PhaseStatus, PrerequisiteState, WorkflowPhase},
};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("'{node}' depends on unknown '{dependency}'")]
    UnknownDependency { node: String, dependency: String },
    #[error("Dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Adjacency list keyed by node id; each node lists what it depends on.
#[derive(Debug, Clone)]
pub struct DependencyGraph<K> {
    order: Vec<K>,
    edges: HashMap<K, Vec<K>>,
}

impl<K> Default for DependencyGraph<K> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            edges: HashMap::new(),
        }
    }
}

impl<K> DependencyGraph<K>
where
    K: Clone + Eq + Hash + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node<I>(&mut self, node: K, dependencies: I)
    where
        I: IntoIterator<Item = K>,
    {
        if !self.edges.contains_key(&node) {
            self.order.push(node.clone());
        }
        self.edges
            .entry(node)
            .or_default()
            .extend(dependencies);
    }

    pub fn contains(&self, node: &K) -> bool {
        self.edges.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Depth-first walk with an explicit stack. A node reached again while
    /// still on the stack closes a cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut visited: HashSet<&K> = HashSet::new();
        let mut in_progress: HashSet<&K> = HashSet::new();

        for start in &self.order {
            if visited.contains(start) {
                continue;
            }

            let mut stack: Vec<(&K, usize)> = vec![(start, 0)];
            in_progress.insert(start);

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                let next = frame.1;
                let dependencies = self.edges.get(node).map(Vec::as_slice).unwrap_or(&[]);

                if next >= dependencies.len() {
                    stack.pop();
                    in_progress.remove(node);
                    visited.insert(node);
                    continue;
                }
                frame.1 += 1;

                let Some((dependency, _)) = self.edges.get_key_value(&dependencies[next]) else {
                    return Err(GraphError::UnknownDependency {
                        node: node.to_string(),
                        dependency: dependencies[next].to_string(),
                    });
                };

                if in_progress.contains(dependency) {
                    let from = stack
                        .iter()
                        .position(|(n, _)| *n == dependency)
                        .unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[from..].iter().map(|(n, _)| n.to_string()).collect();
                    path.push(dependency.to_string());
                    return Err(GraphError::Cycle { path });
                }

                if !visited.contains(dependency) {
                    in_progress.insert(dependency);
                    stack.push((dependency, 0));
                }
            }
        }

        Ok(())
    }
}

/// Why a pending task can never run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Unrunnable {
    #[error("dependency {0} does not exist")]
    MissingDependency(Uuid),
    #[error("dependency {0} ended as {1}")]
    DependencyEnded(Uuid, TaskStatus),
    #[error("phase prerequisite '{0}' does not exist")]
    MissingPhase(String),
}

/// Something a task is still waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    Dependency(Uuid, TaskStatus),
    Phase(String, PhaseStatus),
    Workflow(WorkflowStatus),
    NotPending(TaskStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Waiting(Vec<Blocker>),
    Invalid(Unrunnable),
}

#[derive(Debug, Clone, Default)]
pub struct ReadinessSnapshot {
    pub dependencies: Vec<DependencyState>,
    pub prerequisites: Vec<PrerequisiteState>,
    pub workflow_status: Option<WorkflowStatus>,
}

impl ReadinessSnapshot {
    pub async fn load(pool: &SqlitePool, task: &Task) -> Result<Self, sqlx::Error> {
        let dependencies = Task::dependency_states(pool, task.id).await?;

        let (prerequisites, workflow_status) = match (task.workflow_id, task.phase_id.as_deref()) {
            (Some(workflow_id), phase_id) => {
                let prerequisites = match phase_id {
                    Some(phase_id) => {
                        WorkflowPhase::prerequisite_states(pool, workflow_id, phase_id).await?
                    }
                    None => Vec::new(),
                };
                let status = Workflow::find_by_id(pool, workflow_id)
                    .await?
                    .map(|w| w.status);
                (prerequisites, status)
            }
            (None, _) => (Vec::new(), None),
        };

        Ok(Self {
            dependencies,
            prerequisites,
            workflow_status,
        })
    }
}

pub struct DependencyResolver;

impl DependencyResolver {
    /// A task is ready when every dependency completed and, for a workflow
    /// task, its workflow is running and every prerequisite phase completed.
    pub fn readiness(task: &Task, snapshot: &ReadinessSnapshot) -> Readiness {
        for dependency in &snapshot.dependencies {
            match dependency.status {
                None => {
                    return Readiness::Invalid(Unrunnable::MissingDependency(
                        dependency.depends_on_id,
                    ));
                }
                Some(status @ (TaskStatus::Failed | TaskStatus::Cancelled)) => {
                    return Readiness::Invalid(Unrunnable::DependencyEnded(
                        dependency.depends_on_id,
                        status,
                    ));
                }
                _ => {}
            }
        }
        for prerequisite in &snapshot.prerequisites {
            if prerequisite.status.is_none() {
                return Readiness::Invalid(Unrunnable::MissingPhase(
                    prerequisite.phase_id.clone(),
                ));
            }
        }

        let mut blockers = Vec::new();
        if task.status != TaskStatus::Pending {
            blockers.push(Blocker::NotPending(task.status));
        }
        if task.workflow_id.is_some() {
            match snapshot.workflow_status {
                Some(WorkflowStatus::Running) => {}
                Some(status) => blockers.push(Blocker::Workflow(status)),
                None => blockers.push(Blocker::Workflow(WorkflowStatus::Created)),
            }
        }
        blockers.extend(snapshot.dependencies.iter().filter_map(|d| match d.status {
            Some(TaskStatus::Completed) | None => None,
            Some(status) => Some(Blocker::Dependency(d.depends_on_id, status)),
        }));
        blockers.extend(snapshot.prerequisites.iter().filter_map(|p| match p.status {
            Some(PhaseStatus::Completed) | None => None,
            Some(status) => Some(Blocker::Phase(p.phase_id.clone(), status)),
        }));

        if blockers.is_empty() {
            Readiness::Ready
        } else {
            Readiness::Waiting(blockers)
        }
    }
}

/// Prerequisites of `phase` that have not completed yet.
pub fn incomplete_prerequisites(
    phase: &WorkflowPhase,
    statuses: &HashMap<&str, PhaseStatus>,
) -> Vec<String> {
    phase
        .depends_on
        .0
        .iter()
        .filter(|id| statuses.get(id.as_str()) != Some(&PhaseStatus::Completed))
        .cloned()
        .collect()
}
