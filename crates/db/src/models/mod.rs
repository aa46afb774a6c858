pub mod task;
pub mod task_log;
pub mod webhook;
pub mod workflow;
pub mod workflow_phase;

#[cfg(test)]
pub(crate) mod test_utils;
