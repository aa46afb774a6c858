pub mod config;
pub mod dependency;
pub mod result_processor;
pub mod scheduler;
pub mod tasks;
pub mod webhook;
pub mod worker_pool;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;
