//! Durable job infrastructure: named queues over the record store, a handler
//! registry, and the worker runtime that drains them.

mod job;
mod queue;
mod registry;
mod runner;

pub use job::{Job, JobPayload, JobStatus, QueueName, DEFAULT_MAX_ATTEMPTS};
pub use queue::{EnqueueReceipt, JobQueue, QueueCounts, QueueMode};
pub use registry::JobRegistry;
pub use runner::WorkerRuntime;
