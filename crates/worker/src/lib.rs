//! Job queue and worker loop for webhook provisioning.
//!
//! Implements [`provisioning::JobQueue`] in memory and drives claimed jobs
//! through [`provisioning::WebhookBuildHandler`] with bounded concurrency,
//! exponential backoff and lease-based crash recovery.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Retry scheduling, leases and task management live
//! here. The [`provisioning`] crate only classifies errors; this crate decides
//! what a classification means for the job record.

mod backoff;
mod queue;
mod worker;

pub use backoff::BackoffConfig;
pub use queue::InMemoryJobQueue;
pub use worker::{JobReport, RunSummary, Worker, WorkerConfig, WorkerError};
