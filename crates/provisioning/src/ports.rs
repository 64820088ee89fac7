//! Port traits implemented by infrastructure crates.
//!
//! | Trait | Implemented by |
//! |-------|----------------|
//! | [`CodeHostClient`], [`CodeHostClientFactory`] | `github` (one pair per code-host kind) |
//! | [`ExternalServiceStore`] | [`crate::memory::InMemoryExternalServiceStore`], platform database |
//! | [`JobQueue`] | `worker::InMemoryJobQueue`, platform job table |
//!
//! All traits are object-safe so the handler and worker hold `Arc<dyn _>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    ClaimedJob, ExternalService, ExternalServiceConfig, ExternalServiceId, ExternalServiceKind,
    Job, JobFailure, JobId, JobRecord, NewWebhook, ProvisionError, QueueError, RemoteWebhook,
    RemoteWebhookId, StoreError, Timestamp, WebhookScope, WebhookUpdate, WorkerName,
};

// ---------------------------------------------------------------------------
// Code hosts
// ---------------------------------------------------------------------------

/// Webhook-management capability of one code host, bound to one connection's
/// credentials.
///
/// Implementations own authentication, pagination and rate-limit handling and
/// classify every failure into a [`ProvisionError`]:
///
/// - transient failures → [`ProvisionError::RemoteUnavailable`] (with
///   `retry_after` when the host supplies one);
/// - credential failures → [`ProvisionError::Unauthorized`];
/// - duplicate creation → [`ProvisionError::AlreadyExists`].
///
/// Implementations never retry internally.
#[async_trait]
pub trait CodeHostClient: Send + Sync {
    /// The code-host kind this client speaks to.
    fn kind(&self) -> ExternalServiceKind;

    /// Chooses where this job's webhook lives: organization-level where the
    /// host supports it, repository-level otherwise.
    fn scope_for(&self, job: &Job) -> WebhookScope;

    /// Lists every webhook registered in `scope`, following pagination.
    async fn list_webhooks(&self, scope: &WebhookScope)
        -> Result<Vec<RemoteWebhook>, ProvisionError>;

    /// Registers a new webhook in `scope`.
    async fn create_webhook(
        &self,
        scope: &WebhookScope,
        webhook: &NewWebhook,
    ) -> Result<RemoteWebhook, ProvisionError>;

    /// Changes an existing webhook in `scope`.
    async fn update_webhook(
        &self,
        scope: &WebhookScope,
        id: &RemoteWebhookId,
        update: &WebhookUpdate,
    ) -> Result<RemoteWebhook, ProvisionError>;
}

/// Builds a [`CodeHostClient`] for a resolved connection.
///
/// One factory is registered per [`ExternalServiceKind`] in
/// [`crate::CodeHostRegistry`].
pub trait CodeHostClientFactory: Send + Sync {
    fn kind(&self) -> ExternalServiceKind;

    /// Returns a client authenticated with `config`'s token.
    ///
    /// Fails with [`ProvisionError::Malformed`] when the config cannot be
    /// turned into a client (e.g. an unparseable URL).
    fn client(
        &self,
        id: ExternalServiceId,
        config: &ExternalServiceConfig,
    ) -> Result<Arc<dyn CodeHostClient>, ProvisionError>;
}

// ---------------------------------------------------------------------------
// External-service store
// ---------------------------------------------------------------------------

/// Read/write access to stored external-service rows.
#[async_trait]
pub trait ExternalServiceStore: Send + Sync {
    /// Returns the row for `id`, or [`StoreError::NotFound`] if it was deleted.
    async fn get(&self, id: ExternalServiceId) -> Result<ExternalService, StoreError>;

    /// Inserts or replaces a row, returning it as stored.
    async fn upsert(&self, service: ExternalService) -> Result<ExternalService, StoreError>;
}

// ---------------------------------------------------------------------------
// Job queue
// ---------------------------------------------------------------------------

/// Durable job storage with claim/lease semantics.
///
/// Every transition after [`JobQueue::claim`] must present the lease token it
/// returned; a stale token fails with [`QueueError::LeaseMismatch`].
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Adds `job`, or returns the id of an equivalent job that is still queued
    /// or processing.
    async fn enqueue(&self, job: Job) -> Result<JobId, QueueError>;

    /// Claims the oldest eligible job for `worker` for `lease` duration.
    ///
    /// Jobs whose lease has expired are eligible again.
    async fn claim(
        &self,
        worker: &WorkerName,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError>;

    /// Marks a claimed job as completed.
    async fn complete(&self, claim: &ClaimedJob) -> Result<(), QueueError>;

    /// Returns a claimed job to the queue, not claimable before `not_before`.
    async fn release(
        &self,
        claim: &ClaimedJob,
        not_before: Timestamp,
        failure: JobFailure,
    ) -> Result<(), QueueError>;

    /// Marks a claimed job as permanently failed, keeping `failure`.
    async fn fail_permanently(
        &self,
        claim: &ClaimedJob,
        failure: JobFailure,
    ) -> Result<(), QueueError>;

    async fn get(&self, id: JobId) -> Result<JobRecord, QueueError>;

    /// Number of jobs that are queued or processing.
    async fn outstanding(&self) -> Result<usize, QueueError>;

    /// All permanently failed jobs, for operator inspection.
    async fn failed(&self) -> Result<Vec<JobRecord>, QueueError>;
}
