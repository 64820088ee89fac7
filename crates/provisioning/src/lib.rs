//! Webhook provisioning domain.
//!
//! Given a repository linked to an external code-host service, ensures the
//! webhook declared for the repository's organization exists on the code host
//! so the platform receives push, pull-request and repository events without
//! polling.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate performs no HTTP or
//! storage I/O itself. Code hosts, the external-service store and the job
//! queue are reached through the traits in [`ports`]; infrastructure crates
//! (`github`, `worker`) implement them.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`RepoId`, `ExternalServiceId`, `JobId`, ...) |
//! | [`types`] | Jobs, connection config, remote webhooks, job records |
//! | [`errors`] | `ProvisionError`, `RetryPolicy`, collaborator errors |
//! | [`ports`] | `CodeHostClient`, `ExternalServiceStore`, `JobQueue` |
//! | [`config`] | Connection-document resolution |
//! | [`registry`] | Kind → code-host client factory dispatch |
//! | [`handler`] | The webhook build handler |
//! | [`metrics`] | Prometheus metrics on an explicit registry |
//! | [`memory`] | In-memory store and (with `test-support`) fake code host |

pub mod config;
pub mod errors;
pub mod handler;
pub mod identifiers;
pub mod memory;
pub mod metrics;
pub mod ports;
pub mod registry;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use config::{parse_connection, parse_http_url, ConfigResolver, ResolvedService};
pub use errors::{ErrorKind, ProvisionError, QueueError, RetryPolicy, StoreError};
pub use handler::{Stage, WebhookBuildHandler};
pub use identifiers::{ExternalServiceId, JobId, OrgName, RemoteWebhookId, RepoId, RepoName, WorkerName};
pub use metrics::{JobOutcome, MetricsError, ProvisioningMetrics};
pub use ports::{CodeHostClient, CodeHostClientFactory, ExternalServiceStore, JobQueue};
pub use registry::CodeHostRegistry;
pub use types::{
    ClaimedJob, ExternalService, ExternalServiceConfig, ExternalServiceKind, Job, JobFailure,
    JobRecord, JobState, Lease, NewWebhook, Provisioned, RemoteWebhook, Secret, Timestamp,
    WebhookDeclaration, WebhookEvent, WebhookScope, WebhookUpdate,
};
