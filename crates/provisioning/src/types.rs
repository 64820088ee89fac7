//! Shared value types for webhook provisioning.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! structure and invariants: a [`Job`] derives its organization from the
//! repository name, a [`Secret`] never prints its value, a [`JobRecord`] holds
//! the retry bookkeeping that lets any worker resume any job.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    ErrorKind, ExternalServiceId, JobId, OrgName, ProvisionError, RemoteWebhookId, RepoId,
    RepoName, WorkerName,
};

// ---------------------------------------------------------------------------
// External services
// ---------------------------------------------------------------------------

/// The kind of code host an external service connects to.
///
/// Serialized with the platform's upper-case spelling (`"GITHUB"`); the
/// lower-case form is accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExternalServiceKind {
    #[serde(rename = "GITHUB", alias = "github")]
    GitHub,
    #[serde(rename = "GITLAB", alias = "gitlab")]
    GitLab,
    #[serde(rename = "BITBUCKETSERVER", alias = "bitbucketServer")]
    BitbucketServer,
    #[serde(rename = "BITBUCKETCLOUD", alias = "bitbucketCloud")]
    BitbucketCloud,
    #[serde(rename = "OTHER", alias = "other")]
    Other,
}

impl ExternalServiceKind {
    /// Returns the canonical serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            ExternalServiceKind::GitHub => "GITHUB",
            ExternalServiceKind::GitLab => "GITLAB",
            ExternalServiceKind::BitbucketServer => "BITBUCKETSERVER",
            ExternalServiceKind::BitbucketCloud => "BITBUCKETCLOUD",
            ExternalServiceKind::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for ExternalServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExternalServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GITHUB" => Ok(ExternalServiceKind::GitHub),
            "GITLAB" => Ok(ExternalServiceKind::GitLab),
            "BITBUCKETSERVER" => Ok(ExternalServiceKind::BitbucketServer),
            "BITBUCKETCLOUD" => Ok(ExternalServiceKind::BitbucketCloud),
            "OTHER" => Ok(ExternalServiceKind::Other),
            _ => Err(format!("unknown external service kind '{s}'")),
        }
    }
}

/// A stored external-service row as returned by the store collaborator.
///
/// `config` is the raw JSON connection document; it is parsed by
/// [`crate::ConfigResolver`], never by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalService {
    pub id: ExternalServiceId,
    pub kind: ExternalServiceKind,
    pub display_name: String,
    pub config: String,
}

/// A secret string. `Debug` and `Display` never reveal the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value for use on the wire.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// One `webhooks` entry of a connection document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookDeclaration {
    pub org: OrgName,
    pub secret: Secret,
}

/// The structured view of an external service's connection document.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalServiceConfig {
    pub kind: ExternalServiceKind,
    /// Code-host base URL (e.g. `"https://ghe.sgdev.org"`).
    pub url: String,
    pub token: Secret,
    pub repos: BTreeSet<RepoName>,
    /// Declared webhooks, in document order.
    pub webhooks: Vec<WebhookDeclaration>,
}

impl ExternalServiceConfig {
    /// Returns the first declared webhook whose `org` equals `org`.
    pub fn webhook_for(&self, org: &OrgName) -> Option<&WebhookDeclaration> {
        self.webhooks.iter().find(|w| &w.org == org)
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// One webhook-provisioning request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    repo_id: RepoId,
    repo_name: RepoName,
    org: OrgName,
    ext_svc_id: ExternalServiceId,
    ext_svc_kind: ExternalServiceKind,
}

impl Job {
    /// Builds the job enqueued when `repo_name` is linked to an external
    /// service. The organization is the first path segment of the name.
    pub fn for_repository(
        repo_id: RepoId,
        repo_name: RepoName,
        ext_svc_id: ExternalServiceId,
        ext_svc_kind: ExternalServiceKind,
    ) -> Self {
        let org = repo_name.org();
        Self {
            repo_id,
            repo_name,
            org,
            ext_svc_id,
            ext_svc_kind,
        }
    }

    pub fn repo_id(&self) -> RepoId {
        self.repo_id
    }

    pub fn repo_name(&self) -> &RepoName {
        &self.repo_name
    }

    pub fn org(&self) -> &OrgName {
        &self.org
    }

    pub fn ext_svc_id(&self) -> ExternalServiceId {
        self.ext_svc_id
    }

    pub fn ext_svc_kind(&self) -> ExternalServiceKind {
        self.ext_svc_kind
    }
}

/// Lifecycle state of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed once `next_eligible_at` has passed.
    Queued,
    /// Claimed by a worker under a lease.
    Processing,
    Completed,
    /// Permanently failed; `last_error` explains why.
    Failed,
}

/// The classified error persisted on a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ProvisionError> for JobFailure {
    fn from(err: &ProvisionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// A worker's time-bounded claim on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Fresh per claim; every queue transition must present it.
    pub token: uuid::Uuid,
    pub worker: WorkerName,
    pub expires_at: Timestamp,
}

/// A job as persisted by the queue, including its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job: Job,
    pub state: JobState,
    /// Attempts started so far (incremented on claim).
    pub attempts: u32,
    pub next_eligible_at: Timestamp,
    pub last_error: Option<JobFailure>,
    pub lease: Option<Lease>,
    pub enqueued_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A job handed to a worker by [`crate::JobQueue::claim`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub job: Job,
    /// The attempt number this claim represents, starting at 1.
    pub attempt: u32,
    pub lease: Lease,
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

/// Host-agnostic event classes the platform subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    Push,
    /// Pull-request / merge-request lifecycle.
    PullRequest,
    /// Repository create/rename/visibility changes.
    Repository,
}

impl WebhookEvent {
    /// The fixed event set every provisioned webhook subscribes to.
    pub const PROVISIONED: [WebhookEvent; 3] = [
        WebhookEvent::Push,
        WebhookEvent::PullRequest,
        WebhookEvent::Repository,
    ];
}

/// Where on the code host a webhook lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WebhookScope {
    Organization(String),
    /// `"owner/name"` path of one repository.
    Repository(String),
}

impl std::fmt::Display for WebhookScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookScope::Organization(org) => write!(f, "org:{org}"),
            WebhookScope::Repository(repo) => write!(f, "repo:{repo}"),
        }
    }
}

/// A webhook as currently registered on the code host. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWebhook {
    pub id: RemoteWebhookId,
    pub target_url: String,
    /// Host-specific event names.
    pub events: BTreeSet<String>,
    pub active: bool,
    /// Code hosts never echo secrets; this only says whether one is set.
    pub secret_configured: bool,
}

/// Payload for creating a webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWebhook {
    pub target_url: String,
    pub secret: Secret,
    pub events: Vec<WebhookEvent>,
}

/// Fields to change on an existing webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookUpdate {
    pub active: bool,
}

/// The result of one successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    /// No webhook is declared for the job's organization; nothing was done.
    NoWebhookDeclared,
    /// A webhook targeting the callback URL was already active.
    AlreadyProvisioned(RemoteWebhookId),
    /// The existing webhook was inactive and has been reactivated.
    Reactivated(RemoteWebhookId),
    Created(RemoteWebhookId),
    /// Creation lost a race with a concurrent job; the webhook exists.
    CreatedConcurrently,
}

impl Provisioned {
    /// Label used in metrics and structured logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provisioned::NoWebhookDeclared => "no_webhook_declared",
            Provisioned::AlreadyProvisioned(_) => "already_provisioned",
            Provisioned::Reactivated(_) => "reactivated",
            Provisioned::Created(_) => "created",
            Provisioned::CreatedConcurrently => "created_concurrently",
        }
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Returns this timestamp shifted forward by `delay`, saturating at the
    /// maximum representable time.
    pub fn plus(self, delay: Duration) -> Self {
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| self.0.checked_add_signed(d))
            .map(Self)
            .unwrap_or(Self(DateTime::<Utc>::MAX_UTC))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
