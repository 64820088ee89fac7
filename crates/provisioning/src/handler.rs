//! The webhook build handler: one single-attempt reconciliation of a [`Job`].
//!
//! ```text
//! Pending → ResolvingConfig → QueryingRemote → Reconciling → Succeeded
//!                                                          ↘ FailedRetryable
//!                                                          ↘ FailedTerminal
//! ```
//!
//! Concurrent jobs for the same organization are safe without locking:
//! the existence check is idempotent and a create that loses a race
//! ([`ProvisionError::AlreadyExists`]) counts as success.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::metrics::ProvisioningMetrics;
use crate::{
    CodeHostClient, CodeHostRegistry, ConfigResolver, Job, NewWebhook, ProvisionError,
    Provisioned, RemoteWebhook, WebhookEvent, WebhookUpdate,
};

/// Per-job processing stage, emitted as the `stage` field of log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Claimed, nothing attempted yet.
    Pending,
    /// Reading and validating the external service's connection document.
    ResolvingConfig,
    /// Listing the webhooks installed in the job's scope.
    QueryingRemote,
    /// Creating or reactivating the callback webhook.
    Reconciling,
    /// The webhook exists and is active, or no webhook is declared.
    Succeeded,
    /// Failed with an error the worker will retry.
    FailedRetryable,
    /// Failed with an error no retry can fix.
    FailedTerminal,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Pending => "pending",
            Stage::ResolvingConfig => "resolving_config",
            Stage::QueryingRemote => "querying_remote",
            Stage::Reconciling => "reconciling",
            Stage::Succeeded => "succeeded",
            Stage::FailedRetryable => "failed_retryable",
            Stage::FailedTerminal => "failed_terminal",
        };
        f.write_str(s)
    }
}

/// Ensures the webhook declared for a job's organization exists on the code
/// host.
///
/// The handler never retries and never writes local state; the declared
/// secret is provisioned as-is.
pub struct WebhookBuildHandler {
    resolver: ConfigResolver,
    registry: Arc<CodeHostRegistry>,
    external_url: String,
    metrics: ProvisioningMetrics,
}

impl WebhookBuildHandler {
    /// `external_url` is the platform's public base URL; webhooks target
    /// [`WebhookBuildHandler::callback_url`] beneath it.
    pub fn new(
        resolver: ConfigResolver,
        registry: Arc<CodeHostRegistry>,
        external_url: impl Into<String>,
        metrics: ProvisioningMetrics,
    ) -> Self {
        Self {
            resolver,
            registry,
            external_url: external_url.into().trim_end_matches('/').to_owned(),
            metrics,
        }
    }

    /// The URL the code host should deliver this job's events to.
    pub fn callback_url(&self, job: &Job) -> String {
        format!("{}/.api/webhooks/{}", self.external_url, job.ext_svc_id())
    }

    /// Runs one reconciliation attempt for `job`.
    ///
    /// Returns exactly one classified error on failure; see
    /// [`ProvisionError::retry_policy`]. Cancellation is checked at every
    /// remote-call boundary and yields [`ProvisionError::Cancelled`].
    #[instrument(
        name = "webhook_build",
        skip_all,
        fields(
            repo = %job.repo_name(),
            org = %job.org(),
            ext_svc_id = %job.ext_svc_id(),
            kind = %job.ext_svc_kind(),
        )
    )]
    pub async fn handle(
        &self,
        cancel: &CancellationToken,
        job: &Job,
    ) -> Result<Provisioned, ProvisionError> {
        let started = Instant::now();
        debug!(stage = %Stage::Pending, "handling webhook build job");

        let result = self.reconcile(cancel, job).await;

        let elapsed = started.elapsed();
        match &result {
            Ok(outcome) => {
                self.metrics
                    .record_handle(outcome.as_str(), elapsed.as_secs_f64());
                info!(
                    stage = %Stage::Succeeded,
                    outcome = outcome.as_str(),
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "webhook build job succeeded"
                );
            }
            Err(err) => {
                self.metrics
                    .record_handle(err.kind().as_str(), elapsed.as_secs_f64());
                if err.retry_policy().is_retryable() {
                    warn!(
                        stage = %Stage::FailedRetryable,
                        error_kind = %err.kind(),
                        error = %err,
                        "webhook build job failed; will be retried"
                    );
                } else {
                    error!(
                        stage = %Stage::FailedTerminal,
                        error_kind = %err.kind(),
                        error = %err,
                        "webhook build job failed permanently"
                    );
                }
            }
        }
        result
    }

    async fn reconcile(
        &self,
        cancel: &CancellationToken,
        job: &Job,
    ) -> Result<Provisioned, ProvisionError> {
        debug!(stage = %Stage::ResolvingConfig);
        let service = guarded(
            cancel,
            "resolving config",
            self.resolver.resolve(job.ext_svc_id()),
        )
        .await?;

        if service.kind != job.ext_svc_kind() {
            return Err(ProvisionError::NotSupported {
                kind: job.ext_svc_kind(),
                reason: format!("external service is now of kind {}", service.kind),
            });
        }
        let client = self.registry.client_for(service.id, &service.config)?;

        let Some(declared) = service.config.webhook_for(job.org()) else {
            info!("no webhook declared for organization; nothing to provision");
            return Ok(Provisioned::NoWebhookDeclared);
        };

        let target_url = self.callback_url(job);
        let scope = client.scope_for(job);

        debug!(stage = %Stage::QueryingRemote, %scope);
        let existing = self
            .remote(
                cancel,
                client.as_ref(),
                "list_webhooks",
                client.list_webhooks(&scope),
            )
            .await?;

        debug!(
            stage = %Stage::Reconciling,
            existing = existing.len(),
            "comparing remote webhooks with callback URL"
        );
        let matching: Vec<&RemoteWebhook> = existing
            .iter()
            .filter(|hook| same_target(&hook.target_url, &target_url))
            .collect();
        if matching.len() > 1 {
            warn!(
                count = matching.len(),
                %scope,
                "multiple webhooks target the callback URL"
            );
        }

        if let Some(hook) = matching.iter().find(|hook| hook.active) {
            debug!(webhook_id = %hook.id, "webhook already provisioned");
            return Ok(Provisioned::AlreadyProvisioned(hook.id.clone()));
        }

        if let Some(hook) = matching.first() {
            info!(webhook_id = %hook.id, "reactivating inactive webhook");
            let updated = self
                .remote(
                    cancel,
                    client.as_ref(),
                    "update_webhook",
                    client.update_webhook(&scope, &hook.id, &WebhookUpdate { active: true }),
                )
                .await?;
            return Ok(Provisioned::Reactivated(updated.id));
        }

        let webhook = NewWebhook {
            target_url,
            secret: declared.secret.clone(),
            events: WebhookEvent::PROVISIONED.to_vec(),
        };
        match self
            .remote(
                cancel,
                client.as_ref(),
                "create_webhook",
                client.create_webhook(&scope, &webhook),
            )
            .await
        {
            Ok(created) => {
                info!(webhook_id = %created.id, %scope, "created webhook");
                Ok(Provisioned::Created(created.id))
            }
            Err(ProvisionError::AlreadyExists { message }) => {
                info!(%message, %scope, "webhook was created concurrently by another job");
                Ok(Provisioned::CreatedConcurrently)
            }
            Err(err) => Err(err),
        }
    }

    /// Runs one code-host call under cancellation and records its metrics.
    async fn remote<T>(
        &self,
        cancel: &CancellationToken,
        client: &dyn CodeHostClient,
        operation: &'static str,
        call: impl Future<Output = Result<T, ProvisionError>>,
    ) -> Result<T, ProvisionError> {
        let started = Instant::now();
        let result = guarded(cancel, operation, call).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind().as_str(),
        };
        self.metrics.record_code_host_request(
            client.kind().as_str(),
            operation,
            outcome,
            started.elapsed().as_secs_f64(),
        );
        result
    }
}

/// Awaits `call` unless `cancel` fires first. An already-cancelled token
/// prevents the call from starting.
async fn guarded<T>(
    cancel: &CancellationToken,
    stage: &'static str,
    call: impl Future<Output = Result<T, ProvisionError>>,
) -> Result<T, ProvisionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProvisionError::Cancelled { stage }),
        result = call => result,
    }
}

/// Compares webhook target URLs as parsed URLs, so scheme and host case and
/// default ports are ignored, as is a trailing `/`. Unparseable targets never
/// match.
fn same_target(remote: &str, desired: &str) -> bool {
    match (target_key(remote), target_key(desired)) {
        (Some(remote), Some(desired)) => remote == desired,
        _ => false,
    }
}

fn target_key(raw: &str) -> Option<Url> {
    let mut url = Url::parse(raw.trim()).ok()?;
    let path = url.path().trim_end_matches('/').to_owned();
    url.set_path(&path);
    Some(url)
}
