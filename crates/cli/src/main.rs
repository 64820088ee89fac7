//! Webhook worker entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Load configuration**: [`settings::WorkerSettings`] from the TOML file
//!    and `WEBHOOK_WORKER__*` environment overrides, validated up front.
//! 2. **Wire observability**: `tracing-subscriber` (JSON or pretty) plus an
//!    optional OpenTelemetry OTLP exporter, and a `prometheus` registry
//!    shared by every component that records metrics.
//! 3. **Construct infrastructure**: seed the external-service store, build
//!    the code-host registry, the webhook build handler and the worker.
//! 4. **Run**: enqueue one job per configured repository, process the
//!    queue until it settles (or Ctrl-C), and report permanently failed jobs.

mod settings;
mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use github::GitHubClientFactory;
use prometheus::Registry;
use provisioning::memory::InMemoryExternalServiceStore;
use provisioning::metrics::encode_text;
use provisioning::{
    parse_connection, CodeHostRegistry, ConfigResolver, ExternalServiceStore, Job, JobQueue,
    ProvisioningMetrics, RepoId, WebhookBuildHandler,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use worker::{InMemoryJobQueue, Worker};

use crate::settings::WorkerSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = WorkerSettings::load().context("loading worker settings")?;
    let telemetry = telemetry::init(&settings.logging)?;

    let result = run(settings).await;
    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "webhook worker failed");
    }
    telemetry.shutdown();
    result
}

async fn run(settings: WorkerSettings) -> anyhow::Result<()> {
    let registry = Registry::new();
    let metrics = ProvisioningMetrics::new(&registry)?;

    let store = Arc::new(InMemoryExternalServiceStore::new());
    let queue = Arc::new(InMemoryJobQueue::new());
    let enqueued = seed(&settings, &store, &queue).await?;
    info!(
        services = settings.external_services.len(),
        jobs = enqueued,
        "seeded external services"
    );

    let mut factory = GitHubClientFactory::new()?;
    if let Some(api_base) = &settings.github.api_base {
        factory = factory.with_api_base(api_base);
    }
    let mut code_hosts = CodeHostRegistry::new();
    code_hosts.register(Arc::new(factory));

    let handler = WebhookBuildHandler::new(
        ConfigResolver::new(store.clone()),
        Arc::new(code_hosts),
        settings.callback.external_url.trim(),
        metrics.clone(),
    );
    let worker = Worker::new(
        queue.clone(),
        Arc::new(handler),
        metrics,
        settings.worker_config()?,
    )?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        }
    });

    let summary = worker.run_until_settled(&cancel).await?;
    info!(?summary, "queue settled");

    let failed = queue.failed().await?;
    for record in &failed {
        let (kind, message) = record
            .last_error
            .as_ref()
            .map(|e| (e.kind.as_str(), e.message.as_str()))
            .unwrap_or(("unknown", ""));
        error!(
            job_id = %record.id,
            repo = %record.job.repo_name(),
            ext_svc_id = %record.job.ext_svc_id(),
            attempts = record.attempts,
            error_kind = kind,
            error = message,
            "job failed permanently"
        );
    }

    match encode_text(&registry) {
        Ok(text) => debug!(metrics = %text, "final metrics"),
        Err(err) => warn!(error = %err, "failed to encode metrics"),
    }

    if !failed.is_empty() {
        anyhow::bail!("{} job(s) failed permanently", failed.len());
    }
    Ok(())
}

/// Stores every configured service and enqueues a job for each repository
/// its connection lists. Returns the number of jobs enqueued.
async fn seed(
    settings: &WorkerSettings,
    store: &InMemoryExternalServiceStore,
    queue: &InMemoryJobQueue,
) -> anyhow::Result<usize> {
    let mut next_repo_id = 0;
    let mut enqueued = 0;

    for service in &settings.external_services {
        let service = service.to_external_service();
        store
            .upsert(service.clone())
            .await
            .with_context(|| format!("seeding external service {}", service.id))?;

        let connection = match parse_connection(service.id, service.kind, &service.config) {
            Ok(connection) => connection,
            Err(err) => {
                warn!(ext_svc_id = %service.id, error = %err, "skipping service with unusable config");
                continue;
            }
        };
        for repo in connection.repos {
            next_repo_id += 1;
            queue
                .enqueue(Job::for_repository(
                    RepoId::new(next_repo_id),
                    repo,
                    service.id,
                    service.kind,
                ))
                .await?;
            enqueued += 1;
        }
    }
    Ok(enqueued)
}
