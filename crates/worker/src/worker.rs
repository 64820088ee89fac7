//! The bounded-concurrency worker loop.
//!
//! A [`Worker`] claims jobs from a [`JobQueue`] under a lease and runs each
//! one through the [`WebhookBuildHandler`] on its own task, at most
//! `concurrency` at a time. The classified result decides what happens to the
//! record:
//!
//! | Result | Queue transition |
//! |--------|------------------|
//! | `Ok` | `complete` |
//! | retryable, attempts left | `release` at `now + max(backoff, retry_after)` |
//! | retryable, attempts exhausted | `fail_permanently` |
//! | non-retryable | `fail_permanently` |

use std::sync::Arc;
use std::time::Duration;

use provisioning::{
    ClaimedJob, JobFailure, JobId, JobOutcome, JobQueue, ProvisionError, ProvisioningMetrics,
    QueueError, RetryPolicy, Timestamp, WebhookBuildHandler, WorkerName,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::BackoffConfig;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid worker configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Tuning for one [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: WorkerName,
    /// Maximum jobs processed at once.
    pub concurrency: usize,
    /// Sleep between claim attempts when the queue has nothing eligible.
    pub poll_interval: Duration,
    /// How long a claim stays exclusive before another worker may take it.
    pub lease: Duration,
    /// Budget for one attempt; on expiry the handler is cancelled.
    pub job_timeout: Duration,
    /// How long shutdown waits for in-flight jobs before cancelling them.
    pub shutdown_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl WorkerConfig {
    /// Default tuning for a worker called `name`: four concurrent jobs, a
    /// five-minute lease and a two-minute attempt budget.
    pub fn new(name: WorkerName) -> Self {
        Self {
            name,
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(300),
            job_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::DEFAULT,
        }
    }

    /// Rejects settings the worker cannot run with. The lease must outlive
    /// an attempt so a slow job is never claimed twice.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.concurrency == 0 {
            return Err(WorkerError::InvalidConfig(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.backoff.max_attempts == 0 {
            return Err(WorkerError::InvalidConfig(
                "backoff.max_attempts must be at least 1".into(),
            ));
        }
        if self.lease <= self.job_timeout {
            return Err(WorkerError::InvalidConfig(format!(
                "lease ({:?}) must exceed job_timeout ({:?})",
                self.lease, self.job_timeout
            )));
        }
        Ok(())
    }
}

/// What happened to one claimed job.
#[derive(Debug)]
pub struct JobReport {
    pub id: JobId,
    pub attempt: u32,
    /// `Err` when the queue refused the transition, e.g. because the lease
    /// was lost to another worker.
    pub outcome: Result<JobOutcome, QueueError>,
}

/// Totals over one [`Worker::run`] or [`Worker::run_until_settled`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub retried: usize,
    pub failed_permanently: usize,
    /// Jobs whose final transition the queue rejected.
    pub lost: usize,
    pub panicked: usize,
}

impl RunSummary {
    fn record(&mut self, joined: Result<JobReport, JoinError>) {
        match joined {
            Ok(JobReport {
                outcome: Ok(JobOutcome::Completed),
                ..
            }) => self.completed += 1,
            Ok(JobReport {
                outcome: Ok(JobOutcome::Retried),
                ..
            }) => self.retried += 1,
            Ok(JobReport {
                outcome: Ok(JobOutcome::FailedPermanently),
                ..
            }) => self.failed_permanently += 1,
            Ok(JobReport {
                id,
                attempt,
                outcome: Err(err),
            }) => {
                warn!(job_id = %id, attempt, error = %err, "queue rejected job transition");
                self.lost += 1;
            }
            Err(err) => {
                error!(error = %err, "job task panicked");
                self.panicked += 1;
            }
        }
    }
}

/// Drives jobs from a queue through the webhook build handler.
#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<WebhookBuildHandler>,
    metrics: ProvisioningMetrics,
    config: Arc<WorkerConfig>,
}

impl Worker {
    /// Builds a worker that claims from `queue` and runs each job through
    /// `handler`. Fails with [`WorkerError::InvalidConfig`] when `config`
    /// does not validate.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<WebhookBuildHandler>,
        metrics: ProvisioningMetrics,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        Ok(Self {
            queue,
            handler,
            metrics,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Processes jobs until `cancel` fires, then drains in-flight work.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary, WorkerError> {
        self.drive(cancel, false).await
    }

    /// Processes jobs until no job is queued or processing (including jobs
    /// waiting out a backoff), or until `cancel` fires.
    pub async fn run_until_settled(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, WorkerError> {
        self.drive(cancel, true).await
    }

    /// Claims and processes a single eligible job inline, if there is one.
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<JobReport>, WorkerError> {
        let Some(claim) = self.queue.claim(&self.config.name, self.config.lease).await? else {
            return Ok(None);
        };
        Ok(Some(self.process(claim, cancel.child_token()).await))
    }

    async fn drive(
        &self,
        cancel: &CancellationToken,
        until_settled: bool,
    ) -> Result<RunSummary, WorkerError> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        // Separate from `cancel` so shutdown lets in-flight jobs finish.
        let jobs_cancel = CancellationToken::new();
        let mut in_flight: JoinSet<JobReport> = JoinSet::new();
        let mut summary = RunSummary::default();

        info!(
            worker = %self.config.name,
            concurrency = self.config.concurrency,
            until_settled,
            "worker started"
        );

        let result = loop {
            while let Some(joined) = in_flight.try_join_next() {
                summary.record(joined);
            }
            if cancel.is_cancelled() {
                break Ok(());
            }

            if let Ok(permit) = permits.clone().try_acquire_owned() {
                match self.queue.claim(&self.config.name, self.config.lease).await {
                    Ok(Some(claim)) => {
                        let worker = self.clone();
                        let job_cancel = jobs_cancel.child_token();
                        in_flight.spawn(async move {
                            let report = worker.process(claim, job_cancel).await;
                            drop(permit);
                            report
                        });
                        continue;
                    }
                    Ok(None) => drop(permit),
                    Err(err) => break Err(WorkerError::from(err)),
                }
            }

            if until_settled && in_flight.is_empty() {
                match self.queue.outstanding().await {
                    Ok(0) => break Ok(()),
                    Ok(_) => {}
                    Err(err) => break Err(WorkerError::from(err)),
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    summary.record(joined);
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        };

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "waiting for in-flight jobs");
            let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
                while let Some(joined) = in_flight.join_next().await {
                    summary.record(joined);
                }
            })
            .await;
            if drained.is_err() {
                warn!(
                    in_flight = in_flight.len(),
                    timeout = ?self.config.shutdown_timeout,
                    "shutdown timeout elapsed; cancelling in-flight jobs"
                );
                jobs_cancel.cancel();
                while let Some(joined) = in_flight.join_next().await {
                    summary.record(joined);
                }
            }
        }

        info!(
            worker = %self.config.name,
            completed = summary.completed,
            retried = summary.retried,
            failed_permanently = summary.failed_permanently,
            "worker stopped"
        );
        result.map(|()| summary)
    }

    async fn process(&self, claim: ClaimedJob, cancel: CancellationToken) -> JobReport {
        let span = info_span!(
            "job",
            job_id = %claim.id,
            attempt = claim.attempt,
            repo = %claim.job.repo_name(),
        );
        async {
            self.metrics.job_started();
            let result = self.attempt(&claim, &cancel).await;
            let outcome = self.settle(&claim, result).await;
            self.metrics.job_finished();
            if let Ok(outcome) = outcome {
                self.metrics.record_job(outcome);
            }
            JobReport {
                id: claim.id,
                attempt: claim.attempt,
                outcome,
            }
        }
        .instrument(span)
        .await
    }

    /// Runs the handler, cancelling it when the attempt budget runs out.
    async fn attempt(
        &self,
        claim: &ClaimedJob,
        cancel: &CancellationToken,
    ) -> Result<provisioning::Provisioned, ProvisionError> {
        let handle = self.handler.handle(cancel, &claim.job);
        tokio::pin!(handle);
        tokio::select! {
            result = &mut handle => result,
            _ = tokio::time::sleep(self.config.job_timeout) => {
                warn!(timeout = ?self.config.job_timeout, "job timed out; cancelling");
                cancel.cancel();
                handle.await
            }
        }
    }

    async fn settle(
        &self,
        claim: &ClaimedJob,
        result: Result<provisioning::Provisioned, ProvisionError>,
    ) -> Result<JobOutcome, QueueError> {
        let err = match result {
            Ok(provisioned) => {
                self.queue.complete(claim).await?;
                debug!(outcome = provisioned.as_str(), "job completed");
                return Ok(JobOutcome::Completed);
            }
            Err(err) => err,
        };

        let failure = JobFailure::from(&err);
        match err.retry_policy() {
            RetryPolicy::Retryable { after } if self.config.backoff.allows_retry(claim.attempt) => {
                let delay = self
                    .config
                    .backoff
                    .delay_for_attempt(claim.attempt)
                    .max(after.unwrap_or_default());
                let not_before = Timestamp::now().plus(delay);
                self.queue.release(claim, not_before, failure).await?;
                info!(retry_in = ?delay, %not_before, error = %err, "job released for retry");
                Ok(JobOutcome::Retried)
            }
            policy => {
                self.queue.fail_permanently(claim, failure).await?;
                error!(
                    error = %err,
                    error_kind = %err.kind(),
                    attempts_exhausted = policy.is_retryable(),
                    "job failed permanently"
                );
                Ok(JobOutcome::FailedPermanently)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use prometheus::Registry;
    use provisioning::memory::{
        CodeHostOperation, InMemoryCodeHost, InMemoryCodeHostFactory,
        InMemoryExternalServiceStore,
    };
    use provisioning::{
        CodeHostClient, CodeHostClientFactory, CodeHostRegistry, ConfigResolver, ErrorKind,
        ExternalService, ExternalServiceConfig, ExternalServiceId, ExternalServiceKind,
        ExternalServiceStore, Job, JobState, NewWebhook, RemoteWebhook, RemoteWebhookId, RepoId,
        RepoName, WebhookScope, WebhookUpdate,
    };
    use tokio::sync::Notify;

    use super::*;
    use crate::queue::InMemoryJobQueue;

    const SVC: ExternalServiceId = ExternalServiceId::new(1);

    struct Harness {
        queue: Arc<InMemoryJobQueue>,
        store: Arc<InMemoryExternalServiceStore>,
        metrics: ProvisioningMetrics,
        worker: Worker,
    }

    fn fast_config(concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency,
            poll_interval: Duration::from_millis(5),
            lease: Duration::from_secs(30),
            job_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::new(
                Duration::from_millis(5),
                Duration::from_millis(20),
                2.0,
                3,
            ),
            ..WorkerConfig::new(WorkerName::new("test-worker").unwrap())
        }
    }

    async fn harness(factory: Arc<dyn CodeHostClientFactory>, config: WorkerConfig) -> Harness {
        let store = Arc::new(InMemoryExternalServiceStore::new());
        store
            .upsert(ExternalService {
                id: SVC,
                kind: ExternalServiceKind::GitHub,
                display_name: "TestService".into(),
                config: r#"{"url":"https://ghe.sgdev.org","token":"t","webhooks":[{"org":"ghe.sgdev.org","secret":"secret"}]}"#.into(),
            })
            .await
            .unwrap();

        let mut registry = CodeHostRegistry::new();
        registry.register(factory);
        let metrics = ProvisioningMetrics::new(&Registry::new()).unwrap();
        let handler = WebhookBuildHandler::new(
            ConfigResolver::new(store.clone()),
            Arc::new(registry),
            "https://sourcegraph.example.com",
            metrics.clone(),
        );

        let queue = Arc::new(InMemoryJobQueue::new());
        let worker = Worker::new(queue.clone(), Arc::new(handler), metrics.clone(), config).unwrap();
        Harness {
            queue,
            store,
            metrics,
            worker,
        }
    }

    async fn fake_harness(config: WorkerConfig) -> (Harness, Arc<InMemoryCodeHost>) {
        let host = Arc::new(InMemoryCodeHost::new(ExternalServiceKind::GitHub));
        let harness = harness(Arc::new(InMemoryCodeHostFactory::new(host.clone())), config).await;
        (harness, host)
    }

    fn job(repo_id: i32) -> Job {
        Job::for_repository(
            RepoId::new(repo_id),
            RepoName::new(format!("ghe.sgdev.org/milton/repo{repo_id}")).unwrap(),
            SVC,
            ExternalServiceKind::GitHub,
        )
    }

    fn unavailable(retry_after: Option<Duration>) -> ProvisionError {
        ProvisionError::RemoteUnavailable {
            status: Some(502),
            message: "Bad Gateway".into(),
            retry_after,
        }
    }

    #[test]
    fn config_validation_rejects_zero_concurrency_and_short_lease() {
        let base = WorkerConfig::new(WorkerName::new("w").unwrap());
        assert!(base.validate().is_ok());
        assert!(WorkerConfig {
            concurrency: 0,
            ..base.clone()
        }
        .validate()
        .is_err());
        assert!(WorkerConfig {
            lease: Duration::from_secs(1),
            ..base
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn completes_jobs_and_settles() {
        let (h, host) = fake_harness(fast_config(2)).await;
        let a = h.queue.enqueue(job(1)).await.unwrap();
        let b = h.queue.enqueue(job(2)).await.unwrap();

        let summary = h
            .worker
            .run_until_settled(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 2);
        for id in [a, b] {
            let record = h.queue.get(id).await.unwrap();
            assert_eq!(record.state, JobState::Completed);
            assert_eq!(record.attempts, 1);
        }
        // Both repositories share one organization webhook.
        assert_eq!(
            host.webhooks(&WebhookScope::Organization("ghe.sgdev.org".into()))
                .len(),
            1
        );
        assert_eq!(h.metrics.job_count(JobOutcome::Completed), 2.0);
        assert_eq!(h.metrics.jobs_in_flight(), 0);
    }

    #[tokio::test]
    async fn retryable_failure_is_released_then_completed() {
        let (h, host) = fake_harness(fast_config(1)).await;
        host.fail_next(CodeHostOperation::List, unavailable(None));
        let id = h.queue.enqueue(job(1)).await.unwrap();

        let summary = h
            .worker
            .run_until_settled(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!((summary.retried, summary.completed), (1, 1));
        let record = h.queue.get(id).await.unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 2);
        assert_eq!(
            record.last_error.map(|e| e.kind),
            Some(ErrorKind::RemoteUnavailable)
        );
    }

    #[tokio::test]
    async fn release_honours_retry_after_over_backoff() {
        let (h, host) = fake_harness(fast_config(1)).await;
        host.fail_next(
            CodeHostOperation::List,
            unavailable(Some(Duration::from_secs(60))),
        );
        let id = h.queue.enqueue(job(1)).await.unwrap();
        let before = Timestamp::now();

        let report = h
            .worker
            .run_once(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.outcome, Ok(JobOutcome::Retried));
        let record = h.queue.get(id).await.unwrap();
        assert_eq!(record.state, JobState::Queued);
        assert!(record.next_eligible_at >= before.plus(Duration::from_secs(59)));
        assert!(h.worker.run_once(&CancellationToken::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_permanently() {
        let (h, host) = fake_harness(fast_config(1)).await;
        for _ in 0..3 {
            host.fail_next(CodeHostOperation::List, unavailable(None));
        }
        let id = h.queue.enqueue(job(1)).await.unwrap();

        let summary = h
            .worker
            .run_until_settled(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!((summary.retried, summary.failed_permanently), (2, 1));
        let record = h.queue.get(id).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts, 3);
        assert_eq!(h.queue.failed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let (h, _host) = fake_harness(fast_config(1)).await;
        h.store.delete(SVC);
        let id = h.queue.enqueue(job(1)).await.unwrap();

        let summary = h
            .worker
            .run_until_settled(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.failed_permanently, 1);
        let record = h.queue.get(id).await.unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(
            record.last_error.map(|e| e.kind),
            Some(ErrorKind::NotFound)
        );
        assert_eq!(h.metrics.job_count(JobOutcome::FailedPermanently), 1.0);
    }

    #[tokio::test]
    async fn cancelled_run_stops_claiming() {
        let (h, host) = fake_harness(fast_config(1)).await;
        h.queue.enqueue(job(1)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = h.worker.run(&cancel).await.unwrap();

        assert_eq!(summary, RunSummary::default());
        assert!(host.calls().is_empty());
        assert_eq!(h.queue.outstanding().await.unwrap(), 1);
    }

    /// A code host that records how many calls overlap.
    struct SlowHost {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowHost {
        async fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CodeHostClient for SlowHost {
        fn kind(&self) -> ExternalServiceKind {
            ExternalServiceKind::GitHub
        }

        fn scope_for(&self, job: &Job) -> WebhookScope {
            WebhookScope::Repository(job.repo_name().to_string())
        }

        async fn list_webhooks(
            &self,
            _scope: &WebhookScope,
        ) -> Result<Vec<RemoteWebhook>, ProvisionError> {
            self.enter().await;
            Ok(Vec::new())
        }

        async fn create_webhook(
            &self,
            _scope: &WebhookScope,
            webhook: &NewWebhook,
        ) -> Result<RemoteWebhook, ProvisionError> {
            Ok(RemoteWebhook {
                id: RemoteWebhookId::new("1").unwrap(),
                target_url: webhook.target_url.clone(),
                events: Default::default(),
                active: true,
                secret_configured: true,
            })
        }

        async fn update_webhook(
            &self,
            _scope: &WebhookScope,
            _id: &RemoteWebhookId,
            _update: &WebhookUpdate,
        ) -> Result<RemoteWebhook, ProvisionError> {
            unreachable!("no existing webhooks to update")
        }
    }

    struct SlowHostFactory(Arc<SlowHost>);

    impl CodeHostClientFactory for SlowHostFactory {
        fn kind(&self) -> ExternalServiceKind {
            ExternalServiceKind::GitHub
        }

        fn client(
            &self,
            _id: ExternalServiceId,
            _config: &ExternalServiceConfig,
        ) -> Result<Arc<dyn CodeHostClient>, ProvisionError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let host = Arc::new(SlowHost {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let h = harness(Arc::new(SlowHostFactory(host.clone())), fast_config(2)).await;
        for repo in 1..=6 {
            h.queue.enqueue(job(repo)).await.unwrap();
        }

        let summary = h
            .worker
            .run_until_settled(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 6);
        assert_eq!(host.peak.load(Ordering::SeqCst), 2);
    }

    /// A code host whose webhook creation never answers.
    #[derive(Default)]
    struct HangingCreateHost {
        creating: Notify,
    }

    #[async_trait]
    impl CodeHostClient for HangingCreateHost {
        fn kind(&self) -> ExternalServiceKind {
            ExternalServiceKind::GitHub
        }

        fn scope_for(&self, job: &Job) -> WebhookScope {
            WebhookScope::Repository(job.repo_name().to_string())
        }

        async fn list_webhooks(
            &self,
            _scope: &WebhookScope,
        ) -> Result<Vec<RemoteWebhook>, ProvisionError> {
            Ok(Vec::new())
        }

        async fn create_webhook(
            &self,
            _scope: &WebhookScope,
            _webhook: &NewWebhook,
        ) -> Result<RemoteWebhook, ProvisionError> {
            self.creating.notify_one();
            std::future::pending().await
        }

        async fn update_webhook(
            &self,
            _scope: &WebhookScope,
            _id: &RemoteWebhookId,
            _update: &WebhookUpdate,
        ) -> Result<RemoteWebhook, ProvisionError> {
            unreachable!("no existing webhooks to update")
        }
    }

    struct HangingCreateHostFactory(Arc<HangingCreateHost>);

    impl CodeHostClientFactory for HangingCreateHostFactory {
        fn kind(&self) -> ExternalServiceKind {
            ExternalServiceKind::GitHub
        }

        fn client(
            &self,
            _id: ExternalServiceId,
            _config: &ExternalServiceConfig,
        ) -> Result<Arc<dyn CodeHostClient>, ProvisionError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn job_timeout_during_create_releases_job_as_cancelled() {
        let host = Arc::new(HangingCreateHost::default());
        let config = WorkerConfig {
            job_timeout: Duration::from_millis(50),
            ..fast_config(1)
        };
        let h = harness(Arc::new(HangingCreateHostFactory(host)), config).await;
        let id = h.queue.enqueue(job(1)).await.unwrap();

        let report = h
            .worker
            .run_once(&CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.outcome, Ok(JobOutcome::Retried));
        let record = h.queue.get(id).await.unwrap();
        assert_eq!(record.state, JobState::Queued);
        assert!(record.lease.is_none());
        assert_eq!(
            record.last_error.map(|e| e.kind),
            Some(ErrorKind::Cancelled)
        );
    }

    #[tokio::test]
    async fn shutdown_timeout_cancels_stuck_jobs() {
        let host = Arc::new(HangingCreateHost::default());
        let config = WorkerConfig {
            shutdown_timeout: Duration::from_millis(50),
            ..fast_config(1)
        };
        let h = harness(Arc::new(HangingCreateHostFactory(host.clone())), config).await;
        let id = h.queue.enqueue(job(1)).await.unwrap();

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let worker = h.worker.clone();
            let cancel = cancel.clone();
            async move { worker.run(&cancel).await }
        });
        host.creating.notified().await;
        cancel.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("run should stop once the shutdown timeout elapses")
            .unwrap()
            .unwrap();

        assert_eq!(summary.retried, 1);
        let record = h.queue.get(id).await.unwrap();
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(
            record.last_error.map(|e| e.kind),
            Some(ErrorKind::Cancelled)
        );
        assert_eq!(h.metrics.jobs_in_flight(), 0);
    }
}
