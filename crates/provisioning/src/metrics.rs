//! Prometheus metrics for webhook provisioning.
//!
//! Metrics are registered on a [`Registry`] constructed by the composition
//! root and handed to each component that records them. Nothing here is a
//! process-global.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `webhook_provisioning_handle_total` | Counter | `outcome` |
//! | `webhook_provisioning_handle_duration_seconds` | Histogram | `outcome` |
//! | `webhook_provisioning_code_host_requests_total` | Counter | `kind`, `operation`, `outcome` |
//! | `webhook_provisioning_code_host_request_duration_seconds` | Histogram | `kind`, `operation` |
//! | `webhook_provisioning_jobs_total` | Counter | `outcome` |
//! | `webhook_provisioning_jobs_in_flight` | Gauge | |

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Buckets for handler and code-host latency (seconds).
pub const LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Worker-loop outcome of one job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried,
    FailedPermanently,
}

impl JobOutcome {
    fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Retried => "retried",
            JobOutcome::FailedPermanently => "failed_permanently",
        }
    }
}

/// All provisioning metrics. Cheap to clone; clones share the same series.
#[derive(Clone)]
pub struct ProvisioningMetrics {
    handle_total: CounterVec,
    handle_duration: HistogramVec,
    code_host_requests_total: CounterVec,
    code_host_request_duration: HistogramVec,
    jobs_total: CounterVec,
    jobs_in_flight: IntGauge,
}

impl ProvisioningMetrics {
    /// Creates the metric families and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Fails if a family with the same name is already registered.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let handle_total = CounterVec::new(
            Opts::new(
                "webhook_provisioning_handle_total",
                "Webhook build handler invocations by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(handle_total.clone()))?;

        let handle_duration = HistogramVec::new(
            HistogramOpts::new(
                "webhook_provisioning_handle_duration_seconds",
                "Duration of one webhook build handler invocation",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["outcome"],
        )?;
        registry.register(Box::new(handle_duration.clone()))?;

        let code_host_requests_total = CounterVec::new(
            Opts::new(
                "webhook_provisioning_code_host_requests_total",
                "Code-host webhook API calls by operation and outcome",
            ),
            &["kind", "operation", "outcome"],
        )?;
        registry.register(Box::new(code_host_requests_total.clone()))?;

        let code_host_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "webhook_provisioning_code_host_request_duration_seconds",
                "Latency of code-host webhook API calls",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["kind", "operation"],
        )?;
        registry.register(Box::new(code_host_request_duration.clone()))?;

        let jobs_total = CounterVec::new(
            Opts::new(
                "webhook_provisioning_jobs_total",
                "Job attempts finished by the worker loop, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(jobs_total.clone()))?;

        let jobs_in_flight = IntGauge::new(
            "webhook_provisioning_jobs_in_flight",
            "Jobs currently being handled",
        )?;
        registry.register(Box::new(jobs_in_flight.clone()))?;

        Ok(Self {
            handle_total,
            handle_duration,
            code_host_requests_total,
            code_host_request_duration,
            jobs_total,
            jobs_in_flight,
        })
    }

    /// Records one handler invocation. `outcome` is a
    /// [`crate::Provisioned`] or [`crate::ErrorKind`] label.
    pub fn record_handle(&self, outcome: &str, duration_secs: f64) {
        self.handle_total.with_label_values(&[outcome]).inc();
        self.handle_duration
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }

    pub fn record_code_host_request(
        &self,
        kind: &str,
        operation: &str,
        outcome: &str,
        duration_secs: f64,
    ) {
        self.code_host_requests_total
            .with_label_values(&[kind, operation, outcome])
            .inc();
        self.code_host_request_duration
            .with_label_values(&[kind, operation])
            .observe(duration_secs);
    }

    pub fn record_job(&self, outcome: JobOutcome) {
        self.jobs_total.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn job_started(&self) {
        self.jobs_in_flight.inc();
    }

    pub fn job_finished(&self) {
        self.jobs_in_flight.dec();
    }

    /// Current value of `webhook_provisioning_handle_total{outcome}`.
    pub fn handle_count(&self, outcome: &str) -> f64 {
        self.handle_total.with_label_values(&[outcome]).get()
    }

    /// Current value of `webhook_provisioning_jobs_total{outcome}`.
    pub fn job_count(&self, outcome: JobOutcome) -> f64 {
        self.jobs_total.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn jobs_in_flight(&self) -> i64 {
        self.jobs_in_flight.get()
    }
}

/// Encodes every family in `registry` in the Prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<String, MetricsError> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_once_per_registry() {
        let registry = Registry::new();
        assert!(ProvisioningMetrics::new(&registry).is_ok());
        assert!(matches!(
            ProvisioningMetrics::new(&registry),
            Err(MetricsError::RegistrationFailed(_))
        ));
    }

    #[test]
    fn separate_registries_are_independent() {
        let a = ProvisioningMetrics::new(&Registry::new()).unwrap();
        let b = ProvisioningMetrics::new(&Registry::new()).unwrap();
        a.record_handle("created", 0.2);
        assert_eq!(a.handle_count("created"), 1.0);
        assert_eq!(b.handle_count("created"), 0.0);
    }

    #[test]
    fn encodes_recorded_series() {
        let registry = Registry::new();
        let metrics = ProvisioningMetrics::new(&registry).unwrap();
        metrics.record_code_host_request("GITHUB", "list_webhooks", "ok", 0.03);
        metrics.record_job(JobOutcome::Retried);

        let text = encode_text(&registry).unwrap();
        assert!(text.contains("webhook_provisioning_code_host_requests_total"));
        assert!(text.contains(r#"operation="list_webhooks""#));
        assert!(text.contains(r#"webhook_provisioning_jobs_total{outcome="retried"} 1"#));
    }
}
