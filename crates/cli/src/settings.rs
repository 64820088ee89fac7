//! Worker settings.
//!
//! Load order (later sources override earlier ones):
//! 1. The TOML file named by `WEBHOOK_WORKER_CONFIG`
//!    (default `config/webhook-worker.toml`, optional)
//! 2. Environment variables `WEBHOOK_WORKER__SECTION__KEY`

use std::collections::HashSet;
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use provisioning::{
    parse_http_url, ExternalService, ExternalServiceId, ExternalServiceKind, WorkerName,
};
use serde::Deserialize;
use thiserror::Error;
use worker::{BackoffConfig, WorkerConfig};

pub const CONFIG_PATH_VAR: &str = "WEBHOOK_WORKER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/webhook-worker.toml";
const ENV_PREFIX: &str = "WEBHOOK_WORKER";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    pub callback: CallbackSettings,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub github: GitHubSettings,
    #[serde(default)]
    pub external_services: Vec<ExternalServiceSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackSettings {
    /// Public base URL of the platform; webhooks deliver beneath it.
    pub external_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub name: String,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub lease_secs: u64,
    pub job_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            name: "webhook-worker".into(),
            concurrency: 4,
            poll_interval_ms: 500,
            lease_secs: 300,
            job_timeout_secs: 120,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    /// OTLP gRPC endpoint; spans are exported only when set.
    pub otlp_endpoint: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Json,
            otlp_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GitHubSettings {
    /// Overrides the API base derived from each connection URL.
    pub api_base: Option<String>,
}

/// One external-service row seeded into the store at start-up.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalServiceSettings {
    pub id: i64,
    pub kind: ExternalServiceKind,
    pub display_name: String,
    /// The JSON connection document.
    pub config: String,
}

impl ExternalServiceSettings {
    pub fn to_external_service(&self) -> ExternalService {
        ExternalService {
            id: ExternalServiceId::new(self.id),
            kind: self.kind,
            display_name: self.display_name.clone(),
            config: self.config.clone(),
        }
    }
}

impl WorkerSettings {
    /// Loads settings from the configured file and the environment.
    pub fn load() -> Result<Self, SettingsError> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let builder = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        Self::from_builder(builder)
    }

    /// Parses settings from a TOML document, for tests and embedded defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self, SettingsError> {
        Self::from_builder(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, SettingsError> {
        let settings: Self = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |message: String| Err(SettingsError::Invalid(message));

        let url = self.callback.external_url.trim();
        if let Err(reason) = parse_http_url(url) {
            return invalid(format!(
                "callback.external_url '{url}' must be an http(s) URL: {reason}"
            ));
        }
        if let Some(api_base) = &self.github.api_base {
            if let Err(reason) = parse_http_url(api_base) {
                return invalid(format!("github.api_base '{api_base}' is invalid: {reason}"));
            }
        }
        if self.worker.name.trim().is_empty() {
            return invalid("worker.name must not be empty".into());
        }
        if self.backoff.multiplier < 1.0 {
            return invalid(format!(
                "backoff.multiplier must be at least 1.0, got {}",
                self.backoff.multiplier
            ));
        }
        if self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            return invalid("backoff.initial_delay_ms exceeds backoff.max_delay_ms".into());
        }

        let mut ids = HashSet::new();
        for service in &self.external_services {
            if !ids.insert(service.id) {
                return invalid(format!("external service id {} is duplicated", service.id));
            }
        }

        self.worker_config()
            .and_then(|config| config.validate().map_err(|e| SettingsError::Invalid(e.to_string())))
    }

    pub fn worker_config(&self) -> Result<WorkerConfig, SettingsError> {
        let name = WorkerName::new(self.worker.name.trim())
            .ok_or_else(|| SettingsError::Invalid("worker.name must not be empty".into()))?;
        Ok(WorkerConfig {
            name,
            concurrency: self.worker.concurrency,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            lease: Duration::from_secs(self.worker.lease_secs),
            job_timeout: Duration::from_secs(self.worker.job_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.worker.shutdown_timeout_secs),
            backoff: BackoffConfig::new(
                Duration::from_millis(self.backoff.initial_delay_ms),
                Duration::from_millis(self.backoff.max_delay_ms),
                self.backoff.multiplier,
                self.backoff.max_attempts,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [callback]
        external_url = "https://sourcegraph.example.com"
    "#;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let settings = WorkerSettings::from_toml_str(MINIMAL).unwrap();
        let config = settings.worker_config().unwrap();

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.lease, Duration::from_secs(300));
        assert_eq!(config.backoff.max_attempts, 5);
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert!(settings.external_services.is_empty());
    }

    #[test]
    fn external_services_parse_with_upper_case_kind() {
        let toml = format!(
            r#"{MINIMAL}
            [logging]
            format = "pretty"

            [[external_services]]
            id = 1
            kind = "GITHUB"
            display_name = "TestService"
            config = '{{"url":"https://ghe.sgdev.org","token":"t","repos":["ghe.sgdev.org/milton/test"]}}'
            "#
        );

        let settings = WorkerSettings::from_toml_str(&toml).unwrap();

        assert_eq!(settings.logging.format, LogFormat::Pretty);
        let service = settings.external_services[0].to_external_service();
        assert_eq!(service.kind, ExternalServiceKind::GitHub);
        assert_eq!(service.id, ExternalServiceId::new(1));
    }

    #[test]
    fn missing_callback_is_rejected() {
        let err = WorkerSettings::from_toml_str("[worker]\nconcurrency = 2\n").unwrap_err();
        assert!(matches!(err, SettingsError::Load(_)), "{err}");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for extra in [
            "[worker]\nconcurrency = 0",
            "[worker]\nlease_secs = 10\njob_timeout_secs = 60",
            "[backoff]\nmultiplier = 0.5",
            "[backoff]\nmax_attempts = 0",
        ] {
            let toml = format!("{MINIMAL}\n{extra}\n");
            let err = WorkerSettings::from_toml_str(&toml).unwrap_err();
            assert!(matches!(err, SettingsError::Invalid(_)), "{extra}: {err}");
        }
    }

    #[test]
    fn non_http_callback_is_rejected() {
        for url in ["sourcegraph.example.com", "https://", "ftp://sourcegraph.example.com"] {
            let err = WorkerSettings::from_toml_str(&format!(
                "[callback]\nexternal_url = \"{url}\"\n"
            ))
            .unwrap_err();
            assert!(err.to_string().contains("http(s)"), "{url}: {err}");
        }
    }

    #[test]
    fn invalid_api_base_is_rejected() {
        let toml = format!("{MINIMAL}\n[github]\napi_base = \"localhost:9000\"\n");
        let err = WorkerSettings::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("github.api_base"), "{err}");
    }

    #[test]
    fn duplicate_service_ids_are_rejected() {
        let service = r#"
            [[external_services]]
            id = 7
            kind = "github"
            display_name = "a"
            config = "{}"
        "#;
        let toml = format!("{MINIMAL}{service}{service}");
        let err = WorkerSettings::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("duplicated"));
    }
}
