//! GitHub REST client for organization and repository webhooks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use provisioning::{
    parse_http_url, CodeHostClient, CodeHostClientFactory, ExternalServiceConfig, ExternalServiceId,
    ExternalServiceKind, Job, NewWebhook, ProvisionError, RemoteWebhook, RemoteWebhookId, Secret,
    WebhookEvent, WebhookScope, WebhookUpdate,
};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, LINK, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::{classify_response, classify_transport, GitHubClientError};

const USER_AGENT_VALUE: &str = concat!("webhook-provisioner/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2022-11-28";
const PER_PAGE: u32 = 100;
/// Upper bound on followed `Link: rel="next"` pages per listing.
const MAX_PAGES: usize = 50;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HookResponse {
    id: u64,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    config: HookConfigResponse,
}

#[derive(Debug, Default, Deserialize)]
struct HookConfigResponse {
    #[serde(default)]
    url: Option<String>,
    /// GitHub masks the value (`"********"`) but includes the key when set.
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateHookRequest<'a> {
    name: &'static str,
    active: bool,
    events: Vec<&'static str>,
    config: HookConfigRequest<'a>,
}

#[derive(Debug, Serialize)]
struct HookConfigRequest<'a> {
    url: &'a str,
    content_type: &'static str,
    secret: &'a str,
    insecure_ssl: &'static str,
}

#[derive(Debug, Serialize)]
struct UpdateHookRequest {
    active: bool,
}

impl HookResponse {
    fn into_remote(self) -> Result<RemoteWebhook, ProvisionError> {
        let id = RemoteWebhookId::new(self.id.to_string()).ok_or_else(|| {
            ProvisionError::RemoteUnavailable {
                status: None,
                message: "webhook response carried an empty id".to_owned(),
                retry_after: None,
            }
        })?;
        Ok(RemoteWebhook {
            id,
            target_url: self.config.url.unwrap_or_default(),
            events: self.events.into_iter().collect::<BTreeSet<_>>(),
            active: self.active,
            secret_configured: self.config.secret.is_some_and(|s| !s.is_empty()),
        })
    }
}

fn event_name(event: WebhookEvent) -> &'static str {
    match event {
        WebhookEvent::Push => "push",
        WebhookEvent::PullRequest => "pull_request",
        WebhookEvent::Repository => "repository",
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A GitHub (or GitHub Enterprise) client bound to one connection's token.
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    /// Lower-cased host of the connection URL, e.g. `"ghe.sgdev.org"`.
    host: String,
    token: Secret,
}

impl GitHubClient {
    /// Creates a client that sends every request beneath `api_base`.
    ///
    /// `host` is the connection's instance host; it decides the webhook scope
    /// in [`CodeHostClient::scope_for`].
    pub fn new(
        http: reqwest::Client,
        api_base: impl Into<String>,
        host: impl Into<String>,
        token: Secret,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            host: host.into().to_ascii_lowercase(),
            token,
        }
    }

    fn hooks_url(&self, scope: &WebhookScope) -> String {
        match scope {
            WebhookScope::Organization(org) => format!("{}/orgs/{org}/hooks", self.api_base),
            WebhookScope::Repository(repo) => format!("{}/repos/{repo}/hooks", self.api_base),
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header(USER_AGENT, USER_AGENT_VALUE);
        if self.token.is_empty() {
            builder
        } else {
            builder.header(AUTHORIZATION, format!("Bearer {}", self.token.expose()))
        }
    }

    /// Sends `request`, classifying transport errors and non-2xx responses.
    async fn send(&self, request: RequestBuilder) -> Result<Response, ProvisionError> {
        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(classify_response(status, &headers, &body))
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, ProvisionError> {
        response.json::<T>().await.map_err(classify_transport)
    }
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("api_base", &self.api_base)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CodeHostClient for GitHubClient {
    fn kind(&self) -> ExternalServiceKind {
        ExternalServiceKind::GitHub
    }

    /// Repository names are `host/owner/name`. When the job's organization
    /// key is the instance host itself, the declaration covers the whole
    /// instance and webhooks are installed per repository; otherwise the key
    /// names a GitHub organization.
    fn scope_for(&self, job: &Job) -> WebhookScope {
        let org = job.org().as_str();
        if org.eq_ignore_ascii_case(&self.host) {
            let repo = job.repo_name();
            WebhookScope::Repository(repo.path_after_host().unwrap_or(repo.as_str()).to_owned())
        } else {
            WebhookScope::Organization(org.to_owned())
        }
    }

    async fn list_webhooks(
        &self,
        scope: &WebhookScope,
    ) -> Result<Vec<RemoteWebhook>, ProvisionError> {
        let mut hooks = Vec::new();
        let mut url = format!("{}?per_page={PER_PAGE}", self.hooks_url(scope));

        for page in 1..=MAX_PAGES {
            debug!(%scope, page, "listing GitHub webhooks");
            let response = self.send(self.request(Method::GET, &url)).await?;
            let next = next_link(response.headers());
            let batch: Vec<HookResponse> = Self::decode(response).await?;
            for hook in batch {
                hooks.push(hook.into_remote()?);
            }

            match next {
                Some(next) => url = next,
                None => return Ok(hooks),
            }
        }
        warn!(%scope, max_pages = MAX_PAGES, "webhook listing exceeds page limit");
        Err(ProvisionError::RemoteUnavailable {
            status: None,
            message: format!("webhook listing for {scope} exceeds {MAX_PAGES} pages"),
            retry_after: None,
        })
    }

    async fn create_webhook(
        &self,
        scope: &WebhookScope,
        webhook: &NewWebhook,
    ) -> Result<RemoteWebhook, ProvisionError> {
        let body = CreateHookRequest {
            name: "web",
            active: true,
            events: webhook.events.iter().copied().map(event_name).collect(),
            config: HookConfigRequest {
                url: &webhook.target_url,
                content_type: "json",
                secret: webhook.secret.expose(),
                insecure_ssl: "0",
            },
        };
        debug!(%scope, target_url = %webhook.target_url, "creating GitHub webhook");
        let response = self
            .send(self.request(Method::POST, &self.hooks_url(scope)).json(&body))
            .await?;
        let hook: HookResponse = Self::decode(response).await?;
        hook.into_remote()
    }

    async fn update_webhook(
        &self,
        scope: &WebhookScope,
        id: &RemoteWebhookId,
        update: &WebhookUpdate,
    ) -> Result<RemoteWebhook, ProvisionError> {
        let url = format!("{}/{id}", self.hooks_url(scope));
        debug!(%scope, webhook_id = %id, active = update.active, "updating GitHub webhook");
        let response = self
            .send(
                self.request(Method::PATCH, &url)
                    .json(&UpdateHookRequest {
                        active: update.active,
                    }),
            )
            .await?;
        let hook: HookResponse = Self::decode(response).await?;
        hook.into_remote()
    }
}

/// Extracts the `rel="next"` target of a `Link` header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| p.trim().eq_ignore_ascii_case(r#"rel="next""#));
        is_next.then(|| {
            target
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_owned()
        })
    })
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds [`GitHubClient`]s for GitHub connections, sharing one HTTP pool.
#[derive(Clone)]
pub struct GitHubClientFactory {
    http: reqwest::Client,
    api_base_override: Option<String>,
}

impl GitHubClientFactory {
    /// Creates a factory with its own HTTP client.
    pub fn new() -> Result<Self, GitHubClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_http_client(http))
    }

    /// Creates a factory whose clients share `http`.
    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self {
            http,
            api_base_override: None,
        }
    }

    /// Sends every request to `api_base` instead of the URL derived from the
    /// connection (used to point clients at a proxy or a replay server).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base_override = Some(api_base.into());
        self
    }
}

impl CodeHostClientFactory for GitHubClientFactory {
    fn kind(&self) -> ExternalServiceKind {
        ExternalServiceKind::GitHub
    }

    fn client(
        &self,
        id: ExternalServiceId,
        config: &ExternalServiceConfig,
    ) -> Result<Arc<dyn CodeHostClient>, ProvisionError> {
        let url = parse_http_url(&config.url).map_err(|message| ProvisionError::Malformed {
            id,
            message: format!("url '{}': {message}", config.url),
        })?;
        let host = host_of(&url);
        let api_base = match &self.api_base_override {
            Some(base) => base.clone(),
            None => api_base_for(&url),
        };
        Ok(Arc::new(GitHubClient::new(
            self.http.clone(),
            api_base,
            host,
            config.token.clone(),
        )))
    }
}

/// `https://api.github.com` for github.com, `{url}/api/v3` for Enterprise.
///
/// Credentials embedded in `url` are dropped.
pub fn api_base_for(url: &Url) -> String {
    let host = host_of(url);
    if host == "github.com" || host == "www.github.com" {
        return "https://api.github.com".to_owned();
    }
    format!(
        "{}{}/api/v3",
        url.origin().ascii_serialization(),
        url.path().trim_end_matches('/')
    )
}

/// The lower-cased host name, without port or user info.
fn host_of(url: &Url) -> String {
    url.host_str().unwrap_or_default().to_ascii_lowercase()
}
