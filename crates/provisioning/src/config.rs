//! Resolution of an external service's stored connection document into an
//! [`ExternalServiceConfig`].

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::{
    ExternalServiceConfig, ExternalServiceId, ExternalServiceKind, ExternalServiceStore, OrgName,
    ProvisionError, RepoName, Secret, StoreError, WebhookDeclaration,
};

/// A resolved, validated external service.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedService {
    pub id: ExternalServiceId,
    pub kind: ExternalServiceKind,
    pub config: ExternalServiceConfig,
}

/// Reads external services through the store and parses their connection
/// documents.
///
/// Failure classification:
///
/// | Condition | Error |
/// |-----------|-------|
/// | row deleted | [`ProvisionError::NotFound`] |
/// | store down / contended | [`ProvisionError::ConfigUnavailable`] |
/// | document unparseable, no URL, webhook missing org/secret | [`ProvisionError::Malformed`] |
#[derive(Clone)]
pub struct ConfigResolver {
    store: Arc<dyn ExternalServiceStore>,
}

impl ConfigResolver {
    pub fn new(store: Arc<dyn ExternalServiceStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, id: ExternalServiceId) -> Result<ResolvedService, ProvisionError> {
        let service = self.store.get(id).await.map_err(|err| match err {
            StoreError::NotFound(id) => ProvisionError::NotFound { id },
            other => ProvisionError::ConfigUnavailable {
                id,
                message: other.to_string(),
            },
        })?;

        let config = parse_connection(id, service.kind, &service.config)?;
        debug!(
            ext_svc_id = %id,
            kind = %service.kind,
            webhooks = config.webhooks.len(),
            "resolved external service config"
        );
        Ok(ResolvedService {
            id,
            kind: service.kind,
            config,
        })
    }
}

// ---------------------------------------------------------------------------
// Connection document
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawConnection {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    repos: Vec<String>,
    #[serde(default)]
    webhooks: Vec<RawWebhook>,
}

#[derive(Deserialize)]
struct RawWebhook {
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    secret: Option<String>,
}

/// Parses a connection document of the given kind.
///
/// Unknown fields are ignored: connection documents carry many settings that
/// are irrelevant to webhook provisioning.
pub fn parse_connection(
    id: ExternalServiceId,
    kind: ExternalServiceKind,
    document: &str,
) -> Result<ExternalServiceConfig, ProvisionError> {
    let malformed = |message: String| ProvisionError::Malformed { id, message };

    let raw: RawConnection =
        serde_json::from_str(document).map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let url = raw
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| malformed("missing url".into()))?;
    parse_http_url(url.trim()).map_err(|e| malformed(format!("url '{url}': {e}")))?;

    let repos = raw
        .repos
        .into_iter()
        .filter_map(RepoName::new)
        .collect::<BTreeSet<_>>();

    let webhooks = raw
        .webhooks
        .into_iter()
        .enumerate()
        .map(|(index, hook)| {
            let org = hook
                .org
                .and_then(OrgName::new)
                .ok_or_else(|| malformed(format!("webhooks[{index}] is missing org")))?;
            let secret = hook
                .secret
                .filter(|s| !s.is_empty())
                .map(Secret::new)
                .ok_or_else(|| malformed(format!("webhooks[{index}] ({org}) is missing secret")))?;
            Ok(WebhookDeclaration { org, secret })
        })
        .collect::<Result<Vec<_>, ProvisionError>>()?;

    Ok(ExternalServiceConfig {
        kind,
        url: url.trim().trim_end_matches('/').to_owned(),
        token: Secret::new(raw.token.unwrap_or_default()),
        repos,
        webhooks,
    })
}

/// Parses `raw` as an absolute `http` or `https` URL with a host.
pub fn parse_http_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("scheme '{}' is not http(s)", url.scheme()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("no host".to_owned());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryExternalServiceStore;
    use crate::{ErrorKind, ExternalService};

    const ID: ExternalServiceId = ExternalServiceId::new(3);

    fn doc(webhooks: &str) -> String {
        format!(
            r#"{{"url":"https://ghe.sgdev.org/","token":"abc","repos":["ghe.sgdev.org/milton/test"],"webhooks":{webhooks}}}"#
        )
    }

    #[test]
    fn parses_declared_webhooks_in_order() {
        let config = parse_connection(
            ID,
            ExternalServiceKind::GitHub,
            &doc(r#"[{"org":"ghe.sgdev.org","secret":"secret"},{"org":"other","secret":"s2"}]"#),
        )
        .unwrap();

        assert_eq!(config.url, "https://ghe.sgdev.org");
        assert_eq!(config.token.expose(), "abc");
        assert_eq!(config.repos.len(), 1);
        let orgs: Vec<_> = config.webhooks.iter().map(|w| w.org.as_str()).collect();
        assert_eq!(orgs, ["ghe.sgdev.org", "other"]);
        assert_eq!(config.webhooks[0].secret.expose(), "secret");
    }

    #[test]
    fn webhook_without_secret_is_malformed() {
        let err = parse_connection(
            ID,
            ExternalServiceKind::GitHub,
            &doc(r#"[{"org":"ghe.sgdev.org"}]"#),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert!(err.to_string().contains("missing secret"), "{err}");
    }

    #[test]
    fn invalid_json_and_missing_url_are_malformed() {
        for document in [
            "{not json",
            r#"{"token":"abc"}"#,
            r#"{"url":"GITHUB"}"#,
            r#"{"url":"ftp://ghe.sgdev.org"}"#,
            r#"{"url":"https://"}"#,
            r#"{"url":"https://ghe.sgdev.org:99999"}"#,
        ] {
            let err = parse_connection(ID, ExternalServiceKind::GitHub, document).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Malformed, "{document}");
        }
    }

    #[test]
    fn http_url_keeps_host_apart_from_port_and_user_info() {
        let url = parse_http_url("https://admin@GHE.sgdev.org:8443/").unwrap();
        assert_eq!(url.host_str(), Some("ghe.sgdev.org"));
        assert_eq!(url.port(), Some(8443));
        assert!(parse_http_url("mailto:admin@ghe.sgdev.org").is_err());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let config = parse_connection(
            ID,
            ExternalServiceKind::GitHub,
            r#"{"url":"https://github.com","repositoryQuery":["none"],"orgs":["x"]}"#,
        )
        .unwrap();
        assert!(config.webhooks.is_empty());
        assert!(config.token.is_empty());
    }

    #[tokio::test]
    async fn deleted_service_resolves_to_not_found() {
        let store = Arc::new(InMemoryExternalServiceStore::new());
        let resolver = ConfigResolver::new(store);

        let err = resolver.resolve(ID).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.retry_policy().is_retryable());
    }

    #[tokio::test]
    async fn unavailable_store_is_retryable() {
        let store = Arc::new(InMemoryExternalServiceStore::new());
        store.set_unavailable(true);
        let resolver = ConfigResolver::new(store);

        let err = resolver.resolve(ID).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigUnavailable);
        assert!(err.retry_policy().is_retryable());
    }

    #[tokio::test]
    async fn resolves_stored_service() {
        let store = Arc::new(InMemoryExternalServiceStore::new());
        let stored = store
            .upsert(ExternalService {
                id: ID,
                kind: ExternalServiceKind::GitHub,
                display_name: "TestService".into(),
                config: doc(r#"[{"org":"ghe.sgdev.org","secret":"secret"}]"#),
            })
            .await
            .unwrap();
        let resolver = ConfigResolver::new(store);

        let resolved = resolver.resolve(stored.id).await.unwrap();
        assert_eq!(resolved.kind, ExternalServiceKind::GitHub);
        assert_eq!(resolved.config.webhooks.len(), 1);
    }
}
