//! Classification of GitHub REST failures into [`ProvisionError`]s.
//!
//! | Response | Classification |
//! |----------|----------------|
//! | 429, or 403 with an exhausted rate limit / rate-limit message | `RemoteUnavailable` with `retry_after` |
//! | 401, other 403 | `Unauthorized` |
//! | 404 on a hooks endpoint | `Unauthorized` (GitHub hides hooks from tokens without admin scope) |
//! | 422 "already exists" | `AlreadyExists` |
//! | 5xx, transport errors, undecodable success bodies | `RemoteUnavailable` |
//! | other 4xx | `Rejected` |

use std::time::Duration;

use provisioning::ProvisionError;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Errors building a GitHub client.
#[derive(Debug, Error)]
pub enum GitHubClientError {
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

impl ErrorBody {
    /// The top-level message followed by every detail message.
    fn describe(&self) -> String {
        let mut parts: Vec<&str> = self.message.iter().map(String::as_str).collect();
        parts.extend(self.errors.iter().filter_map(|e| e.message.as_deref()));
        if parts.is_empty() {
            "no error message".to_owned()
        } else {
            parts.join("; ")
        }
    }
}

/// Classifies a non-success response.
pub(crate) fn classify_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> ProvisionError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed.describe();
    let code = status.as_u16();

    if code == 429 || (code == 403 && is_rate_limited(headers, &message)) {
        return ProvisionError::RemoteUnavailable {
            status: Some(code),
            message,
            retry_after: retry_after(headers),
        };
    }

    match code {
        401 | 403 => ProvisionError::Unauthorized {
            status: code,
            message,
        },
        404 => ProvisionError::Unauthorized {
            status: code,
            message: format!(
                "{message} (GitHub returns 404 for hooks the token cannot administer)"
            ),
        },
        422 if message.to_lowercase().contains("already exists") => {
            ProvisionError::AlreadyExists { message }
        }
        500..=599 => ProvisionError::RemoteUnavailable {
            status: Some(code),
            message,
            retry_after: retry_after(headers),
        },
        _ => ProvisionError::Rejected {
            status: code,
            message,
        },
    }
}

/// Classifies a failure to send the request or read the response.
pub(crate) fn classify_transport(err: reqwest::Error) -> ProvisionError {
    ProvisionError::RemoteUnavailable {
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
        retry_after: None,
    }
}

fn is_rate_limited(headers: &HeaderMap, message: &str) -> bool {
    let exhausted = header_u64(headers, "x-ratelimit-remaining") == Some(0);
    let message = message.to_lowercase();
    exhausted
        || headers.contains_key("retry-after")
        || message.contains("rate limit")
        || message.contains("abuse detection")
}

/// The delay GitHub asked for: `Retry-After` seconds, else the time until
/// `x-ratelimit-reset` when the limit is exhausted.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = header_u64(headers, "retry-after") {
        return Some(Duration::from_secs(secs));
    }
    if header_u64(headers, "x-ratelimit-remaining") != Some(0) {
        return None;
    }
    let reset = header_u64(headers, "x-ratelimit-reset")?;
    let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
    Some(Duration::from_secs(reset.saturating_sub(now)))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
