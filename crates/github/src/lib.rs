//! GitHub infrastructure adapter.
//!
//! Implements [`provisioning::CodeHostClient`] and
//! [`provisioning::CodeHostClientFactory`] over the GitHub REST API
//! (github.com and GitHub Enterprise Server).
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules.
//! All GitHub API details (authentication headers, pagination, rate-limit
//! classification) are handled here; the [`provisioning`] crate only sees
//! [`provisioning::RemoteWebhook`]s and classified
//! [`provisioning::ProvisionError`]s.
//!
//! ## Endpoints
//!
//! | Scope | Endpoint |
//! |-------|----------|
//! | Organization | `/orgs/{org}/hooks` |
//! | Repository | `/repos/{owner}/{name}/hooks` |

mod client;
mod error;

pub use client::{api_base_for, GitHubClient, GitHubClientFactory};
pub use error::GitHubClientError;
