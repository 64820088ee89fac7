//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging a [`RepoId`]
//! with an [`ExternalServiceId`] even though both are integers under the hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for integer-wrapped newtypes (platform database identities).
// Generates: struct (Copy), new(), get(), Display.
// ---------------------------------------------------------------------------
macro_rules! int_id {
    (
        $(#[$attr:meta])*
        $name:ident($inner:ty)
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name($inner);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub fn get(self) -> $inner {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: platform-integer-backed
// ---------------------------------------------------------------------------

int_id! {
    /// Identifies a repository row in the platform's repo store.
    RepoId(i32)
}

int_id! {
    /// Identifies an external service (one stored code-host connection).
    ExternalServiceId(i64)
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a persisted provisioning job record in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a new random job identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`JobId`] from an existing UUID (e.g. read back from storage).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed
// ---------------------------------------------------------------------------

string_id! {
    /// A platform repository name in `"host/owner/name"` form
    /// (e.g. `"ghe.sgdev.org/milton/test"`).
    RepoName
}

impl RepoName {
    /// Returns the first path segment, which is the code host's hostname
    /// under the platform's naming convention.
    pub fn first_segment(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    /// Returns the organization key derived from this name: the first path
    /// segment, or the whole name when that segment is empty.
    pub fn org(&self) -> OrgName {
        match self.first_segment() {
            "" => OrgName(self.0.clone()),
            segment => OrgName(segment.to_owned()),
        }
    }

    /// Returns everything after the first path segment (`"owner/name"`),
    /// or `None` if the name has a single segment.
    pub fn path_after_host(&self) -> Option<&str> {
        self.0
            .split_once('/')
            .map(|(_, rest)| rest)
            .filter(|rest| !rest.is_empty())
    }
}

string_id! {
    /// An organization key, matched against the `org` of declared webhooks.
    OrgName
}

string_id! {
    /// The code host's own identifier for a webhook. Opaque to the domain.
    RemoteWebhookId
}

string_id! {
    /// Names one worker instance in lease records and logs.
    WorkerName
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_name_segments() {
        let name = RepoName::new("ghe.sgdev.org/milton/test").unwrap();
        assert_eq!(name.first_segment(), "ghe.sgdev.org");
        assert_eq!(name.path_after_host(), Some("milton/test"));
        assert_eq!(name.org().as_str(), "ghe.sgdev.org");
    }

    #[test]
    fn single_segment_repo_name_has_no_path() {
        let name = RepoName::new("localhost").unwrap();
        assert_eq!(name.first_segment(), "localhost");
        assert_eq!(name.path_after_host(), None);
    }

    #[test]
    fn empty_string_ids_are_rejected() {
        assert!(OrgName::new("").is_none());
        assert!(RemoteWebhookId::new("").is_none());
    }

    #[test]
    fn int_ids_serialize_transparently() {
        let id = ExternalServiceId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
    }
}
