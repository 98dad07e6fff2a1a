//! Events and the project context they are delivered with.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;

/// Event names observed from the delivery transport.
pub mod names {
    pub const BLOB_CREATED: &str = "Microsoft.Storage.BlobCreated";
    pub const BLOB_DELETED: &str = "Microsoft.Storage.BlobDeleted";
    pub const SUBSCRIPTION_VALIDATION: &str = "Microsoft.EventGrid.SubscriptionValidationEvent";
    /// Generic execution trigger.
    pub const EXEC: &str = "exec";
    pub const CHECK_SUITE_REQUESTED: &str = "check_suite:requested";
    pub const CHECK_SUITE_REREQUESTED: &str = "check_suite:rerequested";
    pub const CHECK_RUN_REREQUESTED: &str = "check_run:rerequested";
}

/// Source revision an event refers to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Revision {
    #[serde(rename = "ref")]
    pub reference: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// A named event with an opaque payload.
///
/// Handlers receive events behind an `Arc`, so an event cannot change once
/// it has been dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event type name used for routing.
    pub name: String,

    /// Raw payload as delivered.
    pub payload: Vec<u8>,

    /// Gateway that produced the event (e.g. "eventgrid").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            provider: None,
            revision: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_revision(mut self, reference: impl Into<String>, commit: Option<String>) -> Self {
        self.revision = Some(Revision {
            reference: reference.into(),
            commit,
        });
        self
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Deterministic digest of name and payload, used to correlate log lines.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(&self.payload);
        hex::encode(hasher.finalize())
    }

    /// Short digest (first 12 chars)
    pub fn short_digest(&self) -> String {
        self.digest()[..12].to_string()
    }
}

/// Source repository under test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: String,

    /// Repository name, e.g. "org/service".
    pub repo_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_url: Option<String>,
}

impl Project {
    pub fn new(id: impl Into<String>, repo_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            repo_name: repo_name.into(),
            clone_url: None,
        }
    }
}
