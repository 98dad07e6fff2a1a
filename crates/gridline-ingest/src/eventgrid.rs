//! Azure Event Grid delivery format.
//!
//! Event Grid posts a JSON array that holds a single event. Before it
//! delivers anything it sends a subscription validation event, which must be
//! answered by echoing its validation code.

use chrono::{DateTime, Utc};
use gridline_core::{names, Event};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{IngestError, Result};

/// Provider recorded on events decoded here.
pub const PROVIDER: &str = "eventgrid";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EventGridEvent {
    pub id: String,

    /// Resource path of the event source, filled in by Event Grid.
    pub topic: String,

    pub subject: String,

    /// Publisher specific payload.
    pub data: Value,

    pub event_type: String,

    pub event_time: Option<DateTime<Utc>>,

    pub metadata_version: String,

    pub data_version: String,
}

/// Body answering the subscription validation handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    pub validation_response: String,
}

/// Decode a delivery body and return its first event.
pub fn decode_batch(body: &[u8]) -> Result<EventGridEvent> {
    let events: Vec<EventGridEvent> = serde_json::from_slice(body)?;
    if events.len() > 1 {
        debug!(count = events.len(), "Batch holds more than one event, using the first");
    }
    events.into_iter().next().ok_or(IngestError::EmptyBatch)
}

impl EventGridEvent {
    pub fn is_validation(&self) -> bool {
        self.event_type == names::SUBSCRIPTION_VALIDATION
    }

    pub fn validation_response(&self) -> Result<ValidationResponse> {
        let code = self
            .data
            .get("validationCode")
            .and_then(Value::as_str)
            .ok_or(IngestError::MissingValidationCode)?;
        Ok(ValidationResponse {
            validation_response: code.to_string(),
        })
    }

    /// Convert to a routable event. The payload is the re-encoded event.
    pub fn to_event(&self) -> Result<Event> {
        if self.event_type.is_empty() {
            return Err(IngestError::MissingEventType);
        }
        let payload = serde_json::to_vec(self)?;
        Ok(Event::new(self.event_type.as_str(), payload)
            .with_provider(PROVIDER)
            .with_revision("master", Some("HEAD".to_string())))
    }
}
