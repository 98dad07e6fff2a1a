//! CloudEvents v0.1 envelopes over HTTP.
//!
//! Structured mode carries the whole envelope as a JSON body with content
//! type [`CONTENT_TYPE`]. Binary mode carries the attributes in `CE-*`
//! headers and the data as the body.

use std::collections::BTreeMap;

use gridline_core::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{IngestError, Result};

/// Content type of a structured-mode body.
pub const CONTENT_TYPE: &str = "application/cloudevents+json";

/// Provider recorded on events decoded here.
pub const PROVIDER: &str = "cloudevents";

pub const CE_CLOUD_EVENTS_VERSION: &str = "CE-CloudEventsVersion";
pub const CE_EVENT_TYPE: &str = "CE-EventType";
pub const CE_EVENT_TYPE_VERSION: &str = "CE-EventTypeVersion";
pub const CE_EVENT_ID: &str = "CE-EventID";
pub const CE_SOURCE: &str = "CE-Source";
pub const CE_EVENT_TIME: &str = "CE-EventTime";

/// Headers with this prefix (any case) become extensions.
const EXTENSION_PREFIX: &str = "ce-x-";

/// The top-level event object. Attributes are kept as delivered; the data
/// is forwarded, not interpreted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Envelope {
    pub event_type: String,

    pub event_type_version: String,

    pub cloud_events_version: String,

    /// URI of the producer context.
    pub source: String,

    #[serde(rename = "eventID")]
    pub event_id: String,

    /// Kept as text, e.g. `2018-04-05T17:31:00Z`.
    pub event_time: String,

    /// MIME type of `data`.
    pub content_type: String,

    pub extensions: BTreeMap<String, Value>,

    pub data: Value,
}

impl Envelope {
    /// Decode a structured-mode body.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Build an envelope from binary-mode headers and body.
    ///
    /// Header names match case-insensitively; for repeated headers the first
    /// value wins. The body is parsed as a JSON object when the content type
    /// is JSON and kept as text otherwise.
    pub fn from_headers<'a, I>(headers: I, body: &[u8]) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut env = Envelope::default();

        for (name, value) in headers {
            if value.is_empty() {
                continue;
            }
            let lower = name.to_ascii_lowercase();
            if let Some(ext) = lower.strip_prefix(EXTENSION_PREFIX) {
                env.extensions
                    .entry(ext.to_string())
                    .or_insert_with(|| Value::String(value.to_string()));
                continue;
            }
            let field = match lower.as_str() {
                "ce-cloudeventsversion" => &mut env.cloud_events_version,
                "ce-eventtype" => &mut env.event_type,
                "ce-eventtypeversion" => &mut env.event_type_version,
                "ce-eventid" => &mut env.event_id,
                "ce-source" => &mut env.source,
                "ce-eventtime" => &mut env.event_time,
                "content-type" => &mut env.content_type,
                _ => continue,
            };
            if field.is_empty() {
                *field = value.to_string();
            }
        }

        env.data = if is_json(&env.content_type) {
            Value::Object(serde_json::from_slice::<Map<String, Value>>(body)?)
        } else {
            Value::String(String::from_utf8_lossy(body).into_owned())
        };
        Ok(env)
    }

    /// Pick structured or binary mode from the request's content type.
    pub fn from_request<'a, I>(headers: I, body: &[u8]) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)> + Clone,
    {
        let structured = headers
            .clone()
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .is_some_and(|(_, value)| value == CONTENT_TYPE);

        if structured {
            debug!("Decoding structured-mode envelope");
            Self::from_json(body)
        } else {
            debug!("Decoding binary-mode envelope");
            Self::from_headers(headers, body)
        }
    }

    /// Convert to a routable event. The payload is the re-encoded envelope.
    pub fn to_event(&self) -> Result<Event> {
        if self.event_type.is_empty() {
            return Err(IngestError::MissingEventType);
        }
        let payload = serde_json::to_vec(self)?;
        Ok(Event::new(self.event_type.as_str(), payload)
            .with_provider(PROVIDER)
            .with_revision("master", None))
    }
}

/// Whether a content type denotes JSON data. Parameters are ignored.
pub fn is_json(content_type: &str) -> bool {
    let media = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(media.as_str(), "application/json" | "text/json") || media.ends_with("+json")
}
