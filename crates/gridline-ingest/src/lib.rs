//! Gridline Ingest - decoding of delivered events
//!
//! Turns Azure Event Grid batches and CloudEvents v0.1 envelopes into core
//! [`Event`]s, and answers the Event Grid subscription validation handshake.

pub mod cloudevents;
pub mod error;
pub mod eventgrid;

use gridline_core::{names, Event};

pub use cloudevents::Envelope;
pub use error::{IngestError, Result};
pub use eventgrid::{EventGridEvent, ValidationResponse};

/// Outcome of decoding one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// Handshake: reply with the response, route nothing.
    Validation(ValidationResponse),
    Event(Event),
}

/// Decode an Event Grid delivery body.
pub fn ingest_eventgrid(body: &[u8]) -> Result<Ingested> {
    let ev = eventgrid::decode_batch(body)?;
    if ev.is_validation() {
        return Ok(Ingested::Validation(ev.validation_response()?));
    }
    Ok(Ingested::Event(ev.to_event()?))
}

/// Decode a CloudEvents delivery.
///
/// Event Grid still sends its validation event in its own format on this
/// route, so a body mentioning that event type is handled as the handshake.
pub fn ingest_cloudevents<'a, I>(headers: I, body: &[u8]) -> Result<Ingested>
where
    I: IntoIterator<Item = (&'a str, &'a str)> + Clone,
{
    if contains(body, names::SUBSCRIPTION_VALIDATION.as_bytes()) {
        let ev = eventgrid::decode_batch(body)?;
        return Ok(Ingested::Validation(ev.validation_response()?));
    }
    let envelope = Envelope::from_request(headers, body)?;
    Ok(Ingested::Event(envelope.to_event()?))
}

/// Check a delivery token against the project's. A project without a token
/// accepts any delivery.
pub fn verify_token(expected: Option<&str>, given: Option<&str>) -> Result<()> {
    match expected {
        Some(expected) if !expected.is_empty() && given != Some(expected) => {
            Err(IngestError::Forbidden)
        }
        _ => Ok(()),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_token() {
        assert!(verify_token(None, None).is_ok());
        assert!(verify_token(Some(""), Some("anything")).is_ok());
        assert!(verify_token(Some("s3cret"), Some("s3cret")).is_ok());
        assert!(matches!(
            verify_token(Some("s3cret"), None),
            Err(IngestError::Forbidden)
        ));
        assert!(matches!(
            verify_token(Some("s3cret"), Some("guess")),
            Err(IngestError::Forbidden)
        ));
    }

    #[test]
    fn test_contains() {
        assert!(contains(b"abcdef", b"cde"));
        assert!(!contains(b"abc", b"abcd"));
    }
}
