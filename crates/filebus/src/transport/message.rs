//! Transport message envelope and serialization

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TransportError;

/// Well-known header names
pub mod headers {
    /// Unique message id
    pub const MESSAGE_ID: &str = "msg-id";
    /// Logical message type, used in log labels
    pub const MESSAGE_TYPE: &str = "msg-type";
    /// Maximum age before the message is discarded (`hh:mm:ss[.fff]` or seconds)
    pub const TIME_TO_BE_RECEIVED: &str = "time-to-be-received";
    /// RFC 3339 instant before which the message must not be delivered
    pub const DEFERRED_UNTIL: &str = "deferred-until";
}

/// A message as it travels through a queue: headers plus an opaque body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
}

impl TransportMessage {
    /// Create a message
    pub fn new(headers: BTreeMap<String, String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Add or replace a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the time-to-be-received header
    pub fn with_time_to_be_received(self, ttl: Duration) -> Self {
        self.with_header(headers::TIME_TO_BE_RECEIVED, format_time_span(ttl))
    }

    /// Set the deferred-until header
    pub fn with_deferred_until(self, due: DateTime<Utc>) -> Self {
        self.with_header(headers::DEFERRED_UNTIL, due.to_rfc3339())
    }

    /// Get a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The message id header, if present
    pub fn message_id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
    }

    /// Short human-readable identity for logs
    pub fn label(&self) -> String {
        match (self.header(headers::MESSAGE_TYPE), self.message_id()) {
            (Some(ty), Some(id)) => format!("{}/{}", ty, id),
            (None, Some(id)) => id.to_string(),
            (Some(ty), None) => format!("{}/<no id>", ty),
            (None, None) => "<no id>".to_string(),
        }
    }

    /// Parsed time-to-be-received header
    pub fn time_to_be_received(&self) -> Result<Option<Duration>, TransportError> {
        self.header(headers::TIME_TO_BE_RECEIVED)
            .map(|raw| {
                parse_time_span(raw).ok_or_else(|| TransportError::InvalidHeader {
                    header: headers::TIME_TO_BE_RECEIVED.to_string(),
                    value: raw.to_string(),
                })
            })
            .transpose()
    }

    /// Parsed deferred-until header
    pub fn deferred_until(&self) -> Result<Option<DateTime<Utc>>, TransportError> {
        self.header(headers::DEFERRED_UNTIL)
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|_| TransportError::InvalidHeader {
                        header: headers::DEFERRED_UNTIL.to_string(),
                        value: raw.to_string(),
                    })
            })
            .transpose()
    }
}

/// Parse `[d.]hh:mm[:ss[.fraction]]` or a plain number of seconds
pub fn parse_time_span(value: &str) -> Option<Duration> {
    let value = value.trim();

    let Some(colon) = value.find(':') else {
        return parse_seconds(value);
    };

    let (head, rest) = value.split_at(colon);
    let (days, hours) = match head.split_once('.') {
        Some((d, h)) => (d.parse::<u64>().ok()?, h.parse::<u64>().ok()?),
        None => (0, head.parse::<u64>().ok()?),
    };

    let mut parts = rest[1..].splitn(2, ':');
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds = match parts.next() {
        Some(s) => parse_seconds(s)?,
        None => Duration::ZERO,
    };
    if minutes >= 60 || seconds >= Duration::from_secs(60) || (days > 0 && hours >= 24) {
        return None;
    }

    let whole = days
        .checked_mul(86_400)?
        .checked_add(hours.checked_mul(3_600)?)?
        .checked_add(minutes * 60)?;
    Duration::from_secs(whole).checked_add(seconds)
}

/// `ss[.fraction]` with the fraction kept exact down to nanoseconds
fn parse_seconds(value: &str) -> Option<Duration> {
    let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let secs = if whole.is_empty() { 0 } else { whole.parse::<u64>().ok()? };
    let digits: String = fraction.chars().take(9).collect();
    let nanos = if digits.is_empty() {
        0
    } else {
        digits.parse::<u32>().ok()? * 10u32.pow(9 - digits.len() as u32)
    };
    Some(Duration::new(secs, nanos))
}

/// Format a duration as `[d.]hh:mm:ss[.fff]`
pub fn format_time_span(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, rem) = (total / 86_400, total % 86_400);
    let clock = format!("{:02}:{:02}:{:02}", rem / 3_600, (rem % 3_600) / 60, rem % 60);
    let millis = duration.subsec_millis();

    let mut formatted = if days > 0 {
        format!("{}.{}", days, clock)
    } else {
        clock
    };
    if millis > 0 {
        formatted.push_str(&format!(".{:03}", millis));
    }
    formatted
}

/// Turns messages into record bytes and back
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, message: &TransportMessage) -> Result<Vec<u8>, TransportError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<TransportMessage, TransportError>;
}

/// JSON envelope with a base64 body
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageSerializer;

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(&self, message: &TransportMessage) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(message).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<TransportMessage, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Serialization(e.to_string()))
    }
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
