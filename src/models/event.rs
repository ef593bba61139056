//! Inbound event types.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Opaque, ordered event payload.
///
/// The core never inspects payload values; they only reach the fingerprint under
/// the `full_payload` scope.
pub type Payload = BTreeMap<String, Value>;

/// Occurrence time exactly as received on the wire.
///
/// Textual timestamps and numeric epoch seconds are both accepted; parsing into
/// an absolute instant is done by the canonicalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OccurredAt {
    /// Whole epoch seconds.
    Seconds(i64),
    /// Fractional epoch seconds.
    FractionalSeconds(f64),
    /// Any supported textual layout.
    Text(String),
}

impl From<&str> for OccurredAt {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for OccurredAt {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for OccurredAt {
    fn from(secs: i64) -> Self {
        Self::Seconds(secs)
    }
}

impl From<f64> for OccurredAt {
    fn from(secs: f64) -> Self {
        Self::FractionalSeconds(secs)
    }
}

impl fmt::Display for OccurredAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seconds(s) => write!(f, "{s}"),
            Self::FractionalSeconds(s) => write!(f, "{s}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// An immutable inbound event.
///
/// Unknown top-level fields are folded into [`Event::payload`] on
/// deserialization; an explicit `payload` key wins on conflicts.
///
/// # Example
///
/// ```rust
/// use eventdedup::Event;
///
/// let event: Event = serde_json::from_str(
///     r#"{"event_name":"purchase","event_datetime":"2024-01-01T10:00:00Z","client_id":123,"sku":"A-1"}"#,
/// ).unwrap();
///
/// assert_eq!(event.event_name.as_deref(), Some("purchase"));
/// assert_eq!(event.client_id.as_deref(), Some("123"));
/// assert!(event.payload.contains_key("sku"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEvent")]
pub struct Event {
    /// Event name. Required for fingerprinting.
    pub event_name: Option<String>,
    /// Occurrence time. Required for fingerprinting.
    pub event_datetime: Option<OccurredAt>,
    /// Client identifier, the preferred subject.
    pub client_id: Option<String>,
    /// User identifier, the fallback subject.
    pub user_id: Option<String>,
    /// Open-ended attributes.
    pub payload: Payload,
}

impl Event {
    /// Creates an event with a name and occurrence time.
    #[must_use]
    pub fn new(name: impl Into<String>, occurred_at: impl Into<OccurredAt>) -> Self {
        Self {
            event_name: Some(name.into()),
            event_datetime: Some(occurred_at.into()),
            client_id: None,
            user_id: None,
            payload: Payload::new(),
        }
    }

    /// Sets the client identifier.
    #[must_use]
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Sets the user identifier.
    #[must_use]
    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Adds a payload attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Parses an event from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedEvent`] if the value is not an event object.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        serde_json::from_value(value).map_err(|e| crate::Error::MalformedEvent(e.to_string()))
    }

    /// Returns the name, if present and not blank.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.event_name.as_deref().filter(|n| !n.trim().is_empty())
    }

    /// Returns the effective subject: client id, then user id, else empty.
    #[must_use]
    pub fn subject_id(&self) -> &str {
        non_blank(self.client_id.as_deref())
            .or_else(|| non_blank(self.user_id.as_deref()))
            .unwrap_or("")
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Wire shape with a catch-all for unknown fields.
#[derive(Deserialize)]
struct RawEvent {
    #[serde(default)]
    event_name: Option<String>,
    #[serde(default)]
    event_datetime: Option<OccurredAt>,
    #[serde(default, deserialize_with = "identifier")]
    client_id: Option<String>,
    #[serde(default, deserialize_with = "identifier")]
    user_id: Option<String>,
    #[serde(default)]
    payload: Payload,
    #[serde(flatten)]
    extra: Payload,
}

impl From<RawEvent> for Event {
    fn from(raw: RawEvent) -> Self {
        let mut payload = raw.extra;
        payload.extend(raw.payload);
        Self {
            event_name: raw.event_name,
            event_datetime: raw.event_datetime,
            client_id: raw.client_id,
            user_id: raw.user_id,
            payload,
        }
    }
}

/// Accepts identifiers sent as strings or numbers.
fn identifier<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}
