//! Event canonicalization and fingerprinting.
//!
//! Reduces an event to a canonical record, serializes it with sorted keys and
//! digests it with SHA-256. The record depends on the configured
//! [`FingerprintScope`]:
//!
//! | Field | `identity_time` | `full_payload` |
//! |-------|-----------------|----------------|
//! | `event_name` | yes | yes |
//! | `subject_id` (client id, else user id, else empty) | yes | yes |
//! | `event_datetime` (RFC 3339 UTC) | yes | yes |
//! | `payload` | no | yes |

use crate::models::{Event, Fingerprint, FingerprintScope, LedgerEntry, OccurredAt};
use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Naive layouts, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y%m%d %H%M%S",
    "%d.%m.%Y %H:%M:%S",
];

/// Layouts carrying an explicit offset.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M:%S%:z"];

/// An event reduced to its deduplication identity.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent<'a> {
    /// The source event.
    pub event: &'a Event,
    /// Event name.
    pub name: &'a str,
    /// Effective subject identifier.
    pub subject_id: &'a str,
    /// Absolute occurrence instant.
    pub occurred_at: DateTime<Utc>,
}

impl CanonicalEvent<'_> {
    /// Stable textual form of the occurrence instant.
    #[must_use]
    pub fn normalized_time(&self) -> String {
        format_instant(self.occurred_at)
    }

    /// Builds the ledger row for this event.
    #[must_use]
    pub fn to_ledger_entry(
        &self,
        fingerprint: Fingerprint,
        inserted_at: DateTime<Utc>,
    ) -> LedgerEntry {
        LedgerEntry {
            fingerprint,
            client_id: self.event.client_id.clone().unwrap_or_default(),
            user_id: self.event.user_id.clone().unwrap_or_default(),
            event_name: self.name.to_string(),
            occurred_at: self.occurred_at,
            inserted_at,
        }
    }
}

/// Computes deterministic event fingerprints.
///
/// # Example
///
/// ```rust
/// use eventdedup::{Canonicalizer, Event};
///
/// let canonicalizer = Canonicalizer::default();
/// let a = Event::new("purchase", "2024-01-01T10:00:00Z").with_client_id("123");
/// let b = Event::new("purchase", "2024-01-01 12:00:00+02:00")
///     .with_client_id("123")
///     .with_attribute("amount", 10);
///
/// // Same instant, same subject, payload ignored by default.
/// assert_eq!(
///     canonicalizer.fingerprint(&a).unwrap(),
///     canonicalizer.fingerprint(&b).unwrap(),
/// );
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Canonicalizer {
    scope: FingerprintScope,
}

impl Canonicalizer {
    /// Creates a canonicalizer for the given scope.
    #[must_use]
    pub const fn new(scope: FingerprintScope) -> Self {
        Self { scope }
    }

    /// Returns the configured scope.
    #[must_use]
    pub const fn scope(&self) -> FingerprintScope {
        self.scope
    }

    /// Validates and normalizes an event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] if the name is missing or blank, or the
    /// occurrence time is missing or unparseable.
    pub fn canonicalize<'a>(&self, event: &'a Event) -> Result<CanonicalEvent<'a>> {
        let name = event
            .name()
            .ok_or_else(|| Error::MalformedEvent("missing event_name".to_string()))?;
        let raw_time = event
            .event_datetime
            .as_ref()
            .ok_or_else(|| Error::MalformedEvent("missing event_datetime".to_string()))?;
        let occurred_at = normalize_occurrence(raw_time)?;

        Ok(CanonicalEvent {
            event,
            name,
            subject_id: event.subject_id(),
            occurred_at,
        })
    }

    /// Computes the fingerprint of an event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEvent`] if the event cannot be canonicalized.
    pub fn fingerprint(&self, event: &Event) -> Result<Fingerprint> {
        let canonical = self.canonicalize(event)?;
        Ok(self.digest(&canonical))
    }

    /// Digests an already canonicalized event.
    #[must_use]
    pub fn digest(&self, canonical: &CanonicalEvent<'_>) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes(canonical));
        Fingerprint::from_digest(&hasher.finalize())
    }

    /// Serializes the canonical record with sorted keys.
    ///
    /// `serde_json::Map` is ordered by key, so nested payload objects are
    /// sorted as well.
    #[must_use]
    pub fn canonical_bytes(&self, canonical: &CanonicalEvent<'_>) -> Vec<u8> {
        let mut record = Map::new();
        record.insert("event_name".to_string(), Value::from(canonical.name));
        record.insert("subject_id".to_string(), Value::from(canonical.subject_id));
        record.insert(
            "event_datetime".to_string(),
            Value::from(canonical.normalized_time()),
        );
        if self.scope == FingerprintScope::FullPayload {
            let payload: Map<String, Value> = canonical
                .event
                .payload
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            record.insert("payload".to_string(), Value::Object(payload));
        }
        Value::Object(record).to_string().into_bytes()
    }
}

/// Converts any supported occurrence representation into a UTC instant.
///
/// # Errors
///
/// Returns [`Error::MalformedEvent`] for unsupported layouts, non-finite numbers
/// and out-of-range instants.
pub fn normalize_occurrence(raw: &OccurredAt) -> Result<DateTime<Utc>> {
    match raw {
        OccurredAt::Seconds(secs) => from_epoch_seconds(*secs, 0, raw),
        OccurredAt::FractionalSeconds(secs) => from_fractional_seconds(*secs, raw),
        OccurredAt::Text(text) => parse_text(text.trim()).ok_or_else(|| unsupported(raw)),
    }
}

/// Renders an instant in the stable fingerprint form.
///
/// RFC 3339, UTC with `Z`, shortest exact sub-second precision.
#[must_use]
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_text(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    if text.bytes().all(|b| b.is_ascii_digit()) {
        return text
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    }

    text.parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite())
        .and_then(fractional_to_instant)
}

fn from_epoch_seconds(secs: i64, nanos: u32, raw: &OccurredAt) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| unsupported(raw))
}

fn from_fractional_seconds(secs: f64, raw: &OccurredAt) -> Result<DateTime<Utc>> {
    if !secs.is_finite() {
        return Err(unsupported(raw));
    }
    fractional_to_instant(secs).ok_or_else(|| unsupported(raw))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn fractional_to_instant(secs: f64) -> Option<DateTime<Utc>> {
    // Microsecond rounding keeps float noise out of the fingerprint.
    let micros = (secs * 1_000_000.0).round();
    if micros.abs() > 9.0e18 {
        return None;
    }
    let micros = micros as i64;
    let whole = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}

fn unsupported(raw: &OccurredAt) -> Error {
    Error::MalformedEvent(format!("unsupported event_datetime: '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn event_at(time: impl Into<OccurredAt>) -> Event {
        Event::new("purchase", time).with_client_id("123")
    }

    #[test_case("2024-01-01T10:00:00Z" ; "rfc3339 zulu")]
    #[test_case("2024-01-01T12:00:00+02:00" ; "rfc3339 offset")]
    #[test_case("2024-01-01 10:00:00" ; "naive space")]
    #[test_case("2024-01-01T10:00:00" ; "naive t")]
    #[test_case("2024-01-01 10:00:00.000" ; "naive fraction zero")]
    #[test_case("20240101 100000" ; "compact")]
    #[test_case("01.01.2024 10:00:00" ; "dotted day first")]
    #[test_case("2024-01-01 11:00:00+0100" ; "offset without colon")]
    #[test_case("1704103200" ; "digit string epoch")]
    #[test_case("  2024-01-01T10:00:00Z  " ; "surrounding whitespace")]
    fn test_text_layouts_normalize_to_same_instant(text: &str) {
        let instant = normalize_occurrence(&OccurredAt::from(text)).unwrap();
        assert_eq!(format_instant(instant), "2024-01-01T10:00:00Z");
    }

    #[test]
    fn test_numeric_epoch() {
        let whole = normalize_occurrence(&OccurredAt::Seconds(1_704_103_200)).unwrap();
        let fractional =
            normalize_occurrence(&OccurredAt::FractionalSeconds(1_704_103_200.0)).unwrap();
        assert_eq!(whole, fractional);
        assert_eq!(format_instant(whole), "2024-01-01T10:00:00Z");
    }

    #[test]
    fn test_sub_second_precision_is_kept() {
        let instant =
            normalize_occurrence(&OccurredAt::FractionalSeconds(1_704_103_200.25)).unwrap();
        assert_eq!(format_instant(instant), "2024-01-01T10:00:00.250Z");
    }

    #[test_case(OccurredAt::from("yesterday") ; "words")]
    #[test_case(OccurredAt::from("") ; "empty")]
    #[test_case(OccurredAt::from("2024-13-01 10:00:00") ; "bad month")]
    #[test_case(OccurredAt::FractionalSeconds(f64::NAN) ; "nan")]
    #[test_case(OccurredAt::FractionalSeconds(f64::INFINITY) ; "infinity")]
    #[test_case(OccurredAt::Seconds(i64::MAX) ; "out of range")]
    fn test_unparseable_times_are_malformed(raw: OccurredAt) {
        let err = normalize_occurrence(&raw).unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(_)));
    }

    #[test]
    fn test_fingerprint_is_64_hex() {
        let fp = Canonicalizer::default()
            .fingerprint(&event_at("2024-01-01T10:00:00Z"))
            .unwrap();
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_equivalent_times_share_fingerprint() {
        let c = Canonicalizer::default();
        let a = c.fingerprint(&event_at("2024-01-01T10:00:00Z")).unwrap();
        let b = c.fingerprint(&event_at(1_704_103_200_i64)).unwrap();
        let d = c.fingerprint(&event_at("01.01.2024 10:00:00")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, d);
    }

    #[test]
    fn test_identity_scope_ignores_payload() {
        let c = Canonicalizer::default();
        let plain = event_at("2024-01-01T10:00:00Z");
        let rich = plain.clone().with_attribute("amount", 99);
        assert_eq!(c.fingerprint(&plain).unwrap(), c.fingerprint(&rich).unwrap());
    }

    #[test]
    fn test_full_payload_scope_includes_payload() {
        let c = Canonicalizer::new(FingerprintScope::FullPayload);
        let plain = event_at("2024-01-01T10:00:00Z");
        let rich = plain.clone().with_attribute("amount", 99);
        assert_ne!(c.fingerprint(&plain).unwrap(), c.fingerprint(&rich).unwrap());

        let identity = Canonicalizer::default();
        assert_ne!(
            c.fingerprint(&plain).unwrap(),
            identity.fingerprint(&plain).unwrap()
        );
    }

    #[test]
    fn test_sensitivity() {
        let c = Canonicalizer::default();
        let base = c.fingerprint(&event_at("2024-01-01T10:00:00Z")).unwrap();

        let renamed = Event::new("refund", "2024-01-01T10:00:00Z").with_client_id("123");
        let other_client = Event::new("purchase", "2024-01-01T10:00:00Z").with_client_id("456");
        let later = event_at("2024-01-01T10:00:01Z");

        assert_ne!(base, c.fingerprint(&renamed).unwrap());
        assert_ne!(base, c.fingerprint(&other_client).unwrap());
        assert_ne!(base, c.fingerprint(&later).unwrap());
    }

    #[test]
    fn test_client_and_user_with_same_value_collide() {
        // The subject is the effective identifier, not the field it came from.
        let c = Canonicalizer::default();
        let by_client = Event::new("view", "2024-01-01T00:00:00Z").with_client_id("7");
        let by_user = Event::new("view", "2024-01-01T00:00:00Z").with_user_id("7");
        assert_eq!(
            c.fingerprint(&by_client).unwrap(),
            c.fingerprint(&by_user).unwrap()
        );
    }

    #[test]
    fn test_missing_name_and_time() {
        let c = Canonicalizer::default();

        let mut no_name = event_at("2024-01-01T10:00:00Z");
        no_name.event_name = Some("   ".to_string());
        assert!(matches!(
            c.fingerprint(&no_name),
            Err(Error::MalformedEvent(msg)) if msg.contains("event_name")
        ));

        let mut no_time = event_at("2024-01-01T10:00:00Z");
        no_time.event_datetime = None;
        assert!(matches!(
            c.fingerprint(&no_time),
            Err(Error::MalformedEvent(msg)) if msg.contains("event_datetime")
        ));
    }

    #[test]
    fn test_canonical_bytes_sorted_keys() {
        let event = event_at("2024-01-01T10:00:00Z");
        let c = Canonicalizer::default();
        let canonical = c.canonicalize(&event).unwrap();
        let text = String::from_utf8(c.canonical_bytes(&canonical)).unwrap();
        assert_eq!(
            text,
            r#"{"event_datetime":"2024-01-01T10:00:00Z","event_name":"purchase","subject_id":"123"}"#
        );
    }

    #[test]
    fn test_ledger_entry_carries_identity() {
        let event = event_at("2024-01-01T10:00:00Z").with_user_id("u-1");
        let c = Canonicalizer::default();
        let canonical = c.canonicalize(&event).unwrap();
        let fp = c.digest(&canonical);
        let now = Utc::now();
        let entry = canonical.to_ledger_entry(fp.clone(), now);

        assert_eq!(entry.fingerprint, fp);
        assert_eq!(entry.client_id, "123");
        assert_eq!(entry.user_id, "u-1");
        assert_eq!(entry.event_name, "purchase");
        assert_eq!(entry.inserted_at, now);
        assert_eq!(entry.event_date().to_string(), "2024-01-01");
    }
}
