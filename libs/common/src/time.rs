//! Timestamp formatting shared by every outbound payload.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serializer;

/// Formats a timestamp as ISO-8601 UTC with millisecond precision
/// (`2025-06-01T12:00:00.000Z`).
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `serialize_with` adapter for `DateTime<Utc>` fields.
pub fn serialize_iso<S>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&iso_timestamp(*at))
}
