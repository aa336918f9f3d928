//! Duration parsing and serde codecs shared across the Chengis workspace.
//!
//! Durations in pipeline definitions and config files are accepted either as
//! a human-readable string (`"30s"`, `"5m"`) or as a raw millisecond count,
//! and always serialized back out as milliseconds so the two forms roundtrip.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a `Duration` from either a string (human-readable) or a u64
/// (milliseconds).
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a `Duration` as milliseconds (u64) so it roundtrips with
/// [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Same as [`deserialize_duration`] but for an `Option<Duration>` field,
/// treating JSON `null`/absent as `None`.
pub fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OptHelper {
        None,
        String(String),
        U64(u64),
    }

    match Option::<OptHelper>::deserialize(deserializer)? {
        None | Some(OptHelper::None) => Ok(None),
        Some(OptHelper::String(s)) => humantime::parse_duration(&s)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        Some(OptHelper::U64(ms)) => Ok(Some(Duration::from_millis(ms))),
    }
}

/// Same as [`serialize_duration`] but for an `Option<Duration>` field.
pub fn serialize_opt_duration<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

/// A human-readable rendering of a duration, e.g. `"1h 30m"`, used in CLI
/// output and audit log messages.
pub fn render_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}
