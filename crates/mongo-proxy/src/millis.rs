//! Durations written as milliseconds in config files
//!
//! Whole milliseconds are written as integers. Anything finer is written as a
//! fractional number (`delay_ms = 0.5` is 500µs) so no precision is lost.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

const NANOS_PER_MILLI: u32 = 1_000_000;

pub(crate) fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match u64::try_from(duration.as_millis()) {
        Ok(millis) if duration.subsec_nanos() % NANOS_PER_MILLI == 0 => {
            serializer.serialize_u64(millis)
        }
        _ => serializer.serialize_f64(duration.as_nanos() as f64 / f64::from(NANOS_PER_MILLI)),
    }
}

pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = f64::deserialize(deserializer)?;
    from_millis_f64(millis).ok_or_else(|| {
        serde::de::Error::custom(format!(
            "duration must be a finite, non-negative number of milliseconds, got {}",
            millis
        ))
    })
}

/// Nearest whole nanosecond; saturates past `u64::MAX` nanoseconds.
fn from_millis_f64(millis: f64) -> Option<Duration> {
    if !millis.is_finite() || millis < 0.0 {
        return None;
    }
    let nanos = (millis * f64::from(NANOS_PER_MILLI)).round();
    Some(Duration::from_nanos(nanos as u64))
}
