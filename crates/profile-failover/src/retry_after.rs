//! Retry-After hint extraction
//!
//! Upstream providers communicate when to come back either through a
//! `Retry-After` response header (seconds or HTTP-date) or through a
//! retry-after property on the error body. The extracted hint overrides
//! the locally computed backoff.

use std::time::SystemTime;

use crate::error::FailoverError;

/// Extract an upstream retry-after hint in milliseconds.
///
/// The header wins when present: a numeric value is seconds (rounded up
/// to whole ms), anything else is parsed as an HTTP-date relative to
/// `now`. Without a header, a direct numeric retry-after property is
/// interpreted as seconds. Absent or unparseable hints yield `None`.
pub fn retry_after_ms(err: &FailoverError, now: SystemTime) -> Option<u64> {
    if let Some(value) = err.header("retry-after") {
        return parse_header_value(value, now);
    }
    secs_to_ms(err.retry_after_secs?)
}

fn parse_header_value(value: &str, now: SystemTime) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return secs_to_ms(secs);
    }
    let when = httpdate::parse_http_date(value).ok()?;
    // A date in the past means "retry now", not an error.
    Some(
        when.duration_since(now)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
    )
}

fn secs_to_ms(secs: f64) -> Option<u64> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some((secs * 1000.0).ceil() as u64)
}
