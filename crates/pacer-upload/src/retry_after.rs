//! Retry-After header parsing
//!
//! The header carries either a number of seconds or an HTTP date (RFC 7231).

use std::time::Duration;
use tracing::debug;

/// Delay requested by a `retry-after` header value
///
/// Dates in the past yield a zero delay. Unparseable values yield `None`.
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    if let Ok(seconds) = header_value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(target_time) = chrono::DateTime::parse_from_rfc2822(header_value) {
        let seconds = target_time
            .signed_duration_since(chrono::Utc::now())
            .num_seconds()
            .max(0);
        return Some(Duration::from_secs(seconds as u64));
    }

    debug!(header_value, "Failed to parse retry-after header");
    None
}
