//! Queued event value type and query encoding.

use std::collections::BTreeMap;
use std::fmt;

/// One tracked occurrence, reduced to its creation time and the
/// transport-ready query string.
///
/// Events are immutable once created; equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    timestamp: i64,
    payload: String,
}

impl Event {
    /// Create an event with an explicit timestamp (milliseconds since epoch).
    pub fn new(timestamp: i64, payload: impl Into<String>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }

    /// Create an event stamped with the current time.
    pub fn now(payload: impl Into<String>) -> Self {
        Self::new(now_millis(), payload)
    }

    /// Encode `params` and stamp the event with the current time.
    pub fn from_params(params: &BTreeMap<String, String>) -> Self {
        Self::now(encode_query(params))
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Percent-encoded query string, starting with `?` unless empty.
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Encode a flat parameter map into `?k1=v1&k2=v2`.
///
/// Keys come out in map order, so the same map always yields the same
/// string. An empty map encodes to the empty string.
pub fn encode_query(params: &BTreeMap<String, String>) -> String {
    if params.is_empty() {
        return String::new();
    }

    let mut query = String::with_capacity(100);
    for (key, value) in params {
        query.push(if query.is_empty() { '?' } else { '&' });
        query.push_str(&urlencoding::encode(key));
        query.push('=');
        query.push_str(&urlencoding::encode(value));
    }
    query
}
