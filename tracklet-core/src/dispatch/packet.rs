//! Packets and the batching that turns queued events into them.

use std::fmt;

use serde::Serialize;

use super::event::{now_millis, Event};

/// Maximum number of events folded into one bulk POST.
pub const PAGE_SIZE: usize = 20;

/// One wire transmission attempt.
///
/// A packet with a body is sent as a POST; without one, the payload is
/// already embedded in `target_url` and it goes out as a GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    target_url: String,
    body: Option<String>,
    event_count: usize,
    created_at: i64,
}

impl Packet {
    /// GET packet carrying exactly one event.
    pub fn get(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            body: None,
            event_count: 1,
            created_at: now_millis(),
        }
    }

    /// POST packet carrying `event_count` events in `body`.
    pub fn post(target_url: impl Into<String>, body: String, event_count: usize) -> Self {
        Self {
            target_url: target_url.into(),
            body: Some(body),
            event_count,
            created_at: now_millis(),
        }
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    /// JSON body for POST packets, `None` for GET.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// How many source events this transmission represents.
    pub fn event_count(&self) -> usize {
        self.event_count
    }

    /// Build time in milliseconds since epoch.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn is_post(&self) -> bool {
        self.body.is_some()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Some(body) => write!(f, "POST {} {}", self.target_url, body),
            None => write!(f, "GET {}", self.target_url),
        }
    }
}

/// Bulk request body: `{"requests": ["?a=1", "?b=2"]}`
#[derive(Serialize)]
struct BulkRequest<'a> {
    requests: Vec<&'a str>,
}

/// Converts drained events into packets for one endpoint.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    api_url: String,
}

impl PacketBuilder {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Batch `events` into packets, preserving order.
    ///
    /// One event becomes a GET packet (none at all if its payload is empty).
    /// Larger inputs are split into pages of at most [`PAGE_SIZE`]; a page
    /// holding a single event is still sent as GET.
    pub fn build_packets(&self, events: &[Event]) -> Vec<Packet> {
        match events {
            [] => Vec::new(),
            [single] => self.build_get(single).into_iter().collect(),
            _ => events
                .chunks(PAGE_SIZE)
                .filter_map(|page| match page {
                    [single] => self.build_get(single),
                    _ => self.build_post(page),
                })
                .collect(),
        }
    }

    fn build_get(&self, event: &Event) -> Option<Packet> {
        if event.payload().is_empty() {
            return None;
        }
        Some(Packet::get(format!("{}{}", self.api_url, event.payload())))
    }

    fn build_post(&self, events: &[Event]) -> Option<Packet> {
        let request = BulkRequest {
            requests: events.iter().map(Event::payload).collect(),
        };
        match serde_json::to_string(&request) {
            Ok(body) => Some(Packet::post(self.api_url.clone(), body, events.len())),
            Err(e) => {
                tracing::warn!(error = %e, events = events.len(), "Failed to encode bulk request");
                None
            }
        }
    }
}
