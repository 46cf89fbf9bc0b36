//! Disk-backed overflow cache for events that could not be sent
//!
//! Every flush while offline writes one container: a version line followed
//! by one `<timestamp> <query>` line per event. Containers are keyed by the
//! timestamp of their newest event (`events_<ts>`, or `events_<ts>_<seq>`
//! when that key is already taken) and kept in a numerically sorted index,
//! oldest first.
//!
//! Retention is lazy. Age and size limits are enforced before each write
//! and each emptiness check, never on a timer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lock;
use crate::storage::BlobStore;

use super::event::{now_millis, Event};
use super::settings::DispatchSettings;

/// Format version written as the first line of every container.
pub const CONTAINER_VERSION: &str = "1";

const KEY_PREFIX: &str = "events_";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Container {
    key: String,
    timestamp: i64,
    seq: u32,
    size: u64,
}

impl Container {
    fn order(&self) -> (i64, u32) {
        (self.timestamp, self.seq)
    }
}

#[derive(Debug, Default)]
struct CacheIndex {
    containers: VecDeque<Container>,
    total_size: u64,
}

impl CacheIndex {
    fn pop_oldest(&mut self) -> Option<Container> {
        let container = self.containers.pop_front()?;
        self.total_size = self.total_size.saturating_sub(container.size);
        Some(container)
    }

    fn insert(&mut self, container: Container) {
        let pos = self
            .containers
            .partition_point(|c| c.order() <= container.order());
        self.total_size += container.size;
        self.containers.insert(pos, container);
    }

    fn next_seq(&self, timestamp: i64) -> u32 {
        self.containers
            .iter()
            .filter(|c| c.timestamp == timestamp)
            .map(|c| c.seq + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Persistent overflow store for events queued while offline.
pub struct DiskCache {
    store: Arc<dyn BlobStore>,
    settings: Arc<DispatchSettings>,
    index: Mutex<CacheIndex>,
}

impl DiskCache {
    /// Open the cache, adopting any containers left by a previous process.
    pub fn new(store: Arc<dyn BlobStore>, settings: Arc<DispatchSettings>) -> Self {
        let mut index = CacheIndex::default();

        match store.list() {
            Ok(keys) => {
                for key in keys {
                    let Some((timestamp, seq)) = parse_key(&key) else {
                        warn!(key = %key, "Removing unrecognized cache entry");
                        delete_quietly(store.as_ref(), &key);
                        continue;
                    };
                    let size = store.size(&key).unwrap_or_else(|e| {
                        warn!(key = %key, error = %e, "Could not stat cache container");
                        0
                    });
                    index.insert(Container {
                        key,
                        timestamp,
                        seq,
                        size,
                    });
                }
            }
            Err(e) => warn!(error = %e, "Could not list cache containers"),
        }

        debug!(
            containers = index.containers.len(),
            bytes = index.total_size,
            "Opened event disk cache"
        );

        Self {
            store,
            settings,
            index: Mutex::new(index),
        }
    }

    fn caching_enabled(&self) -> bool {
        self.settings.max_cache_age_ms() >= 0
    }

    /// Per-event cutoff, only when a positive age bound is configured.
    fn age_cutoff(&self) -> Option<i64> {
        let max_age = self.settings.max_cache_age_ms();
        (max_age > 0).then(|| now_millis() - max_age)
    }

    /// Write `events` as one new container.
    ///
    /// A failed write is logged and the events are dropped.
    pub fn persist(&self, events: &[Event]) {
        let mut index = lock(&self.index);
        if !self.caching_enabled() {
            self.enforce_limits(&mut index);
            return;
        }
        if events.is_empty() {
            return;
        }

        self.enforce_limits(&mut index);

        let started = Instant::now();
        let Some((newest, body)) = encode_container(events, self.age_cutoff()) else {
            debug!(events = events.len(), "Nothing left to cache after age cutoff");
            return;
        };

        let seq = index.next_seq(newest);
        let key = container_key(newest, seq);
        if let Err(e) = self.store.write(&key, body.as_bytes()) {
            warn!(key = %key, events = events.len(), error = %e, "Failed to write cache container, events dropped");
            return;
        }

        index.insert(Container {
            key: key.clone(),
            timestamp: newest,
            seq,
            size: body.len() as u64,
        });

        debug!(
            key = %key,
            events = events.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cached events to disk"
        );
    }

    /// Read back and delete every container, oldest first.
    pub fn restore_all(&self) -> Vec<Event> {
        let mut index = lock(&self.index);
        let mut events = Vec::new();
        if !self.caching_enabled() {
            self.enforce_limits(&mut index);
            return events;
        }

        let started = Instant::now();
        let cutoff = self.age_cutoff();
        while let Some(container) = index.pop_oldest() {
            match self.read_container(&container, cutoff) {
                Ok(restored) => {
                    debug!(key = %container.key, events = restored.len(), "Restored cache container");
                    events.extend(restored);
                }
                Err(e) => warn!(key = %container.key, error = %e, "Discarding unreadable cache container"),
            }
            delete_quietly(self.store.as_ref(), &container.key);
        }
        self.enforce_limits(&mut index);

        debug!(
            events = events.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Uncached events"
        );
        events
    }

    fn read_container(&self, container: &Container, cutoff: Option<i64>) -> Result<Vec<Event>> {
        let bytes = self.store.read(&container.key)?;
        decode_container(&String::from_utf8_lossy(&bytes), cutoff)
    }

    /// Run a retention sweep, then report whether any container is left.
    pub fn is_empty(&self) -> bool {
        let mut index = lock(&self.index);
        self.enforce_limits(&mut index);
        index.containers.is_empty()
    }

    /// Delete every container without reading it.
    pub fn clear(&self) {
        let mut index = lock(&self.index);
        while let Some(container) = index.pop_oldest() {
            delete_quietly(self.store.as_ref(), &container.key);
        }
    }

    /// Number of containers currently tracked.
    pub fn container_count(&self) -> usize {
        lock(&self.index).containers.len()
    }

    /// Bytes currently tracked across all containers.
    pub fn total_size(&self) -> u64 {
        lock(&self.index).total_size
    }

    /// Apply the age and size limits. Caller holds the index lock.
    fn enforce_limits(&self, index: &mut CacheIndex) {
        let max_age = self.settings.max_cache_age_ms();
        let mut evicted = 0usize;

        if max_age < 0 {
            while let Some(container) = index.pop_oldest() {
                delete_quietly(self.store.as_ref(), &container.key);
                evicted += 1;
            }
        } else if max_age > 0 {
            let cutoff = now_millis() - max_age;
            // Sorted oldest first: stop at the first container within bound
            while index
                .containers
                .front()
                .is_some_and(|c| c.timestamp < cutoff)
            {
                if let Some(container) = index.pop_oldest() {
                    delete_quietly(self.store.as_ref(), &container.key);
                    evicted += 1;
                }
            }
        }

        let max_size = self.settings.max_cache_size_bytes();
        if max_size != 0 {
            while index.total_size > max_size {
                let Some(container) = index.pop_oldest() else {
                    break;
                };
                delete_quietly(self.store.as_ref(), &container.key);
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(evicted, remaining = index.containers.len(), "Evicted cache containers");
        }
    }
}

/// Delete a blob, logging instead of failing.
fn delete_quietly(store: &dyn BlobStore, key: &str) {
    if let Err(e) = store.delete(key) {
        warn!(key = %key, error = %e, "Failed to delete cache container");
    }
}

fn container_key(timestamp: i64, seq: u32) -> String {
    if seq == 0 {
        format!("{}{}", KEY_PREFIX, timestamp)
    } else {
        format!("{}{}_{}", KEY_PREFIX, timestamp, seq)
    }
}

/// Parse `events_<ts>` or `events_<ts>_<seq>`.
fn parse_key(key: &str) -> Option<(i64, u32)> {
    let rest = key.strip_prefix(KEY_PREFIX)?;
    match rest.split_once('_') {
        Some((ts, seq)) => Some((ts.parse().ok()?, seq.parse().ok()?)),
        None => Some((rest.parse().ok()?, 0)),
    }
}

/// Serialize events, skipping any older than `cutoff`.
///
/// Returns the newest written timestamp with the container text, or `None`
/// when no event survived.
fn encode_container(events: &[Event], cutoff: Option<i64>) -> Option<(i64, String)> {
    let mut body = String::with_capacity(events.len() * 64);
    body.push_str(CONTAINER_VERSION);
    body.push('\n');

    let mut newest = None;
    for event in events {
        if cutoff.is_some_and(|cutoff| event.timestamp() < cutoff) {
            continue;
        }
        if event.payload().contains('\n') {
            warn!(timestamp = event.timestamp(), "Skipping event with unencoded newline");
            continue;
        }
        body.push_str(&event.timestamp().to_string());
        body.push(' ');
        body.push_str(event.payload());
        body.push('\n');
        newest = Some(newest.map_or(event.timestamp(), |n: i64| n.max(event.timestamp())));
    }

    newest.map(|ts| (ts, body))
}

/// Parse container text; malformed lines are skipped, a version mismatch
/// rejects the whole container.
fn decode_container(text: &str, cutoff: Option<i64>) -> Result<Vec<Event>> {
    let mut lines = text.lines();
    match lines.next() {
        Some(CONTAINER_VERSION) => {}
        other => {
            return Err(Error::Cache(format!(
                "unsupported container version {:?}",
                other.unwrap_or("")
            )))
        }
    }

    let mut events = Vec::new();
    for line in lines {
        let Some((ts, query)) = line.split_once(' ') else {
            continue;
        };
        let Ok(timestamp) = ts.parse::<i64>() else {
            debug!(line = %line, "Skipping corrupt cache line");
            continue;
        };
        if cutoff.is_some_and(|cutoff| timestamp < cutoff) {
            continue;
        }
        events.push(Event::new(timestamp, query));
    }
    Ok(events)
}
