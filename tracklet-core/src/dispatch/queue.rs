//! In-memory FIFO of pending events, backed by the disk cache.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::lock;

use super::disk_cache::DiskCache;
use super::event::Event;

/// Thread-safe event queue.
///
/// While online the queue holds everything in memory; going offline moves
/// the queue contents into a disk container, coming back online pulls every
/// container in ahead of whatever is queued.
pub struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    disk: Arc<DiskCache>,
}

impl EventQueue {
    pub fn new(disk: Arc<DiskCache>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            disk,
        }
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    /// Append at the tail.
    pub fn add(&self, event: Event) {
        lock(&self.queue).push_back(event);
    }

    /// Take every queued event in order, leaving the queue empty.
    pub fn drain_all(&self) -> Vec<Event> {
        lock(&self.queue).drain(..).collect()
    }

    /// Put `events` back at the head, keeping their relative order.
    ///
    /// They end up older than anything queued since they were drained.
    pub fn requeue_front(&self, events: Vec<Event>) {
        let mut queue = lock(&self.queue);
        for event in events.into_iter().rev() {
            queue.push_front(event);
        }
    }

    /// Number of events held in memory.
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// True when neither memory nor disk holds anything.
    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty() && self.disk.is_empty()
    }

    /// Drop all queued and cached events.
    pub fn clear(&self) {
        self.disk.clear();
        lock(&self.queue).clear();
    }

    /// Move events between memory and disk for the given connectivity.
    ///
    /// Online: restore the disk cache in front of the queue. Offline: spill
    /// the queue into a new container. Returns whether there is something
    /// to send right now.
    pub fn update_state(&self, online: bool) -> bool {
        if online {
            let restored = self.disk.restore_all();
            if !restored.is_empty() {
                self.requeue_front(restored);
            }
            !lock(&self.queue).is_empty()
        } else {
            // Drain first, persist outside the queue lock
            let to_cache = self.drain_all();
            if !to_cache.is_empty() {
                self.disk.persist(&to_cache);
            }
            false
        }
    }
}
