//! Live dispatch settings shared between control methods and the worker.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use crate::config::DispatchConfig;

use super::mode::DispatchMode;

/// Tracker-owned dispatch configuration.
///
/// Every field is an independent atomic: writers never lock the queue and
/// the worker re-reads the values on each cycle, so updates take effect
/// without restarting anything.
#[derive(Debug)]
pub struct DispatchSettings {
    interval_ms: AtomicI64,
    connect_timeout_ms: AtomicU64,
    gzip: AtomicBool,
    mode: AtomicU8,
    max_cache_age_ms: AtomicI64,
    max_cache_size_bytes: AtomicU64,
}

impl DispatchSettings {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            interval_ms: AtomicI64::new(config.interval_ms),
            connect_timeout_ms: AtomicU64::new(config.connect_timeout_ms),
            gzip: AtomicBool::new(config.gzip),
            mode: AtomicU8::new(config.mode.to_u8()),
            max_cache_age_ms: AtomicI64::new(config.max_cache_age_ms),
            max_cache_size_bytes: AtomicU64::new(config.max_cache_size_bytes),
        }
    }

    /// Pause between cycles in milliseconds; negative means manual dispatch only.
    pub fn interval_ms(&self) -> i64 {
        self.interval_ms.load(Ordering::SeqCst)
    }

    pub fn set_interval_ms(&self, interval_ms: i64) {
        self.interval_ms.store(interval_ms, Ordering::SeqCst);
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::SeqCst))
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.connect_timeout_ms.store(millis, Ordering::SeqCst);
    }

    pub fn gzip(&self) -> bool {
        self.gzip.load(Ordering::SeqCst)
    }

    pub fn set_gzip(&self, gzip: bool) {
        self.gzip.store(gzip, Ordering::SeqCst);
    }

    pub fn mode(&self) -> DispatchMode {
        DispatchMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    pub fn set_mode(&self, mode: DispatchMode) {
        self.mode.store(mode.to_u8(), Ordering::SeqCst);
    }

    /// Offline cache retention: >0 limit, 0 unlimited, <0 caching disabled.
    pub fn max_cache_age_ms(&self) -> i64 {
        self.max_cache_age_ms.load(Ordering::SeqCst)
    }

    pub fn set_max_cache_age_ms(&self, age_ms: i64) {
        self.max_cache_age_ms.store(age_ms, Ordering::SeqCst);
    }

    /// Offline cache size bound in bytes; 0 is unlimited.
    pub fn max_cache_size_bytes(&self) -> u64 {
        self.max_cache_size_bytes.load(Ordering::SeqCst)
    }

    pub fn set_max_cache_size_bytes(&self, size: u64) {
        self.max_cache_size_bytes.store(size, Ordering::SeqCst);
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::new(&DispatchConfig::default())
    }
}
