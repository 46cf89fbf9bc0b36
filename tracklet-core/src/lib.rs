//! # tracklet-core
//!
//! Core library for tracklet - a client-side analytics dispatch engine.
//!
//! This library provides:
//! - A tracker that injects session and identity parameters into requests
//! - A background dispatcher that batches events into GET/POST packets
//! - An offline disk cache with age and size retention
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Events flow through three stages:
//! - **Tracking:** [`TrackMe`] parameters are completed and encoded into an [`Event`]
//! - **Queueing:** events wait in memory, or on disk while offline
//! - **Dispatch:** a worker thread batches them into packets and sends them in order
//!
//! ## Example
//!
//! ```rust,no_run
//! use tracklet_core::{Config, TrackMe, TrackerBuilder};
//!
//! let config = Config::load().expect("failed to load config");
//! let tracker = TrackerBuilder::from_config(&config)
//!     .and_then(|builder| builder.build())
//!     .expect("failed to build tracker");
//!
//! tracker.track(TrackMe::new().with("action_name", "Launch"));
//! tracker.dispatch_blocking();
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export commonly used items at the crate root
pub use config::Config;
pub use dispatch::{DispatchMode, Dispatcher, Event, Packet};
pub use error::{Error, Result};
pub use track_me::TrackMe;
pub use tracker::{CallbackId, Tracker, TrackerBuilder};

// Public modules
pub mod config;
pub mod crash;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod storage;
pub mod track_me;
pub mod tracker;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
