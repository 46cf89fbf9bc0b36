//! Event dispatch engine
//!
//! Moves tracked events from producers to the collection endpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  submit  ┌────────────┐  drain  ┌───────────────┐  send  ┌──────────────┐
//! │  Tracker  │ ───────► │ EventQueue │ ──────► │ PacketBuilder │ ─────► │ PacketSender │
//! └───────────┘          └────────────┘         └───────────────┘        └──────────────┘
//!                          ▲        │
//!                  online  │        │ offline
//!                          │        ▼
//!                        ┌────────────┐
//!                        │ DiskCache  │ ──► BlobStore
//!                        └────────────┘
//! ```
//!
//! A single [`Dispatcher`] worker thread runs the cycle: wait for the
//! interval or a wake token, check [`Connectivity`] against the
//! [`DispatchMode`], then either send everything queued or spill it to disk.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tracklet_core::dispatch::*;
//!
//! let settings = Arc::new(DispatchSettings::default());
//! let disk = Arc::new(DiskCache::new(store, settings.clone()));
//! let dispatcher = Dispatcher::new(
//!     EventQueue::new(disk),
//!     Arc::new(ManualConnectivity::online()),
//!     PacketBuilder::new("https://analytics.example.com/matomo.php"),
//!     Arc::new(HttpPacketSender::new()?),
//!     settings,
//! );
//! dispatcher.submit(Event::now("?idsite=1&rec=1"));
//! dispatcher.force_dispatch_blocking();
//! ```

mod connectivity;
mod disk_cache;
mod dispatcher;
mod event;
mod mode;
mod packet;
mod queue;
mod settings;
mod transport;

pub use connectivity::{Connectivity, ManualConnectivity, NetworkType};
pub use disk_cache::{DiskCache, CONTAINER_VERSION};
pub use dispatcher::{backoff_delay, Dispatcher, DryRunTarget};
pub use event::{encode_query, now_millis, Event};
pub use mode::DispatchMode;
pub use packet::{Packet, PacketBuilder, PAGE_SIZE};
pub use queue::EventQueue;
pub use settings::DispatchSettings;
pub use transport::{gzip, HttpPacketSender, PacketSender, SendOptions};
