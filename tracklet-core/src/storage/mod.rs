//! Storage adapters injected into the tracker
//!
//! The dispatch engine never touches the platform directly. Offline event
//! containers go through a [`BlobStore`], persisted tracker settings go
//! through a [`SettingsStore`]. Both have a durable and an in-memory
//! implementation.

pub mod blob;
pub mod settings;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use settings::{MemorySettings, SettingsStore, SqliteSettings};
