//! Byte-blob storage for offline cache containers.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::lock;

/// Flat key → bytes store.
///
/// Keys are plain file-name-safe strings. Implementations must be safe to
/// share between the tracker and its dispatcher thread.
pub trait BlobStore: Send + Sync {
    /// All keys currently stored, in no particular order.
    fn list(&self) -> Result<Vec<String>>;

    fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Store `data` under `key`, replacing any previous blob.
    fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Stored size of `key` in bytes.
    fn size(&self, key: &str) -> Result<u64>;
}

/// One file per key inside a directory.
#[derive(Debug)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl BlobStore for FsBlobStore {
    fn list(&self) -> Result<Vec<String>> {
        let pattern = format!(
            "{}/*",
            glob::Pattern::escape(&self.dir.to_string_lossy())
        );
        let paths =
            glob::glob(&pattern).map_err(|e| Error::Cache(format!("bad cache dir: {}", e)))?;

        let mut keys = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable cache entry");
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                // Skip in-flight temp files
                if !name.starts_with('.') {
                    keys.push(name.to_string());
                }
            }
        }
        Ok(keys)
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.path(key))?)
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!(".{}.tmp", key));
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&tmp, self.path(key))
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        Ok(result?)
    }

    fn delete(&self, key: &str) -> Result<()> {
        Ok(fs::remove_file(self.path(key))?)
    }

    fn size(&self, key: &str) -> Result<u64> {
        Ok(fs::metadata(self.path(key))?.len())
    }
}

/// In-memory store for tests and ephemeral trackers.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `write` fail with an IO error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `delete` fail with an IO error.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.blobs).is_empty()
    }

    fn injected(what: &str) -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("injected {} failure", what),
        ))
    }

    fn missing(key: &str) -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no blob named {}", key),
        ))
    }
}

impl BlobStore for MemoryBlobStore {
    fn list(&self) -> Result<Vec<String>> {
        Ok(lock(&self.blobs).keys().cloned().collect())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        lock(&self.blobs)
            .get(key)
            .cloned()
            .ok_or_else(|| Self::missing(key))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected("write"));
        }
        lock(&self.blobs).insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::injected("delete"));
        }
        lock(&self.blobs)
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Self::missing(key))
    }

    fn size(&self, key: &str) -> Result<u64> {
        lock(&self.blobs)
            .get(key)
            .map(|b| b.len() as u64)
            .ok_or_else(|| Self::missing(key))
    }
}
