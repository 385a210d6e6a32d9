//! Object store with operation tracing.
//!
//! Wraps [`MemoryObjectStore`] and records every call for test assertions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use recon_core::error::{Error, Result};
use recon_core::object_store::{FsEntry, MemoryObjectStore, ObjectStore};

/// Record of an object-store operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Directory enumeration.
    OpenDirectory {
        /// Directory that was listed.
        path: String,
    },
    /// Single-file lookup.
    OpenFile {
        /// File that was looked up.
        path: String,
    },
    /// Content read.
    Read {
        /// File that was read.
        path: String,
    },
    /// File creation.
    Create {
        /// File that was written.
        path: String,
        /// Size of data written.
        size: usize,
    },
    /// Move into another directory.
    Move {
        /// Source path.
        path: String,
        /// Destination directory.
        dest_dir: String,
    },
    /// Lifetime change.
    SetLifetime {
        /// File whose lifetime was set.
        path: String,
    },
    /// Deletion.
    Delete {
        /// File that was deleted.
        path: String,
    },
}

/// In-memory object store with operation tracing.
#[derive(Debug, Clone, Default)]
pub struct TracingObjectStore {
    inner: MemoryObjectStore,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    fail_paths: Arc<Mutex<Vec<String>>>,
}

impl TracingObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped store, for seeding and inspection without recording.
    pub fn inner(&self) -> &MemoryObjectStore {
        &self.inner
    }

    /// Writes a file with an explicit creation time, without recording.
    pub fn put(&self, path: &str, data: impl Into<Bytes>, created: DateTime<Utc>) {
        self.inner.put_file(path, data.into(), created).expect("put file");
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Number of recorded operations that read from the store.
    pub fn read_count(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| {
                matches!(
                    op,
                    StoreOp::OpenDirectory { .. } | StoreOp::OpenFile { .. } | StoreOp::Read { .. }
                )
            })
            .count()
    }

    /// Injects a failure for the given path prefix.
    pub fn inject_failure(&self, path: impl Into<String>) {
        self.fail_paths.lock().expect("lock").push(path.into());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_paths.lock().expect("lock").clear();
    }

    /// Returns true if a file exists.
    pub fn exists(&self, path: &str) -> bool {
        self.inner.exists(path).expect("exists")
    }

    /// Expiry of a file, if one was set.
    pub fn expiry(&self, path: &str) -> Option<DateTime<Utc>> {
        self.inner.expiry(path).expect("expiry")
    }

    /// All stored file paths.
    pub fn paths(&self) -> Vec<String> {
        self.inner.file_paths().expect("paths")
    }

    fn record(&self, op: StoreOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str) -> Result<()> {
        let path = path.trim_start_matches('/');
        let fail_paths = self.fail_paths.lock().expect("lock");
        if fail_paths
            .iter()
            .any(|p| path.starts_with(p.trim_start_matches('/')))
        {
            return Err(Error::storage(format!("injected failure for path: {path}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for TracingObjectStore {
    async fn open_directory(&self, path: &str) -> Result<Option<Vec<FsEntry>>> {
        self.record(StoreOp::OpenDirectory {
            path: path.to_string(),
        });
        self.check_failure(path)?;
        self.inner.open_directory(path).await
    }

    async fn open_file(&self, path: &str) -> Result<Option<FsEntry>> {
        self.record(StoreOp::OpenFile {
            path: path.to_string(),
        });
        self.check_failure(path)?;
        self.inner.open_file(path).await
    }

    async fn read(&self, path: &str) -> Result<Option<Bytes>> {
        self.record(StoreOp::Read {
            path: path.to_string(),
        });
        self.check_failure(path)?;
        self.inner.read(path).await
    }

    async fn create(&self, path: &str, data: Bytes) -> Result<()> {
        self.record(StoreOp::Create {
            path: path.to_string(),
            size: data.len(),
        });
        self.check_failure(path)?;
        self.inner.create(path, data).await
    }

    async fn move_relative(
        &self,
        path: &str,
        dest_dir: &str,
        overwrite: bool,
        preserve_path: bool,
    ) -> Result<String> {
        self.record(StoreOp::Move {
            path: path.to_string(),
            dest_dir: dest_dir.to_string(),
        });
        self.check_failure(path)?;
        self.inner
            .move_relative(path, dest_dir, overwrite, preserve_path)
            .await
    }

    async fn set_lifetime(
        &self,
        path: &str,
        lifetime: Duration,
        relative_to_now: bool,
    ) -> Result<()> {
        self.record(StoreOp::SetLifetime {
            path: path.to_string(),
        });
        self.check_failure(path)?;
        self.inner.set_lifetime(path, lifetime, relative_to_now).await
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.record(StoreOp::Delete {
            path: path.to_string(),
        });
        self.check_failure(path)?;
        self.inner.delete(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_operations_and_injects_failures() {
        let store = TracingObjectStore::new();
        store.put("a/b", Bytes::from_static(b"hi"), Utc::now());

        assert!(store.read("a/b").await.expect("read").is_some());
        store.inject_failure("a/");
        assert!(store.open_file("/a/b").await.is_err());

        assert_eq!(store.read_count(), 2);
        assert_eq!(
            store.operations()[0],
            StoreOp::Read {
                path: "a/b".into()
            }
        );
    }
}
