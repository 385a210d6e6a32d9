//! Directory-structured object store abstraction.
//!
//! Agents write manifests and data files into per-agent directories. The
//! pipeline only needs a handful of primitives: enumerate a directory, look
//! at one file, read it, move it into a holding area, bound its lifetime and
//! delete it. Missing paths are `None`/`false`, never errors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::paths;
use crate::time::after;

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

/// One entry returned by directory enumeration or file lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// File or directory.
    pub kind: EntryKind,
    /// Full path of the entry.
    pub path: String,
    /// Final path component.
    pub name: String,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Size in bytes; zero for directories.
    pub size: u64,
}

impl FsEntry {
    /// Returns true for directories.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Object store contract consumed by the pipeline.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Lists the immediate children of a directory.
    ///
    /// Returns `None` if the directory does not exist.
    async fn open_directory(&self, path: &str) -> Result<Option<Vec<FsEntry>>>;

    /// Looks up a single file.
    ///
    /// Returns `None` if the file does not exist.
    async fn open_file(&self, path: &str) -> Result<Option<FsEntry>>;

    /// Reads a whole file.
    ///
    /// Returns `None` if the file does not exist.
    async fn read(&self, path: &str) -> Result<Option<Bytes>>;

    /// Creates or overwrites a file.
    async fn create(&self, path: &str, data: Bytes) -> Result<()>;

    /// Moves a file under `dest_dir` and returns its new path.
    ///
    /// With `preserve_path` the file keeps its full relative path below
    /// `dest_dir`; otherwise only its name is kept. Without `overwrite` an
    /// existing destination is an error.
    async fn move_relative(
        &self,
        path: &str,
        dest_dir: &str,
        overwrite: bool,
        preserve_path: bool,
    ) -> Result<String>;

    /// Bounds how long a file is retained.
    ///
    /// With `relative_to_now` the lifetime starts now; otherwise it starts at
    /// the file's creation time.
    async fn set_lifetime(&self, path: &str, lifetime: Duration, relative_to_now: bool)
    -> Result<()>;

    /// Deletes a file. Returns `false` if it did not exist.
    async fn delete(&self, path: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct StoredFile {
    data: Bytes,
    created: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StoreState {
    files: BTreeMap<String, StoredFile>,
    directories: BTreeSet<String>,
}

/// In-memory object store.
///
/// Thread-safe via `RwLock`. Directories exist when explicitly created or
/// when any file lives below them. Leading slashes are ignored, so
/// `/a/b` and `a/b` name the same object.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    state: Arc<RwLock<StoreState>>,
}

fn key(path: &str) -> String {
    paths::ensure_no_leading_slash(path)
        .trim_end_matches('/')
        .to_string()
}

impl MemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a file with an explicit creation time.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the store lock is poisoned.
    pub fn put_file(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        created: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(|_| Error::poisoned())?;
        state.files.insert(
            key(path),
            StoredFile {
                data: data.into(),
                created,
                expires_at: None,
            },
        );
        Ok(())
    }

    /// Registers an empty directory.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the store lock is poisoned.
    pub fn create_directory(&self, path: &str) -> Result<()> {
        let mut state = self.state.write().map_err(|_| Error::poisoned())?;
        state.directories.insert(key(path));
        Ok(())
    }

    /// Returns the expiry set on a file, if any.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the store lock is poisoned.
    pub fn expiry(&self, path: &str) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.read().map_err(|_| Error::poisoned())?;
        Ok(state.files.get(&key(path)).and_then(|f| f.expires_at))
    }

    /// Returns true if a file exists at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the store lock is poisoned.
    pub fn exists(&self, path: &str) -> Result<bool> {
        let state = self.state.read().map_err(|_| Error::poisoned())?;
        Ok(state.files.contains_key(&key(path)))
    }

    /// Returns every file path in the store.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the store lock is poisoned.
    pub fn file_paths(&self) -> Result<Vec<String>> {
        let state = self.state.read().map_err(|_| Error::poisoned())?;
        Ok(state.files.keys().cloned().collect())
    }
}

fn file_entry(path: &str, file: &StoredFile) -> FsEntry {
    FsEntry {
        kind: EntryKind::File,
        path: path.to_string(),
        name: paths::file_name(path).to_string(),
        created: file.created,
        size: file.data.len() as u64,
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn open_directory(&self, path: &str) -> Result<Option<Vec<FsEntry>>> {
        let dir = key(path);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let state = self.state.read().map_err(|_| Error::poisoned())?;

        let mut found = state.directories.contains(&dir);
        let mut files = Vec::new();
        let mut subdirs: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();

        for (file_path, file) in state.files.range(prefix.clone()..) {
            let Some(rest) = file_path.strip_prefix(&prefix) else {
                break;
            };
            found = true;
            match rest.split_once('/') {
                None => files.push(file_entry(file_path, file)),
                Some((child, _)) => {
                    let created = subdirs.entry(child.to_string()).or_insert(file.created);
                    *created = (*created).min(file.created);
                }
            }
        }
        for marker in state.directories.range(prefix.clone()..) {
            let Some(rest) = marker.strip_prefix(&prefix) else {
                break;
            };
            if !rest.is_empty() {
                found = true;
                let child = rest.split('/').next().unwrap_or(rest);
                subdirs.entry(child.to_string()).or_insert_with(Utc::now);
            }
        }

        if !found {
            return Ok(None);
        }

        let mut entries: Vec<FsEntry> = subdirs
            .into_iter()
            .map(|(name, created)| FsEntry {
                kind: EntryKind::Directory,
                path: format!("{prefix}{name}"),
                name,
                created,
                size: 0,
            })
            .collect();
        entries.extend(files);
        Ok(Some(entries))
    }

    async fn open_file(&self, path: &str) -> Result<Option<FsEntry>> {
        let path = key(path);
        let state = self.state.read().map_err(|_| Error::poisoned())?;
        Ok(state.files.get(&path).map(|f| file_entry(&path, f)))
    }

    async fn read(&self, path: &str) -> Result<Option<Bytes>> {
        let state = self.state.read().map_err(|_| Error::poisoned())?;
        Ok(state.files.get(&key(path)).map(|f| f.data.clone()))
    }

    async fn create(&self, path: &str, data: Bytes) -> Result<()> {
        self.put_file(path, data, Utc::now())
    }

    async fn move_relative(
        &self,
        path: &str,
        dest_dir: &str,
        overwrite: bool,
        preserve_path: bool,
    ) -> Result<String> {
        let source = key(path);
        let relative = if preserve_path {
            source.clone()
        } else {
            paths::file_name(&source).to_string()
        };
        let destination = key(&paths::join(dest_dir, &relative));

        let mut state = self.state.write().map_err(|_| Error::poisoned())?;
        if !overwrite && state.files.contains_key(&destination) {
            return Err(Error::storage(format!(
                "cannot move {source}: {destination} already exists"
            )));
        }
        let file = state
            .files
            .remove(&source)
            .ok_or_else(|| Error::storage(format!("cannot move {source}: file does not exist")))?;
        state.files.insert(destination.clone(), file);
        Ok(destination)
    }

    async fn set_lifetime(
        &self,
        path: &str,
        lifetime: Duration,
        relative_to_now: bool,
    ) -> Result<()> {
        let path = key(path);
        let mut state = self.state.write().map_err(|_| Error::poisoned())?;
        let file = state
            .files
            .get_mut(&path)
            .ok_or_else(|| Error::storage(format!("cannot set lifetime of {path}: file does not exist")))?;
        let start = if relative_to_now {
            Utc::now()
        } else {
            file.created
        };
        file.expires_at = Some(after(start, lifetime));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let mut state = self.state.write().map_err(|_| Error::poisoned())?;
        Ok(state.files.remove(&key(path)).is_some())
    }
}
