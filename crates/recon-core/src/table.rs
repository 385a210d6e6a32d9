//! Keyed table store with optimistic concurrency.
//!
//! Rows are addressed by `(partition_key, row_key)`. Every write assigns a new
//! opaque version token and a server-side timestamp; `replace` and `delete`
//! succeed only when the caller's version still matches, unless the caller
//! passes [`RowVersion::Any`].
//!
//! Contention is a normal result: `insert` returns `false` when the row
//! exists and `replace` returns `false` when the version moved on.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Default maximum number of rows accepted by one batch operation.
pub const DEFAULT_BATCH_OPERATION_MAX_ITEM_COUNT: usize = 100;

/// A row that can be stored in a table.
pub trait TableRow: Clone + Send + Sync + 'static {
    /// Partition key of this row.
    fn partition_key(&self) -> String;
    /// Row key of this row, unique within the partition.
    fn row_key(&self) -> String;
}

/// Key columns of a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    /// Partition key.
    pub partition_key: String,
    /// Row key.
    pub row_key: String,
}

impl RowKey {
    /// Creates a row key.
    #[must_use]
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
        }
    }
}

/// A row together with the version and timestamp assigned by the store.
#[derive(Debug, Clone)]
pub struct Versioned<R> {
    /// The row payload.
    pub row: R,
    /// Opaque version token for optimistic writes.
    pub version: String,
    /// Time of the last write.
    pub timestamp: DateTime<Utc>,
}

impl<R> Versioned<R> {
    /// Version condition matching this exact copy of the row.
    #[must_use]
    pub fn exact(&self) -> RowVersion {
        RowVersion::Exact(self.version.clone())
    }
}

/// Version condition for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowVersion {
    /// Write only if the stored version equals this token.
    Exact(String),
    /// Write regardless of the stored version.
    Any,
}

/// Typed query filter. All set conditions must hold.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    /// Only rows in this partition.
    pub partition_key: Option<String>,
    /// Only rows with one of these row keys.
    pub row_keys: Option<Vec<String>>,
    /// Only rows last written strictly before this instant.
    pub modified_before: Option<DateTime<Utc>>,
    /// Maximum number of rows returned.
    pub top: Option<usize>,
}

impl RowFilter {
    /// Filter matching every row.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts the filter to one partition.
    #[must_use]
    pub fn with_partition(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    /// Restricts the filter to the given row keys.
    #[must_use]
    pub fn with_row_keys(mut self, row_keys: Vec<String>) -> Self {
        self.row_keys = Some(row_keys);
        self
    }

    /// Restricts the filter to rows older than `cutoff`.
    #[must_use]
    pub fn with_modified_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.modified_before = Some(cutoff);
        self
    }

    /// Caps the number of returned rows.
    #[must_use]
    pub fn with_top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    fn matches(&self, key: &RowKey, timestamp: DateTime<Utc>) -> bool {
        if let Some(pk) = &self.partition_key {
            if pk != &key.partition_key {
                return false;
            }
        }
        if let Some(row_keys) = &self.row_keys {
            if !row_keys.iter().any(|rk| rk == &key.row_key) {
                return false;
            }
        }
        if let Some(cutoff) = self.modified_before {
            if timestamp >= cutoff {
                return false;
            }
        }
        true
    }
}

/// Key-level table surface, independent of the row type.
///
/// This is what background maintenance needs: find keys, delete them in
/// batches that respect the store's limits.
#[async_trait]
pub trait KeyedTable: Send + Sync {
    /// Name of the table.
    fn name(&self) -> &str;

    /// Maximum rows per batch operation. Batches must also share one partition key.
    fn batch_operation_max_item_count(&self) -> usize;

    /// Returns only the key columns of matching rows.
    async fn query_keys(&self, filter: &RowFilter) -> Result<Vec<RowKey>>;

    /// Deletes rows in one batch. Missing rows are ignored.
    ///
    /// Returns `Error::InvalidInput` if the batch is larger than
    /// [`KeyedTable::batch_operation_max_item_count`] or spans partitions.
    async fn delete_batch(&self, keys: &[RowKey]) -> Result<()>;
}

/// Typed table store.
#[async_trait]
pub trait TableStore<R: TableRow>: KeyedTable {
    /// Inserts a row. Returns `false` if a row with the same key exists.
    async fn insert(&self, row: &R) -> Result<bool>;

    /// Replaces a row. Returns `false` if the row is gone or its version moved on.
    async fn replace(&self, row: &R, version: &RowVersion) -> Result<bool>;

    /// Reads a row.
    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<Versioned<R>>>;

    /// Reads all rows matching the filter, in key order.
    async fn query(&self, filter: &RowFilter) -> Result<Vec<Versioned<R>>>;

    /// Deletes a row. Returns `false` if the row is gone or its version moved on.
    async fn delete(&self, partition_key: &str, row_key: &str, version: &RowVersion)
    -> Result<bool>;
}

#[derive(Debug, Clone)]
struct StoredRow<R> {
    row: R,
    version: i64,
    timestamp: DateTime<Utc>,
}

impl<R: Clone> StoredRow<R> {
    fn to_versioned(&self) -> Versioned<R> {
        Versioned {
            row: self.row.clone(),
            version: self.version.to_string(),
            timestamp: self.timestamp,
        }
    }

    fn matches(&self, version: &RowVersion) -> bool {
        match version {
            RowVersion::Any => true,
            RowVersion::Exact(expected) => expected.parse::<i64>().ok() == Some(self.version),
        }
    }
}

#[derive(Debug)]
struct TableState<R> {
    rows: BTreeMap<RowKey, StoredRow<R>>,
    next_version: i64,
}

/// In-memory table for tests and single-process use.
///
/// Thread-safe via `RwLock`. Versions are monotonically increasing integers
/// exposed as strings.
#[derive(Debug, Clone)]
pub struct MemoryTable<R> {
    name: String,
    batch_limit: usize,
    state: Arc<RwLock<TableState<R>>>,
}

impl<R: TableRow> MemoryTable<R> {
    /// Creates an empty table with the default batch limit.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_batch_limit(name, DEFAULT_BATCH_OPERATION_MAX_ITEM_COUNT)
    }

    /// Creates an empty table with a custom batch limit.
    #[must_use]
    pub fn with_batch_limit(name: impl Into<String>, batch_limit: usize) -> Self {
        Self {
            name: name.into(),
            batch_limit: batch_limit.max(1),
            state: Arc::new(RwLock::new(TableState {
                rows: BTreeMap::new(),
                next_version: 1,
            })),
        }
    }

    /// Writes a row unconditionally with an explicit timestamp.
    ///
    /// Used to seed tables with rows of a known age.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the table lock is poisoned.
    pub fn seed(&self, row: R, timestamp: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().map_err(|_| Error::poisoned())?;
        let version = state.bump();
        let key = RowKey::new(row.partition_key(), row.row_key());
        state.rows.insert(
            key,
            StoredRow {
                row,
                version,
                timestamp,
            },
        );
        Ok(())
    }

    /// Number of rows currently stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the table lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.state.read().map_err(|_| Error::poisoned())?.rows.len())
    }

    /// Returns true if the table holds no rows.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the table lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn matching(&self, filter: &RowFilter) -> Result<Vec<(RowKey, Versioned<R>)>> {
        let state = self.state.read().map_err(|_| Error::poisoned())?;
        let limit = filter.top.unwrap_or(usize::MAX);
        Ok(state
            .rows
            .iter()
            .filter(|(key, stored)| filter.matches(key, stored.timestamp))
            .take(limit)
            .map(|(key, stored)| (key.clone(), stored.to_versioned()))
            .collect())
    }
}

impl<R> TableState<R> {
    fn bump(&mut self) -> i64 {
        let version = self.next_version;
        self.next_version += 1;
        version
    }
}

#[async_trait]
impl<R: TableRow> KeyedTable for MemoryTable<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn batch_operation_max_item_count(&self) -> usize {
        self.batch_limit
    }

    async fn query_keys(&self, filter: &RowFilter) -> Result<Vec<RowKey>> {
        Ok(self
            .matching(filter)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn delete_batch(&self, keys: &[RowKey]) -> Result<()> {
        if keys.len() > self.batch_limit {
            return Err(Error::InvalidInput(format!(
                "batch of {} rows exceeds limit of {} for table {}",
                keys.len(),
                self.batch_limit,
                self.name
            )));
        }
        if let Some(first) = keys.first() {
            if keys.iter().any(|k| k.partition_key != first.partition_key) {
                return Err(Error::InvalidInput(format!(
                    "batch for table {} spans more than one partition",
                    self.name
                )));
            }
        }

        let mut state = self.state.write().map_err(|_| Error::poisoned())?;
        for key in keys {
            state.rows.remove(key);
        }
        Ok(())
    }
}

#[async_trait]
impl<R: TableRow> TableStore<R> for MemoryTable<R> {
    async fn insert(&self, row: &R) -> Result<bool> {
        let key = RowKey::new(row.partition_key(), row.row_key());
        let mut state = self.state.write().map_err(|_| Error::poisoned())?;
        if state.rows.contains_key(&key) {
            return Ok(false);
        }
        let version = state.bump();
        state.rows.insert(
            key,
            StoredRow {
                row: row.clone(),
                version,
                timestamp: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn replace(&self, row: &R, version: &RowVersion) -> Result<bool> {
        let key = RowKey::new(row.partition_key(), row.row_key());
        let mut state = self.state.write().map_err(|_| Error::poisoned())?;
        let matches = state.rows.get(&key).is_some_and(|s| s.matches(version));
        if !matches {
            return Ok(false);
        }
        let next = state.bump();
        state.rows.insert(
            key,
            StoredRow {
                row: row.clone(),
                version: next,
                timestamp: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<Versioned<R>>> {
        let state = self.state.read().map_err(|_| Error::poisoned())?;
        Ok(state
            .rows
            .get(&RowKey::new(partition_key, row_key))
            .map(StoredRow::to_versioned))
    }

    async fn query(&self, filter: &RowFilter) -> Result<Vec<Versioned<R>>> {
        Ok(self
            .matching(filter)?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    async fn delete(
        &self,
        partition_key: &str,
        row_key: &str,
        version: &RowVersion,
    ) -> Result<bool> {
        let key = RowKey::new(partition_key, row_key);
        let mut state = self.state.write().map_err(|_| Error::poisoned())?;
        let matches = state.rows.get(&key).is_some_and(|s| s.matches(version));
        if matches {
            state.rows.remove(&key);
        }
        Ok(matches)
    }
}
