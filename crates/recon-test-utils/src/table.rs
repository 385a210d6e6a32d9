//! Table store with operation tracing and forced conflicts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use recon_core::error::{Error, Result};
use recon_core::table::{
    KeyedTable, MemoryTable, RowFilter, RowKey, RowVersion, TableRow, TableStore, Versioned,
};

/// Record of a table operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOp {
    /// Row insert.
    Insert {
        /// Row key written.
        row_key: String,
    },
    /// Row replace and whether it won.
    Replace {
        /// Row key written.
        row_key: String,
        /// Whether the write was applied.
        applied: bool,
    },
    /// Point read.
    Get {
        /// Row key read.
        row_key: String,
    },
    /// Filtered read.
    Query,
    /// Single-row delete.
    Delete {
        /// Row key deleted.
        row_key: String,
    },
    /// Batched delete.
    DeleteBatch {
        /// Partition of the batch.
        partition_key: String,
        /// Rows in the batch.
        size: usize,
    },
}

/// Table wrapper that records operations and can force version conflicts.
#[derive(Debug, Clone)]
pub struct TracingTable<R> {
    inner: MemoryTable<R>,
    operations: Arc<Mutex<Vec<TableOp>>>,
    forced_conflicts: Arc<AtomicUsize>,
    racing_inserts: Arc<Mutex<Vec<R>>>,
    failed_queries: Arc<AtomicUsize>,
}

impl<R: TableRow> TracingTable<R> {
    /// Creates an empty table with the default batch limit.
    pub fn new(name: impl Into<String>) -> Self {
        Self::wrap(MemoryTable::new(name))
    }

    /// Creates an empty table with a custom batch limit.
    pub fn with_batch_limit(name: impl Into<String>, limit: usize) -> Self {
        Self::wrap(MemoryTable::with_batch_limit(name, limit))
    }

    fn wrap(inner: MemoryTable<R>) -> Self {
        Self {
            inner,
            operations: Arc::new(Mutex::new(Vec::new())),
            forced_conflicts: Arc::new(AtomicUsize::new(0)),
            racing_inserts: Arc::new(Mutex::new(Vec::new())),
            failed_queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Writes a row with an explicit timestamp, without recording.
    pub fn seed(&self, row: R, timestamp: DateTime<Utc>) {
        self.inner.seed(row, timestamp).expect("seed");
    }

    /// Makes the next `count` replaces lose as if another writer won.
    pub fn conflict_next_replaces(&self, count: usize) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    /// Stores `row` just before the next insert, as if another writer
    /// inserted it first.
    pub fn race_next_insert(&self, row: R) {
        self.racing_inserts.lock().expect("lock").push(row);
    }

    /// Makes the next `count` key queries fail with a table error.
    pub fn fail_next_queries(&self, count: usize) {
        self.failed_queries.store(count, Ordering::SeqCst);
    }

    /// Reads a row without recording.
    pub async fn row(&self, partition_key: &str, row_key: &str) -> Option<R> {
        self.inner
            .get(partition_key, row_key)
            .await
            .expect("get")
            .map(|v| v.row)
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.inner.len().expect("len")
    }

    /// Returns true if the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<TableOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Recorded batch deletes as `(partition, size)` pairs.
    pub fn delete_batches(&self) -> Vec<(String, usize)> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                TableOp::DeleteBatch {
                    partition_key,
                    size,
                } => Some((partition_key, size)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: TableOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn take_conflict(&self) -> bool {
        take_one(&self.forced_conflicts)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl<R: TableRow> KeyedTable for TracingTable<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn batch_operation_max_item_count(&self) -> usize {
        self.inner.batch_operation_max_item_count()
    }

    async fn query_keys(&self, filter: &RowFilter) -> Result<Vec<RowKey>> {
        self.record(TableOp::Query);
        if take_one(&self.failed_queries) {
            return Err(Error::table(format!("injected query failure on {}", self.name())));
        }
        self.inner.query_keys(filter).await
    }

    async fn delete_batch(&self, keys: &[RowKey]) -> Result<()> {
        self.record(TableOp::DeleteBatch {
            partition_key: keys
                .first()
                .map(|k| k.partition_key.clone())
                .unwrap_or_default(),
            size: keys.len(),
        });
        self.inner.delete_batch(keys).await
    }
}

#[async_trait]
impl<R: TableRow> TableStore<R> for TracingTable<R> {
    async fn insert(&self, row: &R) -> Result<bool> {
        self.record(TableOp::Insert {
            row_key: row.row_key(),
        });
        let racing = self.racing_inserts.lock().expect("lock").pop();
        if let Some(winner) = racing {
            self.inner.seed(winner, Utc::now())?;
        }
        self.inner.insert(row).await
    }

    async fn replace(&self, row: &R, version: &RowVersion) -> Result<bool> {
        let applied = if self.take_conflict() {
            false
        } else {
            self.inner.replace(row, version).await?
        };
        self.record(TableOp::Replace {
            row_key: row.row_key(),
            applied,
        });
        Ok(applied)
    }

    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Option<Versioned<R>>> {
        self.record(TableOp::Get {
            row_key: row_key.to_string(),
        });
        self.inner.get(partition_key, row_key).await
    }

    async fn query(&self, filter: &RowFilter) -> Result<Vec<Versioned<R>>> {
        self.record(TableOp::Query);
        self.inner.query(filter).await
    }

    async fn delete(
        &self,
        partition_key: &str,
        row_key: &str,
        version: &RowVersion,
    ) -> Result<bool> {
        self.record(TableOp::Delete {
            row_key: row_key.to_string(),
        });
        self.inner.delete(partition_key, row_key, version).await
    }
}
