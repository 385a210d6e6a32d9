//! Periodic deletion of stale table rows.
//!
//! Each configured table is cleaned under a lease so only one worker sweeps
//! it at a time. A pass deletes at most `max_batch_size` rows per table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use ulid::Ulid;

use recon_core::error::{Error, Result};
use recon_core::lease::LeaseManager;
use recon_core::table::{KeyedTable, RowFilter, RowKey};

use crate::config::TableRowCleanerConfig;
use crate::metrics;
use crate::runner::WorkerTask;

const TASK_NAME: &str = "table_row_cleaner";

/// Thresholds are capped at a century.
const MAX_THRESHOLD_DAYS: u64 = 36_500;

struct CleanedTable {
    table: Arc<dyn KeyedTable>,
    threshold: chrono::Duration,
}

/// Deletes rows not modified within each table's threshold.
pub struct TableRowCleaner {
    config: TableRowCleanerConfig,
    tables: Vec<CleanedTable>,
    leases: Arc<dyn LeaseManager>,
    owner: String,
}

impl std::fmt::Debug for TableRowCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.tables.iter().map(|t| t.table.name()).collect();
        f.debug_struct("TableRowCleaner")
            .field("tables", &names)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl TableRowCleaner {
    /// Creates a cleaner over the configured tables.
    ///
    /// # Errors
    ///
    /// Returns `Error::Table` if a configured table is not among `tables`.
    pub fn new(
        config: TableRowCleanerConfig,
        tables: &[Arc<dyn KeyedTable>],
        leases: Arc<dyn LeaseManager>,
    ) -> Result<Self> {
        let cleaned = config
            .tables
            .iter()
            .map(|entry| {
                let table = tables
                    .iter()
                    .find(|t| t.name() == entry.table_name)
                    .ok_or_else(|| {
                        Error::table(format!("no table named {} to clean", entry.table_name))
                    })?;
                let days = entry.last_modified_threshold_days.min(MAX_THRESHOLD_DAYS);
                Ok(CleanedTable {
                    table: Arc::clone(table),
                    threshold: chrono::Duration::days(i64::try_from(days).unwrap_or(0)),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            tables: cleaned,
            leases,
            owner: format!("{TASK_NAME}-{}", Ulid::new()),
        })
    }

    /// Cleans every table once and returns the number of rows deleted.
    ///
    /// A failing table is logged and skipped; the remaining tables are still
    /// cleaned.
    ///
    /// # Errors
    ///
    /// Returns the last table or lease error when no table could be cleaned.
    pub async fn clean(&self) -> Result<u64> {
        let mut total = 0;
        let mut failures = 0;
        let mut last_error = None;
        for entry in &self.tables {
            match self.clean_table(entry).await {
                Ok(deleted) => total += deleted,
                Err(e) => {
                    tracing::error!(table = entry.table.name(), error = %e, "failed to clean table");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if failures == self.tables.len() => Err(e),
            _ => Ok(total),
        }
    }

    async fn clean_table(&self, entry: &CleanedTable) -> Result<u64> {
        let name = entry.table.name();
        let Some(lease) = self
            .leases
            .attempt_acquire(
                &self.config.cleaner_lock_group,
                name,
                &self.owner,
                self.config.lease(),
                false,
            )
            .await?
        else {
            tracing::debug!(table = name, "another worker is cleaning the table");
            return Ok(0);
        };

        let result = self.delete_stale(entry).await;
        if let Err(e) = self.leases.release(&lease, result.is_ok()).await {
            tracing::warn!(table = name, error = %e, "failed to release cleaning lease");
        }

        let deleted = result?;
        if deleted > 0 {
            tracing::info!(table = name, deleted, "deleted stale rows");
            metrics::record_rows_cleaned(name, deleted);
        }
        Ok(deleted)
    }

    async fn delete_stale(&self, entry: &CleanedTable) -> Result<u64> {
        let cutoff = Utc::now() - entry.threshold;
        let filter = RowFilter::all()
            .with_modified_before(cutoff)
            .with_top(self.config.max_batch_size);
        let keys = entry.table.query_keys(&filter).await?;

        let mut by_partition: BTreeMap<String, Vec<RowKey>> = BTreeMap::new();
        for key in keys {
            by_partition
                .entry(key.partition_key.clone())
                .or_default()
                .push(key);
        }

        let limit = entry.table.batch_operation_max_item_count().max(1);
        let mut deleted = 0u64;
        for keys in by_partition.values() {
            for batch in keys.chunks(limit) {
                entry.table.delete_batch(batch).await?;
                deleted += batch.len() as u64;
            }
        }
        Ok(deleted)
    }

    fn next_delay(&self, deleted: u64) -> Duration {
        let base = if deleted == 0 {
            self.config.empty_batch_delay_seconds
        } else {
            self.config.non_empty_batch_delay_seconds
        };
        let jitter = rand::thread_rng().gen_range(0..=self.config.delay_random_limit_seconds);
        Duration::from_secs(base.saturating_add(jitter))
    }
}

#[async_trait]
impl WorkerTask for TableRowCleaner {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    async fn run_once(&self, _instance: usize) -> Result<Duration> {
        let deleted = self.clean().await?;
        Ok(self.next_delay(deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CleanedTable as CleanedTableConfig;
    use recon_core::model::CommandState;
    use recon_test_utils::{LeaseOp, TableOp, TracingLeaseManager, TracingTable};

    fn config(days: u64) -> TableRowCleanerConfig {
        TableRowCleanerConfig {
            tables: vec![CleanedTableConfig {
                table_name: "commands".into(),
                last_modified_threshold_days: days,
            }],
            max_batch_size: 10,
            empty_batch_delay_seconds: 100,
            non_empty_batch_delay_seconds: 5,
            delay_random_limit_seconds: 3,
            ..TableRowCleanerConfig::default()
        }
    }

    fn cleaner(
        days: u64,
        table: &Arc<TracingTable<CommandState>>,
        leases: &TracingLeaseManager,
    ) -> TableRowCleaner {
        let tables: Vec<Arc<dyn KeyedTable>> = vec![table.clone()];
        TableRowCleaner::new(config(days), &tables, Arc::new(leases.clone())).expect("cleaner")
    }

    #[tokio::test]
    async fn stale_rows_are_deleted_in_partition_batches() {
        let table = Arc::new(TracingTable::with_batch_limit("commands", 2));
        let old = Utc::now() - chrono::Duration::days(10);
        for id in ["c1", "c2", "c3"] {
            table.seed(CommandState::pending("agent1", id), old);
        }
        table.seed(CommandState::pending("agent2", "c4"), old);
        table.seed(CommandState::pending("agent1", "fresh"), Utc::now());
        let leases = TracingLeaseManager::new();

        let deleted = cleaner(5, &table, &leases).clean().await.expect("clean");

        assert_eq!(deleted, 4);
        assert_eq!(
            table.delete_batches(),
            vec![
                ("agent1".to_string(), 2),
                ("agent1".to_string(), 1),
                ("agent2".to_string(), 1)
            ]
        );
        assert_eq!(table.len(), 1);
        assert!(
            leases
                .operations()
                .contains(&LeaseOp::Release {
                    resource: "commands".into(),
                    success: true
                })
        );
    }

    #[tokio::test]
    async fn held_lease_skips_the_table() {
        let table = Arc::new(TracingTable::new("commands"));
        table.seed(
            CommandState::pending("agent1", "c1"),
            Utc::now() - chrono::Duration::days(10),
        );
        let leases = TracingLeaseManager::new();
        leases
            .hold("TableRowCleaner", "commands", Duration::from_secs(600))
            .await;

        let deleted = cleaner(5, &table, &leases).clean().await.expect("clean");

        assert_eq!(deleted, 0);
        assert_eq!(table.len(), 1);
        assert!(
            !table
                .operations()
                .iter()
                .any(|op| matches!(op, TableOp::Query))
        );
    }

    #[tokio::test]
    async fn delay_depends_on_whether_rows_were_deleted() {
        let table = Arc::new(TracingTable::new("commands"));
        let leases = TracingLeaseManager::new();
        let cleaner = cleaner(5, &table, &leases);

        let idle = cleaner.run_once(0).await.expect("idle pass");
        assert!((100..=103).contains(&idle.as_secs()));

        table.seed(
            CommandState::pending("agent1", "c1"),
            Utc::now() - chrono::Duration::days(10),
        );
        let busy = cleaner.run_once(0).await.expect("busy pass");
        assert!((5..=8).contains(&busy.as_secs()));
    }

    #[tokio::test]
    async fn failing_table_does_not_stop_the_others() {
        let broken = Arc::new(TracingTable::<CommandState>::new("broken"));
        let commands = Arc::new(TracingTable::new("commands"));
        let old = Utc::now() - chrono::Duration::days(10);
        broken.seed(CommandState::pending("agent1", "c1"), old);
        commands.seed(CommandState::pending("agent1", "c1"), old);
        broken.fail_next_queries(1);
        let leases = TracingLeaseManager::new();
        let mut config = config(5);
        config.tables.insert(
            0,
            CleanedTableConfig {
                table_name: "broken".into(),
                last_modified_threshold_days: 5,
            },
        );
        let tables: Vec<Arc<dyn KeyedTable>> = vec![broken.clone(), commands.clone()];
        let cleaner =
            TableRowCleaner::new(config, &tables, Arc::new(leases.clone())).expect("cleaner");

        let deleted = cleaner.clean().await.expect("clean");

        assert_eq!(deleted, 1);
        assert!(commands.is_empty());
        assert_eq!(broken.len(), 1);
        assert!(leases.operations().contains(&LeaseOp::Release {
            resource: "broken".into(),
            success: false
        }));

        broken.fail_next_queries(1);
        let only_broken: Vec<Arc<dyn KeyedTable>> = vec![broken.clone()];
        let cleaner = TableRowCleaner::new(
            TableRowCleanerConfig {
                tables: vec![CleanedTableConfig {
                    table_name: "broken".into(),
                    last_modified_threshold_days: 5,
                }],
                ..TableRowCleanerConfig::default()
            },
            &only_broken,
            Arc::new(leases),
        )
        .expect("cleaner");
        assert!(cleaner.clean().await.is_err());
    }

    #[test]
    fn unknown_tables_are_rejected() {
        let leases = TracingLeaseManager::new();
        let err = TableRowCleaner::new(config(5), &[], Arc::new(leases))
            .expect_err("missing table");
        assert!(err.to_string().contains("commands"));
    }
}
