//! Directory monitor.
//!
//! Sweeps every configured location for agent directories and turns each
//! complete `DataFileManifest_*` / `RequestManifest_*` pair into a
//! [`ManifestFileSet`] work item.
//!
//! # Rules
//!
//! For every file in an agent directory:
//!
//! 1. Older than the delete age: deleted. Failures are logged and retried on
//!    the next sweep.
//! 2. Older than the enqueue age: left alone.
//! 3. Not a manifest: tallied as a data file.
//! 4. A manifest whose counterpart has not been seen yet: remembered.
//!
//! A pair is enqueued once both halves are at least `min_batch_age` old and
//! its state row (if any) was not written within the enqueue interval. The
//! monitor never creates state rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use recon_core::error::Result;
use recon_core::manifest::{
    DATA_MANIFEST_PREFIX, ManifestKind, REQUEST_MANIFEST_PREFIX, classify_name,
};
use recon_core::model::{ManifestFileSet, ManifestFileSetState};
use recon_core::object_store::{FsEntry, ObjectStore};
use recon_core::partition::PartitionThresholds;
use recon_core::paths;
use recon_core::queue::WorkQueue;
use recon_core::table::TableStore;
use recon_core::time::age;

use crate::config::{CosmosMonitorConfig, MonitorLocation};
use crate::metrics;
use crate::runner::WorkerTask;

/// Placeholder file agents may leave in their directories.
const PLACEHOLDER_FILE_NAME: &str = "readme.txt";

/// Name prefix some agents use by mistake for data manifests.
const COMMON_INCORRECT_DATA_PREFIX: &str = "DataManifest";

/// Outcome counts of one location sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorTally {
    /// Manifest pairs enqueued.
    pub enqueued: u64,
    /// Pairs skipped because a state row was written recently.
    pub throttled: u64,
    /// Pairs skipped because a manifest was still too young.
    pub too_young: u64,
    /// Files skipped for exceeding the enqueue age.
    pub expired: u64,
    /// Files deleted for exceeding the delete age.
    pub deleted: u64,
    /// Data files seen.
    pub data_files: u64,
}

impl MonitorTally {
    fn emit(&self, cosmos_tag: &str) {
        metrics::record_monitor_files(cosmos_tag, "enqueued", self.enqueued);
        metrics::record_monitor_files(cosmos_tag, "throttled", self.throttled);
        metrics::record_monitor_files(cosmos_tag, "too_young", self.too_young);
        metrics::record_monitor_files(cosmos_tag, "expired", self.expired);
        metrics::record_monitor_files(cosmos_tag, "deleted", self.deleted);
        metrics::record_monitor_files(cosmos_tag, "data_file", self.data_files);
    }

    fn merge(&mut self, other: &Self) {
        self.enqueued += other.enqueued;
        self.throttled += other.throttled;
        self.too_young += other.too_young;
        self.expired += other.expired;
        self.deleted += other.deleted;
        self.data_files += other.data_files;
    }
}

/// Discovers manifest pairs and enqueues them for processing.
pub struct CosmosMonitor {
    config: CosmosMonitorConfig,
    thresholds: PartitionThresholds,
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn WorkQueue<ManifestFileSet>>,
    state: Arc<dyn TableStore<ManifestFileSetState>>,
}

impl std::fmt::Debug for CosmosMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CosmosMonitor")
            .field("config", &self.config)
            .field("queue", &self.queue.name())
            .finish_non_exhaustive()
    }
}

impl CosmosMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(
        config: CosmosMonitorConfig,
        thresholds: PartitionThresholds,
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn WorkQueue<ManifestFileSet>>,
        state: Arc<dyn TableStore<ManifestFileSetState>>,
    ) -> Self {
        Self {
            config,
            thresholds,
            store,
            queue,
            state,
        }
    }

    /// Sweeps every location once and returns the combined tally.
    ///
    /// # Errors
    ///
    /// Returns store, queue and table errors. Items enqueued before the
    /// failure stay enqueued.
    pub async fn sweep(&self) -> Result<MonitorTally> {
        let mut total = MonitorTally::default();
        for location in &self.config.locations {
            let tally = self.sweep_location(location).await?;
            tally.emit(&location.cosmos_tag);
            total.merge(&tally);
        }
        Ok(total)
    }

    async fn sweep_location(&self, location: &MonitorLocation) -> Result<MonitorTally> {
        let root = paths::join(&location.root_path, &self.config.agent_output_path);
        let mut tally = MonitorTally::default();

        let Some(entries) = self.store.open_directory(&root).await? else {
            tracing::warn!(cosmos_tag = %location.cosmos_tag, root = %root, "export root not found");
            return Ok(tally);
        };

        for entry in entries {
            if entry.is_directory() {
                self.sweep_agent(location, &entry, &mut tally).await?;
            } else if !entry.name.eq_ignore_ascii_case(PLACEHOLDER_FILE_NAME) {
                tracing::debug!(path = %entry.path, "unexpected file in export root");
            }
        }

        tracing::info!(
            cosmos_tag = %location.cosmos_tag,
            enqueued = tally.enqueued,
            throttled = tally.throttled,
            too_young = tally.too_young,
            expired = tally.expired,
            deleted = tally.deleted,
            data_files = tally.data_files,
            "location sweep complete"
        );
        Ok(tally)
    }

    async fn sweep_agent(
        &self,
        location: &MonitorLocation,
        agent_dir: &FsEntry,
        tally: &mut MonitorTally,
    ) -> Result<()> {
        let agent_id = agent_dir.name.as_str();
        let Some(entries) = self.store.open_directory(&agent_dir.path).await? else {
            tracing::debug!(path = %agent_dir.path, "agent directory vanished");
            return Ok(());
        };

        let mut unpaired: HashMap<String, FsEntry> = HashMap::new();
        let now = Utc::now();

        for file in entries {
            if file.is_directory() {
                tracing::warn!(path = %file.path, "unexpected directory in agent directory");
                continue;
            }
            if file.name.eq_ignore_ascii_case(PLACEHOLDER_FILE_NAME) {
                continue;
            }

            let file_age = age(file.created, now);
            let aging = classify_age(&self.config, file_age);
            if aging != FileAge::Current {
                self.handle_expired(location, agent_id, &file, file_age, aging, tally)
                    .await;
                continue;
            }

            let name = classify_name(&file.name);
            let Some(kind) = name.kind else {
                if starts_with_ignore_case(&file.name, DATA_MANIFEST_PREFIX)
                    || starts_with_ignore_case(&file.name, REQUEST_MANIFEST_PREFIX)
                {
                    tracing::warn!(
                        tag = %paths::file_tag(&location.cosmos_tag, agent_id, &file.name),
                        "file name starts with a reserved manifest prefix"
                    );
                } else if !starts_with_ignore_case(&file.name, COMMON_INCORRECT_DATA_PREFIX) {
                    tally.data_files += 1;
                    let partition = self.thresholds.classify(file.size);
                    metrics::record_data_file_seen(partition, file.size, file_age);
                }
                continue;
            };
            let Some(suffix) = name.suffix else {
                tracing::warn!(
                    tag = %paths::file_tag(&location.cosmos_tag, agent_id, &file.name),
                    "manifest name has no suffix; ignoring"
                );
                continue;
            };

            let own_key = pair_key(kind, suffix);
            let Some(other) = unpaired.remove(&pair_key(kind.counterpart(), suffix)) else {
                unpaired.insert(own_key, file);
                continue;
            };

            let (data, request) = match kind {
                ManifestKind::Data => (file, other),
                ManifestKind::Request => (other, file),
            };
            self.consider_pair(location, agent_id, &data, &request, now, tally)
                .await?;
        }

        Ok(())
    }

    async fn handle_expired(
        &self,
        location: &MonitorLocation,
        agent_id: &str,
        file: &FsEntry,
        file_age: Duration,
        aging: FileAge,
        tally: &mut MonitorTally,
    ) {
        let tag = paths::file_tag(&location.cosmos_tag, agent_id, &file.name);
        if aging != FileAge::Deletable {
            tracing::info!(tag = %tag, age_secs = file_age.as_secs(), "file too old to enqueue");
            tally.expired += 1;
            return;
        }

        match self.store.delete(&file.path).await {
            Ok(_) => {
                tracing::warn!(
                    path = %file.path,
                    created = %file.created,
                    age_secs = file_age.as_secs(),
                    "file exceeded delete age and was deleted"
                );
                tally.deleted += 1;
            }
            Err(e) => {
                tracing::error!(tag = %tag, error = %e, "failed to delete aged file");
            }
        }
    }

    async fn consider_pair(
        &self,
        location: &MonitorLocation,
        agent_id: &str,
        data: &FsEntry,
        request: &FsEntry,
        now: DateTime<Utc>,
        tally: &mut MonitorTally,
    ) -> Result<()> {
        let tag = paths::file_tag(&location.cosmos_tag, agent_id, &data.name);
        let batch_age = age(data.created, now).min(age(request.created, now));
        metrics::record_batch_age(batch_age);

        if batch_age < self.config.min_batch_age() {
            tracing::debug!(tag = %tag, age_secs = batch_age.as_secs(), "batch too young to enqueue");
            tally.too_young += 1;
            return Ok(());
        }

        let (pk, rk) = ManifestFileSetState::key_for(agent_id, &data.path);
        if let Some(current) = self.state.get(&pk, &rk).await? {
            let since = age(current.timestamp, now);
            if since < self.config.enqueue_interval() {
                tracing::debug!(tag = %tag, since_secs = since.as_secs(), "batch enqueued recently");
                tally.throttled += 1;
                return Ok(());
            }
        }

        let item = ManifestFileSet {
            agent_id: agent_id.to_string(),
            cosmos_tag: location.cosmos_tag.clone(),
            data_manifest_path: data.path.clone(),
            request_manifest_path: request.path.clone(),
        };
        self.queue.enqueue(&item).await?;
        tracing::info!(tag = %tag, "enqueued manifest pair");
        tally.enqueued += 1;
        Ok(())
    }
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn pair_key(kind: ManifestKind, suffix: &str) -> String {
    format!("{}_{}", kind.prefix(), suffix).to_ascii_lowercase()
}

#[async_trait]
impl WorkerTask for CosmosMonitor {
    fn name(&self) -> &'static str {
        "cosmos_monitor"
    }

    async fn run_once(&self, _instance: usize) -> Result<Duration> {
        let started = Instant::now();
        self.sweep().await?;
        Ok(self.config.repeat_delay().saturating_sub(started.elapsed()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileAge {
    Current,
    TooOldToEnqueue,
    Deletable,
}

/// Files are deleted only once strictly older than the delete age.
fn classify_age(config: &CosmosMonitorConfig, file_age: Duration) -> FileAge {
    if file_age > config.delete_age() {
        FileAge::Deletable
    } else if file_age > config.max_enqueue_age() {
        FileAge::TooOldToEnqueue
    } else {
        FileAge::Current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeDelta;
    use recon_core::object_store::MemoryObjectStore;
    use recon_core::queue::MemoryWorkQueue;
    use recon_core::table::MemoryTable;
    use std::collections::BTreeSet;

    struct Harness {
        store: Arc<MemoryObjectStore>,
        queue: Arc<MemoryWorkQueue<ManifestFileSet>>,
        state: Arc<MemoryTable<ManifestFileSetState>>,
        monitor: CosmosMonitor,
    }

    fn harness() -> Harness {
        let config = CosmosMonitorConfig {
            locations: vec![MonitorLocation {
                cosmos_tag: "c1".into(),
                root_path: "/vc1".into(),
            }],
            ..CosmosMonitorConfig::default()
        };
        let store = Arc::new(MemoryObjectStore::new());
        let queue = Arc::new(MemoryWorkQueue::new("manifests"));
        let state = Arc::new(MemoryTable::new("state"));
        let monitor = CosmosMonitor::new(
            config,
            PartitionThresholds::new(100, 1000).expect("thresholds"),
            store.clone(),
            queue.clone(),
            state.clone(),
        );
        Harness {
            store,
            queue,
            state,
            monitor,
        }
    }

    fn ago(minutes: i64) -> DateTime<Utc> {
        Utc::now() - TimeDelta::minutes(minutes)
    }

    fn put(h: &Harness, name: &str, created: DateTime<Utc>) {
        h.store
            .put_file(&format!("vc1/AgentOutput/agent1/{name}"), Bytes::from_static(b"x"), created)
            .expect("put");
    }

    #[tokio::test]
    async fn enqueues_complete_pairs_only() {
        let h = harness();
        put(&h, "DataFileManifest_2024_01_01", ago(30));
        put(&h, "RequestManifest_2024_01_01", ago(30));
        put(&h, "DataFileManifest_2024_01_02", ago(30));
        put(&h, "readme.txt", ago(30));

        let tally = h.monitor.sweep().await.expect("sweep");
        assert_eq!(tally.enqueued, 1);

        let items = h.queue.peek_all().expect("peek");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].agent_id, "agent1");
        assert_eq!(items[0].cosmos_tag, "c1");
        assert_eq!(items[0].data_manifest_path, "vc1/AgentOutput/agent1/DataFileManifest_2024_01_01");
        assert_eq!(items[0].request_manifest_path, "vc1/AgentOutput/agent1/RequestManifest_2024_01_01");
    }

    #[tokio::test]
    async fn young_pairs_wait() {
        let h = harness();
        put(&h, "DataFileManifest_a", ago(30));
        put(&h, "RequestManifest_a", ago(1));

        let tally = h.monitor.sweep().await.expect("sweep");
        assert_eq!(tally.too_young, 1);
        assert_eq!(h.queue.len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn recent_state_rows_throttle_enqueue() {
        let h = harness();
        put(&h, "DataFileManifest_a", ago(30));
        put(&h, "RequestManifest_a", ago(30));
        let row = ManifestFileSetState {
            agent_id: "agent1".into(),
            manifest_path: "vc1/AgentOutput/agent1/DataFileManifest_a".into(),
            request_manifest_path: "vc1/AgentOutput/agent1/RequestManifest_a".into(),
            data_file_tags: BTreeSet::new(),
            dispatched_file_tags: BTreeSet::new(),
            data_file_manifest_create_time: ago(30),
            data_file_manifest_hash: None,
            request_manifest_create_time: ago(30),
            request_manifest_hash: None,
            counter: 0,
        };
        h.state.seed(row.clone(), ago(5)).expect("seed");

        let tally = h.monitor.sweep().await.expect("sweep");
        assert_eq!(tally.throttled, 1);

        h.state.seed(row, ago(120)).expect("seed");
        let tally = h.monitor.sweep().await.expect("sweep");
        assert_eq!(tally.enqueued, 1);
    }

    #[tokio::test]
    async fn aged_files_are_skipped_or_deleted() {
        let h = harness();
        let day = 24 * 60;
        put(&h, "DataFileManifest_old", ago(25 * day));
        put(&h, "RequestManifest_old", ago(25 * day));
        put(&h, "datafile_ancient", ago(31 * day));

        let tally = h.monitor.sweep().await.expect("sweep");
        assert_eq!(tally.expired, 2);
        assert_eq!(tally.deleted, 1);
        assert_eq!(tally.enqueued, 0);
        assert!(!h.store.exists("vc1/AgentOutput/agent1/datafile_ancient").expect("exists"));
        assert!(h.store.exists("vc1/AgentOutput/agent1/DataFileManifest_old").expect("exists"));
    }

    #[test]
    fn files_at_the_delete_age_are_kept() {
        let config = CosmosMonitorConfig::default();
        let delete_age = config.delete_age();
        let second = Duration::from_secs(1);

        assert_eq!(classify_age(&config, config.max_enqueue_age()), FileAge::Current);
        assert_eq!(
            classify_age(&config, config.max_enqueue_age() + second),
            FileAge::TooOldToEnqueue
        );
        assert_eq!(classify_age(&config, delete_age), FileAge::TooOldToEnqueue);
        assert_eq!(classify_age(&config, delete_age + second), FileAge::Deletable);
    }

    #[tokio::test]
    async fn missing_root_is_not_an_error() {
        let h = harness();
        let tally = h.monitor.sweep().await.expect("sweep");
        assert_eq!(tally, MonitorTally::default());
    }

    #[tokio::test]
    async fn pass_delay_counts_down_from_repeat_delay() {
        let h = harness();
        let delay = h.monitor.run_once(0).await.expect("pass");
        assert!(delay <= h.monitor.config.repeat_delay());
        assert!(delay > Duration::ZERO);
    }
}
