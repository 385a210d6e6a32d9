//! Data manifest reconciliation.
//!
//! The processor takes one [`ManifestFileSet`] at a time, classifies the
//! commands of its request manifest and fans the data files of its data
//! manifest out to the size-partitioned file queue.
//!
//! # Idempotent fan-out
//!
//! Work items are delivered at least once, so a manifest can be processed
//! many times. The `ManifestFileSetState` row remembers what was dispatched:
//!
//! 1. No row: every resolved file is dispatched.
//! 2. The data manifest changed (its stored hash differs, or without a hash
//!    its create time differs): every resolved file is dispatched again and
//!    the row is reset to the resolved set.
//! 3. The resolved set is a strict subset of what was dispatched before:
//!    nothing is dispatched. Files disappearing never redrive work.
//! 4. Otherwise only files not dispatched before go out.
//!
//! Outstanding tags are written with the row version before anything is
//! enqueued, so completions never drain the row early. A tag joins
//! `dispatched_file_tags` only once its work item is queued; files a failed
//! pass did not send are picked up again on redelivery.
//!
//! # Claims
//!
//! A manifest is guarded by a lease on `(agent_id, data_manifest_path)`.
//! The lease and the queue item are renewed together at renewal points; a
//! lost lease aborts the pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::Instrument;
use ulid::Ulid;

use recon_core::error::{Error, Result};
use recon_core::hash::unordered_hash;
use recon_core::lease::LeaseManager;
use recon_core::manifest::{
    ResolveContext, ResolvedDataFile, parse_command_ids, parse_templates, resolve_data_files,
};
use recon_core::model::{CompleteDataFile, ManifestFileSet, ManifestFileSetState, PendingDataFile};
use recon_core::object_store::ObjectStore;
use recon_core::observability::manifest_span;
use recon_core::partition::{FileSizePartition, PartitionThresholds};
use recon_core::queue::{PartitionedWorkQueue, QueueItem, WorkQueue};
use recon_core::table::TableStore;
use recon_core::time::age;

use crate::authority::{CommandStatusAuthority, CommandSummary};
use crate::config::DataManifestProcessorConfig;
use crate::metrics;
use crate::renewer::{LeaseRenewer, Renew};
use crate::runner::{IDLE_DELAY, WorkerTask};

const TASK_NAME: &str = "data_manifest_processor";

/// Attempts at recording dispatched tags against concurrent completions.
const MARK_DISPATCHED_ATTEMPTS: u32 = 5;

/// How a pass chose the files to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutKind {
    /// First pass over the manifest.
    Fresh,
    /// The data manifest changed since it was recorded.
    ManifestChanged,
    /// Only files not dispatched before.
    NewFiles,
    /// The manifest lost files; nothing dispatched.
    NonProgress,
}

/// Result of processing one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestOutcome {
    /// The queue was empty.
    Idle,
    /// The item exceeded the dequeue limit and was dropped.
    Discarded,
    /// Another worker holds the manifest lease; the item was dropped.
    LeaseHeld,
    /// A manifest of the pair no longer exists; the item was dropped.
    ManifestsMissing,
    /// Commands are unresolved; the item becomes visible again later.
    Deferred,
    /// Files were reconciled.
    Processed {
        /// How the dispatched files were chosen.
        kind: FanOutKind,
        /// Files sent to the partitioned queue.
        dispatched: usize,
        /// Completion items enqueued without a file worker.
        completed_directly: usize,
    },
}

/// Manifest metadata observed on this pass.
#[derive(Debug, Clone, Copy)]
struct Observed {
    data_created: DateTime<Utc>,
    data_hash: i32,
    request_created: DateTime<Utc>,
    request_hash: i32,
}

/// Files chosen for dispatch and whether the manifest has nothing outstanding.
#[derive(Debug)]
struct FanOutPlan {
    kind: FanOutKind,
    files: Vec<ResolvedDataFile>,
    drained: bool,
}

/// Reconciles manifest pairs and fans out their data files.
pub struct DataManifestProcessor {
    config: DataManifestProcessorConfig,
    thresholds: PartitionThresholds,
    owner: String,
    store: Arc<dyn ObjectStore>,
    manifest_queue: Arc<dyn WorkQueue<ManifestFileSet>>,
    pending_queue: Arc<dyn PartitionedWorkQueue<PendingDataFile, FileSizePartition>>,
    complete_queue: Arc<dyn WorkQueue<CompleteDataFile>>,
    state: Arc<dyn TableStore<ManifestFileSetState>>,
    leases: Arc<dyn LeaseManager>,
    authority: Arc<dyn CommandStatusAuthority>,
}

impl std::fmt::Debug for DataManifestProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManifestProcessor")
            .field("owner", &self.owner)
            .field("manifest_queue", &self.manifest_queue.name())
            .field("state", &self.state.name())
            .finish_non_exhaustive()
    }
}

impl DataManifestProcessor {
    /// Creates a processor.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the configured size thresholds are
    /// not increasing.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DataManifestProcessorConfig,
        store: Arc<dyn ObjectStore>,
        manifest_queue: Arc<dyn WorkQueue<ManifestFileSet>>,
        pending_queue: Arc<dyn PartitionedWorkQueue<PendingDataFile, FileSizePartition>>,
        complete_queue: Arc<dyn WorkQueue<CompleteDataFile>>,
        state: Arc<dyn TableStore<ManifestFileSetState>>,
        leases: Arc<dyn LeaseManager>,
        authority: Arc<dyn CommandStatusAuthority>,
    ) -> Result<Self> {
        let thresholds = config.thresholds()?;
        Ok(Self {
            config,
            thresholds,
            owner: format!("{TASK_NAME}-{}", Ulid::new()),
            store,
            manifest_queue,
            pending_queue,
            complete_queue,
            state,
            leases,
            authority,
        })
    }

    /// Lease owner id of this processor.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Takes one work item from the manifest queue and processes it.
    ///
    /// # Errors
    ///
    /// Returns collaborator errors and `Error::Contention` when another
    /// writer updated the state row first. The lease is released and the item
    /// is left to be redelivered after `delayIfCouldNotCompleteMinutes`.
    pub async fn process_next(&self) -> Result<ManifestOutcome> {
        let Some(item) = self.manifest_queue.dequeue(self.config.lease()).await? else {
            return Ok(ManifestOutcome::Idle);
        };
        let span = manifest_span(&item.data.agent_id, &item.data.data_manifest_path);
        self.process_item(item).instrument(span).await
    }

    async fn process_item(&self, item: QueueItem<ManifestFileSet>) -> Result<ManifestOutcome> {
        let set = &item.data;

        if item.dequeue_count > self.config.max_dequeue_count {
            tracing::error!(
                dequeue_count = item.dequeue_count,
                max_dequeue_count = self.config.max_dequeue_count,
                "discarding manifest item that exceeded the dequeue limit"
            );
            metrics::record_poison_discarded(TASK_NAME);
            self.manifest_queue.complete(&item.receipt).await?;
            return Ok(ManifestOutcome::Discarded);
        }

        let acquired = self
            .leases
            .attempt_acquire(
                &set.agent_id,
                &set.data_manifest_path,
                &self.owner,
                self.config.lease(),
                false,
            )
            .await?;
        let Some(lease) = acquired else {
            tracing::info!("manifest is leased by another worker; dropping item");
            metrics::record_lease_not_acquired(TASK_NAME);
            self.manifest_queue.complete(&item.receipt).await?;
            return Ok(ManifestOutcome::LeaseHeld);
        };

        let renewer = LeaseRenewer::new(
            Arc::clone(&self.leases),
            lease,
            Arc::clone(&self.manifest_queue),
            item.receipt.clone(),
            self.config.lease(),
            self.config.minimum_renew(),
        );

        match self.reconcile(set, &renewer).await {
            Ok(ManifestOutcome::Deferred) => {
                self.leases.release(renewer.lease(), false).await?;
                self.manifest_queue
                    .renew_lease(&item.receipt, self.config.delay_if_could_not_complete())
                    .await?;
                Ok(ManifestOutcome::Deferred)
            }
            Ok(outcome) => {
                let released = self.leases.release(renewer.lease(), true).await;
                let completed = self.manifest_queue.complete(&item.receipt).await;
                released?;
                completed?;
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(error = %e, "manifest reconciliation failed");
                if let Err(release_err) = self.leases.release(renewer.lease(), false).await {
                    tracing::warn!(error = %release_err, "failed to release manifest lease");
                }
                if let Err(renew_err) = self
                    .manifest_queue
                    .renew_lease(&item.receipt, self.config.delay_if_could_not_complete())
                    .await
                {
                    tracing::warn!(error = %renew_err, "failed to delay manifest item");
                }
                Err(e)
            }
        }
    }

    async fn reconcile(&self, set: &ManifestFileSet, renewer: &dyn Renew) -> Result<ManifestOutcome> {
        let (data_entry, request_entry) = tokio::try_join!(
            self.store.open_file(&set.data_manifest_path),
            self.store.open_file(&set.request_manifest_path),
        )?;
        let (Some(data_entry), Some(request_entry)) = (data_entry, request_entry) else {
            tracing::warn!("manifest pair no longer exists");
            return Ok(ManifestOutcome::ManifestsMissing);
        };

        let (data_content, request_content) = tokio::try_join!(
            self.store.read(&set.data_manifest_path),
            self.store.read(&set.request_manifest_path),
        )?;
        let (Some(data_content), Some(request_content)) = (data_content, request_content) else {
            tracing::warn!("manifest pair vanished while being read");
            return Ok(ManifestOutcome::ManifestsMissing);
        };

        let templates = parse_templates(&data_content, &data_entry.name);
        let commands = parse_command_ids(&request_content, &request_entry.name);
        if commands.duplicates > 0 {
            tracing::warn!(
                duplicates = commands.duplicates,
                manifest = %request_entry.name,
                "request manifest lists duplicate command ids"
            );
        }
        let resolved = resolve_data_files(
            &templates,
            &ResolveContext {
                cosmos_tag: &set.cosmos_tag,
                agent_id: &set.agent_id,
                manifest_path: &set.data_manifest_path,
                manifest_created: data_entry.created,
                export_extension: &self.config.export_file_extension,
            },
        );
        renewer.renew().await?;

        let batch_age = age(request_entry.created, Utc::now());
        let max_wait = self.config.max_command_wait();
        let is_old = batch_age > max_wait;

        let info = self
            .authority
            .determine_command_status(&set.agent_id, &commands.ids, renewer, is_old)
            .await?;
        let deferred = !is_old && info.has_unresolved();
        self.authority
            .report_command_summary(&CommandSummary {
                agent_id: set.agent_id.clone(),
                manifest_name: request_entry.name.clone(),
                info,
                batch_age,
                max_wait,
                is_old,
            })
            .await?;
        if deferred {
            metrics::record_manifest_deferred();
            return Ok(ManifestOutcome::Deferred);
        }

        let observed = Observed {
            data_created: data_entry.created,
            data_hash: unordered_hash(&templates),
            request_created: request_entry.created,
            request_hash: unordered_hash(&commands.ids),
        };
        let plan = self.record_state(set, &resolved, observed).await?;
        self.dispatch(set, plan, renewer).await
    }

    /// Writes the state row and decides which files go out on this pass.
    async fn record_state(
        &self,
        set: &ManifestFileSet,
        resolved: &[ResolvedDataFile],
        observed: Observed,
    ) -> Result<FanOutPlan> {
        let (pk, rk) = ManifestFileSetState::key_for(&set.agent_id, &set.data_manifest_path);
        let resolved_tags: BTreeSet<String> = resolved.iter().map(|f| f.tag.clone()).collect();

        let existing = match self.state.get(&pk, &rk).await? {
            Some(existing) => existing,
            None => {
                let row = ManifestFileSetState {
                    agent_id: set.agent_id.clone(),
                    manifest_path: set.data_manifest_path.clone(),
                    request_manifest_path: set.request_manifest_path.clone(),
                    data_file_tags: resolved_tags.clone(),
                    dispatched_file_tags: BTreeSet::new(),
                    data_file_manifest_create_time: observed.data_created,
                    data_file_manifest_hash: Some(observed.data_hash),
                    request_manifest_create_time: observed.request_created,
                    request_manifest_hash: Some(observed.request_hash),
                    counter: 0,
                };
                if self.state.insert(&row).await? {
                    tracing::info!(files = resolved.len(), "recorded new manifest state");
                    return Ok(FanOutPlan {
                        kind: FanOutKind::Fresh,
                        files: resolved.to_vec(),
                        drained: row.data_file_tags.is_empty(),
                    });
                }
                tracing::info!("manifest state inserted concurrently; merging");
                self.state.get(&pk, &rk).await?.ok_or_else(|| {
                    Error::contention(format!(
                        "state row for {} vanished after a conflicting insert",
                        set.data_manifest_path
                    ))
                })?
            }
        };

        let version = existing.exact();
        let mut row = existing.row;

        let (kind, files) = if data_manifest_changed(&row, observed) {
            tracing::warn!(
                stored_hash = ?row.data_file_manifest_hash,
                current_hash = observed.data_hash,
                stored_created = %row.data_file_manifest_create_time,
                current_created = %observed.data_created,
                "data manifest changed since it was first processed; dispatching all files"
            );
            row.data_file_tags.clone_from(&resolved_tags);
            row.dispatched_file_tags.clear();
            (FanOutKind::ManifestChanged, resolved.to_vec())
        } else if resolved_tags.len() < row.dispatched_file_tags.len()
            && resolved_tags.is_subset(&row.dispatched_file_tags)
        {
            tracing::warn!(
                resolved = resolved_tags.len(),
                dispatched = row.dispatched_file_tags.len(),
                "manifest lists fewer files than were dispatched; not redispatching"
            );
            (FanOutKind::NonProgress, Vec::new())
        } else {
            let files: Vec<ResolvedDataFile> = resolved
                .iter()
                .filter(|f| !row.dispatched_file_tags.contains(&f.tag))
                .cloned()
                .collect();
            for file in &files {
                row.data_file_tags.insert(file.tag.clone());
            }
            (FanOutKind::NewFiles, files)
        };
        row.data_file_manifest_hash = Some(observed.data_hash);
        row.data_file_manifest_create_time = observed.data_created;

        if request_manifest_changed(&row, observed) {
            tracing::warn!(
                stored_hash = ?row.request_manifest_hash,
                current_hash = observed.request_hash,
                "request manifest changed since it was first processed"
            );
        }
        row.request_manifest_hash = Some(observed.request_hash);
        row.request_manifest_create_time = observed.request_created;
        row.request_manifest_path.clone_from(&set.request_manifest_path);
        row.counter = row.counter.saturating_add(1);

        if !self.state.replace(&row, &version).await? {
            return Err(Error::contention(format!(
                "state row for {} was updated concurrently",
                set.data_manifest_path
            )));
        }

        tracing::info!(
            kind = ?kind,
            files = files.len(),
            outstanding = row.data_file_tags.len(),
            counter = row.counter,
            "updated manifest state"
        );
        Ok(FanOutPlan {
            kind,
            files,
            drained: row.data_file_tags.is_empty(),
        })
    }

    /// Queues the planned files, then records the ones that went out.
    ///
    /// Tags are marked dispatched only after their work item is queued, so a
    /// failed pass leaves the rest to be selected again on redelivery.
    async fn dispatch(
        &self,
        set: &ManifestFileSet,
        plan: FanOutPlan,
        renewer: &dyn Renew,
    ) -> Result<ManifestOutcome> {
        let mut per_partition: BTreeMap<FileSizePartition, u64> = BTreeMap::new();
        let mut sent = BTreeSet::new();
        let mut dispatched = 0;
        let mut completed_directly = 0;
        let mut failure = None;

        for file in &plan.files {
            match self.send_file(set, file).await {
                Ok(Some(partition)) => {
                    *per_partition.entry(partition).or_default() += 1;
                    dispatched += 1;
                }
                Ok(None) => completed_directly += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            sent.insert(file.tag.clone());
            if let Err(e) = renewer.renew().await {
                failure = Some(e);
                break;
            }
        }

        for (partition, count) in per_partition {
            metrics::record_files_dispatched(partition, count);
        }

        let marked = self.mark_dispatched(set, &sent).await;
        if let Some(e) = failure {
            tracing::warn!(
                sent = sent.len(),
                planned = plan.files.len(),
                "fan-out stopped early; unsent files go out on redelivery"
            );
            if let Err(mark_err) = marked {
                tracing::warn!(error = %mark_err, "failed to record dispatched files");
            }
            return Err(e);
        }
        marked?;

        // Nothing left to wait for: drive finalization directly.
        if plan.files.is_empty() && plan.drained {
            tracing::info!("manifest has no outstanding data files");
            self.complete_queue
                .enqueue(&completion(set, String::new()))
                .await?;
            completed_directly += 1;
        }

        Ok(ManifestOutcome::Processed {
            kind: plan.kind,
            dispatched,
            completed_directly,
        })
    }

    /// Queues one data file, or completes it directly when it is missing.
    /// Returns the partition it was queued on.
    async fn send_file(
        &self,
        set: &ManifestFileSet,
        file: &ResolvedDataFile,
    ) -> Result<Option<FileSizePartition>> {
        let Some(entry) = self.store.open_file(&file.path).await? else {
            tracing::warn!(tag = %file.tag, "data file listed in manifest does not exist");
            self.complete_queue
                .enqueue(&completion(set, file.path.clone()))
                .await?;
            return Ok(None);
        };

        let partition = self.thresholds.classify(entry.size);
        let pending = PendingDataFile {
            agent_id: set.agent_id.clone(),
            cosmos_tag: set.cosmos_tag.clone(),
            manifest_path: set.data_manifest_path.clone(),
            data_file_path: file.path.clone(),
            export_file_name: file.export_name.clone(),
        };
        self.pending_queue.enqueue(partition, &pending).await?;
        tracing::debug!(tag = %file.tag, partition = %partition, size = entry.size, "dispatched data file");
        Ok(Some(partition))
    }

    async fn mark_dispatched(&self, set: &ManifestFileSet, tags: &BTreeSet<String>) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let (pk, rk) = ManifestFileSetState::key_for(&set.agent_id, &set.data_manifest_path);

        for attempt in 1..=MARK_DISPATCHED_ATTEMPTS {
            let Some(existing) = self.state.get(&pk, &rk).await? else {
                tracing::debug!("manifest state already finalized");
                return Ok(());
            };
            let version = existing.exact();
            let mut row = existing.row;
            if tags.is_subset(&row.dispatched_file_tags) {
                return Ok(());
            }
            row.dispatched_file_tags.extend(tags.iter().cloned());
            if self.state.replace(&row, &version).await? {
                return Ok(());
            }
            tracing::debug!(attempt, "manifest state changed while recording dispatched files");
        }

        Err(Error::contention(format!(
            "could not record dispatched files for {} after {MARK_DISPATCHED_ATTEMPTS} attempts",
            set.data_manifest_path
        )))
    }
}

fn completion(set: &ManifestFileSet, data_file_path: String) -> CompleteDataFile {
    CompleteDataFile {
        agent_id: set.agent_id.clone(),
        cosmos_tag: set.cosmos_tag.clone(),
        manifest_path: set.data_manifest_path.clone(),
        data_file_path,
    }
}

/// A stored hash decides; the create time only counts when no hash was stored.
fn data_manifest_changed(row: &ManifestFileSetState, observed: Observed) -> bool {
    match row.data_file_manifest_hash {
        Some(hash) => hash != observed.data_hash,
        None => row.data_file_manifest_create_time != observed.data_created,
    }
}

fn request_manifest_changed(row: &ManifestFileSetState, observed: Observed) -> bool {
    match row.request_manifest_hash {
        Some(hash) => hash != observed.request_hash,
        None => row.request_manifest_create_time != observed.request_created,
    }
}

#[async_trait]
impl WorkerTask for DataManifestProcessor {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    async fn run_once(&self, _instance: usize) -> Result<Duration> {
        match self.process_next().await? {
            ManifestOutcome::Idle => Ok(IDLE_DELAY),
            _ => Ok(Duration::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::TableCommandStatusAuthority;
    use chrono::TimeDelta;
    use recon_core::model::CommandState;
    use recon_test_utils::{
        ManifestFixture, QueueOp, TracingLeaseManager, TracingObjectStore,
        TracingPartitionedQueue, TracingTable, TracingWorkQueue,
    };

    struct Harness {
        store: Arc<TracingObjectStore>,
        manifests: Arc<TracingWorkQueue<ManifestFileSet>>,
        pending: Arc<TracingPartitionedQueue<PendingDataFile, FileSizePartition>>,
        complete: Arc<TracingWorkQueue<CompleteDataFile>>,
        state: Arc<TracingTable<ManifestFileSetState>>,
        commands: Arc<TracingTable<CommandState>>,
        leases: Arc<TracingLeaseManager>,
        processor: DataManifestProcessor,
    }

    fn harness_with(config: DataManifestProcessorConfig) -> Harness {
        let store = Arc::new(TracingObjectStore::new());
        let manifests = Arc::new(TracingWorkQueue::new("manifests"));
        let pending = Arc::new(TracingPartitionedQueue::new("pending", FileSizePartition::ALL));
        let complete = Arc::new(TracingWorkQueue::new("complete"));
        let state = Arc::new(TracingTable::new("state"));
        let commands = Arc::new(TracingTable::new("commands"));
        let leases = Arc::new(TracingLeaseManager::new());
        let authority = Arc::new(TableCommandStatusAuthority::new(commands.clone()));
        let processor = DataManifestProcessor::new(
            config,
            store.clone(),
            manifests.clone(),
            pending.clone(),
            complete.clone(),
            state.clone(),
            leases.clone(),
            authority,
        )
        .expect("processor");
        Harness {
            store,
            manifests,
            pending,
            complete,
            state,
            commands,
            leases,
            processor,
        }
    }

    fn harness() -> Harness {
        harness_with(DataManifestProcessorConfig {
            medium_file_size_threshold: 10,
            large_file_size_threshold: 100,
            ..DataManifestProcessorConfig::default()
        })
    }

    async fn submit(h: &Harness, fixture: &ManifestFixture) {
        fixture.write(&h.store);
        h.manifests.enqueue(&fixture.file_set()).await.expect("enqueue");
        for id in ["c1", "c2"] {
            h.commands
                .seed(CommandState::pending(fixture.agent_id(), id), Utc::now());
        }
    }

    async fn state_row(h: &Harness, fixture: &ManifestFixture) -> ManifestFileSetState {
        let (pk, rk) = ManifestFileSetState::key_for(fixture.agent_id(), &fixture.data_manifest_path());
        h.state.row(&pk, &rk).await.expect("state row")
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let h = harness();
        assert_eq!(h.processor.process_next().await.expect("process"), ManifestOutcome::Idle);
        assert_eq!(h.processor.run_once(0).await.expect("run"), IDLE_DELAY);
    }

    #[tokio::test]
    async fn poison_items_are_discarded_without_a_lease_attempt() {
        let h = harness_with(DataManifestProcessorConfig {
            max_dequeue_count: 1,
            ..DataManifestProcessorConfig::default()
        });
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00").with_command("c1");
        submit(&h, &fixture).await;
        // First delivery is abandoned immediately.
        h.manifests.dequeue(Duration::ZERO).await.expect("dequeue").expect("item");

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(outcome, ManifestOutcome::Discarded);
        assert_eq!(h.leases.acquire_attempts(), 0);
        assert_eq!(h.manifests.len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn held_lease_drops_item_without_touching_the_store() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00").with_command("c1");
        submit(&h, &fixture).await;
        h.leases
            .hold("agent1", &fixture.data_manifest_path(), Duration::from_secs(600))
            .await;
        h.store.clear_operations();

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(outcome, ManifestOutcome::LeaseHeld);
        assert_eq!(h.store.read_count(), 0);
        assert_eq!(h.manifests.count(&QueueOp::Complete), 1);
    }

    #[tokio::test]
    async fn files_are_routed_by_size() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_data_file("EMPTY_1.txt", 0)
            .with_data_file("SMALL_1.txt", 9)
            .with_data_file("MEDIUM_1.txt", 10)
            .with_data_file("MEDIUM_2.txt", 99)
            .with_data_file("LARGE_1.txt", 100);
        submit(&h, &fixture).await;

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(
            outcome,
            ManifestOutcome::Processed {
                kind: FanOutKind::Fresh,
                dispatched: 5,
                completed_directly: 0,
            }
        );
        assert_eq!(h.pending.items(FileSizePartition::Empty).len(), 1);
        assert_eq!(h.pending.items(FileSizePartition::Small).len(), 1);
        assert_eq!(h.pending.items(FileSizePartition::Medium).len(), 2);
        let large = h.pending.items(FileSizePartition::Large);
        assert_eq!(large.len(), 1);
        assert_eq!(large[0].export_file_name, "LARGE.json");
        assert_eq!(large[0].data_file_path, fixture.data_file_path("LARGE_1.txt"));

        let row = state_row(&h, &fixture).await;
        assert_eq!(row.data_file_tags.len(), 5);
        assert_eq!(row.counter, 0);
        assert_eq!(h.manifests.len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn manifest_without_files_completes_directly() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00").with_command("c1");
        submit(&h, &fixture).await;

        h.processor.process_next().await.expect("process");

        let completions = h.complete.items();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].data_file_path.is_empty());
        assert_eq!(completions[0].manifest_path, fixture.data_manifest_path());
        assert!(state_row(&h, &fixture).await.data_file_tags.is_empty());
    }

    #[tokio::test]
    async fn missing_data_files_complete_directly() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_data_file("F1.txt", 5)
            .with_missing_data_file("F2.txt");
        submit(&h, &fixture).await;

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(
            outcome,
            ManifestOutcome::Processed {
                kind: FanOutKind::Fresh,
                dispatched: 1,
                completed_directly: 1,
            }
        );
        assert_eq!(h.complete.items()[0].data_file_path, fixture.data_file_path("F2.txt"));
    }

    #[tokio::test]
    async fn redelivery_dispatches_only_new_files() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_data_file("F1.txt", 5)
            .with_data_file("F2.txt", 5);
        submit(&h, &fixture).await;
        let created = h
            .store
            .inner()
            .open_file(&fixture.data_manifest_path())
            .await
            .expect("open")
            .expect("manifest")
            .created;
        let f1: BTreeSet<String> = [fixture.tag("F1.txt")].into();
        h.state.seed(
            ManifestFileSetState {
                agent_id: "agent1".into(),
                manifest_path: fixture.data_manifest_path(),
                request_manifest_path: fixture.request_manifest_path(),
                data_file_tags: f1.clone(),
                dispatched_file_tags: f1,
                data_file_manifest_create_time: created,
                data_file_manifest_hash: None,
                request_manifest_create_time: created,
                request_manifest_hash: None,
                counter: 0,
            },
            Utc::now(),
        );

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(
            outcome,
            ManifestOutcome::Processed {
                kind: FanOutKind::NewFiles,
                dispatched: 1,
                completed_directly: 0,
            }
        );
        let small = h.pending.items(FileSizePartition::Small);
        assert_eq!(small.len(), 1);
        assert_eq!(small[0].data_file_path, fixture.data_file_path("F2.txt"));

        let row = state_row(&h, &fixture).await;
        assert_eq!(row.counter, 1);
        assert_eq!(row.data_file_tags.len(), 2);
        assert!(row.data_file_manifest_hash.is_some());
    }

    #[tokio::test]
    async fn changed_hash_redispatches_everything() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_data_file("F1.txt", 5)
            .with_data_file("F2.txt", 5);
        submit(&h, &fixture).await;
        h.processor.process_next().await.expect("first pass");

        // Same hash, older-looking create time: nothing new goes out.
        let (pk, rk) = ManifestFileSetState::key_for("agent1", &fixture.data_manifest_path());
        let mut row = h.state.row(&pk, &rk).await.expect("row");
        row.data_file_manifest_create_time -= TimeDelta::days(1);
        h.state.seed(row.clone(), Utc::now());
        h.manifests.enqueue(&fixture.file_set()).await.expect("enqueue");
        let outcome = h.processor.process_next().await.expect("second pass");
        assert!(matches!(outcome, ManifestOutcome::Processed { dispatched: 0, .. }));

        // Different hash: both files go out again.
        row.data_file_manifest_hash = Some(row.data_file_manifest_hash.expect("hash") ^ 1);
        h.state.seed(row, Utc::now());
        h.manifests.enqueue(&fixture.file_set()).await.expect("enqueue");
        let outcome = h.processor.process_next().await.expect("third pass");
        assert_eq!(
            outcome,
            ManifestOutcome::Processed {
                kind: FanOutKind::ManifestChanged,
                dispatched: 2,
                completed_directly: 0,
            }
        );
        assert_eq!(h.pending.items(FileSizePartition::Small).len(), 4);
    }

    #[tokio::test]
    async fn truncated_manifest_is_not_progress() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_data_file("F1.txt", 5)
            .with_data_file("F2.txt", 5);
        submit(&h, &fixture).await;
        h.processor.process_next().await.expect("first pass");

        // The stored hash is cleared so only the file sets are compared.
        let (pk, rk) = ManifestFileSetState::key_for("agent1", &fixture.data_manifest_path());
        let mut row = h.state.row(&pk, &rk).await.expect("row");
        row.data_file_manifest_hash = None;
        h.state.seed(row, Utc::now());
        let created = h
            .store
            .inner()
            .open_file(&fixture.data_manifest_path())
            .await
            .expect("open")
            .expect("manifest")
            .created;
        let truncated = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_data_file("F1.txt", 5)
            .created_at(created);
        truncated.write_data_manifest(&h.store);
        h.manifests.enqueue(&fixture.file_set()).await.expect("enqueue");

        let outcome = h.processor.process_next().await.expect("second pass");

        assert_eq!(
            outcome,
            ManifestOutcome::Processed {
                kind: FanOutKind::NonProgress,
                dispatched: 0,
                completed_directly: 0,
            }
        );
    }

    #[tokio::test]
    async fn unresolved_commands_defer_young_manifests() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_command("unknown")
            .with_data_file("F1.txt", 5);
        submit(&h, &fixture).await;

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(outcome, ManifestOutcome::Deferred);
        assert!(h.state.is_empty());
        assert_eq!(h.manifests.len().await.expect("len"), 1);
        assert_eq!(
            h.manifests.count(&QueueOp::RenewLease {
                visibility: Duration::from_secs(5 * 60)
            }),
            1
        );
    }

    #[tokio::test]
    async fn old_manifests_proceed_despite_missing_commands() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("unknown")
            .with_data_file("F1.txt", 5)
            .created_at(Utc::now() - TimeDelta::hours(3));
        submit(&h, &fixture).await;

        let outcome = h.processor.process_next().await.expect("process");

        assert!(matches!(outcome, ManifestOutcome::Processed { dispatched: 1, .. }));
    }

    #[tokio::test]
    async fn vanished_manifests_complete_the_item() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00").with_command("c1");
        h.manifests.enqueue(&fixture.file_set()).await.expect("enqueue");

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(outcome, ManifestOutcome::ManifestsMissing);
        assert_eq!(h.manifests.len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn state_conflicts_fail_the_pass_and_keep_the_item() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_data_file("F1.txt", 5);
        submit(&h, &fixture).await;
        h.processor.process_next().await.expect("first pass");
        h.manifests.enqueue(&fixture.file_set()).await.expect("enqueue");
        h.state.conflict_next_replaces(1);

        let err = h.processor.process_next().await.expect_err("conflict");

        assert!(matches!(err, Error::Contention { .. }));
        assert_eq!(h.manifests.len().await.expect("len"), 1);
        assert_eq!(h.pending.items(FileSizePartition::Small).len(), 1);
    }

    #[tokio::test]
    async fn failed_fan_out_leaves_unsent_files_for_redelivery() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_data_file("F1.txt", 5)
            .with_data_file("F2.txt", 5);
        submit(&h, &fixture).await;
        h.store.inject_failure(fixture.data_file_path("F2.txt"));

        let err = h.processor.process_next().await.expect_err("fan-out failure");

        assert!(matches!(err, Error::Storage { .. }));
        let row = state_row(&h, &fixture).await;
        assert_eq!(row.data_file_tags.len(), 2);
        assert_eq!(row.dispatched_file_tags, [fixture.tag("F1.txt")].into());

        h.store.clear_failures();
        h.manifests.enqueue(&fixture.file_set()).await.expect("redeliver");
        let outcome = h.processor.process_next().await.expect("second pass");

        assert_eq!(
            outcome,
            ManifestOutcome::Processed {
                kind: FanOutKind::NewFiles,
                dispatched: 1,
                completed_directly: 0,
            }
        );
        let small = h.pending.items(FileSizePartition::Small);
        assert_eq!(small.len(), 2);
        assert_eq!(small[1].data_file_path, fixture.data_file_path("F2.txt"));
        let row = state_row(&h, &fixture).await;
        assert_eq!(row.dispatched_file_tags.len(), 2);
        assert_eq!(row.counter, 1);
    }

    #[tokio::test]
    async fn lost_state_insert_merges_with_the_winning_row() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_data_file("F1.txt", 5)
            .with_data_file("F2.txt", 5);
        submit(&h, &fixture).await;
        let created = h
            .store
            .inner()
            .open_file(&fixture.data_manifest_path())
            .await
            .expect("open")
            .expect("manifest")
            .created;
        // Another worker records F1 between our read and our insert.
        let f1: BTreeSet<String> = [fixture.tag("F1.txt")].into();
        h.state.race_next_insert(ManifestFileSetState {
            agent_id: "agent1".into(),
            manifest_path: fixture.data_manifest_path(),
            request_manifest_path: fixture.request_manifest_path(),
            data_file_tags: f1.clone(),
            dispatched_file_tags: f1,
            data_file_manifest_create_time: created,
            data_file_manifest_hash: None,
            request_manifest_create_time: created,
            request_manifest_hash: None,
            counter: 0,
        });

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(
            outcome,
            ManifestOutcome::Processed {
                kind: FanOutKind::NewFiles,
                dispatched: 1,
                completed_directly: 0,
            }
        );
        let small = h.pending.items(FileSizePartition::Small);
        assert_eq!(small.len(), 1);
        assert_eq!(small[0].data_file_path, fixture.data_file_path("F2.txt"));
        let row = state_row(&h, &fixture).await;
        assert_eq!(row.counter, 1);
        assert_eq!(row.data_file_tags.len(), 2);
        assert_eq!(row.dispatched_file_tags.len(), 2);
        assert!(row.data_file_manifest_hash.is_some());
    }

    #[tokio::test]
    async fn store_failures_release_the_lease() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00").with_command("c1");
        submit(&h, &fixture).await;
        h.store.inject_failure(fixture.agent_dir());

        assert!(h.processor.process_next().await.is_err());
        // Released leases can be taken again at once.
        h.leases
            .hold("agent1", &fixture.data_manifest_path(), Duration::from_secs(60))
            .await;
    }
}
