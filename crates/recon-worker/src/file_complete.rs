//! Data file completion and manifest finalization.
//!
//! Every finished data file produces a [`CompleteDataFile`]. The processor
//! removes the file's tag from the manifest state row; when the last tag is
//! gone it finalizes the manifest:
//!
//! 1. Marks every command of the request manifest complete. Ignored commands
//!    are deleted instead; ids without a row are logged.
//! 2. Moves both manifests to the holding area with a bounded lifetime.
//! 3. Deletes the state row.
//!
//! The row is deleted last, so a pass that fails part way leaves everything
//! needed to finish on redelivery.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use recon_core::error::Result;
use recon_core::manifest::parse_command_ids;
use recon_core::model::{CommandState, CompleteDataFile, ManifestFileSetState};
use recon_core::object_store::ObjectStore;
use recon_core::observability::manifest_span;
use recon_core::paths::{self, escape_key};
use recon_core::queue::{QueueItem, WorkQueue};
use recon_core::table::{RowFilter, RowVersion, TableStore, Versioned};

use crate::config::FileCompleteProcessorConfig;
use crate::metrics;
use crate::renewer::{Renew, VisibilityRenewer};
use crate::runner::{IDLE_DELAY, WorkerTask};

const TASK_NAME: &str = "file_complete_processor";

/// Command ids sampled into log lines.
const LOG_SAMPLE_LIMIT: usize = 50;

/// Result of processing one completion item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The queue was empty.
    Idle,
    /// No state row exists; the manifest already finished.
    Untracked,
    /// Other data files of the manifest are still outstanding.
    Pending {
        /// Tags left after this completion.
        remaining: usize,
    },
    /// The state row kept changing; the item was released for retry.
    Contended,
    /// Some commands could not be marked; the item was released for retry.
    Unfinalized,
    /// The manifest was finalized.
    Finalized(Finalization),
}

/// What finalizing one manifest did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Finalization {
    /// Commands marked complete by this pass.
    pub marked: usize,
    /// Commands that were already complete.
    pub already_complete: usize,
    /// Ignored commands whose rows were deleted.
    pub removed: usize,
    /// Command ids without a state row.
    pub not_found: usize,
    /// Manifests moved to the holding area.
    pub archived: usize,
    /// Whether this pass deleted the state row.
    pub deleted_state: bool,
}

#[derive(Debug, Default)]
struct CommandTally {
    marked: usize,
    already_complete: usize,
    removed: usize,
    not_found: BTreeSet<String>,
    failed: usize,
}

/// Internal outcome of one attempt at updating a contended row.
enum Attempt<T> {
    Done(T),
    Conflict,
}

/// Consumes completion items and finalizes drained manifests.
pub struct FileCompleteProcessor {
    config: FileCompleteProcessorConfig,
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn WorkQueue<CompleteDataFile>>,
    state: Arc<dyn TableStore<ManifestFileSetState>>,
    commands: Arc<dyn TableStore<CommandState>>,
}

impl std::fmt::Debug for FileCompleteProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCompleteProcessor")
            .field("config", &self.config)
            .field("queue", &self.queue.name())
            .finish_non_exhaustive()
    }
}

impl FileCompleteProcessor {
    /// Creates a processor.
    #[must_use]
    pub fn new(
        config: FileCompleteProcessorConfig,
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn WorkQueue<CompleteDataFile>>,
        state: Arc<dyn TableStore<ManifestFileSetState>>,
        commands: Arc<dyn TableStore<CommandState>>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            state,
            commands,
        }
    }

    /// Takes one completion item and processes it.
    ///
    /// # Errors
    ///
    /// Returns collaborator errors. The item stays in the queue and is
    /// redelivered once its visibility lapses.
    pub async fn process_next(&self) -> Result<CompletionOutcome> {
        let Some(item) = self.queue.dequeue(self.config.lease()).await? else {
            return Ok(CompletionOutcome::Idle);
        };
        let span = manifest_span(&item.data.agent_id, &item.data.manifest_path);
        self.process_item(item).instrument(span).await
    }

    async fn process_item(&self, item: QueueItem<CompleteDataFile>) -> Result<CompletionOutcome> {
        let renewer = VisibilityRenewer::new(
            Arc::clone(&self.queue),
            item.receipt.clone(),
            self.config.lease(),
            self.config.lease() / 4,
        );

        let Some(state) = self.remove_tag(&item.data).await? else {
            self.queue.release(&item.receipt).await?;
            return Ok(CompletionOutcome::Contended);
        };
        let Some(state) = state else {
            tracing::info!(file = %item.data.data_file_path, "no state for manifest; nothing to do");
            self.queue.complete(&item.receipt).await?;
            return Ok(CompletionOutcome::Untracked);
        };

        let remaining = state.row.data_file_tags.len();
        if remaining > 0 {
            tracing::info!(file = %item.data.data_file_path, remaining, "data file complete; manifest still pending");
            self.queue.complete(&item.receipt).await?;
            return Ok(CompletionOutcome::Pending { remaining });
        }

        tracing::info!("no data files remain; finalizing manifest");
        let Some(finalization) = self.finalize(&item.data, &state, &renewer).await? else {
            self.queue.release(&item.receipt).await?;
            return Ok(CompletionOutcome::Unfinalized);
        };
        self.queue.complete(&item.receipt).await?;
        Ok(CompletionOutcome::Finalized(finalization))
    }

    /// Removes the item's tag from the state row.
    ///
    /// Returns `None` when every attempt lost to a concurrent writer, and
    /// `Some(None)` when the row does not exist.
    async fn remove_tag(
        &self,
        item: &CompleteDataFile,
    ) -> Result<Option<Option<Versioned<ManifestFileSetState>>>> {
        let (pk, rk) = ManifestFileSetState::key_for(&item.agent_id, &item.manifest_path);
        let tag = completion_tag(item);

        for attempt in 1..=self.config.max_state_update_attempts.max(1) {
            let Some(mut current) = self.state.get(&pk, &rk).await? else {
                return Ok(Some(None));
            };
            let removed = tag
                .as_ref()
                .is_some_and(|tag| current.row.data_file_tags.remove(tag));
            if !removed {
                return Ok(Some(Some(current)));
            }

            match self.try_replace(&current).await? {
                Attempt::Done(version) => {
                    current.version = version;
                    return Ok(Some(Some(current)));
                }
                Attempt::Conflict => {
                    tracing::debug!(attempt, "state row changed while removing tag; retrying");
                }
            }
        }

        tracing::warn!(
            attempts = self.config.max_state_update_attempts,
            file = %item.data_file_path,
            "gave up removing data file tag after repeated conflicts"
        );
        Ok(None)
    }

    async fn try_replace(
        &self,
        current: &Versioned<ManifestFileSetState>,
    ) -> Result<Attempt<String>> {
        if !self.state.replace(&current.row, &current.exact()).await? {
            return Ok(Attempt::Conflict);
        }
        let (pk, rk) =
            ManifestFileSetState::key_for(&current.row.agent_id, &current.row.manifest_path);
        Ok(match self.state.get(&pk, &rk).await? {
            Some(written) => Attempt::Done(written.version),
            None => Attempt::Conflict,
        })
    }

    /// Returns `None` if commands could not all be finalized.
    async fn finalize(
        &self,
        item: &CompleteDataFile,
        state: &Versioned<ManifestFileSetState>,
        renewer: &dyn Renew,
    ) -> Result<Option<Finalization>> {
        let row = &state.row;
        let mut finalization = Finalization::default();

        match self.store.read(&row.request_manifest_path).await? {
            Some(content) => {
                let name = paths::file_name(&row.request_manifest_path);
                let ids = parse_command_ids(&content, name).ids;
                let tally = self.finalize_commands(&row.agent_id, &ids, renewer).await?;
                if !tally.not_found.is_empty() {
                    let sample: Vec<&str> = tally
                        .not_found
                        .iter()
                        .take(LOG_SAMPLE_LIMIT)
                        .map(String::as_str)
                        .collect();
                    tracing::warn!(
                        count = tally.not_found.len(),
                        sample = %sample.join(","),
                        "commands in request manifest have no state"
                    );
                }
                if tally.failed > 0 {
                    tracing::warn!(
                        failed = tally.failed,
                        "could not mark every command complete; will retry"
                    );
                    return Ok(None);
                }
                finalization.marked = tally.marked;
                finalization.already_complete = tally.already_complete;
                finalization.removed = tally.removed;
                finalization.not_found = tally.not_found.len();
            }
            None => {
                tracing::warn!(
                    path = %row.request_manifest_path,
                    "request manifest not found; cannot mark commands complete"
                );
            }
        }

        let holding_dir = paths::join(&self.config.holding_path, &item.agent_id);
        for path in [&row.request_manifest_path, &row.manifest_path] {
            if self.archive(path, &holding_dir).await {
                finalization.archived += 1;
            }
        }

        let (pk, rk) = ManifestFileSetState::key_for(&row.agent_id, &row.manifest_path);
        finalization.deleted_state = self.state.delete(&pk, &rk, &RowVersion::Any).await?;
        if finalization.deleted_state {
            let marked = u64::try_from(finalization.marked).unwrap_or(u64::MAX);
            metrics::record_batch_completed(marked);
        }

        tracing::info!(
            marked = finalization.marked,
            already_complete = finalization.already_complete,
            removed = finalization.removed,
            not_found = finalization.not_found,
            archived = finalization.archived,
            deleted_state = finalization.deleted_state,
            "manifest finalized"
        );
        Ok(Some(finalization))
    }

    async fn finalize_commands(
        &self,
        agent_id: &str,
        ids: &[String],
        renewer: &dyn Renew,
    ) -> Result<CommandTally> {
        let mut tally = CommandTally::default();
        let partition = escape_key(agent_id);

        for batch in ids.chunks(self.config.command_batch_size.max(1)) {
            let filter = RowFilter::all()
                .with_partition(partition.clone())
                .with_row_keys(batch.iter().map(|id| escape_key(id)).collect());
            let rows = self.commands.query(&filter).await?;

            let mut unseen: BTreeSet<&str> = batch.iter().map(String::as_str).collect();
            for row in rows {
                unseen.remove(row.row.command_id.as_str());
                self.finalize_command(row, &mut tally).await?;
            }
            tally
                .not_found
                .extend(unseen.into_iter().map(str::to_string));

            renewer.renew().await?;
        }

        Ok(tally)
    }

    async fn finalize_command(
        &self,
        mut current: Versioned<CommandState>,
        tally: &mut CommandTally,
    ) -> Result<()> {
        let pk = escape_key(&current.row.agent_id);
        let rk = escape_key(&current.row.command_id);

        for _ in 0..self.config.max_state_update_attempts.max(1) {
            if current.row.is_complete {
                tally.already_complete += 1;
                return Ok(());
            }
            if current.row.ignore_command {
                if self.commands.delete(&pk, &rk, &current.exact()).await? {
                    tally.removed += 1;
                    return Ok(());
                }
            } else {
                let mut updated = current.row.clone();
                updated.is_complete = true;
                if self.commands.replace(&updated, &current.exact()).await? {
                    tally.marked += 1;
                    return Ok(());
                }
            }

            match self.commands.get(&pk, &rk).await? {
                Some(latest) => current = latest,
                None => {
                    tally.not_found.insert(current.row.command_id);
                    return Ok(());
                }
            }
        }

        tracing::warn!(command_id = %current.row.command_id, "gave up updating command state");
        tally.failed += 1;
        Ok(())
    }

    /// Moves a manifest to the holding area. Failures are logged.
    async fn archive(&self, path: &str, holding_dir: &str) -> bool {
        match self.store.open_file(path).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(path, "manifest not found; cannot archive");
                return false;
            }
            Err(e) => {
                tracing::error!(path, error = %e, "failed to open manifest for archiving");
                return false;
            }
        }

        let moved = match self.store.move_relative(path, holding_dir, true, true).await {
            Ok(moved) => moved,
            Err(e) => {
                tracing::error!(path, error = %e, "failed to move manifest to holding");
                return false;
            }
        };
        if let Err(e) = self
            .store
            .set_lifetime(&moved, self.config.holding_expiry(), true)
            .await
        {
            tracing::error!(path = %moved, error = %e, "failed to set holding expiry");
        }
        true
    }
}

/// Tag of the data file a completion item refers to.
///
/// Returns `None` for the empty path used by manifests without data files.
#[must_use]
pub fn completion_tag(item: &CompleteDataFile) -> Option<String> {
    if item.data_file_path.is_empty() {
        return None;
    }
    Some(paths::file_tag(
        &item.cosmos_tag,
        &item.agent_id,
        paths::file_name(&item.data_file_path),
    ))
}

#[async_trait]
impl WorkerTask for FileCompleteProcessor {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    async fn run_once(&self, _instance: usize) -> Result<Duration> {
        match self.process_next().await? {
            CompletionOutcome::Idle => Ok(IDLE_DELAY),
            _ => Ok(Duration::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use recon_test_utils::{
        ManifestFixture, QueueOp, StoreOp, TracingObjectStore, TracingTable, TracingWorkQueue,
    };

    struct Harness {
        store: Arc<TracingObjectStore>,
        queue: Arc<TracingWorkQueue<CompleteDataFile>>,
        state: Arc<TracingTable<ManifestFileSetState>>,
        commands: Arc<TracingTable<CommandState>>,
        processor: FileCompleteProcessor,
    }

    fn harness() -> Harness {
        let store = Arc::new(TracingObjectStore::new());
        let queue = Arc::new(TracingWorkQueue::new("complete"));
        let state = Arc::new(TracingTable::new("state"));
        let commands = Arc::new(TracingTable::new("commands"));
        let processor = FileCompleteProcessor::new(
            FileCompleteProcessorConfig {
                command_batch_size: 2,
                ..FileCompleteProcessorConfig::default()
            },
            store.clone(),
            queue.clone(),
            state.clone(),
            commands.clone(),
        );
        Harness {
            store,
            queue,
            state,
            commands,
            processor,
        }
    }

    fn seed_state(h: &Harness, fixture: &ManifestFixture, files: &[&str]) {
        let tags: BTreeSet<String> = files.iter().map(|f| fixture.tag(f)).collect();
        let created: DateTime<Utc> = Utc::now();
        h.state.seed(
            ManifestFileSetState {
                agent_id: fixture.agent_id().to_string(),
                manifest_path: fixture.data_manifest_path(),
                request_manifest_path: fixture.request_manifest_path(),
                data_file_tags: tags.clone(),
                dispatched_file_tags: tags,
                data_file_manifest_create_time: created,
                data_file_manifest_hash: Some(1),
                request_manifest_create_time: created,
                request_manifest_hash: Some(2),
                counter: 0,
            },
            Utc::now(),
        );
    }

    async fn complete_file(h: &Harness, fixture: &ManifestFixture, file: Option<&str>) {
        let item = CompleteDataFile {
            agent_id: fixture.agent_id().to_string(),
            cosmos_tag: "vc1".into(),
            manifest_path: fixture.data_manifest_path(),
            data_file_path: file.map(|f| fixture.data_file_path(f)).unwrap_or_default(),
        };
        h.queue.enqueue(&item).await.expect("enqueue");
    }

    async fn command(h: &Harness, id: &str) -> Option<CommandState> {
        h.commands.row("agent1", id).await
    }

    #[tokio::test]
    async fn removes_tags_until_the_manifest_drains() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_data_file("F1.txt", 1)
            .with_data_file("F2.txt", 1);
        fixture.write(&h.store);
        seed_state(&h, &fixture, &["F1.txt", "F2.txt"]);
        h.commands.seed(CommandState::pending("agent1", "c1"), Utc::now());

        complete_file(&h, &fixture, Some("F1.txt")).await;
        let outcome = h.processor.process_next().await.expect("first");
        assert_eq!(outcome, CompletionOutcome::Pending { remaining: 1 });
        assert!(!command(&h, "c1").await.expect("row").is_complete);

        complete_file(&h, &fixture, Some("F2.txt")).await;
        let outcome = h.processor.process_next().await.expect("second");
        let CompletionOutcome::Finalized(done) = outcome else {
            panic!("expected finalization, got {outcome:?}");
        };
        assert_eq!(done.marked, 1);
        assert_eq!(done.archived, 2);
        assert!(done.deleted_state);
        assert!(command(&h, "c1").await.expect("row").is_complete);
        assert!(h.state.is_empty());
        assert_eq!(h.queue.len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn empty_path_finalizes_manifest_without_files() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00").with_command("c1");
        fixture.write(&h.store);
        seed_state(&h, &fixture, &[]);
        h.commands.seed(CommandState::pending("agent1", "c1"), Utc::now());
        complete_file(&h, &fixture, None).await;

        let outcome = h.processor.process_next().await.expect("process");

        assert!(matches!(outcome, CompletionOutcome::Finalized(ref f) if f.marked == 1));
        assert!(command(&h, "c1").await.expect("row").is_complete);
        assert!(h.state.is_empty());
    }

    #[tokio::test]
    async fn manifests_move_to_holding_with_expiry() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00").with_command("c1");
        fixture.write(&h.store);
        seed_state(&h, &fixture, &[]);
        complete_file(&h, &fixture, None).await;

        h.processor.process_next().await.expect("process");

        let held = format!("Holding/agent1/{}", fixture.request_manifest_path());
        assert!(h.store.exists(&held));
        assert!(h.store.expiry(&held).is_some());
        assert!(!h.store.exists(&fixture.request_manifest_path()));
        assert!(!h.store.exists(&fixture.data_manifest_path()));
    }

    #[tokio::test]
    async fn ignored_commands_are_removed_and_unknown_ids_logged() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00")
            .with_command("c1")
            .with_command("c2")
            .with_command("c3")
            .with_command("c4");
        fixture.write(&h.store);
        seed_state(&h, &fixture, &[]);
        let mut ignored = CommandState::pending("agent1", "c2");
        ignored.ignore_command = true;
        let mut done = CommandState::pending("agent1", "c3");
        done.is_complete = true;
        h.commands.seed(CommandState::pending("agent1", "c1"), Utc::now());
        h.commands.seed(ignored, Utc::now());
        h.commands.seed(done, Utc::now());
        complete_file(&h, &fixture, None).await;

        let outcome = h.processor.process_next().await.expect("process");

        let CompletionOutcome::Finalized(done) = outcome else {
            panic!("expected finalization, got {outcome:?}");
        };
        assert_eq!(done.marked, 1);
        assert_eq!(done.removed, 1);
        assert_eq!(done.already_complete, 1);
        assert_eq!(done.not_found, 1);
        assert!(command(&h, "c2").await.is_none());
    }

    #[tokio::test]
    async fn missing_state_completes_the_item() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00");
        complete_file(&h, &fixture, Some("F1.txt")).await;

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(outcome, CompletionOutcome::Untracked);
        assert_eq!(h.queue.count(&QueueOp::Complete), 1);
    }

    #[tokio::test]
    async fn persistent_conflicts_release_the_item() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00").with_data_file("F1.txt", 1);
        seed_state(&h, &fixture, &["F1.txt", "F2.txt"]);
        h.state.conflict_next_replaces(10);
        complete_file(&h, &fixture, Some("F1.txt")).await;

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(outcome, CompletionOutcome::Contended);
        assert_eq!(h.queue.count(&QueueOp::Release), 1);
        assert_eq!(h.queue.len().await.expect("len"), 1);
    }

    #[tokio::test]
    async fn transient_conflicts_are_retried() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00").with_data_file("F1.txt", 1);
        seed_state(&h, &fixture, &["F1.txt", "F2.txt"]);
        h.state.conflict_next_replaces(2);
        complete_file(&h, &fixture, Some("F1.txt")).await;

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(outcome, CompletionOutcome::Pending { remaining: 1 });
    }

    #[tokio::test]
    async fn unmarkable_commands_leave_state_for_retry() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00").with_command("c1");
        fixture.write(&h.store);
        seed_state(&h, &fixture, &[]);
        h.commands.seed(CommandState::pending("agent1", "c1"), Utc::now());
        h.commands.conflict_next_replaces(10);
        complete_file(&h, &fixture, None).await;

        let outcome = h.processor.process_next().await.expect("process");

        assert_eq!(outcome, CompletionOutcome::Unfinalized);
        assert_eq!(h.state.len(), 1);
        assert!(h.store.exists(&fixture.request_manifest_path()));
        assert_eq!(h.queue.count(&QueueOp::Release), 1);
    }

    #[tokio::test]
    async fn archive_failures_do_not_block_finalization() {
        let h = harness();
        let fixture = ManifestFixture::new("agent1", "2024_01_01_00");
        fixture.write(&h.store);
        seed_state(&h, &fixture, &[]);
        complete_file(&h, &fixture, None).await;
        h.store.inject_failure(fixture.data_manifest_path());

        let outcome = h.processor.process_next().await.expect("process");

        let CompletionOutcome::Finalized(done) = outcome else {
            panic!("expected finalization, got {outcome:?}");
        };
        assert_eq!(done.archived, 1);
        assert!(done.deleted_state);
        assert!(
            h.store
                .operations()
                .iter()
                .any(|op| matches!(op, StoreOp::Move { .. }))
        );
    }

    #[test]
    fn completion_tags_follow_the_file_name() {
        let item = CompleteDataFile {
            agent_id: "agent1".into(),
            cosmos_tag: "vc1".into(),
            manifest_path: "vc1/AgentOutput/agent1/DataFileManifest_1".into(),
            data_file_path: "vc1/AgentOutput/agent1/F1.txt".into(),
        };
        assert_eq!(completion_tag(&item).as_deref(), Some("vc1.agent1.F1.txt"));
        let empty = CompleteDataFile {
            data_file_path: String::new(),
            ..item
        };
        assert_eq!(completion_tag(&empty), None);
    }
}
