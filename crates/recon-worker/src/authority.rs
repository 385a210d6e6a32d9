//! Command status classification.
//!
//! The manifest processor hands every command id of a request manifest to a
//! [`CommandStatusAuthority`], which sorts them into [`CommandStatusCode`]
//! buckets. The table-backed authority reads the `CommandState` table in
//! fixed-size batches, renewing the caller's claims between batches.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use recon_core::error::Result;
use recon_core::model::{CommandState, CommandStatusCode, RequestCommandsInfo};
use recon_core::paths::escape_key;
use recon_core::table::{RowFilter, TableStore};

use crate::renewer::Renew;

/// Command ids looked up per table query.
pub const DEFAULT_QUERY_BATCH_SIZE: usize = 75;

/// Command ids sampled into each per-status log line.
const SUMMARY_SAMPLE_LIMIT: usize = 50;

/// Classification results for one request manifest, ready for reporting.
#[derive(Debug, Clone)]
pub struct CommandSummary {
    /// Agent that wrote the manifest.
    pub agent_id: String,
    /// Name of the request manifest.
    pub manifest_name: String,
    /// Classified commands.
    pub info: RequestCommandsInfo,
    /// Age of the request manifest.
    pub batch_age: Duration,
    /// How long unresolved commands are waited for.
    pub max_wait: Duration,
    /// Whether the wait has run out.
    pub is_old: bool,
}

/// Source of truth for command completion state.
#[async_trait]
pub trait CommandStatusAuthority: Send + Sync {
    /// Classifies `command_ids` for `agent_id`.
    ///
    /// With `purge` false, classification stops at the first command that is
    /// `Missing` or `NotAvailable`; every id not yet classified is reported
    /// as `Undetermined`. With `purge` true every id is classified.
    async fn determine_command_status(
        &self,
        agent_id: &str,
        command_ids: &[String],
        renewer: &dyn Renew,
        purge: bool,
    ) -> Result<RequestCommandsInfo>;

    /// Emits the per-manifest classification summary.
    async fn report_command_summary(&self, summary: &CommandSummary) -> Result<()>;
}

/// Authority backed by the `CommandState` table.
pub struct TableCommandStatusAuthority {
    table: Arc<dyn TableStore<CommandState>>,
    batch_size: usize,
}

impl std::fmt::Debug for TableCommandStatusAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCommandStatusAuthority")
            .field("table", &self.table.name())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl TableCommandStatusAuthority {
    /// Creates an authority over the command state table.
    #[must_use]
    pub fn new(table: Arc<dyn TableStore<CommandState>>) -> Self {
        Self {
            table,
            batch_size: DEFAULT_QUERY_BATCH_SIZE,
        }
    }

    /// Overrides the query batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl CommandStatusAuthority for TableCommandStatusAuthority {
    async fn determine_command_status(
        &self,
        agent_id: &str,
        command_ids: &[String],
        renewer: &dyn Renew,
        purge: bool,
    ) -> Result<RequestCommandsInfo> {
        let mut info = RequestCommandsInfo::default();
        let partition = escape_key(agent_id);
        let mut stopped = false;

        for batch in command_ids.chunks(self.batch_size) {
            if stopped {
                for id in batch {
                    info.add(CommandStatusCode::Undetermined, id.as_str());
                }
                continue;
            }

            let filter = RowFilter::all()
                .with_partition(partition.clone())
                .with_row_keys(batch.iter().map(|id| escape_key(id)).collect());
            let (rows, renewed) = tokio::join!(self.table.query(&filter), renewer.renew());
            renewed?;

            let mut unseen: BTreeSet<&str> = batch.iter().map(String::as_str).collect();
            for row in rows? {
                unseen.remove(row.row.command_id.as_str());
                info.add(row.row.status(), row.row.command_id);
            }

            // Ids keep their manifest order so a stop is deterministic.
            for id in batch.iter().filter(|id| unseen.contains(id.as_str())) {
                if stopped {
                    info.add(CommandStatusCode::Undetermined, id.as_str());
                } else {
                    info.add(CommandStatusCode::Missing, id.as_str());
                    stopped = !purge;
                }
            }
        }

        Ok(info)
    }

    async fn report_command_summary(&self, summary: &CommandSummary) -> Result<()> {
        let info = &summary.info;
        let missing = info.count(CommandStatusCode::Missing);
        let total = info.command_count();

        if info.has_unresolved() {
            let outcome = unresolved_outcome(
                summary.is_old,
                info.has_undetermined || info.has_not_available,
            );
            tracing::warn!(
                agent_id = %summary.agent_id,
                manifest = %summary.manifest_name,
                missing,
                total,
                batch_age_secs = summary.batch_age.as_secs(),
                max_wait_secs = summary.max_wait.as_secs(),
                "{outcome}"
            );
        }

        let all_actionable = info.commands.len() == 1
            && info.count(CommandStatusCode::Actionable) == total;
        if all_actionable {
            tracing::info!(
                agent_id = %summary.agent_id,
                manifest = %summary.manifest_name,
                total,
                "all commands in request manifest found"
            );
            return Ok(());
        }

        let mut counts = String::new();
        for (code, ids) in info.commands.iter().filter(|(_, ids)| !ids.is_empty()) {
            let _ = write!(counts, "{}: {}; ", code.as_str(), ids.len());
            let sample: Vec<&str> = ids
                .iter()
                .take(SUMMARY_SAMPLE_LIMIT)
                .map(String::as_str)
                .collect();
            tracing::warn!(
                agent_id = %summary.agent_id,
                manifest = %summary.manifest_name,
                status = code.as_str(),
                count = ids.len(),
                sample = %sample.join(","),
                "commands classified"
            );
        }
        tracing::info!(
            agent_id = %summary.agent_id,
            manifest = %summary.manifest_name,
            total,
            summary = %counts.trim_end(),
            "command summary"
        );
        Ok(())
    }
}

/// What happens to a batch with unresolved commands. Once the wait has
/// expired the batch always proceeds.
fn unresolved_outcome(is_old: bool, has_unknown_state: bool) -> &'static str {
    match (is_old, has_unknown_state) {
        (false, _) => "waiting for unresolved commands",
        (true, true) => "wait expired; proceeding with commands in an unknown state",
        (true, false) => "wait expired; proceeding without missing commands",
    }
}
