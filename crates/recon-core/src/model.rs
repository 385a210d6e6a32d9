//! Work items and persisted rows exchanged between pipeline stages.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::paths::escape_key;
use crate::table::TableRow;

/// A discovered request/data manifest pair, queued for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFileSet {
    /// Agent that wrote the manifests.
    pub agent_id: String,
    /// Storage location tag the manifests were found under.
    pub cosmos_tag: String,
    /// Path of the data manifest.
    pub data_manifest_path: String,
    /// Path of the request manifest.
    pub request_manifest_path: String,
}

/// One data file handed to the size-partitioned file workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDataFile {
    /// Agent that wrote the file.
    pub agent_id: String,
    /// Storage location tag.
    pub cosmos_tag: String,
    /// Data manifest that referenced the file.
    pub manifest_path: String,
    /// Path of the data file.
    pub data_file_path: String,
    /// Name the file is exported under.
    pub export_file_name: String,
}

/// Signals that one data file of a manifest is finished.
///
/// An empty `data_file_path` means the manifest had no data files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteDataFile {
    /// Agent that wrote the file.
    pub agent_id: String,
    /// Storage location tag.
    pub cosmos_tag: String,
    /// Data manifest that referenced the file.
    pub manifest_path: String,
    /// Path of the data file, or empty.
    pub data_file_path: String,
}

impl From<&PendingDataFile> for CompleteDataFile {
    fn from(pending: &PendingDataFile) -> Self {
        Self {
            agent_id: pending.agent_id.clone(),
            cosmos_tag: pending.cosmos_tag.clone(),
            manifest_path: pending.manifest_path.clone(),
            data_file_path: pending.data_file_path.clone(),
        }
    }
}

/// Reconciliation state of one data manifest.
///
/// Keyed by agent id and escaped manifest path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFileSetState {
    /// Agent that wrote the manifests.
    pub agent_id: String,
    /// Path of the data manifest.
    pub manifest_path: String,
    /// Path of the request manifest.
    pub request_manifest_path: String,
    /// Tags of data files that have not reported completion yet.
    pub data_file_tags: BTreeSet<String>,
    /// Tags of every data file dispatched for this manifest.
    pub dispatched_file_tags: BTreeSet<String>,
    /// Creation time of the data manifest when last processed.
    pub data_file_manifest_create_time: DateTime<Utc>,
    /// Hash of the data manifest's file-name templates.
    pub data_file_manifest_hash: Option<i32>,
    /// Creation time of the request manifest when last processed.
    pub request_manifest_create_time: DateTime<Utc>,
    /// Hash of the request manifest's command ids.
    pub request_manifest_hash: Option<i32>,
    /// Number of times the manifest was redelivered after the first pass.
    pub counter: i32,
}

impl ManifestFileSetState {
    /// Partition and row key of the state row for a manifest.
    #[must_use]
    pub fn key_for(agent_id: &str, manifest_path: &str) -> (String, String) {
        (escape_key(agent_id), escape_key(manifest_path))
    }
}

impl TableRow for ManifestFileSetState {
    fn partition_key(&self) -> String {
        escape_key(&self.agent_id)
    }

    fn row_key(&self) -> String {
        escape_key(&self.manifest_path)
    }
}

/// Authoritative completion state of one command for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandState {
    /// Agent the command was issued to.
    pub agent_id: String,
    /// Canonical command id.
    pub command_id: String,
    /// Whether the command reached its terminal state.
    pub is_complete: bool,
    /// Whether the command should be dropped rather than completed.
    #[serde(default)]
    pub ignore_command: bool,
    /// Whether the command does not apply to the agent.
    #[serde(default)]
    pub not_applicable: bool,
}

impl CommandState {
    /// A pending command row.
    #[must_use]
    pub fn pending(agent_id: impl Into<String>, command_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            command_id: command_id.into(),
            is_complete: false,
            ignore_command: false,
            not_applicable: false,
        }
    }

    /// Classification of a command that has a state row.
    #[must_use]
    pub const fn status(&self) -> CommandStatusCode {
        if self.is_complete {
            CommandStatusCode::Completed
        } else if self.not_applicable {
            CommandStatusCode::NotApplicable
        } else if self.ignore_command {
            CommandStatusCode::Ignored
        } else {
            CommandStatusCode::Actionable
        }
    }
}

impl TableRow for CommandState {
    fn partition_key(&self) -> String {
        escape_key(&self.agent_id)
    }

    fn row_key(&self) -> String {
        escape_key(&self.command_id)
    }
}

/// Classification of a command id referenced by a request manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CommandStatusCode {
    /// Classification did not reach this command.
    Undetermined,
    /// The command exists upstream but is not yet available to this agent.
    NotAvailable,
    /// The command is unknown.
    Missing,
    /// The command is pending and can be fulfilled.
    Actionable,
    /// The command already reached its terminal state.
    Completed,
    /// The command is to be dropped.
    Ignored,
    /// The command does not apply to this agent.
    NotApplicable,
}

impl CommandStatusCode {
    /// Name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undetermined => "undetermined",
            Self::NotAvailable => "not_available",
            Self::Missing => "missing",
            Self::Actionable => "actionable",
            Self::Completed => "completed",
            Self::Ignored => "ignored",
            Self::NotApplicable => "not_applicable",
        }
    }
}

/// Commands of one request manifest grouped by classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCommandsInfo {
    /// Command ids per status.
    pub commands: BTreeMap<CommandStatusCode, BTreeSet<String>>,
    /// At least one command is `NotAvailable`.
    pub has_not_available: bool,
    /// At least one command is `Missing`.
    pub has_missing: bool,
    /// At least one command is `Undetermined`.
    pub has_undetermined: bool,
}

impl RequestCommandsInfo {
    /// Records a classification and updates the summary flags.
    pub fn add(&mut self, code: CommandStatusCode, command_id: impl Into<String>) {
        match code {
            CommandStatusCode::NotAvailable => self.has_not_available = true,
            CommandStatusCode::Missing => self.has_missing = true,
            CommandStatusCode::Undetermined => self.has_undetermined = true,
            _ => {}
        }
        self.commands.entry(code).or_default().insert(command_id.into());
    }

    /// Number of commands with the given status.
    #[must_use]
    pub fn count(&self, code: CommandStatusCode) -> usize {
        self.commands.get(&code).map_or(0, BTreeSet::len)
    }

    /// Total number of classified commands.
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.commands.values().map(BTreeSet::len).sum()
    }

    /// Returns true if any command is still unresolved.
    #[must_use]
    pub const fn has_unresolved(&self) -> bool {
        self.has_missing || self.has_not_available || self.has_undetermined
    }
}
