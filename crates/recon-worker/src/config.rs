//! Worker configuration.
//!
//! Each component has its own section with production defaults. Sections
//! deserialize from camelCase JSON; missing fields take their defaults.
//!
//! # Example
//!
//! ```rust
//! use recon_worker::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_json(r#"{
//!     "dataManifestProcessor": { "maxDequeueCount": 10 }
//! }"#)?;
//! assert_eq!(config.data_manifest_processor.max_dequeue_count, 10);
//! assert_eq!(config.data_manifest_processor.lease_minutes, 30);
//! # Ok::<(), recon_core::Error>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use recon_core::error::{Error, Result};
use recon_core::manifest::DEFAULT_EXPORT_EXTENSION;
use recon_core::partition::PartitionThresholds;
use recon_core::time::{hours, minutes};

/// Scheduling settings shared by every task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    /// Number of concurrent worker loops.
    pub instance_count: usize,
    /// Back-off after a pass fails.
    pub delay_on_exception_minutes: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            instance_count: 1,
            delay_on_exception_minutes: 1,
        }
    }
}

impl TaskConfig {
    /// Back-off after a failed pass.
    #[must_use]
    pub const fn delay_on_exception(&self) -> Duration {
        minutes(self.delay_on_exception_minutes)
    }

    fn validate(&self, task: &str) -> Option<String> {
        (self.instance_count == 0).then(|| format!("{task}: instanceCount must be at least 1"))
    }
}

/// One storage location scanned by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorLocation {
    /// Tag identifying the location in work items and file tags.
    pub cosmos_tag: String,
    /// Root path of the location.
    pub root_path: String,
}

/// Settings for the directory monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CosmosMonitorConfig {
    /// Scheduling.
    pub task: TaskConfig,
    /// Locations to scan.
    pub locations: Vec<MonitorLocation>,
    /// Path of the agent output directory below each location root.
    pub agent_output_path: String,
    /// Target interval between pass starts.
    pub repeat_delay_minutes: u64,
    /// Manifests younger than this may still be written to.
    pub min_batch_age_minutes: u64,
    /// Files older than this are no longer enqueued.
    pub max_enqueue_age_hours: u64,
    /// Files older than this are deleted.
    pub delete_age_hours: u64,
    /// Minimum spacing between enqueues of the same manifest.
    pub minimum_manifest_enqueue_interval_minutes: u64,
}

impl Default for CosmosMonitorConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::default(),
            locations: Vec::new(),
            agent_output_path: "AgentOutput".into(),
            repeat_delay_minutes: 5,
            min_batch_age_minutes: 15,
            max_enqueue_age_hours: 24 * 20,
            delete_age_hours: 24 * 30,
            minimum_manifest_enqueue_interval_minutes: 60,
        }
    }
}

impl CosmosMonitorConfig {
    /// Target interval between pass starts.
    #[must_use]
    pub const fn repeat_delay(&self) -> Duration {
        minutes(self.repeat_delay_minutes)
    }

    /// Minimum manifest age before enqueueing.
    #[must_use]
    pub const fn min_batch_age(&self) -> Duration {
        minutes(self.min_batch_age_minutes)
    }

    /// Maximum file age for enqueueing.
    #[must_use]
    pub const fn max_enqueue_age(&self) -> Duration {
        hours(self.max_enqueue_age_hours)
    }

    /// Age at which files are deleted.
    #[must_use]
    pub const fn delete_age(&self) -> Duration {
        hours(self.delete_age_hours)
    }

    /// Minimum spacing between enqueues of one manifest.
    #[must_use]
    pub const fn enqueue_interval(&self) -> Duration {
        minutes(self.minimum_manifest_enqueue_interval_minutes)
    }

    /// Returns the first configuration problem, if any.
    #[must_use]
    pub fn validate(&self) -> Option<String> {
        if let Some(problem) = self.task.validate("cosmosMonitor") {
            return Some(problem);
        }
        if self.delete_age_hours < self.max_enqueue_age_hours {
            return Some(
                "cosmosMonitor: deleteAgeHours must not be below maxEnqueueAgeHours".into(),
            );
        }
        self.locations
            .iter()
            .find(|l| l.cosmos_tag.is_empty() || l.cosmos_tag.contains('.'))
            .map(|l| format!("cosmosMonitor: invalid cosmosTag '{}'", l.cosmos_tag))
    }
}

/// Settings for the data manifest processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DataManifestProcessorConfig {
    /// Scheduling.
    pub task: TaskConfig,
    /// Queue visibility and manifest lease duration.
    pub lease_minutes: u64,
    /// Minimum spacing between lease renewals.
    pub minimum_renew_minutes: u64,
    /// Items dequeued more often than this are discarded.
    pub max_dequeue_count: u32,
    /// Unresolved commands are tolerated until the manifest is this old.
    pub max_command_wait_time_minutes: u64,
    /// Visibility delay applied when a manifest cannot be finished yet.
    pub delay_if_could_not_complete_minutes: u64,
    /// Files at or above this size are `Medium`.
    pub medium_file_size_threshold: u64,
    /// Files at or above this size are `Large`.
    pub large_file_size_threshold: u64,
    /// Extension appended to export file names.
    pub export_file_extension: String,
}

impl Default for DataManifestProcessorConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::default(),
            lease_minutes: 30,
            minimum_renew_minutes: 5,
            max_dequeue_count: 20,
            max_command_wait_time_minutes: 120,
            delay_if_could_not_complete_minutes: 5,
            medium_file_size_threshold: 1024 * 1024 * 1024,
            large_file_size_threshold: 20 * 1024 * 1024 * 1024,
            export_file_extension: DEFAULT_EXPORT_EXTENSION.into(),
        }
    }
}

impl DataManifestProcessorConfig {
    /// Lease and visibility duration.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        minutes(self.lease_minutes)
    }

    /// Minimum spacing between renewals.
    #[must_use]
    pub const fn minimum_renew(&self) -> Duration {
        minutes(self.minimum_renew_minutes)
    }

    /// Maximum wait for unresolved commands.
    #[must_use]
    pub const fn max_command_wait(&self) -> Duration {
        minutes(self.max_command_wait_time_minutes)
    }

    /// Visibility delay when a manifest cannot be finished yet.
    #[must_use]
    pub const fn delay_if_could_not_complete(&self) -> Duration {
        minutes(self.delay_if_could_not_complete_minutes)
    }

    /// Size partition thresholds.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the thresholds are not increasing.
    pub fn thresholds(&self) -> Result<PartitionThresholds> {
        PartitionThresholds::new(self.medium_file_size_threshold, self.large_file_size_threshold)
    }

    /// Returns the first configuration problem, if any.
    #[must_use]
    pub fn validate(&self) -> Option<String> {
        if let Some(problem) = self.task.validate("dataManifestProcessor") {
            return Some(problem);
        }
        if let Err(e) = self.thresholds() {
            return Some(format!("dataManifestProcessor: {e}"));
        }
        if self.minimum_renew_minutes >= self.lease_minutes {
            return Some(
                "dataManifestProcessor: minimumRenewMinutes must be below leaseMinutes".into(),
            );
        }
        None
    }
}

/// Settings for the file completion processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FileCompleteProcessorConfig {
    /// Scheduling.
    pub task: TaskConfig,
    /// Queue visibility duration.
    pub lease_minutes: u64,
    /// Attempts for each contended state update.
    pub max_state_update_attempts: u32,
    /// Command ids marked complete per table query.
    pub command_batch_size: usize,
    /// Root of the holding area for archived manifests.
    pub holding_path: String,
    /// Retention of archived manifests.
    pub holding_expiry_hours: u64,
}

impl Default for FileCompleteProcessorConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::default(),
            lease_minutes: 30,
            max_state_update_attempts: 5,
            command_batch_size: 10,
            holding_path: "Holding/".into(),
            holding_expiry_hours: 24 * 7,
        }
    }
}

impl FileCompleteProcessorConfig {
    /// Queue visibility duration.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        minutes(self.lease_minutes)
    }

    /// Retention of archived manifests.
    #[must_use]
    pub const fn holding_expiry(&self) -> Duration {
        hours(self.holding_expiry_hours)
    }

    /// Returns the first configuration problem, if any.
    #[must_use]
    pub fn validate(&self) -> Option<String> {
        if let Some(problem) = self.task.validate("fileCompleteProcessor") {
            return Some(problem);
        }
        if self.max_state_update_attempts == 0 {
            return Some("fileCompleteProcessor: maxStateUpdateAttempts must be at least 1".into());
        }
        if self.command_batch_size == 0 {
            return Some("fileCompleteProcessor: commandBatchSize must be at least 1".into());
        }
        None
    }
}

/// One table swept by the cleaner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanedTable {
    /// Table name.
    pub table_name: String,
    /// Rows not written for this many days are deleted.
    pub last_modified_threshold_days: u64,
}

/// Settings for the table row cleaner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TableRowCleanerConfig {
    /// Scheduling.
    pub task: TaskConfig,
    /// Lease group for per-table cleaning leases.
    pub cleaner_lock_group: String,
    /// Tables to sweep.
    pub tables: Vec<CleanedTable>,
    /// Maximum rows examined per pass.
    pub max_batch_size: usize,
    /// Delay after a pass that found nothing.
    pub empty_batch_delay_seconds: u64,
    /// Delay after a pass that deleted rows.
    pub non_empty_batch_delay_seconds: u64,
    /// Upper bound of the random delay added to either delay.
    pub delay_random_limit_seconds: u64,
    /// Duration of the cleaning lease.
    pub lease_minutes: u64,
}

impl Default for TableRowCleanerConfig {
    fn default() -> Self {
        Self {
            task: TaskConfig::default(),
            cleaner_lock_group: "TableRowCleaner".into(),
            tables: Vec::new(),
            max_batch_size: 1000,
            empty_batch_delay_seconds: 3600,
            non_empty_batch_delay_seconds: 5,
            delay_random_limit_seconds: 60,
            lease_minutes: 10,
        }
    }
}

impl TableRowCleanerConfig {
    /// Duration of the cleaning lease.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        minutes(self.lease_minutes)
    }

    /// Returns the first configuration problem, if any.
    #[must_use]
    pub fn validate(&self) -> Option<String> {
        if let Some(problem) = self.task.validate("tableRowCleaner") {
            return Some(problem);
        }
        if self.max_batch_size == 0 {
            return Some("tableRowCleaner: maxBatchSize must be at least 1".into());
        }
        self.tables
            .iter()
            .find(|t| t.last_modified_threshold_days == 0)
            .map(|t| {
                format!(
                    "tableRowCleaner: table {} needs lastModifiedThresholdDays of at least 1",
                    t.table_name
                )
            })
    }
}

/// Configuration of the whole pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Directory monitor.
    pub cosmos_monitor: CosmosMonitorConfig,
    /// Data manifest processor.
    pub data_manifest_processor: DataManifestProcessorConfig,
    /// File completion processor.
    pub file_complete_processor: FileCompleteProcessorConfig,
    /// Table row cleaner.
    pub table_row_cleaner: TableRowCleanerConfig,
}

impl PipelineConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for malformed JSON and
    /// `Error::InvalidInput` for invalid settings.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        match config.validate() {
            Some(problem) => Err(Error::InvalidInput(problem)),
            None => Ok(config),
        }
    }

    /// Returns the first configuration problem, if any.
    #[must_use]
    pub fn validate(&self) -> Option<String> {
        self.cosmos_monitor
            .validate()
            .or_else(|| self.data_manifest_processor.validate())
            .or_else(|| self.file_complete_processor.validate())
            .or_else(|| self.table_row_cleaner.validate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(PipelineConfig::default().validate(), None);
    }

    #[test]
    fn partial_json_takes_defaults() {
        let config = PipelineConfig::from_json(
            r#"{
                "cosmosMonitor": {
                    "locations": [{ "cosmosTag": "c1", "rootPath": "/vc1/" }],
                    "task": { "instanceCount": 3 }
                },
                "tableRowCleaner": {
                    "tables": [{ "tableName": "manifestState", "lastModifiedThresholdDays": 30 }]
                }
            }"#,
        )
        .expect("valid config");

        assert_eq!(config.cosmos_monitor.locations.len(), 1);
        assert_eq!(config.cosmos_monitor.task.instance_count, 3);
        assert_eq!(config.cosmos_monitor.task.delay_on_exception_minutes, 1);
        assert_eq!(config.file_complete_processor.command_batch_size, 10);
        assert_eq!(config.table_row_cleaner.tables[0].table_name, "manifestState");
    }

    #[test]
    fn invalid_settings_are_reported() {
        let mut config = PipelineConfig::default();
        config.data_manifest_processor.medium_file_size_threshold = 10;
        config.data_manifest_processor.large_file_size_threshold = 5;
        let problem = config.validate().expect("invalid");
        assert!(problem.starts_with("dataManifestProcessor"));

        let err = PipelineConfig::from_json(r#"{ "fileCompleteProcessor": { "maxStateUpdateAttempts": 0 } }"#)
            .expect_err("invalid");
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = PipelineConfig::from_json("{ not json").expect_err("malformed");
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn tags_with_dots_are_rejected() {
        let mut config = CosmosMonitorConfig::default();
        config.locations.push(MonitorLocation {
            cosmos_tag: "a.b".into(),
            root_path: "/".into(),
        });
        assert!(config.validate().is_some());
    }

    #[test]
    fn duration_accessors() {
        let config = DataManifestProcessorConfig::default();
        assert_eq!(config.lease(), Duration::from_secs(30 * 60));
        assert_eq!(config.max_command_wait(), Duration::from_secs(120 * 60));
    }
}
