//! Worker metrics.
//!
//! Counters and histograms emitted through the `metrics` facade. The
//! embedding process installs a recorder; without one every call is a no-op.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

use recon_core::partition::FileSizePartition;

// ============================================================================
// Monitor Metrics
// ============================================================================

/// Files examined by the monitor, labelled by outcome.
pub const MONITOR_FILES: &str = "recon_monitor_files_total";

/// Size of data files seen by the monitor.
pub const DATA_FILE_SIZE: &str = "recon_data_file_size_bytes";

/// Age of data files seen by the monitor.
pub const DATA_FILE_AGE: &str = "recon_data_file_age_minutes";

/// Age of complete manifest pairs seen by the monitor.
pub const BATCH_AGE: &str = "recon_batch_age_minutes";

// ============================================================================
// Processor Metrics
// ============================================================================

/// Work items discarded for exceeding the dequeue limit.
pub const POISON_DISCARDED: &str = "recon_poison_items_discarded_total";

/// Work items skipped because another worker held the manifest lease.
pub const LEASE_NOT_ACQUIRED: &str = "recon_lease_not_acquired_total";

/// Data files dispatched to the partitioned queue.
pub const FILES_DISPATCHED: &str = "recon_files_dispatched_total";

/// Manifests deferred because commands were unresolved.
pub const MANIFESTS_DEFERRED: &str = "recon_manifests_deferred_total";

/// Manifests whose data files all completed.
pub const BATCHES_COMPLETED: &str = "recon_batches_completed_total";

/// Commands marked complete.
pub const COMMANDS_COMPLETED: &str = "recon_commands_completed_total";

// ============================================================================
// Cleaner Metrics
// ============================================================================

/// Rows deleted by the table cleaner.
pub const ROWS_CLEANED: &str = "recon_rows_cleaned_total";

// ============================================================================
// Runner Metrics
// ============================================================================

/// Failed task passes.
pub const PASS_ERRORS: &str = "recon_pass_errors_total";

/// Duration of task passes.
pub const PASS_DURATION: &str = "recon_pass_duration_seconds";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all worker metric descriptions.
///
/// Call this once at application startup after installing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(MONITOR_FILES, "Total files examined by the monitor, by outcome");
    describe_histogram!(DATA_FILE_SIZE, "Size of data files awaiting processing in bytes");
    describe_histogram!(DATA_FILE_AGE, "Age of data files awaiting processing in minutes");
    describe_histogram!(BATCH_AGE, "Age of pending manifest pairs in minutes");
    describe_counter!(POISON_DISCARDED, "Total work items discarded as poison");
    describe_counter!(LEASE_NOT_ACQUIRED, "Total work items skipped on a held lease");
    describe_counter!(FILES_DISPATCHED, "Total data files dispatched");
    describe_counter!(MANIFESTS_DEFERRED, "Total manifests deferred on unresolved commands");
    describe_counter!(BATCHES_COMPLETED, "Total manifests fully completed");
    describe_counter!(COMMANDS_COMPLETED, "Total commands marked complete");
    describe_counter!(ROWS_CLEANED, "Total stale table rows deleted");
    describe_counter!(PASS_ERRORS, "Total failed task passes");
    describe_histogram!(PASS_DURATION, "Duration of task passes in seconds");
}

// ============================================================================
// Recording
// ============================================================================

/// Records monitor outcomes for a location.
pub fn record_monitor_files(cosmos_tag: &str, outcome: &str, count: u64) {
    if count == 0 {
        return;
    }
    let labels = [
        ("cosmos_tag", cosmos_tag.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(MONITOR_FILES, &labels).increment(count);
}

/// Records a data file seen by the monitor.
#[allow(clippy::cast_precision_loss)]
pub fn record_data_file_seen(partition: FileSizePartition, size: u64, age: Duration) {
    let labels = [("partition", partition.as_str())];

    histogram!(DATA_FILE_SIZE, &labels).record(size as f64);
    histogram!(DATA_FILE_AGE, &labels).record(age.as_secs_f64() / 60.0);
}

/// Records the age of a complete manifest pair.
pub fn record_batch_age(age: Duration) {
    histogram!(BATCH_AGE).record(age.as_secs_f64() / 60.0);
}

/// Records a discarded poison item.
pub fn record_poison_discarded(task: &str) {
    counter!(POISON_DISCARDED, "task" => task.to_string()).increment(1);
}

/// Records a work item skipped on a held lease.
pub fn record_lease_not_acquired(task: &str) {
    counter!(LEASE_NOT_ACQUIRED, "task" => task.to_string()).increment(1);
}

/// Records data files dispatched to one partition.
pub fn record_files_dispatched(partition: FileSizePartition, count: u64) {
    counter!(FILES_DISPATCHED, "partition" => partition.as_str()).increment(count);
}

/// Records a deferred manifest.
pub fn record_manifest_deferred() {
    counter!(MANIFESTS_DEFERRED).increment(1);
}

/// Records a completed manifest and the commands it finalized.
pub fn record_batch_completed(commands: u64) {
    counter!(BATCHES_COMPLETED).increment(1);
    counter!(COMMANDS_COMPLETED).increment(commands);
}

/// Records rows deleted from a table.
pub fn record_rows_cleaned(table: &str, count: u64) {
    counter!(ROWS_CLEANED, "table" => table.to_string()).increment(count);
}

/// Records the outcome of one task pass.
pub fn record_pass(task: &str, duration: Duration, failed: bool) {
    let labels = [("task", task.to_string())];

    histogram!(PASS_DURATION, &labels).record(duration.as_secs_f64());
    if failed {
        counter!(PASS_ERRORS, &labels).increment(1);
    }
}
