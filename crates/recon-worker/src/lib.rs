//! # recon-worker
//!
//! Background workers of the manifest reconciliation pipeline.
//!
//! ## Components
//!
//! - [`monitor::CosmosMonitor`]: discovers manifest pairs in agent directories
//!   and enqueues them
//! - [`data_manifest::DataManifestProcessor`]: reconciles a manifest pair
//!   against command state and fans out per-file work
//! - [`file_complete::FileCompleteProcessor`]: drains per-manifest state as
//!   files finish, then finalizes commands and archives the manifests
//! - [`cleaner::TableRowCleaner`]: deletes stale table rows
//!
//! Each component implements [`runner::WorkerTask`] and is driven by a
//! [`runner::TaskRunner`] until its cancellation token fires.
//!
//! ## Example
//!
//! ```rust
//! use recon_worker::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_json(r#"{"fileCompleteProcessor": {"commandBatchSize": 25}}"#)?;
//! assert!(config.validate().is_none());
//! assert_eq!(config.file_complete_processor.command_batch_size, 25);
//! # Ok::<(), recon_core::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod authority;
pub mod cleaner;
pub mod config;
pub mod data_manifest;
pub mod file_complete;
pub mod metrics;
pub mod monitor;
pub mod renewer;
pub mod runner;

pub use authority::{CommandStatusAuthority, CommandSummary, TableCommandStatusAuthority};
pub use cleaner::TableRowCleaner;
pub use config::PipelineConfig;
pub use data_manifest::{DataManifestProcessor, FanOutKind, ManifestOutcome};
pub use file_complete::{CompletionOutcome, FileCompleteProcessor, Finalization};
pub use monitor::{CosmosMonitor, MonitorTally};
pub use renewer::{LeaseRenewer, NoopRenewer, Renew, VisibilityRenewer};
pub use runner::{TaskRunner, WorkerTask, run_single_pass};
