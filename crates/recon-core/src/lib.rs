//! # recon-core
//!
//! Shared primitives for the manifest reconciliation pipeline.
//!
//! Partner agents drop manifests and data files into a directory-structured
//! object store. The workers in `recon-worker` reconcile those manifests
//! against pending commands; this crate holds everything they share:
//!
//! - **Collaborator contracts**: object store, work queues, table store and
//!   lease manager traits, each with an in-memory implementation
//! - **Work items and rows**: the messages passed between stages and the
//!   persisted reconciliation state
//! - **Manifest formats**: parsing, date-token resolution, tags and hashing
//! - **Error Types**: shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use recon_core::prelude::*;
//!
//! let thresholds = PartitionThresholds::new(1000, 2000)?;
//! assert_eq!(thresholds.classify(1500), FileSizePartition::Medium);
//! # Ok::<(), recon_core::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod hash;
pub mod lease;
pub mod manifest;
pub mod model;
pub mod object_store;
pub mod observability;
pub mod partition;
pub mod paths;
pub mod queue;
pub mod table;
pub mod time;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::lease::{Lease, LeaseManager, LeaseRow, TableLeaseManager};
    pub use crate::model::{
        CommandState, CommandStatusCode, CompleteDataFile, ManifestFileSet,
        ManifestFileSetState, PendingDataFile, RequestCommandsInfo,
    };
    pub use crate::object_store::{EntryKind, FsEntry, MemoryObjectStore, ObjectStore};
    pub use crate::partition::{FileSizePartition, PartitionThresholds};
    pub use crate::queue::{
        MemoryPartitionedQueue, MemoryWorkQueue, PartitionedWorkQueue, QueueItem, QueueReceipt,
        WorkQueue,
    };
    pub use crate::table::{
        KeyedTable, MemoryTable, RowFilter, RowKey, RowVersion, TableRow, TableStore, Versioned,
    };
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use lease::{Lease, LeaseManager, TableLeaseManager};
pub use model::{
    CommandState, CommandStatusCode, CompleteDataFile, ManifestFileSet, ManifestFileSetState,
    PendingDataFile, RequestCommandsInfo,
};
pub use object_store::{FsEntry, MemoryObjectStore, ObjectStore};
pub use observability::{LogFormat, init_logging};
pub use partition::{FileSizePartition, PartitionThresholds};
pub use queue::{MemoryPartitionedQueue, MemoryWorkQueue, PartitionedWorkQueue, WorkQueue};
pub use table::{KeyedTable, MemoryTable, TableStore};
