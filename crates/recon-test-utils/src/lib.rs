//! Shared test utilities for reconciliation pipeline tests.
//!
//! This crate provides:
//! - [`TracingObjectStore`]: in-memory object store with operation recording
//!   and failure injection
//! - [`TracingWorkQueue`] and [`TracingPartitionedQueue`]: queues that record
//!   every delivery operation
//! - [`TracingTable`]: table store with operation recording and forced
//!   version conflicts
//! - [`TracingLeaseManager`]: lease manager recording acquisition attempts
//! - [`ManifestFixture`]: lays out agent directories with manifests and data
//!   files
//!
//! # Example
//!
//! ```rust,ignore
//! use recon_test_utils::{ManifestFixture, TracingObjectStore};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let store = TracingObjectStore::new();
//!     let fixture = ManifestFixture::new("agent1", "2024_01_01").with_command("c1");
//!     fixture.write(&store);
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod lease;
pub mod queue;
pub mod storage;
pub mod table;

pub use fixtures::*;
pub use lease::*;
pub use queue::*;
pub use storage::*;
pub use table::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("recon=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
