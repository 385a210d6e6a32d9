//! Lease manager with operation tracing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use recon_core::error::Result;
use recon_core::lease::{Lease, LeaseManager, LeaseRow, TableLeaseManager};
use recon_core::table::MemoryTable;

/// Record of a lease operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOp {
    /// Acquisition attempt.
    Acquire {
        /// Lease group.
        group: String,
        /// Resource within the group.
        resource: String,
        /// Whether the lease was granted.
        acquired: bool,
    },
    /// Renewal.
    Renew {
        /// Resource renewed.
        resource: String,
    },
    /// Release.
    Release {
        /// Resource released.
        resource: String,
        /// Whether the protected work succeeded.
        success: bool,
    },
}

/// Table-backed lease manager that records every call.
#[derive(Clone)]
pub struct TracingLeaseManager {
    inner: TableLeaseManager<MemoryTable<LeaseRow>>,
    operations: Arc<Mutex<Vec<LeaseOp>>>,
}

impl std::fmt::Debug for TracingLeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingLeaseManager")
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

impl Default for TracingLeaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TracingLeaseManager {
    /// Creates a manager over a fresh in-memory lease table.
    pub fn new() -> Self {
        Self {
            inner: TableLeaseManager::new(Arc::new(MemoryTable::new("leases")))
                .with_max_wait_attempts(1),
            operations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<LeaseOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Number of acquisition attempts.
    pub fn acquire_attempts(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| matches!(op, LeaseOp::Acquire { .. }))
            .count()
    }

    /// Takes a lease as a foreign owner, so workers under test find it held.
    pub async fn hold(&self, group: &str, resource: &str, duration: Duration) -> Lease {
        self.inner
            .attempt_acquire(group, resource, "foreign-owner", duration, false)
            .await
            .expect("acquire")
            .expect("lease available")
    }

    fn record(&self, op: LeaseOp) {
        self.operations.lock().expect("lock").push(op);
    }
}

#[async_trait]
impl LeaseManager for TracingLeaseManager {
    async fn attempt_acquire(
        &self,
        group: &str,
        resource: &str,
        owner: &str,
        duration: Duration,
        wait_for_availability: bool,
    ) -> Result<Option<Lease>> {
        let lease = self
            .inner
            .attempt_acquire(group, resource, owner, duration, wait_for_availability)
            .await?;
        self.record(LeaseOp::Acquire {
            group: group.to_string(),
            resource: resource.to_string(),
            acquired: lease.is_some(),
        });
        Ok(lease)
    }

    async fn renew(&self, lease: &Lease, duration: Duration) -> Result<bool> {
        self.record(LeaseOp::Renew {
            resource: lease.resource.clone(),
        });
        self.inner.renew(lease, duration).await
    }

    async fn release(&self, lease: &Lease, success: bool) -> Result<()> {
        self.record(LeaseOp::Release {
            resource: lease.resource.clone(),
            success,
        });
        self.inner.release(lease, success).await
    }
}
