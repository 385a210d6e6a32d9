//! Throttled renewal of a manifest lease and its queue item.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use recon_core::error::{Error, Result};
use recon_core::lease::{Lease, LeaseManager};
use recon_core::queue::{QueueReceipt, WorkQueue};

/// Something long-running work can call to keep its claims alive.
#[async_trait]
pub trait Renew: Send + Sync {
    /// Renews the held claims if enough time has passed since the last renewal.
    ///
    /// # Errors
    ///
    /// Returns `Error::Lease` if the lease was lost; the caller no longer
    /// owns the work and must stop.
    async fn renew(&self) -> Result<()>;
}

/// Renews a lease together with the visibility of the queue item it guards.
///
/// Renewal points can be hit often; the renewer only touches the stores once
/// per `min_interval`.
pub struct LeaseRenewer<T: Send + Sync + 'static> {
    leases: Arc<dyn LeaseManager>,
    lease: Lease,
    queue: Arc<dyn WorkQueue<T>>,
    receipt: QueueReceipt,
    duration: Duration,
    min_interval: Duration,
    last_renewed: Mutex<Instant>,
}

impl<T: Send + Sync + 'static> LeaseRenewer<T> {
    /// Creates a renewer. The claims count as freshly renewed.
    #[must_use]
    pub fn new(
        leases: Arc<dyn LeaseManager>,
        lease: Lease,
        queue: Arc<dyn WorkQueue<T>>,
        receipt: QueueReceipt,
        duration: Duration,
        min_interval: Duration,
    ) -> Self {
        Self {
            leases,
            lease,
            queue,
            receipt,
            duration,
            min_interval,
            last_renewed: Mutex::new(Instant::now()),
        }
    }

    /// The guarded lease.
    #[must_use]
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    fn due(&self) -> Result<bool> {
        let last = self.last_renewed.lock().map_err(|_| Error::poisoned())?;
        Ok(last.elapsed() >= self.min_interval)
    }

    fn mark_renewed(&self) -> Result<()> {
        *self.last_renewed.lock().map_err(|_| Error::poisoned())? = Instant::now();
        Ok(())
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Renew for LeaseRenewer<T> {
    async fn renew(&self) -> Result<()> {
        if !self.due()? {
            return Ok(());
        }

        if !self.leases.renew(&self.lease, self.duration).await? {
            tracing::error!(
                group = %self.lease.group,
                resource = %self.lease.resource,
                "lease lost during renewal"
            );
            return Err(Error::lease(format!(
                "lease on {} lost during renewal",
                self.lease.resource
            )));
        }
        self.queue.renew_lease(&self.receipt, self.duration).await?;
        self.mark_renewed()?;

        tracing::debug!(resource = %self.lease.resource, "lease renewed");
        Ok(())
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for LeaseRenewer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRenewer")
            .field("lease", &self.lease)
            .field("receipt", &self.receipt)
            .field("min_interval", &self.min_interval)
            .finish_non_exhaustive()
    }
}

/// Renews only the visibility of a queue item, for work not guarded by a lease.
pub struct VisibilityRenewer<T: Send + Sync + 'static> {
    queue: Arc<dyn WorkQueue<T>>,
    receipt: QueueReceipt,
    duration: Duration,
    min_interval: Duration,
    last_renewed: Mutex<Instant>,
}

impl<T: Send + Sync + 'static> VisibilityRenewer<T> {
    /// Creates a renewer. The item counts as freshly renewed.
    #[must_use]
    pub fn new(
        queue: Arc<dyn WorkQueue<T>>,
        receipt: QueueReceipt,
        duration: Duration,
        min_interval: Duration,
    ) -> Self {
        Self {
            queue,
            receipt,
            duration,
            min_interval,
            last_renewed: Mutex::new(Instant::now()),
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Renew for VisibilityRenewer<T> {
    async fn renew(&self) -> Result<()> {
        {
            let last = self.last_renewed.lock().map_err(|_| Error::poisoned())?;
            if last.elapsed() < self.min_interval {
                return Ok(());
            }
        }
        self.queue.renew_lease(&self.receipt, self.duration).await?;
        *self.last_renewed.lock().map_err(|_| Error::poisoned())? = Instant::now();
        Ok(())
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for VisibilityRenewer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityRenewer")
            .field("receipt", &self.receipt)
            .finish_non_exhaustive()
    }
}

/// Renewer that does nothing; for callers without claims to keep alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRenewer;

#[async_trait]
impl Renew for NoopRenewer {
    async fn renew(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::lease::{LeaseRow, TableLeaseManager};
    use recon_core::queue::MemoryWorkQueue;
    use recon_core::table::MemoryTable;

    const LEASE: Duration = Duration::from_secs(600);
    const MIN: Duration = Duration::from_secs(60);

    async fn setup() -> (
        LeaseRenewer<String>,
        Arc<TableLeaseManager<MemoryTable<LeaseRow>>>,
    ) {
        let leases = Arc::new(TableLeaseManager::new(Arc::new(MemoryTable::new("leases"))));
        let queue = Arc::new(MemoryWorkQueue::<String>::new("items"));
        queue.enqueue(&"work".to_string()).await.expect("enqueue");
        let item = queue.dequeue(LEASE).await.expect("dequeue").expect("item");
        let lease = leases
            .attempt_acquire("agent", "manifest", "w1", LEASE, false)
            .await
            .expect("acquire")
            .expect("lease");
        let renewer = LeaseRenewer::new(
            leases.clone(),
            lease,
            queue,
            item.receipt,
            LEASE,
            MIN,
        );
        (renewer, leases)
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_is_throttled() {
        let (renewer, _leases) = setup().await;
        renewer.renew().await.expect("throttled no-op");

        tokio::time::advance(MIN).await;
        renewer.renew().await.expect("renewed");
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_is_an_error() {
        let (renewer, leases) = setup().await;
        leases.release(renewer.lease(), true).await.expect("release");

        tokio::time::advance(MIN).await;
        let err = renewer.renew().await.expect_err("lease gone");
        assert!(matches!(err, Error::Lease { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_renewal_fails_on_stale_receipts() {
        let queue = Arc::new(MemoryWorkQueue::<String>::new("items"));
        queue.enqueue(&"work".to_string()).await.expect("enqueue");
        let item = queue.dequeue(LEASE).await.expect("dequeue").expect("item");
        let renewer = VisibilityRenewer::new(queue.clone(), item.receipt.clone(), LEASE, MIN);

        tokio::time::advance(MIN).await;
        renewer.renew().await.expect("renewed");

        queue.complete(&item.receipt).await.expect("complete");
        tokio::time::advance(MIN).await;
        assert!(renewer.renew().await.is_err());
    }
}
