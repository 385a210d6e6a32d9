//! Named, time-bounded leases for distributed mutual exclusion.
//!
//! A lease is identified by a `(group, resource)` pair and owned by one
//! worker until it expires or is released. Acquisition never blocks on a
//! held lease unless the caller asks to wait; a held lease is reported as
//! `None`, which is a normal outcome rather than an error.
//!
//! # How It Works
//!
//! [`TableLeaseManager`] keeps one row per lease in a [`TableStore`]:
//!
//! 1. Acquisition inserts the row. Insert succeeds for exactly one writer.
//! 2. If the row exists and its owner has expired or released it, the row is
//!    replaced using its version. Only one writer wins the replace.
//! 3. Renewal and release check the acquisition token first, so a worker
//!    whose lease was taken over cannot disturb the new owner.
//! 4. A successful release purges the row; a failed release keeps it
//!    unowned so the resource is immediately available for retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::error::Result;
use crate::paths::escape_key;
use crate::table::{RowVersion, TableRow, TableStore, Versioned};
use crate::time::after;

/// Maximum attempts when the caller waits for availability.
pub const DEFAULT_MAX_WAIT_ATTEMPTS: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Lease group.
    pub group: String,
    /// Resource within the group.
    pub resource: String,
    /// Owner that acquired the lease.
    pub owner: String,
    /// Token unique to this acquisition.
    pub token: String,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

/// Lease manager contract.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Attempts to acquire a lease for `duration`.
    ///
    /// Returns `None` if another owner holds it. With
    /// `wait_for_availability` the attempt is retried with backoff a bounded
    /// number of times before giving up.
    async fn attempt_acquire(
        &self,
        group: &str,
        resource: &str,
        owner: &str,
        duration: Duration,
        wait_for_availability: bool,
    ) -> Result<Option<Lease>>;

    /// Extends a held lease to `duration` from now.
    ///
    /// Returns `false` if the lease was lost.
    async fn renew(&self, lease: &Lease, duration: Duration) -> Result<bool>;

    /// Releases a held lease.
    ///
    /// `success = true` means the protected work is finished and the lease
    /// record can be purged; `false` leaves the record unowned so another
    /// worker can pick the work up at once.
    async fn release(&self, lease: &Lease, success: bool) -> Result<()>;
}

/// Persisted lease record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRow {
    /// Lease group.
    pub group: String,
    /// Resource within the group.
    pub resource: String,
    /// Current owner, `None` once released.
    pub owner: Option<String>,
    /// Token of the current acquisition.
    pub token: String,
    /// Expiry of the current acquisition.
    pub expires_at: DateTime<Utc>,
}

impl LeaseRow {
    fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.owner.is_none() || self.expires_at <= now
    }

    fn is_held_by(&self, lease: &Lease) -> bool {
        self.token == lease.token && self.owner.as_deref() == Some(lease.owner.as_str())
    }
}

impl TableRow for LeaseRow {
    fn partition_key(&self) -> String {
        escape_key(&self.group)
    }

    fn row_key(&self) -> String {
        escape_key(&self.resource)
    }
}

/// Internal outcome of a single acquisition attempt.
enum Attempt {
    Acquired(Lease),
    Held,
}

/// Lease manager backed by a table store.
pub struct TableLeaseManager<S: TableStore<LeaseRow> + ?Sized> {
    table: Arc<S>,
    max_wait_attempts: u32,
}

impl<S: TableStore<LeaseRow> + ?Sized> Clone for TableLeaseManager<S> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            max_wait_attempts: self.max_wait_attempts,
        }
    }
}

impl<S: TableStore<LeaseRow> + ?Sized> TableLeaseManager<S> {
    /// Creates a manager over the given lease table.
    #[must_use]
    pub fn new(table: Arc<S>) -> Self {
        Self {
            table,
            max_wait_attempts: DEFAULT_MAX_WAIT_ATTEMPTS,
        }
    }

    /// Overrides the number of attempts made when waiting for availability.
    #[must_use]
    pub fn with_max_wait_attempts(mut self, attempts: u32) -> Self {
        self.max_wait_attempts = attempts.max(1);
        self
    }

    async fn try_acquire(
        &self,
        group: &str,
        resource: &str,
        owner: &str,
        duration: Duration,
    ) -> Result<Attempt> {
        let now = Utc::now();
        let row = LeaseRow {
            group: group.to_string(),
            resource: resource.to_string(),
            owner: Some(owner.to_string()),
            token: Ulid::new().to_string(),
            expires_at: after(now, duration),
        };
        let acquired = Lease {
            group: row.group.clone(),
            resource: row.resource.clone(),
            owner: owner.to_string(),
            token: row.token.clone(),
            expires_at: row.expires_at,
        };

        if self.table.insert(&row).await? {
            return Ok(Attempt::Acquired(acquired));
        }

        // Row exists. Take it over only if it is unowned or expired, and only
        // at the version we inspected.
        let Some(current) = self.table.get(&row.partition_key(), &row.row_key()).await? else {
            return Ok(Attempt::Held);
        };
        if !current.row.is_available(now) {
            return Ok(Attempt::Held);
        }
        if self.table.replace(&row, &current.exact()).await? {
            Ok(Attempt::Acquired(acquired))
        } else {
            Ok(Attempt::Held)
        }
    }

    async fn current(&self, lease: &Lease) -> Result<Option<Versioned<LeaseRow>>> {
        let current = self
            .table
            .get(&escape_key(&lease.group), &escape_key(&lease.resource))
            .await?;
        Ok(current.filter(|c| c.row.is_held_by(lease)))
    }
}

#[async_trait]
impl<S: TableStore<LeaseRow> + ?Sized> LeaseManager for TableLeaseManager<S> {
    async fn attempt_acquire(
        &self,
        group: &str,
        resource: &str,
        owner: &str,
        duration: Duration,
        wait_for_availability: bool,
    ) -> Result<Option<Lease>> {
        let attempts = if wait_for_availability {
            self.max_wait_attempts
        } else {
            1
        };
        let mut backoff = BACKOFF_BASE;

        for attempt in 1..=attempts {
            match self.try_acquire(group, resource, owner, duration).await? {
                Attempt::Acquired(lease) => {
                    tracing::debug!(group, resource, owner, "lease acquired");
                    return Ok(Some(lease));
                }
                Attempt::Held if attempt < attempts => {
                    let delay = backoff.min(BACKOFF_MAX) + Duration::from_millis(rand_jitter());
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
                Attempt::Held => {}
            }
        }

        tracing::debug!(group, resource, owner, "lease held elsewhere");
        Ok(None)
    }

    async fn renew(&self, lease: &Lease, duration: Duration) -> Result<bool> {
        let Some(current) = self.current(lease).await? else {
            return Ok(false);
        };
        let mut row = current.row.clone();
        row.expires_at = after(Utc::now(), duration);
        self.table.replace(&row, &current.exact()).await
    }

    async fn release(&self, lease: &Lease, success: bool) -> Result<()> {
        let Some(current) = self.current(lease).await? else {
            tracing::debug!(
                group = %lease.group,
                resource = %lease.resource,
                "lease already lost; nothing to release"
            );
            return Ok(());
        };

        let released = if success {
            self.table
                .delete(
                    &current.row.partition_key(),
                    &current.row.row_key(),
                    &current.exact(),
                )
                .await?
        } else {
            let mut row = current.row.clone();
            row.owner = None;
            row.expires_at = DateTime::<Utc>::UNIX_EPOCH;
            self.table.replace(&row, &current.exact()).await?
        };

        if !released {
            tracing::warn!(
                group = %lease.group,
                resource = %lease.resource,
                success,
                "lease changed while releasing"
            );
        }
        Ok(())
    }
}

impl<S: TableStore<LeaseRow> + ?Sized> std::fmt::Debug for TableLeaseManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableLeaseManager")
            .field("max_wait_attempts", &self.max_wait_attempts)
            .finish_non_exhaustive()
    }
}

/// Generates jitter for backoff (0-50ms).
fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 50
}
