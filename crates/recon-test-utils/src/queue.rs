//! Work queues with operation tracing.

use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use recon_core::error::Result;
use recon_core::queue::{
    MemoryPartitionedQueue, MemoryWorkQueue, PartitionedWorkQueue, QueueItem, QueueReceipt,
    WorkQueue,
};

/// Record of a queue operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOp {
    /// Item appended, with its partition if any.
    Enqueue {
        /// Partition name, empty for unpartitioned queues.
        partition: String,
    },
    /// Dequeue attempt and whether it delivered.
    Dequeue {
        /// Whether an item was delivered.
        delivered: bool,
    },
    /// Delivery completed.
    Complete,
    /// Visibility extended.
    RenewLease {
        /// Requested visibility.
        visibility: Duration,
    },
    /// Delivery released.
    Release,
}

/// Queue wrapper that records every operation.
#[derive(Debug, Clone)]
pub struct TracingWorkQueue<T> {
    inner: MemoryWorkQueue<T>,
    operations: Arc<Mutex<Vec<QueueOp>>>,
}

impl<T> TracingWorkQueue<T> {
    /// Creates an empty queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: MemoryWorkQueue::new(name),
            operations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<QueueOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Number of recorded operations equal to `op`.
    pub fn count(&self, op: &QueueOp) -> usize {
        self.operations().iter().filter(|o| *o == op).count()
    }

    /// Decodes every queued item.
    pub fn items(&self) -> Vec<T>
    where
        T: DeserializeOwned,
    {
        self.inner.peek_all().expect("peek")
    }

    fn record(&self, op: QueueOp) {
        self.operations.lock().expect("lock").push(op);
    }
}

#[async_trait]
impl<T> WorkQueue<T> for TracingWorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn enqueue(&self, item: &T) -> Result<()> {
        self.record(QueueOp::Enqueue {
            partition: String::new(),
        });
        self.inner.enqueue(item).await
    }

    async fn dequeue(&self, visibility: Duration) -> Result<Option<QueueItem<T>>> {
        let item = self.inner.dequeue(visibility).await?;
        self.record(QueueOp::Dequeue {
            delivered: item.is_some(),
        });
        Ok(item)
    }

    async fn complete(&self, receipt: &QueueReceipt) -> Result<()> {
        self.record(QueueOp::Complete);
        self.inner.complete(receipt).await
    }

    async fn renew_lease(&self, receipt: &QueueReceipt, visibility: Duration) -> Result<()> {
        self.record(QueueOp::RenewLease { visibility });
        self.inner.renew_lease(receipt, visibility).await
    }

    async fn release(&self, receipt: &QueueReceipt) -> Result<()> {
        self.record(QueueOp::Release);
        self.inner.release(receipt).await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }
}

/// Partitioned queue wrapper that records enqueues per partition.
#[derive(Debug, Clone)]
pub struct TracingPartitionedQueue<T, P> {
    inner: MemoryPartitionedQueue<T, P>,
    operations: Arc<Mutex<Vec<QueueOp>>>,
}

impl<T, P> TracingPartitionedQueue<T, P>
where
    P: Ord + Copy + Display,
{
    /// Creates a queue with one partition per entry of `partitions`.
    pub fn new(name: impl Into<String>, partitions: impl IntoIterator<Item = P>) -> Self {
        let inner = partitions
            .into_iter()
            .fold(MemoryPartitionedQueue::new(name), MemoryPartitionedQueue::with_partition);
        Self {
            inner,
            operations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<QueueOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Decodes every item queued in one partition.
    pub fn items(&self, partition: P) -> Vec<T>
    where
        T: DeserializeOwned,
    {
        self.inner
            .partition(partition)
            .map(|q| q.peek_all().expect("peek"))
            .unwrap_or_default()
    }

    fn record(&self, op: QueueOp) {
        self.operations.lock().expect("lock").push(op);
    }
}

#[async_trait]
impl<T, P> PartitionedWorkQueue<T, P> for TracingPartitionedQueue<T, P>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    P: Ord + Copy + Display + Send + Sync + 'static,
{
    fn partitions(&self) -> Vec<P> {
        self.inner.partitions()
    }

    async fn enqueue(&self, partition: P, item: &T) -> Result<()> {
        self.record(QueueOp::Enqueue {
            partition: partition.to_string(),
        });
        self.inner.enqueue(partition, item).await
    }

    async fn dequeue(&self, visibility: Duration) -> Result<Option<(P, QueueItem<T>)>> {
        let item = self.inner.dequeue(visibility).await?;
        self.record(QueueOp::Dequeue {
            delivered: item.is_some(),
        });
        Ok(item)
    }

    async fn complete(&self, partition: P, receipt: &QueueReceipt) -> Result<()> {
        self.record(QueueOp::Complete);
        self.inner.complete(partition, receipt).await
    }

    async fn len(&self, partition: P) -> Result<usize> {
        self.inner.len(partition).await
    }
}
