//! Work queues with visibility timeouts.
//!
//! A dequeued item is hidden for its visibility timeout and becomes visible
//! again unless the consumer completes it. Each dequeue increments the
//! item's dequeue count, which lets consumers spot poison messages.
//!
//! Payloads cross the queue as JSON, the same as a remote queue service
//! would carry them.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::time::after;

/// Handle identifying one delivery of a queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueReceipt {
    /// Stable message id.
    pub message_id: String,
    /// Delivery-specific token; stale after the message is redelivered.
    pub pop_receipt: String,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct QueueItem<T> {
    /// Decoded payload.
    pub data: T,
    /// Number of times this message has been dequeued, including this one.
    pub dequeue_count: u32,
    /// Time the message was first enqueued.
    pub inserted_at: DateTime<Utc>,
    /// Receipt used to complete, renew or release this delivery.
    pub receipt: QueueReceipt,
}

/// Queue of work items.
#[async_trait]
pub trait WorkQueue<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Name of the queue.
    fn name(&self) -> &str;

    /// Appends an item.
    async fn enqueue(&self, item: &T) -> Result<()>;

    /// Takes the next visible item and hides it for `visibility`.
    ///
    /// Returns `None` when nothing is visible.
    async fn dequeue(&self, visibility: Duration) -> Result<Option<QueueItem<T>>>;

    /// Removes a delivered item permanently.
    ///
    /// Returns `Error::Queue` if the receipt is stale.
    async fn complete(&self, receipt: &QueueReceipt) -> Result<()>;

    /// Extends the visibility timeout of a delivered item to `visibility` from now.
    async fn renew_lease(&self, receipt: &QueueReceipt, visibility: Duration) -> Result<()>;

    /// Makes a delivered item visible again immediately.
    async fn release(&self, receipt: &QueueReceipt) -> Result<()>;

    /// Number of messages in the queue, visible or not.
    async fn len(&self) -> Result<usize>;
}

/// Set of queues keyed by partition, consumed in ascending partition order.
#[async_trait]
pub trait PartitionedWorkQueue<T, P>: Send + Sync
where
    T: Send + Sync + 'static,
    P: Send + 'static,
{
    /// Partitions this queue routes to, in ascending order.
    fn partitions(&self) -> Vec<P>;

    /// Appends an item to one partition.
    ///
    /// Returns `Error::Queue` if the partition was never added.
    async fn enqueue(&self, partition: P, item: &T) -> Result<()>;

    /// Takes the next visible item from the lowest non-empty partition.
    async fn dequeue(&self, visibility: Duration) -> Result<Option<(P, QueueItem<T>)>>;

    /// Removes a delivered item from its partition.
    async fn complete(&self, partition: P, receipt: &QueueReceipt) -> Result<()>;

    /// Number of messages in one partition.
    async fn len(&self, partition: P) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    pop_receipt: String,
    body: String,
    dequeue_count: u32,
    inserted_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::queue("work queue lock poisoned")
}

/// In-memory queue with visibility timeouts.
///
/// Single-process only. Message order is insertion order among visible
/// messages.
#[derive(Debug, Clone)]
pub struct MemoryWorkQueue<T> {
    name: String,
    messages: Arc<RwLock<VecDeque<StoredMessage>>>,
    _payload: std::marker::PhantomData<fn() -> T>,
}

impl<T> MemoryWorkQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Arc::new(RwLock::new(VecDeque::new())),
            _payload: std::marker::PhantomData,
        }
    }

    /// Decodes every message without changing visibility.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or a payload fails to decode.
    pub fn peek_all(&self) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let messages = self.messages.read().map_err(poison_err)?;
        messages
            .iter()
            .map(|m| serde_json::from_str(&m.body).map_err(Error::from))
            .collect()
    }

    fn with_delivery<F>(&self, receipt: &QueueReceipt, f: F) -> Result<()>
    where
        F: FnOnce(&mut VecDeque<StoredMessage>, usize),
    {
        let mut messages = self.messages.write().map_err(poison_err)?;
        let idx = messages
            .iter()
            .position(|m| {
                m.message_id == receipt.message_id && m.pop_receipt == receipt.pop_receipt
            })
            .ok_or_else(|| {
                Error::queue(format!(
                    "receipt for message {} in queue {} is no longer valid",
                    receipt.message_id, self.name
                ))
            })?;
        f(&mut messages, idx);
        Ok(())
    }
}

#[async_trait]
impl<T> WorkQueue<T> for MemoryWorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, item: &T) -> Result<()> {
        let body = serde_json::to_string(item)?;
        let now = Utc::now();
        let mut messages = self.messages.write().map_err(poison_err)?;
        messages.push_back(StoredMessage {
            message_id: Ulid::new().to_string(),
            pop_receipt: String::new(),
            body,
            dequeue_count: 0,
            inserted_at: now,
            visible_at: now,
        });
        Ok(())
    }

    async fn dequeue(&self, visibility: Duration) -> Result<Option<QueueItem<T>>> {
        let now = Utc::now();
        let mut messages = self.messages.write().map_err(poison_err)?;
        let Some(message) = messages.iter_mut().find(|m| m.visible_at <= now) else {
            return Ok(None);
        };

        message.dequeue_count += 1;
        message.pop_receipt = Ulid::new().to_string();
        message.visible_at = after(now, visibility);

        let data = serde_json::from_str(&message.body)?;
        Ok(Some(QueueItem {
            data,
            dequeue_count: message.dequeue_count,
            inserted_at: message.inserted_at,
            receipt: QueueReceipt {
                message_id: message.message_id.clone(),
                pop_receipt: message.pop_receipt.clone(),
            },
        }))
    }

    async fn complete(&self, receipt: &QueueReceipt) -> Result<()> {
        self.with_delivery(receipt, |messages, idx| {
            messages.remove(idx);
        })
    }

    async fn renew_lease(&self, receipt: &QueueReceipt, visibility: Duration) -> Result<()> {
        let until = after(Utc::now(), visibility);
        self.with_delivery(receipt, |messages, idx| {
            messages[idx].visible_at = until;
        })
    }

    async fn release(&self, receipt: &QueueReceipt) -> Result<()> {
        let now = Utc::now();
        self.with_delivery(receipt, |messages, idx| {
            messages[idx].visible_at = now;
        })
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.messages.read().map_err(poison_err)?.len())
    }
}

/// In-memory partitioned queue: one [`MemoryWorkQueue`] per partition.
#[derive(Debug, Clone)]
pub struct MemoryPartitionedQueue<T, P> {
    name: String,
    partitions: BTreeMap<P, MemoryWorkQueue<T>>,
}

impl<T, P> MemoryPartitionedQueue<T, P>
where
    P: Ord + Copy + std::fmt::Display,
{
    /// Creates a queue with no partitions.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: BTreeMap::new(),
        }
    }

    /// Adds a partition, named `{queue}-{partition}`.
    #[must_use]
    pub fn with_partition(mut self, partition: P) -> Self {
        let name = format!("{}-{partition}", self.name);
        self.partitions.insert(partition, MemoryWorkQueue::new(name));
        self
    }

    /// Returns the queue backing one partition.
    #[must_use]
    pub fn partition(&self, partition: P) -> Option<&MemoryWorkQueue<T>> {
        self.partitions.get(&partition)
    }

    fn queue(&self, partition: P) -> Result<&MemoryWorkQueue<T>> {
        self.partitions.get(&partition).ok_or_else(|| {
            Error::queue(format!(
                "partition {partition} is not configured for queue {}",
                self.name
            ))
        })
    }
}

#[async_trait]
impl<T, P> PartitionedWorkQueue<T, P> for MemoryPartitionedQueue<T, P>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    P: Ord + Copy + std::fmt::Display + Send + Sync + 'static,
{
    fn partitions(&self) -> Vec<P> {
        self.partitions.keys().copied().collect()
    }

    async fn enqueue(&self, partition: P, item: &T) -> Result<()> {
        self.queue(partition)?.enqueue(item).await
    }

    async fn dequeue(&self, visibility: Duration) -> Result<Option<(P, QueueItem<T>)>> {
        for (partition, queue) in &self.partitions {
            if let Some(item) = queue.dequeue(visibility).await? {
                return Ok(Some((*partition, item)));
            }
        }
        Ok(None)
    }

    async fn complete(&self, partition: P, receipt: &QueueReceipt) -> Result<()> {
        self.queue(partition)?.complete(receipt).await
    }

    async fn len(&self, partition: P) -> Result<usize> {
        self.queue(partition)?.len().await
    }
}
