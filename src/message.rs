use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::adapter::{Queue, RequeueOptions};
use crate::error::{QueueError, Result};
use crate::format::Format;

/// A reserved job as seen by the consumer.
///
/// The message keeps a weak reference to the adapter that reserved it, so
/// `confirm` and `requeue` can be called on the message itself without the
/// message keeping the adapter (and its connection) alive. Clones share the
/// same reservation.
#[derive(Clone)]
pub struct Message {
    id: u64,
    data: Bytes,
    priority: u32,
    redelivery: bool,
    format: Format,
    queue: Option<Weak<dyn Queue>>,
    settled: Arc<AtomicBool>,
}

impl Message {
    /// A message bound to the adapter that reserved it.
    pub fn bound(
        id: u64,
        data: Bytes,
        priority: u32,
        redelivery: bool,
        queue: Weak<dyn Queue>,
    ) -> Self {
        Self {
            id,
            data,
            priority,
            redelivery,
            format: Format::Raw,
            queue: Some(queue),
            settled: Arc::default(),
        }
    }

    /// A message not attached to any adapter. `confirm` and `requeue` fail on
    /// it with [`QueueError::UnboundMessage`].
    pub fn detached(id: u64, data: Bytes) -> Self {
        Self {
            id,
            data,
            priority: 0,
            redelivery: false,
            format: Format::Raw,
            queue: None,
            settled: Arc::default(),
        }
    }

    /// Sets the format `decode` reads the body with.
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Decodes the body with the format of the adapter that reserved it.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.format.decode(&self.data)
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Whether this job has been reserved before, and so may already have
    /// been partly processed.
    pub fn is_redelivery(&self) -> bool {
        self.redelivery
    }

    /// Whether the adapter that reserved this message is still alive.
    pub fn is_bound(&self) -> bool {
        self.queue().is_some()
    }

    /// Whether this message (or a clone of it) has been successfully
    /// confirmed or requeued.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Deletes the job. Returns false if the server no longer knows it as
    /// reserved by us, e.g. because it was already confirmed.
    pub async fn confirm(&self) -> Result<bool> {
        let queue = self.queue().ok_or(QueueError::UnboundMessage("confirm"))?;
        let done = queue.confirm(self).await?;
        self.settle(done);
        Ok(done)
    }

    /// Releases the job back to the ready queue at priority 0 without delay.
    pub async fn requeue(&self) -> Result<bool> {
        self.requeue_with(RequeueOptions::default()).await
    }

    pub async fn requeue_with(&self, options: RequeueOptions) -> Result<bool> {
        let queue = self.queue().ok_or(QueueError::UnboundMessage("requeue"))?;
        let done = queue.requeue(self, options).await?;
        self.settle(done);
        Ok(done)
    }

    fn queue(&self) -> Option<Arc<dyn Queue>> {
        self.queue.as_ref().and_then(Weak::upgrade)
    }

    fn settle(&self, done: bool) {
        if done {
            self.settled.store(true, Ordering::Release);
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .field("priority", &self.priority)
            .field("redelivery", &self.redelivery)
            .field("bound", &self.is_bound())
            .finish()
    }
}
