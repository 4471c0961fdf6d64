//! The produce/consume contract shared by every queue backend.
//!
//! Adapters are always handed out as `Arc`s: a [`Message`] refers back to
//! the adapter that reserved it through a `Weak`, so `confirm` and `requeue`
//! work from the message alone.

pub mod beanstalk;
pub mod memory;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{QueueError, Result};
use crate::format::Format;
use crate::message::Message;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteOptions {
    /// 0 is most urgent.
    pub priority: u32,
    /// Seconds before the job becomes ready.
    pub delay: u32,
    /// Seconds a reservation is held before the server releases the job.
    pub ttr: u32,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: 0,
            ttr: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReadOptions {
    /// Seconds to wait for a job. `None` waits indefinitely; `Some(0)`
    /// returns at once.
    pub timeout: Option<u32>,
}

impl ReadOptions {
    pub fn timeout(secs: u32) -> Self {
        Self {
            timeout: Some(secs),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RequeueOptions {
    pub priority: u32,
    pub delay: u32,
}

/// What a `consume` callback wants to happen next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Clone, Debug, Default)]
pub struct ConsumeOptions {
    /// Per-reservation wait, as in [`ReadOptions`]. An idle timeout just
    /// starts the next reservation.
    pub timeout: Option<u32>,
    /// Stop after this many messages have been handed to the callback.
    pub limit: Option<u64>,
    /// Confirm any message the callback returns from without having
    /// confirmed or requeued it. Off by default: acknowledgement is the
    /// callback's job.
    pub auto_ack: bool,
    /// Stops the loop when fired. A reservation in flight is abandoned and
    /// the adapter disconnected, which returns the job to the server.
    pub cancel: Option<CancellationToken>,
}

pub type ConsumeFuture = Pin<Box<dyn Future<Output = Result<Flow>> + Send>>;

/// Called once per message by [`Queue::consume`].
pub type Callback<'a> = dyn FnMut(Message) -> ConsumeFuture + Send + 'a;

#[derive(Clone, Debug, Default)]
pub struct AddOptions {
    /// Appended to the task name, separated by a space.
    pub payload: Option<Bytes>,
    /// Tube to select before writing, for backends that have tubes.
    pub tube: Option<String>,
    pub write: WriteOptions,
}

impl AddOptions {
    /// The job body for `task`.
    pub fn body(&self, task: &str) -> Bytes {
        match &self.payload {
            Some(payload) if !payload.is_empty() => {
                [task.as_bytes(), b" ".as_slice(), &payload[..]].concat().into()
            },
            _ => Bytes::copy_from_slice(task.as_bytes()),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunOptions {
    pub timeout: Option<u32>,
    /// Tube to watch before reserving, for backends that have tubes.
    pub tube: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResetOptions {
    /// Per-reservation wait. The drain ends at the first reservation that
    /// times out.
    pub timeout: u32,
    /// Tube to watch before draining, for backends that have tubes.
    pub tube: Option<String>,
}

impl Default for ResetOptions {
    fn default() -> Self {
        Self {
            timeout: 1,
            tube: None,
        }
    }
}

/// A queue backend.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Establishes the backend connection, replacing any existing one.
    async fn connect(&self) -> Result<bool>;

    /// Drops the backend connection, abandoning any command in flight.
    async fn disconnect(&self) -> Result<bool>;

    fn is_connected(&self) -> bool;

    /// Submits a job. False if the backend refused it.
    async fn write(&self, data: Bytes, options: WriteOptions) -> Result<bool>;

    /// Reserves the next job. `None` if none became available in time.
    async fn read(&self, options: ReadOptions) -> Result<Option<Message>>;

    /// Deletes a reserved job. False if it isn't reserved by this adapter.
    async fn confirm(&self, message: &Message) -> Result<bool>;

    /// Returns a reserved job to the queue. False if it isn't reserved by this
    /// adapter.
    async fn requeue(
        &self,
        message: &Message,
        options: RequeueOptions,
    ) -> Result<bool>;

    /// Reserves messages and hands each to `callback` until the callback
    /// returns [`Flow::Stop`], `options.limit` messages have been handled, or
    /// `options.cancel` fires. Returns how many messages were handled.
    ///
    /// An error from the callback stops the loop and is returned.
    async fn consume(
        &self,
        callback: &mut Callback<'_>,
        options: ConsumeOptions,
    ) -> Result<u64> {
        let cancel = options.cancel.clone().unwrap_or_default();
        let read = ReadOptions {
            timeout: options.timeout,
        };
        let mut handled = 0;

        while options.limit.map_or(true, |limit| handled < limit) {
            let next = select! {
                next = self.read(read) => next,
                _ = cancel.cancelled() => {
                    self.disconnect().await?;
                    break;
                },
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(QueueError::Aborted) => {
                    debug!("reservation aborted, stopping");
                    break;
                },
                Err(e) => return Err(e),
            };

            handled += 1;
            let flow = callback(message.clone()).await?;

            if options.auto_ack && !message.is_settled() {
                if !message.confirm().await? {
                    warn!(id = message.id(), "auto-acknowledge failed");
                }
            }

            if flow == Flow::Stop {
                break;
            }
        }

        debug!(handled, "consume finished");
        Ok(handled)
    }

    /// Legacy producer call: writes `task`, with any payload appended.
    async fn add(&self, task: &str, options: AddOptions) -> Result<bool> {
        self.write(options.body(task), options.write).await
    }

    /// Legacy worker call: reserves one job and confirms it straight away,
    /// returning its body.
    async fn run(&self, options: RunOptions) -> Result<Option<Bytes>> {
        run_once(self, options.timeout).await
    }

    /// Deletes every job that becomes ready within `options.timeout` seconds
    /// of the previous one. Returns how many were deleted.
    async fn reset(&self, options: ResetOptions) -> Result<u64> {
        drain(self, options.timeout).await
    }

    /// Drains the queue with the default reset options.
    async fn purge(&self) -> Result<u64> {
        self.reset(ResetOptions::default()).await
    }

    /// How [`QueueExt::write_value`] and [`Message::decode`] encode bodies.
    fn format(&self) -> Format {
        Format::Raw
    }
}

/// Typed producer calls, available on every [`Queue`].
#[async_trait]
pub trait QueueExt: Queue {
    /// Encodes `value` with the adapter's [`Format`] and writes it.
    async fn write_value<T>(
        &self,
        value: &T,
        options: WriteOptions,
    ) -> Result<bool>
    where
        T: Serialize + Sync + ?Sized,
    {
        let data = self.format().encode(value)?;
        self.write(data, options).await
    }
}

impl<Q: Queue + ?Sized> QueueExt for Q {}

/// Reserve one job, then delete it.
pub(crate) async fn run_once<Q: Queue + ?Sized>(
    queue: &Q,
    timeout: Option<u32>,
) -> Result<Option<Bytes>> {
    match queue.read(ReadOptions { timeout }).await? {
        Some(message) => {
            if !queue.confirm(&message).await? {
                warn!(id = message.id(), "job ran but could not be deleted");
            }
            Ok(Some(message.data().clone()))
        },
        None => Ok(None),
    }
}

/// Reserve-then-delete until a reservation times out.
pub(crate) async fn drain<Q: Queue + ?Sized>(
    queue: &Q,
    timeout: u32,
) -> Result<u64> {
    let mut drained = 0;
    while let Some(message) = queue.read(ReadOptions::timeout(timeout)).await? {
        if queue.confirm(&message).await? {
            drained += 1;
        }
    }
    debug!(drained, "drained queue");
    Ok(drained)
}
