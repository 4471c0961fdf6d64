//! In-process queue with beanstalkd's scheduling rules: jobs are reserved in
//! priority order (ties broken by age), may be delayed, and return to the
//! ready queue when their TTR runs out.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use super::{Queue, ReadOptions, RequeueOptions, WriteOptions};
use crate::config::MemoryConfig;
use crate::error::Result;
use crate::format::Format;
use crate::message::Message;

struct Entry {
    pri: u32,
    data: Bytes,
    ttr: Duration,
    ready_at: Instant,
    reserved_until: Option<Instant>,
    reserves: u32,
}

impl Entry {
    fn is_reserved(&self, now: Instant) -> bool {
        self.reserved_until.map_or(false, |until| until > now)
    }

    fn is_ready(&self, now: Instant) -> bool {
        !self.is_reserved(now) && self.ready_at <= now
    }

    /// When this entry next changes state without anyone touching it.
    fn wakes_at(&self, now: Instant) -> Option<Instant> {
        match self.reserved_until {
            Some(until) if until > now => Some(until),
            _ if self.ready_at > now => Some(self.ready_at),
            _ => None,
        }
    }
}

#[derive(Default)]
struct State {
    last_id: u64,
    jobs: BTreeMap<u64, Entry>,
}

impl State {
    /// Reserves the most urgent ready job.
    fn reserve(&mut self, now: Instant) -> Option<(u64, &Entry)> {
        let id = self
            .jobs
            .iter()
            .filter(|(_, entry)| entry.is_ready(now))
            .min_by_key(|(id, entry)| (entry.pri, **id))
            .map(|(id, _)| *id)?;

        let entry = self.jobs.get_mut(&id)?;
        entry.reserved_until = Some(now + entry.ttr);
        entry.reserves += 1;
        Some((id, entry))
    }

    fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.jobs.values().filter_map(|e| e.wakes_at(now)).min()
    }

    fn reserved_mut(&mut self, id: u64, now: Instant) -> Option<&mut Entry> {
        self.jobs.get_mut(&id).filter(|entry| entry.is_reserved(now))
    }
}

/// A queue living entirely inside this process. Nothing survives a restart.
pub struct Memory {
    config: MemoryConfig,
    me: Weak<Memory>,
    state: std::sync::Mutex<State>,
    /// Woken whenever a job is added or returned to the queue.
    changed: Notify,
    connected: AtomicBool,
}

impl Memory {
    pub fn new(config: MemoryConfig) -> Arc<Self> {
        debug!(tube = config.tube.as_deref(), "created memory queue");
        Arc::new_cyclic(|me| Self {
            config,
            me: me.clone(),
            state: Default::default(),
            changed: Notify::new(),
            connected: AtomicBool::new(true),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Jobs that could be reserved right now.
    pub fn ready_count(&self) -> usize {
        let now = Instant::now();
        self.state().jobs.values().filter(|e| e.is_ready(now)).count()
    }

    /// Jobs held in any state.
    pub fn len(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Queue for Memory {
    async fn connect(&self) -> Result<bool> {
        self.connected.store(true, Ordering::Release);
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool> {
        self.connected.store(false, Ordering::Release);
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn write(&self, data: Bytes, options: WriteOptions) -> Result<bool> {
        if let Some(max) = self.config.max_job_size {
            if data.len() > max {
                debug!(len = data.len(), max, "job too big");
                return Ok(false);
            }
        }

        let now = Instant::now();
        let id = {
            let mut state = self.state();
            state.last_id += 1;
            let id = state.last_id;
            state.jobs.insert(
                id,
                Entry {
                    pri: options.priority,
                    data,
                    ttr: Duration::from_secs(options.ttr.max(1).into()),
                    ready_at: now + Duration::from_secs(options.delay.into()),
                    reserved_until: None,
                    reserves: 0,
                },
            );
            id
        };

        trace!(id, "inserted");
        self.changed.notify_waiters();
        Ok(true)
    }

    async fn read(&self, options: ReadOptions) -> Result<Option<Message>> {
        let deadline = options
            .timeout
            .map(|secs| Instant::now() + Duration::from_secs(secs.into()));

        loop {
            // Register for wakeups before looking, so a write landing between
            // the look and the wait isn't missed.
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let now = Instant::now();
            let wakeup = {
                let mut state = self.state();
                if let Some((id, entry)) = state.reserve(now) {
                    let queue: Weak<dyn Queue> = self.me.clone();
                    let message = Message::bound(
                        id,
                        entry.data.clone(),
                        entry.pri,
                        entry.reserves > 1,
                        queue,
                    );
                    return Ok(Some(message.with_format(self.config.format)));
                }
                state.next_wakeup(now)
            };

            if deadline.map_or(false, |deadline| deadline <= now) {
                return Ok(None);
            }

            match wakeup.into_iter().chain(deadline).min() {
                Some(at) => select! {
                    _ = &mut changed => {},
                    _ = sleep_until(at) => {},
                },
                None => changed.await,
            }
        }
    }

    async fn confirm(&self, message: &Message) -> Result<bool> {
        let mut state = self.state();
        if state.reserved_mut(message.id(), Instant::now()).is_none() {
            return Ok(false);
        }
        Ok(state.jobs.remove(&message.id()).is_some())
    }

    async fn requeue(
        &self,
        message: &Message,
        options: RequeueOptions,
    ) -> Result<bool> {
        let now = Instant::now();
        {
            let mut state = self.state();
            let Some(entry) = state.reserved_mut(message.id(), now) else {
                return Ok(false);
            };
            entry.pri = options.priority;
            entry.reserved_until = None;
            entry.ready_at = now + Duration::from_secs(options.delay.into());
        }

        self.changed.notify_waiters();
        Ok(true)
    }

    fn format(&self) -> Format {
        self.config.format
    }
}
