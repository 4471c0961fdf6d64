//! Queue adapter speaking the beanstalkd protocol over one TCP connection.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{
    drain, run_once, AddOptions, Queue, ReadOptions, RequeueOptions,
    ResetOptions, RunOptions, WriteOptions,
};
use crate::config::{BeanstalkConfig, DEFAULT_TUBE};
use crate::error::{QueueError, Result};
use crate::format::Format;
use crate::message::Message;
use crate::parser::is_valid_tube_name;
use crate::service::Service;
use crate::types::job::Job;
use crate::types::protocol::{
    BeanstalkCommand as C, BeanstalkResponse as R, Request,
};
use crate::types::stats::{JobStats, ServerStats, TubeStats};

/// Which end of a tube `peek`-family lookups inspect.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeekKind {
    Ready,
    Delayed,
    Buried,
}

/// A beanstalkd client holding one connection.
///
/// Commands are serialised through a mutex around the connection, so an
/// adapter can be shared between tasks but never has more than one command
/// in flight. Tube selection and the watch list belong to the connection and
/// are reset when it's re-established.
pub struct Beanstalk {
    config: BeanstalkConfig,
    me: Weak<Beanstalk>,
    service: Mutex<Option<Service<TcpStream>>>,
    connected: AtomicBool,
    link: std::sync::Mutex<Link>,
}

/// Cancellation state shared with `disconnect`, which fires the token to
/// abort a blocking command without waiting for the connection mutex.
#[derive(Default)]
struct Link {
    cancel: CancellationToken,
    /// Bumped by every disconnect. Commands compare it against the value
    /// they started with.
    epoch: u64,
}

/// Clears the connected flag on drop unless `finish` was called first.
struct InFlight<'a>(Option<&'a AtomicBool>);

impl InFlight<'_> {
    fn finish(mut self) {
        self.0 = None;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(connected) = self.0 {
            connected.store(false, Ordering::Release);
        }
    }
}

fn unexpected(command: &'static str, resp: &R) -> QueueError {
    QueueError::UnexpectedResponse {
        command,
        status: resp.status(),
    }
}

fn tube_arg(tube: &str) -> Result<String> {
    if is_valid_tube_name(tube.as_bytes()) {
        Ok(tube.to_owned())
    } else {
        Err(QueueError::InvalidTube(tube.to_owned()))
    }
}

impl Beanstalk {
    /// Creates an unconnected adapter. The first command connects it.
    pub fn new(config: BeanstalkConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            me: me.clone(),
            service: Mutex::new(None),
            connected: AtomicBool::new(false),
            link: Default::default(),
        })
    }

    /// Creates an adapter, connecting straight away if `auto_connect` is set.
    pub async fn open(config: BeanstalkConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let queue = Self::new(config);
        if queue.config.auto_connect {
            queue.connect().await?;
        }
        Ok(queue)
    }

    pub fn config(&self) -> &BeanstalkConfig {
        &self.config
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Aborts whatever command is in flight, and any still waiting for the
    /// connection. Returns the new epoch.
    fn sever(&self) -> u64 {
        let mut link = self.link();
        link.cancel.cancel();
        link.epoch += 1;
        link.epoch
    }

    #[instrument(
        skip_all,
        fields(host = %self.config.host, port = self.config.port)
    )]
    async fn open_service(&self, epoch: u64) -> Result<Service<TcpStream>> {
        let cancel = {
            let mut link = self.link();
            if link.epoch != epoch {
                return Err(QueueError::Aborted);
            }
            link.cancel = CancellationToken::new();
            link.cancel.clone()
        };

        let mut svc = Service::connect(
            &self.config.host,
            self.config.port,
            self.config.connect_timeout(),
            cancel,
        )
        .await?;

        let tube = &self.config.tube;
        if tube != DEFAULT_TUBE {
            match svc.send(C::Use { tube: tube.clone() }).await? {
                R::Using { .. } => {},
                other => return Err(unexpected("use", &other)),
            }
            match svc.send(C::Watch { tube: tube.clone() }).await? {
                R::Watching { .. } => {},
                other => return Err(unexpected("watch", &other)),
            }
            match svc
                .send(C::Ignore {
                    tube: DEFAULT_TUBE.into(),
                })
                .await?
            {
                R::Watching { .. } | R::NotIgnored => {},
                other => return Err(unexpected("ignore", &other)),
            }
        }

        info!(tube, "connected");
        Ok(svc)
    }

    /// Sends one command, connecting first if there's no connection. Errors
    /// that leave the connection unusable drop it, as does dropping the
    /// returned future before it completes.
    async fn send(&self, request: impl Into<Request>) -> Result<R> {
        let epoch = self.link().epoch;
        let mut slot = self.service.lock().await;
        if self.link().epoch != epoch {
            return Err(QueueError::Aborted);
        }

        let mut svc = match slot.take() {
            Some(svc) => svc,
            None => {
                let svc = self.open_service(epoch).await?;
                self.connected.store(true, Ordering::Release);
                svc
            },
        };

        // The connection stays out of the slot until its reply is read, so
        // an abandoned command takes the connection with it.
        let in_flight = InFlight(Some(&self.connected));
        let result = svc.send(request).await;
        in_flight.finish();

        match result {
            Err(error) if error.is_fatal_to_connection() => {
                warn!(%error, "dropping connection");
                self.connected.store(false, Ordering::Release);
                Err(error)
            },
            result => {
                *slot = Some(svc);
                result
            },
        }
    }

    /// Selects the tube subsequent `put`s go to.
    pub async fn choose(&self, tube: &str) -> Result<bool> {
        match self.send(C::Use { tube: tube_arg(tube)? }).await? {
            R::Using { tube: using } => Ok(using == tube),
            other => Err(unexpected("use", &other)),
        }
    }

    /// Submits a job, returning its ID. `None` if the server refused it.
    pub async fn put(
        &self,
        data: Bytes,
        options: WriteOptions,
    ) -> Result<Option<u64>> {
        let Some(request) =
            Request::put(options.priority, options.delay, options.ttr, data)
        else {
            warn!("job body too large to put");
            return Ok(None);
        };

        match self.send(request).await? {
            R::Inserted { id } => Ok(Some(id)),
            R::BuriedId { id } => {
                warn!(id, "server buried job on insert");
                Ok(Some(id))
            },
            resp @ (R::ExpectedCrlf | R::JobTooBig | R::Draining) => {
                debug!(status = resp.status(), "put refused");
                Ok(None)
            },
            other => Err(unexpected("put", &other)),
        }
    }

    /// Reserves a job from the watched tubes, waiting up to `timeout` seconds
    /// or forever.
    pub async fn reserve(&self, timeout: Option<u32>) -> Result<Option<Job>> {
        let cmd = match timeout {
            Some(timeout) => C::ReserveWithTimeout { timeout },
            None => C::Reserve,
        };
        let name = cmd.name();

        match self.send(cmd).await? {
            R::Reserved { id, data } => Ok(Some(Job { id, data })),
            R::TimedOut | R::DeadlineSoon => Ok(None),
            other => Err(unexpected(name, &other)),
        }
    }

    /// Reserves a specific job if it isn't already reserved.
    pub async fn reserve_job(&self, id: u64) -> Result<Option<Job>> {
        match self.send(C::ReserveJob { id }).await? {
            R::Reserved { id, data } => Ok(Some(Job { id, data })),
            R::NotFound => Ok(None),
            other => Err(unexpected("reserve-job", &other)),
        }
    }

    pub async fn delete(&self, id: u64) -> Result<bool> {
        match self.send(C::Delete { id }).await? {
            R::Deleted => Ok(true),
            R::NotFound => Ok(false),
            other => Err(unexpected("delete", &other)),
        }
    }

    /// Returns a reserved job to the ready queue, or to the delayed queue if
    /// `delay` is non-zero.
    pub async fn release(&self, id: u64, pri: u32, delay: u32) -> Result<bool> {
        match self.send(C::Release { id, pri, delay }).await? {
            R::Released => Ok(true),
            R::Buried => {
                warn!(id, "server buried job on release");
                Ok(true)
            },
            R::NotFound => Ok(false),
            other => Err(unexpected("release", &other)),
        }
    }

    /// Moves a reserved job aside until it's kicked.
    pub async fn bury(&self, id: u64, pri: u32) -> Result<bool> {
        match self.send(C::Bury { id, pri }).await? {
            R::Buried => Ok(true),
            R::NotFound => Ok(false),
            other => Err(unexpected("bury", &other)),
        }
    }

    /// Restarts the TTR countdown of a reserved job.
    pub async fn touch(&self, id: u64) -> Result<bool> {
        match self.send(C::Touch { id }).await? {
            R::Touched => Ok(true),
            R::NotFound => Ok(false),
            other => Err(unexpected("touch", &other)),
        }
    }

    /// Adds a tube to the watch list, returning how many tubes are watched.
    pub async fn watch(&self, tube: &str) -> Result<Option<u32>> {
        match self.send(C::Watch { tube: tube_arg(tube)? }).await? {
            R::Watching { count } => Ok(Some(count)),
            other => Err(unexpected("watch", &other)),
        }
    }

    /// Removes a tube from the watch list. `None` if it was the last one.
    pub async fn ignore(&self, tube: &str) -> Result<Option<u32>> {
        match self.send(C::Ignore { tube: tube_arg(tube)? }).await? {
            R::Watching { count } => Ok(Some(count)),
            R::NotIgnored => Ok(None),
            other => Err(unexpected("ignore", &other)),
        }
    }

    async fn peek_with(&self, cmd: C) -> Result<Option<Job>> {
        let name = cmd.name();
        match self.send(cmd).await? {
            R::Found { id, data } => Ok(Some(Job { id, data })),
            R::NotFound => Ok(None),
            other => Err(unexpected(name, &other)),
        }
    }

    pub async fn peek(&self, id: u64) -> Result<Option<Job>> {
        self.peek_with(C::Peek { id }).await
    }

    pub async fn peek_ready(&self) -> Result<Option<Job>> {
        self.peek_with(C::PeekReady).await
    }

    pub async fn peek_delayed(&self) -> Result<Option<Job>> {
        self.peek_with(C::PeekDelayed).await
    }

    pub async fn peek_buried(&self) -> Result<Option<Job>> {
        self.peek_with(C::PeekBuried).await
    }

    /// Peeks at the next job of `kind`, first selecting `tube` if given.
    pub async fn next(
        &self,
        kind: PeekKind,
        tube: Option<&str>,
    ) -> Result<Option<Job>> {
        if let Some(tube) = tube {
            if !self.choose(tube).await? {
                return Ok(None);
            }
        }

        match kind {
            PeekKind::Ready => self.peek_ready().await,
            PeekKind::Delayed => self.peek_delayed().await,
            PeekKind::Buried => self.peek_buried().await,
        }
    }

    /// Moves up to `bound` buried jobs (or, if there are none, delayed jobs)
    /// on the used tube to ready. Uses the configured kick bound if `bound`
    /// is `None`. Returns how many were kicked.
    pub async fn kick(&self, bound: Option<u64>) -> Result<u64> {
        let bound = bound.unwrap_or(self.config.kick_bound);
        match self.send(C::Kick { bound }).await? {
            R::KickedCount { count } => Ok(count),
            other => Err(unexpected("kick", &other)),
        }
    }

    /// Moves one buried or delayed job to ready.
    pub async fn kick_job(&self, id: u64) -> Result<bool> {
        match self.send(C::KickJob { id }).await? {
            R::Kicked => Ok(true),
            R::NotFound => Ok(false),
            other => Err(unexpected("kick-job", &other)),
        }
    }

    /// Asks the server to close the connection, then drops it. Unlike
    /// `disconnect`, waits for any command in flight to finish.
    pub async fn quit(&self) -> Result<()> {
        let mut slot = self.service.lock().await;
        self.connected.store(false, Ordering::Release);
        match slot.take() {
            Some(svc) => svc.quit().await,
            None => Ok(()),
        }
    }

    /// Stops jobs on `tube` from being reserved for `delay` seconds.
    pub async fn pause_tube(&self, tube: &str, delay: u32) -> Result<bool> {
        let cmd = C::PauseTube {
            tube: tube_arg(tube)?,
            delay,
        };
        match self.send(cmd).await? {
            R::Paused => Ok(true),
            R::NotFound => Ok(false),
            other => Err(unexpected("pause-tube", &other)),
        }
    }

    async fn yaml_body<T: DeserializeOwned>(
        &self,
        cmd: C,
    ) -> Result<Option<T>> {
        let name = cmd.name();
        match self.send(cmd).await? {
            R::Ok { data } => Ok(Some(serde_yaml::from_slice(&data)?)),
            R::NotFound => Ok(None),
            other => Err(unexpected(name, &other)),
        }
    }

    pub async fn stats(&self) -> Result<ServerStats> {
        self.yaml_body(C::StatsServer)
            .await?
            .ok_or_else(|| unexpected("stats", &R::NotFound))
    }

    /// Stats of `tube`, or of the tube in use if `None`.
    pub async fn stats_tube(
        &self,
        tube: Option<&str>,
    ) -> Result<Option<TubeStats>> {
        let tube = match tube {
            Some(tube) => tube_arg(tube)?,
            None => self.list_tube_used().await?,
        };
        self.yaml_body(C::StatsTube { tube }).await
    }

    pub async fn stats_job(&self, id: u64) -> Result<Option<JobStats>> {
        self.yaml_body(C::StatsJob { id }).await
    }

    pub async fn list_tubes(&self) -> Result<Vec<String>> {
        Ok(self.yaml_body(C::ListTubes).await?.unwrap_or_default())
    }

    pub async fn list_tubes_watched(&self) -> Result<Vec<String>> {
        Ok(self.yaml_body(C::ListTubesWatched).await?.unwrap_or_default())
    }

    pub async fn list_tube_used(&self) -> Result<String> {
        match self.send(C::ListTubeUsed).await? {
            R::Using { tube } => Ok(tube),
            other => Err(unexpected("list-tube-used", &other)),
        }
    }
}

#[async_trait]
impl Queue for Beanstalk {
    async fn connect(&self) -> Result<bool> {
        let epoch = self.sever();
        let mut slot = self.service.lock().await;
        *slot = None;
        self.connected.store(false, Ordering::Release);

        let svc = self.open_service(epoch).await?;
        *slot = Some(svc);
        self.connected.store(true, Ordering::Release);
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool> {
        // Sever before taking the lock, so a blocking reserve releases it.
        self.sever();
        let mut slot = self.service.lock().await;

        if slot.take().is_some() {
            debug!("dropped connection");
        }
        self.connected.store(false, Ordering::Release);
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn write(&self, data: Bytes, options: WriteOptions) -> Result<bool> {
        let inserted = self.put(data, options).await?.is_some();
        if !self.config.persistent {
            self.disconnect().await?;
        }
        Ok(inserted)
    }

    async fn read(&self, options: ReadOptions) -> Result<Option<Message>> {
        let Some(job) = self.reserve(options.timeout).await? else {
            return Ok(None);
        };

        let (priority, redelivery) = if self.config.inspect_reserved {
            match self.stats_job(job.id).await? {
                Some(stats) => (stats.pri, stats.reserves > 1),
                None => (0, false),
            }
        } else {
            (0, false)
        };

        let queue: Weak<dyn Queue> = self.me.clone();
        let message =
            Message::bound(job.id, job.data, priority, redelivery, queue);
        Ok(Some(message.with_format(self.config.format)))
    }

    async fn confirm(&self, message: &Message) -> Result<bool> {
        self.delete(message.id()).await
    }

    async fn requeue(
        &self,
        message: &Message,
        options: RequeueOptions,
    ) -> Result<bool> {
        self.release(message.id(), options.priority, options.delay)
            .await
    }

    async fn add(&self, task: &str, options: AddOptions) -> Result<bool> {
        if let Some(tube) = &options.tube {
            if !self.choose(tube).await? {
                return Ok(false);
            }
        }
        self.write(options.body(task), options.write).await
    }

    async fn run(&self, options: RunOptions) -> Result<Option<Bytes>> {
        if let Some(tube) = &options.tube {
            self.watch(tube).await?;
        }
        run_once(self, options.timeout).await
    }

    async fn reset(&self, options: ResetOptions) -> Result<u64> {
        if let Some(tube) = &options.tube {
            self.watch(tube).await?;
        }
        drain(self, options.timeout).await
    }

    fn format(&self) -> Format {
        self.config.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Accepts connections and never replies on them.
    async fn silent_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = vec![];
            while let Ok((conn, _)) = listener.accept().await {
                held.push(conn);
            }
        });
        port
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let config = BeanstalkConfig {
            port: unused_port().await,
            ..Default::default()
        };

        let err = Beanstalk::open(config.clone()).await.err().unwrap();
        assert!(matches!(err, QueueError::Connection(_)));

        // Without auto-connect, construction succeeds and the failure shows
        // up on first use.
        let queue = Beanstalk::open(BeanstalkConfig {
            auto_connect: false,
            ..config
        })
        .await
        .unwrap();
        assert!(!queue.is_connected());
        let data = Bytes::from_static(b"x");
        assert!(queue.write(data, WriteOptions::default()).await.is_err());
        assert!(!queue.is_connected());
    }

    #[tokio::test]
    async fn test_rejects_bad_tube_names_locally() {
        let queue = Beanstalk::new(BeanstalkConfig {
            port: unused_port().await,
            ..Default::default()
        });

        assert!(matches!(
            queue.choose("two words").await,
            Err(QueueError::InvalidTube(_))
        ));
        assert!(matches!(
            queue.watch("").await,
            Err(QueueError::InvalidTube(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_aborts_waiting_commands() {
        let queue = Beanstalk::new(BeanstalkConfig {
            port: silent_server().await,
            tube: "work".into(),
            ..Default::default()
        });

        // The first read blocks setting up its tube; the second waits behind
        // it for the connection.
        let mut readers = vec![];
        for _ in 0..2 {
            let queue = queue.clone();
            readers.push(tokio::spawn(async move {
                queue.read(ReadOptions::default()).await
            }));
            sleep(Duration::from_millis(50)).await;
        }

        let disconnect = timeout(Duration::from_secs(2), queue.disconnect());
        assert!(disconnect.await.unwrap().unwrap());
        for reader in readers {
            let read = reader.await.unwrap();
            assert!(matches!(read, Err(QueueError::Aborted)));
        }
        assert!(!queue.is_connected());
    }
}
