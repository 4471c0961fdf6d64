//! A small in-process beanstalkd for driving the client end to end. Replies
//! go out through the crate's response serialiser. Reservations never time
//! out.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::str::{FromStr, Split};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use enchanted_queue::config::BeanstalkConfig;
use enchanted_queue::line_reader::LineReader;
use enchanted_queue::parser::is_valid_tube_name;
use enchanted_queue::types::protocol::{
    BeanstalkCommand as C, BeanstalkResponse as R,
};
use enchanted_queue::types::serialisable::BeanstalkSerialisable;
use enchanted_queue::types::states::JobState;
use enchanted_queue::types::stats::{JobStats, ServerStats, TubeStats};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

pub const MAX_JOB_SIZE: usize = 65535;

struct FakeJob {
    tube: String,
    pri: u32,
    ttr: u32,
    data: Bytes,
    state: JobState,
    created: Instant,
    ready_at: Instant,
    reserved_by: Option<u64>,
    reserves: u64,
    releases: u64,
    buries: u64,
    kicks: u64,
}

struct Conn {
    id: u64,
    used: String,
    watched: Vec<String>,
}

#[derive(Default)]
struct Shared {
    last_id: u64,
    last_conn: u64,
    open_conns: u64,
    jobs: BTreeMap<u64, FakeJob>,
    tubes: BTreeSet<String>,
}

/// Arguments following a command name.
struct Args<'a>(Split<'a, char>);

impl Args<'_> {
    fn num<T: FromStr>(&mut self) -> Result<T, R> {
        self.0
            .next()
            .and_then(|arg| arg.parse().ok())
            .ok_or(R::BadFormat)
    }

    fn tube(&mut self) -> Result<String, R> {
        match self.0.next() {
            Some(tube) if is_valid_tube_name(tube.as_bytes()) => {
                Ok(tube.to_owned())
            },
            _ => Err(R::BadFormat),
        }
    }

    fn done(mut self, cmd: C) -> Result<C, R> {
        match self.0.next() {
            None => Ok(cmd),
            Some(_) => Err(R::BadFormat),
        }
    }
}

/// Reads one command line. An error is the status to reply with.
fn parse_command(line: &[u8]) -> Result<C, R> {
    let line = std::str::from_utf8(line).map_err(|_| R::BadFormat)?;
    let mut words = line.split(' ');
    let name = words.next().unwrap_or_default();
    let mut args = Args(words);

    let cmd = match name {
        "put" => C::Put {
            pri: args.num()?,
            delay: args.num()?,
            ttr: args.num()?,
            n_bytes: args.num()?,
        },
        "use" => C::Use { tube: args.tube()? },
        "reserve" => C::Reserve,
        "reserve-with-timeout" => C::ReserveWithTimeout {
            timeout: args.num()?,
        },
        "reserve-job" => C::ReserveJob { id: args.num()? },
        "delete" => C::Delete { id: args.num()? },
        "release" => C::Release {
            id: args.num()?,
            pri: args.num()?,
            delay: args.num()?,
        },
        "bury" => C::Bury {
            id: args.num()?,
            pri: args.num()?,
        },
        "touch" => C::Touch { id: args.num()? },
        "watch" => C::Watch { tube: args.tube()? },
        "ignore" => C::Ignore { tube: args.tube()? },
        "peek" => C::Peek { id: args.num()? },
        "peek-ready" => C::PeekReady,
        "peek-delayed" => C::PeekDelayed,
        "peek-buried" => C::PeekBuried,
        "kick" => C::Kick { bound: args.num()? },
        "kick-job" => C::KickJob { id: args.num()? },
        "stats" => C::StatsServer,
        "stats-job" => C::StatsJob { id: args.num()? },
        "stats-tube" => C::StatsTube { tube: args.tube()? },
        "list-tubes" => C::ListTubes,
        "list-tube-used" => C::ListTubeUsed,
        "list-tubes-watched" => C::ListTubesWatched,
        "pause-tube" => C::PauseTube {
            tube: args.tube()?,
            delay: args.num()?,
        },
        "quit" => C::Quit,
        _ => return Err(R::UnknownCommand),
    };
    args.done(cmd)
}

fn yaml<T: Serialize>(value: &T) -> R {
    match serde_yaml::to_string(value) {
        Ok(doc) => R::Ok {
            data: format!("---\n{doc}").into(),
        },
        Err(_) => R::InternalError,
    }
}

impl Shared {
    fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
        shared.lock().unwrap()
    }

    fn open_conn(&mut self) -> Conn {
        self.last_conn += 1;
        self.open_conns += 1;
        self.tubes.insert("default".into());
        Conn {
            id: self.last_conn,
            used: "default".into(),
            watched: vec!["default".into()],
        }
    }

    fn close_conn(&mut self, conn: &Conn) {
        self.open_conns -= 1;
        for job in self.jobs.values_mut() {
            if job.reserved_by == Some(conn.id) {
                job.reserved_by = None;
                job.state = JobState::Ready;
            }
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        for job in self.jobs.values_mut() {
            if job.state == JobState::Delayed && job.ready_at <= now {
                job.state = JobState::Ready;
            }
        }
    }

    fn put(
        &mut self,
        conn: &Conn,
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Bytes,
    ) -> R {
        if data.len() > MAX_JOB_SIZE {
            return R::JobTooBig;
        }

        let now = Instant::now();
        self.last_id += 1;
        self.jobs.insert(
            self.last_id,
            FakeJob {
                tube: conn.used.clone(),
                pri,
                ttr: ttr.max(1),
                data,
                state: if delay > 0 {
                    JobState::Delayed
                } else {
                    JobState::Ready
                },
                created: now,
                ready_at: now + Duration::from_secs(delay.into()),
                reserved_by: None,
                reserves: 0,
                releases: 0,
                buries: 0,
                kicks: 0,
            },
        );
        R::Inserted { id: self.last_id }
    }

    fn reserve_id(&mut self, conn: &Conn, id: u64) -> R {
        let Some(job) = self.jobs.get_mut(&id) else {
            return R::NotFound;
        };
        job.state = JobState::Reserved;
        job.reserved_by = Some(conn.id);
        job.reserves += 1;
        R::Reserved {
            id,
            data: job.data.clone(),
        }
    }

    fn try_reserve(&mut self, conn: &Conn) -> Option<R> {
        self.tick();
        let id = self
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.state == JobState::Ready && conn.watched.contains(&job.tube)
            })
            .min_by_key(|(id, job)| (job.pri, **id))
            .map(|(id, _)| *id)?;
        Some(self.reserve_id(conn, id))
    }

    fn reserved_by(&mut self, conn: &Conn, id: u64) -> Option<&mut FakeJob> {
        self.jobs
            .get_mut(&id)
            .filter(|job| job.reserved_by == Some(conn.id))
    }

    fn found(&self, id: Option<u64>) -> R {
        match id.and_then(|id| self.jobs.get(&id).map(|job| (id, job))) {
            Some((id, job)) => R::Found {
                id,
                data: job.data.clone(),
            },
            None => R::NotFound,
        }
    }

    fn in_tube<'a>(
        &'a self,
        tube: &'a str,
        state: JobState,
    ) -> impl Iterator<Item = (u64, &'a FakeJob)> + 'a {
        self.jobs
            .iter()
            .filter(move |(_, job)| job.tube == tube && job.state == state)
            .map(|(id, job)| (*id, job))
    }

    fn count(&self, tube: Option<&str>, state: JobState) -> u64 {
        self.jobs
            .values()
            .filter(|job| tube.map_or(true, |tube| job.tube == tube))
            .filter(|job| job.state == state)
            .count() as u64
    }

    fn handle(&mut self, conn: &mut Conn, cmd: C) -> R {
        self.tick();
        match cmd {
            C::ReserveJob { id } => match self.jobs.get(&id) {
                Some(job) if job.state != JobState::Reserved => {
                    self.reserve_id(conn, id)
                },
                _ => R::NotFound,
            },
            C::Delete { id } => match self.jobs.get(&id) {
                Some(job)
                    if job.state != JobState::Reserved
                        || job.reserved_by == Some(conn.id) =>
                {
                    self.jobs.remove(&id);
                    R::Deleted
                },
                _ => R::NotFound,
            },
            C::Release { id, pri, delay } => match self.reserved_by(conn, id) {
                Some(job) => {
                    job.pri = pri;
                    job.reserved_by = None;
                    job.releases += 1;
                    job.ready_at =
                        Instant::now() + Duration::from_secs(delay.into());
                    job.state = if delay > 0 {
                        JobState::Delayed
                    } else {
                        JobState::Ready
                    };
                    R::Released
                },
                None => R::NotFound,
            },
            C::Bury { id, pri } => match self.reserved_by(conn, id) {
                Some(job) => {
                    job.pri = pri;
                    job.reserved_by = None;
                    job.buries += 1;
                    job.state = JobState::Buried;
                    R::Buried
                },
                None => R::NotFound,
            },
            C::Touch { id } => match self.reserved_by(conn, id) {
                Some(_) => R::Touched,
                None => R::NotFound,
            },
            C::Watch { tube } => {
                self.tubes.insert(tube.clone());
                if !conn.watched.contains(&tube) {
                    conn.watched.push(tube);
                }
                R::Watching {
                    count: conn.watched.len() as u32,
                }
            },
            C::Ignore { tube } => {
                if conn.watched == [tube.clone()] {
                    return R::NotIgnored;
                }
                conn.watched.retain(|t| *t != tube);
                R::Watching {
                    count: conn.watched.len() as u32,
                }
            },
            C::Use { tube } => {
                self.tubes.insert(tube.clone());
                conn.used = tube.clone();
                R::Using { tube }
            },
            C::Peek { id } => self.found(Some(id)),
            C::PeekReady => self.found(
                self.in_tube(&conn.used, JobState::Ready)
                    .min_by_key(|(id, job)| (job.pri, *id))
                    .map(|(id, _)| id),
            ),
            C::PeekDelayed => self.found(
                self.in_tube(&conn.used, JobState::Delayed)
                    .min_by_key(|(id, job)| (job.ready_at, *id))
                    .map(|(id, _)| id),
            ),
            C::PeekBuried => self.found(
                self.in_tube(&conn.used, JobState::Buried)
                    .map(|(id, _)| id)
                    .next(),
            ),
            C::Kick { bound } => {
                let used = Some(conn.used.as_str());
                let from = if self.count(used, JobState::Buried) > 0 {
                    JobState::Buried
                } else {
                    JobState::Delayed
                };
                let ids: Vec<u64> = self
                    .in_tube(&conn.used, from)
                    .map(|(id, _)| id)
                    .take(bound as usize)
                    .collect();
                for id in &ids {
                    if let Some(job) = self.jobs.get_mut(id) {
                        job.state = JobState::Ready;
                        job.kicks += 1;
                    }
                }
                R::KickedCount {
                    count: ids.len() as u64,
                }
            },
            C::KickJob { id } => match self.jobs.get_mut(&id) {
                Some(job)
                    if matches!(
                        job.state,
                        JobState::Buried | JobState::Delayed
                    ) =>
                {
                    job.state = JobState::Ready;
                    job.kicks += 1;
                    R::Kicked
                },
                _ => R::NotFound,
            },
            C::StatsJob { id } => match self.jobs.get(&id) {
                Some(job) => yaml(&JobStats {
                    id,
                    tube: job.tube.clone(),
                    state: job.state,
                    pri: job.pri,
                    age: job.created.elapsed().as_secs(),
                    delay: 0,
                    ttr: job.ttr.into(),
                    time_left: 0,
                    file: 0,
                    reserves: job.reserves,
                    timeouts: 0,
                    releases: job.releases,
                    buries: job.buries,
                    kicks: job.kicks,
                }),
                None => R::NotFound,
            },
            C::StatsTube { tube } => {
                if !self.tubes.contains(&tube) {
                    return R::NotFound;
                }
                let t = Some(tube.as_str());
                yaml(&TubeStats {
                    current_jobs_ready: self.count(t, JobState::Ready),
                    current_jobs_reserved: self.count(t, JobState::Reserved),
                    current_jobs_delayed: self.count(t, JobState::Delayed),
                    current_jobs_buried: self.count(t, JobState::Buried),
                    name: tube,
                    ..Default::default()
                })
            },
            C::StatsServer => yaml(&ServerStats {
                current_jobs_ready: self.count(None, JobState::Ready),
                current_jobs_reserved: self.count(None, JobState::Reserved),
                current_jobs_delayed: self.count(None, JobState::Delayed),
                current_jobs_buried: self.count(None, JobState::Buried),
                total_jobs: self.last_id,
                max_job_size: MAX_JOB_SIZE as u64,
                current_tubes: self.tubes.len() as u64,
                current_connections: self.open_conns,
                total_connections: self.last_conn,
                ..Default::default()
            }),
            C::ListTubes => yaml(&self.tubes),
            C::ListTubeUsed => R::Using {
                tube: conn.used.clone(),
            },
            C::ListTubesWatched => yaml(&conn.watched),
            C::PauseTube { tube, .. } => {
                if self.tubes.contains(&tube) {
                    R::Paused
                } else {
                    R::NotFound
                }
            },
            // Handled by the connection loop.
            C::Put { .. }
            | C::Reserve
            | C::ReserveWithTimeout { .. }
            | C::Quit => R::InternalError,
        }
    }
}

pub struct FakeServer {
    port: u16,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared: Arc<Mutex<Shared>> = Default::default();
        let cancel = CancellationToken::new();

        {
            let shared = shared.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let conn = select! {
                        accept = listener.accept() => accept,
                        _ = cancel.cancelled() => break,
                    };
                    if let Ok((conn, _)) = conn {
                        let shared = shared.clone();
                        tokio::spawn(serve(conn, shared, cancel.clone()));
                    }
                }
            });
        }

        Self {
            port,
            shared,
            cancel,
        }
    }

    pub fn config(&self) -> BeanstalkConfig {
        BeanstalkConfig {
            port: self.port,
            timeout: 5,
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ready_count(&self, tube: &str) -> u64 {
        let mut shared = Shared::lock(&self.shared);
        shared.tick();
        shared.count(Some(tube), JobState::Ready)
    }

    pub fn job_count(&self) -> usize {
        Shared::lock(&self.shared).jobs.len()
    }

    pub fn open_connections(&self) -> u64 {
        Shared::lock(&self.shared).open_conns
    }

    /// Drops every connection and stops accepting new ones.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(
    stream: TcpStream,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
) {
    let mut conn = Shared::lock(&shared).open_conn();
    let (r, mut w) = stream.into_split();
    let mut reader: LineReader<_> = r.into();

    loop {
        let line = select! {
            line = reader.read_line() => line,
            _ = cancel.cancelled() => break,
        };
        let Ok(Some(line)) = line else { break };

        let resp = match parse_command(&line) {
            Err(resp) => resp,
            Ok(C::Quit) => break,
            Ok(C::Put {
                pri,
                delay,
                ttr,
                n_bytes,
            }) => match reader.read_chunk(n_bytes as usize).await {
                Ok(data) => {
                    Shared::lock(&shared).put(&conn, pri, delay, ttr, data)
                },
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    R::ExpectedCrlf
                },
                Err(_) => break,
            },
            Ok(cmd @ (C::Reserve | C::ReserveWithTimeout { .. })) => {
                let deadline = match cmd {
                    C::ReserveWithTimeout { timeout } => Some(
                        Instant::now() + Duration::from_secs(timeout.into()),
                    ),
                    _ => None,
                };
                let reserved =
                    reserve(&mut reader, &shared, &conn, deadline, &cancel);
                match reserved.await {
                    Some(resp) => resp,
                    None => break,
                }
            },
            Ok(cmd) => Shared::lock(&shared).handle(&mut conn, cmd),
        };

        if w.write_all(&resp.serialise_beanstalk()).await.is_err() {
            break;
        }
    }

    Shared::lock(&shared).close_conn(&conn);
}

/// Polls for a job until one is reserved or `deadline` passes. `None` if the
/// client went away meanwhile.
async fn reserve<T: AsyncRead + Unpin>(
    reader: &mut LineReader<T>,
    shared: &Mutex<Shared>,
    conn: &Conn,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Option<R> {
    loop {
        if let Some(resp) = Shared::lock(shared).try_reserve(conn) {
            return Some(resp);
        }
        if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            return Some(R::TimedOut);
        }

        select! {
            _ = sleep(Duration::from_millis(10)) => {},
            // Clients don't send while a reserve is outstanding, so any read
            // result means the connection is gone.
            _ = reader.read_line() => return None,
            _ = cancel.cancelled() => return None,
        }
    }
}
