use bytes::Bytes;

use super::serialisable::BeanstalkSerialisable;

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkCommand {
    /// Places a job onto the currently `use`d tube. The command line is
    /// followed by `n_bytes` of job data and a CRLF; see [`Request::put`].
    ///
    /// On the wire: `put <pri> <delay> <ttr> <bytes>`
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// Awaits a job from all the `watch`ed tubes, blocking until one appears
    /// (or until the server shuts down).
    ///
    /// On the wire: `reserve`
    Reserve,
    /// As `reserve`, but after `timeout` seconds pass, a `TIMED_OUT` response
    /// is sent instead. A zero timeout returns immediately.
    ///
    /// On the wire: `reserve-with-timeout <seconds>`
    ReserveWithTimeout { timeout: u32 },
    /// Reserves a job with a given ID if it exists and is not already reserved,
    /// otherwise returning `NOT_FOUND`.
    ///
    /// On the wire: `reserve-job <id>`
    ReserveJob { id: u64 },
    /// Releases a job reserved by the same client, returning it to the ready
    /// or delayed states. Returns `RELEASED` or `NOT_FOUND` in most cases, but
    /// can also return `BURIED` if the server was unable to grow its priority
    /// queue.
    ///
    /// On the wire: `release <id> <pri> <delay>`
    Release { id: u64, pri: u32, delay: u32 },
    /// Deletes a job reserved by the same client, or in the ready, buried, or
    /// delayed states. Returns `DELETED` or `NOT_FOUND`.
    ///
    /// On the wire: `delete <id>`
    Delete { id: u64 },
    /// Buries a job reserved by the same client. Returns `BURIED` or
    /// `NOT_FOUND`.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: u64, pri: u32 },
    /// Refreshes the Time To Run (TTR) of a job reserved by the same client.
    /// Returns `TOUCHED` or `NOT_FOUND`.
    ///
    /// On the wire: `touch <id>`
    Touch { id: u64 },
    /// Adds a tube to the watchlist for this client. Always replies with
    /// `WATCHING <number of watched tubes>`.
    ///
    /// On the wire: `watch <tube>`
    Watch { tube: String },
    /// Reverses the effect of `watch` on this client. Returns `WATCHING <n>` or
    /// `NOT_IGNORED` if this would remove the last tube in the watchlist.
    ///
    /// On the wire: `ignore <tube>`
    Ignore { tube: String },
    /// Returns the data for the job with this ID, regardless of its state.
    /// Response is either `FOUND <id> <bytes>` or `NOT_FOUND`, in common with
    /// all requests in the `peek` family.
    ///
    /// On the wire: `peek <id>`
    Peek { id: u64 },
    /// Returns the data for the next ready job on the currently-used tube.
    ///
    /// On the wire: `peek-ready`
    PeekReady,
    /// Returns the data for the next delayed job that will become ready on the
    /// currently-used tube.
    ///
    /// On the wire: `peek-delayed`
    PeekDelayed,
    /// Returns the data for the oldest buried job on the currently-used tube.
    ///
    /// On the wire: `peek-buried`
    PeekBuried,
    /// Promotes up to `bound` jobs on the currently-used tube from buried to
    /// the ready states, returning `KICKED <count>` with the actual number of
    /// jobs kicked. If no buried jobs exist, it promotes delayed jobs instead.
    ///
    /// On the wire: `kick <bound>`
    Kick { bound: u64 },
    /// Promotes a single job from buried or delayed to ready by its ID.
    /// Returns `KICKED` if successful, otherwise `NOT_FOUND`.
    ///
    /// On the wire: `kick-job <id>`
    KickJob { id: u64 },
    /// Statistics about one job: tube, state, priority, timings and the
    /// number of state transitions it's undergone. Replies `OK <n_bytes>`
    /// with a YAML dictionary.
    ///
    /// On the wire: `stats-job <id>`
    StatsJob { id: u64 },
    /// Statistics about one tube: job counts by state, connected clients and
    /// pause status.
    ///
    /// On the wire: `stats-tube <tube>`
    StatsTube { tube: String },
    /// Statistics about the server as a whole.
    ///
    /// On the wire: `stats`
    StatsServer,
    /// Lists existing tubes as a YAML list in an `OK <n_bytes>` body.
    ///
    /// On the wire: `list-tubes`
    ListTubes,
    /// Returns the tube this client is currently using as `USING <tube>`.
    ///
    /// On the wire: `list-tube-used`
    ListTubeUsed,
    /// Lists the tubes this client is currently watching.
    ///
    /// On the wire: `list-tubes-watched`
    ListTubesWatched,
    /// Requests that the server close this connection. No reply is sent.
    ///
    /// On the wire: `quit`
    Quit,
    /// Pause a tube for a given period, preventing new jobs being reserved for
    /// `delay` seconds. Returns `PAUSED` or `NOT_FOUND`.
    ///
    /// On the wire: `pause-tube <tube> <delay>`
    PauseTube { tube: String, delay: u32 },
    /// Selects the tube subsequent `put`s go to. Replies `USING <tube>`.
    ///
    /// On the wire: `use <tube>`
    Use { tube: String },
}

impl BeanstalkCommand {
    /// The command keyword as it appears first on the wire.
    pub fn name(&self) -> &'static str {
        use BeanstalkCommand::*;

        match self {
            Put { .. } => "put",
            Reserve => "reserve",
            ReserveWithTimeout { .. } => "reserve-with-timeout",
            ReserveJob { .. } => "reserve-job",
            Release { .. } => "release",
            Delete { .. } => "delete",
            Bury { .. } => "bury",
            Touch { .. } => "touch",
            Watch { .. } => "watch",
            Ignore { .. } => "ignore",
            Peek { .. } => "peek",
            PeekReady => "peek-ready",
            PeekDelayed => "peek-delayed",
            PeekBuried => "peek-buried",
            Kick { .. } => "kick",
            KickJob { .. } => "kick-job",
            StatsJob { .. } => "stats-job",
            StatsTube { .. } => "stats-tube",
            StatsServer => "stats",
            ListTubes => "list-tubes",
            ListTubeUsed => "list-tube-used",
            ListTubesWatched => "list-tubes-watched",
            Quit => "quit",
            PauseTube { .. } => "pause-tube",
            Use { .. } => "use",
        }
    }
}

impl BeanstalkSerialisable for BeanstalkCommand {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use BeanstalkCommand::*;

        let name = self.name();
        match self {
            Reserve | PeekReady | PeekDelayed | PeekBuried | StatsServer
            | ListTubes | ListTubeUsed | ListTubesWatched | Quit => {
                format!("{name}\r\n").into()
            },
            ReserveJob { id }
            | Delete { id }
            | Touch { id }
            | Peek { id }
            | KickJob { id }
            | StatsJob { id } => format!("{name} {id}\r\n").into(),
            Kick { bound } => format!("{name} {bound}\r\n").into(),
            ReserveWithTimeout { timeout } => {
                format!("{name} {timeout}\r\n").into()
            },
            Watch { tube }
            | Ignore { tube }
            | StatsTube { tube }
            | Use { tube } => format!("{name} {tube}\r\n").into(),
            Bury { id, pri } => format!("{name} {id} {pri}\r\n").into(),
            PauseTube { tube, delay } => {
                format!("{name} {tube} {delay}\r\n").into()
            },
            Release { id, pri, delay } => {
                format!("{name} {id} {pri} {delay}\r\n").into()
            },
            Put {
                pri,
                delay,
                ttr,
                n_bytes,
            } => format!("{name} {pri} {delay} {ttr} {n_bytes}\r\n").into(),
        }
    }
}

/// One outbound request: a command line plus, for `put`, the job body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    command: BeanstalkCommand,
    body: Option<Bytes>,
}

impl Request {
    /// Builds a two-frame `put` request. Returns `None` if the body is too
    /// long to be described by the protocol's 32-bit length field.
    pub fn put(pri: u32, delay: u32, ttr: u32, data: Bytes) -> Option<Self> {
        let n_bytes = u32::try_from(data.len()).ok()?;
        Some(Self {
            command: BeanstalkCommand::Put {
                pri,
                delay,
                ttr,
                n_bytes,
            },
            body: Some(data),
        })
    }

    pub fn command(&self) -> &BeanstalkCommand {
        &self.command
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}

impl From<BeanstalkCommand> for Request {
    fn from(command: BeanstalkCommand) -> Self {
        Self {
            command,
            body: None,
        }
    }
}

impl BeanstalkSerialisable for Request {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        let line = self.command.serialise_beanstalk();
        match &self.body {
            Some(body) => [line, body.to_vec(), b"\r\n".to_vec()].concat(),
            None => line,
        }
    }
}

/// All possible response types to a `BeanstalkCommand`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkResponse {
    /// Indicates the server cannot handle a job due to memory pressure. Can be
    /// sent in response to any command.
    ///
    /// On the wire: `OUT_OF_MEMORY`.
    OutOfMemory,
    /// Indicates a server bug. Can be sent in response to any command.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// The client sent a bad request, typically because:
    ///
    /// * The request exceeded 224 bytes, including trailing CRLF.
    /// * A tube name exceeded 200 bytes or was invalid.
    /// * A non-number was provided where a number was expected, or the number
    ///   was out of range.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// The client sent a bad request with an unrecognised command.
    ///
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// In response to a `put`, indicates a job was created with the given ID.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: u64 },
    /// In response to a `put`, indicates the job couldn't be handled due to
    /// memory pressure and so was immediately buried.
    ///
    /// On the wire: `BURIED <id>`.
    BuriedId { id: u64 },
    /// In response to a `put`, indicates the job data was not terminated by a
    /// CRLF sequence.
    ///
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCrlf,
    /// In response to a `put`, indicates the job body was larger than what the
    /// server is configured to accept.
    ///
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// In response to a `put`, indicates the server is not currently accepting
    /// jobs.
    ///
    /// On the wire: `DRAINING`.
    Draining,
    /// In response to a `use` or `list-tube-used`, names the tube in use.
    ///
    /// On the wire: `USING <tube>`.
    Using { tube: String },
    /// In response to a `reserve` or `reserve-with-timeout`, indicates the
    /// client holds a reservation that will exceed its TTR within the next
    /// second.
    ///
    /// On the wire: `DEADLINE_SOON`.
    DeadlineSoon,
    /// In response to a `reserve-with-timeout`, indicates the timeout provided
    /// expired with no job becoming available.
    ///
    /// On the wire: `TIMED_OUT`.
    TimedOut,
    /// In response to a `reserve`, `reserve-with-timeout`, or `reserve-job`,
    /// provides the ID and data of the job that was just reserved.
    ///
    /// On the wire: `RESERVED <id> <n_bytes>` plus data.
    Reserved { id: u64, data: Bytes },
    /// A specific job or tube isn't known to the server, or doesn't satisfy a
    /// precondition of the command (e.g. `release` of a job not reserved by
    /// this client, or `peek-ready` on a tube with no ready jobs).
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// In response to a `delete`, indicates success.
    ///
    /// On the wire: `DELETED`.
    Deleted,
    /// In response to a `release`, indicates success.
    ///
    /// On the wire: `RELEASED`.
    Released,
    /// In response to a `release`, indicates the job couldn't be handled due to
    /// memory pressure and so was immediately buried.
    ///
    /// In response to a `bury`, indicates success.
    ///
    /// On the wire: `BURIED`.
    Buried,
    /// In response to a `touch`, indicates the job's TTR was refreshed.
    ///
    /// On the wire: `TOUCHED`.
    Touched,
    /// In response to a `watch` or `ignore`, indicates success and the number
    /// of tubes currently watched by the client.
    ///
    /// On the wire: `WATCHING <count>`.
    Watching { count: u32 },
    /// In response to an `ignore`, indicates the command failed as it would
    /// leave the client with an empty watchlist.
    ///
    /// On the wire: `NOT_IGNORED`.
    NotIgnored,
    /// In response to a `peek`-family command, indicates success.
    ///
    /// On the wire: `FOUND <id> <n_bytes>` plus data.
    Found { id: u64, data: Bytes },
    /// In response to a `kick`, the number of jobs kicked from the buried xor
    /// delayed states.
    ///
    /// On the wire: `KICKED <count>`.
    KickedCount { count: u64 },
    /// In response to a `kick-job`, indicates success.
    ///
    /// On the wire: `KICKED`.
    Kicked,
    /// In response to the `stats` and `list-tubes` families. The data is a
    /// YAML document; see [`crate::types::stats`].
    ///
    /// On the wire: `OK <n_bytes>` plus data.
    Ok { data: Bytes },
    /// In response to a `pause-tube`, indicates success.
    ///
    /// On the wire: `PAUSED`.
    Paused,
}

impl BeanstalkResponse {
    /// The status keyword leading this response on the wire.
    pub fn status(&self) -> &'static str {
        use BeanstalkResponse::*;

        match self {
            OutOfMemory => "OUT_OF_MEMORY",
            InternalError => "INTERNAL_ERROR",
            BadFormat => "BAD_FORMAT",
            UnknownCommand => "UNKNOWN_COMMAND",
            Inserted { .. } => "INSERTED",
            BuriedId { .. } | Buried => "BURIED",
            ExpectedCrlf => "EXPECTED_CRLF",
            JobTooBig => "JOB_TOO_BIG",
            Draining => "DRAINING",
            Using { .. } => "USING",
            DeadlineSoon => "DEADLINE_SOON",
            TimedOut => "TIMED_OUT",
            Reserved { .. } => "RESERVED",
            NotFound => "NOT_FOUND",
            Deleted => "DELETED",
            Released => "RELEASED",
            Touched => "TOUCHED",
            Watching { .. } => "WATCHING",
            NotIgnored => "NOT_IGNORED",
            Found { .. } => "FOUND",
            KickedCount { .. } | Kicked => "KICKED",
            Ok { .. } => "OK",
            Paused => "PAUSED",
        }
    }
}

impl BeanstalkSerialisable for BeanstalkResponse {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use BeanstalkResponse::*;

        match self {
            OutOfMemory => b"OUT_OF_MEMORY\r\n".to_vec(),
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            BuriedId { id } => format!("BURIED {id}\r\n").into(),
            ExpectedCrlf => b"EXPECTED_CRLF\r\n".to_vec(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            Draining => b"DRAINING\r\n".to_vec(),
            Using { tube } => format!("USING {tube}\r\n").into(),
            DeadlineSoon => b"DEADLINE_SOON\r\n".to_vec(),
            TimedOut => b"TIMED_OUT\r\n".to_vec(),
            Reserved { id, data } => [
                format!("RESERVED {id} {}\r\n", data.len()).into_bytes(),
                data.to_vec(),
                b"\r\n".to_vec(),
            ]
            .concat(),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            Released => b"RELEASED\r\n".to_vec(),
            Watching { count } => format!("WATCHING {count}\r\n").into(),
            NotIgnored => b"NOT_IGNORED\r\n".to_vec(),
            Found { id, data } => [
                format!("FOUND {id} {}\r\n", data.len()).into_bytes(),
                data.to_vec(),
                b"\r\n".to_vec(),
            ]
            .concat(),
            KickedCount { count } => format!("KICKED {count}\r\n").into(),
            Kicked => b"KICKED\r\n".to_vec(),
            Ok { data } => [
                format!("OK {}\r\n", data.len()).into_bytes(),
                data.to_vec(),
                b"\r\n".to_vec(),
            ]
            .concat(),
            Paused => b"PAUSED\r\n".to_vec(),
            Deleted => b"DELETED\r\n".to_vec(),
            Buried => b"BURIED\r\n".to_vec(),
            Touched => b"TOUCHED\r\n".to_vec(),
        }
    }
}
