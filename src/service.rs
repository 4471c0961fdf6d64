//! Strictly sequential request/response exchange over one connection.
use std::time::Duration;

use tokio::io::{
    self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::select;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{QueueError, Result};
use crate::line_reader::LineReader;
use crate::parser::Status;
use crate::types::protocol::{BeanstalkCommand, BeanstalkResponse, Request};
use crate::types::serialisable::BeanstalkSerialisable;
use crate::util::bytes_to_human_str;

/// Owns one connection to a beanstalkd server and exchanges exactly one
/// response per request. Correct framing relies on every response (and its
/// body) being consumed before the next request is written, so `send` takes
/// `&mut self` and requests are never pipelined.
pub struct Service<S: AsyncRead + AsyncWrite> {
    reader: LineReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    /// Fired to abandon whatever command is in flight.
    cancel: CancellationToken,
}

impl Service<TcpStream> {
    /// Opens a TCP connection to `host:port`, giving up after `limit`.
    pub async fn connect(
        host: &str,
        port: u16,
        limit: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let conn = match timeout(limit, TcpStream::connect((host, port))).await
        {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {host}:{port} timed out"),
                )
                .into())
            },
        };

        conn.set_nodelay(true)?;
        debug!(peer = %conn.peer_addr()?, "connected");

        Ok(Self::new(conn, cancel))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Service<S> {
    pub fn new(stream: S, cancel: CancellationToken) -> Self {
        let (r, w) = io::split(stream);
        Self {
            reader: r.into(),
            writer: w,
            cancel,
        }
    }

    /// Writes `request`, then reads one status line and any body it
    /// announces.
    ///
    /// Any error returned here leaves the connection in an unknown state when
    /// [`QueueError::is_fatal_to_connection`] says so, and the service should
    /// then be dropped.
    pub async fn send(
        &mut self,
        request: impl Into<Request>,
    ) -> Result<BeanstalkResponse> {
        let request = request.into();
        let cancel = self.cancel.clone();

        select! {
            biased;
            _ = cancel.cancelled() => Err(QueueError::Aborted),
            resp = self.round_trip(&request) => resp,
        }
    }

    async fn round_trip(
        &mut self,
        request: &Request,
    ) -> Result<BeanstalkResponse> {
        let line = request.command().serialise_beanstalk();
        trace!(command = bytes_to_human_str(&line), "sending");

        self.writer.write_all(&request.serialise_beanstalk()).await?;
        self.writer.flush().await?;

        let status = match self.reader.read_line().await? {
            Some(line) => line,
            None => return Err(QueueError::ConnectionClosed),
        };
        trace!(status = bytes_to_human_str(&status), "received");

        let resp = match Status::try_from(&status[..])? {
            Status::Complete(resp) => resp,
            Status::Body(pending) => {
                let body = self.reader.read_chunk(pending.n_bytes()).await?;
                pending.complete(body)
            },
        };

        Ok(resp)
    }

    /// Asks the server to close the connection, then shuts down our side.
    pub async fn quit(mut self) -> Result<()> {
        let request: Request = BeanstalkCommand::Quit.into();
        self.writer.write_all(&request.serialise_beanstalk()).await?;
        self.writer.shutdown().await?;
        debug!("closed connection");
        Ok(())
    }
}
