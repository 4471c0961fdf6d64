//! Error types for queue operations.
//!
//! Only transport, framing and configuration failures are errors. Statuses
//! the protocol defines as clean failures for a command (`NOT_FOUND`,
//! `TIMED_OUT`, `JOB_TOO_BIG`, ...) are reported as `Ok(false)` or
//! `Ok(None)` by the adapters instead.

use thiserror::Error;

use crate::parser::ParsingError;

#[derive(Debug, Error)]
pub enum QueueError {
    /// I/O error while connecting, reading or writing.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The server closed the connection before replying.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// An in-flight command was abandoned because the adapter disconnected.
    #[error("command aborted by disconnect")]
    Aborted,

    /// The server's reply could not be parsed.
    #[error("malformed response: {0}")]
    Parse(#[from] ParsingError),

    /// The server's reply parsed, but isn't one the command allows.
    #[error("unexpected response `{status}` to `{command}`")]
    UnexpectedResponse {
        command: &'static str,
        status: &'static str,
    },

    /// A tube name the protocol can't carry.
    #[error("invalid tube name `{0}`")]
    InvalidTube(String),

    /// An `OK` body didn't hold the YAML document expected.
    #[error("malformed stats body: {0}")]
    Stats(#[from] serde_yaml::Error),

    /// A JSON job body couldn't be encoded or decoded.
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),

    /// A value doesn't fit the adapter's body format.
    #[error("cannot encode body: {0}")]
    Encoding(String),

    /// No configuration is registered under this name.
    #[error("configuration `{0}` has not been defined")]
    Configuration(String),

    /// A configuration is registered but can't be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `confirm` or `requeue` on a message with no live adapter behind it.
    #[error("no queue bound to call `{0}`")]
    UnboundMessage(&'static str),

    /// A registry filter refused the call.
    #[error("call rejected by filter: {0}")]
    Filtered(String),
}

impl QueueError {
    /// Whether this error leaves the connection unusable, either because the
    /// transport failed or because response framing can no longer be trusted.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::ConnectionClosed
                | Self::Aborted
                | Self::Parse(_)
        )
    }
}

/// Result type alias using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;
