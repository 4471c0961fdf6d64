//! implements a parser for the status lines a beanstalkd server sends.
use std::fmt;

use bytes::Bytes;

use crate::types::protocol::BeanstalkResponse;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownStatus,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownStatus => "unknown status",
        })
    }
}

impl std::error::Error for ParsingError {}

/// Tube names are 1 to 200 bytes drawn from a restricted alphabet, and may
/// not begin with a hyphen.
pub fn is_valid_tube_name(name: &[u8]) -> bool {
    fn char_is_name_safe(c: u8, is_first: bool) -> bool {
        match c {
            b'a'..=b'z' => true,
            b'A'..=b'Z' => true,
            b'0'..=b'9' => true,
            b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
            b'-' => !is_first, // - is only name safe outside first position
            _ => false,
        }
    }

    !name.is_empty()
        && name.len() <= 200
        && name
            .iter()
            .enumerate()
            .all(|(i, c)| char_is_name_safe(*c, i == 0))
}

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl<'a> ParseState<'a> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.is_done() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    fn is_done(&self) -> bool {
        self.from.is_empty()
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&'a [u8], ParsingError> {
        let token = self.next_token().ok_or(ParsingError::BadFormat)?;

        if token.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(token)
        }
    }

    /// Consumes from the input, expecting a space then a u32.
    fn expect_next_u32(&mut self) -> Result<u32, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        let mut r = 0u32;
        for v in token {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .ok_or(ParsingError::BadFormat)?
                        .checked_add((*v - b'0') as u32)
                        .ok_or(ParsingError::BadFormat)?
                },
                _ => return Err(ParsingError::BadFormat),
            };
        }

        Ok(r)
    }

    /// Consumes from the input, expecting a space then a u64.
    fn expect_next_u64(&mut self) -> Result<u64, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        let mut r = 0u64;
        for v in token {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .ok_or(ParsingError::BadFormat)?
                        .checked_add((*v - b'0') as u64)
                        .ok_or(ParsingError::BadFormat)?
                },
                _ => return Err(ParsingError::BadFormat),
            };
        }

        Ok(r)
    }

    /// Consumes from the input, expecting a space then a tube name.
    fn expect_next_name(&mut self) -> Result<String, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        if !is_valid_tube_name(token) {
            return Err(ParsingError::BadFormat);
        }

        // The name alphabet is pure ASCII, so this can't fail.
        String::from_utf8(token.to_vec()).map_err(|_| ParsingError::BadFormat)
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from this ParseState until reaching a space byte or the end of
    /// the input. It returns None at the end of the input. On consecutive space
    /// bytes, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&'a [u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let from = self.from;
        let token = &from[..idx];
        self.from = &from[idx..];

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

/// The outcome of parsing a status line: either a response that is complete
/// as it stands, or one that announces a body still to be read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Status {
    Complete(BeanstalkResponse),
    Body(PendingBody),
}

/// A status line that declared `n_bytes` of data following it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PendingBody {
    kind: BodyKind,
    n_bytes: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BodyKind {
    Reserved { id: u64 },
    Found { id: u64 },
    Ok,
}

impl PendingBody {
    /// Number of data bytes to read, excluding the trailing CRLF.
    pub fn n_bytes(&self) -> usize {
        self.n_bytes as usize
    }

    /// Attaches the body, which the caller has read off the wire.
    pub fn complete(self, data: Bytes) -> BeanstalkResponse {
        match self.kind {
            BodyKind::Reserved { id } => {
                BeanstalkResponse::Reserved { id, data }
            },
            BodyKind::Found { id } => BeanstalkResponse::Found { id, data },
            BodyKind::Ok => BeanstalkResponse::Ok { data },
        }
    }
}

// Status lines are tokenised, then dispatched on the keyword alone. Keywords
// shared between commands (BURIED, KICKED) are told apart by their arity.
impl TryFrom<&[u8]> for Status {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use BeanstalkResponse::*;

        let mut ps: ParseState = value.into();

        let keyword = ps.expect_next_token()?;
        let resp = match keyword {
            // <status>
            b"OUT_OF_MEMORY" => OutOfMemory,
            b"INTERNAL_ERROR" => InternalError,
            b"BAD_FORMAT" => BadFormat,
            b"UNKNOWN_COMMAND" => UnknownCommand,
            b"EXPECTED_CRLF" => ExpectedCrlf,
            b"JOB_TOO_BIG" => JobTooBig,
            b"DRAINING" => Draining,
            b"DEADLINE_SOON" => DeadlineSoon,
            b"TIMED_OUT" => TimedOut,
            b"NOT_FOUND" => NotFound,
            b"DELETED" => Deleted,
            b"RELEASED" => Released,
            b"TOUCHED" => Touched,
            b"NOT_IGNORED" => NotIgnored,
            b"PAUSED" => Paused,

            // <status> [<id>]
            b"BURIED" if ps.is_done() => Buried,
            b"BURIED" => BuriedId {
                id: ps.expect_next_u64()?,
            },
            // <status> [<count>]
            b"KICKED" if ps.is_done() => Kicked,
            b"KICKED" => KickedCount {
                count: ps.expect_next_u64()?,
            },

            // <status> <id>
            b"INSERTED" => Inserted {
                id: ps.expect_next_u64()?,
            },
            // <status> <count>
            b"WATCHING" => Watching {
                count: ps.expect_next_u32()?,
            },
            // <status> <tube>
            b"USING" => Using {
                tube: ps.expect_next_name()?,
            },

            // <status> <id> <bytes>, then data
            b"RESERVED" | b"FOUND" => {
                let id = ps.expect_next_u64()?;
                let n_bytes = ps.expect_next_u32()?;
                let kind = if keyword == b"RESERVED" {
                    BodyKind::Reserved { id }
                } else {
                    BodyKind::Found { id }
                };
                return ps.expect_done_and(Status::Body(PendingBody {
                    kind,
                    n_bytes,
                }));
            },
            // <status> <bytes>, then data
            b"OK" => {
                let n_bytes = ps.expect_next_u32()?;
                return ps.expect_done_and(Status::Body(PendingBody {
                    kind: BodyKind::Ok,
                    n_bytes,
                }));
            },

            _ => return Err(ParsingError::UnknownStatus),
        };

        ps.expect_done_and(Status::Complete(resp))
    }
}
