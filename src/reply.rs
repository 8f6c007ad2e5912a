//! Typed interpretation of reply frames.

use crate::{Error, Frame};

use bytes::Bytes;

/// A reply as seen by callers of [`Client::execute`](crate::Client::execute).
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK` and `+QUEUED` are `Bool(true)`. An empty error line is `Bool(false)`.
    Bool(bool),
    Status(String),
    Integer(i64),
    Bulk(Bytes),
    Nil,
    Array(Vec<Reply>),
    /// An error line nested inside an array, e.g. one failed command of an `EXEC`.
    Error(String),
}

impl Reply {
    /// Converts a top-level frame.
    ///
    /// Error lines become [`Error::Command`], except an empty error line which is reported as
    /// `Bool(false)`.
    pub fn from_frame(frame: Frame) -> crate::Result<Reply> {
        match frame {
            Frame::Error(line) if line.is_empty() => Ok(Reply::Bool(false)),
            Frame::Error(line) => Err(Error::command(&line)),
            frame => Ok(Reply::from_nested(frame)),
        }
    }

    fn from_nested(frame: Frame) -> Reply {
        match frame {
            Frame::Simple(status) if status == "OK" || status == "QUEUED" => Reply::Bool(true),
            Frame::Simple(status) => Reply::Status(status),
            Frame::Error(line) => Reply::Error(line),
            Frame::Integer(int) => Reply::Integer(int),
            Frame::RawInteger(raw) => Reply::Status(raw),
            Frame::Bulk(data) => Reply::Bulk(data),
            Frame::Null | Frame::NullArray => Reply::Nil,
            Frame::Array(parts) => Reply::Array(parts.into_iter().map(Reply::from_nested).collect()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Bool(true))
    }

    /// Returns `true` for the values that mark a failed command.
    pub fn is_failure(&self) -> bool {
        matches!(self, Reply::Bool(false) | Reply::Error(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(int) => Some(*int),
            Reply::Bulk(data) => std::str::from_utf8(data).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Returns the payload of bulk and status replies.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Reply::Bulk(data) => Some(data),
            Reply::Status(status) => Some(Bytes::from(status)),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(parts) => Some(parts),
            Reply::Nil => Some(vec![]),
            _ => None,
        }
    }

    pub(crate) fn unexpected(&self, verb: &str) -> Error {
        Error::Protocol(format!("unexpected reply to {}: {:?}", verb, self))
    }
}
