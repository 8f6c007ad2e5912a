//! Error types returned by the client and the session lock.

use std::io;
use thiserror::Error;

/// Error returned by most functions.
#[derive(Debug, Error)]
pub enum Error {
    /// No host in the pool could be bound, or the server rejected `AUTH`/`SELECT`.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Transport failure. Timeouts are reported with `ErrorKind::TimedOut`.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The server sent something that is not a valid frame, or a write could not complete.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error line, e.g. `-ERR bad`.
    #[error("{kind} {message}")]
    Command { kind: String, message: String },

    /// `EXEC` was refused locally because a queued command failed.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Failures of the distributed session lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder kept the lock for the whole attempt budget.
    #[error("unable to acquire lock `{key}` after {attempts} attempts")]
    Contended { key: String, attempts: u32 },

    /// The lock key exists without a TTL and would never expire on its own.
    #[error("lock `{key}` exists without a ttl")]
    Orphaned { key: String },

    #[error("no lock is currently held")]
    NotHeld,

    #[error("unable to release lock `{key}`")]
    Release { key: String },
}

impl Error {
    /// Builds a command error from a raw error line such as `ERR unknown command`.
    ///
    /// The first word is the error kind, the remainder the message.
    pub(crate) fn command(line: &str) -> Error {
        let (kind, message) = match line.split_once(' ') {
            Some((kind, message)) => (kind, message),
            None => (line, ""),
        };

        Error::Command {
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }

    /// Returns `true` for connect, I/O and protocol errors.
    ///
    /// When these come out of the framing layer the client has already dropped its connection.
    /// A typed wrapper that receives a well-framed reply of the wrong shape also reports
    /// `Protocol`, but the connection stays usable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol(_) | Error::Connect(_))
    }

    /// Returns the server message for command errors.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Error::Command { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl From<crate::frame::Error> for Error {
    fn from(src: crate::frame::Error) -> Error {
        Error::Protocol(src.to_string())
    }
}
