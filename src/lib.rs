//! A hand-rolled client for a Redis-compatible server and a session lock built on top of it.
//!
//! The [`Client`] speaks the wire protocol directly over TCP or TLS, discovers whether it
//! talks to a master or a replica, and follows the master when a command needs one. The
//! [`SessionStore`] serializes access to session records across processes with an advisory
//! lock key kept on the server.

pub mod client;
pub use client::{connect, Client};

pub mod cmd;
pub use cmd::{Arg, Command};

pub mod config;
pub use config::{Config, HostAddr, SessionConfig};

mod connection;

mod error;
pub use error::{Error, LockError};

pub mod frame;
pub use frame::Frame;

pub mod lock;
pub use lock::SessionLock;

mod reply;
pub use reply::Reply;

pub mod role;
pub use role::{LinkState, Role};

pub mod session;
pub use session::SessionStore;

pub mod sink;
pub use sink::{EventSink, TracingSink};

mod topology;

/// Default port that a redis server listens on.
pub const DEFAULT_PORT: u16 = 6379;

/// A specialized `Result` type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
