//! Client and session configuration.
//!
//! Both structs are plain values handed to constructors. They derive `Deserialize` so callers
//! can load them from whatever format they already use; every field has a default.

use crate::DEFAULT_PORT;

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A `host:port` pair from the host pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16) -> HostAddr {
        HostAddr {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAddr {
    type Err = String;

    /// Parses `host` or `host:port`.
    fn from_str(src: &str) -> Result<HostAddr, String> {
        let src = src.trim();

        let (host, port) = match src.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in `{}`", src))?;
                (host, port)
            }
            None => (src, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(format!("missing host in `{}`", src));
        }

        Ok(HostAddr::new(host, port))
    }
}

impl TryFrom<String> for HostAddr {
    type Error = String;

    fn try_from(src: String) -> Result<HostAddr, String> {
        src.parse()
    }
}

/// Connection settings for [`Client`](crate::Client).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Candidate servers. Shuffled on every connect.
    pub hosts: Vec<HostAddr>,
    pub password: Option<String>,
    /// Logical database selected after binding.
    pub database: u32,
    pub tls: bool,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound on every individual socket read and write.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Pause before the host pool is tried a second time.
    #[serde(with = "humantime_serde")]
    pub pool_retry_delay: Duration,
    /// How many times a replica is asked for its master link state before giving up.
    pub role_poll_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub role_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            hosts: vec![HostAddr::new("127.0.0.1", DEFAULT_PORT)],
            password: None,
            database: 0,
            tls: false,
            connect_timeout: Duration::from_millis(2500),
            io_timeout: Duration::from_secs(5),
            pool_retry_delay: Duration::from_millis(500),
            role_poll_attempts: 10,
            role_poll_interval: Duration::from_millis(300),
        }
    }
}

impl Config {
    /// A configuration for the given hosts, everything else default.
    pub fn with_hosts(hosts: impl IntoIterator<Item = HostAddr>) -> Config {
        Config {
            hosts: hosts.into_iter().collect(),
            ..Config::default()
        }
    }
}

/// Settings for [`SessionStore`](crate::SessionStore) and its lock.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Prepended to every session id to form the record key.
    pub prefix: String,
    /// Lifetime of a session record.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    pub lock_attempts: u32,
    /// Sleep taken when the lock is found alive.
    #[serde(with = "humantime_serde")]
    pub lock_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            prefix: "session:".to_string(),
            ttl: Duration::from_secs(1440),
            lock_ttl: Duration::from_secs(600),
            lock_attempts: 3,
            lock_backoff: Duration::from_secs(1),
        }
    }
}
