use crate::cmd::Command;

use bytes::Bytes;
use std::time::Duration;

/// Set key to hold the string value.
///
/// If key already holds a value, it is overwritten, regardless of its type. Any previous time to
/// live associated with the key is discarded on successful SET operation.
#[derive(Debug, Clone)]
pub struct Set {
    key: String,
    value: Bytes,
    options: Opts,
}

#[derive(Debug, Clone, Default)]
struct Opts {
    expire: Option<Duration>,
    nx: bool,
    xx: bool,
}

impl Set {
    pub fn new(key: impl ToString, value: impl Into<Bytes>) -> Set {
        Set {
            key: key.to_string(),
            value: value.into(),
            options: Opts::default(),
        }
    }

    /// Expire the key after `ttl`.
    pub fn expire(mut self, ttl: Duration) -> Set {
        self.options.expire = Some(ttl);
        self
    }

    /// Only set the key if it does not already exist.
    pub fn nx(mut self) -> Set {
        self.options.nx = true;
        self.options.xx = false;
        self
    }

    /// Only set the key if it already exists.
    pub fn xx(mut self) -> Set {
        self.options.xx = true;
        self.options.nx = false;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn into_command(self) -> Command {
        let mut cmd = Command::new("SET").arg(self.key).arg(self.value);

        match self.options.expire {
            // Whole seconds go out as `EX`, anything finer as `PX`.
            Some(ttl) if ttl.subsec_millis() == 0 => {
                cmd = cmd.arg("EX").arg(ttl.as_secs().max(1));
            }
            Some(ttl) => {
                cmd = cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            None => {}
        }

        if self.options.nx {
            cmd = cmd.arg("NX");
        } else if self.options.xx {
            cmd = cmd.arg("XX");
        }

        cmd
    }
}
