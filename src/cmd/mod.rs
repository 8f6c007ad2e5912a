//! Command construction and request serialization.

mod set;
pub use set::Set;

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Verbs that may be served by a replica. Everything else is routed to the master.
const READ_ONLY: &[&str] = &[
    "DBSIZE",
    "ECHO",
    "EXISTS",
    "GET",
    "GETRANGE",
    "HEXISTS",
    "HGET",
    "HGETALL",
    "HKEYS",
    "HLEN",
    "HMGET",
    "HVALS",
    "INFO",
    "KEYS",
    "LINDEX",
    "LLEN",
    "LRANGE",
    "MGET",
    "PING",
    "PTTL",
    "ROLE",
    "SCAN",
    "SCARD",
    "SISMEMBER",
    "SMEMBERS",
    "SRANDMEMBER",
    "STRLEN",
    "TTL",
    "TYPE",
    "ZCARD",
    "ZCOUNT",
    "ZRANGE",
    "ZRANGEBYSCORE",
    "ZRANK",
    "ZREVRANGE",
    "ZREVRANGEBYSCORE",
    "ZREVRANK",
    "ZSCORE",
];

/// Returns `true` if `verb` may be sent to a replica.
pub fn is_read_only(verb: &str) -> bool {
    READ_ONLY.iter().any(|ro| ro.eq_ignore_ascii_case(verb))
}

/// One command argument: a single value or a nested list of arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Bytes),
    List(Vec<Arg>),
}

impl Arg {
    /// Builds a nested list from anything convertible into arguments.
    pub fn list<I, T>(items: I) -> Arg
    where
        I: IntoIterator<Item = T>,
        T: Into<Arg>,
    {
        Arg::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<Bytes> for Arg {
    fn from(src: Bytes) -> Arg {
        Arg::Value(src)
    }
}

impl From<&Bytes> for Arg {
    fn from(src: &Bytes) -> Arg {
        Arg::Value(src.clone())
    }
}

impl From<&str> for Arg {
    fn from(src: &str) -> Arg {
        Arg::Value(Bytes::copy_from_slice(src.as_bytes()))
    }
}

impl From<&String> for Arg {
    fn from(src: &String) -> Arg {
        src.as_str().into()
    }
}

impl From<String> for Arg {
    fn from(src: String) -> Arg {
        Arg::Value(Bytes::from(src))
    }
}

impl From<&[u8]> for Arg {
    fn from(src: &[u8]) -> Arg {
        Arg::Value(Bytes::copy_from_slice(src))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(src: Vec<u8>) -> Arg {
        Arg::Value(Bytes::from(src))
    }
}

macro_rules! integer_args {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(src: $ty) -> Arg {
                    Arg::Value(Bytes::copy_from_slice(itoa::Buffer::new().format(src).as_bytes()))
                }
            }
        )*
    };
}

integer_args!(i32, i64, u32, u64, usize);

/// Flattens an argument tree into the ordered sequence of values sent on the wire.
pub fn flatten(args: &[Arg]) -> Vec<Bytes> {
    let mut out = Vec::with_capacity(args.len());
    let mut stack = vec![args.iter()];

    while let Some(level) = stack.last_mut() {
        match level.next() {
            Some(Arg::Value(value)) => out.push(value.clone()),
            Some(Arg::List(items)) => stack.push(items.iter()),
            None => {
                stack.pop();
            }
        }
    }

    out
}

/// A request: a verb followed by its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    verb: String,
    args: Vec<Arg>,
}

impl Command {
    /// Creates a command. The verb is sent upper-cased.
    pub fn new(verb: impl AsRef<str>) -> Command {
        Command {
            verb: verb.as_ref().to_ascii_uppercase(),
            args: vec![],
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Command {
        self.args.push(arg.into());
        self
    }

    /// Appends a sequence of arguments.
    pub fn args<I, T>(mut self, items: I) -> Command
    where
        I: IntoIterator<Item = T>,
        T: Into<Arg>,
    {
        self.args.push(Arg::list(items));
        self
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// Returns `true` if a replica may serve this command.
    pub fn is_read_only(&self) -> bool {
        is_read_only(&self.verb)
    }

    /// Serializes the command as a multi-bulk request.
    ///
    /// Returns the encoded bytes together with the number of bulk strings written, verb
    /// included.
    pub fn encode(&self) -> (BytesMut, usize) {
        let args = flatten(&self.args);
        let count = args.len() + 1;

        let size = self.verb.len() + args.iter().map(|a| a.len() + 16).sum::<usize>() + 32;
        let mut buf = BytesMut::with_capacity(size);

        let mut num = itoa::Buffer::new();

        buf.put_u8(b'*');
        buf.put_slice(num.format(count).as_bytes());
        buf.put_slice(b"\r\n");

        put_bulk(&mut buf, self.verb.as_bytes());
        for arg in &args {
            put_bulk(&mut buf, arg);
        }

        (buf, count)
    }
}

fn put_bulk(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u8(b'$');
    buf.put_slice(itoa::Buffer::new().format(value.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// Longest argument rendered verbatim by `Display`.
const DISPLAY_ARG_MAX: usize = 64;

impl fmt::Display for Command {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.verb)?;

        for arg in flatten(&self.args) {
            match std::str::from_utf8(&arg) {
                Ok(text) if text.len() <= DISPLAY_ARG_MAX => write!(fmt, " {}", text)?,
                _ => write!(fmt, " <{} bytes>", arg.len())?,
            }
        }

        Ok(())
    }
}
