//! Provides a type representing a reply frame sent by the server.
//!
//! The Redis protocol can be found at <https://redis.io/topics/protocol>

use atoi::FromRadix10SignedChecked;
use bytes::{Buf, Bytes};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

/// A frame in the Redis protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    /// An integer line whose payload does not fit an `i64`. Kept verbatim.
    RawInteger(String),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
    NullArray,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Not enough data is buffered to parse a whole frame.
    #[error("stream ended early")]
    Incomplete,

    #[error("invalid frame: {0}")]
    Invalid(String),
}

impl Frame {
    /// Checks if an entire message can be decoded from `src`.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        match eat_u8(src)? {
            // check simple, error and integer frames
            //
            // "+OK\r\n", "-Error message\r\n", ":1000\r\n"
            b'+' | b'-' | b':' => {
                eat_line(src)?;
                Ok(())
            }
            // check bulk frame
            //
            // "$-1\r\n" (Null)
            // "$6\r\nfoobar\r\n"
            b'$' => match eat_length(src)? {
                None => Ok(()),
                // skip the number of bytes + 2 (\r\n)
                Some(len) => skip(src, len + 2),
            },
            // check array frame
            //
            // "*-1\r\n" (Null array)
            // "*2\r\n:1\r\n:2\r\n"
            b'*' => match eat_length(src)? {
                None => Ok(()),
                Some(len) => {
                    // check each entry of the array.
                    for _ in 0..len {
                        Frame::check(src)?;
                    }

                    Ok(())
                }
            },
            other => Err(invalid_type(other)),
        }
    }

    /// Parses the message into a `Frame`.
    ///
    /// The message should be validated with `check()` before calling this function.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        match eat_u8(src)? {
            // parse simple frame
            b'+' => {
                let line = eat_line(src)?.to_vec();
                Ok(Frame::Simple(into_string(line)?))
            }
            // parse error frame
            b'-' => {
                let line = eat_line(src)?.to_vec();
                Ok(Frame::Error(into_string(line)?))
            }
            // parse integer frame
            b':' => {
                let line = eat_line(src)?;

                // Only the canonical rendering of an `i64` is an integer. Anything else, like
                // "007", "+5" or values out of range, is handed back as text.
                match canonical_i64(line) {
                    Some(int) => Ok(Frame::Integer(int)),
                    None => Ok(Frame::RawInteger(into_string(line.to_vec())?)),
                }
            }
            // parse bulk frame
            b'$' => {
                let len = match eat_length(src)? {
                    Some(len) => len,
                    None => return Ok(Frame::Null),
                };

                if src.remaining() < len + 2 {
                    return Err(Error::Incomplete);
                }

                let data = Bytes::copy_from_slice(&src.chunk()[..len]);
                src.advance(len);

                // the payload must be followed by exactly "\r\n".
                if src.chunk()[..2] != *b"\r\n" {
                    return Err(Error::Invalid("bulk string not terminated by CRLF".into()));
                }
                src.advance(2);

                Ok(Frame::Bulk(data))
            }
            // parse array frame
            b'*' => {
                let len = match eat_length(src)? {
                    Some(len) => len,
                    None => return Ok(Frame::NullArray),
                };

                let mut out = Vec::with_capacity(len);

                // parse each entry recursively.
                for _ in 0..len {
                    out.push(Frame::parse(src)?);
                }

                Ok(Frame::Array(out))
            }
            other => Err(invalid_type(other)),
        }
    }
}

impl PartialEq<&str> for Frame {
    fn eq(&self, other: &&str) -> bool {
        match self {
            Frame::Simple(s) => s.eq(other),
            Frame::Bulk(s) => s.eq(other),
            _ => false,
        }
    }
}

fn invalid_type(byte: u8) -> Error {
    Error::Invalid(format!("unknown frame type `{}`", byte.escape_ascii()))
}

fn into_string(line: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(line).map_err(|_| Error::Invalid("line is not valid utf-8".into()))
}

fn exact_i64(line: &[u8]) -> Option<i64> {
    match i64::from_radix_10_signed_checked(line) {
        (Some(int), used) if used == line.len() && !line.is_empty() => Some(int),
        _ => None,
    }
}

/// Parses `line` as an `i64` only if it is exactly how that value is written.
fn canonical_i64(line: &[u8]) -> Option<i64> {
    let int = exact_i64(line)?;

    if itoa::Buffer::new().format(int).as_bytes() == line {
        Some(int)
    } else {
        None
    }
}

fn eat_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.get_u8())
}

fn eat_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf: &'a [u8] = src.get_ref();

    if buf.len() < 2 {
        return Err(Error::Incomplete);
    }

    for i in start..buf.len() - 1 {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            // found a line, update the position to be **after** the \n
            src.set_position((i + 2) as u64);

            return Ok(&buf[start..i]);
        }
    }

    Err(Error::Incomplete)
}

/// Reads a length line. `-1` marks a null bulk string or null array.
fn eat_length(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, Error> {
    let line = eat_line(src)?;

    match exact_i64(line) {
        Some(-1) => Ok(None),
        Some(len) if len >= 0 => usize::try_from(len)
            .map(Some)
            .map_err(|_| Error::Invalid("length out of range".into())),
        _ => Err(Error::Invalid(format!(
            "invalid length `{}`",
            line.escape_ascii()
        ))),
    }
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }

    src.advance(n);
    Ok(())
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use std::str;

        match self {
            Frame::Simple(response) => response.fmt(fmt),
            Frame::Error(msg) => write!(fmt, "error: {}", msg),
            Frame::Integer(num) => num.fmt(fmt),
            Frame::RawInteger(num) => num.fmt(fmt),
            Frame::Bulk(msg) => match str::from_utf8(msg) {
                Ok(string) => string.fmt(fmt),
                Err(_) => write!(fmt, "{:?}", msg),
            },
            Frame::Null | Frame::NullArray => "(nil)".fmt(fmt),
            Frame::Array(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(fmt, " ")?;
                    }
                    part.fmt(fmt)?;
                }

                Ok(())
            }
        }
    }
}
