use crate::cmd::Command;
use crate::config::{Config, HostAddr};
use crate::frame::{self, Frame};
use crate::role::Role;

use bytes::{Buf, BytesMut};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::future::Future;
use std::io::{self, Cursor, ErrorKind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Number of zero-length writes tolerated before a request is abandoned.
const WRITE_ATTEMPTS: u32 = 5;

/// Plain TCP or TLS transport.
#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens sockets on behalf of one client.
///
/// The TLS client configuration is built once, when the dialer is created, and shared by every
/// connection it opens.
#[derive(Clone)]
pub(crate) struct Dialer {
    config: Arc<Config>,
    tls: Option<TlsConnector>,
}

impl Dialer {
    pub(crate) fn new(config: Arc<Config>) -> Dialer {
        let tls = config.tls.then(tls_connector);
        Dialer { config, tls }
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    async fn connect(&self, addr: &HostAddr) -> io::Result<Stream> {
        let socket = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        socket.set_nodelay(true)?;

        let connector = match &self.tls {
            Some(connector) => connector,
            None => return Ok(Stream::Tcp(socket)),
        };

        let stream = connector.connect(server_name(addr)?, socket).await?;

        Ok(Stream::Tls(Box::new(stream)))
    }
}

/// Send commands to and receive `Frame`s from one server.
///
/// The socket is closed when the `Connection` is dropped.
#[derive(Debug)]
pub(crate) struct Connection {
    stream: Stream,
    /// The internal buffer for reading frames.
    buffer: BytesMut,
    addr: HostAddr,
    /// Role last reported by the server. `Unknown` until `ROLE` was asked.
    role: Role,
    io_timeout: Duration,
}

impl Connection {
    /// Opens a socket to `addr`, performing the TLS handshake when configured.
    ///
    /// The whole establishment, handshake included, is bounded by `connect_timeout`.
    pub(crate) async fn open(addr: &HostAddr, dialer: &Dialer) -> crate::Result<Connection> {
        let config = dialer.config();
        let stream = deadline(config.connect_timeout, "connect", dialer.connect(addr)).await?;

        debug!(%addr, tls = config.tls, "socket open");

        Ok(Connection {
            stream,
            buffer: BytesMut::with_capacity(4 * 1024),
            addr: addr.clone(),
            role: Role::Unknown("unresolved".to_string()),
            io_timeout: config.io_timeout,
        })
    }

    pub(crate) fn addr(&self) -> &HostAddr {
        &self.addr
    }

    pub(crate) fn role(&self) -> &Role {
        &self.role
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    /// Writes `cmd` and reads exactly one reply frame.
    pub(crate) async fn request(&mut self, cmd: &Command) -> crate::Result<Frame> {
        self.write_command(cmd).await?;
        self.read_frame().await
    }

    /// Tries to parse a frame from the buffer.
    ///
    /// # Returns
    ///
    /// If the buffer contains enough data, the frame is returned and the data removed from the
    /// buffer. If not enough data has been buffered yet, `Ok(None)` is returned. If the buffered
    /// data does not represent a valid frame, `Err` is returned.
    fn parse_frame(&mut self) -> crate::Result<Option<Frame>> {
        use frame::Error::Incomplete;

        let mut buf = Cursor::new(&self.buffer[..]);

        // check if enough data has been buffered to parse a single frame.
        match Frame::check(&mut buf) {
            Ok(_) => {
                // remember the length of the frame.
                let len = buf.position() as usize;

                // reset the position to zero and parse the frame.
                buf.set_position(0);
                let frame = Frame::parse(&mut buf)?;

                // remove the parsed data from the buffer.
                self.buffer.advance(len);

                Ok(Some(frame))
            }
            // There is not enough data present in the read buffer to parse a single frame.
            Err(Incomplete) => Ok(None),
            // An error was encountered while parsing the frame.
            Err(e) => Err(e.into()),
        }
    }

    /// Read a single `Frame` value from the underlying stream.
    ///
    /// # Returns
    ///
    /// On success, the received frame is returned. Each socket read is bounded by the I/O
    /// timeout. If the server closes the socket before a whole frame arrived, a
    /// `ConnectionReset` I/O error is returned; there is no clean end of stream for a client
    /// waiting on a reply.
    pub(crate) async fn read_frame(&mut self) -> crate::Result<Frame> {
        loop {
            // Attempt to parse a frame from the buffered data.
            if let Some(frame) = self.parse_frame()? {
                return Ok(frame);
            }

            // There is not enough buffered data to read a frame. Attempt to
            // read more data from the socket.
            //
            // `0` indicates "end of stream".
            let read = self.stream.read_buf(&mut self.buffer);
            if 0 == deadline(self.io_timeout, "read", read).await? {
                let err = io::Error::new(ErrorKind::ConnectionReset, "connection reset by server");
                return Err(err.into());
            }
        }
    }

    /// Serializes `cmd` and writes it out.
    pub(crate) async fn write_command(&mut self, cmd: &Command) -> crate::Result<()> {
        let (buf, _) = cmd.encode();
        write_with_retry(&mut self.stream, &buf, self.io_timeout).await
    }
}

/// Writes all of `buf` to `dst`, then flushes.
///
/// Partial writes continue from where they stopped. A write that accepts no bytes counts as a
/// failed attempt; after `WRITE_ATTEMPTS` of those the request is abandoned. Every write is
/// bounded by `io_timeout`.
async fn write_with_retry<W>(dst: &mut W, buf: &[u8], io_timeout: Duration) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    let mut failures = 0;

    while written < buf.len() {
        let n = deadline(io_timeout, "write", dst.write(&buf[written..])).await?;

        if n == 0 {
            failures += 1;

            if failures >= WRITE_ATTEMPTS {
                return Err(crate::Error::Protocol(format!(
                    "short write: {} of {} bytes after {} attempts",
                    written,
                    buf.len(),
                    failures
                )));
            }

            continue;
        }

        written += n;
    }

    deadline(io_timeout, "flush", dst.flush()).await
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Name the server certificate is verified against. IP literals verify against IP SANs.
fn server_name(addr: &HostAddr) -> io::Result<ServerName<'static>> {
    ServerName::try_from(addr.host.as_str())
        .map(|name| name.to_owned())
        .map_err(|_| {
            let msg = format!("invalid TLS server name `{}`", addr.host);
            io::Error::new(ErrorKind::InvalidInput, msg)
        })
}

/// Runs `op`, failing with `ErrorKind::TimedOut` once `limit` elapses.
async fn deadline<F, T>(limit: Duration, what: &str, op: F) -> crate::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match time::timeout(limit, op).await {
        Ok(res) => Ok(res?),
        Err(_) => {
            let msg = format!("{} timed out after {:?}", what, limit);
            Err(io::Error::new(ErrorKind::TimedOut, msg).into())
        }
    }
}
