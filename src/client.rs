//! Wire client implementation.

use crate::cmd::{Command, Set};
use crate::config::{Config, HostAddr};
use crate::connection::{Connection, Dialer};
use crate::role::Role;
use crate::sink::{EventSink, TracingSink};
use crate::{topology, Error, Reply};

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// A client bound to one logical dataset served by a master and its replicas.
///
/// The client owns at most one connection. It connects lazily, chooses a master or replica
/// depending on the command, and drops the connection on any transport or protocol error.
pub struct Client {
    dialer: Dialer,
    sink: Arc<dyn EventSink>,
    connection: Option<Connection>,
    /// Database index re-selected on every (re)connect.
    database: u32,
    transaction: Transaction,
    last_error: Option<String>,
}

/// MULTI/EXEC state of the current connection.
#[derive(Debug, Default)]
struct Transaction {
    active: bool,
    /// A queued command was rejected; `EXEC` must not be sent.
    failed: bool,
}

/// Establish a connection with one of the servers in `config.hosts`.
///
/// The connection is not required to be a master; the first write will move it to one if
/// needed.
pub async fn connect(config: Config) -> crate::Result<Client> {
    let mut client = Client::new(config);
    client.ensure_connected(false).await?;
    Ok(client)
}

impl Client {
    /// Creates a client without connecting. Events go to `tracing`.
    pub fn new(config: Config) -> Client {
        Client::with_sink(config, Arc::new(TracingSink))
    }

    /// Creates a client without connecting, reporting events to `sink`.
    pub fn with_sink(config: Config, sink: Arc<dyn EventSink>) -> Client {
        Client::from_parts(Dialer::new(Arc::new(config)), sink)
    }

    fn from_parts(dialer: Dialer, sink: Arc<dyn EventSink>) -> Client {
        Client {
            database: dialer.config().database,
            dialer,
            sink,
            connection: None,
            transaction: Transaction::default(),
            last_error: None,
        }
    }

    /// A new, unconnected client sharing this client's configuration, TLS setup, sink and
    /// selected database.
    pub(crate) fn detached(&self) -> Client {
        let mut client = Client::from_parts(self.dialer.clone(), self.sink.clone());
        client.database = self.database;
        client
    }

    pub fn config(&self) -> &Config {
        self.dialer.config()
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Address of the server currently bound, if connected.
    pub fn addr(&self) -> Option<&HostAddr> {
        self.connection.as_ref().map(Connection::addr)
    }

    /// Role of the server currently bound, if connected.
    pub fn role(&self) -> Option<&Role> {
        self.connection.as_ref().map(Connection::role)
    }

    pub fn database(&self) -> u32 {
        self.database
    }

    /// Message of the last error line the server sent on this connection.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.active
    }

    /// Closes the socket and forgets all per-connection state.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            debug!(addr = %conn.addr(), "disconnecting");
        }

        self.transaction = Transaction::default();
        self.last_error = None;
    }

    /// Makes sure a connection exists, and that it is a master when `master_only` is set.
    async fn ensure_connected(&mut self, master_only: bool) -> crate::Result<()> {
        let reconnect = match &self.connection {
            None => true,
            Some(conn) => master_only && !conn.role().is_master(),
        };

        if !reconnect {
            return Ok(());
        }

        self.disconnect();

        match topology::establish(&self.dialer, self.database, master_only).await {
            Ok(conn) => {
                self.connection = Some(conn);
                Ok(())
            }
            Err(err) => {
                self.sink.log_error("redis", &err.to_string());
                Err(err)
            }
        }
    }

    /// Sends `cmd` and waits for its reply.
    ///
    /// Read-only commands may be served by whatever server is bound; anything else forces a
    /// master. Transport and protocol errors close the connection before they are returned.
    /// The command is never re-sent.
    #[instrument(skip(self, cmd), fields(verb = %cmd.verb()))]
    pub async fn execute(&mut self, cmd: Command) -> crate::Result<Reply> {
        self.ensure_connected(!cmd.is_read_only()).await?;

        debug!(request = %cmd);
        self.sink.timer_start(cmd.verb());

        let response = match self.connection.as_mut() {
            Some(conn) => conn.request(&cmd).await,
            None => Err(Error::Connect("not connected".to_string())),
        };

        let frame = match response {
            Ok(frame) => frame,
            Err(err) => {
                warn!(cause = %err, "dropping connection");
                self.disconnect();
                self.sink.log_error("redis", &format!("{}: {}", cmd.verb(), err));
                return Err(err);
            }
        };

        debug!(response = %frame);
        self.sink.save_query(&cmd.to_string(), cmd.verb());

        match Reply::from_frame(frame) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                if self.transaction.active {
                    self.transaction.failed = true;
                }
                self.last_error = Some(err.to_string());

                Err(err)
            }
        }
    }

    /// Ping the server.
    #[instrument(skip(self))]
    pub async fn ping(&mut self) -> crate::Result<Bytes> {
        match self.execute(Command::new("PING")).await? {
            Reply::Bool(true) => Ok(Bytes::from_static(b"OK")),
            reply => reply
                .clone()
                .into_bytes()
                .ok_or_else(|| reply.unexpected("PING")),
        }
    }

    /// Selects the logical database. The index is kept for later reconnects.
    #[instrument(skip(self))]
    pub async fn select(&mut self, database: u32) -> crate::Result<()> {
        let reply = self.execute(Command::new("SELECT").arg(database)).await?;
        expect_ok(reply, "SELECT")?;

        self.database = database;
        Ok(())
    }

    /// Get the value of the given `key`.
    #[instrument(skip(self))]
    pub async fn get(&mut self, key: &str) -> crate::Result<Option<Bytes>> {
        match self.execute(Command::new("GET").arg(key)).await? {
            Reply::Nil => Ok(None),
            reply => match reply.clone().into_bytes() {
                Some(value) => Ok(Some(value)),
                None => Err(reply.unexpected("GET")),
            },
        }
    }

    /// Set `key` to hold the given `value`.
    #[instrument(skip(self, value))]
    pub async fn set(&mut self, key: &str, value: impl Into<Bytes>) -> crate::Result<()> {
        self.set_with(Set::new(key, value)).await.map(|_| ())
    }

    /// Runs a fully specified `SET`.
    ///
    /// Returns `false` when an `NX`/`XX` condition kept the value from being written.
    #[instrument(skip(self, cmd), fields(key = cmd.key()))]
    pub async fn set_with(&mut self, cmd: Set) -> crate::Result<bool> {
        match self.execute(cmd.into_command()).await? {
            Reply::Bool(written) => Ok(written),
            Reply::Nil => Ok(false),
            reply => Err(reply.unexpected("SET")),
        }
    }

    /// Set `key` to `value` with a time to live (`SETEX`).
    #[instrument(skip(self, value))]
    pub async fn set_ex(
        &mut self,
        key: &str,
        ttl: Duration,
        value: impl Into<Bytes>,
    ) -> crate::Result<()> {
        let cmd = Command::new("SETEX")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg(value.into());

        expect_ok(self.execute(cmd).await?, "SETEX")
    }

    /// Set `key` only if it does not exist (`SETNX`).
    #[instrument(skip(self, value))]
    pub async fn set_nx(&mut self, key: &str, value: impl Into<Bytes>) -> crate::Result<bool> {
        let cmd = Command::new("SETNX").arg(key).arg(value.into());
        integer(self.execute(cmd).await?, "SETNX").map(|n| n == 1)
    }

    /// Sets a time to live on `key`. Returns `false` if the key does not exist.
    #[instrument(skip(self))]
    pub async fn expire(&mut self, key: &str, ttl: Duration) -> crate::Result<bool> {
        let cmd = Command::new("EXPIRE").arg(key).arg(ttl.as_secs().max(1));
        integer(self.execute(cmd).await?, "EXPIRE").map(|n| n == 1)
    }

    /// Remaining time to live of `key` in seconds.
    ///
    /// `-2` means the key does not exist, `-1` that it exists without expiry.
    #[instrument(skip(self))]
    pub async fn ttl(&mut self, key: &str) -> crate::Result<i64> {
        integer(self.execute(Command::new("TTL").arg(key)).await?, "TTL")
    }

    /// Remaining time to live of `key` in milliseconds.
    #[instrument(skip(self))]
    pub async fn pttl(&mut self, key: &str) -> crate::Result<i64> {
        integer(self.execute(Command::new("PTTL").arg(key)).await?, "PTTL")
    }

    /// Deletes keys. Returns how many existed.
    #[instrument(skip(self))]
    pub async fn del(&mut self, keys: &[&str]) -> crate::Result<i64> {
        let cmd = Command::new("DEL").args(keys.iter().copied());
        integer(self.execute(cmd).await?, "DEL")
    }

    #[instrument(skip(self))]
    pub async fn exists(&mut self, key: &str) -> crate::Result<bool> {
        integer(self.execute(Command::new("EXISTS").arg(key)).await?, "EXISTS").map(|n| n > 0)
    }

    #[instrument(skip(self))]
    pub async fn incr(&mut self, key: &str) -> crate::Result<i64> {
        integer(self.execute(Command::new("INCR").arg(key)).await?, "INCR")
    }

    #[instrument(skip(self))]
    pub async fn hget(&mut self, key: &str, field: &str) -> crate::Result<Option<Bytes>> {
        let reply = self.execute(Command::new("HGET").arg(key).arg(field)).await?;
        optional_bytes(reply, "HGET")
    }

    /// Sets one hash field. Returns `true` if the field is new.
    #[instrument(skip(self, value))]
    pub async fn hset(
        &mut self,
        key: &str,
        field: &str,
        value: impl Into<Bytes>,
    ) -> crate::Result<bool> {
        let cmd = Command::new("HSET").arg(key).arg(field).arg(value.into());
        integer(self.execute(cmd).await?, "HSET").map(|n| n == 1)
    }

    /// Returns every field of a hash.
    ///
    /// The server replies with a flat `field, value, field, value, ...` array. A field name that
    /// is not valid UTF-8 is a protocol error; read such hashes through `execute`.
    #[instrument(skip(self))]
    pub async fn hgetall(&mut self, key: &str) -> crate::Result<HashMap<String, Bytes>> {
        let reply = self.execute(Command::new("HGETALL").arg(key)).await?;
        let parts = match reply.clone().into_array() {
            Some(parts) if parts.len() % 2 == 0 => parts,
            _ => return Err(reply.unexpected("HGETALL")),
        };

        let mut map = HashMap::with_capacity(parts.len() / 2);
        let mut parts = parts.into_iter();

        while let (Some(field), Some(value)) = (parts.next(), parts.next()) {
            let field = field.into_bytes().ok_or_else(|| reply.unexpected("HGETALL"))?;
            let value = value.into_bytes().ok_or_else(|| reply.unexpected("HGETALL"))?;

            let field = String::from_utf8(field.to_vec())
                .map_err(|_| Error::Protocol("HGETALL field is not valid utf-8".to_string()))?;

            map.insert(field, value);
        }

        Ok(map)
    }

    /// Prepends values to a list. Returns the new length.
    #[instrument(skip(self, values))]
    pub async fn lpush<I, T>(&mut self, key: &str, values: I) -> crate::Result<i64>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        let cmd = Command::new("LPUSH")
            .arg(key)
            .args(values.into_iter().map(Into::<Bytes>::into));
        integer(self.execute(cmd).await?, "LPUSH")
    }

    /// Appends values to a list. Returns the new length.
    #[instrument(skip(self, values))]
    pub async fn rpush<I, T>(&mut self, key: &str, values: I) -> crate::Result<i64>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        let cmd = Command::new("RPUSH")
            .arg(key)
            .args(values.into_iter().map(Into::<Bytes>::into));
        integer(self.execute(cmd).await?, "RPUSH")
    }

    #[instrument(skip(self))]
    pub async fn lrange(&mut self, key: &str, start: i64, stop: i64) -> crate::Result<Vec<Bytes>> {
        let cmd = Command::new("LRANGE").arg(key).arg(start).arg(stop);
        bytes_array(self.execute(cmd).await?, "LRANGE")
    }

    /// Adds members to a set. Returns how many were new.
    #[instrument(skip(self, members))]
    pub async fn sadd<I, T>(&mut self, key: &str, members: I) -> crate::Result<i64>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        let cmd = Command::new("SADD")
            .arg(key)
            .args(members.into_iter().map(Into::<Bytes>::into));
        integer(self.execute(cmd).await?, "SADD")
    }

    #[instrument(skip(self))]
    pub async fn smembers(&mut self, key: &str) -> crate::Result<Vec<Bytes>> {
        bytes_array(self.execute(Command::new("SMEMBERS").arg(key)).await?, "SMEMBERS")
    }

    /// Adds one scored member to a sorted set. Returns `true` if it is new.
    #[instrument(skip(self, member))]
    pub async fn zadd(
        &mut self,
        key: &str,
        score: f64,
        member: impl Into<Bytes>,
    ) -> crate::Result<bool> {
        let cmd = Command::new("ZADD")
            .arg(key)
            .arg(score.to_string())
            .arg(member.into());
        integer(self.execute(cmd).await?, "ZADD").map(|n| n == 1)
    }

    #[instrument(skip(self))]
    pub async fn zrange(&mut self, key: &str, start: i64, stop: i64) -> crate::Result<Vec<Bytes>> {
        let cmd = Command::new("ZRANGE").arg(key).arg(start).arg(stop);
        bytes_array(self.execute(cmd).await?, "ZRANGE")
    }

    /// Starts a transaction. Calling it again while one is open does nothing.
    ///
    /// While it is open the server answers `QUEUED` to everything, so wrappers that expect a
    /// typed reply fail; queue such commands with [`execute`](Client::execute).
    #[instrument(skip(self))]
    pub async fn multi(&mut self) -> crate::Result<bool> {
        if self.transaction.active {
            return Ok(true);
        }

        let reply = self.execute(Command::new("MULTI")).await?;
        expect_ok(reply, "MULTI")?;

        self.transaction = Transaction {
            active: true,
            failed: false,
        };

        Ok(true)
    }

    /// Executes the open transaction.
    ///
    /// If a queued command was rejected, `EXEC` is not sent: the transaction is discarded and
    /// `Error::TransactionAborted` returned. Otherwise returns `true` only when no queued
    /// command failed. A transaction aborted by the server (`WATCH`) yields `false`.
    #[instrument(skip(self))]
    pub async fn exec(&mut self) -> crate::Result<bool> {
        if !self.transaction.active {
            return Ok(false);
        }

        if self.transaction.failed {
            let cause = self
                .last_error
                .clone()
                .unwrap_or_else(|| "queued command failed".to_string());

            // Leave MULTI state on the server; the outcome does not change ours.
            if let Err(err) = self.discard().await {
                debug!(cause = %err, "discard after failed transaction");
            }

            return Err(Error::TransactionAborted(cause));
        }

        let result = self.execute(Command::new("EXEC")).await;
        self.transaction = Transaction::default();

        match result? {
            Reply::Nil | Reply::Bool(false) => Ok(false),
            Reply::Array(results) => Ok(!results.iter().any(Reply::is_failure)),
            reply => Err(reply.unexpected("EXEC")),
        }
    }

    /// Discards the open transaction. Local state is cleared even if the server errors.
    #[instrument(skip(self))]
    pub async fn discard(&mut self) -> crate::Result<bool> {
        let result = self.execute(Command::new("DISCARD")).await;
        self.transaction = Transaction::default();

        Ok(result?.is_ok())
    }
}

fn expect_ok(reply: Reply, verb: &str) -> crate::Result<()> {
    if reply.is_ok() {
        Ok(())
    } else {
        Err(reply.unexpected(verb))
    }
}

fn integer(reply: Reply, verb: &str) -> crate::Result<i64> {
    reply.as_integer().ok_or_else(|| reply.unexpected(verb))
}

fn optional_bytes(reply: Reply, verb: &str) -> crate::Result<Option<Bytes>> {
    match reply {
        Reply::Nil => Ok(None),
        Reply::Bulk(data) => Ok(Some(data)),
        reply => Err(reply.unexpected(verb)),
    }
}

fn bytes_array(reply: Reply, verb: &str) -> crate::Result<Vec<Bytes>> {
    let parts = match reply.clone().into_array() {
        Some(parts) => parts,
        None => return Err(reply.unexpected(verb)),
    };

    parts
        .into_iter()
        .map(|part| part.into_bytes().ok_or_else(|| reply.unexpected(verb)))
        .collect()
}
