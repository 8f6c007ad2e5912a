//! In-process stub server speaking the Redis protocol, for integration tests.
#![allow(dead_code)]

use bytes::{Buf, Bytes, BytesMut};
use kvsession::{frame, Config, EventSink, Frame, HostAddr};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client configuration with timings suited to tests.
pub fn config(hosts: &[HostAddr]) -> Config {
    Config {
        connect_timeout: Duration::from_secs(1),
        io_timeout: Duration::from_secs(2),
        pool_retry_delay: Duration::from_millis(10),
        role_poll_interval: Duration::from_millis(10),
        ..Config::with_hosts(hosts.iter().cloned())
    }
}

/// An address nothing listens on.
pub async fn dead_addr() -> HostAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    HostAddr::new("127.0.0.1", port)
}

#[derive(Debug, Clone)]
pub enum StubRole {
    Master,
    /// Reports `connecting` for the first `connecting_polls` ROLE calls, `connected` after.
    Replica {
        master: HostAddr,
        connecting_polls: usize,
    },
}

#[derive(Debug, Clone)]
enum Value {
    Str(Bytes),
    Hash(HashMap<Bytes, Bytes>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct State {
    role: StubRole,
    role_calls: usize,
    password: Option<String>,
    keys: HashMap<Bytes, Entry>,
    log: Vec<Vec<String>>,
    /// Verbs answered with an error line instead of being run.
    rejected: Vec<String>,
}

impl State {
    fn live(&mut self, key: &[u8]) -> Option<&mut Entry> {
        let expired = match self.keys.get(key) {
            Some(entry) => entry.expires_at.map_or(false, |at| at <= Instant::now()),
            None => return None,
        };

        if expired {
            self.keys.remove(key);
            return None;
        }

        self.keys.get_mut(key)
    }
}

/// Reply values written by the stub.
#[derive(Debug, Clone)]
enum Out {
    Ok,
    Status(&'static str),
    Err(String),
    Int(i64),
    Bulk(Bytes),
    Nil,
    Array(Vec<Out>),
}

impl Out {
    fn encode(&self, dst: &mut Vec<u8>) {
        match self {
            Out::Ok => dst.extend_from_slice(b"+OK\r\n"),
            Out::Status(s) => dst.extend_from_slice(format!("+{}\r\n", s).as_bytes()),
            Out::Err(s) => dst.extend_from_slice(format!("-{}\r\n", s).as_bytes()),
            Out::Int(n) => dst.extend_from_slice(format!(":{}\r\n", n).as_bytes()),
            Out::Bulk(b) => {
                dst.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
                dst.extend_from_slice(b);
                dst.extend_from_slice(b"\r\n");
            }
            Out::Nil => dst.extend_from_slice(b"$-1\r\n"),
            Out::Array(parts) => {
                dst.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
                for part in parts {
                    part.encode(dst);
                }
            }
        }
    }
}

/// Per-connection state.
#[derive(Default)]
struct Session {
    authed: bool,
    queued: Option<Vec<Vec<Bytes>>>,
}

const KNOWN: &[&str] = &[
    "PING", "AUTH", "SELECT", "ROLE", "GET", "SET", "SETEX", "SETNX", "EXPIRE", "TTL", "PTTL",
    "DEL", "EXISTS", "INCR", "HSET", "HGET", "HGETALL", "MULTI", "EXEC", "DISCARD",
];

const WRITES: &[&str] = &["SET", "SETEX", "SETNX", "EXPIRE", "DEL", "INCR", "HSET"];

pub struct StubServer {
    addr: HostAddr,
    state: Arc<Mutex<State>>,
}

impl StubServer {
    pub async fn master() -> StubServer {
        StubServer::start(StubRole::Master, None).await
    }

    pub async fn replica_of(master: &HostAddr, connecting_polls: usize) -> StubServer {
        let role = StubRole::Replica {
            master: master.clone(),
            connecting_polls,
        };
        StubServer::start(role, None).await
    }

    pub async fn start(role: StubRole, password: Option<&str>) -> StubServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(Mutex::new(State {
            role,
            role_calls: 0,
            password: password.map(str::to_string),
            keys: HashMap::new(),
            log: vec![],
            rejected: vec![],
        }));

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, shared.clone()));
            }
        });

        StubServer {
            addr: HostAddr::new("127.0.0.1", port),
            state,
        }
    }

    /// Makes every later `verb` command fail with `-ERR rejected`.
    pub fn reject(&self, verb: &str) {
        self.state.lock().unwrap().rejected.push(verb.to_string());
    }

    pub fn addr(&self) -> HostAddr {
        self.addr.clone()
    }

    /// Every command received so far, verb first.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn verbs(&self) -> Vec<String> {
        self.commands().into_iter().map(|c| c[0].clone()).collect()
    }

    /// Number of `verb` commands whose first argument is `key`.
    pub fn count(&self, verb: &str, key: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c[0] == verb && c.get(1).map(String::as_str) == Some(key))
            .count()
    }

    pub fn count_verb(&self, verb: &str) -> usize {
        self.verbs().iter().filter(|v| *v == verb).count()
    }

    pub fn put(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        state.keys.insert(
            Bytes::copy_from_slice(key.as_bytes()),
            Entry {
                value: Value::Str(Bytes::copy_from_slice(value.as_bytes())),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    pub fn value(&self, key: &str) -> Option<Bytes> {
        let mut state = self.state.lock().unwrap();
        match state.live(key.as_bytes()) {
            Some(Entry {
                value: Value::Str(v),
                ..
            }) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        let entry = state.live(key.as_bytes())?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

async fn serve(mut socket: TcpStream, state: Arc<Mutex<State>>) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut session = Session::default();

    loop {
        loop {
            let mut cursor = Cursor::new(&buf[..]);

            let frame = match Frame::check(&mut cursor) {
                Ok(()) => {
                    let len = cursor.position() as usize;
                    cursor.set_position(0);
                    let frame = Frame::parse(&mut cursor).unwrap();
                    buf.advance(len);
                    frame
                }
                Err(frame::Error::Incomplete) => break,
                Err(_) => return,
            };

            let args: Vec<Bytes> = match frame {
                Frame::Array(parts) => parts
                    .into_iter()
                    .map(|part| match part {
                        Frame::Bulk(data) => data,
                        other => panic!("request part is not bulk: {:?}", other),
                    })
                    .collect(),
                other => panic!("request is not an array: {:?}", other),
            };

            let out = {
                let mut state = state.lock().unwrap();
                handle(&mut state, &mut session, args)
            };

            let mut reply = vec![];
            out.encode(&mut reply);

            if socket.write_all(&reply).await.is_err() {
                return;
            }
        }

        match socket.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn text(b: &Bytes) -> String {
    String::from_utf8_lossy(b).into_owned()
}

fn int(b: &Bytes) -> i64 {
    text(b).parse().unwrap()
}

fn handle(state: &mut State, session: &mut Session, args: Vec<Bytes>) -> Out {
    let verb = text(&args[0]).to_ascii_uppercase();

    let mut logged = vec![verb.clone()];
    logged.extend(args[1..].iter().map(text));
    state.log.push(logged);

    if let Some(password) = &state.password {
        if !session.authed && verb != "AUTH" {
            return Out::Err("NOAUTH Authentication required.".into());
        }

        if verb == "AUTH" {
            if text(&args[1]) == *password {
                session.authed = true;
                return Out::Ok;
            }
            return Out::Err("WRONGPASS invalid username-password pair".into());
        }
    }

    if let Some(queued) = &mut session.queued {
        match verb.as_str() {
            "EXEC" | "DISCARD" | "MULTI" => {}
            _ if KNOWN.contains(&verb.as_str()) => {
                queued.push(args);
                return Out::Status("QUEUED");
            }
            _ => return Out::Err(format!("ERR unknown command '{}'", verb)),
        }
    }

    match verb.as_str() {
        "MULTI" => {
            if session.queued.is_some() {
                return Out::Err("ERR MULTI calls can not be nested".into());
            }
            session.queued = Some(vec![]);
            Out::Ok
        }
        "EXEC" => match session.queued.take() {
            Some(queued) => Out::Array(
                queued
                    .into_iter()
                    .map(|cmd| {
                        let verb = text(&cmd[0]).to_ascii_uppercase();
                        apply(state, &verb, &cmd)
                    })
                    .collect(),
            ),
            None => Out::Err("ERR EXEC without MULTI".into()),
        },
        "DISCARD" => match session.queued.take() {
            Some(_) => Out::Ok,
            None => Out::Err("ERR DISCARD without MULTI".into()),
        },
        _ => apply(state, &verb, &args),
    }
}

fn apply(state: &mut State, verb: &str, args: &[Bytes]) -> Out {
    if state.rejected.iter().any(|rejected| rejected == verb) {
        return Out::Err("ERR rejected".into());
    }

    if WRITES.contains(&verb) {
        if let StubRole::Replica { .. } = state.role {
            return Out::Err("READONLY You can't write against a read only replica.".into());
        }
    }

    match verb {
        "PING" => Out::Status("PONG"),
        "FAIL" => Out::Err("ERR bad".into()),
        "AUTH" => Out::Err("ERR AUTH called without any password configured".into()),
        "SELECT" => Out::Ok,
        "ROLE" => role(state),
        "GET" => match state.live(&args[1]) {
            Some(Entry {
                value: Value::Str(v),
                ..
            }) => Out::Bulk(v.clone()),
            Some(_) => wrong_type(),
            None => Out::Nil,
        },
        "SET" => {
            let mut ttl = None;
            let mut nx = false;
            let mut xx = false;
            let mut i = 3;
            while i < args.len() {
                match text(&args[i]).to_ascii_uppercase().as_str() {
                    "EX" => {
                        ttl = Some(Duration::from_secs(int(&args[i + 1]) as u64));
                        i += 1;
                    }
                    "PX" => {
                        ttl = Some(Duration::from_millis(int(&args[i + 1]) as u64));
                        i += 1;
                    }
                    "NX" => nx = true,
                    "XX" => xx = true,
                    _ => return Out::Err("ERR syntax error".into()),
                }
                i += 1;
            }

            let exists = state.live(&args[1]).is_some();
            if (nx && exists) || (xx && !exists) {
                return Out::Nil;
            }

            store(state, &args[1], args[2].clone(), ttl);
            Out::Ok
        }
        "SETEX" => {
            let ttl = Duration::from_secs(int(&args[2]) as u64);
            store(state, &args[1], args[3].clone(), Some(ttl));
            Out::Ok
        }
        "SETNX" => {
            if state.live(&args[1]).is_some() {
                return Out::Int(0);
            }
            store(state, &args[1], args[2].clone(), None);
            Out::Int(1)
        }
        "EXPIRE" => match state.live(&args[1]) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(int(&args[2]) as u64));
                Out::Int(1)
            }
            None => Out::Int(0),
        },
        "TTL" | "PTTL" => match state.live(&args[1]) {
            None => Out::Int(-2),
            Some(Entry {
                expires_at: None, ..
            }) => Out::Int(-1),
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => {
                let left = at.saturating_duration_since(Instant::now()).as_millis() as i64;
                if verb == "TTL" {
                    Out::Int((left + 999) / 1000)
                } else {
                    Out::Int(left)
                }
            }
        },
        "DEL" => {
            let mut n = 0;
            for key in &args[1..] {
                if state.live(key).is_some() {
                    state.keys.remove(key);
                    n += 1;
                }
            }
            Out::Int(n)
        }
        "EXISTS" => Out::Int(state.live(&args[1]).is_some() as i64),
        "INCR" => {
            let current = match state.live(&args[1]) {
                Some(Entry {
                    value: Value::Str(v),
                    ..
                }) => match text(v).parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => {
                        return Out::Err("ERR value is not an integer or out of range".into())
                    }
                },
                Some(_) => return wrong_type(),
                None => 0,
            };
            store(state, &args[1], Bytes::from((current + 1).to_string()), None);
            Out::Int(current + 1)
        }
        "HSET" => {
            if state.live(&args[1]).is_none() {
                state.keys.insert(
                    args[1].clone(),
                    Entry {
                        value: Value::Hash(HashMap::new()),
                        expires_at: None,
                    },
                );
            }
            match state.live(&args[1]) {
                Some(Entry {
                    value: Value::Hash(map),
                    ..
                }) => Out::Int(map.insert(args[2].clone(), args[3].clone()).is_none() as i64),
                _ => wrong_type(),
            }
        }
        "HGET" => match state.live(&args[1]) {
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => map.get(&args[2]).cloned().map_or(Out::Nil, Out::Bulk),
            Some(_) => wrong_type(),
            None => Out::Nil,
        },
        "HGETALL" => match state.live(&args[1]) {
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => Out::Array(
                map.iter()
                    .flat_map(|(k, v)| [Out::Bulk(k.clone()), Out::Bulk(v.clone())])
                    .collect(),
            ),
            Some(_) => wrong_type(),
            None => Out::Array(vec![]),
        },
        other => Out::Err(format!("ERR unknown command '{}'", other)),
    }
}

fn role(state: &mut State) -> Out {
    state.role_calls += 1;

    match &state.role {
        StubRole::Master => Out::Array(vec![
            Out::Bulk("master".into()),
            Out::Int(0),
            Out::Array(vec![]),
        ]),
        StubRole::Replica {
            master,
            connecting_polls,
        } => {
            let link = if state.role_calls <= *connecting_polls {
                "connecting"
            } else {
                "connected"
            };

            Out::Array(vec![
                Out::Bulk("slave".into()),
                Out::Bulk(Bytes::from(master.host.clone())),
                Out::Int(master.port as i64),
                Out::Bulk(link.into()),
                Out::Int(0),
            ])
        }
    }
}

fn store(state: &mut State, key: &Bytes, value: Bytes, ttl: Option<Duration>) {
    state.keys.insert(
        key.clone(),
        Entry {
            value: Value::Str(value),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        },
    );
}

fn wrong_type() -> Out {
    Out::Err("WRONGTYPE Operation against a key holding the wrong kind of value".into())
}

/// A fixture that answers each request with the next canned response, verbatim.
///
/// When the responses run out the fixture keeps the socket open without answering. An empty
/// response closes the socket instead.
pub async fn scripted(responses: Vec<&'static [u8]>) -> HostAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::with_capacity(1024);
        let mut responses = responses.into_iter();

        loop {
            let mut cursor = Cursor::new(&buf[..]);
            match Frame::check(&mut cursor) {
                Ok(()) => {
                    let len = cursor.position() as usize;
                    buf.advance(len);

                    if let Some(response) = responses.next() {
                        socket.write_all(response).await.unwrap();

                        // An empty response closes the socket right after the previous one.
                        if responses.as_slice().first().map_or(false, |next| next.is_empty()) {
                            return;
                        }
                    }
                    continue;
                }
                Err(frame::Error::Incomplete) => {}
                Err(err) => panic!("bad request: {}", err),
            }

            match socket.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    });

    HostAddr::new("127.0.0.1", port)
}

/// Canned reply to `ROLE` from a master.
pub const MASTER_ROLE: &[u8] = b"*3\r\n$6\r\nmaster\r\n:0\r\n*0\r\n";

/// Records every sink call.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn timer_start(&self, tag: &str) {
        self.events.lock().unwrap().push(format!("start {}", tag));
    }

    fn save_query(&self, description: &str, tag: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("query {} {}", tag, description));
    }

    fn log_info(&self, category: &str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("info {} {}", category, message));
    }

    fn log_error(&self, category: &str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("error {} {}", category, message));
    }
}
