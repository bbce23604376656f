//! # Transport Session
//!
//! Purpose: Own one TCP session to the store and expose the typed commands
//! the template needs. A session knows nothing about pooling.
//!
//! ## Design Principles
//! 1. **Buffer Reuse**: Each session keeps its own read and write buffers.
//! 2. **Out-of-Band Kill Switch**: A cloned socket lives in [`SessionControl`] so
//!    another thread can sever the session while this one is blocked reading.
//! 3. **One Command, One Reply**: No pipelining; every call writes a command and
//!    reads exactly one reply.

use std::collections::HashSet;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::PoolConfig;
use crate::error::{SessionError, SessionResult};
use crate::resp::{encode_command, read_response, RespValue};

/// TTL state of a key, mirroring the store's TTL reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key is missing or already expired (`-2`).
    Missing,
    /// Key exists without expiration (`-1`).
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

impl KeyTtl {
    fn from_reply(seconds: i64) -> SessionResult<Self> {
        match seconds {
            -2 => Ok(KeyTtl::Missing),
            -1 => Ok(KeyTtl::NoExpiry),
            s if s >= 0 => Ok(KeyTtl::ExpiresIn(Duration::from_secs(s as u64))),
            _ => Err(SessionError::UnexpectedResponse),
        }
    }

    /// Raw TTL reply: seconds remaining, `-1` without expiry, `-2` when missing.
    pub fn as_seconds(&self) -> i64 {
        match self {
            KeyTtl::Missing => -2,
            KeyTtl::NoExpiry => -1,
            KeyTtl::ExpiresIn(ttl) => ttl.as_secs() as i64,
        }
    }
}

/// Shared kill switch for a session.
///
/// Held by the session itself and, while leased, by the in-flight registry.
#[derive(Debug)]
pub struct SessionControl {
    id: u64,
    stream: TcpStream,
    severed: AtomicBool,
}

impl SessionControl {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Shuts the socket down in both directions, waking any blocked reader.
    ///
    /// A second call reports the OS error for an already shut socket; callers
    /// on the release path ignore it.
    pub fn sever(&self) -> std::io::Result<()> {
        self.severed.store(true, Ordering::Release);
        self.stream.shutdown(Shutdown::Both)
    }

    pub fn is_severed(&self) -> bool {
        self.severed.load(Ordering::Acquire)
    }
}

/// One RESP2 session with reusable buffers.
pub struct Session {
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    read_timeout: Option<Duration>,
    control: Arc<SessionControl>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.control.id)
            .field("severed", &self.control.is_severed())
            .finish()
    }
}

impl Session {
    /// Connects, authenticates, and selects the configured database.
    pub(crate) fn open(config: &PoolConfig, id: u64) -> SessionResult<Self> {
        let timeout = config.timeout();
        let stream = connect_stream(config, timeout)?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        // Commands are tiny; do not wait to coalesce them.
        stream.set_nodelay(true)?;

        let control = Arc::new(SessionControl {
            id,
            stream: stream.try_clone()?,
            severed: AtomicBool::new(false),
        });
        let mut session = Session {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            read_timeout: timeout,
            control,
        };

        if let Some(password) = config.password.as_deref() {
            session.auth(password)?;
        }
        if config.database != 0 {
            session.select(config.database)?;
        }
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.control.id
    }

    pub fn control(&self) -> &Arc<SessionControl> {
        &self.control
    }

    /// Sends one command and reads its reply. Error replies are returned as values.
    pub fn exec(&mut self, args: &[&[u8]]) -> SessionResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        read_response(&mut self.reader, &mut self.line_buf)
    }

    /// Runs a command whose reply may legitimately take up to `wait`.
    ///
    /// The read timeout is widened by `wait` for this call only; `None` means
    /// the command may block indefinitely.
    fn exec_blocking(&mut self, args: &[&[u8]], wait: Option<Duration>) -> SessionResult<RespValue> {
        // A wait too long to represent is treated as unbounded.
        let widened = match (wait, self.read_timeout) {
            (Some(wait), Some(base)) => wait.checked_add(base),
            _ => None,
        };
        self.reader.get_ref().set_read_timeout(widened)?;
        let reply = self.exec(args);
        if reply.is_ok() {
            self.reader.get_ref().set_read_timeout(self.read_timeout)?;
        }
        reply
    }

    pub fn ping(&mut self) -> SessionResult<String> {
        match self.exec(&[b"PING"])?.into_result()? {
            RespValue::Simple(text) | RespValue::Bulk(Some(text)) => Ok(String::from_utf8(text)?),
            _ => Err(SessionError::UnexpectedResponse),
        }
    }

    pub fn auth(&mut self, password: &str) -> SessionResult<()> {
        self.exec(&[b"AUTH", password.as_bytes()])?.into_status()?;
        Ok(())
    }

    pub fn select(&mut self, index: i64) -> SessionResult<()> {
        let index = index.to_string();
        self.exec(&[b"SELECT", index.as_bytes()])?.into_status()?;
        Ok(())
    }

    /// Returns the status reply, normally `OK`.
    pub fn set(&mut self, key: &str, value: &str) -> SessionResult<String> {
        self.exec(&[b"SET", key.as_bytes(), value.as_bytes()])?
            .into_status()
    }

    pub fn set_ex(&mut self, key: &str, value: &str, ttl: Duration) -> SessionResult<String> {
        let seconds = ttl.as_secs().max(1).to_string();
        self.exec(&[b"SET", key.as_bytes(), value.as_bytes(), b"EX", seconds.as_bytes()])?
            .into_status()
    }

    pub fn get(&mut self, key: &str) -> SessionResult<Option<String>> {
        self.exec(&[b"GET", key.as_bytes()])?.into_optional_string()
    }

    pub fn getset(&mut self, key: &str, value: &str) -> SessionResult<Option<String>> {
        self.exec(&[b"GETSET", key.as_bytes(), value.as_bytes()])?
            .into_optional_string()
    }

    /// Returns the number of keys removed.
    pub fn del(&mut self, key: &str) -> SessionResult<i64> {
        self.exec(&[b"DEL", key.as_bytes()])?.into_integer()
    }

    /// Returns 1 when the timeout was set, 0 when the key does not exist.
    pub fn expire(&mut self, key: &str, seconds: u64) -> SessionResult<i64> {
        let seconds = seconds.to_string();
        self.exec(&[b"EXPIRE", key.as_bytes(), seconds.as_bytes()])?
            .into_integer()
    }

    pub fn ttl(&mut self, key: &str) -> SessionResult<KeyTtl> {
        KeyTtl::from_reply(self.exec(&[b"TTL", key.as_bytes()])?.into_integer()?)
    }

    pub fn exists(&mut self, key: &str) -> SessionResult<bool> {
        Ok(self.exec(&[b"EXISTS", key.as_bytes()])?.into_integer()? > 0)
    }

    pub fn keys(&mut self, pattern: &str) -> SessionResult<HashSet<String>> {
        let keys = self
            .exec(&[b"KEYS", pattern.as_bytes()])?
            .into_string_array()?
            .unwrap_or_default();
        Ok(keys.into_iter().collect())
    }

    pub fn lpop(&mut self, list: &str) -> SessionResult<Option<String>> {
        self.exec(&[b"LPOP", list.as_bytes()])?.into_optional_string()
    }

    pub fn lrange(&mut self, list: &str, start: i64, stop: i64) -> SessionResult<Vec<String>> {
        let (start, stop) = (start.to_string(), stop.to_string());
        Ok(self
            .exec(&[b"LRANGE", list.as_bytes(), start.as_bytes(), stop.as_bytes()])?
            .into_string_array()?
            .unwrap_or_default())
    }

    pub fn llen(&mut self, list: &str) -> SessionResult<i64> {
        self.exec(&[b"LLEN", list.as_bytes()])?.into_integer()
    }

    /// Returns the list length after the push.
    pub fn rpush(&mut self, list: &str, value: &str) -> SessionResult<i64> {
        self.exec(&[b"RPUSH", list.as_bytes(), value.as_bytes()])?
            .into_integer()
    }

    /// Blocking pop across `lists`. `timeout_secs == 0` blocks until a value arrives.
    ///
    /// Returns the raw reply items (`[list, value]`), or `None` on timeout.
    pub fn blpop(&mut self, timeout_secs: u64, lists: &[&str]) -> SessionResult<Option<Vec<String>>> {
        let timeout = timeout_secs.to_string();
        let mut args: Vec<&[u8]> = Vec::with_capacity(lists.len() + 2);
        args.push(b"BLPOP");
        args.extend(lists.iter().map(|list| list.as_bytes()));
        args.push(timeout.as_bytes());

        let wait = match timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        self.exec_blocking(&args, wait)?.into_string_array()
    }

    pub fn flushdb(&mut self) -> SessionResult<()> {
        self.exec(&[b"FLUSHDB"])?.into_status()?;
        Ok(())
    }
}

fn connect_stream(config: &PoolConfig, timeout: Option<Duration>) -> SessionResult<TcpStream> {
    let addr_text = config.addr();
    let addr: SocketAddr = addr_text
        .to_socket_addrs()
        .map_err(|_| SessionError::InvalidAddress(addr_text.clone()))?
        .next()
        .ok_or(SessionError::InvalidAddress(addr_text))?;
    let stream = match timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    Ok(stream)
}
