//! # Execution Template
//!
//! Purpose: Run one unit of work per leased connection and expose the typed
//! operations callers use.
//!
//! ## Design Principles
//! 1. **Template Method**: Every operation funnels through [`ExecutionTemplate::execute_as`],
//!    which owns lease, database selection, release and registry cleanup.
//! 2. **Scoped Acquisition**: Registry entries are removed by a guard, so cleanup
//!    runs on success, failure and panic alike.
//! 3. **Cause Preservation**: A failed unit of work surfaces as `CommandFailed`
//!    carrying the original error.
//! 4. **Non-Cooperative Cancellation**: [`ExecutionTemplate::close_connections`]
//!    severs sockets; the blocked caller sees an I/O failure.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::error::{BoxError, SessionError, TemplateError, TemplateResult};
use crate::pool::ConnectionFactory;
use crate::registry::{CallerToken, InFlightRegistry};
use crate::session::{KeyTtl, Session};

const NO_DB_INDEX: i64 = -1;

/// Pooled command executor for one store endpoint.
#[derive(Debug)]
pub struct ExecutionTemplate {
    factory: ConnectionFactory,
    db_index: AtomicI64,
    in_flight: InFlightRegistry,
}

struct InFlightGuard<'a> {
    registry: &'a InFlightRegistry,
    token: CallerToken,
    session_id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.deregister(self.token, self.session_id);
    }
}

impl ExecutionTemplate {
    pub fn new(factory: ConnectionFactory) -> Self {
        ExecutionTemplate {
            factory,
            db_index: AtomicI64::new(NO_DB_INDEX),
            in_flight: InFlightRegistry::new(),
        }
    }

    /// Selects `index` before every command.
    pub fn with_db_index(self, index: Option<i64>) -> TemplateResult<Self> {
        self.set_db_index(index)?;
        Ok(self)
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    pub fn db_index(&self) -> Option<i64> {
        match self.db_index.load(Ordering::Relaxed) {
            NO_DB_INDEX => None,
            index => Some(index),
        }
    }

    /// Changes the database selected before each command. Takes effect on the next call.
    pub fn set_db_index(&self, index: Option<i64>) -> TemplateResult<()> {
        let raw = match index {
            Some(index) if index < 0 => {
                return Err(TemplateError::InvalidArgument(format!(
                    "database index must not be negative, got {index}"
                )))
            }
            Some(index) => index,
            None => NO_DB_INDEX,
        };
        self.db_index.store(raw, Ordering::Relaxed);
        Ok(())
    }

    /// Registry of callers with a command in flight.
    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    /// Runs `action` on a leased session under the calling thread's token.
    pub fn execute<T, E, F>(&self, action: F) -> TemplateResult<T>
    where
        F: FnOnce(&mut Session) -> Result<T, E>,
        E: Into<BoxError>,
    {
        self.execute_as(CallerToken::current(), action)
    }

    /// Runs `action` on a leased session, registered under `token` while it runs.
    ///
    /// On success the session goes back to the pool. On any failure, including
    /// database selection, it is discarded and the error is wrapped in
    /// `CommandFailed`.
    pub fn execute_as<T, E, F>(&self, token: CallerToken, action: F) -> TemplateResult<T>
    where
        F: FnOnce(&mut Session) -> Result<T, E>,
        E: Into<BoxError>,
    {
        let mut conn = self.factory.get_connection()?;

        self.in_flight.register(token, conn.control().clone());
        let guard = InFlightGuard {
            registry: &self.in_flight,
            token,
            session_id: conn.id(),
        };

        let outcome: Result<T, BoxError> = match self.db_index() {
            Some(index) => conn
                .session()
                .select(index)
                .map_err(BoxError::from)
                .and_then(|()| action(conn.session()).map_err(Into::into)),
            None => action(conn.session()).map_err(Into::into),
        };

        // Deregister before release: once the session is back in the pool a
        // cancel for this caller must not reach it.
        drop(guard);

        match outcome {
            Ok(value) => {
                conn.close();
                Ok(value)
            }
            Err(err) => {
                debug!(caller = %token, session = conn.id(), error = %err, "command failed");
                conn.close_broken();
                Err(TemplateError::command_failed(err))
            }
        }
    }

    /// Severs the connections currently leased by `tokens`.
    ///
    /// Callers blocked in a command observe a failure. Returns how many
    /// connections were found.
    pub fn close_connections<I>(&self, tokens: I) -> usize
    where
        I: IntoIterator<Item = CallerToken>,
    {
        let mut closed = 0;
        for token in tokens {
            if let Some(session) = self.in_flight.sever(token) {
                debug!(caller = %token, session, "force-closed connection");
                closed += 1;
            }
        }
        closed
    }

    pub fn ping(&self) -> TemplateResult<String> {
        self.execute(|session| session.ping())
    }

    /// Returns the status reply of SET.
    pub fn set(&self, key: &str, value: &str) -> TemplateResult<String> {
        self.execute(|session| session.set(key, value))
    }

    /// SET with an expiry; sub-second TTLs round up to one second.
    pub fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> TemplateResult<String> {
        self.execute(|session| session.set_ex(key, value, ttl))
    }

    pub fn get(&self, key: &str) -> TemplateResult<Option<String>> {
        self.execute(|session| session.get(key))
    }

    /// Returns the number of keys removed.
    pub fn delete(&self, key: &str) -> TemplateResult<i64> {
        self.execute(|session| session.del(key))
    }

    /// Returns 1 if the timeout was set, 0 if the key does not exist.
    pub fn expire(&self, key: &str, seconds: u64) -> TemplateResult<i64> {
        self.execute(|session| session.expire(key, seconds))
    }

    pub fn ttl(&self, key: &str) -> TemplateResult<KeyTtl> {
        self.execute(|session| session.ttl(key))
    }

    pub fn exists(&self, key: &str) -> TemplateResult<bool> {
        self.execute(|session| session.exists(key))
    }

    /// Key names matching `pattern`, using the store's glob syntax.
    pub fn keys(&self, pattern: &str) -> TemplateResult<HashSet<String>> {
        self.execute(|session| session.keys(pattern))
    }

    /// Deletes every key matching `pattern` and returns how many keys matched.
    ///
    /// This is a KEYS scan followed by one DEL per key, not an atomic
    /// operation. Keys removed or added concurrently between the scan and the
    /// deletes are not accounted for, so the returned count is the number
    /// matched, not necessarily the number deleted.
    pub fn remove_values(&self, pattern: &str) -> TemplateResult<u64> {
        self.execute(|session| {
            let keys = session.keys(pattern)?;
            for key in &keys {
                session.del(key)?;
            }
            Ok::<_, SessionError>(keys.len() as u64)
        })
    }

    pub fn lpop(&self, list: &str) -> TemplateResult<Option<String>> {
        self.execute(|session| session.lpop(list))
    }

    /// Head of `list` without removing it.
    pub fn lpeek(&self, list: &str) -> TemplateResult<Option<String>> {
        self.execute(|session| {
            let head = session.lrange(list, 0, 0)?;
            Ok::<_, SessionError>(head.into_iter().next())
        })
    }

    pub fn llen(&self, list: &str) -> TemplateResult<i64> {
        self.execute(|session| session.llen(list))
    }

    pub fn rpush(&self, list: &str, value: &str) -> TemplateResult<()> {
        self.execute(|session| session.rpush(list, value).map(|_| ()))
    }

    /// Blocking pop from the first non-empty list in `lists`.
    ///
    /// Returns `None` when `timeout_secs` elapses, or when the reply is too
    /// short to carry a value. `timeout_secs == 0` waits indefinitely.
    pub fn blpop(&self, timeout_secs: u64, lists: &[&str]) -> TemplateResult<Option<String>> {
        if lists.is_empty() {
            return Err(TemplateError::InvalidArgument(
                "blpop needs at least one list".into(),
            ));
        }
        self.execute(|session| {
            let popped = session
                .blpop(timeout_secs, lists)?
                .filter(|reply| reply.len() >= 2)
                .and_then(|reply| reply.into_iter().nth(1));
            Ok::<_, SessionError>(popped)
        })
    }

    /// Sets `key` and returns its previous value.
    pub fn get_and_set(&self, key: &str, value: &str) -> TemplateResult<Option<String>> {
        self.execute(|session| session.getset(key, value))
    }

    pub fn flush_database(&self) -> TemplateResult<()> {
        self.execute(|session| session.flushdb())
    }
}
