//! # Connection Factory
//!
//! Purpose: Keep a bounded set of store sessions and lease them one command
//! at a time.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle sessions are reused; total sessions never exceed `max_size`.
//! 2. **Minimal Locking**: The mutex covers queue and counters only; connects and
//!    socket shutdowns run outside it.
//! 3. **Bounded Waiting**: An exhausted pool blocks the caller on a condvar up to
//!    the lease timeout, then fails.
//! 4. **Explicit Lifecycle**: `start`/`stop` are called by the owning application;
//!    there is no global pool.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::error::{TemplateError, TemplateResult};
use crate::session::Session;

/// Point-in-time view of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions waiting in the idle queue.
    pub idle: usize,
    /// Sessions currently leased.
    pub active: usize,
    /// Idle plus leased.
    pub total: usize,
    /// Effective upper bound after normalization.
    pub max_size: usize,
    /// Sessions opened since the factory was created.
    pub opened: u64,
    /// Sessions torn down instead of being reused.
    pub discarded: u64,
}

struct PoolState {
    idle: VecDeque<Session>,
    total: usize,
    running: bool,
    next_id: u64,
    opened: u64,
    discarded: u64,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Pooled source of [`Connection`]s for one store endpoint.
///
/// Cloning is cheap and shares the same pool.
#[derive(Clone)]
pub struct ConnectionFactory {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionFactory {
    /// Builds a stopped factory. Call [`start`](Self::start) before leasing.
    ///
    /// `max_size` is raised to `min_idle` first when it is smaller.
    pub fn new(config: PoolConfig) -> TemplateResult<Self> {
        if config.max_size < config.min_idle {
            warn!(
                max_size = config.max_size,
                min_idle = config.min_idle,
                "max_size below min_idle, raising it"
            );
        }
        let config = config.normalized();
        config.validate()?;

        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_size),
            total: 0,
            running: false,
            next_id: 1,
            opened: 0,
            discarded: 0,
        };
        Ok(ConnectionFactory {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        })
    }

    /// Effective configuration after normalization.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Marks the pool running and opens up to `min_idle` idle sessions.
    ///
    /// Warm-up failures are logged; leasing will retry the connect.
    pub fn start(&self) -> TemplateResult<()> {
        self.inner.state.lock().running = true;
        info!(addr = %self.inner.config.addr(), "connection pool started");

        while let Some(id) = self.reserve_for_warmup() {
            match Session::open(&self.inner.config, id) {
                Ok(session) => {
                    let mut state = self.inner.state.lock();
                    state.opened += 1;
                    state.idle.push_back(session);
                    drop(state);
                    self.inner.available.notify_one();
                }
                Err(err) => {
                    self.release_slot();
                    warn!(error = %err, "pool warm-up stopped early");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stops leasing and closes every idle session.
    ///
    /// Sessions still leased are torn down when they come back. The pool stays
    /// stopped even if some sessions fail to close.
    pub fn stop(&self) -> TemplateResult<()> {
        let drained: Vec<Session> = {
            let mut state = self.inner.state.lock();
            state.running = false;
            let drained: Vec<Session> = state.idle.drain(..).collect();
            state.total -= drained.len();
            state.discarded += drained.len() as u64;
            drained
        };
        self.inner.available.notify_all();

        let mut failed = 0;
        let mut first = None;
        for session in drained {
            if let Err(err) = session.control().sever() {
                // Already closed by the peer; nothing left to release.
                if err.kind() == std::io::ErrorKind::NotConnected {
                    continue;
                }
                failed += 1;
                first.get_or_insert(err);
            }
        }

        match first {
            Some(first) => {
                error!(failed, error = %first, "connection pool teardown failed");
                Err(TemplateError::Teardown { failed, first })
            }
            None => {
                info!("connection pool stopped");
                Ok(())
            }
        }
    }

    /// Leases a session, waiting up to the configured timeout when the pool is exhausted.
    pub fn get_connection(&self) -> TemplateResult<Connection> {
        let wait = self.inner.config.timeout();
        let started = Instant::now();
        let deadline = wait.map(|wait| started + wait);

        let mut state = self.inner.state.lock();
        loop {
            if !state.running {
                return Err(TemplateError::PoolClosed);
            }

            if let Some(session) = state.idle.pop_front() {
                if session.control().is_severed() {
                    state.total = state.total.saturating_sub(1);
                    state.discarded += 1;
                    debug!(session = session.id(), "dropping severed idle session");
                    continue;
                }
                drop(state);
                debug!(session = session.id(), "leased idle session");
                return Ok(Connection::new(self.clone(), session));
            }

            if state.total < self.inner.config.max_size {
                state.total += 1;
                let id = state.next_id;
                state.next_id += 1;
                drop(state);
                return self.open_leased(id);
            }

            match deadline {
                Some(deadline) => {
                    if self.inner.available.wait_until(&mut state, deadline).timed_out() {
                        // One last look; a release may have raced the timeout.
                        let freed = !state.idle.is_empty()
                            || state.total < self.inner.config.max_size;
                        if state.running && freed {
                            continue;
                        }
                        return Err(TemplateError::PoolExhausted {
                            waited: started.elapsed(),
                        });
                    }
                }
                None => self.inner.available.wait(&mut state),
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.total - state.idle.len(),
            total: state.total,
            max_size: self.inner.config.max_size,
            opened: state.opened,
            discarded: state.discarded,
        }
    }

    /// Takes a session back. Broken, severed, or surplus sessions are torn down.
    pub(crate) fn release(&self, session: Session, reusable: bool) {
        let severed = session.control().is_severed();
        let surplus = {
            let mut state = self.inner.state.lock();
            if reusable && !severed && state.running && state.idle.len() < self.inner.config.max_size {
                state.idle.push_back(session);
                None
            } else {
                state.total = state.total.saturating_sub(1);
                state.discarded += 1;
                Some(session)
            }
        };
        self.inner.available.notify_one();

        let Some(session) = surplus else {
            return;
        };
        debug!(session = session.id(), reusable, severed, "discarding session");
        if severed {
            // The canceller already shut the socket.
            return;
        }
        if let Err(err) = session.control().sever() {
            warn!(session = session.id(), error = %err, "failed to close discarded session");
        }
    }

    fn open_leased(&self, id: u64) -> TemplateResult<Connection> {
        match Session::open(&self.inner.config, id) {
            Ok(session) => {
                self.inner.state.lock().opened += 1;
                debug!(session = id, addr = %self.inner.config.addr(), "opened session");
                Ok(Connection::new(self.clone(), session))
            }
            Err(source) => {
                self.release_slot();
                warn!(addr = %self.inner.config.addr(), error = %source, "session setup failed");
                Err(TemplateError::ConnectionSetupFailed { source })
            }
        }
    }

    fn reserve_for_warmup(&self) -> Option<u64> {
        let mut state = self.inner.state.lock();
        if !state.running
            || state.idle.len() >= self.inner.config.min_idle
            || state.total >= self.inner.config.max_size
        {
            return None;
        }
        state.total += 1;
        let id = state.next_id;
        state.next_id += 1;
        Some(id)
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.inner.available.notify_one();
    }
}
