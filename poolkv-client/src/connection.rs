//! # Leased Connection
//!
//! Purpose: Hold one pooled session for the duration of a single command and
//! hand it back in the right state.
//!
//! ## Design Principles
//! 1. **RAII Release**: Dropping a connection without an explicit release
//!    returns it as broken, so panics and early returns never leak a slot.
//! 2. **Silent Release**: `close`, `close_broken` and `force_close` never fail
//!    the caller; problems are logged by the pool or discarded.
//! 3. **No Command Logic**: The wrapper only exposes the session.

use std::sync::Arc;

use crate::pool::ConnectionFactory;
use crate::session::{Session, SessionControl};

/// A session leased from a [`ConnectionFactory`].
pub struct Connection {
    factory: ConnectionFactory,
    session: Option<Session>,
    reusable: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(factory: ConnectionFactory, session: Session) -> Self {
        Connection {
            factory,
            session: Some(session),
            reusable: false,
        }
    }

    /// Raw session for command dispatch.
    pub fn session(&mut self) -> &mut Session {
        self.session.as_mut().expect("session present until drop")
    }

    /// Id of the underlying session; stable across reuse.
    pub fn id(&self) -> u64 {
        self.control().id()
    }

    /// Kill switch for out-of-band closure.
    pub fn control(&self) -> &Arc<SessionControl> {
        self.session
            .as_ref()
            .map(Session::control)
            .expect("session present until drop")
    }

    /// Returns the session to the pool for reuse.
    ///
    /// A session severed while leased is discarded instead.
    pub fn close(mut self) {
        self.reusable = true;
    }

    /// Returns the session as untrusted; the pool discards it.
    pub fn close_broken(mut self) {
        self.reusable = false;
    }

    /// Severs the transport immediately without touching pool bookkeeping.
    ///
    /// The holder still releases the connection afterwards; that release
    /// discards the session.
    pub fn force_close(&self) {
        let _ = self.control().sever();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.factory.release(session, self.reusable);
        }
    }
}
