//! # In-Flight Registry
//!
//! Purpose: Remember which session each caller is currently using so another
//! thread can sever it, e.g. to unblock a caller parked in `BLPOP`.
//!
//! ## Design Principles
//! 1. **Explicit Tokens**: Callers are identified by a [`CallerToken`], not by
//!    OS thread ids; the per-thread token is only a convenience default.
//! 2. **Lock-Free Callers**: A sharded concurrent map; no external locking.
//! 3. **Lease-Scoped Entries**: Removal only deletes the entry for the same
//!    session, so a late cleanup never drops a newer registration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::session::SessionControl;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: CallerToken = CallerToken::new();
}

/// Opaque identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerToken(u64);

impl CallerToken {
    /// Mints a token no other context holds.
    pub fn new() -> Self {
        CallerToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Token bound to the calling thread, minted on first use.
    pub fn current() -> Self {
        THREAD_TOKEN.with(|token| *token)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for CallerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "caller-{}", self.0)
    }
}

/// Map from caller to the kill switch of its leased session.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    entries: DashMap<CallerToken, Arc<SessionControl>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `control` as the caller's current session, replacing any older entry.
    pub fn register(&self, token: CallerToken, control: Arc<SessionControl>) {
        self.entries.insert(token, control);
    }

    /// Removes the caller's entry if it still points at session `session_id`.
    pub fn deregister(&self, token: CallerToken, session_id: u64) {
        self.entries
            .remove_if(&token, |_, control| control.id() == session_id);
    }

    /// Removes the caller's entry and severs its session, returning the session id.
    ///
    /// The socket is shut down while the entry's shard lock is held, so it
    /// cannot interleave with [`deregister`](Self::deregister): a session is
    /// either severed before its holder releases it, or not at all.
    pub fn sever(&self, token: CallerToken) -> Option<u64> {
        self.entries
            .remove_if(&token, |_, control| {
                // Already shut sockets report an error; the session is gone either way.
                let _ = control.sever();
                true
            })
            .map(|(_, control)| control.id())
    }

    /// Whether `token` has a command in flight. Observability only; the
    /// answer may be stale as soon as it is returned.
    pub fn contains(&self, token: CallerToken) -> bool {
        self.entries.contains_key(&token)
    }

    /// Number of callers with a command in flight. Observability only.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no caller has a command in flight. Observability only.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
