//! # poolkv Client
//!
//! Purpose: Expose a small set of Redis-compatible key/value and list
//! operations through a pooled, one-command-per-lease execution template.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: `ConnectionFactory` reuses TCP sessions across calls.
//! 2. **Template Method**: `ExecutionTemplate::execute` owns lease and release;
//!    operations only describe the command.
//! 3. **Out-of-Band Cancellation**: Callers blocked in a command can be cut loose
//!    from another thread via `close_connections`.
//! 4. **Protocol Clarity**: RESP2 framing is explicit and limited to what the
//!    template sends.
//!
//! ```no_run
//! use poolkv_client::{ConnectionFactory, ExecutionTemplate, PoolConfig};
//!
//! let factory = ConnectionFactory::new(PoolConfig::default())?;
//! factory.start()?;
//! let template = ExecutionTemplate::new(factory.clone());
//! template.rpush("jobs", "build")?;
//! assert_eq!(template.lpeek("jobs")?, Some("build".to_string()));
//! factory.stop()?;
//! # Ok::<(), poolkv_client::TemplateError>(())
//! ```

mod config;
mod connection;
mod error;
mod pool;
mod registry;
mod resp;
mod session;
mod template;

pub use config::{
    PoolConfig, Settings, TemplateSettings, DEFAULT_CONNECTION_CACHE_SIZE,
    DEFAULT_CONNECTION_MAX_SIZE, DEFAULT_DATABASE, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TIMEOUT_MS,
};
pub use connection::Connection;
pub use error::{
    BoxError, ConfigError, SessionError, SessionResult, TemplateError, TemplateResult,
};
pub use pool::{ConnectionFactory, PoolStats};
pub use registry::{CallerToken, InFlightRegistry};
pub use resp::RespValue;
pub use session::{KeyTtl, Session, SessionControl};
pub use template::ExecutionTemplate;
