//! Warden Session Broker
//!
//! The privileged side of the helper handshake. Hand each accepted
//! connection to [`Broker::accept`]: it checks who is on the other end with
//! the kernel, rate limits repeat attempts, caps live sessions per identity,
//! validates the helper's claims and issues a per-connection session key.
//! By default only helpers built from the broker's own executable are
//! admitted.
//!
//! # Example
//!
//! ```no_run
//! use std::os::unix::net::UnixListener;
//!
//! use warden_server::{Broker, BrokerConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let broker = Broker::new(BrokerConfig::from_env());
//! let listener = UnixListener::bind("/var/run/warden/agent.sock")?;
//!
//! for stream in listener.incoming() {
//!     let session = broker.accept(stream?)?;
//!     session.serve(|_channel, env| {
//!         println!("helper sent {}", env.msg_type);
//!         Ok(())
//!     })?;
//! }
//! # Ok(())
//! # }
//! ```

mod broker;
mod config;
mod registry;
mod session;

pub use broker::{Broker, Rejection};
pub use config::{
    BrokerConfig, HelperHashPolicy, HelperPathPolicy, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_IDLE_CHECK_INTERVAL, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SESSIONS_PER_IDENTITY,
    DEFAULT_RATE_LIMIT_ATTEMPTS, DEFAULT_RATE_LIMIT_WINDOW, DEFAULT_SCOPES,
};
pub use registry::SessionInfo;
pub use session::{AuthenticatedSession, CommandError, WILDCARD_SCOPE};
