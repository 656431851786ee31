//! Warden User Helper Client
//!
//! The unprivileged side of the helper handshake. Connect to the broker's
//! socket however the platform requires, then hand the stream to
//! [`SecureIpcClient::authenticate`]; every message after that is signed
//! with the session key the broker issued.
//!
//! # Example
//!
//! ```no_run
//! use std::{os::unix::net::UnixStream, time::Duration};
//!
//! use warden_client::{detect_capabilities, ClientConfig, SecureIpcClient};
//! use warden_common::config::default_socket_path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let stream = UnixStream::connect(default_socket_path())?;
//! let config = ClientConfig::new().with_timeout(Duration::from_secs(10));
//!
//! let mut client = SecureIpcClient::authenticate(stream, config)?;
//! client.send_capabilities(&detect_capabilities())?;
//! client.ping()?;
//!
//! client.disconnect()?;
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export important types from warden-common for convenience
pub use warden_common::{AuthRequest, AuthResponse, Capabilities, Envelope, PROTOCOL_VERSION};
