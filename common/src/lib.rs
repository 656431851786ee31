//! Warden IPC Common Library
//!
//! This crate is the trust boundary between the privileged Warden daemon and
//! the unprivileged per-session helper. It provides:
//!
//! - The wire vocabulary: envelopes, message types and size limits
//! - A secure channel with length-prefixed framing, per-message HMAC-SHA256
//!   tags and strict sequence numbering
//! - Kernel-verified peer identity (Linux, macOS, Windows)
//! - Per-identity sliding-window rate limiting
//!
//! # Features
//!
//! - **Cross-platform IPC**: one transport seam over Unix domain sockets and
//!   Windows named pipes
//! - **Pre-auth integrity**: envelopes are tag-checked under an all-zero key
//!   until a per-connection session key is installed
//! - **Replay protection**: every direction carries strictly increasing
//!   sequence numbers

/// SHA-256 of executables for helper integrity checks
pub mod binary_hash;

/// Default locations and environment helpers
pub mod config;

/// Kernel-verified identity of the connected peer
pub mod peer_identity;

/// Platform-specific connected streams (Unix domain sockets, Windows named
/// pipes)
pub mod platform_socket;

/// Envelope, message types and handshake payloads
pub mod protocol;

/// Sliding-window admission control
pub mod rate_limit;

/// Signed, sequenced framing over a duplex stream
pub mod secure_channel;

// Re-export commonly used types for convenience
pub use peer_identity::{IdentityError, PeerIdentity, PeerUser, ResolvePeer};
pub use platform_socket::PlatformSocket;
pub use protocol::{
    types, AuthRequest, AuthResponse, Capabilities, Envelope, MAX_BINARY_FRAME_SIZE,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use rate_limit::RateLimiter;
pub use secure_channel::{
    generate_session_key, ChannelError, SecureChannel, SessionKey, Transport, ZERO_KEY,
};
