use std::{
    collections::VecDeque,
    env,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use uuid::Uuid;
use warden_common::{
    binary_hash::current_binary_hash,
    peer_identity::{self, PeerUser},
    types, AuthRequest, AuthResponse, Capabilities, Envelope, SecureChannel, SessionKey, Transport,
    PROTOCOL_VERSION,
};

/// Unrelated messages held while a request waits; more than this fails the
/// request.
pub const MAX_BACKLOG: usize = 256;

/// Configuration for the user helper client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Handshake timeout, and the deadline for each request's reply
    pub timeout:             Duration,
    /// Reported username; detected from the OS when unset
    pub username:            Option<String>,
    /// Reported display environment; detected when unset
    pub display_env:         Option<String>,
    /// Send the SHA-256 of our own executable with the auth request
    pub compute_binary_hash: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout:             Duration::from_secs(30),
            username:            None,
            display_env:         None,
            compute_binary_hash: true,
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the operation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the reported username
    pub fn with_username<S: Into<String>>(mut self, username: S) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Override the reported display environment
    pub fn with_display_env<S: Into<String>>(mut self, display_env: S) -> Self {
        self.display_env = Some(display_env.into());
        self
    }

    /// Enable or disable hashing our own executable
    pub fn with_compute_binary_hash(mut self, compute: bool) -> Self {
        self.compute_binary_hash = compute;
        self
    }
}

/// An authenticated connection from the user helper to the broker
pub struct SecureIpcClient<T: Transport> {
    channel:       SecureChannel<T>,
    session_id:    String,
    agent_id:      String,
    scopes:        Vec<String>,
    timeout:       Duration,
    /// Envelopes that arrived while waiting for a correlated reply
    backlog:       VecDeque<Envelope>,
    requests_sent: u64,
}

impl<T: Transport> SecureIpcClient<T> {
    /// Authenticates over an already connected transport.
    ///
    /// Sends an auth request describing this process under the all-zero key,
    /// waits for the broker's answer and installs the issued session key.
    pub fn authenticate(conn: T, config: ClientConfig) -> Result<Self> {
        let channel = SecureChannel::new(conn);
        channel
            .set_timeout(Some(config.timeout))
            .context("Failed to set handshake timeout")?;

        let request = build_auth_request(&config)?;
        let session_id = request.session_id.clone();
        tracing::info!(session_id = %session_id, "Authenticating to session broker...");

        channel
            .send_typed("auth", types::AUTH_REQUEST, &request)
            .context("Failed to send auth request")?;

        let env = channel.receive().context("Failed to receive auth response")?;
        if env.msg_type != types::AUTH_RESPONSE {
            bail!("Expected auth_response, got: {}", env.msg_type);
        }

        let response: AuthResponse = env
            .decode_payload()
            .context("Failed to decode auth response")?;
        if !response.accepted {
            bail!("Authentication rejected by broker: {}", response.reason);
        }

        let key_bytes = hex::decode(&response.session_key).context("Failed to decode session key")?;
        let session_key: SessionKey = key_bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| anyhow!("Session key must be 32 bytes, got {}", bytes.len()))?;
        channel.set_session_key(session_key);
        channel
            .set_timeout(None)
            .context("Failed to clear handshake timeout")?;

        tracing::info!(
            session_id = %session_id,
            agent_id = %response.agent_id,
            scopes = ?response.allowed_scopes,
            "✓ Authenticated to session broker"
        );

        Ok(Self {
            channel,
            session_id,
            agent_id: response.agent_id,
            scopes: response.allowed_scopes,
            timeout: config.timeout,
            backlog: VecDeque::new(),
            requests_sent: 0,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Scopes the broker granted this helper
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    pub fn channel(&self) -> &SecureChannel<T> {
        &self.channel
    }

    /// Send a message without waiting for a reply
    pub fn send_typed<P: Serialize + ?Sized>(&self, id: &str, msg_type: &str, payload: &P) -> Result<()> {
        self.channel
            .send_typed(id, msg_type, payload)
            .with_context(|| format!("Failed to send {msg_type}"))
    }

    /// Report what this helper can do
    pub fn send_capabilities(&self, capabilities: &Capabilities) -> Result<()> {
        self.send_typed("caps", types::CAPABILITIES, capabilities)
    }

    /// Receive the next message from the broker
    pub fn receive(&mut self) -> Result<Envelope> {
        if let Some(env) = self.backlog.pop_front() {
            return Ok(env);
        }
        self.channel
            .receive()
            .context("Failed to receive message")
    }

    /// Send a message and wait for the reply with the same id.
    ///
    /// The reply must arrive within the configured timeout, however much
    /// other traffic arrives meanwhile. Unrelated messages are kept for
    /// [`SecureIpcClient::receive`], up to [`MAX_BACKLOG`] of them. A reply
    /// carrying an error is returned as an error.
    pub fn request<P: Serialize + ?Sized>(&mut self, msg_type: &str, payload: &P) -> Result<Envelope> {
        let env = Envelope::new(Uuid::new_v4().to_string(), msg_type)
            .with_payload(payload)
            .context("Failed to encode request payload")?;
        self.round_trip(env)
    }

    /// Send a ping and wait for the pong
    pub fn ping(&mut self) -> Result<()> {
        let reply = self.round_trip(Envelope::new(Uuid::new_v4().to_string(), types::PING))?;
        if reply.msg_type != types::PONG {
            bail!("Expected pong, got: {}", reply.msg_type);
        }
        tracing::debug!("✓ Received pong");
        Ok(())
    }

    /// Tell the broker we are leaving and close the connection
    pub fn disconnect(self) -> Result<()> {
        tracing::info!(session_id = %self.session_id, "Disconnecting from session broker...");
        self.channel
            .send(&mut Envelope::new(Uuid::new_v4().to_string(), types::DISCONNECT))
            .context("Failed to send disconnect")?;
        self.channel
            .shutdown()
            .context("Failed to close connection")?;
        tracing::info!("✓ Disconnected");
        Ok(())
    }

    fn round_trip(&mut self, mut env: Envelope) -> Result<Envelope> {
        let id = env.id.clone();
        self.channel
            .send(&mut env)
            .with_context(|| format!("Failed to send request {id}"))?;
        self.requests_sent += 1;

        let reply = self.await_reply(&id, Instant::now() + self.timeout);
        self.channel
            .set_read_timeout(None)
            .context("Failed to clear request timeout")?;

        let reply = reply?;
        if reply.is_error() {
            bail!("Request {} error: {}", id, reply.error);
        }
        Ok(reply)
    }

    fn await_reply(&mut self, id: &str, deadline: Instant) -> Result<Envelope> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("Request {id} timed out after {:?}", self.timeout);
            }
            self.channel
                .set_read_timeout(Some(remaining))
                .context("Failed to set request timeout")?;

            let env = match self.channel.receive() {
                Ok(env) => env,
                Err(e) if e.is_timeout() => bail!("Request {id} timed out after {:?}", self.timeout),
                Err(e) => return Err(anyhow::Error::new(e).context(format!("Failed to receive reply to {id}"))),
            };
            if env.id == id {
                return Ok(env);
            }

            if self.backlog.len() >= MAX_BACKLOG {
                tracing::warn!(id = %id, backlog = self.backlog.len(), "⚠️  Too many unrelated messages while awaiting reply");
                bail!("Request {id} abandoned: message backlog is full ({MAX_BACKLOG})");
            }
            tracing::debug!(id = %env.id, msg_type = %env.msg_type, "Queued message while awaiting reply");
            self.backlog.push_back(env);
        }
    }
}

/// Describes this process to the broker; every identity field is checked
/// against what the kernel reports about us.
pub fn build_auth_request(config: &ClientConfig) -> Result<AuthRequest> {
    let local = peer_identity::local_identity().context("Failed to determine local identity")?;

    let (uid, sid) = match local.user() {
        PeerUser::Posix { uid, .. } => (*uid, String::new()),
        PeerUser::Windows { sid } => (0, sid.clone()),
    };

    let username = config
        .username
        .clone()
        .or_else(current_username)
        .unwrap_or_default();

    let binary_hash = if config.compute_binary_hash {
        current_binary_hash().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "⚠️  Could not hash own executable");
            String::new()
        })
    } else {
        String::new()
    };

    Ok(AuthRequest {
        protocol_version: PROTOCOL_VERSION,
        uid,
        sid,
        session_id: format!("helper-{}-{}", username, local.pid()),
        username,
        display_env: config.display_env.clone().unwrap_or_else(detect_display_env),
        pid: local.pid(),
        binary_hash,
        win_session_id: 0,
    })
}

/// Display server the helper can reach, e.g. `wayland:wayland-0` or
/// `x11::0`; empty when headless.
pub fn detect_display_env() -> String {
    if cfg!(windows) {
        return "windows".to_string();
    }
    if cfg!(target_os = "macos") {
        return "quartz".to_string();
    }
    if let Some(display) = env::var("WAYLAND_DISPLAY").ok().filter(|d| !d.is_empty()) {
        return format!("wayland:{display}");
    }
    if let Some(display) = env::var("DISPLAY").ok().filter(|d| !d.is_empty()) {
        return format!("x11:{display}");
    }
    String::new()
}

/// Everything is available when there is a display to talk to.
pub fn detect_capabilities() -> Capabilities {
    let display = detect_display_env();
    let has_display = !display.is_empty();
    Capabilities {
        can_notify:     has_display,
        can_tray:       has_display,
        can_capture:    has_display,
        can_clipboard:  has_display,
        display_server: display,
    }
}

#[cfg(unix)]
fn current_username() -> Option<String> {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => Some(user.name),
        _ => env::var("USER").ok(),
    }
}

#[cfg(not(unix))]
fn current_username() -> Option<String> {
    env::var("USERNAME").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = ClientConfig::new()
            .with_timeout(Duration::from_secs(3))
            .with_username("alice")
            .with_display_env("x11::0")
            .with_compute_binary_hash(false);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.display_env.as_deref(), Some("x11::0"));
        assert!(!config.compute_binary_hash);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn auth_request_describes_this_process() {
        let config = ClientConfig::new()
            .with_username("alice")
            .with_display_env("x11::0");
        let request = build_auth_request(&config).unwrap();

        assert_eq!(request.protocol_version, PROTOCOL_VERSION);
        assert_eq!(request.uid, nix::unistd::getuid().as_raw());
        assert!(request.sid.is_empty());
        assert_eq!(request.pid, std::process::id());
        assert_eq!(request.username, "alice");
        assert_eq!(request.session_id, format!("helper-alice-{}", std::process::id()));
        assert_eq!(request.display_env, "x11::0");
        assert_eq!(request.binary_hash, current_binary_hash().unwrap());
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn binary_hash_can_be_skipped() {
        let config = ClientConfig::new().with_compute_binary_hash(false);
        let request = build_auth_request(&config).unwrap();
        assert!(request.binary_hash.is_empty());
    }

    #[test]
    fn capabilities_follow_display() {
        let caps = detect_capabilities();
        let has_display = !caps.display_server.is_empty();
        assert_eq!(caps.can_notify, has_display);
        assert_eq!(caps.can_clipboard, has_display);
    }
}
