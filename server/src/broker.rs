use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use anyhow::{Context, Result};
use warden_common::{
    binary_hash::binary_hash,
    generate_session_key,
    peer_identity::{self, PeerIdentity, PeerUser, ResolvePeer},
    types, AuthRequest, AuthResponse, RateLimiter, SecureChannel, Transport, PROTOCOL_VERSION,
};

use crate::{
    config::{BrokerConfig, HelperPathPolicy, DEFAULT_SCOPES},
    registry::{Registry, SessionInfo, SessionState},
    session::AuthenticatedSession,
};

/// Why the broker refused a helper.
///
/// Returned inside the `anyhow::Error` from [`Broker::accept`]; recover it
/// with `err.downcast_ref::<Rejection>()`.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("rate limit exceeded for identity {0}")]
    RateLimited(String),
    #[error("identity {identity} already has {count} live sessions")]
    TooManySessions { identity: String, count: usize },
    #[error("peer executable path could not be verified")]
    UnverifiedPath,
    #[error("peer executable {} is not an allowed helper", .0.display())]
    PathNotAllowed(PathBuf),
    #[error("expected auth_request, got {0}")]
    UnexpectedMessage(String),
    #[error("invalid auth request payload")]
    MalformedRequest(#[source] serde_json::Error),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("SID required")]
    SidRequired,
    #[error("SID mismatch")]
    SidMismatch,
    #[error("UID mismatch")]
    UidMismatch,
    #[error("binary hash mismatch")]
    BinaryHashMismatch,
}

impl Rejection {
    /// Text sent to the helper in `AuthResponse::reason`, for rejections that
    /// are answered at all.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Rejection::UnsupportedVersion(_) => Some("unsupported protocol version"),
            Rejection::SidRequired => Some("SID required"),
            Rejection::SidMismatch => Some("SID mismatch"),
            Rejection::UidMismatch => Some("UID mismatch"),
            Rejection::BinaryHashMismatch => Some("binary hash mismatch"),
            _ => None,
        }
    }
}

/// Authenticates user helpers on connections handed to it by a listener.
///
/// One broker is shared by every connection; the rate limiter and session
/// registry inside it are what make repeated attempts and concurrent
/// sessions from one identity visible.
#[derive(Debug)]
pub struct Broker {
    config:       BrokerConfig,
    rate_limiter: RateLimiter,
    sessions:     Arc<Registry>,
}

impl Broker {
    /// Creates a broker with the given policy.
    pub fn new(config: BrokerConfig) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit_attempts, config.rate_limit_window);
        tracing::info!(
            "Session broker ready: {} attempts per {:?}, handshake timeout {:?}",
            config.rate_limit_attempts,
            config.rate_limit_window,
            config.handshake_timeout
        );
        if !config.helper_hashes.is_validation_enforced() {
            tracing::warn!("⚠️  Helper binary hash validation is disabled");
        }
        Self {
            config,
            rate_limiter,
            sessions: Arc::default(),
        }
    }

    /// Creates a broker configured from `WARDEN_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(BrokerConfig::from_env())
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Every live session, oldest first.
    pub fn all_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.all()
    }

    /// Oldest live session reporting `username`.
    pub fn session_for_user(&self, username: &str) -> Option<SessionInfo> {
        self.sessions.find(|info| info.username == username)
    }

    /// Oldest live session for an identity key (UID string or SID).
    pub fn session_for_identity(&self, identity_key: &str) -> Option<SessionInfo> {
        self.sessions.first_for_identity(identity_key)
    }

    /// Oldest live session for a POSIX UID.
    pub fn session_for_uid(&self, uid: u32) -> Option<SessionInfo> {
        self.session_for_identity(&uid.to_string())
    }

    /// Closes every session that has received nothing for longer than the
    /// configured idle timeout. Returns how many were closed.
    pub fn reap_idle_sessions(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let idle = self
            .sessions
            .states_where(|state| state.idle_duration() > idle_timeout);
        for state in &idle {
            let info = state.info();
            tracing::info!(
                session_id = %info.session_id,
                identity = %info.identity_key,
                idle = ?state.idle_duration(),
                "Closing idle user helper session"
            );
            state.close();
        }
        idle.len()
    }

    /// Reaps idle sessions every `idle_check_interval` until `running` is
    /// cleared. Meant for a dedicated thread.
    pub fn run_idle_reaper(&self, running: &AtomicBool) {
        tracing::debug!(
            "Idle reaper started: timeout {:?}, checking every {:?}",
            self.config.idle_timeout,
            self.config.idle_check_interval
        );
        let mut next_check = Instant::now() + self.config.idle_check_interval;
        while running.load(Ordering::SeqCst) {
            if Instant::now() >= next_check {
                self.reap_idle_sessions();
                next_check = Instant::now() + self.config.idle_check_interval;
            }
            // Sleep briefly so a cleared flag is noticed quickly
            thread::sleep(REAPER_POLL.min(self.config.idle_check_interval));
        }
        tracing::debug!("Idle reaper stopped");
    }

    /// Shuts down every live session.
    pub fn close_all_sessions(&self) {
        for state in self.sessions.states_where(|_| true) {
            state.close();
        }
    }

    /// Runs the handshake on a freshly accepted connection.
    ///
    /// On success the returned session has its key installed and the
    /// handshake timeouts cleared. On failure the connection is dropped
    /// (closing it); policy failures carry a [`Rejection`].
    pub fn accept<T>(&self, conn: T) -> Result<AuthenticatedSession<T>>
    where
        T: Transport + ResolvePeer + Send + Sync + 'static,
    {
        let timeout = Some(self.config.handshake_timeout);
        conn.set_read_timeout(timeout)
            .context("Failed to set handshake read timeout")?;
        conn.set_write_timeout(timeout)
            .context("Failed to set handshake write timeout")?;

        // Step 1: Ask the kernel who is connected
        let identity = match peer_identity::resolve(&conn) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "Peer credential check failed");
                return Err(anyhow::Error::new(e).context("Failed to resolve peer identity"));
            }
        };
        let identity_key = identity.identity_key();

        // Step 2: Rate limit per identity
        if !self.rate_limiter.allow(&identity_key) {
            tracing::warn!(identity = %identity_key, pid = identity.pid(), "✗ Connection rate limited");
            return Err(Rejection::RateLimited(identity_key).into());
        }

        // Step 3: Cap concurrent sessions per identity
        self.check_session_count(&identity_key)?;

        // Step 4: Executable path policy
        self.verify_path(&identity)?;

        // Step 5: Read the auth request under the all-zero key
        let channel = SecureChannel::new(conn);
        let env = channel.receive().map_err(|e| {
            tracing::warn!(identity = %identity_key, error = %e, "Auth request read failed");
            anyhow::Error::new(e).context("Failed to read auth request")
        })?;

        if env.msg_type != types::AUTH_REQUEST {
            tracing::warn!(identity = %identity_key, msg_type = %env.msg_type, "✗ Expected auth_request");
            return Err(Rejection::UnexpectedMessage(env.msg_type).into());
        }

        let request: AuthRequest = env.decode_payload().map_err(|e| {
            tracing::warn!(identity = %identity_key, error = %e, "✗ Invalid auth request payload");
            Rejection::MalformedRequest(e)
        })?;

        // Step 6: Claims must agree with the kernel
        if let Err(rejection) = self
            .check_version(&request)
            .and_then(|()| check_claimed_identity(&identity, &request))
            .and_then(|()| self.verify_binary_hash(&identity, &request))
        {
            reply_rejected(&channel, &env.id, &rejection);
            return Err(rejection.into());
        }

        // Step 7: Claim a registry slot, then issue the session key
        let channel = Arc::new(channel);
        let uid = match identity.user() {
            PeerUser::Posix { uid, .. } => *uid,
            PeerUser::Windows { .. } => 0,
        };
        let state = Arc::new(SessionState::new(
            SessionInfo {
                uid,
                identity_key: identity_key.clone(),
                username:     request.username.clone(),
                display_env:  request.display_env.clone(),
                session_id:   request.session_id.clone(),
                pid:          identity.pid(),
                capabilities: None,
                connected_at: SystemTime::now(),
            },
            {
                let channel = Arc::clone(&channel);
                move || {
                    if let Err(e) = channel.shutdown() {
                        tracing::debug!(error = %e, "Failed to shut down session connection");
                    }
                }
            },
        ));
        let registration = self
            .sessions
            .register(Arc::clone(&state), self.config.max_sessions_per_identity)
            .map_err(|count| {
                tracing::warn!(identity = %identity_key, count, "✗ Max sessions exceeded");
                Rejection::TooManySessions {
                    identity: identity_key.clone(),
                    count,
                }
            })?;

        let session_key = generate_session_key().context("Failed to generate session key")?;
        let scopes: Vec<String> = DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect();
        let response = AuthResponse {
            accepted:       true,
            session_key:    hex::encode(session_key),
            agent_id:       self.config.agent_id.clone(),
            allowed_scopes: scopes.clone(),
            reason:         String::new(),
        };
        channel
            .send_typed(&env.id, types::AUTH_RESPONSE, &response)
            .context("Failed to send auth response")?;

        channel.set_session_key(session_key);
        channel
            .set_timeout(None)
            .context("Failed to clear handshake timeout")?;

        tracing::info!(
            identity = %identity_key,
            username = %request.username,
            session_id = %request.session_id,
            display = %request.display_env,
            pid = identity.pid(),
            "✓ User helper authenticated"
        );

        Ok(AuthenticatedSession::new(channel, identity, request, scopes, state, registration))
    }

    fn check_session_count(&self, identity_key: &str) -> Result<(), Rejection> {
        let count = self.sessions.count_for(identity_key);
        if count < self.config.max_sessions_per_identity {
            return Ok(());
        }
        tracing::warn!(identity = %identity_key, count, "✗ Max sessions exceeded");
        Err(Rejection::TooManySessions {
            identity: identity_key.to_string(),
            count,
        })
    }

    fn verify_path(&self, identity: &PeerIdentity) -> Result<(), Rejection> {
        let Some(path) = identity.exe_path() else {
            if self.config.require_verified_path {
                tracing::warn!(identity = %identity.identity_key(), pid = identity.pid(), "✗ Peer executable path unavailable");
                return Err(Rejection::UnverifiedPath);
            }
            tracing::debug!(pid = identity.pid(), "Peer executable path unavailable, not required");
            return Ok(());
        };

        let allowed = match &self.config.helper_paths {
            HelperPathPolicy::Any => return Ok(()),
            HelperPathPolicy::AllowList(paths) => paths,
        };

        let peer = canonical(path);
        if allowed
            .iter()
            .any(|allowed| same_path(&canonical(allowed), &peer))
        {
            tracing::debug!(path = %peer.display(), "✓ Helper path verified");
            Ok(())
        } else {
            tracing::warn!(
                identity = %identity.identity_key(),
                pid = identity.pid(),
                path = %peer.display(),
                "✗ Binary path verification failed"
            );
            Err(Rejection::PathNotAllowed(peer))
        }
    }

    fn check_version(&self, request: &AuthRequest) -> Result<(), Rejection> {
        if request.protocol_version == PROTOCOL_VERSION {
            return Ok(());
        }
        tracing::warn!(
            claimed = request.protocol_version,
            supported = PROTOCOL_VERSION,
            "✗ Unsupported protocol version"
        );
        Err(Rejection::UnsupportedVersion(request.protocol_version))
    }

    /// The claimed hash must be allowed, and when the executable can be read
    /// it must actually have that hash.
    fn verify_binary_hash(&self, identity: &PeerIdentity, request: &AuthRequest) -> Result<(), Rejection> {
        let policy = &self.config.helper_hashes;
        if !policy.is_validation_enforced() {
            return Ok(());
        }

        if !policy.is_hash_allowed(&request.binary_hash) {
            tracing::warn!(
                identity = %identity.identity_key(),
                got = %request.binary_hash,
                allowed = ?policy.allowed_hashes(),
                "✗ Binary hash mismatch"
            );
            return Err(Rejection::BinaryHashMismatch);
        }

        if let Some(path) = identity.exe_path() {
            match binary_hash(path) {
                Ok(actual) if actual.eq_ignore_ascii_case(&request.binary_hash) => {}
                Ok(actual) => {
                    tracing::warn!(
                        identity = %identity.identity_key(),
                        path = %path.display(),
                        claimed = %request.binary_hash,
                        actual = %actual,
                        "✗ Claimed binary hash does not match executable"
                    );
                    return Err(Rejection::BinaryHashMismatch);
                }
                // The process may have exited or the file may be unreadable
                // to us; the claimed hash was already checked.
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "Could not hash peer executable"),
            }
        }

        tracing::info!("✓ Binary hash verification passed");
        Ok(())
    }
}

fn check_claimed_identity(identity: &PeerIdentity, request: &AuthRequest) -> Result<(), Rejection> {
    match identity.user() {
        PeerUser::Windows { sid } => {
            if request.sid.is_empty() {
                tracing::warn!(pid = identity.pid(), "✗ Auth request missing SID");
                return Err(Rejection::SidRequired);
            }
            if request.sid != *sid {
                tracing::warn!(claimed = %request.sid, actual = %sid, "✗ Auth SID mismatch");
                return Err(Rejection::SidMismatch);
            }
        }
        PeerUser::Posix { uid, .. } => {
            if request.uid != *uid {
                tracing::warn!(claimed = request.uid, actual = *uid, "✗ Auth UID mismatch");
                return Err(Rejection::UidMismatch);
            }
        }
    }
    Ok(())
}

const REAPER_POLL: Duration = Duration::from_millis(100);

/// Best effort: the connection is closed right after either way.
fn reply_rejected<T: Transport>(channel: &SecureChannel<T>, id: &str, rejection: &Rejection) {
    let Some(reason) = rejection.reason() else {
        return;
    };
    if let Err(e) = channel.send_typed(id, types::AUTH_RESPONSE, &AuthResponse::rejected(reason)) {
        tracing::debug!(error = %e, "Failed to deliver rejection");
    }
}

/// Resolves symlinks when possible; a path that no longer exists is compared
/// as given.
fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(windows)]
fn same_path(a: &Path, b: &Path) -> bool {
    a.to_string_lossy()
        .eq_ignore_ascii_case(&b.to_string_lossy())
}

#[cfg(not(windows))]
fn same_path(a: &Path, b: &Path) -> bool {
    a == b
}
