use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, RecvTimeoutError, SyncSender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use serde::Serialize;
use warden_common::{
    types, AuthRequest, Capabilities, Envelope, PeerIdentity, SecureChannel, Transport,
};

use crate::registry::{Registration, SessionInfo, SessionState};

/// Scope entry that grants everything.
pub const WILDCARD_SCOPE: &str = "*";

/// Why a command sent with [`AuthenticatedSession::send_command`] got no
/// reply.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command {id} timed out after {timeout:?}")]
    Timeout { id: String, timeout: Duration },
    #[error("session closed while waiting for reply to {0}")]
    SessionClosed(String),
    #[error("command {0} is already waiting for a reply")]
    DuplicateId(String),
}

// Commands waiting for a reply; `None` once the receive loop has ended.
type Pending = Option<HashMap<String, SyncSender<Envelope>>>;

/// A helper connection that passed the handshake.
///
/// The session is `Sync`: one thread runs [`AuthenticatedSession::serve`]
/// while others send commands and wait for the correlated replies.
pub struct AuthenticatedSession<T> {
    channel:      Arc<SecureChannel<T>>,
    identity:     PeerIdentity,
    request:      AuthRequest,
    scopes:       Vec<String>,
    state:        Arc<SessionState>,
    pending:      Mutex<Pending>,
    registration: Mutex<Option<Registration>>,
}

impl<T: Transport> AuthenticatedSession<T> {
    pub(crate) fn new(
        channel: Arc<SecureChannel<T>>,
        identity: PeerIdentity,
        request: AuthRequest,
        scopes: Vec<String>,
        state: Arc<SessionState>,
        registration: Registration,
    ) -> Self {
        Self {
            channel,
            identity,
            request,
            scopes,
            state,
            pending: Mutex::new(Some(HashMap::new())),
            registration: Mutex::new(Some(registration)),
        }
    }

    /// The authenticated channel, for sending to the helper.
    pub fn channel(&self) -> &SecureChannel<T> {
        &self.channel
    }

    /// Kernel-verified identity of the helper process.
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// The accepted auth request; its identity fields matched the kernel.
    pub fn request(&self) -> &AuthRequest {
        &self.request
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        scope_granted(&self.scopes, scope)
    }

    /// What the helper reported it can do, once it has said so.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.state.capabilities()
    }

    pub fn session_id(&self) -> &str {
        &self.request.session_id
    }

    /// Snapshot for status reporting.
    pub fn info(&self) -> SessionInfo {
        self.state.info()
    }

    /// When the last message from the helper arrived.
    pub fn last_seen(&self) -> Instant {
        self.state.last_seen()
    }

    pub fn idle_duration(&self) -> Duration {
        self.state.idle_duration()
    }

    /// Sends a message that expects no reply.
    pub fn send_notify<P: Serialize + ?Sized>(&self, id: &str, msg_type: &str, payload: &P) -> Result<()> {
        self.channel
            .send_typed(id, msg_type, payload)
            .with_context(|| format!("Failed to send {msg_type}"))
    }

    /// Sends a command and waits up to `timeout` for the helper's reply with
    /// the same id.
    ///
    /// The reply is picked out of the stream by [`AuthenticatedSession::serve`],
    /// which must be running on another thread. Failures without a reply
    /// carry a [`CommandError`].
    pub fn send_command<P: Serialize + ?Sized>(
        &self,
        id: &str,
        msg_type: &str,
        payload: &P,
        timeout: Duration,
    ) -> Result<Envelope> {
        let (tx, rx) = mpsc::sync_channel(1);
        {
            let mut pending = lock(&self.pending);
            let Some(waiting) = pending.as_mut() else {
                return Err(CommandError::SessionClosed(id.to_string()).into());
            };
            if waiting.contains_key(id) {
                return Err(CommandError::DuplicateId(id.to_string()).into());
            }
            waiting.insert(id.to_string(), tx);
        }

        let reply = self
            .channel
            .send_typed(id, msg_type, payload)
            .with_context(|| format!("Failed to send {msg_type} command"))
            .and_then(|()| match rx.recv_timeout(timeout) {
                Ok(env) => Ok(env),
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(session_id = %self.request.session_id, id, ?timeout, "⚠️  Command timed out");
                    Err(CommandError::Timeout {
                        id: id.to_string(),
                        timeout,
                    }
                    .into())
                }
                Err(RecvTimeoutError::Disconnected) => Err(CommandError::SessionClosed(id.to_string()).into()),
            });

        if let Some(waiting) = lock(&self.pending).as_mut() {
            waiting.remove(id);
        }
        reply
    }

    /// Shuts the connection down. A running [`AuthenticatedSession::serve`]
    /// returns and commands still waiting fail with
    /// [`CommandError::SessionClosed`].
    pub fn close(&self) {
        self.state.close();
    }

    /// Receives until the helper leaves.
    ///
    /// Replies to commands from [`AuthenticatedSession::send_command`] go to
    /// their waiters. Otherwise `ping` is answered with `pong` and
    /// `capabilities` is recorded here; everything else goes to `handler`.
    /// Returns `Ok` on `disconnect` or a closed connection and an error on any
    /// protocol violation or handler failure. Either way the session leaves
    /// the broker's registry.
    pub fn serve<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(&SecureChannel<T>, Envelope) -> Result<()>,
    {
        tracing::debug!(session_id = %self.request.session_id, "Starting session receive loop...");

        let result = self.receive_loop(&mut handler);

        // Dropping the senders wakes every waiting command
        lock(&self.pending).take();
        lock(&self.registration).take();
        result
    }

    fn receive_loop<F>(&self, handler: &mut F) -> Result<()>
    where
        F: FnMut(&SecureChannel<T>, Envelope) -> Result<()>,
    {
        loop {
            let env = match self.channel.receive() {
                Ok(env) => env,
                Err(e) if e.is_disconnect() => {
                    tracing::info!(session_id = %self.request.session_id, "User helper disconnected");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.request.session_id,
                        identity = %self.identity.identity_key(),
                        protocol_violation = e.is_protocol_violation(),
                        error = %e,
                        "Session receive failed"
                    );
                    return Err(anyhow::Error::new(e).context("Failed to receive message"));
                }
            };
            self.state.touch();

            let Some(env) = self.deliver_reply(env) else {
                continue;
            };

            match env.msg_type.as_str() {
                types::PING => {
                    tracing::debug!("Responding to ping with pong");
                    self.channel.send(&mut Envelope::new(env.id, types::PONG))?;
                }
                types::CAPABILITIES => match env.decode_payload::<Capabilities>() {
                    Ok(caps) => {
                        tracing::info!(
                            session_id = %self.request.session_id,
                            can_notify = caps.can_notify,
                            can_tray = caps.can_tray,
                            can_capture = caps.can_capture,
                            can_clipboard = caps.can_clipboard,
                            display_server = %caps.display_server,
                            "Capabilities received"
                        );
                        self.state.set_capabilities(caps);
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %self.request.session_id, error = %e, "Invalid capabilities payload");
                    }
                },
                types::DISCONNECT => {
                    tracing::info!(session_id = %self.request.session_id, "User helper disconnecting");
                    return Ok(());
                }
                _ => handler(self.channel(), env)?,
            }
        }
    }

    /// Hands `env` to the command waiting on its id; returns it when nothing
    /// is waiting.
    fn deliver_reply(&self, env: Envelope) -> Option<Envelope> {
        let waiter = lock(&self.pending)
            .as_mut()
            .and_then(|waiting| waiting.remove(&env.id));
        let Some(waiter) = waiter else {
            return Some(env);
        };

        let id = env.id.clone();
        if waiter.try_send(env).is_err() {
            tracing::debug!(id = %id, "Command waiter gone, dropping reply");
        }
        None
    }
}

/// True when `scopes` names `scope` or holds the wildcard.
pub(crate) fn scope_granted(scopes: &[String], scope: &str) -> bool {
    scopes
        .iter()
        .any(|s| s == scope || s == WILDCARD_SCOPE)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn named_scopes_are_granted() {
        let granted = scopes(&["notify", "tray"]);
        assert!(scope_granted(&granted, "notify"));
        assert!(scope_granted(&granted, "tray"));
        assert!(!scope_granted(&granted, "clipboard"));
        assert!(!scope_granted(&[], "notify"));
    }

    #[test]
    fn wildcard_grants_everything() {
        let granted = scopes(&["*"]);
        assert!(scope_granted(&granted, "notify"));
        assert!(scope_granted(&granted, "run_as_user"));
        assert!(!scope_granted(&scopes(&["notify*"]), "notify-extra"));
    }

    #[test]
    fn command_errors_describe_the_command() {
        let err = CommandError::Timeout {
            id:      "cmd-1".into(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "command cmd-1 timed out after 2s");
        assert_eq!(
            CommandError::SessionClosed("cmd-2".into()).to_string(),
            "session closed while waiting for reply to cmd-2"
        );
    }
}
