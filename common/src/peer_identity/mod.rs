//! Kernel-verified identity of the process on the other end of a connection.
//!
//! One body per target OS is selected at compile time. Every field of a
//! [`PeerIdentity`] comes from an OS call made by *this* process against the
//! peer of a specific connection object, never from bytes the peer sent.

use std::{
    fmt, io,
    net::TcpStream,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use thiserror::Error;

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod sys;

#[cfg(target_os = "macos")]
#[path = "macos.rs"]
mod sys;

#[cfg(windows)]
#[path = "windows.rs"]
mod sys;

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
#[path = "unsupported.rs"]
mod sys;

#[cfg(windows)]
pub(crate) use sys::peer_of_pipe;

/// Errors raised while resolving a peer identity. All of them are fatal for
/// the connection; no partial identity is ever returned.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Peer credentials are not available for a {0} connection")]
    UnsupportedConnection(&'static str),

    #[error("Peer credential extraction is not supported on this platform")]
    UnsupportedPlatform,

    #[error("Kernel credential query {call} failed: {source}")]
    CredentialQuery {
        call:   &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Failed to resolve executable path for PID {pid} via {call}: {source}")]
    PathResolution {
        call:   &'static str,
        pid:    u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read security identifier for PID {pid} via {call}: {source}")]
    TokenQuery {
        call:   &'static str,
        pid:    u32,
        #[source]
        source: io::Error,
    },
}

/// User identity as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerUser {
    /// Numeric user and group ids (Linux, macOS)
    Posix { uid: u32, gid: u32 },
    /// Security identifier string such as `S-1-5-21-...` (Windows)
    Windows { sid: String },
}

/// Verified PID, user and executable path of a connected process.
///
/// Built once per connection right after accept and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pid:      u32,
    user:     PeerUser,
    exe_path: Option<PathBuf>,
}

impl PeerIdentity {
    pub(crate) fn new(pid: u32, user: PeerUser, exe_path: Option<PathBuf>) -> Self {
        Self {
            pid,
            user,
            exe_path,
        }
    }

    /// Process id of the peer.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// User identity of the peer.
    pub fn user(&self) -> &PeerUser {
        &self.user
    }

    /// Numeric UID on POSIX platforms.
    pub fn uid(&self) -> Option<u32> {
        match self.user {
            PeerUser::Posix { uid, .. } => Some(uid),
            PeerUser::Windows { .. } => None,
        }
    }

    /// Numeric GID on POSIX platforms.
    pub fn gid(&self) -> Option<u32> {
        match self.user {
            PeerUser::Posix { gid, .. } => Some(gid),
            PeerUser::Windows { .. } => None,
        }
    }

    /// Security identifier on Windows.
    pub fn sid(&self) -> Option<&str> {
        match &self.user {
            PeerUser::Windows { sid } => Some(sid),
            PeerUser::Posix { .. } => None,
        }
    }

    /// Absolute path of the peer's executable.
    ///
    /// `None` when the resolver runs in degraded mode and could not look the
    /// path up; callers decide whether to deny such peers.
    pub fn exe_path(&self) -> Option<&Path> {
        self.exe_path.as_deref()
    }

    /// True when the executable path was resolved by the OS.
    pub fn has_verified_path(&self) -> bool {
        self.exe_path.is_some()
    }

    /// Key used for rate limiting and logging: decimal UID on POSIX, SID on
    /// Windows. Treat it as an opaque string.
    pub fn identity_key(&self) -> String {
        match &self.user {
            PeerUser::Posix { uid, .. } => uid.to_string(),
            PeerUser::Windows { sid } => sid.clone(),
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            PeerUser::Posix { uid, gid } => write!(f, "pid={} uid={} gid={}", self.pid, uid, gid)?,
            PeerUser::Windows { sid } => write!(f, "pid={} sid={}", self.pid, sid)?,
        }
        match &self.exe_path {
            Some(path) => write!(f, " path={}", path.display()),
            None => write!(f, " path=<unverified>"),
        }
    }
}

/// Connections whose peer the OS can identify.
pub trait ResolvePeer {
    /// Asks the OS who is on the other end of this connection.
    fn resolve_peer(&self) -> Result<PeerIdentity, IdentityError>;
}

/// Resolves the kernel-verified identity of `conn`'s peer.
pub fn resolve<C: ResolvePeer + ?Sized>(conn: &C) -> Result<PeerIdentity, IdentityError> {
    let identity = conn.resolve_peer()?;
    tracing::debug!(%identity, "resolved peer identity");
    Ok(identity)
}

/// Identity of the current process, as the helper reports it about itself.
pub fn local_identity() -> Result<PeerIdentity, IdentityError> {
    sys::current()
}

#[cfg(unix)]
impl ResolvePeer for UnixStream {
    fn resolve_peer(&self) -> Result<PeerIdentity, IdentityError> {
        sys::peer_of(self)
    }
}

impl ResolvePeer for TcpStream {
    fn resolve_peer(&self) -> Result<PeerIdentity, IdentityError> {
        Err(IdentityError::UnsupportedConnection("TCP"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_is_decimal_uid_on_posix() {
        let identity = PeerIdentity::new(
            42,
            PeerUser::Posix { uid: 1000, gid: 100 },
            Some(PathBuf::from("/usr/bin/helper")),
        );
        assert_eq!(identity.identity_key(), "1000");
        assert_eq!(identity.uid(), Some(1000));
        assert_eq!(identity.gid(), Some(100));
        assert_eq!(identity.sid(), None);
        assert!(identity.has_verified_path());
    }

    #[test]
    fn identity_key_is_sid_on_windows() {
        let identity = PeerIdentity::new(
            7,
            PeerUser::Windows {
                sid: "S-1-5-21-1004336348-1177238915-682003330-512".into(),
            },
            None,
        );
        assert_eq!(
            identity.identity_key(),
            "S-1-5-21-1004336348-1177238915-682003330-512"
        );
        assert_eq!(identity.uid(), None);
        assert!(!identity.has_verified_path());
        assert!(identity.to_string().ends_with("path=<unverified>"));
    }

    #[test]
    fn tcp_connections_are_rejected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        assert!(matches!(
            resolve(&server),
            Err(IdentityError::UnsupportedConnection("TCP"))
        ));
        drop(client);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn socketpair_peer_is_this_process() {
        let (a, _b) = UnixStream::pair().unwrap();
        let identity = resolve(&a).unwrap();
        let local = local_identity().unwrap();

        assert_eq!(identity.pid(), std::process::id());
        assert_eq!(identity.uid(), local.uid());
        assert_eq!(identity.gid(), local.gid());
        assert_eq!(identity.identity_key(), local.identity_key());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn socketpair_peer_path_is_current_exe() {
        let (a, _b) = UnixStream::pair().unwrap();
        let identity = resolve(&a).unwrap();
        let expected = std::env::current_exe().unwrap();
        assert_eq!(identity.exe_path(), Some(expected.as_path()));
    }
}
