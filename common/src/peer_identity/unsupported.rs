use super::{IdentityError, PeerIdentity};

#[cfg(unix)]
pub(super) fn peer_of<F>(_socket: &F) -> Result<PeerIdentity, IdentityError> {
    Err(IdentityError::UnsupportedPlatform)
}

pub(super) fn current() -> Result<PeerIdentity, IdentityError> {
    Err(IdentityError::UnsupportedPlatform)
}
