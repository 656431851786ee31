use std::{fs, io, os::fd::AsFd};

use nix::{
    sys::socket::{getsockopt, sockopt::PeerCredentials},
    unistd::{getgid, getuid},
};

use super::{IdentityError, PeerIdentity, PeerUser};

/// Reads SO_PEERCRED and resolves the binary through `/proc/<pid>/exe`.
pub(super) fn peer_of<F: AsFd>(socket: &F) -> Result<PeerIdentity, IdentityError> {
    let creds = getsockopt(socket, PeerCredentials).map_err(|errno| {
        IdentityError::CredentialQuery {
            call:   "getsockopt(SO_PEERCRED)",
            source: io::Error::from(errno),
        }
    })?;

    let pid = u32::try_from(creds.pid()).map_err(|_| IdentityError::CredentialQuery {
        call:   "getsockopt(SO_PEERCRED)",
        source: io::Error::new(
            io::ErrorKind::InvalidData,
            format!("kernel reported invalid peer pid {}", creds.pid()),
        ),
    })?;

    let exe_path = fs::read_link(format!("/proc/{pid}/exe")).map_err(|source| {
        IdentityError::PathResolution {
            call: "readlink(/proc/<pid>/exe)",
            pid,
            source,
        }
    })?;

    Ok(PeerIdentity::new(
        pid,
        PeerUser::Posix {
            uid: creds.uid(),
            gid: creds.gid(),
        },
        Some(exe_path),
    ))
}

pub(super) fn current() -> Result<PeerIdentity, IdentityError> {
    let pid = std::process::id();
    let exe_path = fs::read_link("/proc/self/exe").map_err(|source| {
        IdentityError::PathResolution {
            call: "readlink(/proc/self/exe)",
            pid,
            source,
        }
    })?;

    Ok(PeerIdentity::new(
        pid,
        PeerUser::Posix {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
        },
        Some(exe_path),
    ))
}
