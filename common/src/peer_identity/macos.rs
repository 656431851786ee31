use std::{
    io, mem,
    os::unix::io::{AsRawFd, RawFd},
    path::PathBuf,
};

use nix::unistd::{getgid, getuid};

use super::{IdentityError, PeerIdentity, PeerUser};

/// Reads LOCAL_PEERPID and getpeereid, then resolves the binary with
/// `proc_pidpath` (or leaves it unverified under `no-libproc`).
pub(super) fn peer_of<F: AsRawFd>(socket: &F) -> Result<PeerIdentity, IdentityError> {
    let fd = socket.as_raw_fd();
    let pid = peer_pid(fd)?;

    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;

    // SAFETY: getpeereid is safe to call with a valid file descriptor and
    // mutable references to uid_t and gid_t. fd is borrowed from a live socket
    // and uid/gid are initialized stack variables.
    let result = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
    if result != 0 {
        return Err(IdentityError::CredentialQuery {
            call:   "getpeereid",
            source: io::Error::last_os_error(),
        });
    }

    let exe_path = executable_path(pid)?;
    tracing::debug!("macOS peer credentials: PID={}, UID={}", pid, uid);

    Ok(PeerIdentity::new(pid, PeerUser::Posix { uid, gid }, exe_path))
}

fn peer_pid(fd: RawFd) -> Result<u32, IdentityError> {
    let mut pid: libc::pid_t = 0;
    let mut pid_len = mem::size_of::<libc::pid_t>() as libc::socklen_t;

    // SAFETY: getsockopt is safe when called with:
    // - a valid file descriptor
    // - a valid socket level and option (SOL_LOCAL, LOCAL_PEERPID)
    // - a buffer pointer and size describing the pid stack variable
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_LOCAL,
            libc::LOCAL_PEERPID,
            &mut pid as *mut _ as *mut libc::c_void,
            &mut pid_len,
        )
    };

    if result != 0 {
        return Err(IdentityError::CredentialQuery {
            call:   "getsockopt(LOCAL_PEERPID)",
            source: io::Error::last_os_error(),
        });
    }

    u32::try_from(pid).map_err(|_| IdentityError::CredentialQuery {
        call:   "getsockopt(LOCAL_PEERPID)",
        source: io::Error::new(
            io::ErrorKind::InvalidData,
            format!("kernel reported invalid peer pid {pid}"),
        ),
    })
}

#[cfg(not(feature = "no-libproc"))]
fn executable_path(pid: u32) -> Result<Option<PathBuf>, IdentityError> {
    use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

    // PROC_PIDPATHINFO_MAXSIZE
    let mut path_buf = [0u8; 4 * 1024];

    // SAFETY: proc_pidpath is safe when called with a valid PID, buffer pointer
    // and size. path_buf is a stack array and its length matches the size
    // parameter.
    let ret = unsafe {
        libc::proc_pidpath(
            pid as libc::c_int,
            path_buf.as_mut_ptr() as *mut libc::c_void,
            path_buf.len() as u32,
        )
    };

    if ret <= 0 {
        return Err(IdentityError::PathResolution {
            call: "proc_pidpath",
            pid,
            source: io::Error::last_os_error(),
        });
    }

    let path = OsStr::from_bytes(&path_buf[..ret as usize]);
    Ok(Some(PathBuf::from(path)))
}

#[cfg(feature = "no-libproc")]
fn executable_path(pid: u32) -> Result<Option<PathBuf>, IdentityError> {
    tracing::debug!(pid, "libproc disabled, peer executable path left unverified");
    Ok(None)
}

pub(super) fn current() -> Result<PeerIdentity, IdentityError> {
    let pid = std::process::id();
    let exe_path = std::env::current_exe().map_err(|source| IdentityError::PathResolution {
        call: "current_exe",
        pid,
        source,
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
