use std::io;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

#[cfg(windows)]
use windows::Win32::{
    Foundation::{CloseHandle, ERROR_BROKEN_PIPE, HANDLE},
    Storage::FileSystem::{FlushFileBuffers, ReadFile, WriteFile},
    System::{
        Pipes::DisconnectNamedPipe,
        IO::CancelIoEx,
    },
};

use crate::{
    peer_identity::{IdentityError, PeerIdentity, ResolvePeer},
    secure_channel::Transport,
};

/// Cross-platform connected stream: a Unix domain socket or a named-pipe
/// handle. Wraps connections that already exist; it never binds or dials.
#[derive(Debug)]
pub enum PlatformSocket {
    #[cfg(unix)]
    /// Unix domain socket
    Unix(UnixStream),
    #[cfg(windows)]
    /// Windows named pipe handle, owned
    NamedPipe(HANDLE),
}

// SAFETY: a pipe handle may be used from any thread. Concurrent writes are
// serialized by the secure channel and only one reader runs at a time.
#[cfg(windows)]
unsafe impl Send for PlatformSocket {}
#[cfg(windows)]
unsafe impl Sync for PlatformSocket {}

#[cfg(unix)]
impl From<UnixStream> for PlatformSocket {
    fn from(stream: UnixStream) -> Self {
        PlatformSocket::Unix(stream)
    }
}

impl PlatformSocket {
    /// Takes ownership of a connected named-pipe handle.
    ///
    /// # Safety
    /// `handle` must be an open, connected pipe handle not owned elsewhere;
    /// it is closed when the socket is dropped.
    #[cfg(windows)]
    pub unsafe fn from_raw_pipe(handle: HANDLE) -> Self {
        PlatformSocket::NamedPipe(handle)
    }
}

impl Transport for PlatformSocket {
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.read_bytes(buf),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(handle) => {
                let mut bytes_read = 0u32;
                // SAFETY: ReadFile is safe when called with a valid handle, a
                // valid buffer slice, a stack out-pointer and no overlapped
                // structure (synchronous I/O).
                match unsafe { ReadFile(*handle, Some(buf), Some(&mut bytes_read as *mut u32), None) } {
                    Ok(()) => Ok(bytes_read as usize),
                    // The client closed its end: report EOF like a socket would.
                    Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() => Ok(0),
                    Err(e) => Err(io::Error::other(e)),
                }
            }
        }
    }

    fn write_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.write_bytes(buf),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(handle) => {
                let mut bytes_written = 0u32;
                // SAFETY: WriteFile is safe when called with a valid handle, a
                // valid buffer slice, a stack out-pointer and no overlapped
                // structure (synchronous I/O).
                unsafe { WriteFile(*handle, Some(buf), Some(&mut bytes_written as *mut u32), None) }
                    .map_err(io::Error::other)?;
                Ok(bytes_written as usize)
            }
        }
    }

    fn flush_bytes(&self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.flush_bytes(),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(handle) => {
                // SAFETY: FlushFileBuffers is safe with a valid handle.
                unsafe { FlushFileBuffers(*handle) }.map_err(io::Error::other)
            }
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.set_read_timeout(timeout),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(_) => {
                // Synchronous pipe handles have no per-call timeout; callers
                // bound a stuck read with shutdown() instead.
                tracing::debug!(?timeout, "read timeout not applied to named pipe");
                Ok(())
            }
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.set_write_timeout(timeout),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(_) => {
                tracing::debug!(?timeout, "write timeout not applied to named pipe");
                Ok(())
            }
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => Transport::shutdown(stream),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(handle) => {
                // SAFETY: CancelIoEx and DisconnectNamedPipe are safe with a
                // valid handle; both failing on an idle or client-side handle is
                // harmless.
                unsafe {
                    let _ = CancelIoEx(*handle, None);
                    let _ = DisconnectNamedPipe(*handle);
                }
                Ok(())
            }
        }
    }
}

impl ResolvePeer for PlatformSocket {
    fn resolve_peer(&self) -> Result<PeerIdentity, IdentityError> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.resolve_peer(),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(handle) => crate::peer_identity::peer_of_pipe(*handle),
        }
    }
}

#[cfg(windows)]
impl Drop for PlatformSocket {
    fn drop(&mut self) {
        let PlatformSocket::NamedPipe(handle) = self;
        // SAFETY: CloseHandle is safe with a valid handle to clean up resources.
        // Handle is guaranteed valid by enum variant construction.
        unsafe {
            let _ = CloseHandle(*handle);
        }
    }
}
