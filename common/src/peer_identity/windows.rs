use std::{ffi::OsString, io, os::windows::ffi::OsStringExt, path::PathBuf};

use windows::{
    core::PWSTR,
    Win32::{
        Foundation::{CloseHandle, LocalFree, HANDLE, HLOCAL},
        Security::{
            Authorization::ConvertSidToStringSidW, GetTokenInformation, TokenUser, TOKEN_QUERY,
            TOKEN_USER,
        },
        System::{
            Pipes::GetNamedPipeClientProcessId,
            Threading::{
                OpenProcess, OpenProcessToken, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
                PROCESS_QUERY_LIMITED_INFORMATION,
            },
        },
    },
};

use super::{IdentityError, PeerIdentity, PeerUser};

/// Closes the wrapped handle on drop.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned open by OpenProcess/OpenProcessToken
        // and is closed exactly once here.
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn os_error(err: windows::core::Error) -> io::Error {
    io::Error::other(err)
}

/// Maps a connected pipe handle to its client process and inspects it.
pub(crate) fn peer_of_pipe(pipe: HANDLE) -> Result<PeerIdentity, IdentityError> {
    let mut client_pid = 0u32;

    // SAFETY: GetNamedPipeClientProcessId is safe when called with a valid pipe
    // handle and a mutable reference to u32.
    unsafe { GetNamedPipeClientProcessId(pipe, &mut client_pid) }.map_err(|e| {
        IdentityError::CredentialQuery {
            call:   "GetNamedPipeClientProcessId",
            source: os_error(e),
        }
    })?;

    identity_of_process(client_pid)
}

pub(super) fn current() -> Result<PeerIdentity, IdentityError> {
    identity_of_process(std::process::id())
}

fn identity_of_process(pid: u32) -> Result<PeerIdentity, IdentityError> {
    // SAFETY: OpenProcess is safe with any PID; failure is reported as Err.
    let process = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) }
        .map_err(|e| IdentityError::PathResolution {
            call: "OpenProcess",
            pid,
            source: os_error(e),
        })?;
    let process = OwnedHandle(process);

    let exe_path = image_path(&process, pid)?;
    let sid = token_sid(&process, pid)?;

    Ok(PeerIdentity::new(
        pid,
        PeerUser::Windows { sid },
        Some(exe_path),
    ))
}

fn image_path(process: &OwnedHandle, pid: u32) -> Result<PathBuf, IdentityError> {
    let mut buffer = vec![0u16; 32 * 1024];
    let mut size = buffer.len() as u32;

    // SAFETY: the buffer pointer and size describe a live, writable allocation
    // and the process handle is open with query rights.
    unsafe {
        QueryFullProcessImageNameW(
            process.0,
            PROCESS_NAME_WIN32,
            PWSTR(buffer.as_mut_ptr()),
            &mut size,
        )
    }
    .map_err(|e| IdentityError::PathResolution {
        call: "QueryFullProcessImageNameW",
        pid,
        source: os_error(e),
    })?;

    buffer.truncate(size as usize);
    Ok(OsString::from_wide(&buffer).into())
}

fn token_sid(process: &OwnedHandle, pid: u32) -> Result<String, IdentityError> {
    let token_error = |call: &'static str, source: io::Error| IdentityError::TokenQuery {
        call,
        pid,
        source,
    };

    let mut token = HANDLE::default();
    // SAFETY: the process handle is open and token is a valid out pointer.
    unsafe { OpenProcessToken(process.0, TOKEN_QUERY, &mut token) }
        .map_err(|e| token_error("OpenProcessToken", os_error(e)))?;
    let token = OwnedHandle(token);

    // The first call only reports the required buffer size.
    let mut needed = 0u32;
    // SAFETY: a null buffer with zero length is the documented size query.
    let _ = unsafe { GetTokenInformation(token.0, TokenUser, None, 0, &mut needed) };
    if needed == 0 {
        return Err(token_error("GetTokenInformation", io::Error::last_os_error()));
    }

    // u64 backing keeps the TOKEN_USER pointer fields aligned.
    let mut buffer = vec![0u64; (needed as usize).div_ceil(8)];
    // SAFETY: buffer holds at least `needed` bytes and stays alive for the call.
    unsafe {
        GetTokenInformation(
            token.0,
            TokenUser,
            Some(buffer.as_mut_ptr().cast()),
            needed,
            &mut needed,
        )
    }
    .map_err(|e| token_error("GetTokenInformation", os_error(e)))?;

    // SAFETY: GetTokenInformation(TokenUser) filled the buffer with a TOKEN_USER
    // whose SID pointer refers into the same buffer.
    let user = unsafe { &*(buffer.as_ptr() as *const TOKEN_USER) };

    let mut sid_text = PWSTR::null();
    // SAFETY: user.User.Sid is valid while buffer lives; sid_text receives a
    // LocalAlloc'd string that is freed below.
    unsafe { ConvertSidToStringSidW(user.User.Sid, &mut sid_text) }
        .map_err(|e| token_error("ConvertSidToStringSidW", os_error(e)))?;

    // SAFETY: sid_text is a valid NUL-terminated wide string until LocalFree.
    let sid = unsafe { sid_text.to_string() };
    // SAFETY: sid_text was allocated by ConvertSidToStringSidW.
    unsafe {
        let _ = LocalFree(HLOCAL(sid_text.0.cast()));
    }

    sid.map_err(|e| {
        token_error(
            "ConvertSidToStringSidW",
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })
}
