use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError, RwLock,
    },
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;

use crate::protocol::{Envelope, MAX_MESSAGE_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// Length of a session key in bytes (256 bits).
pub const SESSION_KEY_LEN: usize = 32;

// Hex length of an HMAC-SHA256 tag.
const TAG_HEX_LEN: usize = 64;

/// Shared secret used to sign and verify envelopes on one connection.
pub type SessionKey = [u8; SESSION_KEY_LEN];

/// Key used before authentication completes. Pre-auth envelopes are still
/// tag-checked for integrity but carry no secrecy.
pub const ZERO_KEY: SessionKey = [0u8; SESSION_KEY_LEN];

/// Errors produced by [`SecureChannel`].
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The underlying read or write failed
    #[error("Failed to {op}: {source}")]
    Io {
        op:     &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Zero-length message")]
    ZeroLength,

    #[error("HMAC mismatch")]
    TagMismatch,

    #[error("Sequence number {seq} <= last {last} (replay/duplicate)")]
    SequenceReplay { seq: u64, last: u64 },

    #[error("Failed to generate session key: {0}")]
    KeyGeneration(#[source] rand::Error),
}

impl ChannelError {
    /// True for errors that mean the peer broke the framing, signing or
    /// sequencing rules. The connection should be closed.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ChannelError::Malformed(_)
                | ChannelError::MessageTooLarge { .. }
                | ChannelError::ZeroLength
                | ChannelError::TagMismatch
                | ChannelError::SequenceReplay { .. }
        )
    }

    /// True when the peer went away (EOF, reset or broken pipe).
    pub fn is_disconnect(&self) -> bool {
        match self {
            ChannelError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// True when a read or write timeout expired.
    pub fn is_timeout(&self) -> bool {
        match self {
            ChannelError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// A connected duplex byte stream the secure channel can run over.
///
/// All methods take `&self` so that one reader and several writers can share
/// the stream; the channel serializes writers itself. Timeouts are passed
/// straight through and are the only way to bound a blocking call.
pub trait Transport {
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_bytes(&self, buf: &[u8]) -> io::Result<usize>;
    fn flush_bytes(&self) -> io::Result<()>;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// Closes both directions, unblocking any in-flight read or write.
    fn shutdown(&self) -> io::Result<()>;
}

#[cfg(unix)]
impl Transport for UnixStream {
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&mut &*self).read(buf)
    }

    fn write_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        (&mut &*self).write(buf)
    }

    fn flush_bytes(&self) -> io::Result<()> {
        (&mut &*self).flush()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }
}

impl Transport for TcpStream {
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&mut &*self).read(buf)
    }

    fn write_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        (&mut &*self).write(buf)
    }

    fn flush_bytes(&self) -> io::Result<()> {
        (&mut &*self).flush()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Borrowing adapter so `read_exact`/`write_all` work over `&dyn Transport`.
struct Io<'a, T: ?Sized>(&'a T);

impl<T: Transport + ?Sized> Read for Io<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read_bytes(buf)
    }
}

impl<T: Transport + ?Sized> Write for Io<'_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_bytes(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush_bytes()
    }
}

/// Length-prefixed JSON framing with per-message HMAC and sequence checks.
///
/// A fresh channel is in pre-auth mode and signs with [`ZERO_KEY`]. Once the
/// handshake has produced a session key, both ends install it with
/// [`SecureChannel::set_session_key`]; there is no way back to pre-auth.
///
/// `send` may be called from several threads at once. Only one `receive`
/// should be in flight at a time; concurrent receivers are serialized.
pub struct SecureChannel<T> {
    transport:   T,
    session_key: RwLock<Option<SessionKey>>,
    send_seq:    AtomicU64,
    recv_seq:    Mutex<Option<u64>>,
    write_lock:  Mutex<()>,
}

impl<T: Transport> SecureChannel<T> {
    /// Wraps a connected transport in pre-auth mode.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            session_key: RwLock::new(None),
            send_seq: AtomicU64::new(0),
            recv_seq: Mutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Installs the session key for all subsequent sends and receives.
    pub fn set_session_key(&self, key: SessionKey) {
        *self
            .session_key
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(key);
    }

    /// Returns the installed session key, if any.
    pub fn session_key(&self) -> Option<SessionKey> {
        *self
            .session_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// True once a session key has been installed.
    pub fn is_authenticated(&self) -> bool {
        self.session_key().is_some()
    }

    fn current_key(&self) -> SessionKey {
        self.session_key().unwrap_or(ZERO_KEY)
    }

    /// Signs, sequences and writes an envelope as `[u32 BE length][JSON]`.
    ///
    /// The sequence number and tag are written into `env`. An envelope whose
    /// encoding exceeds [`MAX_MESSAGE_SIZE`] is rejected before anything is
    /// written to the transport.
    pub fn send(&self, env: &mut Envelope) -> Result<(), ChannelError> {
        // Sequence numbers are taken under the write lock so wire order always
        // matches sequence order, even with concurrent senders.
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        env.seq = self.send_seq.fetch_add(1, Ordering::SeqCst) + 1;
        env.hmac = compute_tag(
            &self.current_key(),
            &env.id,
            env.seq,
            &env.msg_type,
            env.payload_bytes(),
        );

        let data = serde_json::to_vec(env).map_err(ChannelError::Encode)?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ChannelError::MessageTooLarge {
                size: data.len(),
                max:  MAX_MESSAGE_SIZE,
            });
        }

        let header = (data.len() as u32).to_be_bytes();
        let mut io = Io(&self.transport);
        io.write_all(&header).map_err(|source| ChannelError::Io {
            op: "write message length",
            source,
        })?;
        io.write_all(&data).map_err(|source| ChannelError::Io {
            op: "write message data",
            source,
        })?;
        io.flush().map_err(|source| ChannelError::Io {
            op: "flush stream",
            source,
        })?;

        tracing::debug!(id = %env.id, seq = env.seq, msg_type = %env.msg_type, "sent envelope");
        Ok(())
    }

    /// Reads one frame, verifies its tag and enforces sequence monotonicity.
    ///
    /// The first envelope accepted on a channel sets the baseline and is not
    /// bounded from below; every later one must carry a strictly greater
    /// sequence number.
    pub fn receive(&self) -> Result<Envelope, ChannelError> {
        let mut last_seq = self
            .recv_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut io = Io(&self.transport);

        let mut header = [0u8; 4];
        io.read_exact(&mut header)
            .map_err(|source| ChannelError::Io {
                op: "read message length",
                source,
            })?;

        let length = u32::from_be_bytes(header) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(ChannelError::MessageTooLarge {
                size: length,
                max:  MAX_MESSAGE_SIZE,
            });
        }
        if length == 0 {
            return Err(ChannelError::ZeroLength);
        }

        let mut data = vec![0u8; length];
        io.read_exact(&mut data)
            .map_err(|source| ChannelError::Io {
                op: "read message data",
                source,
            })?;

        let env: Envelope = serde_json::from_slice(&data).map_err(ChannelError::Malformed)?;

        verify_tag(&self.current_key(), &env)?;

        if let Some(last) = *last_seq {
            if env.seq <= last {
                tracing::warn!(seq = env.seq, last, "rejecting replayed or duplicate envelope");
                return Err(ChannelError::SequenceReplay { seq: env.seq, last });
            }
        }
        *last_seq = Some(env.seq);

        tracing::debug!(id = %env.id, seq = env.seq, msg_type = %env.msg_type, "received envelope");
        Ok(env)
    }

    /// Serializes `payload` into a new envelope and sends it.
    pub fn send_typed<P: Serialize + ?Sized>(
        &self,
        id: &str,
        msg_type: &str,
        payload: &P,
    ) -> Result<(), ChannelError> {
        let mut env = Envelope::new(id, msg_type)
            .with_payload(payload)
            .map_err(ChannelError::Encode)?;
        self.send(&mut env)
    }

    /// Sends an envelope with `message` in its error field and no payload.
    pub fn send_error(&self, id: &str, msg_type: &str, message: &str) -> Result<(), ChannelError> {
        let mut env = Envelope::new(id, msg_type).with_error(message);
        self.send(&mut env)
    }

    /// Sets the read timeout on the underlying transport.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.transport.set_read_timeout(timeout)
    }

    /// Sets the write timeout on the underlying transport.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.transport.set_write_timeout(timeout)
    }

    /// Sets both read and write timeouts.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.transport.set_read_timeout(timeout)?;
        self.transport.set_write_timeout(timeout)
    }

    /// Shuts down the underlying transport.
    pub fn shutdown(&self) -> io::Result<()> {
        self.transport.shutdown()
    }

    /// Borrows the underlying transport.
    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    /// Unwraps the underlying transport.
    pub fn into_inner(self) -> T {
        self.transport
    }
}

impl<T: fmt::Debug> fmt::Debug for SecureChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let authenticated = self
            .session_key
            .read()
            .map(|key| key.is_some())
            .unwrap_or(false);
        f.debug_struct("SecureChannel")
            .field("transport", &self.transport)
            .field("authenticated", &authenticated)
            .field("send_seq", &self.send_seq.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Computes the hex HMAC-SHA256 of `id || seq (decimal) || type || payload`.
pub fn compute_tag(key: &SessionKey, id: &str, seq: u64, msg_type: &str, payload: &[u8]) -> String {
    hex::encode(tag_mac(key, id, seq, msg_type, payload).finalize().into_bytes())
}

fn tag_mac(key: &SessionKey, id: &str, seq: u64, msg_type: &str, payload: &[u8]) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(id.as_bytes());
    mac.update(seq.to_string().as_bytes());
    mac.update(msg_type.as_bytes());
    mac.update(payload);
    mac
}

/// Checks an envelope's tag in constant time. Only the canonical form, 64
/// lowercase hex digits, is accepted.
pub fn verify_tag(key: &SessionKey, env: &Envelope) -> Result<(), ChannelError> {
    if !is_canonical_tag(&env.hmac) {
        return Err(ChannelError::TagMismatch);
    }
    let claimed = hex::decode(&env.hmac).map_err(|_| ChannelError::TagMismatch)?;
    tag_mac(key, &env.id, env.seq, &env.msg_type, env.payload_bytes())
        .verify_slice(&claimed)
        .map_err(|_| ChannelError::TagMismatch)
}

fn is_canonical_tag(tag: &str) -> bool {
    tag.len() == TAG_HEX_LEN && tag.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Returns 32 bytes from the operating system's secure random source.
pub fn generate_session_key() -> Result<SessionKey, ChannelError> {
    let mut key = [0u8; SESSION_KEY_LEN];
    OsRng
        .try_fill_bytes(&mut key)
        .map_err(ChannelError::KeyGeneration)?;
    Ok(key)
}
