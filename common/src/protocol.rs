//! Wire vocabulary shared by the broker and the user helper.
//!
//! Every frame on the wire is `[4-byte big-endian length][JSON envelope]`.
//! The envelope payload is carried byte-exact as raw JSON; this layer never
//! interprets it beyond the handshake types defined here.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::value::RawValue;

/// Message type constants for IPC communication.
pub mod types {
    pub const AUTH_REQUEST: &str = "auth_request";
    pub const AUTH_RESPONSE: &str = "auth_response";
    pub const COMMAND: &str = "command";
    pub const COMMAND_RESULT: &str = "command_result";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const CAPABILITIES: &str = "capabilities";
    pub const DISCONNECT: &str = "disconnect";

    // Notifications and tray
    pub const NOTIFY: &str = "notify";
    pub const NOTIFY_RESULT: &str = "notify_result";
    pub const TRAY_UPDATE: &str = "tray_update";
    pub const TRAY_ACTION: &str = "tray_action";

    // Desktop and clipboard
    pub const DESKTOP_START: &str = "desktop_start";
    pub const DESKTOP_FRAME: &str = "desktop_frame";
    pub const DESKTOP_INPUT: &str = "desktop_input";
    pub const DESKTOP_STOP: &str = "desktop_stop";
    pub const CLIPBOARD_GET: &str = "clipboard_get";
    pub const CLIPBOARD_DATA: &str = "clipboard_data";
    pub const CLIPBOARD_SET: &str = "clipboard_set";

    // Secure attention sequence, requested by the helper
    pub const SAS_REQUEST: &str = "sas_request";
    pub const SAS_RESPONSE: &str = "sas_response";
}

/// Maximum size of an encoded envelope (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of a binary channel frame (4 MiB).
pub const MAX_BINARY_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Current IPC protocol version, exchanged in [`AuthRequest`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire-format wrapper for all IPC messages.
///
/// `seq` and `hmac` are owned by the secure channel: they are assigned at
/// send time and checked at receive time, so they have no public setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Caller-assigned correlation id
    pub id:       String,
    #[serde(default)]
    pub(crate) seq: u64,
    /// Message kind, one of [`types`] or an application-defined tag
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Opaque payload, passed through untouched
    #[serde(default)]
    pub payload:  Option<Box<RawValue>>,
    /// Error text; omitted from the wire when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error:    String,
    #[serde(default)]
    pub(crate) hmac: String,
}

impl Envelope {
    /// Creates an envelope with no payload.
    pub fn new(id: impl Into<String>, msg_type: impl Into<String>) -> Self {
        Self {
            id:       id.into(),
            seq:      0,
            msg_type: msg_type.into(),
            payload:  None,
            error:    String::new(),
            hmac:     String::new(),
        }
    }

    /// Serializes `payload` into the envelope.
    pub fn with_payload<T: Serialize + ?Sized>(mut self, payload: &T) -> serde_json::Result<Self> {
        self.payload = Some(serde_json::value::to_raw_value(payload)?);
        Ok(self)
    }

    /// Uses already-encoded JSON as the payload, byte for byte.
    pub fn with_raw_payload(mut self, payload: Box<RawValue>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the error text.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    /// Sequence number assigned by the sending channel (0 before send).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Hex HMAC-SHA256 tag computed by the sending channel.
    pub fn hmac(&self) -> &str {
        &self.hmac
    }

    /// Raw payload bytes as covered by the authentication tag.
    ///
    /// An absent (or JSON `null`) payload is the empty byte string.
    pub fn payload_bytes(&self) -> &[u8] {
        // A serialized `null` decodes back to no payload, so both must sign
        // the same bytes.
        self.payload
            .as_deref()
            .map(RawValue::get)
            .filter(|raw| *raw != "null")
            .map(str::as_bytes)
            .unwrap_or_default()
    }

    /// Decodes the payload into a typed value.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        match self.payload.as_deref() {
            Some(raw) => serde_json::from_str(raw.get()),
            None => serde_json::from_str("null"),
        }
    }

    /// Returns true if the envelope carries an error.
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Sent by the user helper to the broker right after connecting.
///
/// Every identity field here is a *claim*; the broker cross-checks it against
/// the kernel-verified peer identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub protocol_version: u32,
    pub uid:              u32,
    /// Windows security identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sid:              String,
    pub username:         String,
    pub session_id:       String,
    pub display_env:      String,
    pub pid:              u32,
    pub binary_hash:      String,
    /// Windows session id (1, 2, ...)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub win_session_id:   u32,
}

/// Sent by the broker back to the user helper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub accepted:       bool,
    /// Hex-encoded 32-byte session key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_key:    String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id:       String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason:         String,
}

impl AuthResponse {
    /// A rejection carrying `reason`.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
            ..Self::default()
        }
    }
}

/// Sent by the user helper after successful authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub can_notify:     bool,
    pub can_tray:       bool,
    pub can_capture:    bool,
    pub can_clipboard:  bool,
    pub display_server: String,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip_preserves_fields() {
        let mut env = Envelope::new("req-7", types::COMMAND)
            .with_payload(&serde_json::json!({"cmd": "ls", "args": ["-l"]}))
            .unwrap()
            .with_error("boom");
        env.seq = 42;
        env.hmac = "ab".repeat(32);

        let encoded = serde_json::to_vec(&env).unwrap();
        let decoded: Envelope = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded.id, "req-7");
        assert_eq!(decoded.seq(), 42);
        assert_eq!(decoded.msg_type, types::COMMAND);
        assert_eq!(decoded.payload_bytes(), env.payload_bytes());
        assert_eq!(decoded.error, "boom");
        assert_eq!(decoded.hmac(), env.hmac());
    }

    #[test]
    fn empty_error_is_omitted_on_the_wire() {
        let env = Envelope::new("1", types::PING);
        let text = serde_json::to_string(&env).unwrap();
        assert!(!text.contains("\"error\""));
        assert!(text.contains("\"type\":\"ping\""));
        assert!(text.contains("\"hmac\""));
    }

    #[test]
    fn raw_payload_is_kept_byte_exact() {
        let raw = RawValue::from_string("{ \"b\" : 1,\"a\":2 }".to_string()).unwrap();
        let env = Envelope::new("1", types::NOTIFY).with_raw_payload(raw);
        let decoded: Envelope = serde_json::from_slice(&serde_json::to_vec(&env).unwrap()).unwrap();
        assert_eq!(decoded.payload_bytes(), b"{ \"b\" : 1,\"a\":2 }");
    }

    #[test]
    fn null_payload_has_no_bytes() {
        let decoded: Envelope =
            serde_json::from_str(r#"{"id":"x","seq":1,"type":"pong","payload":null,"hmac":""}"#)
                .unwrap();
        assert!(decoded.payload.is_none());
        assert!(decoded.payload_bytes().is_empty());
    }

    #[test]
    fn serialized_null_signs_like_absent() {
        let env = Envelope::new("x", types::PING).with_payload(&()).unwrap();
        assert!(env.payload.is_some());
        assert!(env.payload_bytes().is_empty());
    }

    #[test]
    fn auth_request_uses_camel_case() {
        let req = AuthRequest {
            protocol_version: PROTOCOL_VERSION,
            uid: 1000,
            username: "alice".into(),
            session_id: "helper-alice-42".into(),
            pid: 42,
            ..AuthRequest::default()
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["protocolVersion"], 1);
        assert_eq!(value["sessionId"], "helper-alice-42");
        assert!(value.get("sid").is_none());
        assert!(value.get("winSessionId").is_none());
    }

    #[test]
    fn typed_payload_decodes() {
        let caps = Capabilities {
            can_notify: true,
            display_server: "x11".into(),
            ..Capabilities::default()
        };
        let env = Envelope::new("caps", types::CAPABILITIES).with_payload(&caps).unwrap();
        let back: Capabilities = env.decode_payload().unwrap();
        assert_eq!(back, caps);
    }
}
