use std::{
    collections::HashSet,
    io::{self, Read, Write},
    sync::Arc,
    thread,
    time::Duration,
};

use serde_json::json;
use warden_common::{
    generate_session_key,
    protocol::{types, AuthRequest, AuthResponse, Envelope, MAX_MESSAGE_SIZE, PROTOCOL_VERSION},
    secure_channel::compute_tag,
    ChannelError, SecureChannel, SessionKey, ZERO_KEY,
};

#[cfg(unix)]
type Stream = std::os::unix::net::UnixStream;

#[cfg(unix)]
fn pair() -> (Stream, Stream) {
    Stream::pair().expect("socketpair")
}

#[cfg(not(unix))]
type Stream = std::net::TcpStream;

#[cfg(not(unix))]
fn pair() -> (Stream, Stream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("listen");
    let client = Stream::connect(listener.local_addr().unwrap()).expect("dial");
    let (server, _) = listener.accept().expect("accept");
    (server, client)
}

fn channels() -> (SecureChannel<Stream>, SecureChannel<Stream>) {
    let (a, b) = pair();
    (SecureChannel::new(a), SecureChannel::new(b))
}

/// Writes a hand-built, correctly framed envelope signed under `key`.
fn write_signed_frame(
    stream: &mut Stream,
    key: &SessionKey,
    id: &str,
    seq: u64,
    msg_type: &str,
    payload: serde_json::Value,
) {
    let payload_text = if payload.is_null() {
        String::new()
    } else {
        serde_json::to_string(&payload).unwrap()
    };
    let body = json!({
        "id": id,
        "seq": seq,
        "type": msg_type,
        "payload": payload,
        "hmac": compute_tag(key, id, seq, msg_type, payload_text.as_bytes()),
    });
    write_frame(stream, &serde_json::to_vec(&body).unwrap());
}

fn write_frame(stream: &mut Stream, body: &[u8]) {
    stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .unwrap();
    stream.write_all(body).unwrap();
}

fn read_frame(stream: &mut Stream) -> ([u8; 4], Vec<u8>) {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut body).unwrap();
    (header, body)
}

#[test]
fn send_and_receive() {
    let (server, client) = channels();

    let mut env = Envelope::new("test-1", types::PING)
        .with_payload(&json!({"hello": "world"}))
        .unwrap();
    client.send(&mut env).unwrap();

    let recv = server.receive().unwrap();
    assert_eq!(recv.id, "test-1");
    assert_eq!(recv.msg_type, types::PING);
    assert_eq!(recv.seq(), 1);
    assert_eq!(recv.hmac(), env.hmac());
    assert_eq!(recv.payload_bytes(), br#"{"hello":"world"}"#);
}

#[test]
fn first_three_sends_are_numbered_from_one() {
    let (server, client) = channels();

    let mut seqs = Vec::new();
    for i in 0..3 {
        let mut env = Envelope::new(format!("m-{i}"), types::PING);
        client.send(&mut env).unwrap();
        seqs.push(env.seq());
    }
    assert_eq!(seqs, vec![1, 2, 3]);

    for expected in 1..=3 {
        assert_eq!(server.receive().unwrap().seq(), expected);
    }
}

#[test]
fn frame_header_is_big_endian_length() {
    let (mut raw, peer) = pair();
    let client = SecureChannel::new(peer);

    client.send_typed("h", types::PING, &"x").unwrap();
    let (header, body) = read_frame(&mut raw);

    assert_eq!(u32::from_be_bytes(header) as usize, body.len());
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["id"], "h");
    assert_eq!(value["seq"], 1);
    assert_eq!(value["type"], "ping");
    assert_eq!(value["payload"], "x");
    assert!(value.get("error").is_none());
    assert_eq!(value["hmac"].as_str().unwrap().len(), 64);
}

#[test]
fn replayed_and_stale_sequence_numbers_are_rejected() {
    let (mut raw, peer) = pair();
    let server = SecureChannel::new(peer);

    write_signed_frame(&mut raw, &ZERO_KEY, "a", 5, types::PING, json!(null));
    assert_eq!(server.receive().unwrap().seq(), 5);

    write_signed_frame(&mut raw, &ZERO_KEY, "b", 5, types::PING, json!(null));
    match server.receive() {
        Err(ChannelError::SequenceReplay { seq: 5, last: 5 }) => {}
        other => panic!("expected replay rejection, got {other:?}"),
    }

    write_signed_frame(&mut raw, &ZERO_KEY, "c", 3, types::PING, json!(null));
    match server.receive() {
        Err(ChannelError::SequenceReplay { seq: 3, last: 5 }) => {}
        other => panic!("expected replay rejection, got {other:?}"),
    }

    // The watermark is unaffected by rejected frames.
    write_signed_frame(&mut raw, &ZERO_KEY, "d", 6, types::PING, json!(null));
    assert_eq!(server.receive().unwrap().id, "d");
}

#[test]
fn first_frame_is_not_bounded_from_below() {
    let (mut raw, peer) = pair();
    let server = SecureChannel::new(peer);

    write_signed_frame(&mut raw, &ZERO_KEY, "zero", 0, types::PING, json!(null));
    assert_eq!(server.receive().unwrap().seq(), 0);

    write_signed_frame(&mut raw, &ZERO_KEY, "zero-again", 0, types::PING, json!(null));
    let err = server.receive().unwrap_err();
    assert!(matches!(err, ChannelError::SequenceReplay { seq: 0, last: 0 }));

    write_signed_frame(&mut raw, &ZERO_KEY, "one", 1, types::PING, json!(null));
    assert_eq!(server.receive().unwrap().seq(), 1);
}

#[test]
fn flipped_payload_bit_fails_tag_check() {
    let (mut sender_raw, sender_peer) = pair();
    let sender = SecureChannel::new(sender_peer);
    sender.send_typed("t-1", types::NOTIFY, &"hello").unwrap();
    let (header, mut body) = read_frame(&mut sender_raw);

    let text = String::from_utf8(body.clone()).unwrap();
    let at = text.find("hello").unwrap();
    body[at] ^= 0x01;

    let (mut receiver_raw, receiver_peer) = pair();
    let receiver = SecureChannel::new(receiver_peer);
    receiver_raw.write_all(&header).unwrap();
    receiver_raw.write_all(&body).unwrap();

    let err = receiver.receive().unwrap_err();
    assert!(matches!(err, ChannelError::TagMismatch), "got {err:?}");
    assert!(err.is_protocol_violation());
}

#[test]
fn rewritten_sequence_fails_tag_check() {
    let (mut raw, peer) = pair();
    let server = SecureChannel::new(peer);

    let payload_text = "{}";
    let body = json!({
        "id": "s",
        "seq": 9,
        "type": types::PING,
        "payload": {},
        "hmac": compute_tag(&ZERO_KEY, "s", 8, types::PING, payload_text.as_bytes()),
    });
    write_frame(&mut raw, &serde_json::to_vec(&body).unwrap());

    assert!(matches!(server.receive(), Err(ChannelError::TagMismatch)));
}

#[test]
fn uppercase_tag_is_rejected() {
    let (mut raw, peer) = pair();
    let server = SecureChannel::new(peer);

    let body = json!({
        "id": "u",
        "seq": 1,
        "type": types::PING,
        "payload": {},
        "hmac": compute_tag(&ZERO_KEY, "u", 1, types::PING, b"{}").to_uppercase(),
    });
    write_frame(&mut raw, &serde_json::to_vec(&body).unwrap());

    let err = server.receive().unwrap_err();
    assert!(matches!(err, ChannelError::TagMismatch), "got {err:?}");
}

#[test]
fn oversized_send_writes_nothing() {
    let (raw, peer) = pair();
    let client = SecureChannel::new(peer);

    let big = "A".repeat(MAX_MESSAGE_SIZE + 1);
    let err = client.send_typed("big", types::PING, &big).unwrap_err();
    assert!(matches!(
        err,
        ChannelError::MessageTooLarge { max: MAX_MESSAGE_SIZE, .. }
    ));

    raw.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 1];
    let read = (&raw).read(&mut buf);
    assert_eq!(read.unwrap_err().kind(), io::ErrorKind::WouldBlock);
}

#[test]
fn zero_length_frame_is_rejected() {
    let (mut raw, peer) = pair();
    let server = SecureChannel::new(peer);

    raw.write_all(&0u32.to_be_bytes()).unwrap();
    let err = server.receive().unwrap_err();
    assert!(matches!(err, ChannelError::ZeroLength));
    assert!(err.is_protocol_violation());
}

#[test]
fn oversized_declared_length_is_rejected_before_reading_body() {
    let (mut raw, peer) = pair();
    let server = SecureChannel::new(peer);

    raw.write_all(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes())
        .unwrap();
    let err = server.receive().unwrap_err();
    assert!(matches!(
        err,
        ChannelError::MessageTooLarge { size, max } if size == MAX_MESSAGE_SIZE + 1 && max == MAX_MESSAGE_SIZE
    ));
}

#[test]
fn malformed_envelope_is_rejected() {
    let (mut raw, peer) = pair();
    let server = SecureChannel::new(peer);

    write_frame(&mut raw, b"{not json");
    let err = server.receive().unwrap_err();
    assert!(matches!(err, ChannelError::Malformed(_)));
    assert!(err.is_protocol_violation());
}

#[test]
fn mismatched_session_keys_fail() {
    let (server, client) = channels();
    server.set_session_key(generate_session_key().unwrap());
    client.set_session_key(generate_session_key().unwrap());

    client.send_typed("k", types::PONG, &"test").unwrap();
    assert!(matches!(server.receive(), Err(ChannelError::TagMismatch)));
}

#[test]
fn session_key_only_applies_to_later_messages() {
    let (server, client) = channels();
    let key = generate_session_key().unwrap();

    client.send_typed("pre", types::AUTH_REQUEST, &"claim").unwrap();
    client.set_session_key(key);
    client.send_typed("post", types::PING, &"secret").unwrap();

    // Still pre-auth on the server: the first frame verifies, the second does not.
    assert_eq!(server.receive().unwrap().id, "pre");
    assert!(matches!(server.receive(), Err(ChannelError::TagMismatch)));
    assert!(client.is_authenticated());
    assert!(!server.is_authenticated());
    assert_eq!(client.session_key(), Some(key));
}

#[test]
fn send_error_carries_message_without_payload() {
    let (server, client) = channels();
    client
        .send_error("cmd-9", types::COMMAND_RESULT, "permission denied")
        .unwrap();

    let env = server.receive().unwrap();
    assert_eq!(env.id, "cmd-9");
    assert!(env.is_error());
    assert_eq!(env.error, "permission denied");
    assert!(env.payload_bytes().is_empty());
}

#[test]
fn peer_close_is_a_disconnect() {
    let (server, client) = channels();
    drop(client);

    let err = server.receive().unwrap_err();
    assert!(err.is_disconnect(), "got {err:?}");
    assert!(!err.is_protocol_violation());
}

#[test]
fn read_timeout_unblocks_receive() {
    let (server, _client) = channels();
    server
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();

    match server.receive() {
        Err(ChannelError::Io { source, .. }) => assert!(matches!(
            source.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        )),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn concurrent_senders_never_interleave_or_reuse_sequence_numbers() {
    const SENDERS: usize = 4;
    const PER_SENDER: usize = 50;

    let (server, client) = channels();
    let client = Arc::new(client);

    let handles: Vec<_> = (0..SENDERS)
        .map(|s| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for i in 0..PER_SENDER {
                    client
                        .send_typed(&format!("{s}-{i}"), types::TRAY_UPDATE, &json!({"n": i}))
                        .unwrap();
                }
            })
        })
        .collect();

    let mut ids = HashSet::new();
    let mut last = 0;
    for _ in 0..SENDERS * PER_SENDER {
        let env = server.receive().unwrap();
        assert!(env.seq() > last);
        last = env.seq();
        ids.insert(env.id);
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ids.len(), SENDERS * PER_SENDER);
    assert_eq!(last, (SENDERS * PER_SENDER) as u64);
}

#[test]
fn pre_auth_exchange_then_ten_signed_messages() {
    let (server, client) = channels();

    let server_side = thread::spawn(move || {
        let env = server.receive().unwrap();
        assert_eq!(env.msg_type, types::AUTH_REQUEST);
        let req: AuthRequest = env.decode_payload().unwrap();
        assert_eq!(req.protocol_version, PROTOCOL_VERSION);

        let key = generate_session_key().unwrap();
        server
            .send_typed(
                &env.id,
                types::AUTH_RESPONSE,
                &AuthResponse {
                    accepted: true,
                    session_key: hex::encode(key),
                    ..AuthResponse::default()
                },
            )
            .unwrap();
        server.set_session_key(key);

        let mut received = Vec::new();
        for _ in 0..10 {
            received.push(server.receive().unwrap());
        }
        received
    });

    client
        .send_typed(
            "auth",
            types::AUTH_REQUEST,
            &AuthRequest {
                protocol_version: PROTOCOL_VERSION,
                uid: 1000,
                ..AuthRequest::default()
            },
        )
        .unwrap();
    let reply = client.receive().unwrap();
    assert_eq!(reply.id, "auth");
    let resp: AuthResponse = reply.decode_payload().unwrap();
    assert!(resp.accepted);
    let key: SessionKey = hex::decode(&resp.session_key)
        .unwrap()
        .try_into()
        .unwrap();
    client.set_session_key(key);

    for i in 0..10 {
        client
            .send_typed(&format!("msg-{i}"), types::COMMAND, &json!({"index": i}))
            .unwrap();
    }

    let received = server_side.join().unwrap();
    assert_eq!(received.len(), 10);
    for (i, env) in received.iter().enumerate() {
        assert_eq!(env.id, format!("msg-{i}"));
        assert_eq!(env.msg_type, types::COMMAND);
        assert_eq!(env.seq(), i as u64 + 2);
        assert_eq!(
            env.hmac(),
            compute_tag(&key, &env.id, env.seq(), &env.msg_type, env.payload_bytes())
        );
    }
}
