//! End-to-end tests over real loopback TCP connections
//!
//! These tests run a full server and speak the wire protocol as a peer
//! would. They cover:
//! - Upgrade handshake acceptance and both rejection paths
//! - Same-identity reconnects evicting the previous connection
//! - Digest probes, buffered messages, peer relay, and routed dispatch
//! - The reserved `internal.` namespace gate
//! - Close behavior for dropped frames, peer-initiated closes, and `stop()`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use conduit_core::{
    ConduitConfig, ConduitServer, Dispatcher, InvokeOutcome, InvokeRequest, InvokeResult, Message,
    NullDispatcher,
};

const SHARED_KEY: &str = "integration-shared-key";

/// RFC 6455 §1.3 example nonce; its accept value is well known.
const SAMPLE_NONCE: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

// =============================================================================
// Helpers
// =============================================================================

fn test_config() -> ConduitConfig {
    let mut config = ConduitConfig::new();
    config.hostname = "127.0.0.1".to_string();
    config.shared_key = Some(SHARED_KEY.to_string());
    config
}

async fn start_server(dispatcher: Arc<dyn Dispatcher>) -> (ConduitServer, u16) {
    let server = ConduitServer::new(&test_config(), dispatcher);
    let port = server.start().await.expect("server should bind port 0");
    (server, port)
}

/// Writes spaced out enough that each lands in its own server read. The
/// server treats one read as one frame, so coalesced writes would merge.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 126, "test frames stay in the short branch");
    let mask = [0x6a, 0x2b, 0xd4, 0x91];
    let mut frame = vec![0x80 | opcode, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    frame
}

/// Parse one complete unmasked server frame from the front of `bytes`.
fn try_parse_frame(bytes: &[u8]) -> Option<(u8, Vec<u8>, usize)> {
    if bytes.len() < 2 {
        return None;
    }
    let opcode = bytes[0] & 0x0f;
    let short = (bytes[1] & 0x7f) as usize;
    let (len, header) = match short {
        126 => {
            if bytes.len() < 4 {
                return None;
            }
            (usize::from(u16::from_be_bytes([bytes[2], bytes[3]])), 4)
        }
        127 => {
            if bytes.len() < 10 {
                return None;
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[2..10]);
            (usize::try_from(u64::from_be_bytes(raw)).unwrap(), 10)
        }
        _ => (short, 2),
    };
    if bytes.len() < header + len {
        return None;
    }
    Some((opcode, bytes[header..header + len].to_vec(), header + len))
}

/// A connected, upgraded peer.
struct TestPeer {
    stream: TcpStream,
    residue: Vec<u8>,
}

impl TestPeer {
    /// Connect and complete the upgrade handshake under `/{id}/{peer_id}`.
    async fn connect(port: u16, id: u64, peer_id: u64) -> Self {
        let mut peer = Self::connect_raw(port).await;
        let request = format!(
            "GET /{id}/{peer_id}/?key={SHARED_KEY} HTTP/1.1\r\n\
             Host: 127.0.0.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {SAMPLE_NONCE}\r\n\
             \r\n"
        );
        peer.stream.write_all(request.as_bytes()).await.unwrap();
        let response = peer.read_http_response().await;
        assert!(
            response.starts_with("HTTP/1.1 101"),
            "handshake should be accepted, got: {response}"
        );
        peer
    }

    async fn connect_raw(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("server should accept loopback connections");
        Self {
            stream,
            residue: Vec::new(),
        }
    }

    /// Read until the response's blank line arrives.
    async fn read_http_response(&mut self) -> String {
        let mut bytes = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the response completed");
            bytes.extend_from_slice(&chunk[..n]);
            if bytes.windows(4).any(|window| window == b"\r\n\r\n") {
                break;
            }
        }
        String::from_utf8(bytes).unwrap()
    }

    async fn send(&mut self, message: &Message) {
        let payload = message.encode().unwrap();
        self.stream
            .write_all(&masked_frame(0x02, &payload))
            .await
            .unwrap();
    }

    /// Receive one frame, reading more bytes as needed.
    async fn recv_frame(&mut self) -> (u8, Vec<u8>) {
        loop {
            if let Some((opcode, payload, consumed)) = try_parse_frame(&self.residue) {
                self.residue.drain(..consumed);
                return (opcode, payload);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-frame");
            self.residue.extend_from_slice(&chunk[..n]);
        }
    }

    async fn recv_message(&mut self) -> Message {
        let (opcode, payload) = self.recv_frame().await;
        assert_eq!(opcode, 0x02, "expected a binary frame");
        Message::decode(&payload)
    }

    async fn expect_close_frame(&mut self) {
        let (opcode, payload) = self.recv_frame().await;
        assert_eq!(opcode, 0x08, "expected a close frame");
        assert_eq!(payload, vec![0x00]);
    }

    async fn expect_eof(&mut self) {
        let mut chunk = [0u8; 64];
        loop {
            let n = self.stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            // Drain whatever teardown bytes remain before EOF.
            self.residue.extend_from_slice(&chunk[..n]);
        }
    }
}

fn message(options: &[(&str, &str)], payload: &[u8]) -> Message {
    let mut message = Message::new();
    for (key, value) in options {
        message.insert(*key, *value);
    }
    message.set_payload(payload.to_vec());
    message
}

/// Echoes the request token and records every invocation.
#[derive(Default)]
struct EchoDispatcher {
    invocations: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl Dispatcher for EchoDispatcher {
    async fn invoke(&self, request: InvokeRequest) -> InvokeOutcome {
        self.invocations
            .lock()
            .push((request.route().to_string(), request.body().to_vec()));
        let token = request.options().get("token").cloned();
        InvokeOutcome::Handled(InvokeResult::data(
            token,
            serde_json::json!({ "message": "pong" }),
        ))
    }
}

// =============================================================================
// Test 1: Handshake Acceptance and Rejection
// =============================================================================

/// The accept key derivation matches the RFC 6455 example, and the 101
/// response carries the upgrade headers.
#[tokio::test]
async fn test_handshake_accept_derivation() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    let mut peer = TestPeer::connect_raw(port).await;
    let request = format!(
        "GET /1/2/?key={SHARED_KEY} HTTP/1.1\r\nSec-WebSocket-Key: {SAMPLE_NONCE}\r\n\r\n"
    );
    peer.stream.write_all(request.as_bytes()).await.unwrap();

    let response = peer.read_http_response().await;
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols"));
    assert!(response.contains("Upgrade: websocket"));
    assert!(response.contains("Connection: upgrade"));
    assert!(response.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}")));

    server.stop().await;
}

/// A missing `Sec-WebSocket-Key` gets a 400 and the connection closes.
#[tokio::test]
async fn test_handshake_missing_nonce_rejected() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    let mut peer = TestPeer::connect_raw(port).await;
    let request = format!("GET /1/2/?key={SHARED_KEY} HTTP/1.1\r\nHost: x\r\n\r\n");
    peer.stream.write_all(request.as_bytes()).await.unwrap();

    let response = peer.read_http_response().await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
    peer.expect_eof().await;
    assert_eq!(server.client_count(), 0);

    server.stop().await;
}

/// A wrong shared key gets a 403 and the connection closes.
#[tokio::test]
async fn test_handshake_wrong_shared_key_rejected() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    let mut peer = TestPeer::connect_raw(port).await;
    let request = format!(
        "GET /1/2/?key=wrong-key HTTP/1.1\r\nSec-WebSocket-Key: {SAMPLE_NONCE}\r\n\r\n"
    );
    peer.stream.write_all(request.as_bytes()).await.unwrap();

    let response = peer.read_http_response().await;
    assert!(response.starts_with("HTTP/1.1 403 Forbidden"));
    peer.expect_eof().await;
    assert_eq!(server.client_count(), 0);

    server.stop().await;
}

/// Garbage instead of an upgrade request closes silently, no response.
#[tokio::test]
async fn test_garbage_request_closed_silently() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    let mut peer = TestPeer::connect_raw(port).await;
    peer.stream.write_all(b"\xff\xfe not http at all").await.unwrap();

    peer.expect_eof().await;
    assert!(peer.residue.is_empty(), "silent close sends no bytes");

    server.stop().await;
}

// =============================================================================
// Test 2: Identity Eviction
// =============================================================================

/// A reconnect under the same id closes the previous connection; the
/// identity never has two live occupants.
#[tokio::test]
async fn test_same_id_reconnect_evicts_previous() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    let mut first = TestPeer::connect(port, 7, 0).await;
    settle().await;
    assert_eq!(server.client_count(), 1);

    let _second = TestPeer::connect(port, 7, 0).await;

    // The displaced connection receives the graceful close choreography.
    first.expect_close_frame().await;
    first.expect_eof().await;

    settle().await;
    assert_eq!(server.client_count(), 1, "one occupant per identity");
    assert!(server.has(7));

    server.stop().await;
}

// =============================================================================
// Test 3: Digest Probes
// =============================================================================

/// A digest probe is answered with the uppercase hex SHA-1 of its payload.
#[tokio::test]
async fn test_digest_probe_round_trip() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    let mut peer = TestPeer::connect(port, 1, 0).await;
    let mut probe = message(&[], b"abc");
    probe.set_digest("probe");
    peer.send(&probe).await;

    let reply = peer.recv_message().await;
    assert_eq!(
        reply.digest(),
        Some("A9993E364706816ABA3E25717850C26C9CD0D89D")
    );
    assert!(reply.payload().is_empty());

    server.stop().await;
}

// =============================================================================
// Test 4: Peer Relay
// =============================================================================

/// Buffered payloads are concatenated in arrival order and relayed to the
/// addressed peer with the sender's options.
#[tokio::test]
async fn test_relay_between_peers() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    let mut sender = TestPeer::connect(port, 1, 0).await;
    let mut recipient = TestPeer::connect(port, 2, 0).await;
    settle().await;

    sender.send(&message(&[], b"hello ")).await;
    settle().await;
    let mut terminal = message(&[("kind", "greeting")], b"world");
    terminal.set_to(2);
    sender.send(&terminal).await;

    let relayed = recipient.recv_message().await;
    assert_eq!(relayed.payload(), b"hello world");
    assert_eq!(relayed.to_id(), Some(2));
    assert_eq!(relayed.get("kind"), "greeting");

    server.stop().await;
}

// =============================================================================
// Test 5: Routed Dispatch
// =============================================================================

/// A routed message reaches the dispatcher with the coalesced payload and
/// the reply correlates via the token option.
#[tokio::test]
async fn test_routed_message_end_to_end() {
    let dispatcher = Arc::new(EchoDispatcher::default());
    let (server, port) = start_server(dispatcher.clone()).await;

    let mut peer = TestPeer::connect(port, 42, 9).await;
    peer.send(&message(&[], b"chunk ")).await;
    settle().await;
    let mut request = message(&[], b"tail");
    request.set_route("ping");
    request.set_token("t-1");
    peer.send(&request).await;

    let reply = peer.recv_message().await;
    assert_eq!(reply.token(), Some("t-1"));

    let body: serde_json::Value = serde_json::from_slice(reply.payload()).unwrap();
    assert_eq!(body["source"], "ping");
    assert_eq!(body["token"], "t-1");
    assert_eq!(body["data"]["message"], "pong");

    let invocations = dispatcher.invocations.lock();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].0, "ping");
    assert_eq!(invocations[0].1, b"chunk tail");
    drop(invocations);

    server.stop().await;
}

/// Routes under `internal.` are rejected without consulting the dispatcher.
#[tokio::test]
async fn test_internal_route_gated() {
    let dispatcher = Arc::new(EchoDispatcher::default());
    let (server, port) = start_server(dispatcher.clone()).await;

    let mut peer = TestPeer::connect(port, 1, 0).await;
    peer.send(&message(&[("route", "internal.evil")], b"")).await;

    let reply = peer.recv_message().await;
    assert!(reply.options().is_empty());
    let body: serde_json::Value = serde_json::from_slice(reply.payload()).unwrap();
    assert_eq!(body["source"], "internal.evil");
    assert_eq!(body["err"]["type"], "NotFoundError");
    assert_eq!(body["err"]["message"], "Not found");

    assert!(dispatcher.invocations.lock().is_empty());

    server.stop().await;
}

/// Without a handler, routed messages get the NotFoundError reply.
#[tokio::test]
async fn test_unhandled_route_replies_not_found() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    let mut peer = TestPeer::connect(port, 1, 0).await;
    peer.send(&message(&[("route", "no.such.route")], b"")).await;

    let reply = peer.recv_message().await;
    assert!(reply.options().is_empty());
    let body: serde_json::Value = serde_json::from_slice(reply.payload()).unwrap();
    assert_eq!(body["source"], "no.such.route");
    assert_eq!(body["token"], serde_json::Value::Null);
    assert_eq!(body["err"]["type"], "NotFoundError");

    server.stop().await;
}

// =============================================================================
// Test 6: Frame Discipline
// =============================================================================

/// An unmasked inbound frame is dropped; the connection keeps working.
#[tokio::test]
async fn test_unmasked_frame_dropped_connection_survives() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    let mut peer = TestPeer::connect(port, 1, 0).await;

    // Unmasked data frame: mask bit clear.
    peer.stream.write_all(&[0x82, 0x03, 1, 2, 3]).await.unwrap();
    settle().await;

    peer.send(&message(&[("digest", "probe")], b"x")).await;
    let reply = peer.recv_message().await;
    assert!(
        !reply.get("digest").is_empty(),
        "the connection still answers after a dropped frame"
    );

    server.stop().await;
}

/// A peer-initiated close frame closes the connection immediately, with no
/// reciprocal close frame from the server.
#[tokio::test]
async fn test_peer_close_frame_closes_without_reciprocal() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    let mut peer = TestPeer::connect(port, 1, 0).await;
    settle().await;
    assert_eq!(server.client_count(), 1);

    peer.stream
        .write_all(&masked_frame(0x08, &[0x00]))
        .await
        .unwrap();

    peer.expect_eof().await;
    assert!(
        peer.residue.is_empty(),
        "no server close frame after a peer-initiated close"
    );
    settle().await;
    assert_eq!(server.client_count(), 0);

    server.stop().await;
}

// =============================================================================
// Test 7: Stop Semantics
// =============================================================================

/// `stop()` walks every registered client through the close choreography
/// before the listener goes away.
#[tokio::test]
async fn test_stop_closes_connected_clients() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    let mut peer = TestPeer::connect(port, 3, 0).await;
    settle().await;
    assert_eq!(server.client_count(), 1);

    server.stop().await;

    peer.expect_close_frame().await;
    peer.expect_eof().await;
    assert!(!server.is_active());
    assert_eq!(server.port(), 0);
    assert_eq!(server.client_count(), 0);
}

/// With no clients the listener closes directly and new connects fail.
#[tokio::test]
async fn test_stop_with_no_clients_closes_listener() {
    let (server, port) = start_server(Arc::new(NullDispatcher)).await;

    server.stop().await;
    assert!(!server.is_active());

    // The accept loop is gone; fresh connections are refused or reset.
    let attempt = tokio::time::timeout(
        Duration::from_secs(1),
        TcpStream::connect(("127.0.0.1", port)),
    )
    .await;
    match attempt {
        Ok(Ok(mut stream)) => {
            // A connect may still land in the OS backlog; it must yield EOF.
            let mut chunk = [0u8; 16];
            let n = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut chunk))
                .await
                .expect("backlogged connection should resolve")
                .unwrap_or(0);
            assert_eq!(n, 0, "no task serves connections after stop");
        }
        Ok(Err(_)) | Err(_) => {}
    }
}
