//! Integration tests for the secure channel: key exchange, sealed traffic
//! in both directions, and per-recipient sealing.

use std::time::Duration;

use bytes::BytesMut;

use tokio::sync::mpsc;
use troupe::prelude::*;
use troupe::secure::{KeyPair, PeerKey};
use troupe::{SafeMessage, SecureFrame};

/// Small keys keep key generation fast.
fn secure_config() -> SecureConfig {
    SecureConfig {
        key_bits: 512,
        handshake_timeout: Duration::from_secs(5),
    }
}

// =========================================================================
// Mock handlers
// =========================================================================

/// Echoes, except `all:<text>` (broadcast) and `whoami`.
struct Echo {
    heard: mpsc::UnboundedSender<Vec<u8>>,
}

impl ServerHandler for Echo {
    async fn on_receive(&self, client: &ClientId, message: Message) -> Option<ServerResponse> {
        let _ = self.heard.send(message.payload().to_vec());
        match message.as_text() {
            Some("whoami") => Some(ServerResponse::reply(Message::from_text(client.as_str()))),
            Some(text) if text.starts_with("all:") => Some(ServerResponse::broadcast(
                Message::from_text(&text["all:".len()..]),
            )),
            _ => Some(ServerResponse::reply(message)),
        }
    }
}

struct Inbox {
    received: mpsc::UnboundedSender<Vec<u8>>,
}

impl ClientHandler for Inbox {
    async fn on_receive(&self, message: Message) -> Option<Message> {
        let _ = self.received.send(message.payload().to_vec());
        None
    }
}

// =========================================================================
// Helpers
// =========================================================================

async fn start_server() -> (String, SecureServerHandle, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (heard, heard_rx) = mpsc::unbounded_channel();
    let server = SafeServer::bind_with(
        "127.0.0.1:0",
        ServerConfig::default(),
        secure_config(),
        Echo { heard },
    )
    .await
    .expect("server should bind");
    let addr = server.local_addr().unwrap().to_string();
    let handle = server.handle();
    tokio::spawn(server.run());
    (addr, handle, heard_rx)
}

fn client(addr: &str) -> (SafeConnection<Inbox>, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (received, rx) = mpsc::unbounded_channel();
    let conn = SafeConnection::with_config(
        addr,
        ConnectionConfig::default(),
        secure_config(),
        Inbox { received },
    )
    .expect("key generation");
    (conn, rx)
}

async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(got.is_err(), "expected nothing, got {got:?}");
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting")
        .expect("channel closed")
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_handshake_then_echo() {
    let (addr, _handle, mut heard) = start_server().await;
    let (conn, mut received) = client(&addr);

    conn.connect().await.unwrap();
    assert!(conn.is_secured());

    conn.send(Message::from_text("secret")).await.unwrap();
    assert_eq!(next(&mut heard).await, b"secret");
    assert_eq!(next(&mut received).await, b"secret");
}

#[tokio::test]
async fn test_messages_spanning_block_boundaries() {
    let (addr, _handle, mut heard) = start_server().await;
    let (conn, mut received) = client(&addr);
    conn.connect().await.unwrap();

    // Sealed data is the frame: an 8-byte timestamp plus the payload.
    let bs = conn.block_size();
    for len in [1, bs - 1, bs, bs + 1, 3 * bs] {
        let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        conn.send(Message::from_bytes(payload.clone())).await.unwrap();
        assert_eq!(next(&mut heard).await, payload, "server side, len {len}");
        assert_eq!(next(&mut received).await, payload, "client side, len {len}");
    }
}

#[tokio::test]
async fn test_send_before_handshake_is_pending() {
    let (addr, _handle, _heard) = start_server().await;
    let (conn, _received) = client(&addr);

    let err = conn.send(Message::from_text("too early")).await.unwrap_err();
    assert!(matches!(err, TroupeError::HandshakePending));
}

#[tokio::test]
async fn test_disconnect_forgets_server_key() {
    let (addr, _handle, _heard) = start_server().await;
    let (conn, _received) = client(&addr);
    conn.connect().await.unwrap();

    conn.disconnect().await;
    assert!(!conn.is_secured());
    let err = conn.send(Message::from_text("gone")).await.unwrap_err();
    assert!(matches!(err, TroupeError::HandshakePending));

    conn.connect().await.unwrap();
    assert!(conn.is_secured());
}

#[tokio::test]
async fn test_broadcast_is_sealed_for_each_client() {
    let (addr, handle, _heard) = start_server().await;
    let (a, mut a_rx) = client(&addr);
    let (b, mut b_rx) = client(&addr);
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    // Round trips guarantee both sessions are registered and keyed.
    a.send(Message::from_text("whoami")).await.unwrap();
    next(&mut a_rx).await;
    b.send(Message::from_text("whoami")).await.unwrap();
    next(&mut b_rx).await;
    assert_eq!(handle.session_count(), 2);

    a.send(Message::from_text("all:encore")).await.unwrap();
    assert_eq!(next(&mut a_rx).await, b"encore");
    assert_eq!(next(&mut b_rx).await, b"encore");
}

#[tokio::test]
async fn test_handle_push_is_sealed_for_the_client() {
    let (addr, handle, _heard) = start_server().await;
    let (conn, mut received) = client(&addr);
    conn.connect().await.unwrap();

    conn.send(Message::from_text("whoami")).await.unwrap();
    let id = ClientId::new(String::from_utf8(next(&mut received).await).unwrap());
    assert!(handle.is_secured(&id));

    assert!(handle.send(&id, Message::from_text("pushed")));
    assert_eq!(next(&mut received).await, b"pushed");

    assert!(handle.broadcast(&Message::from_text("to all")));
    assert_eq!(next(&mut received).await, b"to all");

    assert!(handle.route(&id, &ServerResponse::reply(Message::from_text("routed"))));
    assert_eq!(next(&mut received).await, b"routed");

    assert!(!handle.send(&ClientId::new("nobody"), Message::from_text("x")));
}

/// Forwards every raw frame it receives.
struct Raw {
    frames: mpsc::UnboundedSender<Message>,
}

impl ClientHandler for Raw {
    async fn on_receive(&self, message: Message) -> Option<Message> {
        let _ = self.frames.send(message);
        None
    }
}

#[tokio::test]
async fn test_sealed_frame_before_handshake_is_dropped_and_session_survives() {
    let (addr, handle, mut heard) = start_server().await;
    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    let conn = Connection::new(addr, Raw { frames: frames_tx });
    conn.connect().await.unwrap();

    let early = SecureFrame::Sealed(SafeMessage {
        blocks: vec![vec![42; 64]],
    });
    conn.send(Message::wrap(&early).unwrap()).await.unwrap();
    assert_quiet(&mut frames).await;
    assert_quiet(&mut heard).await;
    assert_eq!(handle.session_count(), 1);
    assert!(conn.is_connected());

    // The same session can still complete the handshake...
    let ours = KeyPair::generate(512).unwrap();
    let hello = SecureFrame::Key(ours.encryption_key().clone());
    conn.send(Message::wrap(&hello).unwrap()).await.unwrap();
    let SecureFrame::Key(theirs) = next(&mut frames).await.unwrap::<SecureFrame>().unwrap() else {
        panic!("expected the server key");
    };
    let server_key = PeerKey::try_from(&theirs).unwrap();

    // ...and talk sealed afterwards.
    let sealed = server_key.seal(&Message::from_text("late").to_frame()).unwrap();
    conn.send(Message::wrap(&SecureFrame::Sealed(sealed)).unwrap())
        .await
        .unwrap();
    assert_eq!(next(&mut heard).await, b"late");

    let SecureFrame::Sealed(echo) = next(&mut frames).await.unwrap::<SecureFrame>().unwrap() else {
        panic!("expected a sealed echo");
    };
    let plain = ours.open(&echo).unwrap();
    let echo = Message::from_frame(BytesMut::from(&plain[..])).unwrap();
    assert_eq!(echo.as_text(), Some("late"));
}

#[tokio::test]
async fn test_handshake_times_out_against_plain_server() {
    struct Mute;
    impl ServerHandler for Mute {
        async fn on_receive(&self, _client: &ClientId, _message: Message) -> Option<ServerResponse> {
            Some(ServerResponse::nothing())
        }
    }

    let server = Server::bind("127.0.0.1:0", Mute).await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(server.run());

    let (received, _rx) = mpsc::unbounded_channel();
    let conn = SafeConnection::with_config(
        addr,
        ConnectionConfig::default(),
        SecureConfig {
            key_bits: 512,
            handshake_timeout: Duration::from_millis(200),
        },
        Inbox { received },
    )
    .unwrap();

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, TroupeError::HandshakeTimeout(_)));
    assert!(!conn.is_connected());
}
