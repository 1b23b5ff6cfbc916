//! Integration tests for the TCP transport.
//!
//! These tests bind a real listener on a random port and connect a real
//! client to it, so they exercise the framing end to end.

use std::time::Duration;

use bytes::Bytes;
use troupe_transport::{
    Framing, TcpTransport, Transport, TransportError, connect, read_frame,
    write_frame,
};

async fn bind() -> (TcpTransport, String) {
    let transport = TcpTransport::bind("127.0.0.1:0", Framing::default())
        .await
        .expect("should bind");
    let addr = transport.local_addr().expect("local addr").to_string();
    (transport, addr)
}

#[tokio::test]
async fn test_tcp_accept_and_exchange_frames() {
    let (mut transport, addr) = bind().await;

    let server = tokio::spawn(async move {
        transport.accept().await.expect("should accept")
    });

    let (mut client_sink, mut client_stream) =
        connect(&addr, Duration::from_secs(2), Framing::default())
            .await
            .expect("client should connect");

    let mut accepted = server.await.expect("task should complete");
    assert_eq!(accepted.local_addr.to_string(), addr);

    // --- Server sends, client receives ---
    write_frame(&mut accepted.sink, Bytes::from_static(b"hello from server"))
        .await
        .expect("send should succeed");
    let frame = read_frame(&mut client_stream)
        .await
        .expect("recv should succeed")
        .expect("should have data");
    assert_eq!(&frame[..], b"hello from server");

    // --- Client sends two frames back to back, server sees two frames ---
    write_frame(&mut client_sink, Bytes::from_static(b"one"))
        .await
        .unwrap();
    write_frame(&mut client_sink, Bytes::from_static(b"two"))
        .await
        .unwrap();

    let first = read_frame(&mut accepted.stream).await.unwrap().unwrap();
    let second = read_frame(&mut accepted.stream).await.unwrap().unwrap();
    assert_eq!(&first[..], b"one");
    assert_eq!(&second[..], b"two");
}

#[tokio::test]
async fn test_tcp_read_returns_none_on_peer_close() {
    let (mut transport, addr) = bind().await;

    let server = tokio::spawn(async move {
        transport.accept().await.expect("should accept")
    });

    let (client_sink, client_stream) =
        connect(&addr, Duration::from_secs(2), Framing::default())
            .await
            .unwrap();
    let mut accepted = server.await.unwrap();

    drop(client_sink);
    drop(client_stream);

    let result = read_frame(&mut accepted.stream)
        .await
        .expect("clean close should not error");
    assert!(result.is_none());
}

#[tokio::test]
async fn test_tcp_oversized_frame_is_receive_error() {
    let framing = Framing {
        max_frame_length: 8,
    };
    let mut transport = TcpTransport::bind("127.0.0.1:0", framing)
        .await
        .unwrap();
    let addr = transport.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move { transport.accept().await.unwrap() });

    let (mut client_sink, _client_stream) =
        connect(&addr, Duration::from_secs(2), Framing::default())
            .await
            .unwrap();
    let mut accepted = server.await.unwrap();

    write_frame(&mut client_sink, Bytes::from(vec![0u8; 64]))
        .await
        .unwrap();

    let err = read_frame(&mut accepted.stream).await.unwrap_err();
    assert!(matches!(err, TransportError::ReceiveFailed(_)));
}

#[tokio::test]
async fn test_connect_refused_is_connect_failed() {
    // Bind and immediately drop to get a port nobody listens on.
    let (transport, addr) = bind().await;
    drop(transport);

    let err = connect(&addr, Duration::from_secs(2), Framing::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectFailed { .. }));
}
