//! Exercises `HybridConnectionStream` over a real loopback WebSocket,
//! standing in for the rendezvous/client sockets the relay itself would
//! otherwise terminate. Plain `ws://` is used since `connect()` only
//! chooses TLS based on the URL scheme (§6.1) and a local peer has no
//! certificate to offer.

use std::time::Duration;

use relay_core::TrackingContext;
use relay_transport::{UpgradeHeaders, WriteMode, connect};
use tokio::net::TcpListener;

async fn echo_server(listener: TcpListener) {
    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
    use futures::{SinkExt, StreamExt};
    while let Some(Ok(message)) = ws.next().await {
        if message.is_close() {
            break;
        }
        if ws.send(message).await.is_err() {
            break;
        }
    }
    let _ = ws.close(None).await;
}

#[tokio::test]
async fn write_then_read_round_trips_one_frame() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(echo_server(listener));

    let url = format!("ws://{addr}/$hc/hc1?sb-hc-action=connect&sb-hc-id=test-1");
    let socket = connect(&url, &UpgradeHeaders::default(), Duration::from_secs(5), false, &TrackingContext::new(None))
        .await
        .unwrap();
    let stream = relay_transport::HybridConnectionStream::new(socket, WriteMode::Binary, TrackingContext::new(None));

    stream.write(b"hello relay").await.unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello relay");

    stream.close().await.unwrap();
}

#[tokio::test]
async fn read_returns_zero_after_peer_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(echo_server(listener));

    let url = format!("ws://{addr}/$hc/hc1?sb-hc-action=connect&sb-hc-id=test-2");
    let socket = connect(&url, &UpgradeHeaders::default(), Duration::from_secs(5), false, &TrackingContext::new(None))
        .await
        .unwrap();
    let stream = relay_transport::HybridConnectionStream::new(socket, WriteMode::Binary, TrackingContext::new(None));

    stream.shutdown().await.unwrap();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn large_frame_spanning_multiple_reads_is_buffered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(echo_server(listener));

    let url = format!("ws://{addr}/$hc/hc1?sb-hc-action=connect&sb-hc-id=test-3");
    let socket = connect(&url, &UpgradeHeaders::default(), Duration::from_secs(5), false, &TrackingContext::new(None))
        .await
        .unwrap();
    let stream = relay_transport::HybridConnectionStream::new(socket, WriteMode::Binary, TrackingContext::new(None));

    let payload = vec![7u8; 100];
    stream.write(&payload).await.unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 30];
    while collected.len() < payload.len() {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0);
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected, payload);
}
