//! Shared helpers for the overlay integration tests.
//!
//! Every test builds independent `OverlayContext`s with fixed identities
//! and wires them over loopback TCP, so multi-node topologies run inside
//! one process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use trellis_core::{NodeId, NodeLabel, OverlayContext, Role};
use trellis_crypto::LinkSecret;

/// The secret shared by every node of a test overlay.
#[must_use]
pub fn test_secret() -> LinkSecret {
    LinkSecret::from_passphrase("integration test overlay")
}

/// A fixed identity: 32 repetitions of one byte.
#[must_use]
pub fn id(byte: u8) -> NodeId {
    NodeId::from_bytes([byte; 32])
}

/// Build a context with identity `id(byte)`.
#[must_use]
pub fn node(byte: u8, role: Role) -> Arc<OverlayContext> {
    let label = NodeLabel {
        hostname: format!("node-{byte:02x}"),
        os: "linux".into(),
    };
    OverlayContext::with_identity(id(byte), role, label, test_secret())
}

/// Link two contexts: `to` listens on loopback, `from` dials it.
pub async fn link(from: &Arc<OverlayContext>, to: &Arc<OverlayContext>) -> NodeId {
    let addr = to
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .expect("listen");
    from.connect(addr).await.expect("connect")
}

/// Spawn a TCP echo server; returns its address.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Spawn a server that writes `payload` to every connection, then holds the
/// connection open until the client closes.
pub async fn spawn_flood_server(payload: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let payload = payload.clone();
            tokio::spawn(async move {
                let _ = stream.write_all(&payload).await;
                let _ = stream.flush().await;
                let mut sink = [0u8; 1024];
                while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
            });
        }
    });
    addr
}

/// A loopback port that was free a moment ago.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Run a SOCKS5 no-auth CONNECT negotiation on `stream` toward
/// `target`, panicking on any dialect violation.
pub async fn socks5_connect(stream: &mut tokio::net::TcpStream, target: SocketAddr) {
    let SocketAddr::V4(target) = target else {
        panic!("ipv4 targets only");
    };

    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await.unwrap();
    assert_eq!(greeting, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00, "socks connect failed: {reply:?}");
}
