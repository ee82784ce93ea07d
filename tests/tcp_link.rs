//! TCP mesh link behavior over real sockets: handshake, frame flow in both
//! directions, and the no-retry rule for authentication failures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use qmesh::link::tcp::{TcpClientConfig, TcpMeshLink, TcpServerConfig};
use qmesh::link::{FrameCallback, LinkTransport};

fn test_port(offset: u16) -> u16 {
    21000 + (std::process::id() % 8000) as u16 + offset
}

fn capture_callback() -> (FrameCallback, Arc<Mutex<Vec<Vec<u8>>>>) {
    let frames: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    let callback: FrameCallback = Arc::new(move |frame: &[u8]| {
        sink.lock().unwrap().push(frame.to_vec());
        Ok(())
    });
    (callback, frames)
}

fn client_config(port: u16, password: &str) -> TcpClientConfig {
    TcpClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        password: password.to_string(),
        reconnect_base: Duration::from_millis(200),
        reconnect_max: Duration::from_secs(2),
        tx_queue_size: 64,
    }
}

async fn wait_until(mut probe: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn handshake_then_frames_flow_both_ways() {
    let port = test_port(0);
    let (server_cb, server_frames) = capture_callback();
    let (client_cb, client_frames) = capture_callback();

    let server = TcpMeshLink::server(
        TcpServerConfig {
            port,
            password: "s3cret".to_string(),
            tx_queue_size: 64,
        },
        "srv",
        server_cb,
    );
    let client = TcpMeshLink::client(client_config(port, "s3cret"), "cli", client_cb);

    server.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.start();

    assert!(
        wait_until(
            || client.metrics().connected && server.metrics().connected,
            Duration::from_secs(5)
        )
        .await,
        "link never connected"
    );

    client.send(b"from-client");
    server.send(b"from-server");

    assert!(
        wait_until(
            || !server_frames.lock().unwrap().is_empty()
                && !client_frames.lock().unwrap().is_empty(),
            Duration::from_secs(5)
        )
        .await,
        "frames did not arrive"
    );
    assert_eq!(server_frames.lock().unwrap()[0], b"from-client");
    assert_eq!(client_frames.lock().unwrap()[0], b"from-server");

    let metrics = client.metrics();
    assert!(metrics.running);
    assert_eq!(metrics.tx_frames, 1);
    assert_eq!(metrics.rx_frames, 1);

    client.stop();
    server.stop();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!client.metrics().running);
}

#[tokio::test]
async fn wrong_password_stops_client_without_retry() {
    let port = test_port(1);
    let (server_cb, server_frames) = capture_callback();
    let (client_cb, _client_frames) = capture_callback();

    let server = TcpMeshLink::server(
        TcpServerConfig {
            port,
            password: "right".to_string(),
            tx_queue_size: 64,
        },
        "srv",
        server_cb,
    );
    let client = TcpMeshLink::client(client_config(port, "wrong"), "cli", client_cb);

    server.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.start();

    // An auth rejection is terminal for the client: running drops and no
    // reconnect loop burns the link.
    assert!(
        wait_until(|| !client.metrics().running, Duration::from_secs(5)).await,
        "client kept running after auth failure"
    );
    let metrics = client.metrics();
    assert!(!metrics.connected);
    assert_eq!(metrics.connect_successes, 0);
    assert_eq!(metrics.last_error, "handshake_rejected");
    assert!(server_frames.lock().unwrap().is_empty());

    server.stop();
}

#[tokio::test]
async fn server_rejects_bad_magic_and_keeps_listening() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let port = test_port(2);
    let (server_cb, _server_frames) = capture_callback();
    let server = TcpMeshLink::server(
        TcpServerConfig {
            port,
            password: "pw".to_string(),
            tx_queue_size: 64,
        },
        "srv",
        server_cb,
    );
    server.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Garbage magic earns the bad-handshake status byte.
    let mut bogus = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect");
    bogus.write_all(b"GARBAGE!").await.expect("write");
    let mut status = [0u8; 1];
    bogus.read_exact(&mut status).await.expect("status");
    assert_eq!(status[0], 0x02);
    drop(bogus);

    // A proper client can still get in afterwards.
    let (client_cb, _client_frames) = capture_callback();
    let client = TcpMeshLink::client(client_config(port, "pw"), "cli", client_cb);
    client.start();
    assert!(
        wait_until(|| client.metrics().connected, Duration::from_secs(5)).await,
        "valid client could not connect after a rejected peer"
    );

    client.stop();
    server.stop();
}
