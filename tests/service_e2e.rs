//! Full-stack test: two chat services joined by an authenticated TCP link,
//! exchanging live messages and healing history through seqno-inventory
//! sync.

use std::time::Duration;

use qmesh::chat::{ChatCallbacks, ChatEvent, ChatService};
use qmesh::config::{Config, TcpLinkSection};
use qmesh::mesh::NodeId;
use tokio::sync::mpsc;

fn test_port() -> u16 {
    29000 + (std::process::id() % 3000) as u16
}

fn base_config(callsign: &str, db_path: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.node.callsign = callsign.to_string();
    config.modem.enabled = false;
    config.storage.db_path = db_path.to_string_lossy().into_owned();
    config
}

async fn wait_for_event(
    rx: &mut mpsc::UnboundedReceiver<ChatEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&ChatEvent) -> bool,
) -> Option<ChatEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event)) if pred(&event) => return Some(event),
            Ok(Some(_)) => continue,
            _ => return None,
        }
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
async fn chat_and_sync_over_tcp_substitute() {
    let port = test_port();
    let dir_a = tempfile::tempdir().expect("tempdir a");
    let dir_b = tempfile::tempdir().expect("tempdir b");

    // Node A: accepting side.
    let mut cfg_a = base_config("ALPHA", &dir_a.path().join("db"));
    cfg_a.tcp.server.enabled = true;
    cfg_a.tcp.server.port = port;
    cfg_a.tcp.server.password = "mesh-pw".to_string();
    cfg_a.validate().expect("cfg a valid");

    // Node B: dialing side.
    let mut cfg_b = base_config("BRAVO", &dir_b.path().join("db"));
    cfg_b.tcp.links.push(TcpLinkSection {
        name: "to-alpha".to_string(),
        enabled: true,
        host: "127.0.0.1".to_string(),
        port,
        password: "mesh-pw".to_string(),
        reconnect_base_secs: 0.2,
        reconnect_max_secs: 2.0,
        tx_queue_size: 100,
    });
    cfg_b.validate().expect("cfg b valid");

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let mut service_a = ChatService::new(
        cfg_a,
        ChatCallbacks {
            events: Some(tx_a),
            ..ChatCallbacks::default()
        },
    )
    .expect("service a");
    let mut service_b = ChatService::new(
        cfg_b,
        ChatCallbacks {
            events: Some(tx_b),
            ..ChatCallbacks::default()
        },
    )
    .expect("service b");

    service_a.start().await.expect("start a");
    service_b.start().await.expect("start b");

    assert!(
        wait_until(
            || service_a.link_metrics().connected && service_b.link_metrics().connected,
            Duration::from_secs(10)
        )
        .await,
        "tcp link never came up"
    );

    let alpha = NodeId::from_callsign("ALPHA");

    // Live message B -> A.
    service_b
        .send_message_to_node(alpha, "#general", "hello alpha")
        .expect("send");
    let event = wait_for_event(&mut rx_a, Duration::from_secs(10), |e| {
        matches!(e, ChatEvent::Message { .. })
    })
    .await
    .expect("message event at A");
    match event {
        ChatEvent::Message {
            channel,
            nick,
            text,
            origin,
            ..
        } => {
            assert_eq!(channel, "#general");
            assert_eq!(nick, "BRAVO");
            assert_eq!(text, "hello alpha");
            assert_eq!(origin, NodeId::from_callsign("BRAVO"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(service_a.history("#general", 10).expect("history").len(), 1);

    // A accumulates history B never saw: messages addressed to a third node
    // that is not on the air. B hears the frames but is not the destination
    // and holds no route, so its store stays empty for that channel.
    let charlie = NodeId::from_callsign("CHARLIE");
    service_a
        .send_message_to_node(charlie, "#mesh", "net check one")
        .expect("send 1");
    service_a
        .send_message_to_node(charlie, "#mesh", "net check two")
        .expect("send 2");
    assert_eq!(service_a.history("#mesh", 10).expect("history").len(), 2);
    assert!(service_b.history("#mesh", 10).expect("history").is_empty());

    // Inventory sync pulls the gap closed.
    service_b.request_sync(alpha, "#mesh").expect("request sync");
    let applied = wait_for_event(&mut rx_b, Duration::from_secs(15), |e| {
        matches!(e, ChatEvent::SyncApplied { .. })
    })
    .await
    .expect("sync applied at B");
    match applied {
        ChatEvent::SyncApplied { channel, applied } => {
            assert_eq!(channel, "#mesh");
            assert_eq!(applied, 2);
        }
        other => panic!("unexpected event {:?}", other),
    }
    let healed = service_b.history("#mesh", 10).expect("history");
    assert_eq!(healed.len(), 2);
    assert!(healed.iter().all(|m| m.origin == alpha));
    assert_eq!(healed[0].text, "net check one");

    // Retry state for the synced channel clears once records applied; give
    // the scheduler a beat to process the cancellation command.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = service_b.retry_stats().await.expect("retry stats");
        if stats.active == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "retry state was not cleared after sync applied"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    service_b.stop().await;
    service_a.stop().await;
}
