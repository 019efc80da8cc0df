/// Graceful shutdown: every authenticated client gets a signed ERROR/418
/// before its socket closes, the staged grace periods elapse, and the
/// registry drains.
use serde_json::json;
use sporket_client::{SocketConfig, Sporket, SporketEvent};
use sporket_protocol::{MessageKind, Status, payload_object};
use sporket_server::{Server, ServerConfig};
use sporket_test_utils::{RawClient, next_matching, set_password};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

async fn start_server() -> (Server, String) {
    let server = Server::new(ServerConfig {
        hostname: "127.0.0.1".to_owned(),
        port: 0,
        ..ServerConfig::default()
    });
    let addr = server.listen().await.expect("listen");
    (server, format!("ws://{addr}/"))
}

#[tokio::test]
async fn close_notifies_every_client_with_a_signed_teapot() {
    set_password("hunter2");
    let (server, url) = start_server().await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = RawClient::connect(&url).await.expect("connect");
        let (_uuid, key) = client.authenticate("hunter2").await.expect("authenticate");
        clients.push((client, key));
    }
    assert_eq!(server.client_count().await, 3);

    let started = Instant::now();
    server.close().await;
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1500),
        "both grace periods must elapse, got {elapsed:?}"
    );

    for (mut client, key) in clients {
        let notice = client.recv_message().await.expect("shutdown notice");
        assert_eq!(notice.kind, MessageKind::Error);
        assert_eq!(notice.status, Status::Teapot);
        assert!(notice.verify(Some(&key)), "the notice is signed");

        let closed = tokio::time::timeout(WAIT, client.wait_closed()).await;
        assert!(
            matches!(closed, Ok(true)),
            "the socket closes after the notice"
        );
    }
    assert_eq!(server.client_count().await, 0);
}

#[tokio::test]
async fn sporket_clients_observe_shutdown_as_disconnect() {
    set_password("hunter2");
    let (server, url) = start_server().await;

    let client = Sporket::new(SocketConfig {
        auto_connect: false,
        ..SocketConfig::new(url)
    });
    let mut events = client.subscribe();
    client.connect();
    assert!(
        next_matching(&mut events, WAIT, |e| matches!(e, SporketEvent::Authenticated))
            .await
            .is_some()
    );

    server.close().await;

    assert!(
        next_matching(&mut events, WAIT, |e| matches!(e, SporketEvent::Disconnect))
            .await
            .is_some(),
        "the teapot notice ends the session"
    );
    assert!(!client.is_connected());
    assert!(!client.send(&payload_object(json!({ "late": true }))).await);
}

#[tokio::test]
async fn unauthenticated_sessions_are_closed_without_a_notice() {
    set_password("hunter2");
    let (server, url) = start_server().await;

    let mut pending = RawClient::connect(&url).await.expect("connect");
    let (_uuid, _key) = pending.read_greeting().await.expect("greeting");
    assert_eq!(server.client_count().await, 1);

    server.close().await;

    // No teapot for a session that never authenticated; the next thing
    // the peer sees is the close itself.
    let next = tokio::time::timeout(WAIT, pending.recv_message()).await;
    assert!(
        matches!(next, Ok(Err(_))),
        "expected the socket to close without a frame, got {next:?}"
    );
    assert_eq!(server.client_count().await, 0);
}
