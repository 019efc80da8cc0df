/// Reconnect behavior against a server that disappears: one close per
/// failed redial, waits growing linearly from `min_wait`, and a terminal
/// disconnect once the attempt cap is spent.
use sporket_client::{SocketConfig, Sporket, SporketEvent};
use sporket_test_utils::{MockBusServer, next_event, next_matching, set_password};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn bounded_backoff_terminates_after_max_attempts() {
    set_password("hunter2");
    let server = MockBusServer::start("hunter2").await.expect("mock server");
    let config = SocketConfig {
        max_attempts: 3,
        min_wait: Duration::from_millis(100),
        max_wait: Duration::from_millis(200),
        wait_extend: Duration::from_millis(50),
        ..SocketConfig::new(server.url())
    };
    let client = Sporket::new(config);
    let mut events = client.subscribe();
    client.connect();

    assert!(
        next_matching(&mut events, WAIT, |e| matches!(e, SporketEvent::Authenticated))
            .await
            .is_some()
    );

    let started = Instant::now();
    server.shutdown();

    // The lost link closes once, then each of the three failed redials
    // closes again before the terminal disconnect.
    let mut closes = 0;
    loop {
        match next_event(&mut events, WAIT).await {
            Some(SporketEvent::Close) => closes += 1,
            Some(SporketEvent::Disconnect) => break,
            Some(_) => {}
            None => panic!("expected a terminal disconnect, saw {closes} closes"),
        }
    }
    assert_eq!(closes, 4);

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(450),
        "backoff waits of 100+150+200ms must elapse, got {elapsed:?}"
    );
    assert!(!client.is_connected());
}

#[tokio::test]
async fn explicit_disconnect_cancels_a_pending_reconnect() {
    set_password("hunter2");
    let server = MockBusServer::start("hunter2").await.expect("mock server");
    let config = SocketConfig {
        max_attempts: 10,
        min_wait: Duration::from_millis(500),
        max_wait: Duration::from_millis(1000),
        wait_extend: Duration::from_millis(100),
        ..SocketConfig::new(server.url())
    };
    let client = Sporket::new(config);
    let mut events = client.subscribe();
    client.connect();
    assert!(
        next_matching(&mut events, WAIT, |e| matches!(e, SporketEvent::Authenticated))
            .await
            .is_some()
    );

    server.shutdown();
    assert!(
        next_matching(&mut events, WAIT, |e| matches!(e, SporketEvent::Close))
            .await
            .is_some()
    );

    // Disconnect during the backoff window: the timer is cancelled and
    // the disconnect surfaces promptly.
    client.disconnect();
    let acknowledged = Instant::now();
    assert!(
        next_matching(&mut events, WAIT, |e| matches!(e, SporketEvent::Disconnect))
            .await
            .is_some()
    );
    assert!(
        acknowledged.elapsed() < Duration::from_millis(400),
        "disconnect must not wait out the backoff timer"
    );
    assert!(!client.is_connected());
}
