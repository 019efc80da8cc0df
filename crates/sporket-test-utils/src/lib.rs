// sporket-test-utils: shared test peers for the bus integration suites.
//
// Provides a raw envelope-speaking WebSocket client (for driving the
// server by hand, including forged frames), a scriptable mock bus server
// (for exercising the real client), and broadcast-channel wait helpers.

pub mod mock_server;
pub mod raw_client;

pub use mock_server::{MockBehavior, MockBusServer};
pub use raw_client::RawClient;

use std::time::Duration;
use tokio::sync::broadcast;

/// Set the shared secret for in-process endpoints.
pub fn set_password(value: &str) {
    // SAFETY: test binaries call this before spawning endpoints, and all
    // callers within one binary use the same value.
    unsafe { std::env::set_var(sporket_protocol::PASSWORD_ENV, value) };
}

/// Receive the next broadcast event within the wait window. Lagged
/// receivers skip ahead; a closed channel or a timeout yields `None`.
pub async fn next_event<T: Clone>(rx: &mut broadcast::Receiver<T>, wait: Duration) -> Option<T> {
    tokio::time::timeout(wait, async {
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .unwrap_or(None)
}

/// Receive events until one matches the predicate, within the wait window.
pub async fn next_matching<T, F>(
    rx: &mut broadcast::Receiver<T>,
    wait: Duration,
    mut matches: F,
) -> Option<T>
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(wait, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .unwrap_or(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sporket_protocol::{Message, MessageKind, Status, payload_object};

    /// Test: the mock binds a random port and reports a usable address.
    #[tokio::test]
    async fn mock_server_starts_and_reports_port() {
        let server = MockBusServer::start("hunter2").await.unwrap();
        assert_ne!(server.local_addr().port(), 0, "should bind to a real port");
    }

    /// Test: the raw client can run the whole handshake against the mock.
    #[tokio::test]
    async fn raw_client_handshakes_against_the_mock() {
        let server = MockBusServer::start("hunter2").await.unwrap();
        let mut client = RawClient::connect(&server.url()).await.unwrap();

        let (uuid, key) = client.authenticate("hunter2").await.unwrap();
        assert!(!uuid.is_empty(), "session uuid must not be empty");

        // Authenticated DATA is echoed back, signed.
        let payload = payload_object(json!({ "ping": true }));
        let data = Message::new(&payload, MessageKind::Data, Status::Ok).sign(&key);
        client.send_message(&data).await.unwrap();

        let echo = client.recv_message().await.unwrap();
        assert_eq!(echo.kind, MessageKind::Data);
        assert!(echo.verify(Some(&key)));
        assert_eq!(echo.parse_payload(), payload);
    }

    /// Test: a mismatched challenge earns an unauthorized error.
    #[tokio::test]
    async fn mock_rejects_a_wrong_password() {
        let server = MockBusServer::start("hunter2").await.unwrap();
        let mut client = RawClient::connect(&server.url()).await.unwrap();

        let (uuid, key) = client.read_greeting().await.unwrap();
        let verdict = client.answer_challenge("wrong", &uuid, &key).await.unwrap();
        assert_eq!(verdict.kind, MessageKind::Error);
        assert_eq!(verdict.status, Status::Unauthorized);
    }

    /// Test: two clients get distinct session uuids.
    #[tokio::test]
    async fn mock_handles_multiple_clients_independently() {
        let server = MockBusServer::start("hunter2").await.unwrap();
        let mut first = RawClient::connect(&server.url()).await.unwrap();
        let mut second = RawClient::connect(&server.url()).await.unwrap();

        let (first_uuid, _) = first.authenticate("hunter2").await.unwrap();
        let (second_uuid, _) = second.authenticate("hunter2").await.unwrap();
        assert_ne!(
            first_uuid, second_uuid,
            "each connection gets a unique session"
        );
    }
}
