//! Sporket: the authenticated bus client.
//!
//! A `Sporket` owns a [`Socket`] and delegates lifecycle to it. On every
//! fresh link the server announces a session uuid; the driver derives the
//! HMAC key from it, answers the password challenge, and only then lets
//! application payloads flow. The session identity never survives a
//! reconnect — close and disconnect both reset it, and the next link
//! starts a fresh handshake.

use crate::socket::{Socket, SocketConfig, SocketEvent};
use serde_json::{Value, json};
use sporket_protocol::{
    Message, MessageKind, PASSWORD_ENV, Payload, SessionKey, Status, challenge, payload_object,
};
use std::env;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum SporketEvent {
    /// The link opened; the handshake is about to run.
    Connect,
    /// The challenge was accepted; sends are now allowed.
    Authenticated,
    /// A verified DATA or PING payload.
    Message(Payload),
    /// The link closed; auto-reconnect may follow.
    Close,
    /// The socket is done (explicit disconnect, auth failure, server
    /// shutdown, or reconnect exhaustion).
    Disconnect,
}

#[derive(Default)]
struct AuthState {
    uuid: String,
    key: Option<SessionKey>,
    authenticated: bool,
}

pub struct Sporket {
    socket: Socket,
    state: Arc<RwLock<AuthState>>,
    events: broadcast::Sender<SporketEvent>,
}

impl Sporket {
    /// Build the client and spawn its protocol driver. Idle until
    /// [`Sporket::connect`] is called.
    pub fn new(config: SocketConfig) -> Self {
        let (socket, socket_events) = Socket::new(config);
        let (events, _) = broadcast::channel(64);
        let state = Arc::new(RwLock::new(AuthState::default()));
        tokio::spawn(drive(
            socket.clone(),
            socket_events,
            Arc::clone(&state),
            events.clone(),
        ));
        Self {
            socket,
            state,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SporketEvent> {
        self.events.subscribe()
    }

    pub fn connect(&self) {
        self.socket.connect();
    }

    pub fn disconnect(&self) {
        self.socket.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_open()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.authenticated
    }

    /// The server-assigned session uuid, once the handshake has started.
    pub async fn session_uuid(&self) -> Option<String> {
        let state = self.state.read().await;
        if state.uuid.is_empty() {
            None
        } else {
            Some(state.uuid.clone())
        }
    }

    /// Send an application payload as a signed DATA envelope.
    pub async fn send(&self, payload: &Payload) -> bool {
        self.send_with(payload, MessageKind::Data, Status::Ok).await
    }

    /// Send with an explicit kind and status. Returns `false` when the
    /// link is down, the key is missing, or (for non-AUTH kinds) the
    /// session is not yet authenticated.
    pub async fn send_with(&self, payload: &Payload, kind: MessageKind, status: Status) -> bool {
        if !self.socket.is_open() {
            return false;
        }
        let state = self.state.read().await;
        if kind != MessageKind::Auth && !state.authenticated {
            return false;
        }
        let Some(key) = state.key.as_ref() else {
            return false;
        };
        self.socket
            .send_json(&Message::new(payload, kind, status).sign(key))
    }
}

impl Drop for Sporket {
    fn drop(&mut self) {
        self.socket.disconnect();
    }
}

// ---------------------------------------------------------------------------
// Protocol driver
// ---------------------------------------------------------------------------

async fn drive(
    socket: Socket,
    mut socket_events: mpsc::UnboundedReceiver<SocketEvent>,
    state: Arc<RwLock<AuthState>>,
    events: broadcast::Sender<SporketEvent>,
) {
    while let Some(event) = socket_events.recv().await {
        match event {
            SocketEvent::Connect => {
                let _ = events.send(SporketEvent::Connect);
            }
            SocketEvent::Frame(text) => handle_frame(&text, &socket, &state, &events).await,
            SocketEvent::Close => {
                *state.write().await = AuthState::default();
                let _ = events.send(SporketEvent::Close);
            }
            SocketEvent::Disconnect => {
                *state.write().await = AuthState::default();
                let _ = events.send(SporketEvent::Disconnect);
            }
        }
    }
}

async fn handle_frame(
    text: &str,
    socket: &Socket,
    state: &Arc<RwLock<AuthState>>,
    events: &broadcast::Sender<SporketEvent>,
) {
    let Ok(message) = serde_json::from_str::<Message>(text) else {
        warn!("unparseable frame from server, dropping link");
        socket.disconnect();
        return;
    };
    let payload = message.parse_payload();

    // Identity announcement: derive the key from the decoded payload uuid
    // (never from the envelope id), verify, and answer the challenge.
    if message.kind == MessageKind::Auth {
        if let Some(uuid) = payload.get("uuid").and_then(Value::as_str) {
            let key = SessionKey::derive(uuid);
            if !message.verify(Some(&key)) {
                warn!("identity announcement failed verification, dropping link");
                socket.disconnect();
                return;
            }
            let proof = challenge(&env::var(PASSWORD_ENV).unwrap_or_default(), uuid);
            {
                let mut auth = state.write().await;
                auth.uuid = uuid.to_owned();
                auth.key = Some(key.clone());
                auth.authenticated = false;
            }
            debug!(%uuid, "answering session challenge");
            let answer = Message::new(
                &payload_object(json!({ "challenge": proof })),
                MessageKind::Auth,
                Status::Ok,
            )
            .sign(&key);
            if !socket.send_json(&answer) {
                socket.disconnect();
            }
            return;
        }
    }

    let key = state.read().await.key.clone();
    if !message.verify(key.as_ref()) {
        warn!("signature verification failed, dropping link");
        socket.disconnect();
        return;
    }

    match message.kind {
        MessageKind::Auth => {
            if payload.get("success").and_then(Value::as_bool) == Some(true) {
                state.write().await.authenticated = true;
                info!("session authenticated");
                let _ = events.send(SporketEvent::Authenticated);
            } else {
                warn!("authentication rejected, dropping link");
                socket.disconnect();
            }
        }
        MessageKind::Error => {
            if message.status == Status::Teapot {
                info!("server shutting down, dropping link");
                socket.disconnect();
            } else if !state.read().await.authenticated {
                // An error during the handshake is an authentication verdict.
                warn!(status = message.status.code(), "handshake rejected, dropping link");
                socket.disconnect();
            } else {
                debug!(status = message.status.code(), "server error frame");
            }
        }
        MessageKind::Data | MessageKind::Ping => {
            let _ = events.send(SporketEvent::Message(payload));
        }
    }
}
