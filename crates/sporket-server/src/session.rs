//! Per-connection session: the `ServerClient` state machine plus the
//! task that pumps its WebSocket.
//!
//! The state machine itself is synchronous and pure (frame text in,
//! outcome out); the surrounding task owns the socket, the outbound
//! command channel, the auth deadline, and the cancellation token that
//! detaches everything in one signal.

use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::{Value, json};
use sporket_protocol::{
    Message, MessageKind, PASSWORD_ENV, Payload, SessionKey, Status, challenge, payload_object,
    reply_text,
};
use std::env;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::{ServerEvent, ServerState, SessionCommand};

const COMMAND_BUFFER: usize = 32;

pub(crate) async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// What the session task should do with an inbound frame.
pub(crate) enum FrameOutcome {
    /// Send this envelope; the connection stays open.
    Reply(Message),
    /// The challenge passed: send this envelope and surface the
    /// authenticated session.
    Accept(Message),
    /// Surface a verified payload to the application.
    Surface(Payload),
}

/// Server half of one session: uuid, derived key, auth flag.
pub(crate) struct ServerClient {
    uuid: Uuid,
    key: SessionKey,
    authenticated: bool,
}

impl ServerClient {
    pub fn new(uuid: Uuid) -> Self {
        let key = SessionKey::derive(&uuid.to_string());
        Self {
            uuid,
            key,
            authenticated: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The identity announcement: a signed AUTH whose id is the session
    /// uuid (redundant with the payload; peers key off the payload).
    pub fn greeting(&self) -> Message {
        let uuid = self.uuid.to_string();
        Message::with_id(
            uuid.as_str(),
            &payload_object(json!({ "uuid": uuid })),
            MessageKind::Auth,
            Status::Ok,
        )
        .sign(&self.key)
    }

    /// Build and sign an outbound envelope with a fresh id.
    pub fn build(&self, kind: MessageKind, status: Status, payload: &Payload) -> Message {
        Message::new(payload, kind, status).sign(&self.key)
    }

    fn error(&self, status: Status, text: &str) -> Message {
        self.build(
            MessageKind::Error,
            status,
            &payload_object(json!({ "message": text })),
        )
    }

    /// Run one inbound frame through the validation gate.
    ///
    /// Unparseable frames and bad signatures get a 400 and keep the
    /// connection; the transport is left to the peer.
    pub fn handle_frame(&mut self, text: &str) -> FrameOutcome {
        let Ok(message) = serde_json::from_str::<Message>(text) else {
            return FrameOutcome::Reply(self.error(Status::BadRequest, reply_text::INVALID_SIGNATURE));
        };
        if !message.verify(Some(&self.key)) {
            return FrameOutcome::Reply(self.error(Status::BadRequest, reply_text::INVALID_SIGNATURE));
        }
        if message.kind == MessageKind::Auth {
            return self.handle_auth(&message.parse_payload());
        }
        if self.authenticated {
            FrameOutcome::Surface(message.parse_payload())
        } else {
            FrameOutcome::Reply(self.error(Status::Unauthorized, reply_text::RESPOND_TO_CHALLENGE))
        }
    }

    /// Compare the supplied challenge against one recomputed from the
    /// current shared secret; the env read happens per computation so a
    /// rotated secret applies to the next handshake.
    fn handle_auth(&mut self, payload: &Payload) -> FrameOutcome {
        let password = env::var(PASSWORD_ENV).unwrap_or_default();
        let expected = challenge(&password, &self.uuid.to_string());
        match payload.get("challenge").and_then(Value::as_str) {
            Some(supplied) if supplied == expected => {
                self.authenticated = true;
                FrameOutcome::Accept(self.build(
                    MessageKind::Auth,
                    Status::Ok,
                    &payload_object(json!({ "success": true })),
                ))
            }
            _ => FrameOutcome::Reply(self.error(Status::Unauthorized, reply_text::AUTH_FAILED)),
        }
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

async fn serve_socket(mut socket: WebSocket, state: ServerState) {
    let uuid = Uuid::new_v4();
    let (command_tx, mut commands) = mpsc::channel(COMMAND_BUFFER);
    let cancel = state.shutdown.child_token();
    state.register(uuid, command_tx).await;
    info!(%uuid, "client connected");

    let mut client = ServerClient::new(uuid);

    if send_frame(&mut socket, &client.greeting()).await.is_err() {
        finish(&state, uuid).await;
        return;
    }

    let auth_deadline = tokio::time::sleep(state.auth_timeout);
    tokio::pin!(auth_deadline);

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(WsFrame::Text(text))) => match client.handle_frame(text.as_str()) {
                    FrameOutcome::Reply(reply) => {
                        if send_frame(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    FrameOutcome::Accept(reply) => {
                        state.mark_authenticated(&uuid).await;
                        info!(%uuid, "client authenticated");
                        let _ = state.events.send(ServerEvent::ClientConnect { uuid });
                        if send_frame(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    FrameOutcome::Surface(payload) => {
                        let _ = state.events.send(ServerEvent::Message { uuid, payload });
                    }
                },
                Some(Ok(WsFrame::Ping(data))) => {
                    let _ = socket.send(WsFrame::Pong(data)).await;
                }
                Some(Ok(WsFrame::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%uuid, error = %e, "websocket error");
                    break;
                }
            },
            Some(command) = commands.recv() => match command {
                SessionCommand::Send { kind, status, payload } => {
                    let envelope = client.build(kind, status, &payload);
                    if send_frame(&mut socket, &envelope).await.is_err() {
                        break;
                    }
                }
                SessionCommand::Disconnect => {
                    let _ = socket.send(WsFrame::Close(None)).await;
                    break;
                }
            },
            () = &mut auth_deadline, if !client.is_authenticated() => {
                warn!(%uuid, "authentication deadline expired");
                break;
            }
            () = cancel.cancelled() => break,
        }
    }

    // One signal detaches the whole session; redundant when the loop
    // exited for another reason, required when it did not.
    cancel.cancel();
    finish(&state, uuid).await;
}

async fn finish(state: &ServerState, uuid: Uuid) {
    if state.remove(&uuid).await {
        let _ = state.events.send(ServerEvent::ClientDisconnect { uuid });
    }
    info!(%uuid, "client disconnected");
}

async fn send_frame(socket: &mut WebSocket, message: &Message) -> Result<(), axum::Error> {
    let Ok(json) = serde_json::to_string(message) else {
        return Ok(());
    };
    socket.send(WsFrame::Text(json.into())).await
}
