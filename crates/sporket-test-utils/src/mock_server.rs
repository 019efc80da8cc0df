// A mock bus server for exercising the real client: runs the server half
// of the handshake with an explicit password (independent of the
// environment), then follows a scripted post-auth behavior.

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sporket_protocol::{
    Message, MessageKind, SessionKey, Status, challenge, payload_object, reply_text,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;
use uuid::Uuid;

type ServerWsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;
type ServerWsSink = futures_util::stream::SplitSink<ServerWsStream, WsFrame>;

/// What the mock does once a client authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Echo authenticated DATA payloads back as signed DATA.
    Echo,
    /// Send a signed ERROR/418 immediately after the success reply.
    TeapotAfterAuth,
    /// Send a DATA frame with a garbage signature after the success reply.
    ForgedDataAfterAuth,
}

/// Binds `127.0.0.1:0`; each test spins up its own isolated instance.
pub struct MockBusServer {
    addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
    connection_tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl MockBusServer {
    pub async fn start(password: &str) -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_with(password, MockBehavior::Echo).await
    }

    pub async fn start_with(
        password: &str,
        behavior: MockBehavior,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let password = password.to_owned();
        let connection_tasks = Arc::new(Mutex::new(Vec::new()));

        let tasks = Arc::clone(&connection_tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let password = password.clone();
                        let task = tokio::spawn(async move {
                            // Client drops are expected in tests; swallow.
                            let _ = handle_connection(stream, &password, behavior).await;
                        });
                        if let Ok(mut tasks) = tasks.lock() {
                            tasks.push(task);
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            accept_task,
            connection_tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Kill the listener and every live connection, releasing the port so
    /// subsequent dials fail.
    pub fn shutdown(self) {
        self.accept_task.abort();
        if let Ok(tasks) = self.connection_tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    password: &str,
    behavior: MockBehavior,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let uuid = Uuid::new_v4().to_string();
    let key = SessionKey::derive(&uuid);
    let mut authenticated = false;

    let greeting = Message::with_id(
        uuid.as_str(),
        &payload_object(json!({ "uuid": uuid })),
        MessageKind::Auth,
        Status::Ok,
    )
    .sign(&key);
    send(&mut write, &greeting).await?;

    while let Some(frame) = read.next().await {
        let text = match frame? {
            WsFrame::Text(text) => text,
            WsFrame::Ping(data) => {
                write.send(WsFrame::Pong(data)).await?;
                continue;
            }
            WsFrame::Close(_) => break,
            _ => continue,
        };

        let Ok(message) = serde_json::from_str::<Message>(&text) else {
            send(
                &mut write,
                &error_reply(&key, Status::BadRequest, reply_text::INVALID_SIGNATURE),
            )
            .await?;
            continue;
        };
        if !message.verify(Some(&key)) {
            send(
                &mut write,
                &error_reply(&key, Status::BadRequest, reply_text::INVALID_SIGNATURE),
            )
            .await?;
            continue;
        }

        if message.kind == MessageKind::Auth {
            let expected = challenge(password, &uuid);
            let supplied = message.parse_payload();
            if supplied.get("challenge").and_then(Value::as_str) == Some(expected.as_str()) {
                authenticated = true;
                let success = Message::new(
                    &payload_object(json!({ "success": true })),
                    MessageKind::Auth,
                    Status::Ok,
                )
                .sign(&key);
                send(&mut write, &success).await?;
                match behavior {
                    MockBehavior::Echo => {}
                    MockBehavior::TeapotAfterAuth => {
                        send(
                            &mut write,
                            &error_reply(&key, Status::Teapot, reply_text::SHUTTING_DOWN),
                        )
                        .await?;
                    }
                    MockBehavior::ForgedDataAfterAuth => {
                        let mut forged = Message::new(
                            &payload_object(json!({ "bogus": true })),
                            MessageKind::Data,
                            Status::Ok,
                        );
                        forged.signature = "Zm9yZ2Vk".to_owned();
                        send(&mut write, &forged).await?;
                    }
                }
            } else {
                send(
                    &mut write,
                    &error_reply(&key, Status::Unauthorized, reply_text::AUTH_FAILED),
                )
                .await?;
            }
        } else if authenticated {
            if behavior == MockBehavior::Echo {
                let echo = Message::new(&message.parse_payload(), MessageKind::Data, Status::Ok)
                    .sign(&key);
                send(&mut write, &echo).await?;
            }
        } else {
            send(
                &mut write,
                &error_reply(&key, Status::Unauthorized, reply_text::RESPOND_TO_CHALLENGE),
            )
            .await?;
        }
    }

    Ok(())
}

fn error_reply(key: &SessionKey, status: Status, text: &str) -> Message {
    Message::new(
        &payload_object(json!({ "message": text })),
        MessageKind::Error,
        status,
    )
    .sign(key)
}

async fn send(
    write: &mut ServerWsSink,
    message: &Message,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let json = serde_json::to_string(message)?;
    write.send(WsFrame::Text(json.into())).await?;
    Ok(())
}
