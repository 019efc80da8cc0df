//! The acceptor: binds the listener, routes the upgrade path, owns the
//! registry-facing operations (broadcast, targeted send, graceful close).

use axum::Router;
use axum::routing::get;
use serde_json::json;
use sporket_protocol::{MessageKind, Payload, Status, payload_object, reply_text};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::session::upgrade_handler;
use crate::state::{ServerEvent, ServerState, SessionCommand};

/// Grace between the shutdown notice and the session disconnects, letting
/// in-flight frames flush.
const SHUTDOWN_NOTICE_GRACE: Duration = Duration::from_millis(1000);
/// Grace between the disconnects and aborting the acceptor.
const SHUTDOWN_FLUSH_GRACE: Duration = Duration::from_millis(500);

pub struct Server {
    config: ServerConfig,
    state: ServerState,
    listening: AtomicBool,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let state = ServerState::new(config.auth_timeout);
        Self {
            config,
            state,
            listening: AtomicBool::new(false),
            serve_task: Mutex::new(None),
        }
    }

    /// Subscribe to `ClientConnect` / `ClientDisconnect` / `Message`
    /// events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.state.events.subscribe()
    }

    /// Bind and start accepting upgrades. Returns the bound address
    /// (useful with port 0). Calling listen twice is an error.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyListening);
        }
        let bind_addr = format!("{}:{}", self.config.hostname, self.config.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: bind_addr,
            source,
        })?;

        let router = build_router(&self.config.path, self.state.clone());
        let shutdown = self.state.shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "acceptor failed");
            }
        });
        *self.serve_task.lock().await = Some(task);
        info!(%addr, path = %self.config.path, "listening");
        Ok(addr)
    }

    /// Graceful shutdown: notify authenticated sessions with a signed
    /// ERROR/418, give frames time to flush, disconnect every session,
    /// then abort the acceptor.
    pub async fn close(&self) {
        info!("closing server");
        for (uuid, authenticated, commands) in self.state.handles().await {
            if !authenticated {
                continue;
            }
            let notice = SessionCommand::Send {
                kind: MessageKind::Error,
                status: Status::Teapot,
                payload: payload_object(json!({ "message": reply_text::SHUTTING_DOWN })),
            };
            if commands.send(notice).await.is_err() {
                debug!(%uuid, "shutdown notice to closed session");
            }
        }
        tokio::time::sleep(SHUTDOWN_NOTICE_GRACE).await;

        for (_, _, commands) in self.state.handles().await {
            let _ = commands.send(SessionCommand::Disconnect).await;
        }
        tokio::time::sleep(SHUTDOWN_FLUSH_GRACE).await;

        self.state.shutdown.cancel();
        if let Some(task) = self.serve_task.lock().await.take() {
            let _ = task.await;
        }
        info!("server closed");
    }

    /// Broadcast a DATA payload to every authenticated session.
    pub async fn send(&self, payload: &Payload) {
        for (uuid, authenticated, commands) in self.state.handles().await {
            if !authenticated {
                continue;
            }
            let command = SessionCommand::Send {
                kind: MessageKind::Data,
                status: Status::Ok,
                payload: payload.clone(),
            };
            if commands.send(command).await.is_err() {
                debug!(%uuid, "broadcast to closed session");
            }
        }
    }

    /// Targeted DATA send. False when the uuid is unknown, the session
    /// has not authenticated, or its task is gone.
    pub async fn send_to(&self, uuid: Uuid, payload: &Payload) -> bool {
        let Some((authenticated, commands)) = self.state.handle(&uuid).await else {
            return false;
        };
        if !authenticated {
            return false;
        }
        commands
            .send(SessionCommand::Send {
                kind: MessageKind::Data,
                status: Status::Ok,
                payload: payload.clone(),
            })
            .await
            .is_ok()
    }

    /// Number of live sessions (authenticated or not).
    pub async fn client_count(&self) -> usize {
        self.state.client_count().await
    }
}

fn build_router(path: &str, state: ServerState) -> Router {
    let path = normalize_path(path);
    let mut router = Router::new().route(&path, get(upgrade_handler));
    if path != "/" {
        // Accept the trailing-slash spelling too; everything else 404s.
        router = router.route(&format!("{path}/"), get(upgrade_handler));
    }
    router.with_state(state)
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_owned();
    }
    if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}
