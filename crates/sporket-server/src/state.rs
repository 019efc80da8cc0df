use sporket_protocol::{MessageKind, Payload, Status};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Events bridged from sessions to the hosting application.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A session completed the handshake.
    ClientConnect { uuid: Uuid },
    /// A session ended and was removed from the registry.
    ClientDisconnect { uuid: Uuid },
    /// A verified payload from an authenticated session.
    Message { uuid: Uuid, payload: Payload },
}

/// Outbound instructions for a session task. Envelopes are built and
/// signed inside the session, which owns the key.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Send {
        kind: MessageKind,
        status: Status,
        payload: Payload,
    },
    Disconnect,
}

/// Registry entry, one per live session.
pub(crate) struct SessionHandle {
    pub authenticated: bool,
    pub commands: mpsc::Sender<SessionCommand>,
}

/// Shared server state: the session registry, the application event
/// channel, and the root shutdown token (sessions run on child tokens).
#[derive(Clone)]
pub(crate) struct ServerState {
    pub registry: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
    pub events: broadcast::Sender<ServerEvent>,
    pub auth_timeout: Duration,
    pub shutdown: CancellationToken,
}

impl ServerState {
    pub fn new(auth_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            events,
            auth_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn register(&self, uuid: Uuid, commands: mpsc::Sender<SessionCommand>) {
        self.registry.write().await.insert(
            uuid,
            SessionHandle {
                authenticated: false,
                commands,
            },
        );
    }

    /// Remove a session; true when it was present, so the disconnect
    /// event fires exactly once.
    pub async fn remove(&self, uuid: &Uuid) -> bool {
        self.registry.write().await.remove(uuid).is_some()
    }

    pub async fn mark_authenticated(&self, uuid: &Uuid) -> bool {
        if let Some(handle) = self.registry.write().await.get_mut(uuid) {
            handle.authenticated = true;
            return true;
        }
        false
    }

    /// Snapshot of (uuid, authenticated, sender) so fan-out never holds
    /// the registry lock across channel sends.
    pub async fn handles(&self) -> Vec<(Uuid, bool, mpsc::Sender<SessionCommand>)> {
        self.registry
            .read()
            .await
            .iter()
            .map(|(uuid, handle)| (*uuid, handle.authenticated, handle.commands.clone()))
            .collect()
    }

    pub async fn handle(&self, uuid: &Uuid) -> Option<(bool, mpsc::Sender<SessionCommand>)> {
        self.registry
            .read()
            .await
            .get(uuid)
            .map(|handle| (handle.authenticated, handle.commands.clone()))
    }

    pub async fn client_count(&self) -> usize {
        self.registry.read().await.len()
    }
}
