//! Reconnecting WebSocket base.
//!
//! A [`Socket`] owns a single outbound connection, driven by a background
//! task. Callers issue commands (`connect`, `disconnect`, `send_json`) and
//! observe [`SocketEvent`]s on the channel returned by [`Socket::new`].
//! The socket only moves frames; protocol logic lives above it.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;
use tracing::{debug, warn};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Wait before the first reconnect, until a successful open resets the
/// schedule to `min_wait`.
const INITIAL_WAIT: Duration = Duration::from_millis(1000);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Connection and reconnect configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// WebSocket URL, e.g. `ws://localhost:9000/`.
    pub url: String,
    /// Redial automatically after an unexpected close.
    pub auto_connect: bool,
    /// Reconnect attempt cap; `0` means unbounded.
    pub max_attempts: u32,
    /// Wait after the first close following a successful open.
    pub min_wait: Duration,
    /// Upper clamp on the wait between attempts.
    pub max_wait: Duration,
    /// Linear growth added to the wait after each close.
    pub wait_extend: Duration,
}

impl SocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auto_connect: true,
            max_attempts: 10,
            min_wait: Duration::from_millis(2000),
            max_wait: Duration::from_millis(10000),
            wait_extend: Duration::from_millis(1000),
        }
    }
}

// ---------------------------------------------------------------------------
// Reconnect schedule
// ---------------------------------------------------------------------------

/// What to do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Redial after this delay.
    Retry(Duration),
    /// Auto-reconnect is off; stay idle.
    Stop,
    /// The attempt cap is spent; disconnect permanently.
    Exhausted,
}

/// Pure backoff state: linear growth clamped to `[min_wait, max_wait]`,
/// attempts capped at `max_attempts`, both reset by a successful open.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    auto_connect: bool,
    max_attempts: u32,
    min_wait: Duration,
    max_wait: Duration,
    wait_extend: Duration,
    wait_time: Duration,
    attempts: u32,
}

impl ReconnectSchedule {
    pub fn new(config: &SocketConfig) -> Self {
        Self {
            auto_connect: config.auto_connect,
            max_attempts: config.max_attempts,
            min_wait: config.min_wait,
            max_wait: config.max_wait,
            wait_extend: config.wait_extend,
            wait_time: INITIAL_WAIT,
            attempts: 0,
        }
    }

    /// A connection opened: reset the wait and the attempt counter.
    pub fn on_open(&mut self) {
        self.wait_time = self.min_wait;
        self.attempts = 0;
    }

    /// A connection closed (or a dial failed): decide the next step and
    /// grow the wait for the one after.
    pub fn on_close(&mut self) -> ReconnectDecision {
        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            return ReconnectDecision::Exhausted;
        }
        self.attempts += 1;
        if !self.auto_connect {
            return ReconnectDecision::Stop;
        }
        let delay = self.wait_time;
        self.wait_time = (self.wait_time + self.wait_extend).min(self.max_wait);
        ReconnectDecision::Retry(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// Lifecycle and frame events surfaced by the driver task.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The link opened (fresh connect or successful redial).
    Connect,
    /// An inbound text frame.
    Frame(String),
    /// The link closed remotely or a dial failed.
    Close,
    /// The socket is done: explicit disconnect or attempts exhausted.
    Disconnect,
}

enum SocketCommand {
    Connect,
    Disconnect,
    Send(String),
}

/// Handle to the driver task. Cheap to clone; all clones share the
/// underlying connection.
#[derive(Clone)]
pub struct Socket {
    commands: mpsc::UnboundedSender<SocketCommand>,
    open: Arc<AtomicBool>,
}

impl Socket {
    /// Spawn the driver task and return the handle plus its event stream.
    /// The socket stays idle until [`Socket::connect`] is called.
    pub fn new(config: SocketConfig) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let driver = Driver {
            schedule: ReconnectSchedule::new(&config),
            config,
            open: Arc::clone(&open),
            events: event_tx,
            commands: command_rx,
        };
        tokio::spawn(driver.run());
        (Self { commands, open }, event_rx)
    }

    /// Dial the configured URL. Cancels a pending reconnect timer and
    /// tears down an existing link first.
    pub fn connect(&self) {
        let _ = self.commands.send(SocketCommand::Connect);
    }

    /// Close the link and stop reconnecting.
    pub fn disconnect(&self) {
        let _ = self.commands.send(SocketCommand::Disconnect);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Serialize and send a JSON text frame iff the link is open;
    /// silently drops (returning `false`) otherwise.
    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        if !self.is_open() {
            return false;
        }
        let Ok(json) = serde_json::to_string(value) else {
            return false;
        };
        self.commands.send(SocketCommand::Send(json)).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

enum LinkOutcome {
    RemoteClosed,
    LocalDisconnect,
    Redial,
    Halt,
}

enum BackoffOutcome {
    Elapsed,
    ConnectNow,
    Disconnected,
    Halt,
}

struct Driver {
    config: SocketConfig,
    schedule: ReconnectSchedule,
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SocketEvent>,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
}

impl Driver {
    async fn run(mut self) {
        'idle: loop {
            match self.commands.recv().await {
                Some(SocketCommand::Connect) => {}
                Some(SocketCommand::Disconnect) => {
                    let _ = self.events.send(SocketEvent::Disconnect);
                    continue 'idle;
                }
                // Not open: sends are dropped silently.
                Some(SocketCommand::Send(_)) => continue 'idle,
                None => return,
            }

            'dial: loop {
                match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
                    Ok((stream, _response)) => {
                        self.schedule.on_open();
                        self.open.store(true, Ordering::SeqCst);
                        let _ = self.events.send(SocketEvent::Connect);
                        let outcome = self.drive_open(stream).await;
                        self.open.store(false, Ordering::SeqCst);
                        match outcome {
                            LinkOutcome::RemoteClosed => {
                                let _ = self.events.send(SocketEvent::Close);
                            }
                            LinkOutcome::LocalDisconnect => {
                                let _ = self.events.send(SocketEvent::Disconnect);
                                continue 'idle;
                            }
                            LinkOutcome::Redial => continue 'dial,
                            LinkOutcome::Halt => return,
                        }
                    }
                    Err(e) => {
                        debug!(url = %self.config.url, error = %e, "dial failed");
                        let _ = self.events.send(SocketEvent::Close);
                    }
                }

                match self.schedule.on_close() {
                    ReconnectDecision::Retry(delay) => match self.backoff(delay).await {
                        BackoffOutcome::Elapsed | BackoffOutcome::ConnectNow => continue 'dial,
                        BackoffOutcome::Disconnected => continue 'idle,
                        BackoffOutcome::Halt => return,
                    },
                    ReconnectDecision::Stop => continue 'idle,
                    ReconnectDecision::Exhausted => {
                        warn!(
                            attempts = self.schedule.attempts(),
                            "reconnect attempts exhausted"
                        );
                        let _ = self.events.send(SocketEvent::Disconnect);
                        continue 'idle;
                    }
                }
            }
        }
    }

    /// Pump an open link until it ends, handling commands concurrently.
    async fn drive_open(&mut self, mut stream: WsStream) -> LinkOutcome {
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsFrame::Text(text))) => {
                        let _ = self.events.send(SocketEvent::Frame(text.to_string()));
                    }
                    Some(Ok(WsFrame::Ping(data))) => {
                        let _ = stream.send(WsFrame::Pong(data)).await;
                    }
                    Some(Ok(WsFrame::Close(_))) | None => return LinkOutcome::RemoteClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket transport error");
                        return LinkOutcome::RemoteClosed;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(SocketCommand::Send(json)) => {
                        if stream.send(WsFrame::Text(json.into())).await.is_err() {
                            return LinkOutcome::RemoteClosed;
                        }
                    }
                    Some(SocketCommand::Disconnect) => {
                        let _ = stream.close(None).await;
                        return LinkOutcome::LocalDisconnect;
                    }
                    Some(SocketCommand::Connect) => {
                        let _ = stream.close(None).await;
                        return LinkOutcome::Redial;
                    }
                    None => {
                        let _ = stream.close(None).await;
                        return LinkOutcome::Halt;
                    }
                },
            }
        }
    }

    /// Sleep out the reconnect delay, still honoring commands. A manual
    /// connect cancels the timer and dials immediately.
    async fn backoff(&mut self, delay: Duration) -> BackoffOutcome {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return BackoffOutcome::Elapsed,
                cmd = self.commands.recv() => match cmd {
                    Some(SocketCommand::Connect) => return BackoffOutcome::ConnectNow,
                    Some(SocketCommand::Disconnect) => {
                        let _ = self.events.send(SocketEvent::Disconnect);
                        return BackoffOutcome::Disconnected;
                    }
                    Some(SocketCommand::Send(_)) => {}
                    None => return BackoffOutcome::Halt,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32, min: u64, max: u64, extend: u64) -> SocketConfig {
        SocketConfig {
            url: "ws://localhost:9000/".to_owned(),
            auto_connect: true,
            max_attempts,
            min_wait: Duration::from_millis(min),
            max_wait: Duration::from_millis(max),
            wait_extend: Duration::from_millis(extend),
        }
    }

    #[test]
    fn first_wait_before_any_open_is_the_initial_wait() {
        let mut schedule = ReconnectSchedule::new(&config(10, 2000, 10000, 1000));
        assert_eq!(
            schedule.on_close(),
            ReconnectDecision::Retry(INITIAL_WAIT),
            "before the first successful open the wait is the 1s default"
        );
    }

    #[test]
    fn backoff_grows_linearly_from_min_wait_and_clamps_at_max_wait() {
        let mut schedule = ReconnectSchedule::new(&config(0, 2000, 10000, 1000));
        schedule.on_open();

        let mut expected = Vec::new();
        for n in 0u64..12 {
            expected.push(Duration::from_millis((2000 + n * 1000).min(10000)));
        }
        for want in expected {
            assert_eq!(schedule.on_close(), ReconnectDecision::Retry(want));
        }
    }

    #[test]
    fn attempt_cap_yields_exactly_max_attempts_retries_then_exhaustion() {
        let mut schedule = ReconnectSchedule::new(&config(3, 100, 200, 50));
        schedule.on_open();

        assert_eq!(schedule.on_close(), ReconnectDecision::Retry(Duration::from_millis(100)));
        assert_eq!(schedule.on_close(), ReconnectDecision::Retry(Duration::from_millis(150)));
        assert_eq!(schedule.on_close(), ReconnectDecision::Retry(Duration::from_millis(200)));
        assert_eq!(schedule.on_close(), ReconnectDecision::Exhausted);
        // Exhaustion is sticky until the next successful open.
        assert_eq!(schedule.on_close(), ReconnectDecision::Exhausted);
    }

    #[test]
    fn successful_open_resets_attempts_and_wait() {
        let mut schedule = ReconnectSchedule::new(&config(3, 100, 200, 50));
        schedule.on_open();
        for _ in 0..3 {
            assert!(matches!(schedule.on_close(), ReconnectDecision::Retry(_)));
        }
        schedule.on_open();
        assert_eq!(schedule.attempts(), 0);
        assert_eq!(schedule.on_close(), ReconnectDecision::Retry(Duration::from_millis(100)));
    }

    #[test]
    fn auto_connect_off_stops_without_disconnecting() {
        let mut schedule = ReconnectSchedule::new(&SocketConfig {
            auto_connect: false,
            ..config(10, 2000, 10000, 1000)
        });
        schedule.on_open();
        assert_eq!(schedule.on_close(), ReconnectDecision::Stop);
    }

    #[test]
    fn zero_max_attempts_means_unbounded_retries() {
        let mut schedule = ReconnectSchedule::new(&config(0, 100, 200, 50));
        schedule.on_open();
        for _ in 0..100 {
            assert!(matches!(schedule.on_close(), ReconnectDecision::Retry(_)));
        }
    }
}
