use std::time::Duration;

/// Acceptor configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    /// Upgrade path; requests matching `^{path}/?$` are upgraded, all
    /// other paths receive 404.
    pub path: String,
    /// Sessions that have not completed the handshake within this window
    /// are disconnected.
    pub auth_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_owned(),
            port: 9000,
            path: "/".to_owned(),
            auth_timeout: Duration::from_secs(30),
        }
    }
}
