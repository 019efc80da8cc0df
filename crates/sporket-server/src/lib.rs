// sporket-server: acceptor side of the Sporket message bus.
//
// A `Server` upgrades WebSocket connections on one path, wraps each in a
// per-session task that runs the signed-envelope handshake, and fans
// application events out over a broadcast channel. Sessions live in a
// uuid-keyed registry used for broadcast, targeted send, and graceful
// shutdown.

pub mod config;
pub mod error;
mod server;
mod session;
mod state;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::Server;
pub use state::ServerEvent;
