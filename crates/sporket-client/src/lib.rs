// sporket-client: client side of the Sporket message bus.
//
// `Socket` keeps one outbound WebSocket alive with bounded auto-reconnect;
// `Sporket` layers the signed-envelope handshake and application sends on
// top of it.

pub mod socket;
pub mod sporket;

pub use socket::{Socket, SocketConfig, SocketEvent};
pub use sporket::{Sporket, SporketEvent};
