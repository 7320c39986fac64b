//! Client WebSocket Endpoint
//!
//! Serves `/ws/prices`: a persistent bidirectional connection per client,
//! driven by the subscription manager and by inbound JSON control frames.

pub mod protocol;
pub mod server;
pub mod session;

pub use protocol::{ClientMessage, ProtocolError, ServerMessage, parse_client_message};
pub use server::{WsServer, WsServerError, WsState, router};
