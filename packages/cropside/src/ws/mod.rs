//! WebSocket endpoint.
//!
//! One persistent, bidirectional connection per client: an in-band hello
//! handshake binds the issuer-supplied identity, then session joins,
//! workspace updates, and signaling relays multiplex over the same socket.

mod handler;
mod protocol;

pub use handler::ws_handler;
pub use protocol::{
    ClientMessage, NegotiationOutcome, RecommendationDraft, ServerMessage, WsUser,
};
