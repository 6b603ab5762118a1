// ABOUTME: WebSocket protocol support: frame model, wire codec, and the opening handshake
// ABOUTME: Public surface re-exports the pieces a pipeline handler or client needs directly

pub mod codec;
pub mod frame;
pub mod handshake;

pub use codec::{Role, WsCodecError, WebSocketCodec};
pub use frame::{Operation, WebSocketFrame};
pub use handshake::{accept_request, ClientHandshake, HandshakeError, HandshakeState};
