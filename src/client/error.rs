// ABOUTME: Unified error type for the public client surface, folding in every layer's own error
// ABOUTME: One top-level enum so callers of `connect`/`send`/`close` only need to match on a single type

use crate::channel::ChannelError;
use crate::gds::GdsCodecError;
use crate::http::HttpError;
use crate::pool::PoolError;
use crate::ws::{HandshakeError, WsCodecError};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("buffer error: {0}")]
    Buffer(#[from] crate::buffer::BufferError),

    #[error("websocket codec error: {0}")]
    WebSocket(#[from] WsCodecError),

    #[error("gds codec error: {0}")]
    Gds(#[from] GdsCodecError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("http parsing error: {0}")]
    Http(#[from] HttpError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

pub type FrameResult<T> = Result<T, FrameError>;
