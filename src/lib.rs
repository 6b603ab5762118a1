pub mod buffer;
pub mod channel;
pub mod client;
pub mod gds;
pub mod http;
pub mod message;
pub mod pipeline;
pub mod pool;
pub mod ws;

#[cfg(test)]
mod tests;

pub use buffer::{BufferError, BufferSnapshot, ChunkedBuffer};
pub use channel::{AttributeValue, Channel, ChannelError, ChannelState, ProtocolTag};
pub use message::{Message, MessageTag};
pub use pipeline::{Direction, HandlerId, Pipeline};
pub use pool::{ChunkPool, PoolError};

pub use client::{ConnectionBuilder, FrameConnection, FrameError, FrameResult, TokioConnection};

/// Error returned by functions that don't have a more specific error
/// type of their own.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for this crate's operations.
///
/// # Examples
///
/// ## Connecting over WebSocket
///
/// ```rust,no_run
/// use framewire::ConnectionBuilder;
/// use framewire::client::FrameConnection;
/// use framewire::Message;
/// use framewire::ws::WebSocketFrame;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let conn = ConnectionBuilder::new("echo.websocket.org", 80)
///         .websocket("/")
///         .connect()
///         .await?;
///
///     conn.send(Message::WebSocket(WebSocketFrame::text("hello", Some([1, 2, 3, 4]))))
///         .await?;
///
///     conn.close().await?;
///     Ok(())
/// }
/// ```
///
/// ## Connecting over GDS
///
/// ```rust,no_run
/// use framewire::ConnectionBuilder;
/// use framewire::client::FrameConnection;
/// use framewire::Message;
/// use framewire::gds::GdsFrame;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let conn = ConnectionBuilder::new("localhost", 9000)
///         .gds()
///         .connect()
///         .await?;
///
///     conn.send(Message::Gds(GdsFrame::ping(1))).await?;
///     conn.close().await?;
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
