// ABOUTME: Client-facing surface: connection builder, the tokio-backed connection, and shared error type
// ABOUTME: Application code typically only needs `ConnectionBuilder` and `FrameConnection`

pub mod builder;
pub mod default;
pub mod error;
pub mod traits;

pub use builder::{ConnectionBuilder, Protocol};
pub use default::TokioConnection;
pub use error::{FrameError, FrameResult};
pub use traits::{EstablishedObserver, FrameConnection};
