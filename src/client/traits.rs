// ABOUTME: Async trait contracts for a frame connection, expressed with native `impl Future` returns
// ABOUTME: Kept free of a runtime dependency so test doubles can implement it without pulling in tokio

use crate::channel::Channel;
use crate::client::error::FrameResult;
use crate::message::Message;
use std::future::Future;

/// A live, bidirectional connection over one of the supported wire
/// protocols. Implemented by [`crate::client::default::TokioConnection`]
/// for real sockets, and by test doubles for pipeline-only unit tests.
pub trait FrameConnection: Send + Sync {
    /// Sends `message` through the outgoing handler chain and onto the
    /// transport. Resolves once the bytes are handed to the OS (not once
    /// the peer has acknowledged them).
    fn send(&self, message: Message) -> impl Future<Output = FrameResult<()>> + Send;

    /// Closes the channel. Idempotent; a second call resolves
    /// successfully without re-running close handlers.
    fn close(&self) -> impl Future<Output = FrameResult<()>> + Send;

    /// The channel backing this connection.
    fn channel(&self) -> &Channel;

    fn is_active(&self) -> bool {
        self.channel().is_active()
    }
}

/// Callback contract for handshake completion: fires once with `success`
/// set to whether the connection reached an established, usable state.
/// Registered once, before connecting.
pub trait EstablishedObserver: Send + Sync {
    fn on_established(&self, channel: &Channel, success: bool);
}

impl<F> EstablishedObserver for F
where
    F: Fn(&Channel, bool) + Send + Sync,
{
    fn on_established(&self, channel: &Channel, success: bool) {
        self(channel, success)
    }
}
