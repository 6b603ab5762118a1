// ABOUTME: Channel contract consumed by the pipeline and codecs: state, endpoints, attributes, modules
// ABOUTME: Concrete transport wiring (accepting sockets, driving reads) lives in client::default, not here

use crate::message::Message;
use crate::pipeline::Pipeline;
use crate::pool::ChunkPool;
use crate::ws::HandshakeState;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ChannelState {
    fn from_u8(v: u8) -> ChannelState {
        match v {
            0 => ChannelState::Open,
            1 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// A value stored in a channel's attribute map, keyed by string. Reserved
/// key prefixes aren't defined by the core; callers may set arbitrary keys.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Text(String),
    Integer(i64),
    Flag(bool),
    Bytes(Vec<u8>),
}

/// Which wire protocol a channel's pipeline is currently speaking. Set
/// once a handshake completes (or immediately, for a connection that
/// skips negotiation and is constructed directly as GDS).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolTag {
    Unnegotiated,
    WebSocket,
    Gds,
}

struct Endpoints {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

struct Inner {
    pool: ChunkPool,
    state: AtomicU8,
    pipeline: Pipeline,
    attributes: DashMap<String, AttributeValue>,
    modules: DashMap<String, ()>,
    endpoints: parking_lot::RwLock<Endpoints>,
    protocol: parking_lot::RwLock<ProtocolTag>,
    handshake: parking_lot::RwLock<HandshakeState>,
    close_tx: watch::Sender<bool>,
}

/// The per-connection handle the pipeline, codecs, and application
/// handlers all operate against. Cheap to clone; clones share the same
/// underlying state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Builds a channel with no endpoints attached, suitable for tests
    /// and for pipeline handlers that don't need real socket addresses.
    pub fn new_detached(pool: ChunkPool) -> Self {
        Channel::with_pipeline(pool, Pipeline::new())
    }

    /// Builds a channel around an already-cloned per-connection pipeline.
    /// The clone happens before the channel exists, so it's threaded in
    /// here rather than built internally.
    pub fn with_pipeline(pool: ChunkPool, pipeline: Pipeline) -> Self {
        let (close_tx, _) = watch::channel(false);
        Channel {
            inner: Arc::new(Inner {
                pool,
                state: AtomicU8::new(ChannelState::Open as u8),
                pipeline,
                attributes: DashMap::new(),
                modules: DashMap::new(),
                endpoints: parking_lot::RwLock::new(Endpoints {
                    local: None,
                    remote: None,
                }),
                protocol: parking_lot::RwLock::new(ProtocolTag::Unnegotiated),
                handshake: parking_lot::RwLock::new(HandshakeState::AwaitingHandshake),
                close_tx,
            }),
        }
    }

    pub fn with_endpoints(pool: ChunkPool, local: SocketAddr, remote: SocketAddr) -> Self {
        Channel::with_endpoints_and_pipeline(pool, local, remote, Pipeline::new())
    }

    pub fn with_endpoints_and_pipeline(
        pool: ChunkPool,
        local: SocketAddr,
        remote: SocketAddr,
        pipeline: Pipeline,
    ) -> Self {
        let channel = Channel::with_pipeline(pool, pipeline);
        {
            let mut g = channel.inner.endpoints.write();
            g.local = Some(local);
            g.remote = Some(remote);
        }
        channel
    }

    pub fn pool(&self) -> &ChunkPool {
        &self.inner.pool
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.read().local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.read().remote
    }

    pub fn protocol(&self) -> ProtocolTag {
        *self.inner.protocol.read()
    }

    pub fn set_protocol(&self, tag: ProtocolTag) {
        *self.inner.protocol.write() = tag;
    }

    /// Where this channel sits in the WebSocket opening handshake. A
    /// channel built for a connection that skips negotiation (GDS) is
    /// moved straight to `Upgraded` by its caller; one still negotiating
    /// stays at the default `AwaitingHandshake` until the handshake
    /// resolves one way or the other.
    pub fn handshake_state(&self) -> HandshakeState {
        *self.inner.handshake.read()
    }

    pub fn set_handshake_state(&self, state: HandshakeState) {
        *self.inner.handshake.write() = state;
    }

    /// Marks the channel closing. Idempotent: a second call observes the
    /// same terminal state without error. Fires the pipeline's
    /// closed-event chain exactly once, on the transition into `Closing`,
    /// and wakes every [`ChunkedBuffer::drain_async`] call racing against
    /// [`Channel::close_watch`] so an in-flight drain ends with
    /// `BufferError::Closed` instead of completing against a dead channel.
    ///
    /// [`ChunkedBuffer::drain_async`]: crate::buffer::ChunkedBuffer::drain_async
    pub fn begin_close(&self) {
        let prev = self
            .inner
            .state
            .swap(ChannelState::Closing as u8, Ordering::AcqRel);
        if prev == ChannelState::Open as u8 {
            *self.inner.handshake.write() = HandshakeState::Closed;
            let _ = self.inner.close_tx.send(true);
            self.inner.pipeline.dispatch_closed(self);
        }
    }

    /// A receiver that observes `true` once this channel begins closing.
    /// Each call to `drain_async` should take a fresh subscription so it
    /// sees closes that happen after the drain starts as well as ones
    /// already in effect when it starts.
    pub fn close_watch(&self) -> watch::Receiver<bool> {
        self.inner.close_tx.subscribe()
    }

    pub fn finish_close(&self) {
        self.inner.state.store(ChannelState::Closed as u8, Ordering::Release);
    }

    /// Dispatches an open event, then an incoming message, rejecting the
    /// latter once the channel has begun closing -- the same
    /// channel-closed error that outbound sends fail with, applied
    /// symmetrically here to inbound dispatch.
    pub fn dispatch_opened(&self) {
        self.inner.pipeline.dispatch_opened(self);
    }

    pub fn dispatch_incoming(&self, message: &mut Message) -> Result<(), ChannelError> {
        if !self.is_active() {
            return Err(ChannelError::Closed);
        }
        self.inner.pipeline.dispatch_incoming(self, message);
        Ok(())
    }

    pub fn dispatch_outgoing(&self, message: &mut Message) -> Result<(), ChannelError> {
        if !self.is_active() {
            return Err(ChannelError::Closed);
        }
        self.inner.pipeline.dispatch_outgoing(self, message);
        Ok(())
    }

    pub fn set_attribute(&self, key: &str, value: AttributeValue) {
        self.inner.attributes.insert(key.to_string(), value);
    }

    pub fn get_attribute(&self, key: &str) -> Option<AttributeValue> {
        self.inner.attributes.get(key).map(|v| v.clone())
    }

    pub fn remove_attribute(&self, key: &str) -> Option<AttributeValue> {
        self.inner.attributes.remove(key).map(|(_, v)| v)
    }

    pub fn add_module(&self, name: &str) {
        self.inner.modules.insert(name.to_string(), ());
    }

    pub fn remove_module(&self, name: &str) -> bool {
        self.inner.modules.remove(name).is_some()
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.inner.modules.contains_key(name)
    }
}
