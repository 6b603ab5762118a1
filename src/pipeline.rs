// ABOUTME: Ordered, lockable handler chains for opened/closed/incoming/outgoing events
// ABOUTME: Dispatch walks a chain under its lock, testing each handler's tag against the message variant

use crate::channel::Channel;
use crate::message::{Message, MessageTag};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a registered handler, used by `add_before`/`add_after`/
/// `remove`. Equality is by identity, not by the closure's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type DataHandlerFn = dyn Fn(&Channel, &mut Message) + Send + Sync;
type EventHandlerFn = dyn Fn(&Channel) + Send + Sync;

struct DataEntry {
    id: HandlerId,
    tag: MessageTag,
    f: Box<DataHandlerFn>,
}

struct EventEntry {
    id: HandlerId,
    f: Box<EventHandlerFn>,
}

/// An ordered chain of handlers for one event class. Iteration holds the
/// chain's read lock for its full duration, to avoid a torn view of the
/// chain if a handler mutates it mid-dispatch, accepting that a slow
/// handler blocks the chain; mutation takes the write lock and is
/// visible starting with the next traversal.
struct DataChain {
    entries: RwLock<Vec<DataEntry>>,
}

impl DataChain {
    fn new() -> Self {
        DataChain {
            entries: RwLock::new(Vec::new()),
        }
    }

    fn add_first(&self, tag: MessageTag, f: Box<DataHandlerFn>) -> HandlerId {
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.write().insert(0, DataEntry { id, tag, f });
        id
    }

    fn add_last(&self, tag: MessageTag, f: Box<DataHandlerFn>) -> HandlerId {
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push(DataEntry { id, tag, f });
        id
    }

    fn add_before(&self, existing: HandlerId, tag: MessageTag, f: Box<DataHandlerFn>) -> Option<HandlerId> {
        let mut entries = self.entries.write();
        let pos = entries.iter().position(|e| e.id == existing)?;
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        entries.insert(pos, DataEntry { id, tag, f });
        Some(id)
    }

    fn add_after(&self, existing: HandlerId, tag: MessageTag, f: Box<DataHandlerFn>) -> Option<HandlerId> {
        let mut entries = self.entries.write();
        let pos = entries.iter().position(|e| e.id == existing)?;
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        entries.insert(pos + 1, DataEntry { id, tag, f });
        Some(id)
    }

    fn remove(&self, handler: HandlerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != handler);
        entries.len() != before
    }

    fn dispatch(&self, channel: &Channel, message: &mut Message) {
        let entries = self.entries.read();
        for entry in entries.iter() {
            if !entry.tag.matches(message) {
                continue;
            }
            // A panic escaping a handler must not break the chain for
            // subsequent handlers; it's logged and swallowed instead.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (entry.f)(channel, message)
            }));
            if let Err(payload) = result {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::warn!(handler_id = ?entry.id, %reason, "handler panicked, continuing chain");
            }
        }
    }
}

struct EventChain {
    entries: RwLock<Vec<EventEntry>>,
}

impl EventChain {
    fn new() -> Self {
        EventChain {
            entries: RwLock::new(Vec::new()),
        }
    }

    fn add_last(&self, f: Box<EventHandlerFn>) -> HandlerId {
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push(EventEntry { id, f });
        id
    }

    fn add_first(&self, f: Box<EventHandlerFn>) -> HandlerId {
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.write().insert(0, EventEntry { id, f });
        id
    }

    fn remove(&self, handler: HandlerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != handler);
        entries.len() != before
    }

    fn dispatch(&self, channel: &Channel) {
        let entries = self.entries.read();
        for entry in entries.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (entry.f)(channel)));
            if let Err(_payload) = result {
                tracing::warn!(handler_id = ?entry.id, "event handler panicked, continuing chain");
            }
        }
    }
}

/// Which of the four event classes a handler is being registered into.
/// Taking this as an explicit selector (rather than a single shared
/// mutable list) is what keeps ingress and egress strictly disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Four ordered handler chains dispatching open/close events and
/// incoming/outgoing data. Cloned per-connection from a template
/// pipeline when a channel opens; clones share no mutable state.
pub struct Pipeline {
    opened: Arc<EventChain>,
    closed: Arc<EventChain>,
    incoming: Arc<DataChain>,
    outgoing: Arc<DataChain>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            opened: Arc::new(EventChain::new()),
            closed: Arc::new(EventChain::new()),
            incoming: Arc::new(DataChain::new()),
            outgoing: Arc::new(DataChain::new()),
        }
    }

    pub fn add_opened_last<F>(&self, f: F) -> HandlerId
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        self.opened.add_last(Box::new(f))
    }

    pub fn add_closed_last<F>(&self, f: F) -> HandlerId
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        self.closed.add_last(Box::new(f))
    }

    fn chain_for(&self, direction: Direction) -> &Arc<DataChain> {
        match direction {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }

    pub fn add_first<F>(&self, direction: Direction, tag: MessageTag, f: F) -> HandlerId
    where
        F: Fn(&Channel, &mut Message) + Send + Sync + 'static,
    {
        self.chain_for(direction).add_first(tag, Box::new(f))
    }

    pub fn add_last<F>(&self, direction: Direction, tag: MessageTag, f: F) -> HandlerId
    where
        F: Fn(&Channel, &mut Message) + Send + Sync + 'static,
    {
        self.chain_for(direction).add_last(tag, Box::new(f))
    }

    pub fn add_before<F>(&self, direction: Direction, existing: HandlerId, tag: MessageTag, f: F) -> Option<HandlerId>
    where
        F: Fn(&Channel, &mut Message) + Send + Sync + 'static,
    {
        self.chain_for(direction).add_before(existing, tag, Box::new(f))
    }

    pub fn add_after<F>(&self, direction: Direction, existing: HandlerId, tag: MessageTag, f: F) -> Option<HandlerId>
    where
        F: Fn(&Channel, &mut Message) + Send + Sync + 'static,
    {
        self.chain_for(direction).add_after(existing, tag, Box::new(f))
    }

    pub fn remove(&self, direction: Direction, handler: HandlerId) -> bool {
        self.chain_for(direction).remove(handler)
    }

    pub fn remove_opened(&self, handler: HandlerId) -> bool {
        self.opened.remove(handler)
    }

    pub fn remove_closed(&self, handler: HandlerId) -> bool {
        self.closed.remove(handler)
    }

    pub fn dispatch_opened(&self, channel: &Channel) {
        self.opened.dispatch(channel);
    }

    pub fn dispatch_closed(&self, channel: &Channel) {
        self.closed.dispatch(channel);
    }

    pub fn dispatch_incoming(&self, channel: &Channel, message: &mut Message) {
        self.incoming.dispatch(channel, message);
    }

    pub fn dispatch_outgoing(&self, channel: &Channel, message: &mut Message) {
        self.outgoing.dispatch(channel, message);
    }

    /// Starts a fresh per-connection pipeline from a template pipeline
    /// when a channel opens. `Box<dyn Fn>` handlers aren't `Clone`, and
    /// in practice each
    /// connection installs its own codec/handshake handlers once the
    /// channel is known (e.g. the handshake module adds the WebSocket
    /// frame codec only after the upgrade completes), so a per-channel
    /// pipeline simply starts empty rather than copying template entries.
    pub fn clone_for_channel(&self) -> Pipeline {
        Pipeline::new()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::new()
    }
}
