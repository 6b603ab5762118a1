// ABOUTME: Tagged payload variant dispatched through the pipeline's handler chains
// ABOUTME: A closed sum type across known payload kinds plus an open extension arm for caller-defined ones

use crate::buffer::ChunkedBuffer;
use crate::gds::frame::GdsFrame;
use crate::http::{HttpRequest, HttpResponse};
use crate::ws::frame::WebSocketFrame;
use std::any::Any;
use std::fmt;

/// The payload a pipeline handler is registered against and dispatched
/// with: a tagged variant across the known payload kinds, plus an open
/// extension arm for caller-defined payloads.
pub enum Message {
    HttpRequest(HttpRequest),
    HttpResponse(HttpResponse),
    Buffer(ChunkedBuffer),
    WebSocket(WebSocketFrame),
    Gds(GdsFrame),
    /// Caller-defined payload, for application protocols layered above
    /// this framework. Boxed so the enum stays a fixed, small size.
    Extension(Box<dyn Any + Send>),
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::HttpRequest(r) => f.debug_tuple("HttpRequest").field(r).finish(),
            Message::HttpResponse(r) => f.debug_tuple("HttpResponse").field(r).finish(),
            Message::Buffer(_) => f.write_str("Buffer(..)"),
            Message::WebSocket(w) => f.debug_tuple("WebSocket").field(w).finish(),
            Message::Gds(g) => f.debug_tuple("Gds").field(g).finish(),
            Message::Extension(_) => f.write_str("Extension(..)"),
        }
    }
}

/// The tag a handler is registered against. Dispatch tests
/// `handler.tag.matches(&message)`, a pattern-match stand-in for a
/// runtime-type assignability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    HttpRequest,
    HttpResponse,
    Buffer,
    WebSocket,
    Gds,
    Extension,
    /// Matches every variant; used for logging/metrics handlers.
    Any,
}

impl MessageTag {
    pub fn of(message: &Message) -> MessageTag {
        match message {
            Message::HttpRequest(_) => MessageTag::HttpRequest,
            Message::HttpResponse(_) => MessageTag::HttpResponse,
            Message::Buffer(_) => MessageTag::Buffer,
            Message::WebSocket(_) => MessageTag::WebSocket,
            Message::Gds(_) => MessageTag::Gds,
            Message::Extension(_) => MessageTag::Extension,
        }
    }

    pub fn matches(self, message: &Message) -> bool {
        self == MessageTag::Any || self == MessageTag::of(message)
    }
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        MessageTag::of(self)
    }

    pub fn as_websocket(&self) -> Option<&WebSocketFrame> {
        match self {
            Message::WebSocket(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_gds(&self) -> Option<&GdsFrame> {
        match self {
            Message::Gds(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_websocket(self) -> Option<WebSocketFrame> {
        match self {
            Message::WebSocket(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_gds(self) -> Option<GdsFrame> {
        match self {
            Message::Gds(f) => Some(f),
            _ => None,
        }
    }
}
