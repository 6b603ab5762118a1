// ABOUTME: In-memory representation of a single GDS frame, before wire encoding/decoding
// ABOUTME: Case-insensitive header map and per-kind invariants (HeadersOnly/BodyOnly/Full/control)

use crate::buffer::ChunkedBuffer;
use std::fmt;

/// The 4-bit frame type carried in the GDS header word. Values 0, 4-7 and
/// 10-14 are reserved and must fail to parse with `invalid-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    HeadersOnly = 1,
    BodyOnly = 2,
    Full = 3,
    Ping = 8,
    Pong = 9,
    Close = 15,
}

impl FrameType {
    pub fn is_control(self) -> bool {
        matches!(self, FrameType::Ping | FrameType::Pong | FrameType::Close)
    }

    pub fn has_headers(self) -> bool {
        matches!(self, FrameType::HeadersOnly | FrameType::Full)
    }

    pub fn has_body(self) -> bool {
        matches!(self, FrameType::BodyOnly | FrameType::Full)
    }
}

/// Case-insensitive header map, UTF-8 names to raw byte values. Last
/// write for a given name wins, matching the reassembly merge rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GdsHeaders {
    entries: Vec<(String, Vec<u8>)>,
}

impl GdsHeaders {
    pub fn new() -> Self {
        GdsHeaders { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or overwrites the value for `name`, matched
    /// case-insensitively against existing entries.
    pub fn set(&mut self, name: &str, value: Vec<u8>) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            entry.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Merges `other` into `self`, overwriting on key collision
    /// (last-writer-wins per key).
    pub fn merge_from(&mut self, other: &GdsHeaders) {
        for (name, value) in other.iter() {
            self.set(name, value.to_vec());
        }
    }
}

/// A single GDS frame. `headers` and `body` are populated according to
/// `frame_type`'s invariant (§4 "HeadersOnly => headers present, body
/// absent; ..."); control frames carry neither.
pub struct GdsFrame {
    pub complete: bool,
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub headers_compressed: bool,
    pub headers: GdsHeaders,
    pub body: Option<ChunkedBuffer>,
}

impl fmt::Debug for GdsFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GdsFrame")
            .field("complete", &self.complete)
            .field("frame_type", &self.frame_type)
            .field("stream_id", &self.stream_id)
            .field("header_count", &self.headers.len())
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

impl GdsFrame {
    pub fn control(frame_type: FrameType, stream_id: u32) -> Self {
        debug_assert!(frame_type.is_control());
        GdsFrame {
            complete: true,
            frame_type,
            stream_id,
            headers_compressed: false,
            headers: GdsHeaders::new(),
            body: None,
        }
    }

    pub fn ping(stream_id: u32) -> Self {
        GdsFrame::control(FrameType::Ping, stream_id)
    }

    pub fn pong(stream_id: u32) -> Self {
        GdsFrame::control(FrameType::Pong, stream_id)
    }

    pub fn close(stream_id: u32) -> Self {
        GdsFrame::control(FrameType::Close, stream_id)
    }

    pub fn headers_only(stream_id: u32, headers: GdsHeaders, compressed: bool) -> Self {
        GdsFrame {
            complete: true,
            frame_type: FrameType::HeadersOnly,
            stream_id,
            headers_compressed: compressed,
            headers,
            body: None,
        }
    }

    pub fn body_only(stream_id: u32, body: ChunkedBuffer) -> Self {
        GdsFrame {
            complete: true,
            frame_type: FrameType::BodyOnly,
            stream_id,
            headers_compressed: false,
            headers: GdsHeaders::new(),
            body: Some(body),
        }
    }

    pub fn full(stream_id: u32, headers: GdsHeaders, body: ChunkedBuffer, compressed: bool) -> Self {
        GdsFrame {
            complete: true,
            frame_type: FrameType::Full,
            stream_id,
            headers_compressed: compressed,
            headers,
            body: Some(body),
        }
    }
}
