// ABOUTME: In-memory representation of a single RFC6455 WebSocket frame
// ABOUTME: Construction helpers cover the common text/binary/control cases; codec.rs owns wire encoding

use std::fmt;

/// The six opcodes RFC6455 §5.2 defines. Reserved opcodes (3-7, 11-15)
/// are rejected by the codec before a frame ever reaches this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum Operation {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Operation {
    pub fn is_control(self) -> bool {
        matches!(self, Operation::Close | Operation::Ping | Operation::Pong)
    }
}

/// A single WebSocket frame, already unmasked on the receive side --
/// the codec unmasks inbound payload before the frame reaches the
/// pipeline. `mask` is retained only so a frame can be
/// re-sent with the same masking key for testing; `codec.rs` always
/// generates a fresh key for frames it writes from a client endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct WebSocketFrame {
    pub fin: bool,
    pub rsv: u8,
    pub operation: Operation,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl fmt::Debug for WebSocketFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketFrame")
            .field("fin", &self.fin)
            .field("operation", &self.operation)
            .field("masked", &self.mask.is_some())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl WebSocketFrame {
    pub fn text(payload: impl Into<String>, mask: Option<[u8; 4]>) -> Self {
        WebSocketFrame {
            fin: true,
            rsv: 0,
            operation: Operation::Text,
            mask,
            payload: payload.into().into_bytes(),
        }
    }

    pub fn binary(payload: Vec<u8>, mask: Option<[u8; 4]>) -> Self {
        WebSocketFrame {
            fin: true,
            rsv: 0,
            operation: Operation::Binary,
            mask,
            payload,
        }
    }

    pub fn ping(payload: Vec<u8>, mask: Option<[u8; 4]>) -> Self {
        WebSocketFrame {
            fin: true,
            rsv: 0,
            operation: Operation::Ping,
            mask,
            payload,
        }
    }

    pub fn pong(payload: Vec<u8>, mask: Option<[u8; 4]>) -> Self {
        WebSocketFrame {
            fin: true,
            rsv: 0,
            operation: Operation::Pong,
            mask,
            payload,
        }
    }

    /// Close frame, carrying an optional RFC6455 §7.4 status code and
    /// reason. `code` is big-endian encoded as the first two payload
    /// bytes when present.
    pub fn close(code: Option<u16>, reason: &str, mask: Option<[u8; 4]>) -> Self {
        let mut payload = Vec::new();
        if let Some(code) = code {
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(reason.as_bytes());
        }
        WebSocketFrame {
            fin: true,
            rsv: 0,
            operation: Operation::Close,
            mask,
            payload,
        }
    }

    pub fn close_code(&self) -> Option<u16> {
        if self.operation != Operation::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    pub fn close_reason(&self) -> Option<&str> {
        if self.operation != Operation::Close || self.payload.len() <= 2 {
            return None;
        }
        std::str::from_utf8(&self.payload[2..]).ok()
    }

    pub fn as_text(&self) -> Option<&str> {
        if self.operation != Operation::Text {
            return None;
        }
        std::str::from_utf8(&self.payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frame_encodes_code_and_reason() {
        let frame = WebSocketFrame::close(Some(1000), "bye", None);
        assert_eq!(frame.close_code(), Some(1000));
        assert_eq!(frame.close_reason(), Some("bye"));
    }

    #[test]
    fn control_opcodes_are_control_frames() {
        assert!(Operation::Close.is_control());
        assert!(Operation::Ping.is_control());
        assert!(Operation::Pong.is_control());
        assert!(!Operation::Text.is_control());
        assert!(!Operation::Binary.is_control());
        assert!(!Operation::Continuation.is_control());
    }
}
