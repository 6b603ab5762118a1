// ABOUTME: RFC6455 wire codec: frame parsing/writing, masking, and continuation reassembly
// ABOUTME: Incomplete frames rewind the buffer's read cursor via snapshot/restore rather than signalling an error outward

use crate::buffer::ChunkedBuffer;
use crate::ws::frame::{Operation, WebSocketFrame};
use rand::RngCore;

const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, thiserror::Error)]
pub enum WsCodecError {
    #[error("reserved bits set without an extension negotiated")]
    ReservedBits,
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    #[error("control frame payload of {0} bytes exceeds the 125-byte limit")]
    ControlFrameTooLarge(usize),
    #[error("control frame must not be fragmented")]
    FragmentedControlFrame,
    #[error("continuation frame received with no fragmented message in progress")]
    UnexpectedContinuation,
    #[error("new fragmented message started before the previous one finished")]
    OverlappingFragmentation,
    #[error(transparent)]
    Buffer(#[from] crate::buffer::BufferError),
}

/// Which side of the connection this codec instance is encoding for.
/// RFC6455 requires client-to-server frames to be masked and forbids
/// masking server-to-client frames (§5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

struct PendingFragment {
    operation: Operation,
    payload: Vec<u8>,
}

/// Stateful per-connection frame codec. `decode_frame` returns `Ok(None)`
/// when the buffer doesn't yet hold a complete frame, after restoring the
/// read cursor to where it stood on entry so a later call re-reads the
/// same bytes once more data has arrived.
pub struct WebSocketCodec {
    role: Role,
    pending: Option<PendingFragment>,
}

impl WebSocketCodec {
    pub fn new(role: Role) -> Self {
        WebSocketCodec {
            role,
            pending: None,
        }
    }

    /// Attempts to parse one complete, reassembled frame from `buf`.
    /// Control frames and the first/only fragment of a data message are
    /// returned immediately; continuation frames are accumulated
    /// internally until a `fin` frame completes the message, at which
    /// point the combined payload is returned under the original
    /// message's opcode.
    pub fn decode_frame(&mut self, buf: &ChunkedBuffer) -> Result<Option<WebSocketFrame>, WsCodecError> {
        self.try_decode_one(buf)
    }

    /// Each raw frame read is individually snapshotted and rewound on an
    /// incomplete read. Rewinding to a single snapshot taken at the top
    /// of this call would also undo earlier frames already consumed
    /// in this same call (e.g. the first fragment of a continuation
    /// sequence), which would then be re-read and re-accumulated into
    /// `self.pending` on the next call.
    fn try_decode_one(&mut self, buf: &ChunkedBuffer) -> Result<Option<WebSocketFrame>, WsCodecError> {
        loop {
            let snapshot = buf.snapshot();
            let raw = match read_raw_frame(buf)? {
                Some(raw) => raw,
                None => {
                    buf.restore(snapshot);
                    return Ok(None);
                }
            };

            if raw.operation.is_control() {
                if !raw.fin {
                    return Err(WsCodecError::FragmentedControlFrame);
                }
                if raw.payload.len() > MAX_CONTROL_PAYLOAD {
                    return Err(WsCodecError::ControlFrameTooLarge(raw.payload.len()));
                }
                return Ok(Some(raw));
            }

            match raw.operation {
                Operation::Continuation => {
                    let pending = self
                        .pending
                        .as_mut()
                        .ok_or(WsCodecError::UnexpectedContinuation)?;
                    pending.payload.extend_from_slice(&raw.payload);
                    if raw.fin {
                        let pending = self.pending.take().unwrap();
                        return Ok(Some(WebSocketFrame {
                            fin: true,
                            rsv: 0,
                            operation: pending.operation,
                            mask: None,
                            payload: pending.payload,
                        }));
                    }
                    // Not yet complete: loop around and parse the next frame.
                }
                Operation::Text | Operation::Binary => {
                    if raw.fin {
                        return Ok(Some(raw));
                    }
                    if self.pending.is_some() {
                        return Err(WsCodecError::OverlappingFragmentation);
                    }
                    self.pending = Some(PendingFragment {
                        operation: raw.operation,
                        payload: raw.payload,
                    });
                    // Loop to parse the next frame of this fragmented message.
                }
                Operation::Close | Operation::Ping | Operation::Pong => unreachable!("handled above"),
            }
        }
    }

    /// Encodes `frame` to wire bytes, masking the payload when `role` is
    /// `Client`. A fresh random mask is generated per call; the caller's
    /// `frame.mask` is ignored on the write path so every outbound frame
    /// gets independent masking key material.
    pub fn encode_frame(&self, frame: &WebSocketFrame) -> Vec<u8> {
        let mask = match self.role {
            Role::Client => {
                let mut key = [0u8; 4];
                rand::rng().fill_bytes(&mut key);
                Some(key)
            }
            Role::Server => None,
        };
        write_raw_frame(frame.fin, frame.rsv, frame.operation, mask, &frame.payload)
    }
}

/// Parsed directly off the wire with no fragmentation logic applied; only
/// `WebSocketCodec::try_decode_one` interprets `fin`/continuation state.
fn read_raw_frame(buf: &ChunkedBuffer) -> Result<Option<WebSocketFrame>, WsCodecError> {
    let mut head = [0u8; 2];
    if (buf.read(&mut head, 0, 2)?) < 2 {
        return Ok(None);
    }

    let fin = head[0] & 0b1000_0000 != 0;
    let rsv = (head[0] & 0b0111_0000) >> 4;
    if rsv != 0 {
        return Err(WsCodecError::ReservedBits);
    }
    let opcode = head[0] & 0b0000_1111;
    let operation = Operation::try_from(opcode).map_err(|_| WsCodecError::ReservedOpcode(opcode))?;

    let masked = head[1] & 0b1000_0000 != 0;
    let len_field = head[1] & 0b0111_1111;

    let payload_len: u64 = match len_field {
        126 => {
            let mut ext = [0u8; 2];
            if (buf.read(&mut ext, 0, 2)?) < 2 {
                return Ok(None);
            }
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            if (buf.read(&mut ext, 0, 8)?) < 8 {
                return Ok(None);
            }
            u64::from_be_bytes(ext)
        }
        n => n as u64,
    };

    let mask_key = if masked {
        let mut key = [0u8; 4];
        if (buf.read(&mut key, 0, 4)?) < 4 {
            return Ok(None);
        }
        Some(key)
    } else {
        None
    };

    let payload_len = payload_len as usize;
    let mut payload = vec![0u8; payload_len];
    let got = buf.read(&mut payload, 0, payload_len)?;
    if got < payload_len {
        return Ok(None);
    }

    if let Some(key) = mask_key {
        apply_mask(key, &mut payload);
    }

    Ok(Some(WebSocketFrame {
        fin,
        rsv: 0,
        operation,
        mask: mask_key,
        payload,
    }))
}

fn write_raw_frame(fin: bool, rsv: u8, operation: Operation, mask: Option<[u8; 4]>, payload: &[u8]) -> Vec<u8> {
    let first_byte = (if fin { 0b1000_0000 } else { 0 }) | (rsv << 4) | u8::from(operation);
    let len = payload.len();
    let mask_bit = if mask.is_some() { 0b1000_0000 } else { 0 };

    let mut out = Vec::with_capacity(2 + 8 + 4 + len);
    out.push(first_byte);
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    if let Some(key) = mask {
        out.extend_from_slice(&key);
    }

    let mut body = payload.to_vec();
    if let Some(key) = mask {
        apply_mask(key, &mut body);
    }
    out.extend_from_slice(&body);
    out
}

fn apply_mask(key: [u8; 4], data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ChunkPool;

    fn buffer_with(bytes: &[u8]) -> ChunkedBuffer {
        let buf = ChunkedBuffer::new(ChunkPool::new(64));
        buf.write(bytes, 0, bytes.len()).unwrap();
        buf
    }

    #[test]
    fn round_trips_unmasked_text_frame() {
        let codec = WebSocketCodec::new(Role::Server);
        let frame = WebSocketFrame::text("hello", None);
        let wire = codec.encode_frame(&frame);
        let buf = buffer_with(&wire);

        let mut decoder = WebSocketCodec::new(Role::Server);
        let decoded = decoder.decode_frame(&buf).unwrap().unwrap();
        assert_eq!(decoded.as_text(), Some("hello"));
        assert_eq!(decoded.operation, Operation::Text);
    }

    #[test]
    fn round_trips_masked_client_frame() {
        let codec = WebSocketCodec::new(Role::Client);
        let frame = WebSocketFrame::text("masked payload", None);
        let wire = codec.encode_frame(&frame);
        assert_ne!(&wire[2..6], b"mask"); // sanity: mask key occupies these bytes
        let buf = buffer_with(&wire);

        let mut decoder = WebSocketCodec::new(Role::Server);
        let decoded = decoder.decode_frame(&buf).unwrap().unwrap();
        assert_eq!(decoded.as_text(), Some("masked payload"));
    }

    #[test]
    fn incomplete_frame_rewinds_and_later_succeeds() {
        let buf = ChunkedBuffer::new(ChunkPool::new(64));
        let codec_w = WebSocketCodec::new(Role::Server);
        let wire = codec_w.encode_frame(&WebSocketFrame::text("partial delivery", None));

        buf.write(&wire[..3], 0, 3).unwrap();
        let mut decoder = WebSocketCodec::new(Role::Server);
        assert!(decoder.decode_frame(&buf).unwrap().is_none());

        buf.write(&wire[3..], 0, wire.len() - 3).unwrap();
        let decoded = decoder.decode_frame(&buf).unwrap().unwrap();
        assert_eq!(decoded.as_text(), Some("partial delivery"));
    }

    #[test]
    fn reassembles_continuation_fragments() {
        let codec_w = WebSocketCodec::new(Role::Server);
        let first = WebSocketFrame {
            fin: false,
            rsv: 0,
            operation: Operation::Text,
            mask: None,
            payload: b"hel".to_vec(),
        };
        let second = WebSocketFrame {
            fin: true,
            rsv: 0,
            operation: Operation::Continuation,
            mask: None,
            payload: b"lo".to_vec(),
        };
        let mut wire = codec_w.encode_frame(&first);
        wire.extend(codec_w.encode_frame(&second));

        let buf = buffer_with(&wire);
        let mut decoder = WebSocketCodec::new(Role::Server);
        let decoded = decoder.decode_frame(&buf).unwrap().unwrap();
        assert_eq!(decoded.as_text(), Some("hello"));
        assert_eq!(decoded.operation, Operation::Text);
    }

    #[test]
    fn round_trips_across_every_length_class_boundary() {
        const SIZES: [usize; 7] = [0, 1, 125, 126, 65535, 65536, 200_000];

        for &size in &SIZES {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

            let unmasked = WebSocketFrame::binary(payload.clone(), None);
            let encoder = WebSocketCodec::new(Role::Server);
            let wire = encoder.encode_frame(&unmasked);
            let buf = buffer_with(&wire);
            let mut decoder = WebSocketCodec::new(Role::Server);
            let decoded = decoder.decode_frame(&buf).unwrap().unwrap();
            assert_eq!(decoded.payload, payload, "unmasked round-trip failed at size {size}");
            assert!(decoded.mask.is_none());

            let masked = WebSocketFrame::binary(payload.clone(), None);
            let encoder = WebSocketCodec::new(Role::Client);
            let wire = encoder.encode_frame(&masked);
            let buf = buffer_with(&wire);
            let mut decoder = WebSocketCodec::new(Role::Server);
            let decoded = decoder.decode_frame(&buf).unwrap().unwrap();
            assert_eq!(decoded.payload, payload, "masked round-trip failed at size {size}");
        }
    }

    #[test]
    fn oversized_control_frame_rejected() {
        let wire = write_raw_frame(true, 0, Operation::Ping, None, &vec![0u8; 126]);
        let buf = buffer_with(&wire);
        let mut decoder = WebSocketCodec::new(Role::Server);
        let err = decoder.decode_frame(&buf).unwrap_err();
        assert!(matches!(err, WsCodecError::ControlFrameTooLarge(126)));
    }
}
