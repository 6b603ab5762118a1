// ABOUTME: Per-connection, per-stream-id aggregation of fragmented GDS content frames
// ABOUTME: Pending state is removed once a complete=true fragment is dispatched or a Close frame is observed for that stream

use crate::gds::frame::{FrameType, GdsFrame, GdsHeaders};
use crate::pool::ChunkPool;
use std::collections::HashMap;

struct PendingStream {
    frame_type: FrameType,
    headers: GdsHeaders,
    body: Vec<u8>,
}

/// Tracks in-progress fragmented GDS messages, keyed by stream id. One
/// instance lives per connection, alongside its codec.
pub struct GdsReassembler {
    pending: HashMap<u32, PendingStream>,
    pool: ChunkPool,
}

impl GdsReassembler {
    pub fn new(pool: ChunkPool) -> Self {
        GdsReassembler {
            pending: HashMap::new(),
            pool,
        }
    }

    /// Feeds one parsed frame through reassembly. Returns `Some(frame)`
    /// when a message is ready to dispatch: either the frame arrived
    /// already complete, or this fragment completed a pending message.
    /// Returns `None` while a fragmented message is still in progress.
    ///
    /// Observing a `Close` frame clears any pending entry for its stream
    /// id, freeing the id for reuse.
    pub fn feed(&mut self, frame: GdsFrame) -> Option<GdsFrame> {
        if frame.frame_type == FrameType::Close {
            self.pending.remove(&frame.stream_id);
            return Some(frame);
        }
        if frame.frame_type.is_control() {
            return Some(frame);
        }

        if frame.complete && !self.pending.contains_key(&frame.stream_id) {
            return Some(frame);
        }

        let stream_id = frame.stream_id;
        let entry = self.pending.entry(stream_id).or_insert_with(|| PendingStream {
            frame_type: frame.frame_type,
            headers: GdsHeaders::new(),
            body: Vec::new(),
        });

        // Tracks the most recently observed fragment's type, not the
        // first one: a HeadersOnly fragment followed by a Full fragment
        // must report Full on the merged frame, since it carries a body.
        entry.frame_type = frame.frame_type;
        entry.headers.merge_from(&frame.headers);
        if let Some(body) = &frame.body {
            let avail = body.available() as usize;
            let mut bytes = vec![0u8; avail];
            if let Ok(n) = body.read(&mut bytes, 0, avail) {
                bytes.truncate(n);
                entry.body.extend_from_slice(&bytes);
            }
        }

        if !frame.complete {
            return None;
        }

        let entry = self.pending.remove(&stream_id).unwrap();
        let body_buffer = if entry.body.is_empty() && !entry.frame_type.has_body() {
            None
        } else {
            let buf = crate::buffer::ChunkedBuffer::new(self.pool.clone());
            let _ = buf.write(&entry.body, 0, entry.body.len());
            Some(buf)
        };

        Some(GdsFrame {
            complete: true,
            frame_type: entry.frame_type,
            stream_id,
            headers_compressed: false,
            headers: entry.headers,
            body: body_buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gds::frame::GdsFrame;

    fn pool() -> ChunkPool {
        ChunkPool::new(64)
    }

    #[test]
    fn complete_frame_passes_through_untouched() {
        let mut r = GdsReassembler::new(pool());
        let frame = GdsFrame::ping(3);
        let out = r.feed(frame).unwrap();
        assert_eq!(out.stream_id, 3);
    }

    #[test]
    fn fragmented_body_is_concatenated_across_frames() {
        let mut r = GdsReassembler::new(pool());

        let body1 = crate::gds::codec::buffer_from_bytes(pool(), b"hel").unwrap();
        let mut first = GdsFrame::body_only(5, body1);
        first.complete = false;
        assert!(r.feed(first).is_none());

        let body2 = crate::gds::codec::buffer_from_bytes(pool(), b"lo").unwrap();
        let second = GdsFrame::body_only(5, body2);
        let out = r.feed(second).unwrap();
        assert_eq!(out.body.unwrap().to_utf8_string().unwrap(), "hello");
    }

    #[test]
    fn headers_merge_last_writer_wins_across_fragments() {
        let mut r = GdsReassembler::new(pool());

        let mut h1 = GdsHeaders::new();
        h1.set("x-a", b"1".to_vec());
        h1.set("x-b", b"2".to_vec());
        let mut first = GdsFrame::headers_only(9, h1, false);
        first.complete = false;
        assert!(r.feed(first).is_none());

        let mut h2 = GdsHeaders::new();
        h2.set("x-b", b"22".to_vec());
        let second = GdsFrame::headers_only(9, h2, false);
        let out = r.feed(second).unwrap();
        assert_eq!(out.headers.get("x-a"), Some(&b"1"[..]));
        assert_eq!(out.headers.get("x-b"), Some(&b"22"[..]));
    }

    #[test]
    fn merged_frame_reports_the_last_observed_fragment_type() {
        let mut r = GdsReassembler::new(pool());

        let mut h1 = GdsHeaders::new();
        h1.set("x-a", b"1".to_vec());
        let mut first = GdsFrame::headers_only(7, h1, false);
        first.complete = false;
        assert!(r.feed(first).is_none());

        let body = crate::gds::codec::buffer_from_bytes(pool(), b"payload").unwrap();
        let mut h2 = GdsHeaders::new();
        h2.set("x-b", b"2".to_vec());
        let second = GdsFrame::full(7, h2, body, false);

        let merged = r.feed(second).unwrap();
        assert_eq!(merged.frame_type, FrameType::Full);
        assert!(merged.body.is_some());
        assert_eq!(merged.headers.get("x-a"), Some(&b"1"[..]));
        assert_eq!(merged.headers.get("x-b"), Some(&b"2"[..]));
    }

    #[test]
    fn close_frame_clears_pending_stream() {
        let mut r = GdsReassembler::new(pool());
        let body1 = crate::gds::codec::buffer_from_bytes(pool(), b"partial").unwrap();
        let mut first = GdsFrame::body_only(1, body1);
        first.complete = false;
        assert!(r.feed(first).is_none());
        assert!(r.pending.contains_key(&1));

        r.feed(GdsFrame::close(1));
        assert!(!r.pending.contains_key(&1));
    }
}
