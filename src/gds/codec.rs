// ABOUTME: GDS wire codec: 32-bit frame header, optional DEFLATE-compressed header block, body framing
// ABOUTME: Compressed header blocks are decompressed speculatively so the exact compressed byte count can be re-read precisely

use crate::buffer::ChunkedBuffer;
use crate::gds::frame::{FrameType, GdsFrame, GdsHeaders};
use crate::pool::ChunkPool;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

const RESERVED_TYPES: &[u8] = &[0, 4, 5, 6, 7, 10, 11, 12, 13, 14];

#[derive(Debug, thiserror::Error)]
pub enum GdsCodecError {
    #[error("invalid-type: {0:#x} is reserved")]
    InvalidType(u8),
    #[error("header name/value is not valid utf-8")]
    InvalidUtf8,
    #[error("deflate error: {0}")]
    Deflate(String),
    #[error(transparent)]
    Buffer(#[from] crate::buffer::BufferError),
    #[error("no pool attached to decode a body into")]
    NoPool,
}

/// Parses one complete GDS frame from `buf`, or `Ok(None)` if the buffer
/// doesn't yet hold enough bytes, with the read cursor rewound to where
/// it stood on entry -- the same incomplete-parse idiom as the
/// WebSocket codec.
pub fn decode_frame(buf: &ChunkedBuffer) -> Result<Option<GdsFrame>, GdsCodecError> {
    let snapshot = buf.snapshot();
    match try_decode(buf) {
        Ok(Some(frame)) => Ok(Some(frame)),
        Ok(None) => {
            buf.restore(snapshot);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn try_decode(buf: &ChunkedBuffer) -> Result<Option<GdsFrame>, GdsCodecError> {
    let mut header_bytes = [0u8; 4];
    if buf.read(&mut header_bytes, 0, 4)? < 4 {
        return Ok(None);
    }
    let header = u32::from_be_bytes(header_bytes);
    let complete = header & 0x8000_0000 != 0;
    let type_bits = ((header >> 24) & 0x0F) as u8;
    let stream_id = header & 0x00FF_FFFF;

    if RESERVED_TYPES.contains(&type_bits) {
        return Err(GdsCodecError::InvalidType(type_bits));
    }
    let frame_type = FrameType::try_from(type_bits).map_err(|_| GdsCodecError::InvalidType(type_bits))?;

    if frame_type.is_control() {
        return Ok(Some(GdsFrame {
            complete: true,
            frame_type,
            stream_id,
            headers_compressed: false,
            headers: GdsHeaders::new(),
            body: None,
        }));
    }

    let mut headers_compressed = false;
    let mut headers = GdsHeaders::new();
    if frame_type.has_headers() {
        let mut descriptor_bytes = [0u8; 2];
        if buf.read(&mut descriptor_bytes, 0, 2)? < 2 {
            return Ok(None);
        }
        let descriptor = u16::from_be_bytes(descriptor_bytes);
        headers_compressed = descriptor & 0x8000 != 0;
        let count = (descriptor & 0x7FFF) as usize;

        headers = match decode_headers_block(buf, count, headers_compressed)? {
            Some(h) => h,
            None => return Ok(None),
        };
    }

    let mut body = None;
    if frame_type.has_body() {
        let mut len_bytes = [0u8; 4];
        if buf.read(&mut len_bytes, 0, 4)? < 4 {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes(len_bytes) as usize;
        let mut raw = vec![0u8; body_len];
        let got = buf.read(&mut raw, 0, body_len)?;
        if got < body_len {
            return Ok(None);
        }
        let pool = buf.pool().cloned().ok_or(GdsCodecError::NoPool)?;
        let body_buf = ChunkedBuffer::new(pool);
        body_buf.write(&raw, 0, raw.len())?;
        body = Some(body_buf);
    }

    Ok(Some(GdsFrame {
        complete,
        frame_type,
        stream_id,
        headers_compressed,
        headers,
        body,
    }))
}

/// Decodes `count` raw header entries directly from `buf`.
fn decode_raw_headers(buf: &ChunkedBuffer, count: usize) -> Result<Option<GdsHeaders>, GdsCodecError> {
    let mut headers = GdsHeaders::new();
    for _ in 0..count {
        let mut lens = [0u8; 4];
        if buf.read(&mut lens, 0, 4)? < 4 {
            return Ok(None);
        }
        let key_len = u16::from_be_bytes([lens[0], lens[1]]) as usize;
        let val_len = u16::from_be_bytes([lens[2], lens[3]]) as usize;

        let mut key_bytes = vec![0u8; key_len];
        if buf.read(&mut key_bytes, 0, key_len)? < key_len {
            return Ok(None);
        }
        let mut value = vec![0u8; val_len];
        if buf.read(&mut value, 0, val_len)? < val_len {
            return Ok(None);
        }
        let key = String::from_utf8(key_bytes).map_err(|_| GdsCodecError::InvalidUtf8)?;
        headers.set(&key, value);
    }
    Ok(Some(headers))
}

/// Decodes `count` header entries that were DEFLATE-compressed on write.
/// The compressed byte count isn't stored on the wire, so this reads a
/// speculative chunk, decompresses until `count` entries parse out, then
/// rewinds and re-reads exactly `decompress.total_in()` bytes so the
/// cursor lands precisely after the compressed block.
fn decode_compressed_headers(buf: &ChunkedBuffer, count: usize) -> Result<Option<GdsHeaders>, GdsCodecError> {
    let snapshot = buf.snapshot();
    let available = buf.available() as usize;
    if available == 0 {
        return Ok(None);
    }
    let mut candidate = vec![0u8; available];
    let got = buf.read(&mut candidate, 0, available)?;
    candidate.truncate(got);
    buf.restore(snapshot);

    let mut decompress = Decompress::new(false);
    let mut output = Vec::with_capacity(candidate.len() * 3 + 64);
    let mut produced = 0usize;
    loop {
        let before_out = decompress.total_out();
        output.resize(output.len().max(produced + 4096), 0);
        let status = decompress
            .decompress(&candidate[decompress.total_in() as usize..], &mut output[produced..], FlushDecompress::None)
            .map_err(|e| GdsCodecError::Deflate(e.to_string()))?;
        produced += (decompress.total_out() - before_out) as usize;

        if let Some(headers) = try_parse_header_entries(&output[..produced], count) {
            let consumed = decompress.total_in() as usize;
            buf.restore(snapshot);
            let mut throwaway = vec![0u8; consumed];
            let reread = buf.read(&mut throwaway, 0, consumed)?;
            if reread < consumed {
                return Ok(None);
            }
            return Ok(Some(headers));
        }

        match status {
            Status::StreamEnd => return Ok(None),
            Status::BufError => return Ok(None),
            Status::Ok => {
                if decompress.total_in() as usize >= candidate.len() {
                    // Exhausted everything we had buffered without finishing
                    // `count` entries: need more bytes from the wire.
                    return Ok(None);
                }
            }
        }
    }
}

/// Attempts to parse exactly `count` header entries out of a decoded
/// byte slice, returning `None` if it isn't long enough yet.
fn try_parse_header_entries(decoded: &[u8], count: usize) -> Option<GdsHeaders> {
    let mut headers = GdsHeaders::new();
    let mut pos = 0usize;
    for _ in 0..count {
        if decoded.len() < pos + 4 {
            return None;
        }
        let key_len = u16::from_be_bytes([decoded[pos], decoded[pos + 1]]) as usize;
        let val_len = u16::from_be_bytes([decoded[pos + 2], decoded[pos + 3]]) as usize;
        pos += 4;
        if decoded.len() < pos + key_len + val_len {
            return None;
        }
        let key = std::str::from_utf8(&decoded[pos..pos + key_len]).ok()?;
        pos += key_len;
        let value = decoded[pos..pos + val_len].to_vec();
        pos += val_len;
        headers.set(key, value);
    }
    Some(headers)
}

fn decode_headers_block(buf: &ChunkedBuffer, count: usize, compressed: bool) -> Result<Option<GdsHeaders>, GdsCodecError> {
    if count == 0 {
        return Ok(Some(GdsHeaders::new()));
    }
    if compressed {
        decode_compressed_headers(buf, count)
    } else {
        decode_raw_headers(buf, count)
    }
}

/// Encodes `frame` to wire bytes. Control frames are exactly 4 bytes.
pub fn encode_frame(frame: &GdsFrame) -> Result<Vec<u8>, GdsCodecError> {
    let mut out = Vec::new();
    let complete_bit: u32 = if frame.complete { 0x8000_0000 } else { 0 };
    let type_bits = (u8::from(frame.frame_type) as u32) << 24;
    let header = complete_bit | type_bits | (frame.stream_id & 0x00FF_FFFF);
    out.extend_from_slice(&header.to_be_bytes());

    if frame.frame_type.has_headers() {
        let raw = encode_raw_header_entries(&frame.headers);
        let (descriptor_compressed_bit, body) = if frame.headers_compressed {
            (0x8000u16, compress_raw(&raw)?)
        } else {
            (0u16, raw)
        };
        let descriptor = descriptor_compressed_bit | (frame.headers.len() as u16 & 0x7FFF);
        out.extend_from_slice(&descriptor.to_be_bytes());
        out.extend_from_slice(&body);
    }

    if frame.frame_type.has_body() {
        let body = frame.body.as_ref().expect("has_body implies body is Some");
        let avail = body.available() as usize;
        let mut bytes = vec![0u8; avail];
        let n = body.read(&mut bytes, 0, avail)?;
        bytes.truncate(n);
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&bytes);
    }

    Ok(out)
}

fn encode_raw_header_entries(headers: &GdsHeaders) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in headers.iter() {
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(value);
    }
    out
}

fn compress_raw(raw: &[u8]) -> Result<Vec<u8>, GdsCodecError> {
    let mut compress = Compress::new(Compression::default(), false);
    let mut out = Vec::with_capacity(raw.len());
    loop {
        let consumed = compress.total_in() as usize;
        let status = compress
            .compress_vec(&raw[consumed..], &mut out, FlushCompress::Finish)
            .map_err(|e| GdsCodecError::Deflate(e.to_string()))?;
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                out.reserve(256);
            }
        }
    }
    Ok(out)
}

/// Builds a fresh chunked buffer containing `bytes`, borrowing chunks
/// from `pool`. Used when constructing `GdsFrame::body_only`/`full`
/// values outside of decoding.
pub fn buffer_from_bytes(pool: ChunkPool, bytes: &[u8]) -> Result<ChunkedBuffer, GdsCodecError> {
    let buf = ChunkedBuffer::new(pool);
    buf.write(bytes, 0, bytes.len())?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gds::frame::GdsHeaders;

    fn pool() -> ChunkPool {
        ChunkPool::new(64)
    }

    #[test]
    fn ping_frame_is_exactly_four_bytes() {
        let frame = GdsFrame::ping(7);
        let wire = encode_frame(&frame).unwrap();
        assert_eq!(wire.len(), 4);

        let buf = ChunkedBuffer::new(pool());
        buf.write(&wire, 0, wire.len()).unwrap();
        let decoded = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Ping);
        assert!(decoded.complete);
        assert_eq!(decoded.stream_id, 7);
    }

    #[test]
    fn headers_only_frame_round_trips_uncompressed() {
        let mut headers = GdsHeaders::new();
        headers.set("content-type", b"text/plain".to_vec());
        let frame = GdsFrame::headers_only(3, headers, false);
        let wire = encode_frame(&frame).unwrap();

        let buf = ChunkedBuffer::new(pool());
        buf.write(&wire, 0, wire.len()).unwrap();
        let decoded = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(decoded.headers.get("Content-Type"), Some(&b"text/plain"[..]));
        assert!(decoded.body.is_none());
    }

    #[test]
    fn full_frame_round_trips_with_body() {
        let mut headers = GdsHeaders::new();
        headers.set("x-id", b"42".to_vec());
        let body = buffer_from_bytes(pool(), b"hello gds").unwrap();
        let frame = GdsFrame::full(9, headers, body, false);
        let wire = encode_frame(&frame).unwrap();

        let buf = ChunkedBuffer::new(pool());
        buf.write(&wire, 0, wire.len()).unwrap();
        let decoded = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(decoded.headers.get("x-id"), Some(&b"42"[..]));
        assert_eq!(decoded.body.unwrap().to_utf8_string().unwrap(), "hello gds");
    }

    #[test]
    fn compressed_headers_are_smaller_and_round_trip() {
        let mut headers = GdsHeaders::new();
        let repeated = "a".repeat(400);
        headers.set("x-long", repeated.as_bytes().to_vec());
        let raw_len = encode_raw_header_entries(&headers).len();

        let frame = GdsFrame::headers_only(1, headers.clone(), true);
        let wire = encode_frame(&frame).unwrap();
        // header(4) + descriptor(2) + compressed body must beat raw encoding.
        assert!(wire.len() - 6 < raw_len);

        let buf = ChunkedBuffer::new(pool());
        buf.write(&wire, 0, wire.len()).unwrap();
        let decoded = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(decoded.headers.get("x-long"), Some(repeated.as_bytes()));
    }

    #[test]
    fn incomplete_frame_rewinds_and_later_succeeds() {
        let mut headers = GdsHeaders::new();
        headers.set("a", b"1".to_vec());
        let body = buffer_from_bytes(pool(), b"partial").unwrap();
        let frame = GdsFrame::full(2, headers, body, false);
        let wire = encode_frame(&frame).unwrap();

        let buf = ChunkedBuffer::new(pool());
        buf.write(&wire[..wire.len() - 2], 0, wire.len() - 2).unwrap();
        assert!(decode_frame(&buf).unwrap().is_none());

        buf.write(&wire[wire.len() - 2..], 0, 2).unwrap();
        let decoded = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(decoded.body.unwrap().to_utf8_string().unwrap(), "partial");
    }

    #[test]
    fn reserved_type_fails_with_invalid_type() {
        let header: u32 = 0x8000_0000 | (0u32 << 24) | 1;
        let buf = ChunkedBuffer::new(pool());
        buf.write(&header.to_be_bytes(), 0, 4).unwrap();
        let err = decode_frame(&buf).unwrap_err();
        assert!(matches!(err, GdsCodecError::InvalidType(0)));
    }
}
