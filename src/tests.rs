// ABOUTME: Cross-module integration scenarios exercising the pooled buffer, both codecs, and the pipeline together
// ABOUTME: Unit tests for a single module's own invariants live alongside that module instead

use crate::buffer::ChunkedBuffer;
use crate::channel::{Channel, ChannelState};
use crate::client::{ConnectionBuilder, FrameConnection};
use crate::gds::{decode_frame as gds_decode, encode_frame as gds_encode, GdsFrame, GdsHeaders, GdsReassembler};
use crate::message::{Message, MessageTag};
use crate::pipeline::Direction;
use crate::pool::ChunkPool;
use crate::ws::handshake::{accept_request, ClientHandshake};
use crate::ws::{HandshakeState, Role, WebSocketCodec, WebSocketFrame};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[test]
fn websocket_handshake_success_transitions_to_upgraded() {
    let client = ClientHandshake::new();
    let request = client.build_request("echo.websocket.org", "/", &[]);

    let (response, _) = accept_request(&request, &[]).unwrap();
    assert_eq!(response.code, 101);

    let negotiated = client.accept_response(&response).unwrap();
    assert!(negotiated.is_none());
}

#[test]
fn websocket_echo_with_masking_round_trips_through_pipeline() {
    let client_codec = WebSocketCodec::new(Role::Client);
    let outbound = WebSocketFrame::text("some test", None);
    let wire = client_codec.encode_frame(&outbound);

    let server_incoming = ChunkedBuffer::new(ChunkPool::new(256));
    server_incoming.write(&wire, 0, wire.len()).unwrap();
    let mut server_codec = WebSocketCodec::new(Role::Server);
    let received = server_codec.decode_frame(&server_incoming).unwrap().unwrap();
    assert_eq!(received.as_text(), Some("some test"));

    let channel = Channel::new_detached(ChunkPool::new(256));
    let observed = std::sync::Arc::new(parking_lot::Mutex::new(None));
    {
        let observed = std::sync::Arc::clone(&observed);
        channel.pipeline().add_last(Direction::Incoming, MessageTag::WebSocket, move |_c, m| {
            if let Some(frame) = m.as_websocket() {
                *observed.lock() = frame.as_text().map(|s| s.to_string());
            }
        });
    }
    let mut message = Message::WebSocket(received);
    channel.dispatch_incoming(&mut message).unwrap();
    assert_eq!(observed.lock().as_deref(), Some("some test"));
}

#[test]
fn gds_ping_is_exactly_four_bytes_and_round_trips() {
    let frame = GdsFrame::ping(1234);
    let wire = gds_encode(&frame).unwrap();
    assert_eq!(wire.len(), 4);

    let buf = ChunkedBuffer::new(ChunkPool::new(64));
    buf.write(&wire, 0, wire.len()).unwrap();
    let decoded = gds_decode(&buf).unwrap().unwrap();
    assert_eq!(decoded.stream_id, 1234);
    assert!(decoded.complete);
}

#[test]
fn gds_full_frame_uncompressed_size_matches_formula() {
    let key1 = "the first key";
    let value1 = "v".repeat(40);
    let key2 = "the second key";
    let value2 = "w".repeat(60);

    let mut headers = GdsHeaders::new();
    headers.set(key1, value1.as_bytes().to_vec());
    headers.set(key2, value2.as_bytes().to_vec());

    let body_len = 2048usize;
    let body_bytes = vec![7u8; body_len];
    let body = crate::gds::codec::buffer_from_bytes(ChunkPool::new(256), &body_bytes).unwrap();

    let frame = GdsFrame::full(1, headers, body, false);
    let wire = gds_encode(&frame).unwrap();

    let expected = 4 + 2 + 4 * 2 + key1.len() + value1.len() + key2.len() + value2.len() + 4 + body_len;
    assert_eq!(wire.len(), expected);

    let buf = ChunkedBuffer::new(ChunkPool::new(4096));
    buf.write(&wire, 0, wire.len()).unwrap();
    let decoded = gds_decode(&buf).unwrap().unwrap();
    assert_eq!(decoded.headers.get(key1), Some(value1.as_bytes()));
    assert_eq!(decoded.headers.get(key2), Some(value2.as_bytes()));
    assert_eq!(decoded.body.unwrap().available(), body_len as u64);
}

#[test]
fn gds_fragment_reassembly_merges_body_and_headers() {
    let mut reassembler = GdsReassembler::new(ChunkPool::new(64));

    let mut h1 = GdsHeaders::new();
    h1.set("test1", b"1".to_vec());
    h1.set("test", b"1".to_vec());
    let body1 = crate::gds::codec::buffer_from_bytes(ChunkPool::new(64), b"This ").unwrap();
    let mut f1 = GdsFrame::full(1, h1, body1, false);
    f1.complete = false;
    assert!(reassembler.feed(f1).is_none());

    let mut h2 = GdsHeaders::new();
    h2.set("test2", b"2".to_vec());
    h2.set("test", b"2".to_vec());
    let body2 = crate::gds::codec::buffer_from_bytes(ChunkPool::new(64), b"is ").unwrap();
    let mut f2 = GdsFrame::full(1, h2, body2, false);
    f2.complete = false;
    assert!(reassembler.feed(f2).is_none());

    let mut h3 = GdsHeaders::new();
    h3.set("test3", b"3".to_vec());
    h3.set("test", b"3".to_vec());
    let body3 = crate::gds::codec::buffer_from_bytes(ChunkPool::new(64), b"awesome!").unwrap();
    let f3 = GdsFrame::full(1, h3, body3, false);

    let merged = reassembler.feed(f3).unwrap();
    assert_eq!(merged.body.unwrap().to_utf8_string().unwrap(), "This is awesome!");
    assert_eq!(merged.headers.get("test1"), Some(&b"1"[..]));
    assert_eq!(merged.headers.get("test2"), Some(&b"2"[..]));
    assert_eq!(merged.headers.get("test3"), Some(&b"3"[..]));
    assert_eq!(merged.headers.get("test"), Some(&b"3"[..]));
}

#[test]
fn websocket_fragments_reassemble_into_one_text_frame() {
    let codec_w = WebSocketCodec::new(Role::Server);
    let first = WebSocketFrame {
        fin: false,
        rsv: 0,
        operation: crate::ws::Operation::Text,
        mask: None,
        payload: b"This ".to_vec(),
    };
    let second = WebSocketFrame {
        fin: false,
        rsv: 0,
        operation: crate::ws::Operation::Continuation,
        mask: None,
        payload: b"is ".to_vec(),
    };
    let third = WebSocketFrame {
        fin: true,
        rsv: 0,
        operation: crate::ws::Operation::Continuation,
        mask: None,
        payload: b"awesome!".to_vec(),
    };

    let mut wire = codec_w.encode_frame(&first);
    wire.extend(codec_w.encode_frame(&second));
    wire.extend(codec_w.encode_frame(&third));

    let buf = ChunkedBuffer::new(ChunkPool::new(256));
    buf.write(&wire, 0, wire.len()).unwrap();
    let mut decoder = WebSocketCodec::new(Role::Server);
    let merged = decoder.decode_frame(&buf).unwrap().unwrap();
    assert_eq!(merged.as_text(), Some("This is awesome!"));
}

#[test]
fn chunked_buffer_flush_resets_cursors_and_populates_pool() {
    let pool = ChunkPool::new(10);
    let buf = ChunkedBuffer::new(pool.clone());
    let total = 25usize;
    buf.write(&vec![9u8; total], 0, total).unwrap();

    let mut dst = vec![0u8; total];
    let n = buf.read(&mut dst, 0, total).unwrap();
    assert_eq!(n, total);

    buf.flush().unwrap();
    assert_eq!(buf.read_position(), 0);
    assert_eq!(buf.write_position(), 0);
    assert_eq!(pool.in_pool(), total.div_ceil(10));
}

#[test]
fn gds_compressed_headers_are_smaller_for_ascii_text() {
    let mut headers = GdsHeaders::new();
    let sentence = "The quick brown fox jumps over the lazy dog. ".repeat(10);
    headers.set("x-sentence", sentence.as_bytes().to_vec());

    let uncompressed = GdsFrame::headers_only(1, headers.clone(), false);
    let compressed = GdsFrame::headers_only(1, headers, true);

    let uncompressed_wire = gds_encode(&uncompressed).unwrap();
    let compressed_wire = gds_encode(&compressed).unwrap();
    assert!(compressed_wire.len() < uncompressed_wire.len());
}

#[test]
fn every_strict_prefix_of_a_gds_frame_is_reported_incomplete() {
    let mut headers = GdsHeaders::new();
    headers.set("a", b"1".to_vec());
    let body = crate::gds::codec::buffer_from_bytes(ChunkPool::new(64), b"payload").unwrap();
    let frame = GdsFrame::full(1, headers, body, false);
    let wire = gds_encode(&frame).unwrap();

    for prefix_len in 0..wire.len() {
        let buf = ChunkedBuffer::new(ChunkPool::new(64));
        if prefix_len > 0 {
            buf.write(&wire[..prefix_len], 0, prefix_len).unwrap();
        }
        let before = buf.read_position();
        let result = gds_decode(&buf).unwrap();
        assert!(result.is_none(), "prefix of length {prefix_len} unexpectedly parsed");
        assert_eq!(buf.read_position(), before);
    }
}

#[tokio::test]
async fn websocket_handshake_success_moves_channel_to_upgraded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut acc = Vec::new();
        let mut tmp = [0u8; 1024];
        let request = loop {
            match crate::http::HttpRequest::parse(&acc) {
                Ok(request) => break request,
                Err(crate::http::HttpError::Incomplete) => {}
                Err(e) => panic!("failed to parse request: {e}"),
            }
            let n = socket.read(&mut tmp).await.unwrap();
            acc.extend_from_slice(&tmp[..n]);
        };
        let (response, _negotiated) = accept_request(&request, &[]).unwrap();
        socket.write_all(&response.to_bytes()).await.unwrap();
    });

    let result = ConnectionBuilder::new(addr.ip().to_string(), addr.port())
        .websocket("/")
        .connect()
        .await
        .unwrap();

    server.await.unwrap();
    assert_eq!(result.channel().handshake_state(), HandshakeState::Upgraded);
}

#[tokio::test]
async fn websocket_handshake_rejection_closes_channel_and_reports_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let _ = socket.read(&mut buf).await.unwrap();
        socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.unwrap();
    });

    let observed: Arc<Mutex<Option<(ChannelState, bool)>>> = Arc::new(Mutex::new(None));
    let observed_in_callback = Arc::clone(&observed);

    let result = ConnectionBuilder::new(addr.ip().to_string(), addr.port())
        .websocket("/")
        .on_established(move |channel: &Channel, success: bool| {
            *observed_in_callback.lock().unwrap() = Some((channel.state(), success));
        })
        .connect()
        .await;

    server.await.unwrap();
    assert!(result.is_err());

    let (state, success) = observed.lock().unwrap().take().expect("on_established was never called");
    assert!(!success);
    assert_eq!(state, ChannelState::Closed);
}
