// ABOUTME: Concrete tokio::net::TcpStream-backed connection implementing FrameConnection
// ABOUTME: Owns the read loop task that feeds bytes into a chunked buffer, decodes frames, and dispatches them through the channel's pipeline

use crate::buffer::ChunkedBuffer;
use crate::channel::{Channel, ProtocolTag};
use crate::client::error::{FrameError, FrameResult};
use crate::client::traits::{EstablishedObserver, FrameConnection};
use crate::gds::{GdsFrame, GdsReassembler};
use crate::http::{HttpRequest, HttpResponse};
use crate::message::Message;
use crate::pipeline::Pipeline;
use crate::pool::ChunkPool;
use crate::ws::{self, ClientHandshake, HandshakeState, Role, WebSocketCodec, WebSocketFrame};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireProtocol {
    WebSocket(Role),
    Gds,
}

/// A live connection driven by a tokio `TcpStream`. The read half runs
/// on its own task for the lifetime of the connection; `send`/`close`
/// operate on the write half directly, serialized by an async mutex so
/// submissions from any thread are ordered per channel.
pub struct TokioConnection {
    channel: Channel,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    protocol: WireProtocol,
    read_task: JoinHandle<()>,
}

impl TokioConnection {
    pub fn from_stream_gds(stream: TcpStream, pool: ChunkPool, pipeline: Pipeline) -> FrameResult<TokioConnection> {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        let channel = build_channel(pool.clone(), local, remote, pipeline);
        channel.set_protocol(ProtocolTag::Gds);
        channel.set_handshake_state(HandshakeState::Upgraded);
        Ok(Self::spawn(stream, channel, WireProtocol::Gds))
    }

    /// Builds the channel before the request goes out, so a handshake
    /// failure still has a channel to close and hand to `on_established`
    /// with `success = false` rather than returning a bare error.
    pub async fn upgrade_websocket(
        stream: TcpStream,
        pool: ChunkPool,
        pipeline: Pipeline,
        handshake: &ClientHandshake,
        host: &str,
        path: &str,
        subprotocols: &[&str],
        on_established: Option<&dyn EstablishedObserver>,
    ) -> FrameResult<TokioConnection> {
        let mut stream = stream;
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        let channel = build_channel(pool, local, remote, pipeline);
        channel.set_protocol(ProtocolTag::WebSocket);

        let handshake_result: FrameResult<()> = async {
            let request = handshake.build_request(host, path, subprotocols);
            stream.write_all(&request.to_bytes()).await?;
            let response = read_http_response(&mut stream).await?;
            handshake.accept_response(&response)?;
            Ok(())
        }
        .await;

        if let Err(e) = handshake_result {
            channel.begin_close();
            channel.finish_close();
            if let Some(observer) = on_established {
                observer.on_established(&channel, false);
            }
            return Err(e);
        }

        channel.set_handshake_state(HandshakeState::Upgraded);
        if let Some(observer) = on_established {
            observer.on_established(&channel, true);
        }
        Ok(Self::spawn(stream, channel, WireProtocol::WebSocket(Role::Client)))
    }

    /// Server-side counterpart: validates the upgrade request already
    /// read off `stream` and writes the `101` response before handing
    /// the connection over to the normal read loop. Builds the channel
    /// before validating, for the same reason as `upgrade_websocket`.
    pub async fn accept_websocket(
        mut stream: TcpStream,
        pool: ChunkPool,
        pipeline: Pipeline,
        request: &HttpRequest,
        supported_subprotocols: &[&str],
        on_established: Option<&dyn EstablishedObserver>,
    ) -> FrameResult<TokioConnection> {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        let channel = build_channel(pool, local, remote, pipeline);
        channel.set_protocol(ProtocolTag::WebSocket);

        let handshake_result: FrameResult<()> = async {
            let (response, _negotiated) = ws::accept_request(request, supported_subprotocols)?;
            stream.write_all(&response.to_bytes()).await?;
            Ok(())
        }
        .await;

        if let Err(e) = handshake_result {
            channel.begin_close();
            channel.finish_close();
            if let Some(observer) = on_established {
                observer.on_established(&channel, false);
            }
            return Err(e);
        }

        channel.set_handshake_state(HandshakeState::Upgraded);
        if let Some(observer) = on_established {
            observer.on_established(&channel, true);
        }
        Ok(Self::spawn(stream, channel, WireProtocol::WebSocket(Role::Server)))
    }

    fn spawn(stream: TcpStream, channel: Channel, protocol: WireProtocol) -> TokioConnection {
        let (read_half, write_half) = stream.into_split();
        channel.dispatch_opened();

        let read_task = {
            let channel = channel.clone();
            tokio::spawn(async move {
                run_read_loop(read_half, channel, protocol).await;
            })
        };

        TokioConnection {
            channel,
            writer: Arc::new(AsyncMutex::new(write_half)),
            protocol,
            read_task,
        }
    }
}

fn build_channel(pool: ChunkPool, local: Option<std::net::SocketAddr>, remote: Option<std::net::SocketAddr>, pipeline: Pipeline) -> Channel {
    match (local, remote) {
        (Some(l), Some(r)) => Channel::with_endpoints_and_pipeline(pool, l, r, pipeline),
        _ => Channel::with_pipeline(pool, pipeline),
    }
}

async fn read_http_response(stream: &mut TcpStream) -> FrameResult<HttpResponse> {
    let mut acc = Vec::new();
    let mut tmp = [0u8; READ_CHUNK];
    loop {
        match HttpResponse::parse(&acc) {
            Ok(response) => return Ok(response),
            Err(crate::http::HttpError::Incomplete) => {}
            Err(e) => return Err(FrameError::Http(e)),
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(FrameError::Other("connection closed during handshake".into()));
        }
        acc.extend_from_slice(&tmp[..n]);
    }
}

async fn run_read_loop(mut read_half: tokio::net::tcp::OwnedReadHalf, channel: Channel, protocol: WireProtocol) {
    let incoming = ChunkedBuffer::new(channel.pool().clone());
    let mut ws_codec = WebSocketCodec::new(match protocol {
        WireProtocol::WebSocket(role) => role,
        WireProtocol::Gds => Role::Server,
    });
    let mut gds_reassembler = GdsReassembler::new(channel.pool().clone());
    let mut tmp = [0u8; READ_CHUNK];

    loop {
        let n = match read_half.read(&mut tmp).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "read error, closing channel");
                break;
            }
        };
        if let Err(e) = incoming.write(&tmp[..n], 0, n) {
            tracing::warn!(error = %e, "failed to buffer incoming bytes, closing channel");
            break;
        }

        loop {
            let dispatched = match protocol {
                WireProtocol::WebSocket(_) => match ws_codec.decode_frame(&incoming) {
                    Ok(Some(frame)) => Some(dispatch_ws_frame(&channel, frame)),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed websocket frame, closing channel");
                        channel.begin_close();
                        return;
                    }
                },
                WireProtocol::Gds => match crate::gds::decode_frame(&incoming) {
                    Ok(Some(frame)) => {
                        if let Some(complete) = gds_reassembler.feed(frame) {
                            Some(dispatch_gds_frame(&channel, complete))
                        } else {
                            Some(())
                        }
                    }
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed gds frame, closing channel");
                        channel.begin_close();
                        return;
                    }
                },
            };
            if dispatched.is_none() {
                break;
            }
        }

        let _ = incoming.flush();
    }

    channel.begin_close();
}

fn dispatch_ws_frame(channel: &Channel, frame: WebSocketFrame) {
    let mut message = Message::WebSocket(frame);
    if channel.dispatch_incoming(&mut message).is_err() {
        tracing::debug!("dropped incoming websocket frame on closed channel");
    }
}

fn dispatch_gds_frame(channel: &Channel, frame: GdsFrame) {
    let mut message = Message::Gds(frame);
    if channel.dispatch_incoming(&mut message).is_err() {
        tracing::debug!("dropped incoming gds frame on closed channel");
    }
}

impl FrameConnection for TokioConnection {
    fn send(&self, mut message: Message) -> impl std::future::Future<Output = FrameResult<()>> + Send {
        async move {
            self.channel.dispatch_outgoing(&mut message)?;

            let bytes = match (&self.protocol, &message) {
                (WireProtocol::WebSocket(role), Message::WebSocket(frame)) => {
                    WebSocketCodec::new(*role).encode_frame(frame)
                }
                (WireProtocol::Gds, Message::Gds(frame)) => crate::gds::encode_frame(frame)?,
                _ => {
                    return Err(FrameError::Other(
                        "message variant does not match this connection's wire protocol".into(),
                    ))
                }
            };

            let mut writer = self.writer.lock().await;
            writer.write_all(&bytes).await?;
            Ok(())
        }
    }

    fn close(&self) -> impl std::future::Future<Output = FrameResult<()>> + Send {
        async move {
            self.channel.begin_close();
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
            self.channel.finish_close();
            Ok(())
        }
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for TokioConnection {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}
