// ABOUTME: Fluent builder for establishing a client-side connection, either WebSocket or GDS
// ABOUTME: Set fields via the chained methods, then `.connect().await` performs the I/O

use crate::client::default::TokioConnection;
use crate::client::error::{FrameError, FrameResult};
use crate::client::traits::EstablishedObserver;
use crate::pipeline::Pipeline;
use crate::pool::ChunkPool;
use crate::ws::ClientHandshake;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Which protocol a connection speaks once established. A GDS connection
/// skips the HTTP upgrade handshake entirely; a WebSocket connection
/// performs it before the channel is handed to the caller.
#[derive(Clone)]
pub enum Protocol {
    WebSocket {
        path: String,
        subprotocols: Vec<String>,
    },
    Gds,
}

pub struct ConnectionBuilder {
    host: String,
    port: u16,
    protocol: Protocol,
    pool: Option<ChunkPool>,
    pipeline_template: Option<Arc<Pipeline>>,
    connect_timeout: Duration,
    on_established: Option<Arc<dyn EstablishedObserver>>,
}

impl ConnectionBuilder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ConnectionBuilder {
            host: host.into(),
            port,
            protocol: Protocol::Gds,
            pool: None,
            pipeline_template: None,
            connect_timeout: Duration::from_secs(10),
            on_established: None,
        }
    }

    pub fn websocket(mut self, path: impl Into<String>) -> Self {
        self.protocol = Protocol::WebSocket {
            path: path.into(),
            subprotocols: Vec::new(),
        };
        self
    }

    pub fn subprotocols(mut self, protocols: &[&str]) -> Self {
        if let Protocol::WebSocket { subprotocols, .. } = &mut self.protocol {
            *subprotocols = protocols.iter().map(|s| s.to_string()).collect();
        }
        self
    }

    pub fn gds(mut self) -> Self {
        self.protocol = Protocol::Gds;
        self
    }

    pub fn pool(mut self, pool: ChunkPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn pipeline_template(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.pipeline_template = Some(pipeline);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn on_established<O: EstablishedObserver + 'static>(mut self, observer: O) -> Self {
        self.on_established = Some(Arc::new(observer));
        self
    }

    /// Opens the TCP socket, performs the handshake appropriate to
    /// `protocol`, and returns a running connection whose pipeline has
    /// the requested codec installed.
    pub async fn connect(self) -> FrameResult<TokioConnection> {
        let pool = self.pool.unwrap_or_else(ChunkPool::default_pool);
        let pipeline = self
            .pipeline_template
            .map(|template| template.clone_for_channel())
            .unwrap_or_default();

        let addr = format!("{}:{}", self.host, self.port);
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FrameError::Timeout)??;

        match self.protocol {
            Protocol::Gds => {
                let conn = TokioConnection::from_stream_gds(stream, pool, pipeline)?;
                if let Some(observer) = &self.on_established {
                    observer.on_established(conn.channel(), true);
                }
                Ok(conn)
            }
            Protocol::WebSocket { path, subprotocols } => {
                let handshake = ClientHandshake::new();
                let subs: Vec<&str> = subprotocols.iter().map(|s| s.as_str()).collect();
                TokioConnection::upgrade_websocket(
                    stream,
                    pool,
                    pipeline,
                    &handshake,
                    &self.host,
                    &path,
                    &subs,
                    self.on_established.as_deref(),
                )
                .await
            }
        }
    }
}
