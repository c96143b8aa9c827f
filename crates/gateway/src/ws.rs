//! Framed web transport: WebSocket connections behind an axum listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parking_lot::Mutex;
use proto::{ConnError, GateError};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

use crate::conn::{Conn, ConnSet, NewAgent, Refused, join_frames, serve_conn};

/// Upgraded WebSocket connection with a bounded pending-write queue.
pub struct WsConn {
    reader: tokio::sync::Mutex<Option<SplitStream<WebSocket>>>,
    writer: Mutex<Option<mpsc::Sender<Bytes>>>,
    max_msg_len: usize,
    closing: CancellationToken,
    destroyed: CancellationToken,
    flushed: CancellationToken,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl WsConn {
    /// Splits `socket` and spawns its writer on `tracker`.
    pub fn new(
        socket: WebSocket,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        pending_write_num: usize,
        max_msg_len: usize,
        tracker: &TaskTracker,
    ) -> Self {
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(pending_write_num.max(1));
        let closing = CancellationToken::new();
        let destroyed = CancellationToken::new();
        let flushed = CancellationToken::new();
        tracker.spawn(write_loop(
            sink,
            rx,
            closing.clone(),
            destroyed.clone(),
            flushed.clone(),
        ));

        Self {
            reader: tokio::sync::Mutex::new(Some(stream)),
            writer: Mutex::new(Some(tx)),
            max_msg_len,
            closing,
            destroyed,
            flushed,
            local_addr,
            remote_addr,
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Bytes>,
    closing: CancellationToken,
    destroyed: CancellationToken,
    flushed: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = destroyed.cancelled() => break,
            next = rx.recv() => next,
        };
        let Some(body) = next else {
            if let Err(e) = sink.close().await {
                debug!("websocket close error: {e}");
            }
            break;
        };
        let sent = tokio::select! {
            biased;
            _ = destroyed.cancelled() => break,
            sent = sink.send(Message::Binary(body)) => sent,
        };
        if let Err(e) = sent {
            debug!("websocket write error: {e}");
            break;
        }
    }
    closing.cancel();
    flushed.cancel();
}

#[async_trait]
impl Conn for WsConn {
    async fn read_msg(&self) -> Result<Bytes, ConnError> {
        let mut reader = self.reader.lock().await;
        loop {
            let Some(stream) = reader.as_mut() else {
                return Err(ConnError::Closed);
            };
            let next = tokio::select! {
                _ = self.closing.cancelled() => None,
                msg = stream.next() => Some(msg),
            };
            let msg = match next {
                None => {
                    *reader = None;
                    return Err(ConnError::Closed);
                }
                Some(None) => return Err(ConnError::Closed),
                Some(Some(Err(e))) => return Err(ConnError::WebSocket(e.to_string())),
                Some(Some(Ok(msg))) => msg,
            };
            match msg {
                Message::Binary(data) => return Ok(data),
                Message::Text(text) => return Ok(Bytes::copy_from_slice(text.as_str().as_bytes())),
                Message::Close(_) => return Err(ConnError::Closed),
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }

    fn write_msg(&self, frames: &[Vec<u8>]) -> Result<(), ConnError> {
        let body = join_frames(frames, self.max_msg_len)?;
        let writer = self.writer.lock();
        let Some(tx) = writer.as_ref() else {
            return Err(ConnError::Closed);
        };
        match tx.try_send(body) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                drop(writer);
                debug!(remote = ?self.remote_addr, "close conn: pending write queue full");
                self.destroy();
                Err(ConnError::WriteQueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(ConnError::Closed),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn close(&self) {
        self.writer.lock().take();
        self.closing.cancel();
    }

    fn destroy(&self) {
        self.writer.lock().take();
        self.destroyed.cancel();
        self.closing.cancel();
    }

    async fn flushed(&self) {
        self.flushed.cancelled().await;
    }
}

/// Listener settings for the web transport.
#[derive(Debug, Clone)]
pub struct WsServerConfig {
    pub addr: String,
    pub max_conn_num: usize,
    pub pending_write_num: usize,
    pub max_msg_len: usize,
    pub http_timeout: Duration,
}

struct WsShared {
    max_conn_num: usize,
    pending_write_num: usize,
    max_msg_len: usize,
    local_addr: Option<SocketAddr>,
    new_agent: NewAgent,
    conns: Arc<ConnSet>,
    tracker: TaskTracker,
}

/// WebSocket listener wrapping every upgraded connection in an agent.
pub struct WsServer {
    config: WsServerConfig,
    new_agent: NewAgent,
    conns: Arc<ConnSet>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    local_addr: Option<SocketAddr>,
}

impl WsServer {
    /// Creates a stopped server.
    pub fn new(config: WsServerConfig, new_agent: NewAgent) -> Self {
        Self {
            config,
            new_agent,
            conns: Arc::new(ConnSet::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: None,
        }
    }

    /// Binds the listener and spawns the HTTP server.
    pub async fn start(&mut self) -> Result<(), GateError> {
        let listener = TcpListener::bind(self.config.addr.as_str())
            .await
            .map_err(|e| GateError::Listen {
                addr: self.config.addr.clone(),
                reason: e.to_string(),
            })?;
        self.local_addr = listener.local_addr().ok();
        info!(addr = ?self.local_addr, "WebSocket server listening");

        let shared = Arc::new(WsShared {
            max_conn_num: self.config.max_conn_num,
            pending_write_num: self.config.pending_write_num,
            max_msg_len: self.config.max_msg_len,
            local_addr: self.local_addr,
            new_agent: self.new_agent.clone(),
            conns: self.conns.clone(),
            tracker: self.tracker.clone(),
        });
        let app = Router::new()
            .fallback(upgrade_handler)
            .with_state(shared)
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.config.http_timeout,
            ));

        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!("WebSocket server error: {e}");
            }
        });
        Ok(())
    }

    /// Bound address, available after [`start`](Self::start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of live connections.
    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Stops accepting, closes every connection and waits for their tasks.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.conns.close_all();
        self.tracker.close();
        self.tracker.wait().await;
        info!(addr = ?self.local_addr, "WebSocket server closed");
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(shared): State<Arc<WsShared>>,
) -> Response {
    if shared.conns.len() >= shared.max_conn_num {
        warn!(%remote, "too many connections");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }
    ws.max_message_size(shared.max_msg_len)
        .on_upgrade(move |socket| accept_socket(socket, remote, shared))
}

async fn accept_socket(socket: WebSocket, remote: SocketAddr, shared: Arc<WsShared>) {
    let _token = shared.tracker.token();
    let conn: Arc<dyn Conn> = Arc::new(WsConn::new(
        socket,
        shared.local_addr,
        Some(remote),
        shared.pending_write_num,
        shared.max_msg_len,
        &shared.tracker,
    ));
    let key = match shared.conns.insert(conn.clone(), shared.max_conn_num) {
        Ok(key) => key,
        Err(Refused::TooManyConnections) => {
            warn!(%remote, "too many connections");
            conn.close();
            return;
        }
        Err(Refused::Closed) => {
            conn.close();
            return;
        }
    };
    debug!(%remote, "accepted websocket connection");
    serve_conn(conn, key, shared.conns.clone(), shared.new_agent.clone()).await;
}
