//! Length-prefixed stream transport.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use proto::{ConnError, GateError};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec, LengthDelimitedCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::conn::{Conn, ConnSet, NewAgent, Refused, check_msg_len, join_frames, serve_conn};

const DEFAULT_LEN_MSG_LEN: usize = 2;
const DEFAULT_MAX_MSG_LEN: usize = 4096;
const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(1);

/// Frame layout: an unsigned length prefix followed by the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgParser {
    len_msg_len: usize,
    max_msg_len: usize,
    little_endian: bool,
}

impl MsgParser {
    /// `len_msg_len` must be 1, 2 or 4 bytes; anything else falls back to 2.
    /// `max_msg_len` of 0 means 4096 and is clamped to what the prefix can express.
    pub fn new(len_msg_len: usize, max_msg_len: usize, little_endian: bool) -> Self {
        let len_msg_len = match len_msg_len {
            1 | 2 | 4 => len_msg_len,
            _ => DEFAULT_LEN_MSG_LEN,
        };
        let max_msg_len = if max_msg_len == 0 {
            DEFAULT_MAX_MSG_LEN
        } else {
            max_msg_len
        };
        let prefix_limit = match len_msg_len {
            1 => u8::MAX as usize,
            2 => u16::MAX as usize,
            _ => u32::MAX as usize,
        };
        Self {
            len_msg_len,
            max_msg_len: max_msg_len.min(prefix_limit),
            little_endian,
        }
    }

    /// Width of the length prefix in bytes.
    pub fn len_msg_len(&self) -> usize {
        self.len_msg_len
    }

    /// Largest accepted message body.
    pub fn max_msg_len(&self) -> usize {
        self.max_msg_len
    }

    /// Codec reading and writing this frame layout.
    pub fn codec(&self) -> LengthDelimitedCodec {
        let mut builder = LengthDelimitedCodec::builder();
        builder
            .length_field_length(self.len_msg_len)
            .max_frame_length(self.max_msg_len);
        if self.little_endian {
            builder.little_endian();
        }
        builder.new_codec()
    }

    /// Checks a body length against the frame limits.
    pub fn check_len(&self, len: usize) -> Result<(), ConnError> {
        check_msg_len(len, self.max_msg_len)
    }

    /// Joins the frames of one write into a single message body.
    pub fn join(&self, frames: &[Vec<u8>]) -> Result<Bytes, ConnError> {
        join_frames(frames, self.max_msg_len)
    }

    fn read_error(&self, err: io::Error) -> ConnError {
        let too_long = err
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if too_long {
            ConnError::MessageTooLong(self.max_msg_len)
        } else {
            err.into()
        }
    }
}

/// Accepted stream connection with a bounded pending-write queue.
pub struct TcpConn {
    reader: tokio::sync::Mutex<Option<FramedRead<OwnedReadHalf, LengthDelimitedCodec>>>,
    writer: Mutex<Option<mpsc::Sender<Bytes>>>,
    parser: MsgParser,
    closing: CancellationToken,
    destroyed: CancellationToken,
    flushed: CancellationToken,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl TcpConn {
    /// Splits `stream` and spawns its writer on `tracker`.
    pub fn new(
        stream: TcpStream,
        pending_write_num: usize,
        parser: MsgParser,
        tracker: &TaskTracker,
    ) -> Self {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel(pending_write_num.max(1));
        let closing = CancellationToken::new();
        let destroyed = CancellationToken::new();
        let flushed = CancellationToken::new();
        tracker.spawn(write_loop(
            FramedWrite::new(write_half, parser.codec()),
            rx,
            closing.clone(),
            destroyed.clone(),
            flushed.clone(),
        ));

        Self {
            reader: tokio::sync::Mutex::new(Some(FramedRead::new(read_half, parser.codec()))),
            writer: Mutex::new(Some(tx)),
            parser,
            closing,
            destroyed,
            flushed,
            local_addr,
            remote_addr,
        }
    }
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
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
        // Sender dropped: orderly close once the queue is drained.
        let Some(body) = next else {
            if let Err(e) = SinkExt::<Bytes>::close(&mut sink).await {
                debug!("shutdown error: {e}");
            }
            break;
        };
        let sent = tokio::select! {
            biased;
            _ = destroyed.cancelled() => break,
            sent = sink.send(body) => sent,
        };
        if let Err(e) = sent {
            debug!("write error: {e}");
            break;
        }
    }
    closing.cancel();
    flushed.cancel();
}

#[async_trait]
impl Conn for TcpConn {
    async fn read_msg(&self) -> Result<Bytes, ConnError> {
        let mut reader = self.reader.lock().await;
        let Some(framed) = reader.as_mut() else {
            return Err(ConnError::Closed);
        };
        let next = tokio::select! {
            _ = self.closing.cancelled() => None,
            frame = framed.next() => Some(frame),
        };
        match next {
            None => {
                *reader = None;
                Err(ConnError::Closed)
            }
            Some(None) => Err(ConnError::Closed),
            Some(Some(Err(e))) => Err(self.parser.read_error(e)),
            Some(Some(Ok(body))) => {
                self.parser.check_len(body.len())?;
                Ok(body.freeze())
            }
        }
    }

    fn write_msg(&self, frames: &[Vec<u8>]) -> Result<(), ConnError> {
        let body = self.parser.join(frames)?;
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

/// Listener settings for the stream transport.
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub addr: String,
    pub max_conn_num: usize,
    pub pending_write_num: usize,
    pub len_msg_len: usize,
    pub max_msg_len: usize,
    pub little_endian: bool,
}

/// Stream listener wrapping every accepted connection in an agent.
pub struct TcpServer {
    config: TcpServerConfig,
    new_agent: NewAgent,
    conns: Arc<ConnSet>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    local_addr: Option<SocketAddr>,
}

impl TcpServer {
    /// Creates a stopped server.
    pub fn new(config: TcpServerConfig, new_agent: NewAgent) -> Self {
        Self {
            config,
            new_agent,
            conns: Arc::new(ConnSet::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: None,
        }
    }

    /// Binds the listener and spawns the accept loop.
    pub async fn start(&mut self) -> Result<(), GateError> {
        let listener = TcpListener::bind(self.config.addr.as_str())
            .await
            .map_err(|e| GateError::Listen {
                addr: self.config.addr.clone(),
                reason: e.to_string(),
            })?;
        self.local_addr = listener.local_addr().ok();
        info!(addr = ?self.local_addr, "TCP server listening");

        let acceptor = Acceptor {
            max_conn_num: self.config.max_conn_num,
            pending_write_num: self.config.pending_write_num,
            parser: MsgParser::new(
                self.config.len_msg_len,
                self.config.max_msg_len,
                self.config.little_endian,
            ),
            new_agent: self.new_agent.clone(),
            conns: self.conns.clone(),
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
        };
        self.tracker.spawn(acceptor.run(listener));
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
        info!(addr = ?self.local_addr, "TCP server closed");
    }
}

struct Acceptor {
    max_conn_num: usize,
    pending_write_num: usize,
    parser: MsgParser,
    new_agent: NewAgent,
    conns: Arc<ConnSet>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        let mut delay = Duration::ZERO;
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    delay = next_accept_delay(delay);
                    warn!("accept error: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            delay = Duration::ZERO;

            let conn: Arc<dyn Conn> = Arc::new(TcpConn::new(
                stream,
                self.pending_write_num,
                self.parser,
                &self.tracker,
            ));
            let key = match self.conns.insert(conn.clone(), self.max_conn_num) {
                Ok(key) => key,
                Err(Refused::TooManyConnections) => {
                    conn.destroy();
                    warn!(%remote, "too many connections");
                    continue;
                }
                Err(Refused::Closed) => {
                    conn.destroy();
                    break;
                }
            };
            debug!(%remote, "accepted connection");
            self.tracker.spawn(serve_conn(
                conn,
                key,
                self.conns.clone(),
                self.new_agent.clone(),
            ));
        }
        debug!("accept loop stopped");
    }
}

fn next_accept_delay(delay: Duration) -> Duration {
    if delay.is_zero() {
        Duration::from_millis(5)
    } else {
        (delay * 2).min(MAX_ACCEPT_DELAY)
    }
}
