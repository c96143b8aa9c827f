//! Transport connection contract shared by the stream and web listeners.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use proto::ConnError;
use tracing::debug;

/// One accepted transport connection.
///
/// Exactly one agent reads from a connection; any task may write to it.
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    /// Waits for the next inbound frame.
    async fn read_msg(&self) -> Result<Bytes, ConnError>;

    /// Queues the frames as one outbound message without waiting for the socket.
    ///
    /// A full pending-write queue destroys the connection.
    fn write_msg(&self, frames: &[Vec<u8>]) -> Result<(), ConnError>;

    /// Local socket address.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Peer socket address.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Stops reading, flushes queued writes, then shuts the connection down.
    fn close(&self);

    /// Drops queued writes and shuts the connection down immediately.
    fn destroy(&self);

    /// Resolves once the writer has stopped, whether it flushed or was destroyed.
    async fn flushed(&self);
}

/// Per-connection actor driven by a listener.
///
/// The listener awaits `run`, closes the connection, and then calls
/// `on_close` exactly once.
#[async_trait]
pub trait ConnAgent: Send + Sync {
    /// Serves the connection until it fails.
    async fn run(&self);

    /// Releases whatever the agent holds for this connection.
    async fn on_close(&self);
}

/// Future resolving to the agent built for a connection.
pub type AgentFuture = Pin<Box<dyn Future<Output = Arc<dyn ConnAgent>> + Send>>;

/// Builds the agent for a freshly accepted connection.
pub type NewAgent = Arc<dyn Fn(Arc<dyn Conn>) -> AgentFuture + Send + Sync>;

/// How long a closing connection may spend flushing before it is destroyed.
pub(crate) const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Serves one tracked connection with a freshly built agent, then reclaims it.
///
/// A peer that stops reading cannot hold the connection open: queued writes
/// get [`FLUSH_TIMEOUT`] to drain before the connection is destroyed.
pub(crate) async fn serve_conn(
    conn: Arc<dyn Conn>,
    key: u64,
    conns: Arc<ConnSet>,
    new_agent: NewAgent,
) {
    let agent = new_agent(conn.clone()).await;
    agent.run().await;

    conn.close();
    if tokio::time::timeout(FLUSH_TIMEOUT, conn.flushed()).await.is_err() {
        debug!(remote = ?conn.remote_addr(), "flush timed out, destroying connection");
    }
    conn.destroy();
    conns.remove(key);
    agent.on_close().await;
}

const MIN_MSG_LEN: usize = 1;

/// Checks an outbound or inbound body length against the transport limits.
pub(crate) fn check_msg_len(len: usize, max_msg_len: usize) -> Result<(), ConnError> {
    if len > max_msg_len {
        return Err(ConnError::MessageTooLong(max_msg_len));
    }
    if len < MIN_MSG_LEN {
        return Err(ConnError::MessageTooShort);
    }
    Ok(())
}

/// Joins the frames of one write into a single message body.
pub(crate) fn join_frames(frames: &[Vec<u8>], max_msg_len: usize) -> Result<Bytes, ConnError> {
    let len = frames.iter().map(Vec::len).sum();
    check_msg_len(len, max_msg_len)?;
    let mut body = BytesMut::with_capacity(len);
    for frame in frames {
        body.extend_from_slice(frame);
    }
    Ok(body.freeze())
}

/// Why a connection was not admitted to a [`ConnSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refused {
    /// The listener already holds its maximum number of connections.
    TooManyConnections,
    /// The listener is shutting down.
    Closed,
}

#[derive(Default)]
struct ConnSetInner {
    next_key: u64,
    conns: HashMap<u64, Arc<dyn Conn>>,
    closed: bool,
}

/// Live connections owned by one listener.
#[derive(Default)]
pub struct ConnSet {
    inner: Mutex<ConnSetInner>,
}

impl ConnSet {
    /// Creates an empty, open set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `conn` unless the set is closed or already holds `max_conns`.
    pub fn insert(&self, conn: Arc<dyn Conn>, max_conns: usize) -> Result<u64, Refused> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Refused::Closed);
        }
        if inner.conns.len() >= max_conns {
            return Err(Refused::TooManyConnections);
        }
        let key = inner.next_key;
        inner.next_key += 1;
        inner.conns.insert(key, conn);
        Ok(key)
    }

    /// Stops tracking the connection stored under `key`.
    pub fn remove(&self, key: u64) {
        self.inner.lock().conns.remove(&key);
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.inner.lock().conns.len()
    }

    /// Returns `true` when no connection is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuses further inserts and closes every tracked connection.
    pub fn close_all(&self) {
        let conns: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.conns.values().cloned().collect()
        };
        for conn in conns {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockConn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAgent {
        conn: Arc<dyn Conn>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnAgent for CountingAgent {
        async fn run(&self) {
            while self.conn.read_msg().await.is_ok() {}
        }

        async fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_factory(closes: &Arc<AtomicUsize>) -> NewAgent {
        let closes = closes.clone();
        Arc::new(move |conn: Arc<dyn Conn>| -> AgentFuture {
            let closes = closes.clone();
            Box::pin(async move { Arc::new(CountingAgent { conn, closes }) as Arc<dyn ConnAgent> })
        })
    }

    #[tokio::test]
    async fn serve_conn_closes_then_destroys_after_read_loop_ends() {
        let set = Arc::new(ConnSet::new());
        let (conn, feed) = MockConn::new();
        let key = set.insert(conn.clone(), 4).expect("insert");
        let closes = Arc::new(AtomicUsize::new(0));

        feed.send(Ok(Bytes::from_static(b"x"))).expect("feed");
        feed.send(Err(ConnError::Io("reset".to_string()))).expect("feed");
        serve_conn(conn.clone(), key, set.clone(), counting_factory(&closes)).await;

        assert!(conn.is_closed());
        assert!(conn.is_destroyed());
        assert!(set.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn serve_conn_destroys_a_connection_that_never_flushes() {
        let set = Arc::new(ConnSet::new());
        let (conn, feed) = MockConn::new();
        conn.stall_flush();
        let key = set.insert(conn.clone(), 4).expect("insert");
        let closes = Arc::new(AtomicUsize::new(0));
        drop(feed);

        tokio::time::timeout(
            FLUSH_TIMEOUT * 5,
            serve_conn(conn.clone(), key, set.clone(), counting_factory(&closes)),
        )
        .await
        .expect("a stalled flush must not hold the connection");

        assert!(conn.is_destroyed());
        assert!(set.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn insert_and_remove_track_connections() {
        let set = ConnSet::new();
        let (conn, _feed) = MockConn::new();
        let key = set.insert(conn, 4).expect("open set accepts");
        assert_eq!(set.len(), 1);
        set.remove(key);
        assert!(set.is_empty());
    }

    #[test]
    fn insert_enforces_connection_limit() {
        let set = ConnSet::new();
        let (first, _feed_a) = MockConn::new();
        let (second, _feed_b) = MockConn::new();
        set.insert(first, 1).expect("first fits");
        assert_eq!(set.insert(second, 1), Err(Refused::TooManyConnections));
    }

    #[test]
    fn close_all_closes_connections_and_refuses_new_ones() {
        let set = ConnSet::new();
        let (first, _feed_a) = MockConn::new();
        let (second, _feed_b) = MockConn::new();
        set.insert(first.clone(), 8).expect("insert first");
        set.insert(second.clone(), 8).expect("insert second");

        set.close_all();
        assert!(first.is_closed());
        assert!(second.is_closed());

        let (late, _feed_c) = MockConn::new();
        assert_eq!(set.insert(late, 8), Err(Refused::Closed));
    }
}
