//! In-memory collaborators for unit tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proto::{AgentId, ConnError, DispatchError};
use tokio::sync::{Notify, mpsc};

use crate::agent::AgentHandle;
use crate::conn::Conn;
use crate::gate::{Gate, GateConfig, LifecycleTarget};
use crate::processor::{Delivery, MessageRouter};

pub(crate) type Feed = mpsc::UnboundedSender<Result<Bytes, ConnError>>;

/// Connection whose inbound frames are fed by the test.
pub(crate) struct MockConn {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Bytes, ConnError>>>,
    written: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    stall_flush: AtomicBool,
    closed: AtomicBool,
    destroyed: AtomicBool,
    shutdown: Notify,
}

impl MockConn {
    pub(crate) fn new() -> (Arc<Self>, Feed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            inbound: tokio::sync::Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            stall_flush: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        (conn, tx)
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Makes `flushed` never resolve, like a peer that stopped reading.
    pub(crate) fn stall_flush(&self) {
        self.stall_flush.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn pending_reads(&self) -> usize {
        self.inbound.try_lock().map(|rx| rx.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Conn for MockConn {
    async fn read_msg(&self) -> Result<Bytes, ConnError> {
        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = shutdown => Err(ConnError::Closed),
            frame = inbound.recv() => frame.unwrap_or(Err(ConnError::Closed)),
        }
    }

    fn write_msg(&self, frames: &[Vec<u8>]) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ConnError::Io("broken pipe".to_string()));
        }
        self.written.lock().push(frames.concat());
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.close();
    }

    async fn flushed(&self) {
        if self.stall_flush.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

/// Router that keeps every delivery.
#[derive(Default)]
pub(crate) struct CollectRouter {
    deliveries: Mutex<Vec<Delivery>>,
}

impl CollectRouter {
    pub(crate) fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.deliveries.lock())
    }
}

impl MessageRouter for CollectRouter {
    fn deliver(&self, delivery: Delivery) -> Result<(), DispatchError> {
        self.deliveries.lock().push(delivery);
        Ok(())
    }
}

/// Lifecycle target that records agent ids.
#[derive(Default)]
pub(crate) struct RecordingLifecycle {
    opened: Mutex<Vec<AgentId>>,
    closed: Mutex<Vec<AgentId>>,
}

impl RecordingLifecycle {
    pub(crate) fn opened(&self) -> Vec<AgentId> {
        self.opened.lock().clone()
    }

    pub(crate) fn closed(&self) -> Vec<AgentId> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl LifecycleTarget for RecordingLifecycle {
    async fn new_agent(&self, agent: AgentHandle) {
        self.opened.lock().push(agent.id());
    }

    async fn close_agent(&self, agent: AgentHandle) -> Result<(), DispatchError> {
        self.closed.lock().push(agent.id());
        Ok(())
    }
}

/// Agent over a fresh mock connection and a processor-less gate.
pub(crate) fn test_agent() -> (AgentHandle, Arc<MockConn>) {
    let (conn, _feed) = MockConn::new();
    let gate = Arc::new(Gate::new(GateConfig::default()));
    (AgentHandle::new(conn.clone(), gate), conn)
}
