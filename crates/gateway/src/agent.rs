//! Per-connection agent: read loop, outbound writes and close reporting.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use proto::{AgentId, Message};
use tracing::{debug, error};

use crate::conn::{Conn, ConnAgent};
use crate::gate::Gate;

struct Agent {
    id: AgentId,
    conn: Arc<dyn Conn>,
    gate: Arc<Gate>,
    closed: AtomicBool,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// Cloneable handle to a connection agent.
///
/// Handed to routers and lifecycle targets in place of the agent itself.
/// Every operation stays safe after the connection is gone.
#[derive(Clone)]
pub struct AgentHandle(Arc<Agent>);

impl AgentHandle {
    /// Binds a new agent to `conn` and the gate that accepted it.
    pub fn new(conn: Arc<dyn Conn>, gate: Arc<Gate>) -> Self {
        Self(Arc::new(Agent {
            id: AgentId::next(),
            conn,
            gate,
            closed: AtomicBool::new(false),
            user_data: Mutex::new(None),
        }))
    }

    /// Process-unique identifier of this agent.
    pub fn id(&self) -> AgentId {
        self.0.id
    }

    /// Encodes `msg` with the gate's processor and queues it on the connection.
    ///
    /// Encode and write failures are logged and the message is dropped; the
    /// agent keeps running.
    pub fn write_msg(&self, msg: &dyn Message) {
        let Some(processor) = self.0.gate.processor() else {
            return;
        };
        let frames = match processor.marshal(msg) {
            Ok(frames) => frames,
            Err(e) => {
                error!(agent_id = %self.0.id, msg_type = msg.name(), "marshal message error: {e}");
                return;
            }
        };
        if let Err(e) = self.0.conn.write_msg(&frames) {
            error!(agent_id = %self.0.id, msg_type = msg.name(), "write message error: {e}");
        }
    }

    /// Shuts the connection down after queued writes are flushed.
    pub fn close(&self) {
        self.0.conn.close();
    }

    /// Shuts the connection down immediately, dropping queued writes.
    pub fn destroy(&self) {
        self.0.conn.destroy();
    }

    /// Local address of the connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.0.conn.local_addr()
    }

    /// Peer address of the connection.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.0.conn.remote_addr()
    }

    /// Attaches session state to this agent, replacing any previous value.
    pub fn set_user_data<T: Any + Send + Sync>(&self, data: T) {
        *self.0.user_data.lock() = Some(Arc::new(data));
    }

    /// Returns the attached session state if it is a `T`.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.0.user_data.lock().clone()?;
        data.downcast::<T>().ok()
    }

    /// Returns `true` once the agent has reported its closure.
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }
}

impl PartialEq for AgentHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for AgentHandle {}

impl Hash for AgentHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.0.id)
            .field("remote_addr", &self.0.conn.remote_addr())
            .finish()
    }
}

#[async_trait]
impl ConnAgent for AgentHandle {
    async fn run(&self) {
        let id = self.0.id;
        loop {
            let data = match self.0.conn.read_msg().await {
                Ok(data) => data,
                Err(e) => {
                    debug!(agent_id = %id, "read message: {e}");
                    break;
                }
            };

            let Some(processor) = self.0.gate.processor() else {
                continue;
            };
            let msg = match processor.unmarshal(&data) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(agent_id = %id, "unmarshal message error: {e}");
                    break;
                }
            };
            if let Err(e) = processor.route(msg, self.clone()) {
                debug!(agent_id = %id, "route message error: {e}");
                break;
            }
        }
    }

    async fn on_close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(target) = self.0.gate.lifecycle()
            && let Err(e) = target.close_agent(self.clone()).await
        {
            error!(agent_id = %self.0.id, "close agent notification error: {e}");
        }
        self.0.gate.forget_agent(self.0.id);
        self.0.user_data.lock().take();
    }
}
