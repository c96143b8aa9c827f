//! Gate: composition root that runs the listeners and builds agents.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use proto::{AgentId, DispatchError, GateError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::AgentHandle;
use crate::conn::{AgentFuture, Conn, ConnAgent, NewAgent};
use crate::processor::Processor;
use crate::tcp::{TcpServer, TcpServerConfig};
use crate::ws::{WsServer, WsServerConfig};

/// Receives agent creation and closure events.
///
/// `new_agent` precedes the agent's first read; `close_agent` follows its
/// last one. Each is delivered at most once per agent.
#[async_trait]
pub trait LifecycleTarget: Send + Sync {
    /// A connection was accepted and wrapped in `agent`.
    async fn new_agent(&self, agent: AgentHandle);

    /// `agent` stopped reading; release anything keyed by it.
    async fn close_agent(&self, agent: AgentHandle) -> Result<(), DispatchError>;
}

/// Listener addresses and limits shared by every agent of a gate.
///
/// An empty address disables that transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    /// Maximum live connections per listener.
    pub max_conn_num: usize,
    /// Maximum queued outbound messages per connection.
    pub pending_write_num: usize,
    /// Maximum message body length in bytes.
    pub max_msg_len: usize,
    /// WebSocket listen address.
    pub ws_addr: String,
    /// Timeout for the WebSocket upgrade request, in milliseconds.
    pub http_timeout_ms: u64,
    /// Stream listen address.
    pub tcp_addr: String,
    /// Width of the stream length prefix: 1, 2 or 4.
    pub len_msg_len: usize,
    /// Length prefix byte order.
    pub little_endian: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_conn_num: 100,
            pending_write_num: 100,
            max_msg_len: 4096,
            ws_addr: String::new(),
            http_timeout_ms: 10_000,
            tcp_addr: String::new(),
            len_msg_len: 2,
            little_endian: false,
        }
    }
}

impl GateConfig {
    /// Upgrade request timeout.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Accepts connections on the configured transports and wraps each in an agent.
///
/// Immutable once shared; every agent holds a reference to it.
pub struct Gate {
    config: GateConfig,
    processor: Option<Arc<dyn Processor>>,
    lifecycle: Option<Arc<dyn LifecycleTarget>>,
    agents: DashMap<AgentId, AgentHandle>,
}

impl Gate {
    /// Creates a gate without processor or lifecycle target.
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            processor: None,
            lifecycle: None,
            agents: DashMap::new(),
        }
    }

    /// Decodes, routes and encodes agent traffic with `processor`.
    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Reports agent creation and closure to `target`.
    pub fn with_lifecycle(mut self, target: Arc<dyn LifecycleTarget>) -> Self {
        self.lifecycle = Some(target);
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn processor(&self) -> Option<&Arc<dyn Processor>> {
        self.processor.as_ref()
    }

    pub fn lifecycle(&self) -> Option<&Arc<dyn LifecycleTarget>> {
        self.lifecycle.as_ref()
    }

    /// Looks up a live agent.
    pub fn agent(&self, id: AgentId) -> Option<AgentHandle> {
        self.agents.get(&id).map(|entry| entry.clone())
    }

    /// Number of live agents across all listeners.
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub(crate) fn forget_agent(&self, id: AgentId) {
        self.agents.remove(&id);
    }

    fn new_agent_factory(self: &Arc<Self>) -> NewAgent {
        let gate = self.clone();
        Arc::new(move |conn: Arc<dyn Conn>| -> AgentFuture {
            let gate = gate.clone();
            Box::pin(async move {
                let agent = AgentHandle::new(conn, gate.clone());
                gate.agents.insert(agent.id(), agent.clone());
                if let Some(target) = gate.lifecycle() {
                    target.new_agent(agent.clone()).await;
                }
                debug!(agent_id = %agent.id(), remote = ?agent.remote_addr(), "new agent");
                Arc::new(agent) as Arc<dyn ConnAgent>
            })
        })
    }

    fn create_ws_server(self: &Arc<Self>) -> Option<WsServer> {
        if self.config.ws_addr.is_empty() {
            return None;
        }
        debug!(addr = %self.config.ws_addr, "Creating WebSocket server");
        Some(WsServer::new(
            WsServerConfig {
                addr: self.config.ws_addr.clone(),
                max_conn_num: self.config.max_conn_num,
                pending_write_num: self.config.pending_write_num,
                max_msg_len: self.config.max_msg_len,
                http_timeout: self.config.http_timeout(),
            },
            self.new_agent_factory(),
        ))
    }

    fn create_tcp_server(self: &Arc<Self>) -> Option<TcpServer> {
        if self.config.tcp_addr.is_empty() {
            return None;
        }
        debug!(addr = %self.config.tcp_addr, "Creating TCP server");
        Some(TcpServer::new(
            TcpServerConfig {
                addr: self.config.tcp_addr.clone(),
                max_conn_num: self.config.max_conn_num,
                pending_write_num: self.config.pending_write_num,
                len_msg_len: self.config.len_msg_len,
                max_msg_len: self.config.max_msg_len,
                little_endian: self.config.little_endian,
            },
            self.new_agent_factory(),
        ))
    }

    /// Serves until `stop` fires, then closes the listeners in reverse start order.
    ///
    /// `started` is called with each listener's bound address once it accepts.
    pub async fn run_with(
        self: &Arc<Self>,
        stop: CancellationToken,
        mut started: impl FnMut(Listener),
    ) -> Result<(), GateError> {
        let mut ws_server = self.create_ws_server();
        if let Some(server) = ws_server.as_mut() {
            server.start().await?;
            if let Some(addr) = server.local_addr() {
                started(Listener::Ws(addr));
            }
        }

        let mut tcp_server = self.create_tcp_server();
        if let Some(server) = tcp_server.as_mut() {
            if let Err(e) = server.start().await {
                if let Some(ws) = &ws_server {
                    ws.close().await;
                }
                return Err(e);
            }
            if let Some(addr) = server.local_addr() {
                started(Listener::Tcp(addr));
            }
        }

        stop.cancelled().await;

        if let Some(server) = &tcp_server {
            info!("Closing TCP server");
            server.close().await;
        }
        if let Some(server) = &ws_server {
            info!("Closing WebSocket server");
            server.close().await;
        }
        Ok(())
    }

    /// Serves until `stop` fires.
    pub async fn run(self: &Arc<Self>, stop: CancellationToken) -> Result<(), GateError> {
        self.run_with(stop, |_| {}).await
    }
}

/// A started listener and its bound address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    Ws(std::net::SocketAddr),
    Tcp(std::net::SocketAddr),
}
