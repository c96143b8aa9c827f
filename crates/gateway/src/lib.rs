//! Connection gateway: stream and WebSocket listeners, per-connection agents,
//! and a pluggable wire-format processor routing decoded messages to handlers.

pub mod agent;
pub mod chanrpc;
pub mod conn;
pub mod gate;
pub mod json;
pub mod module;
pub mod processor;
pub mod tcp;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_support;

/// Handle to a per-connection agent.
pub use agent::AgentHandle;
/// Channel-backed router and lifecycle target.
pub use chanrpc::{ChanRpc, ChanRpcServer};
/// Transport connection contract.
pub use conn::{Conn, ConnAgent, NewAgent};
/// Gate and its configuration.
pub use gate::{Gate, GateConfig, LifecycleTarget, Listener};
/// Tagged-envelope JSON processor.
pub use json::{JsonProcessor, JsonProcessorBuilder};
/// Module lifecycle.
pub use module::{Module, ModuleRunner};
/// Wire-format processor contract.
pub use processor::{Delivery, MessageRouter, Processor};
/// Stream transport.
pub use tcp::{MsgParser, TcpConn, TcpServer, TcpServerConfig};
/// WebSocket transport.
pub use ws::{WsConn, WsServer, WsServerConfig};
