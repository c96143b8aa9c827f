#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway::{
    AgentHandle, ChanRpcServer, Gate, GateConfig, JsonProcessor, LifecycleTarget, Listener,
};
use parking_lot::Mutex;
use proto::{AgentId, DispatchError, GateError, NamedMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
}

impl NamedMessage for Hello {
    const NAME: &'static str = "Hello";
}

/// Lifecycle target that records agent ids in arrival order.
#[derive(Default)]
pub struct RecordingLifecycle {
    pub opened: Mutex<Vec<AgentId>>,
    pub closed: Mutex<Vec<AgentId>>,
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

pub struct RunningGate {
    pub gate: Arc<Gate>,
    pub stop: CancellationToken,
    pub listeners: Vec<Listener>,
    pub task: JoinHandle<Result<(), GateError>>,
    pub rpc_stop: CancellationToken,
}

impl RunningGate {
    pub fn tcp_addr(&self) -> std::net::SocketAddr {
        self.listeners
            .iter()
            .find_map(|l| match l {
                Listener::Tcp(addr) => Some(*addr),
                Listener::Ws(_) => None,
            })
            .expect("tcp listener should be running")
    }

    pub fn ws_addr(&self) -> std::net::SocketAddr {
        self.listeners
            .iter()
            .find_map(|l| match l {
                Listener::Ws(addr) => Some(*addr),
                Listener::Tcp(_) => None,
            })
            .expect("ws listener should be running")
    }

    pub async fn wait_for_agents(&self, count: usize) {
        for _ in 0..200 {
            if self.gate.agent_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} agents, found {}",
            self.gate.agent_count()
        );
    }

    pub async fn shutdown(self) {
        self.stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("gate should stop in time")
            .expect("gate task should not panic")
            .expect("gate should stop cleanly");
        self.rpc_stop.cancel();
    }
}

/// Starts a gate whose `Hello` handler echoes every message back to its sender.
pub async fn start_echo_gate(
    config: GateConfig,
    lifecycle: Option<Arc<dyn LifecycleTarget>>,
) -> RunningGate {
    let mut rpc = ChanRpcServer::new(1024);
    rpc.handle::<Hello, _>(|hello, agent| agent.write_msg(&hello));

    let mut builder = JsonProcessor::builder();
    builder
        .register::<Hello>()
        .expect("register Hello")
        .set_router::<Hello>(Arc::new(rpc.client()))
        .expect("route Hello");

    let rpc_stop = CancellationToken::new();
    tokio::spawn(rpc.run(rpc_stop.clone()));

    let mut gate = Gate::new(config).with_processor(Arc::new(builder.build()));
    if let Some(target) = lifecycle {
        gate = gate.with_lifecycle(target);
    }
    let gate = Arc::new(gate);
    let stop = CancellationToken::new();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn({
        let gate = gate.clone();
        let stop = stop.clone();
        async move {
            gate.run_with(stop, move |listener| {
                let _ = started_tx.send(listener);
            })
            .await
        }
    });

    let expected = usize::from(!gate.config().tcp_addr.is_empty())
        + usize::from(!gate.config().ws_addr.is_empty());
    let mut listeners = Vec::new();
    while listeners.len() < expected {
        let listener = tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
            .await
            .expect("listener should start")
            .expect("gate stopped before listening");
        listeners.push(listener);
    }

    RunningGate {
        gate,
        stop,
        listeners,
        task,
        rpc_stop,
    }
}
