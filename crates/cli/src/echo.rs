//! Demo gate answering every `Hello` with the same message.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use gateway::{ChanRpcServer, Gate, GateConfig, JsonProcessor, Module};
use parking_lot::Mutex;
use proto::NamedMessage;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const RPC_QUEUE_LEN: usize = 10_000;

/// Greeting sent by clients as `{"Hello":{"Name":"..."}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "Name")]
    pub name: String,
}

impl NamedMessage for Hello {
    const NAME: &'static str = "Hello";
}

pub struct EchoGate {
    config: GateConfig,
    gate: Option<Arc<Gate>>,
    rpc: Mutex<Option<ChanRpcServer>>,
}

impl EchoGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            gate: None,
            rpc: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Module for EchoGate {
    fn name(&self) -> &str {
        "echo"
    }

    async fn on_init(&mut self) -> anyhow::Result<()> {
        let mut rpc = ChanRpcServer::new(RPC_QUEUE_LEN);
        rpc.handle::<Hello, _>(|hello, agent| {
            debug!(agent_id = %agent.id(), name = %hello.name, "Echoing hello");
            agent.write_msg(&hello);
        })
        .on_new_agent(|agent| {
            info!(agent_id = %agent.id(), remote = ?agent.remote_addr(), "Agent connected");
        })
        .on_close_agent(|agent| {
            info!(agent_id = %agent.id(), "Agent closed");
            Ok(())
        });

        let client = rpc.client();
        let mut processor = JsonProcessor::builder();
        processor
            .register::<Hello>()?
            .set_router::<Hello>(Arc::new(client.clone()))?;

        let gate = Gate::new(self.config.clone())
            .with_processor(Arc::new(processor.build()))
            .with_lifecycle(Arc::new(client));
        self.gate = Some(Arc::new(gate));
        *self.rpc.get_mut() = Some(rpc);
        Ok(())
    }

    async fn run(&self, stop: CancellationToken) -> anyhow::Result<()> {
        let gate = self.gate.clone().context("echo gate is not initialised")?;
        let rpc = self.rpc.lock().take().context("echo gate is already running")?;

        // Handlers outlive the listeners so close notifications still get answered.
        let rpc_stop = CancellationToken::new();
        let rpc_task = tokio::spawn(rpc.run(rpc_stop.clone()));

        let result = gate.run(stop).await;
        rpc_stop.cancel();
        if let Err(e) = rpc_task.await {
            error!("echo handler task failed: {e}");
        }
        result.context("echo gate stopped")
    }
}
