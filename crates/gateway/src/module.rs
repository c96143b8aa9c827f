//! Module lifecycle: ordered init, concurrent run, reverse-order teardown.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A unit of the server composed and driven by [`ModuleRunner`].
///
/// `on_init` has no default: whatever embeds a [`Gate`](crate::Gate) must
/// say how it is built.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Prepares the module before any module runs.
    async fn on_init(&mut self) -> anyhow::Result<()>;

    /// Runs after `run` has returned.
    async fn on_destroy(&self) {}

    /// Serves until `stop` fires. An error here is fatal to the process.
    async fn run(&self, stop: CancellationToken) -> anyhow::Result<()>;
}

struct RunningModule {
    module: Arc<dyn Module>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns registered modules and their tasks.
#[derive(Default)]
pub struct ModuleRunner {
    pending: Vec<Box<dyn Module>>,
    running: Vec<RunningModule>,
    failed: CancellationToken,
}

impl ModuleRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module; modules start in registration order.
    pub fn register(&mut self, module: impl Module) -> &mut Self {
        self.pending.push(Box::new(module));
        self
    }

    /// Calls `on_init` on every registered module, stopping at the first error.
    pub async fn init(&mut self) -> anyhow::Result<()> {
        for module in &mut self.pending {
            let name = module.name().to_string();
            module
                .on_init()
                .await
                .with_context(|| format!("module {name} failed to initialise"))?;
            debug!(module = %name, "module initialised");
        }
        Ok(())
    }

    /// Spawns `run` for every initialised module.
    pub fn start(&mut self) {
        for module in self.pending.drain(..) {
            let module: Arc<dyn Module> = Arc::from(module);
            let stop = CancellationToken::new();
            let task = tokio::spawn({
                let module = module.clone();
                let stop = stop.clone();
                let failed = self.failed.clone();
                async move {
                    if let Err(e) = module.run(stop).await {
                        error!(module = module.name(), "module failed: {e:#}");
                        failed.cancel();
                    }
                }
            });
            self.running.push(RunningModule { module, stop, task });
        }
    }

    /// Fires when any module's `run` returns an error.
    pub fn failed(&self) -> CancellationToken {
        self.failed.clone()
    }

    /// Stops modules in reverse start order, waiting for each before `on_destroy`.
    pub async fn shutdown(&mut self) {
        while let Some(running) = self.running.pop() {
            running.stop.cancel();
            if let Err(e) = running.task.await {
                error!(module = running.module.name(), "module task panicked: {e}");
            }
            running.module.on_destroy().await;
            debug!(module = running.module.name(), "module destroyed");
        }
    }
}
