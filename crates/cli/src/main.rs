//! `leafgate`: runs the demo echo gate on the configured listeners.

mod config;
mod daemon;
mod echo;

use std::path::PathBuf;

use clap::Parser;
use config::Config;
#[cfg(not(test))]
use echo::EchoGate;
#[cfg(not(test))]
use gateway::ModuleRunner;
#[cfg(not(test))]
use tracing::{error, info};
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "leafgate")]
#[command(about = "TCP and WebSocket connection gateway", version)]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overriding the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// TCP listen address, e.g. 127.0.0.1:3563
    #[arg(long)]
    tcp_addr: Option<String>,

    /// WebSocket listen address, e.g. 127.0.0.1:3653
    #[arg(long)]
    ws_addr: Option<String>,
}

impl Cli {
    /// Applies command-line overrides on top of file and environment values.
    fn apply_to(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(addr) = &self.tcp_addr {
            config.gate.tcp_addr = addr.clone();
        }
        if let Some(addr) = &self.ws_addr {
            config.gate.ws_addr = addr.clone();
        }
    }
}

#[cfg(not(test))]
#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply_to(&mut config);
    config.validate()?;

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard = init_tracing(&config.log)?;

    info!(
        tcp_addr = %config.gate.tcp_addr,
        ws_addr = %config.gate.ws_addr,
        "Starting leafgate"
    );
    if config.gate.tcp_addr.is_empty() && config.gate.ws_addr.is_empty() {
        info!("No listen address configured; waiting for shutdown only");
    }

    let mut runner = ModuleRunner::new();
    runner.register(EchoGate::new(config.gate.clone()));
    runner.init().await?;
    runner.start();

    let failed = runner.failed();
    tokio::select! {
        result = daemon::wait_for_shutdown() => {
            if let Err(e) = result {
                error!("Signal handler error: {e}");
            }
        }
        _ = failed.cancelled() => {
            error!("A module stopped unexpectedly, shutting down");
        }
    }

    runner.shutdown().await;
    info!("leafgate stopped");
    Ok(())
}

/// Installs the console subscriber and, when `log.path` is set, a daily rolling file.
#[cfg(not(test))]
fn init_tracing(
    log: &config::LogConfig,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    if log.path.is_empty() {
        fmt().with_env_filter(filter()).with_target(false).init();
        return Ok(None);
    }

    std::fs::create_dir_all(&log.path)?;
    let appender = tracing_appender::rolling::daily(&log.path, "leafgate.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let console = fmt::layer().with_target(false).with_filter(filter());
    let file = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(false)
        .with_filter(filter());
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Ok(Some(guard))
}
