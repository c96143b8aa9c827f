use gateway::GateConfig;
use proto::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level `leafgate` configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub log: LogConfig,
    /// Listener addresses and connection limits.
    pub gate: GateConfig,
}

/// Logging config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for daily rolling log files. Console only when empty.
    pub path: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: String::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Loads configuration from explicit path, fallback locations, and env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    fn load_with(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config_path = path.map(Path::to_path_buf).or_else(|| {
            // Look in current dir, then home dir
            let cwd = std::env::current_dir().ok()?.join("leafgate.toml");
            if cwd.exists() {
                return Some(cwd);
            }
            let home = std::env::var("HOME").ok()?;
            let home_config = PathBuf::from(home).join(".leafgate").join("config.toml");
            if home_config.exists() {
                return Some(home_config);
            }
            None
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = if let Some(path) = config_path {
            let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))?
        } else {
            Config::default()
        };

        if let Some(addr) = env("LEAFGATE_TCP_ADDR") {
            config.gate.tcp_addr = addr;
        }
        if let Some(addr) = env("LEAFGATE_WS_ADDR") {
            config.gate.ws_addr = addr;
        }
        if let Some(level) = env("LEAFGATE_LOG_LEVEL") {
            config.log.level = level;
        }

        debug!(
            tcp_addr = %config.gate.tcp_addr,
            ws_addr = %config.gate.ws_addr,
            "Config loaded"
        );
        Ok(config)
    }

    /// Rejects values the listeners cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.gate.len_msg_len, 1 | 2 | 4) {
            return Err(invalid(
                "gate.len_msg_len",
                format!("must be 1, 2 or 4, got {}", self.gate.len_msg_len),
            ));
        }
        if self.gate.max_conn_num == 0 {
            return Err(invalid("gate.max_conn_num", "must be positive"));
        }
        if self.gate.pending_write_num == 0 {
            return Err(invalid("gate.pending_write_num", "must be positive"));
        }
        if self.log.level.trim().is_empty() {
            return Err(invalid("log.level", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}
