//! Configuration structures.
//!
//! Configuration is loaded from a JSON file and environment variables.
//! Every section has defaults so an empty document is a valid config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::{Error, Result};

/// Global agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Agent identity and host paths.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Container scratch layout.
    #[serde(default)]
    pub container: ContainerConfig,

    /// Domain socket proxy settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Orchestrator-backed kernel settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Simulated backend delays.
    #[serde(default)]
    pub dummy: DummyConfig,

    /// Transfer limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Log filter and output format.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a JSON document on disk.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::validation(format!("cannot read config {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply `KERNEL_AGENT_*` environment overrides.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("KERNEL_AGENT_SCRATCH_ROOT") {
            self.container.scratch_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KERNEL_AGENT_IPC_BASE_PATH") {
            self.agent.ipc_base_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KERNEL_AGENT_ID") {
            if !v.is_empty() {
                self.agent.agent_id = v;
            }
        }
        if let Ok(v) = std::env::var("KERNEL_AGENT_LOG_FORMAT") {
            if let Some(format) = LogFormat::parse(&v) {
                self.logging.format = format;
            }
        }
        self
    }
}

/// Agent identity and host-side paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent identifier reported in recovery metadata.
    pub agent_id: String,

    /// Base directory for Unix domain sockets (proxy sockets live under `proxy/`).
    pub ipc_base_path: PathBuf,

    /// Directory holding image commit lock markers and exported images.
    pub image_commit_path: PathBuf,

    /// Interval between periodic registry saves.
    #[serde(with = "humantime_serde")]
    pub registry_save_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "i-local".to_string(),
            ipc_base_path: PathBuf::from("/tmp/backend.ai/ipc"),
            image_commit_path: PathBuf::from("./tmp/backend.ai/commit"),
            registry_save_interval: Duration::from_secs(30),
        }
    }
}

/// Scratch layout and in-container paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Root of all per-kernel recoverable state.
    pub scratch_root: PathBuf,

    /// Confined in-container root for file transfers.
    pub home_dir: String,

    /// Helper interpreter used for in-container file listing.
    pub helper_python: String,

    /// REPL host used when a creation spec leaves it empty.
    pub kernel_host: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            scratch_root: PathBuf::from("./scratches"),
            home_dir: "/home/work".to_string(),
            helper_python: "/opt/backend.ai/bin/python".to_string(),
            kernel_host: "127.0.0.1".to_string(),
        }
    }
}

/// Domain socket proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Relay read chunk size in bytes.
    pub chunk_size: usize,

    /// Permission bits applied to host proxy sockets.
    pub socket_mode: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            socket_mode: 0o666,
        }
    }
}

/// Orchestrator-backed kernel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Namespace that holds kernel deployments.
    pub namespace: String,

    /// Delay between readiness polls after scale-up.
    #[serde(with = "humantime_serde")]
    pub readiness_poll_interval: Duration,

    /// Handshake retries after the first failed attempt (delay `attempt²` seconds).
    pub handshake_max_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: "backend-ai".to_string(),
            readiness_poll_interval: Duration::from_millis(500),
            handshake_max_retries: 4,
        }
    }
}

/// Per-operation delays (seconds) for the simulated backend.
///
/// Keys are operation names such as `check-status`, `get-logs`, `commit`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DummyConfig {
    pub delay: HashMap<String, f64>,
}

impl DummyConfig {
    /// Delay for an operation; unknown and non-positive entries mean no delay.
    pub fn delay_for(&self, op: &str) -> Duration {
        match self.delay.get(op) {
            Some(secs) if secs.is_finite() && *secs > 0.0 => Duration::from_secs_f64(*secs),
            _ => Duration::ZERO,
        }
    }
}

/// Transfer limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum tar archive size accepted by downloads.
    pub max_download_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_download_bytes: 1024 * 1024,
        }
    }
}

/// Log output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "console" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Log filter and output format. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
