//! Daemon configuration, loaded from TOML. Every field has a default so an
//! empty file (or no file) is a valid configuration.
//!
//! ```toml
//! http_addr = "127.0.0.1:8080"
//! model_dir = "models"
//! labels_path = "models/labels.txt"
//! default_model = "mv3"
//! default_strategy = "cpu"
//! top_k = 5
//!
//! [offload]
//! broker_host = "192.168.1.20"
//! broker_port = 1883
//! timeout_ms = 30000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use inferport_core::{AccelStrategy, ModelDescriptor};
use inferport_offload::MAX_OFFLOAD_TIMEOUT;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub http_addr: String,
    pub model_dir: PathBuf,
    pub labels_path: PathBuf,
    /// Unknown names resolve to `mv3`.
    pub default_model: String,
    /// Unknown names resolve to `cpu`.
    pub default_strategy: String,
    pub top_k: usize,
    pub max_threads: usize,
    pub input_cache: bool,
    pub offload: OffloadConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8080".to_string(),
            model_dir: PathBuf::from("models"),
            labels_path: PathBuf::from("models/labels.txt"),
            default_model: "mv3".to_string(),
            default_strategy: "cpu".to_string(),
            top_k: 5,
            max_threads: 4,
            input_cache: true,
            offload: OffloadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Mqtt,
    /// In-process broker with a loopback worker; no network.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    pub transport: TransportKind,
    pub broker_host: String,
    pub broker_port: u16,
    /// Generated as `device-<hex>` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Largest MQTT packet in either direction; bounds the image size.
    pub max_packet_bytes: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Mqtt,
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id: None,
            timeout_ms: 60_000,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            max_packet_bytes: 16 * 1024 * 1024,
        }
    }
}

impl OffloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms).min(MAX_OFFLOAD_TIMEOUT)
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("TOML parse error")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("TOML serialise error")
    }

    pub fn model(&self) -> ModelDescriptor {
        ModelDescriptor::from_name(&self.default_model)
    }

    pub fn strategy(&self) -> AccelStrategy {
        AccelStrategy::from_name(&self.default_strategy)
    }
}
