//! Configuration loading and parsing

use crate::output::OutputMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main observer configuration (loaded from observer.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ObserverConfig {
    /// Identifier of the node this observer drives
    #[serde(default)]
    pub node_id: u32,
    /// Default output mode for node and experiment records
    #[serde(default)]
    pub output: OutputMode,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub serial: SerialConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Longest uninterrupted sleep of the scheduler thread
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
}

fn default_step_ms() -> u64 {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            step_ms: default_step_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PersistenceConfig {
    /// Directory remembering the last profile and behavior; disabled when unset
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Log every record
    #[default]
    Log,
    /// Write capture, JSON lines and raw files
    Capture,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    pub capture_file: Option<PathBuf>,
    pub json_file: Option<PathBuf>,
    pub raw_file: Option<PathBuf>,
    #[serde(default = "default_link_type")]
    pub link_type: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_link_type() -> u32 {
    sensorlab_codec::LINK_TYPE_SENSORLAB
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            capture_file: None,
            json_file: None,
            raw_file: None,
            link_type: default_link_type(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Shell used to run controller commands
    #[serde(default = "default_shell")]
    pub shell: PathBuf,
}

fn default_shell() -> PathBuf {
    PathBuf::from("/bin/sh")
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    /// Read timeout used when the profile leaves it unset
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

fn default_poll_ms() -> u64 {
    100
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<ObserverConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: ObserverConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    if config.transport.kind == TransportKind::Capture
        && config.transport.capture_file.is_none()
        && config.transport.json_file.is_none()
    {
        anyhow::bail!("capture transport needs capture_file or json_file in {:?}", path);
    }

    Ok(config)
}
