//! Decoder configuration types

use serde::{Deserialize, Serialize};

/// Configuration for the decoder library
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Pre-declare the current monitor's node properties (ids 5 to 9)
    #[serde(default = "default_true")]
    pub current_monitor: bool,

    /// Optional: only decode captured records from these nodes
    #[serde(default)]
    pub node_filter: Option<Vec<u32>>,
}

fn default_true() -> bool {
    true
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            current_monitor: true,
            node_filter: None,
        }
    }
}

impl DecoderConfig {
    /// Create a new decoder configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: enable or disable the current monitor declarations
    pub fn with_current_monitor(mut self, enabled: bool) -> Self {
        self.current_monitor = enabled;
        self
    }

    /// Builder method: set node filter
    pub fn with_node_filter(mut self, nodes: Vec<u32>) -> Self {
        self.node_filter = Some(nodes);
        self
    }

    /// Check if records of a node should be decoded
    pub fn should_process_node(&self, node_id: u32) -> bool {
        match &self.node_filter {
            Some(nodes) => nodes.contains(&node_id),
            None => true,
        }
    }
}
