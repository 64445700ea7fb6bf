use serde::{Deserialize, Serialize};

/// Ring and queue capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Highest node ID this ring will ever invite. Timeouts scale with it.
    pub max_nodes: u8,

    /// Capacity of the outbound operation queue.
    pub max_pending_ops: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_nodes: 10,
            max_pending_ops: 50,
        }
    }
}
