use serde::{Deserialize, Serialize};

/// Node identity and failure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ring identity, 1..=limits.max_nodes. 0 and 255 are wire sentinels.
    pub node_id: u8,

    /// Zero linked variables and drop in-flight reads when their source
    /// node is evicted from the ring.
    pub failsafe: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            failsafe: false,
        }
    }
}
