use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol timing knobs.
///
/// Several effective timeouts scale linearly with `limits.max_nodes`: a
/// wider ring means the token takes proportionally longer to come around,
/// so operation expiry, idle reclaim and node liveness all stretch with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Minimum bus silence before a transmit may start.
    #[serde(with = "humantime_serde")]
    pub interframe_gap: Duration,

    /// Base lifetime of a queued remote operation.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Lifetime of a locally-queued read reply awaiting its token turn.
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,

    /// Delay between retries of a failed transmit attempt.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Retries granted to an operation or token pass before giving up.
    pub max_retries: u8,

    /// Cold-start listen window before assuming the coordinator role.
    #[serde(with = "humantime_serde")]
    pub initial_listen_period: Duration,

    /// How long a passed token may stay unacknowledged.
    #[serde(with = "humantime_serde")]
    pub token_response_timeout: Duration,

    /// Slack added to most timeout computations.
    #[serde(with = "humantime_serde")]
    pub base_timeout: Duration,

    /// Per-node liveness window (scaled by max_nodes).
    #[serde(with = "humantime_serde")]
    pub node_timeout: Duration,

    /// Idle time without token sightings before a reclaim attempt (scaled).
    #[serde(with = "humantime_serde")]
    pub token_reclaim_timeout: Duration,

    /// Interval between coordinator join invitations.
    #[serde(with = "humantime_serde")]
    pub join_cycle_interval: Duration,

    /// How long an invitation stays open for its response.
    #[serde(with = "humantime_serde")]
    pub join_response_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interframe_gap: Duration::from_micros(5_000),
            operation_timeout: Duration::from_millis(100),
            response_timeout: Duration::from_millis(100),
            retry_delay: Duration::from_millis(100),
            max_retries: 2,
            initial_listen_period: Duration::from_millis(2_000),
            token_response_timeout: Duration::from_millis(50),
            base_timeout: Duration::from_millis(100),
            node_timeout: Duration::from_millis(50),
            token_reclaim_timeout: Duration::from_millis(30),
            join_cycle_interval: Duration::from_millis(50),
            join_response_timeout: Duration::from_millis(20),
        }
    }
}

impl Config {
    pub fn interframe_gap_us(&self) -> u64 {
        self.interframe_gap.as_micros() as u64
    }

    /// Expiry of a queued operation: one full worst-case token rotation.
    pub fn operation_expiry_ms(&self, max_nodes: u8) -> u64 {
        (self.operation_timeout.as_millis() as u64 + self.base_timeout.as_millis() as u64)
            * u64::from(max_nodes)
    }

    pub fn response_expiry_ms(&self) -> u64 {
        self.response_timeout.as_millis() as u64
    }

    /// Listen window staggered by node ID so concurrent cold starts
    /// resolve to the lowest-ID coordinator.
    pub fn listen_window_ms(&self, node_id: u8) -> u64 {
        self.initial_listen_period.as_millis() as u64 + u64::from(node_id % 10) * 100
    }

    /// End-of-build fallback for a coordinator that never finishes its
    /// invitation cycle.
    pub fn network_build_timeout_ms(&self, max_nodes: u8) -> u64 {
        let cycle = self.join_cycle_interval.as_millis() as u64
            + self.join_response_timeout.as_millis() as u64;
        u64::from(max_nodes) * cycle * 3 / 2
    }

    pub fn join_cycle_interval_ms(&self) -> u64 {
        self.join_cycle_interval.as_millis() as u64
    }

    pub fn join_response_timeout_ms(&self) -> u64 {
        self.join_response_timeout.as_millis() as u64
    }

    /// Unconfirmed token pass retry deadline.
    pub fn pass_retry_after_ms(&self) -> u64 {
        self.token_response_timeout.as_millis() as u64
            + self.base_timeout.as_millis() as u64
            + self.interframe_gap.as_millis() as u64
    }

    /// Idle time without any token sighting before reclaim kicks in.
    pub fn token_reclaim_after_ms(&self, max_nodes: u8) -> u64 {
        (self.token_reclaim_timeout.as_millis() as u64 + self.base_timeout.as_millis() as u64)
            * u64::from(max_nodes)
    }

    /// Peer liveness horizon in connected states.
    pub fn node_expiry_ms(&self, max_nodes: u8) -> u64 {
        self.node_timeout.as_millis() as u64 * u64::from(max_nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scaling() {
        let timing = Config::default();
        assert_eq!(timing.operation_expiry_ms(10), 2_000);
        assert_eq!(timing.node_expiry_ms(10), 500);
        assert_eq!(timing.token_reclaim_after_ms(10), 1_300);
        assert_eq!(timing.pass_retry_after_ms(), 155);
        assert_eq!(timing.network_build_timeout_ms(10), 1_050);
    }

    #[test]
    fn listen_window_staggers_by_id() {
        let timing = Config::default();
        assert_eq!(timing.listen_window_ms(2), 2_200);
        assert_eq!(timing.listen_window_ms(7), 2_700);
        assert_eq!(timing.listen_window_ms(10), 2_000);
    }
}
