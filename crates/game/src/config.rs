use std::time::Duration;

use crate::net::protocol::{DEFAULT_PORT, MAX_PLAYERS};
use crate::net::reliable::RetryPolicy;

/// Every tunable the core consumes. Collaborators construct one and pass it
/// down; the core holds no global configuration.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub port: u16,
    pub ping_interval: Duration,
    pub disconnection_timeout: Duration,
    pub connection_timeout: Duration,
    pub ack_timeout: Duration,
    pub max_retransmits: u32,
    pub max_retransmit_time: Duration,
    /// Position broadcast rate in Hz.
    pub replication_rate: u32,
    pub min_players: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            ping_interval: Duration::from_secs(1),
            disconnection_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_millis(500),
            max_retransmits: 10,
            max_retransmit_time: Duration::from_secs(10),
            replication_rate: 20,
            min_players: MAX_PLAYERS,
        }
    }
}

impl NetConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ack_timeout: self.ack_timeout,
            max_retransmits: self.max_retransmits,
            max_retransmit_time: self.max_retransmit_time,
        }
    }

    pub fn replication_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.replication_rate.max(1) as f64)
    }
}
