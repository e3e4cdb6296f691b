use rand::Rng;
use std::time::Duration;

use crate::config::NodeConfig;

/// Draw a fresh election timeout from the configured range.
pub fn random_election_timeout(config: &NodeConfig) -> Duration {
    let min_ms = config.election_timeout_min_ms;
    let max_ms = config.election_timeout_max_ms.max(min_ms);
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}
