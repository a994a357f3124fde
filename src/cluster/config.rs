use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Replicated cluster configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// First role id handed to a follower; must be above the primary's id
    #[serde(default = "default_follower_id_floor")]
    pub follower_id_floor: i64,

    /// How long a follower waits for the primary's log position (0 = forever)
    #[serde(default = "default_primary_wait_timeout")]
    pub primary_wait_timeout_seconds: u64,

    /// Account followers replicate as
    #[serde(default = "default_replication_user")]
    pub replication_user: String,
}

fn default_follower_id_floor() -> i64 {
    10
}

fn default_primary_wait_timeout() -> u64 {
    600
}

fn default_replication_user() -> String {
    "replicator".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            follower_id_floor: default_follower_id_floor(),
            primary_wait_timeout_seconds: default_primary_wait_timeout(),
            replication_user: default_replication_user(),
        }
    }
}

impl ClusterConfig {
    pub fn primary_wait_timeout(&self) -> Option<Duration> {
        match self.primary_wait_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
