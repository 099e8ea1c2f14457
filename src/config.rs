//! Configuration options for a `RaftNode`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's identity. Must be unique and stable across restarts.
    pub node_id: String,
    /// Identities of all other voting members (excludes `node_id`).
    pub peers: Vec<String>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Upper bound on entries per AppendEntries batch.
    pub max_batch_entries: usize,
    /// Opaque location used by the `Persistence` port; not interpreted by
    /// the node itself.
    pub persistence_path: String,
}

impl NodeConfig {
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            max_batch_entries: 64,
            persistence_path: "raft_state.bin".to_string(),
        }
    }
}
