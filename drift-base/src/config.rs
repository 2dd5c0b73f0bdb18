// Static, load-once node configuration. Generalizes the `Config { nodes,
// retries, timeout }` record sketched in the txn layer's design notes into
// something an embedder actually loads from disk at startup.

use serde::{Deserialize, Serialize};

use crate::{err, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's own id, as it appears in every Topology's shards.
    pub node_id: i64,
    /// Address this node listens on for inter-node and client traffic.
    pub listen_addr: String,
    /// Number of times a replication write/read should be retried before
    /// the coordinator gives up on a shard and escalates.
    pub retries: u32,
    /// Milliseconds a single attempt waits for a reply before it is
    /// considered timed out.
    pub timeout_millis: u64,
    /// Milliseconds the progress log waits below Committed before it
    /// escalates to recovery or a re-send of the current phase.
    pub progress_deadline_millis: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: 0,
            listen_addr: "127.0.0.1:9000".to_string(),
            retries: 3,
            timeout_millis: 500,
            progress_deadline_millis: 2_000,
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| err(format!("invalid config: {e}")))
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_default_config_round_trips() {
        let cfg = NodeConfig::default();
        let s = toml::to_string(&cfg).expect("serialize");
        let back = NodeConfig::from_toml_str(&s).expect("parse");
        assert_eq!(cfg, back);
    }

    #[test]
    fn test_bad_config_is_an_error() {
        assert!(NodeConfig::from_toml_str("not valid toml {{{").is_err());
    }
}
