//! Cluster Types
//!
//! Core types shared by the membership, transport and replication layers.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of one cluster member, used both for gossip and replication calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub node_id: NodeId,
    pub endpoint: Url,
}

/// A peer resolved by a formation strategy, consumed once by the join path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterJoinTarget {
    pub node_id: NodeId,
    pub endpoint: Url,
}

impl ClusterJoinTarget {
    pub fn new(node_id: impl Into<NodeId>, endpoint: Url) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint,
        }
    }
}

/// The three replicated stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Auth,
    Config,
    Log,
}

impl StorageKind {
    pub const ALL: [StorageKind; 3] = [StorageKind::Auth, StorageKind::Config, StorageKind::Log];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Auth => "auth",
            StorageKind::Config => "config",
            StorageKind::Log => "log",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auth" => Some(StorageKind::Auth),
            "config" => Some(StorageKind::Config),
            "log" => Some(StorageKind::Log),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replication progress for one storage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWatermark {
    pub kind: StorageKind,
    pub value: u64,
}

/// Watermarks of the three stores for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSyncState {
    pub auth: u64,
    pub config: u64,
    pub log: u64,
}

impl NodeSyncState {
    pub fn get(&self, kind: StorageKind) -> u64 {
        match kind {
            StorageKind::Auth => self.auth,
            StorageKind::Config => self.config,
            StorageKind::Log => self.log,
        }
    }

    pub fn set(&mut self, kind: StorageKind, value: u64) {
        match kind {
            StorageKind::Auth => self.auth = value,
            StorageKind::Config => self.config = value,
            StorageKind::Log => self.log = value,
        }
    }

    /// Field-wise maximum of two states.
    pub fn max(&self, other: &NodeSyncState) -> NodeSyncState {
        NodeSyncState {
            auth: self.auth.max(other.auth),
            config: self.config.max(other.config),
            log: self.log.max(other.log),
        }
    }
}

/// Snapshot of the local replication progress towards every known peer.
///
/// Exchanged as user state during push-pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub last_sync: BTreeMap<String, NodeSyncState>,
}

/// Errors raised by the cluster subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("peer {0} is not known")]
    PeerUnknown(NodeId),
    #[error("invalid broadcast message")]
    InvalidBroadcastMessage,
    #[error("invalid node metadata: {0}")]
    InvalidMetadata(String),
    #[error("invalid advertise address: {0}")]
    InvalidAdvertiseAddress(String),
    #[error("unexpected status {status} from {url}: {message}")]
    UnexpectedStatus {
        url: String,
        status: u16,
        message: String,
    },
    #[error("upgrade handshake failed: {0}")]
    Handshake(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    Timeout,
    #[error("cluster is not running")]
    NotRunning,
    #[error("shutdown failed: {}", .0.join("; "))]
    Shutdown(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_kind_roundtrip_names() {
        for kind in StorageKind::ALL {
            assert_eq!(StorageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(StorageKind::parse("metrics"), None);
    }

    #[test]
    fn test_node_sync_state_get_set() {
        let mut state = NodeSyncState::default();
        state.set(StorageKind::Config, 42);
        assert_eq!(state.get(StorageKind::Config), 42);
        assert_eq!(state.get(StorageKind::Auth), 0);
        assert_eq!(state.get(StorageKind::Log), 0);
    }

    #[test]
    fn test_node_sync_state_max() {
        let a = NodeSyncState { auth: 5, config: 1, log: 9 };
        let b = NodeSyncState { auth: 3, config: 7, log: 9 };
        assert_eq!(a.max(&b), NodeSyncState { auth: 5, config: 7, log: 9 });
    }

    #[test]
    fn test_node_state_json_shape() {
        let mut state = NodeState {
            node_id: "node-a".to_string(),
            last_sync: BTreeMap::new(),
        };
        state
            .last_sync
            .insert("node-b".to_string(), NodeSyncState { auth: 1, config: 2, log: 3 });

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["node_id"], "node-a");
        assert_eq!(value["last_sync"]["node-b"]["auth"], 1);
        assert_eq!(value["last_sync"]["node-b"]["config"], 2);
        assert_eq!(value["last_sync"]["node-b"]["log"], 3);
    }

    #[test]
    fn test_shutdown_error_joins_messages() {
        let err = ClusterError::Shutdown(vec!["leave timed out".into(), "engine gone".into()]);
        assert_eq!(err.to_string(), "shutdown failed: leave timed out; engine gone");
    }

    #[test]
    fn test_node_id_display() {
        let id = NodeId::new("pop-sa-1");
        assert_eq!(format!("{}", id), "pop-sa-1");
        assert_eq!(id.as_str(), "pop-sa-1");
    }
}
