//! Peer Directory
//!
//! Live `node id -> endpoint` map. Written by membership callbacks and read
//! by the transport and the sync pool from other tasks, so every access goes
//! through the methods below.

use crate::cluster::types::{NodeId, PeerEndpoint};
use parking_lot::RwLock;
use reqwest::Url;
use serde::Serialize;
use std::collections::HashMap;

/// One row of the diagnostic `/cluster/nodes` listing.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NodeEntry {
    #[serde(rename = "node-id")]
    pub node_id: String,
    pub endpoint: String,
}

/// Body of `GET /cluster/nodes`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeList {
    pub nodes: Vec<NodeEntry>,
}

/// Concurrent directory of known peers.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<NodeId, Url>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the endpoint of a peer. Returns the previous endpoint.
    pub fn upsert(&self, node_id: NodeId, endpoint: Url) -> Option<Url> {
        self.peers.write().insert(node_id, endpoint)
    }

    /// Remove a peer. Returns the endpoint it had.
    pub fn remove(&self, node_id: &NodeId) -> Option<Url> {
        self.peers.write().remove(node_id)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Url> {
        self.peers.read().get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.peers.read().contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of all peers, sorted by node id.
    pub fn snapshot(&self) -> Vec<PeerEndpoint> {
        let mut peers: Vec<PeerEndpoint> = self
            .peers
            .read()
            .iter()
            .map(|(node_id, endpoint)| PeerEndpoint {
                node_id: node_id.clone(),
                endpoint: endpoint.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    pub fn node_list(&self) -> NodeList {
        NodeList {
            nodes: self
                .snapshot()
                .into_iter()
                .map(|peer| NodeEntry {
                    node_id: peer.node_id.0,
                    endpoint: peer.endpoint.to_string(),
                })
                .collect(),
        }
    }
}
