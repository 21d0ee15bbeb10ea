//! Cluster Delegate
//!
//! Gossip engine callbacks: keeps the peer directory and the sync workers in
//! line with membership, applies broadcasts and exchanges replication
//! progress during push-pull.

use crate::cluster::broadcast::decode_and_apply;
use crate::cluster::directory::PeerDirectory;
use crate::cluster::gossip::{GossipDelegate, Member};
use crate::cluster::sync::SyncPool;
use crate::cluster::types::{ClusterError, NodeId, NodeState, NodeSyncState};
use crate::cluster::watermark::WatermarkStore;
use crate::domain::ports::BuildCacheInvalidator;
use reqwest::Url;
use std::sync::Arc;

/// Parse the endpoint a member advertises in its metadata.
pub fn parse_meta(meta: &[u8]) -> Result<Url, ClusterError> {
    let text = std::str::from_utf8(meta).map_err(|_| ClusterError::InvalidMetadata("not utf-8".into()))?;
    let url = Url::parse(text).map_err(|e| ClusterError::InvalidMetadata(format!("{}: {}", text, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ClusterError::InvalidMetadata(format!("unsupported scheme {}", other))),
    }
}

/// Delegate wiring membership to the directory, the sync pool and the build cache.
pub struct ClusterDelegate {
    local_id: NodeId,
    local_endpoint: Url,
    directory: Arc<PeerDirectory>,
    pool: Arc<SyncPool>,
    watermarks: Arc<WatermarkStore>,
    cache: Arc<dyn BuildCacheInvalidator>,
}

impl ClusterDelegate {
    pub fn new(
        local_id: NodeId,
        local_endpoint: Url,
        directory: Arc<PeerDirectory>,
        pool: Arc<SyncPool>,
        watermarks: Arc<WatermarkStore>,
        cache: Arc<dyn BuildCacheInvalidator>,
    ) -> Self {
        Self {
            local_id,
            local_endpoint,
            directory,
            pool,
            watermarks,
            cache,
        }
    }

    /// Current replication progress towards every known peer.
    pub fn node_state(&self) -> anyhow::Result<NodeState> {
        self.watermarks.node_state(&self.local_id, &self.directory.node_ids())
    }

    fn register(&self, member: &Member) {
        let endpoint = match parse_meta(&member.meta) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::warn!("ignoring member {}: {}", member.name, e);
                return;
            }
        };

        if let Some(previous) = self.pool.register_peer(&member.name, endpoint.clone()) {
            if previous != endpoint {
                tracing::info!("peer {} moved {} -> {}", member.name, previous, endpoint);
            }
        }
    }
}

impl GossipDelegate for ClusterDelegate {
    fn node_meta(&self) -> Vec<u8> {
        self.local_endpoint.as_str().as_bytes().to_vec()
    }

    fn notify_msg(&self, msg: &[u8]) {
        if let Err(e) = decode_and_apply(msg, self.cache.as_ref()) {
            tracing::warn!("dropping broadcast: {}", e);
        }
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        let encoded = self
            .node_state()
            .and_then(|state| serde_json::to_vec(&state).map_err(Into::into));
        match encoded {
            Ok(buf) => buf,
            Err(e) => {
                tracing::error!("failed to build local node state: {:#}", e);
                Vec::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], _join: bool) {
        if buf.is_empty() {
            return;
        }

        let remote: NodeState = match serde_json::from_slice(buf) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("ignoring malformed remote node state: {}", e);
                return;
            }
        };

        let sender = NodeId::new(remote.node_id);
        if !self.directory.contains(&sender) {
            tracing::debug!("node state from unknown peer {}", sender);
            return;
        }

        let local = self.watermarks.get_all(&sender).unwrap_or_else(|e| {
            tracing::warn!("failed to read watermarks for {}: {:#}", sender, e);
            NodeSyncState::default()
        });
        self.pool.trigger(&sender, local);
    }

    fn notify_join(&self, member: &Member) {
        self.register(member);
    }

    fn notify_leave(&self, member: &Member) {
        self.pool.forget_peer(&member.name);
    }

    fn notify_update(&self, member: &Member) {
        self.register(member);
    }
}
