//! Broadcast Messages
//!
//! Control messages disseminated through the gossip engine's piggyback queue.
//! Wire format is `[1-byte type][payload]`.

use crate::cluster::types::ClusterError;
use crate::domain::ports::BuildCacheInvalidator;

const INVALIDATE_BUILD_CACHE: u8 = 1;

/// A cluster-wide control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    /// Drop cached pipeline builds; `None` means every pipeline.
    InvalidateBuildCache { pipeline: Option<String> },
}

impl GossipMessage {
    pub fn invalidate_all() -> Self {
        GossipMessage::InvalidateBuildCache { pipeline: None }
    }

    pub fn invalidate(pipeline: impl Into<String>) -> Self {
        let pipeline = pipeline.into();
        GossipMessage::InvalidateBuildCache {
            pipeline: if pipeline.is_empty() { None } else { Some(pipeline) },
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            GossipMessage::InvalidateBuildCache { pipeline } => {
                let name = pipeline.as_deref().unwrap_or("");
                let mut buf = Vec::with_capacity(1 + name.len());
                buf.push(INVALIDATE_BUILD_CACHE);
                buf.extend_from_slice(name.as_bytes());
                buf
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ClusterError> {
        let (tag, payload) = buf
            .split_first()
            .ok_or(ClusterError::InvalidBroadcastMessage)?;

        match *tag {
            INVALIDATE_BUILD_CACHE => {
                let name = std::str::from_utf8(payload)
                    .map_err(|_| ClusterError::InvalidBroadcastMessage)?;
                Ok(GossipMessage::invalidate(name))
            }
            _ => Err(ClusterError::InvalidBroadcastMessage),
        }
    }

    /// Apply the message to local state.
    pub fn apply(&self, cache: &dyn BuildCacheInvalidator) {
        match self {
            GossipMessage::InvalidateBuildCache { pipeline: None } => {
                tracing::debug!("invalidating all pipeline builds");
                cache.invalidate_all();
            }
            GossipMessage::InvalidateBuildCache { pipeline: Some(name) } => {
                tracing::debug!("invalidating pipeline build {}", name);
                cache.invalidate(name);
            }
        }
    }
}

/// Decode a broadcast payload and apply it.
pub fn decode_and_apply(buf: &[u8], cache: &dyn BuildCacheInvalidator) -> Result<(), ClusterError> {
    let msg = GossipMessage::decode(buf)?;
    msg.apply(cache);
    Ok(())
}
