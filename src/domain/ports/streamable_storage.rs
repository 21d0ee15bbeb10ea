//! Streamable Storage Port
//!
//! Defines the contract a local store must satisfy to be replicated.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A store that can export and import incremental deltas.
///
/// This is an outbound port: the replication layer streams whatever `dump`
/// writes to a peer, and the peer feeds it to its own `load`. Watermarks are
/// opaque to callers and only ever grow.
#[async_trait]
pub trait StreamableStorage: Send + Sync {
    /// Write every change newer than `since` and return the new watermark.
    async fn dump(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        since: u64,
    ) -> anyhow::Result<u64>;

    /// Apply a delta previously produced by `dump` on another node.
    ///
    /// Replaying the same delta twice must leave the store unchanged.
    async fn load(&self, reader: &mut (dyn AsyncRead + Send + Unpin)) -> anyhow::Result<()>;
}
