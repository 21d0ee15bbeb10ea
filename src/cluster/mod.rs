//! Cluster Module
//!
//! Membership, gossip transport and incremental replication for a logmesh
//! cluster. Every node serves the same management HTTP listener, and all
//! cluster traffic rides on it.
//!
//! ## Architecture
//!
//! - **Gossip (SWIM)**: membership and failure detection, see [`gossip`]
//! - **Transport**: datagrams as HTTP POSTs, streams as upgraded connections
//! - **Delegate**: keeps the peer directory and sync workers in line with membership
//! - **Sync**: per-peer workers that stream storage deltas and advance watermarks
//! - **Formation**: manual, DNS, Consul and Kubernetes peer discovery
//! - **Manager**: owns the engine and performs the orderly leave
//!
//! ## Usage
//!
//! ```rust,ignore
//! use logmesh::cluster::{ClusterConfig, ClusterManager, StorageSet};
//!
//! let manager = ClusterManager::start(
//!     ClusterConfig::new("logmesh-0").cookie("secret"),
//!     "http://10.0.0.1:9113".parse()?,
//!     StorageSet::new(auth, config, log),
//!     watermarks,
//!     cache,
//! )?;
//! let app = manager.router();
//! manager.join(ClusterJoinTarget::new("logmesh-1", "http://10.0.0.2:9113".parse()?)).await?;
//! ```

pub mod broadcast;
pub mod config;
pub mod delegate;
pub mod directory;
pub mod formation;
pub mod gossip;
pub mod http;
pub mod manager;
pub mod sync;
pub mod transport;
pub mod types;
pub mod watermark;

pub use broadcast::GossipMessage;
pub use config::{ClusterConfig, ConfigError};
pub use delegate::ClusterDelegate;
pub use directory::PeerDirectory;
pub use formation::{build_strategy, discover, ClusterFormationStrategy, FormationConfig};
pub use gossip::{Member, MemberState};
pub use manager::{ClusterManager, ManagerState};
pub use sync::{StorageSet, SyncPool};
pub use transport::HttpTransport;
pub use types::{ClusterError, ClusterJoinTarget, NodeId, NodeState, NodeSyncState, PeerEndpoint, StorageKind};
pub use watermark::WatermarkStore;
