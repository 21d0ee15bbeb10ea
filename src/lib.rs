//! logmesh Library
//!
//! Cluster membership, gossip over HTTP and incremental replication for
//! logmesh nodes. Exposed as a library for the binary and integration tests.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod cluster;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use cluster::{
    ClusterConfig, ClusterError, ClusterJoinTarget, ClusterManager, GossipMessage, NodeId, PeerEndpoint, StorageKind,
    StorageSet, WatermarkStore,
};
pub use config::load_config;
pub use domain::ports::{BuildCacheInvalidator, StreamableStorage};
pub use infrastructure::ShutdownController;
