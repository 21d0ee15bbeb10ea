//! Cluster Manager
//!
//! Owns the gossip engine for one node, wires the transport, the delegate and
//! the sync pool together, serves join requests from formation strategies and
//! performs the orderly leave.

use crate::cluster::broadcast::GossipMessage;
use crate::cluster::config::ClusterConfig;
use crate::cluster::delegate::ClusterDelegate;
use crate::cluster::directory::PeerDirectory;
use crate::cluster::gossip::{GossipEngine, Member};
use crate::cluster::http::{cluster_router, ClusterRoutes};
use crate::cluster::sync::{StorageSet, SyncPool};
use crate::cluster::transport::HttpTransport;
use crate::cluster::types::{ClusterError, ClusterJoinTarget, NodeId, PeerEndpoint};
use crate::cluster::watermark::WatermarkStore;
use crate::domain::ports::BuildCacheInvalidator;
use crate::infrastructure::ShutdownController;
use axum::Router;
use parking_lot::RwLock;
use reqwest::Url;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

const JOIN_MAILBOX_SIZE: usize = 16;

/// Lifecycle of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Initializing,
    Running,
    Leaving,
    Stopped,
}

pub struct ClusterManager {
    config: ClusterConfig,
    local: PeerEndpoint,
    state: RwLock<ManagerState>,
    directory: Arc<PeerDirectory>,
    transport: Arc<HttpTransport>,
    delegate: Arc<ClusterDelegate>,
    pool: Arc<SyncPool>,
    engine: Arc<GossipEngine>,
    storages: StorageSet,
    cache: Arc<dyn BuildCacheInvalidator>,
    join_tx: mpsc::Sender<ClusterJoinTarget>,
    mailbox: ShutdownController,
}

impl ClusterManager {
    /// Build every component and start the gossip engine.
    pub fn start(
        config: ClusterConfig,
        local_endpoint: Url,
        storages: StorageSet,
        watermarks: Arc<WatermarkStore>,
        cache: Arc<dyn BuildCacheInvalidator>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let local_id = NodeId::new(&config.node_id);
        tracing::info!("starting cluster node {} at {}", local_id, local_endpoint);

        let directory = Arc::new(PeerDirectory::new());
        let mut transport = HttpTransport::new(&config, local_endpoint.clone(), directory.clone())?;
        let packet_rx = transport
            .take_packet_rx()
            .ok_or_else(|| anyhow::anyhow!("packet receiver already taken"))?;
        let stream_rx = transport
            .take_stream_rx()
            .ok_or_else(|| anyhow::anyhow!("stream receiver already taken"))?;

        let pool = Arc::new(SyncPool::new(
            local_id.clone(),
            config.cookie.clone(),
            directory.clone(),
            transport.connector().clone(),
            storages.clone(),
            watermarks.clone(),
            config.stream_timeout,
        ));
        let transport = Arc::new(transport);

        let delegate = Arc::new(ClusterDelegate::new(
            local_id.clone(),
            local_endpoint.clone(),
            directory.clone(),
            pool.clone(),
            watermarks,
            cache.clone(),
        ));

        let engine = GossipEngine::create(config.clone(), transport.clone(), packet_rx, stream_rx, delegate.clone())?;

        let (join_tx, join_rx) = mpsc::channel(JOIN_MAILBOX_SIZE);
        let manager = Arc::new(Self {
            config,
            local: PeerEndpoint {
                node_id: local_id,
                endpoint: local_endpoint,
            },
            state: RwLock::new(ManagerState::Initializing),
            directory,
            transport,
            delegate,
            pool,
            engine,
            storages,
            cache,
            join_tx,
            mailbox: ShutdownController::new(),
        });

        Self::start_join_mailbox(Arc::downgrade(&manager), manager.mailbox.clone(), join_rx);
        *manager.state.write() = ManagerState::Running;
        Ok(manager)
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_join_mailbox(
        manager: Weak<Self>,
        mailbox: ShutdownController,
        mut join_rx: mpsc::Receiver<ClusterJoinTarget>,
    ) {
        tokio::spawn(async move {
            loop {
                let target = tokio::select! {
                    _ = mailbox.cancelled() => break,
                    target = join_rx.recv() => match target {
                        Some(target) => target,
                        None => break,
                    },
                };

                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.join(target.clone()).await {
                    tracing::warn!("join through {} failed: {:#}", target.node_id, e);
                }
            }
            tracing::debug!("join mailbox stopped");
        });
    }

    pub fn state(&self) -> ManagerState {
        *self.state.read()
    }

    pub fn local(&self) -> &PeerEndpoint {
        &self.local
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn pool(&self) -> &Arc<SyncPool> {
        &self.pool
    }

    pub fn members(&self) -> Vec<Member> {
        self.engine.members()
    }

    pub fn alive_members(&self) -> Vec<Member> {
        self.engine.alive_members()
    }

    /// Sender feeding the background join mailbox.
    pub fn join_sender(&self) -> mpsc::Sender<ClusterJoinTarget> {
        self.join_tx.clone()
    }

    /// Join the cluster through `target`.
    ///
    /// The endpoint is registered in the directory before the engine dials it.
    /// A failed join leaves the manager running.
    pub async fn join(&self, target: ClusterJoinTarget) -> anyhow::Result<()> {
        if self.state() != ManagerState::Running {
            return Err(ClusterError::NotRunning.into());
        }
        if target.node_id == self.local.node_id {
            tracing::debug!("skipping join through self");
            return Ok(());
        }

        tracing::info!("joining cluster through {} at {}", target.node_id, target.endpoint);
        self.directory.upsert(target.node_id.clone(), target.endpoint.clone());

        match self.engine.join(std::slice::from_ref(&target.node_id)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if self.engine.get_member(&target.node_id).is_none() {
                    self.directory.remove(&target.node_id);
                }
                Err(e)
            }
        }
    }

    /// Disseminate `message` and apply it locally.
    pub fn broadcast(&self, message: &GossipMessage) {
        self.engine.queue_user_broadcast(message.encode());
        message.apply(self.cache.as_ref());
    }

    /// Routes served on the management listener.
    pub fn router(&self) -> Router {
        cluster_router(ClusterRoutes {
            transport: self.transport.clone(),
            delegate: self.delegate.clone(),
            storages: self.storages.clone(),
        })
    }

    /// Leave the cluster and stop every background task.
    ///
    /// Every step runs; failures are collected into one error.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        {
            let mut state = self.state.write();
            if *state != ManagerState::Running {
                return Err(ClusterError::NotRunning);
            }
            *state = ManagerState::Leaving;
        }
        tracing::info!("leaving cluster");

        let mut errors = Vec::new();

        self.pool.remove_all();
        if !self.pool.drain(self.config.leave_timeout).await {
            errors.push("sync workers did not finish in time".to_string());
        }

        if let Err(e) = self.engine.leave(self.config.leave_timeout).await {
            errors.push(format!("leave: {:#}", e));
        }

        if let Err(e) = self.engine.shutdown() {
            errors.push(format!("engine shutdown: {:#}", e));
        }

        self.mailbox.shutdown();
        *self.state.write() = ManagerState::Stopped;

        if errors.is_empty() {
            tracing::info!("cluster node {} stopped", self.local.node_id);
            Ok(())
        } else {
            Err(ClusterError::Shutdown(errors))
        }
    }
}
