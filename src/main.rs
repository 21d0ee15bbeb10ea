//! logmesh - clustered log pipeline node
//!
//! This is the composition root that wires together all the components.

use logmesh::adapters::inbound::MgmtServer;
use logmesh::adapters::outbound::{DashMapBuildCache, SqliteKvStorage};
use logmesh::cluster::formation::{build_strategy, discover, ClusterFormationStrategy};
use logmesh::cluster::{ClusterManager, StorageSet, WatermarkStore};
use logmesh::infrastructure::{shutdown_signal, ShutdownController};
use logmesh::load_config;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting logmesh node_id={} mgmt={} formation={}",
        cfg.node_id,
        cfg.mgmt_bind_addr,
        cfg.formation.name()
    );

    // ===== COMPOSITION ROOT =====

    // 1. Local stores
    std::fs::create_dir_all(&cfg.state_dir)?;
    let auth = Arc::new(SqliteKvStorage::open(cfg.state_dir.join("auth.db"))?);
    let config_store = Arc::new(SqliteKvStorage::open(cfg.state_dir.join("config.db"))?);
    let log = Arc::new(SqliteKvStorage::open(cfg.state_dir.join("log.db"))?);
    let watermarks = Arc::new(WatermarkStore::open(cfg.state_dir.join("cluster.db"))?);
    let cache = Arc::new(DashMapBuildCache::new());

    // 2. Management listener, bound first so its address can be advertised
    let listener = TcpListener::bind(&cfg.mgmt_bind_addr).await?;
    let local_endpoint = cfg.local_endpoint(listener.local_addr()?)?;

    // 3. Cluster
    let manager = ClusterManager::start(
        cfg.cluster_config(),
        local_endpoint,
        StorageSet::new(auth, config_store, log),
        watermarks,
        cache,
    )?;

    let server_stop = ShutdownController::new();
    let server = MgmtServer::new(listener, manager.router());
    let server_task = tokio::spawn(server.run(server_stop.clone()));

    // 4. Formation
    let strategy: Arc<dyn ClusterFormationStrategy> = Arc::from(build_strategy(&cfg.formation, &cfg.node_id)?);
    {
        let strategy = strategy.clone();
        let local = manager.local().clone();
        let join_tx = manager.join_sender();
        tokio::spawn(async move {
            for target in discover(strategy.as_ref(), &local).await {
                if join_tx.send(target).await.is_err() {
                    break;
                }
            }
        });
    }

    shutdown_signal(ShutdownController::new()).await;

    // ===== SHUTDOWN =====
    // the listener keeps serving peers until the leave has been gossiped
    if let Err(e) = strategy.leave().await {
        tracing::warn!("formation leave failed: {:#}", e);
    }
    if let Err(e) = manager.shutdown().await {
        tracing::error!("{}", e);
    }
    server_stop.shutdown();

    match tokio::time::timeout(Duration::from_secs(10), server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!("management server failed: {:#}", e),
        Ok(Err(e)) => tracing::error!("management server task panicked: {}", e),
        Err(_) => tracing::warn!("management server did not stop in time"),
    }

    tracing::info!("logmesh stopped");
    Ok(())
}
