//! Cluster Formation
//!
//! Strategies that find the first peers to join and register the local node
//! with an external discovery backend.

mod consul;
mod dns;
mod kubernetes;
mod manual;

pub use consul::ConsulStrategy;
pub use dns::DnsStrategy;
pub use kubernetes::KubernetesStrategy;
pub use manual::ManualStrategy;

use crate::cluster::types::{ClusterJoinTarget, PeerEndpoint};
use async_trait::async_trait;
use rand::Rng;
use reqwest::Url;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

/// Discovery backend contract.
#[async_trait]
pub trait ClusterFormationStrategy: Send + Sync {
    /// Register the local node and return the peers to join.
    async fn join(&self, local: &PeerEndpoint) -> anyhow::Result<Vec<ClusterJoinTarget>>;

    /// Deregister the local node.
    async fn leave(&self) -> anyhow::Result<()>;
}

/// Formation settings, one variant per backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormationConfig {
    Manual {
        join_node_id: Option<String>,
        join_endpoint: Option<Url>,
    },
    Consul {
        url: Url,
        service: String,
    },
    Kubernetes {
        namespace: String,
        service: String,
        port_name: String,
    },
    Dns {
        server: SocketAddr,
        domain: String,
        service: String,
    },
}

impl Default for FormationConfig {
    fn default() -> Self {
        FormationConfig::Manual {
            join_node_id: None,
            join_endpoint: None,
        }
    }
}

impl FormationConfig {
    pub fn name(&self) -> &'static str {
        match self {
            FormationConfig::Manual { .. } => "manual",
            FormationConfig::Consul { .. } => "consul",
            FormationConfig::Kubernetes { .. } => "k8s",
            FormationConfig::Dns { .. } => "dns",
        }
    }
}

/// Create the strategy for `config`.
pub fn build_strategy(config: &FormationConfig, node_id: &str) -> anyhow::Result<Box<dyn ClusterFormationStrategy>> {
    let strategy: Box<dyn ClusterFormationStrategy> = match config {
        FormationConfig::Manual {
            join_node_id,
            join_endpoint,
        } => Box::new(ManualStrategy::new(join_node_id.clone(), join_endpoint.clone())),
        FormationConfig::Consul { url, service } => Box::new(ConsulStrategy::new(node_id, service, url.clone())),
        FormationConfig::Kubernetes {
            namespace,
            service,
            port_name,
        } => Box::new(KubernetesStrategy::in_cluster(node_id, namespace, service, port_name)?),
        FormationConfig::Dns {
            server,
            domain,
            service,
        } => Box::new(DnsStrategy::new(node_id, *server, domain, service)),
    };
    Ok(strategy)
}

/// Run a strategy's join, turning failures into "no peers yet".
pub async fn discover(strategy: &dyn ClusterFormationStrategy, local: &PeerEndpoint) -> Vec<ClusterJoinTarget> {
    match strategy.join(local).await {
        Ok(targets) => {
            tracing::info!("formation found {} join targets", targets.len());
            targets
        }
        Err(e) => {
            tracing::warn!("cluster formation failed: {:#}", e);
            Vec::new()
        }
    }
}

/// Fixed delay plus random jitter between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub max_jitter: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            max_jitter: delay / 4,
        }
    }

    fn backoff(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        let jitter = if max == 0 { 0 } else { rand::thread_rng().gen_range(0..=max) };
        self.delay + Duration::from_millis(jitter)
    }
}

/// Retry `op` according to `policy`, returning the last error.
pub async fn retry_with_jitter<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.attempts => return Err(e),
            Err(e) => {
                tracing::warn!("retrying {} (attempt {}): {:#}", what, attempt, e);
                tokio::time::sleep(policy.backoff()).await;
                attempt += 1;
            }
        }
    }
}

/// Join `host` and `port` into a URL authority, bracketing IPv6 literals.
pub(crate) fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
