use super::{retry_with_jitter, ClusterFormationStrategy, RetryPolicy};
use crate::cluster::types::{ClusterJoinTarget, PeerEndpoint};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const ENDPOINT_META: &str = "endpoint";

/// Agent service registration body.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub meta: HashMap<String, String>,
    pub check: ServiceCheck,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceCheck {
    #[serde(rename = "HTTP")]
    pub http: String,
    pub interval: String,
    pub timeout: String,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: CatalogService,
}

#[derive(Debug, Deserialize)]
struct CatalogService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Meta", default)]
    meta: Option<HashMap<String, String>>,
}

/// Discovery through the Consul service catalog.
pub struct ConsulStrategy {
    node_id: String,
    service: String,
    consul_url: Url,
    client: reqwest::Client,
    retry: RetryPolicy,
    registered: AtomicBool,
}

impl ConsulStrategy {
    pub fn new(node_id: &str, service: &str, consul_url: Url) -> Self {
        Self {
            node_id: node_id.to_string(),
            service: service.to_string(),
            consul_url,
            client: reqwest::Client::new(),
            retry: RetryPolicy::new(10, Duration::from_millis(100)),
            registered: AtomicBool::new(false),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Registration advertising the local endpoint, with a health check on it.
    pub fn registration(&self, local: &PeerEndpoint) -> anyhow::Result<ServiceRegistration> {
        let host = local
            .endpoint
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("local endpoint {} has no host", local.endpoint))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = local
            .endpoint
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("local endpoint {} has no port", local.endpoint))?;
        let endpoint = local.endpoint.as_str().trim_end_matches('/').to_string();

        Ok(ServiceRegistration {
            id: self.node_id.clone(),
            name: self.service.clone(),
            address: host,
            port,
            meta: HashMap::from([(ENDPOINT_META.to_string(), endpoint.clone())]),
            check: ServiceCheck {
                http: format!("{}/health", endpoint),
                interval: "5s".to_string(),
                timeout: "1s".to_string(),
            },
        })
    }

    async fn register(&self, registration: &ServiceRegistration) -> anyhow::Result<()> {
        let url = self.consul_url.join("/v1/agent/service/register")?;
        self.client
            .put(url)
            .json(registration)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list_peers(&self) -> anyhow::Result<Vec<ClusterJoinTarget>> {
        let mut url = self.consul_url.join(&format!("/v1/health/service/{}", self.service))?;
        url.query_pairs_mut().append_pair("passing", "true");

        let entries: Vec<HealthEntry> = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let targets: Vec<ClusterJoinTarget> = entries
            .into_iter()
            .filter(|entry| entry.service.id != self.node_id)
            .filter_map(|entry| {
                let endpoint = entry
                    .service
                    .meta
                    .as_ref()
                    .and_then(|meta| meta.get(ENDPOINT_META))
                    .and_then(|raw| Url::parse(raw).ok());
                match endpoint {
                    Some(endpoint) => Some(ClusterJoinTarget::new(entry.service.id, endpoint)),
                    None => {
                        tracing::warn!("consul service {} has no valid endpoint meta", entry.service.id);
                        None
                    }
                }
            })
            .collect();

        if targets.is_empty() {
            anyhow::bail!("no other nodes found in the cluster");
        }
        Ok(targets)
    }
}

#[async_trait]
impl ClusterFormationStrategy for ConsulStrategy {
    async fn join(&self, local: &PeerEndpoint) -> anyhow::Result<Vec<ClusterJoinTarget>> {
        let registration = self.registration(local)?;

        tracing::info!("registering {} with consul service {}", self.node_id, self.service);
        match retry_with_jitter(self.retry, "consul registration", || self.register(&registration)).await {
            Ok(()) => self.registered.store(true, Ordering::SeqCst),
            Err(e) => tracing::warn!("failed to register with consul: {:#}", e),
        }

        match retry_with_jitter(self.retry, "consul discovery", || self.list_peers()).await {
            Ok(targets) => Ok(targets),
            Err(e) => {
                tracing::warn!("failed to get join nodes from consul: {:#}", e);
                Ok(Vec::new())
            }
        }
    }

    async fn leave(&self) -> anyhow::Result<()> {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let url = self
            .consul_url
            .join(&format!("/v1/agent/service/deregister/{}", self.node_id))?;
        self.client.put(url).send().await?.error_for_status()?;
        tracing::info!("deregistered {} from consul", self.node_id);
        Ok(())
    }
}
