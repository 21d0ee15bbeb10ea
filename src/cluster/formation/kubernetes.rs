use super::{authority, retry_with_jitter, ClusterFormationStrategy, RetryPolicy};
use crate::cluster::types::{ClusterJoinTarget, PeerEndpoint};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Deserialize)]
pub struct EndpointSliceList {
    #[serde(default)]
    pub items: Vec<EndpointSlice>,
}

#[derive(Debug, Deserialize)]
pub struct EndpointSlice {
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPort {
    pub name: Option<String>,
    pub port: Option<u16>,
    pub app_protocol: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub conditions: EndpointConditions,
    pub target_ref: Option<TargetRef>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EndpointConditions {
    pub ready: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TargetRef {
    pub name: String,
}

/// Peer endpoints from EndpointSlices, skipping self and endpoints not ready.
pub fn targets_from_slices(
    slices: &EndpointSliceList,
    node_id: &str,
    port_name: &str,
) -> anyhow::Result<Vec<ClusterJoinTarget>> {
    let mut targets = Vec::new();

    for slice in &slices.items {
        let (port, app_protocol) = slice
            .ports
            .iter()
            .find_map(|p| match (&p.name, p.port) {
                (Some(name), Some(port)) if name == port_name => Some((port, p.app_protocol.as_deref())),
                _ => None,
            })
            .ok_or_else(|| anyhow::anyhow!("no port named {}", port_name))?;

        let scheme = match app_protocol {
            None | Some("http") => "http",
            Some("https") => "https",
            Some(other) => anyhow::bail!("unsupported protocol {} for port {}", other, port_name),
        };

        for endpoint in &slice.endpoints {
            if endpoint.conditions.ready == Some(false) {
                continue;
            }
            let Some(target) = &endpoint.target_ref else {
                continue;
            };
            if target.name == node_id {
                continue;
            }

            for address in &endpoint.addresses {
                let url = Url::parse(&format!("{}://{}", scheme, authority(address, port)))
                    .with_context(|| format!("invalid endpoint address {}", address))?;
                targets.push(ClusterJoinTarget::new(target.name.as_str(), url));
            }
        }
    }

    Ok(targets)
}

/// Discovery through the EndpointSlices of a headless service.
pub struct KubernetesStrategy {
    node_id: String,
    namespace: String,
    service: String,
    port_name: String,
    api_url: Url,
    token: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl KubernetesStrategy {
    /// Configure from the pod's service account.
    pub fn in_cluster(node_id: &str, namespace: &str, service: &str, port_name: &str) -> anyhow::Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").context("KUBERNETES_SERVICE_HOST is not set")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").context("KUBERNETES_SERVICE_PORT is not set")?;
        let port: u16 = port.parse().context("invalid KUBERNETES_SERVICE_PORT")?;
        let api_url = Url::parse(&format!("https://{}", authority(&host, port)))?;

        let token = std::fs::read_to_string(format!("{}/token", SERVICE_ACCOUNT_DIR))
            .context("failed to read service account token")?;
        let ca = std::fs::read(format!("{}/ca.crt", SERVICE_ACCOUNT_DIR)).context("failed to read service account CA")?;

        let client = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca)?)
            .build()?;

        Ok(Self::with_api(node_id, namespace, service, port_name, api_url, token.trim(), client))
    }

    pub fn with_api(
        node_id: &str,
        namespace: &str,
        service: &str,
        port_name: &str,
        api_url: Url,
        token: &str,
        client: reqwest::Client,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            namespace: namespace.to_string(),
            service: service.to_string(),
            port_name: port_name.to_string(),
            api_url,
            token: token.to_string(),
            client,
            retry: RetryPolicy::new(5, Duration::from_secs(5)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn list_peers(&self) -> anyhow::Result<Vec<ClusterJoinTarget>> {
        let mut url = self.api_url.join(&format!(
            "/apis/discovery.k8s.io/v1/namespaces/{}/endpointslices",
            self.namespace
        ))?;
        url.query_pairs_mut()
            .append_pair("labelSelector", &format!("kubernetes.io/service-name={}", self.service));

        let slices: EndpointSliceList = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if slices.items.is_empty() {
            anyhow::bail!("no endpoints found for service {} in namespace {}", self.service, self.namespace);
        }

        let targets = targets_from_slices(&slices, &self.node_id, &self.port_name)?;
        if targets.is_empty() {
            anyhow::bail!(
                "no valid endpoint found for service {} in namespace {}",
                self.service,
                self.namespace
            );
        }
        Ok(targets)
    }
}

#[async_trait]
impl ClusterFormationStrategy for KubernetesStrategy {
    async fn join(&self, _local: &PeerEndpoint) -> anyhow::Result<Vec<ClusterJoinTarget>> {
        tracing::info!("discovering nodes from kubernetes service {}/{}", self.namespace, self.service);
        match retry_with_jitter(self.retry, "kubernetes discovery", || self.list_peers()).await {
            Ok(targets) => Ok(targets),
            Err(e) => {
                tracing::warn!("failed to get join nodes from kubernetes: {:#}", e);
                Ok(Vec::new())
            }
        }
    }

    async fn leave(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
