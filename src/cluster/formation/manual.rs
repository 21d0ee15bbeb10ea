use super::ClusterFormationStrategy;
use crate::cluster::types::{ClusterJoinTarget, PeerEndpoint};
use async_trait::async_trait;
use reqwest::Url;

/// Statically configured join target.
#[derive(Debug, Clone, Default)]
pub struct ManualStrategy {
    join_node_id: Option<String>,
    join_endpoint: Option<Url>,
}

impl ManualStrategy {
    pub fn new(join_node_id: Option<String>, join_endpoint: Option<Url>) -> Self {
        Self {
            join_node_id: join_node_id.filter(|id| !id.is_empty()),
            join_endpoint,
        }
    }
}

#[async_trait]
impl ClusterFormationStrategy for ManualStrategy {
    async fn join(&self, _local: &PeerEndpoint) -> anyhow::Result<Vec<ClusterJoinTarget>> {
        match (&self.join_node_id, &self.join_endpoint) {
            (Some(node_id), Some(endpoint)) => Ok(vec![ClusterJoinTarget::new(node_id.as_str(), endpoint.clone())]),
            _ => Ok(Vec::new()),
        }
    }

    async fn leave(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> PeerEndpoint {
        PeerEndpoint {
            node_id: "node-a".into(),
            endpoint: Url::parse("http://127.0.0.1:9113").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_configured_target() {
        let endpoint = Url::parse("http://10.0.0.2:9113").unwrap();
        let strategy = ManualStrategy::new(Some("node-b".into()), Some(endpoint.clone()));

        let targets = strategy.join(&local()).await.unwrap();
        assert_eq!(targets, vec![ClusterJoinTarget::new("node-b", endpoint)]);
        assert!(strategy.leave().await.is_ok());
    }

    #[tokio::test]
    async fn test_incomplete_config_is_empty() {
        let endpoint = Url::parse("http://10.0.0.2:9113").unwrap();

        assert!(ManualStrategy::new(None, Some(endpoint)).join(&local()).await.unwrap().is_empty());
        assert!(ManualStrategy::new(Some("node-b".into()), None).join(&local()).await.unwrap().is_empty());
        assert!(ManualStrategy::new(Some(String::new()), None).join(&local()).await.unwrap().is_empty());
    }
}
