//! Cluster Configuration
//!
//! Tunables for the gossip engine, the HTTP transport and the sync pool.

use std::time::Duration;

/// Configuration for a cluster node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique identifier for this node (e.g., "logmesh-0")
    pub node_id: String,

    /// Shared secret sent with every gossip and sync call (default: none)
    pub cookie: Option<String>,

    /// Interval between failure-detection probes (default: 1s)
    pub probe_interval: Duration,

    /// Time to wait for a direct ack before asking other members (default: 500ms)
    pub probe_timeout: Duration,

    /// Number of members asked to probe indirectly (default: 3)
    pub indirect_checks: usize,

    /// Interval between piggybacked broadcast rounds (default: 200ms)
    pub gossip_interval: Duration,

    /// Number of random members per broadcast round (default: 3)
    pub gossip_nodes: usize,

    /// Multiplier for broadcast retransmissions (default: 4)
    pub retransmit_mult: usize,

    /// Multiplier for the suspicion timeout (default: 4)
    pub suspicion_mult: u32,

    /// Full state exchange interval, also the replication re-trigger (default: 1s)
    pub push_pull_interval: Duration,

    /// How long dead members are remembered before being purged (default: 30s)
    pub dead_node_reclaim: Duration,

    /// Dial timeout for peer streams and sync connections (default: 10s)
    pub stream_timeout: Duration,

    /// Upper bound for the graceful leave broadcast (default: 5s)
    pub leave_timeout: Duration,

    /// PEM bundle used to verify https peers
    pub tls_ca_file: Option<String>,

    /// Accept any certificate from https peers (default: false)
    pub tls_insecure_skip_verify: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            cookie: None,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            retransmit_mult: 4,
            suspicion_mult: 4,
            push_pull_interval: Duration::from_secs(1),
            dead_node_reclaim: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(10),
            leave_timeout: Duration::from_secs(5),
            tls_ca_file: None,
            tls_insecure_skip_verify: false,
        }
    }
}

impl ClusterConfig {
    /// Create a new configuration with node ID.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set the shared secret.
    pub fn cookie(mut self, cookie: impl Into<String>) -> Self {
        let cookie = cookie.into();
        self.cookie = if cookie.is_empty() { None } else { Some(cookie) };
        self
    }

    /// Set the probe interval and timeout.
    pub fn probe(mut self, interval: Duration, timeout: Duration) -> Self {
        self.probe_interval = interval;
        self.probe_timeout = timeout;
        self
    }

    /// Set the broadcast round interval.
    pub fn gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Set the push-pull interval.
    pub fn push_pull_interval(mut self, interval: Duration) -> Self {
        self.push_pull_interval = interval;
        self
    }

    /// Set the leave timeout.
    pub fn leave_timeout(mut self, timeout: Duration) -> Self {
        self.leave_timeout = timeout;
        self
    }

    /// Set the dial timeout.
    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    /// Configure TLS verification for https peers.
    pub fn tls(mut self, ca_file: Option<String>, insecure_skip_verify: bool) -> Self {
        self.tls_ca_file = ca_file;
        self.tls_insecure_skip_verify = insecure_skip_verify;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::MissingNodeId);
        }
        if self.node_id.contains('/') {
            return Err(ConfigError::InvalidNodeId(self.node_id.clone()));
        }
        if self.probe_interval.is_zero()
            || self.gossip_interval.is_zero()
            || self.push_pull_interval.is_zero()
        {
            return Err(ConfigError::ZeroInterval);
        }
        if self.probe_timeout >= self.probe_interval {
            return Err(ConfigError::ProbeTimeoutTooLong);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("node_id is required")]
    MissingNodeId,
    #[error("node_id {0:?} must not contain '/'")]
    InvalidNodeId(String),
    #[error("intervals must be greater than zero")]
    ZeroInterval,
    #[error("probe_timeout must be shorter than probe_interval")]
    ProbeTimeoutTooLong,
    #[error("unknown formation strategy {0:?}")]
    UnknownFormationStrategy(String),
    #[error("{0} is required for the {1} formation strategy")]
    MissingFormationSetting(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(config.node_id.is_empty());
        assert!(config.cookie.is_none());
        assert_eq!(config.push_pull_interval, Duration::from_secs(1));
        assert_eq!(config.leave_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_pattern() {
        let config = ClusterConfig::new("node-a")
            .cookie("s3cret")
            .push_pull_interval(Duration::from_millis(250))
            .probe(Duration::from_millis(400), Duration::from_millis(100));

        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.cookie.as_deref(), Some("s3cret"));
        assert_eq!(config.push_pull_interval, Duration::from_millis(250));
        assert_eq!(config.probe_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_empty_cookie_is_none() {
        let config = ClusterConfig::new("node-a").cookie("");
        assert!(config.cookie.is_none());
    }

    #[test]
    fn test_validate_missing_node_id() {
        let result = ClusterConfig::default().validate();
        assert!(matches!(result, Err(ConfigError::MissingNodeId)));
    }

    #[test]
    fn test_validate_slash_in_node_id() {
        let result = ClusterConfig::new("a/b").validate();
        assert!(matches!(result, Err(ConfigError::InvalidNodeId(_))));
    }

    #[test]
    fn test_validate_probe_timeout() {
        let config = ClusterConfig::new("node-a")
            .probe(Duration::from_millis(100), Duration::from_millis(100));
        assert!(matches!(config.validate(), Err(ConfigError::ProbeTimeoutTooLong)));
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = ClusterConfig::new("node-a").push_pull_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroInterval)));
    }

    #[test]
    fn test_validate_ok() {
        assert!(ClusterConfig::new("node-a").validate().is_ok());
    }
}
