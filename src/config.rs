use crate::cluster::{ClusterConfig, ConfigError, FormationConfig};
use anyhow::Context;
use reqwest::Url;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Node identity
    pub node_id: String,
    pub cookie: Option<String>,

    // Management listener
    pub mgmt_bind_addr: String,
    pub advertise_endpoint: Option<Url>,

    // Local state (replicated stores and watermarks)
    pub state_dir: PathBuf,

    // Cluster formation
    pub formation: FormationConfig,

    // Gossip timing
    pub push_pull_interval_ms: u64,
    pub probe_interval_ms: u64,

    // TLS towards https peers
    pub tls_ca_file: Option<String>,
    pub tls_insecure_skip_verify: bool,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            cookie: None,
            mgmt_bind_addr: "0.0.0.0:9113".to_string(),
            advertise_endpoint: None,
            state_dir: PathBuf::from("data"),
            formation: FormationConfig::default(),
            push_pull_interval_ms: 1000,
            probe_interval_ms: 1000,
            tls_ca_file: None,
            tls_insecure_skip_verify: false,
            debug: false,
        }
    }
}

impl Config {
    /// Cluster settings derived from this configuration.
    pub fn cluster_config(&self) -> ClusterConfig {
        let probe_interval = Duration::from_millis(self.probe_interval_ms);
        let mut cluster = ClusterConfig::new(&self.node_id)
            .push_pull_interval(Duration::from_millis(self.push_pull_interval_ms))
            .probe(probe_interval, probe_interval / 2)
            .tls(self.tls_ca_file.clone(), self.tls_insecure_skip_verify);
        if let Some(cookie) = &self.cookie {
            cluster = cluster.cookie(cookie.clone());
        }
        cluster
    }

    /// Endpoint advertised to peers: the configured one, or the bound address.
    pub fn local_endpoint(&self, bound: SocketAddr) -> anyhow::Result<Url> {
        if let Some(endpoint) = &self.advertise_endpoint {
            return Ok(endpoint.clone());
        }
        if bound.ip().is_unspecified() {
            anyhow::bail!(
                "LOGMESH_ADVERTISE_ENDPOINT is required when listening on {}",
                bound
            );
        }
        parse_url("bound address", &format!("http://{}", bound))
    }
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_url(name: &str, value: &str) -> anyhow::Result<Url> {
    Url::parse(value).with_context(|| format!("{} is not a valid URL: {}", name, value))
}

fn formation_from<F>(var: &F) -> anyhow::Result<FormationConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let strategy = non_empty(var("LOGMESH_FORMATION")).unwrap_or_else(|| "manual".to_string());

    let formation = match strategy.as_str() {
        "manual" => FormationConfig::Manual {
            join_node_id: non_empty(var("LOGMESH_JOIN_NODE_ID")),
            join_endpoint: non_empty(var("LOGMESH_JOIN_ENDPOINT"))
                .map(|v| parse_url("LOGMESH_JOIN_ENDPOINT", &v))
                .transpose()?,
        },
        "consul" => FormationConfig::Consul {
            url: parse_url(
                "LOGMESH_CONSUL_URL",
                &non_empty(var("LOGMESH_CONSUL_URL")).unwrap_or_else(|| "http://127.0.0.1:8500".to_string()),
            )?,
            service: non_empty(var("LOGMESH_CONSUL_SERVICE")).unwrap_or_else(|| "logmesh".to_string()),
        },
        "k8s" => FormationConfig::Kubernetes {
            namespace: non_empty(var("LOGMESH_K8S_NAMESPACE")).unwrap_or_else(|| "default".to_string()),
            service: non_empty(var("LOGMESH_K8S_SERVICE"))
                .ok_or(ConfigError::MissingFormationSetting("LOGMESH_K8S_SERVICE", "k8s"))?,
            port_name: non_empty(var("LOGMESH_K8S_PORT_NAME")).unwrap_or_else(|| "mgmt".to_string()),
        },
        "dns" => {
            let server = non_empty(var("LOGMESH_DNS_SERVER"))
                .ok_or(ConfigError::MissingFormationSetting("LOGMESH_DNS_SERVER", "dns"))?;
            let server: SocketAddr = server
                .parse()
                .with_context(|| format!("LOGMESH_DNS_SERVER is not a socket address: {}", server))?;
            FormationConfig::Dns {
                server,
                domain: non_empty(var("LOGMESH_DNS_DOMAIN"))
                    .ok_or(ConfigError::MissingFormationSetting("LOGMESH_DNS_DOMAIN", "dns"))?,
                service: non_empty(var("LOGMESH_DNS_SERVICE")).unwrap_or_else(|| "logmesh".to_string()),
            }
        }
        other => return Err(ConfigError::UnknownFormationStrategy(other.to_string()).into()),
    };
    Ok(formation)
}

/// Build the configuration from a variable lookup.
pub fn config_from<F>(var: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let node_id = non_empty(var("LOGMESH_NODE_ID")).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let cookie = non_empty(var("LOGMESH_CLUSTER_KEY"));

    let mgmt_bind_addr = non_empty(var("LOGMESH_MGMT_ADDR")).unwrap_or_else(|| "0.0.0.0:9113".to_string());

    let advertise_endpoint = non_empty(var("LOGMESH_ADVERTISE_ENDPOINT"))
        .map(|v| parse_url("LOGMESH_ADVERTISE_ENDPOINT", &v))
        .transpose()?;

    let state_dir = non_empty(var("LOGMESH_STATE_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"));

    let formation = formation_from(&var)?;

    let push_pull_interval_ms = var("LOGMESH_PUSH_PULL_INTERVAL_MS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);

    let probe_interval_ms = var("LOGMESH_PROBE_INTERVAL_MS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);

    let tls_ca_file = non_empty(var("LOGMESH_TLS_CA_FILE"));
    let tls_insecure_skip_verify = flag(var("LOGMESH_TLS_INSECURE_SKIP_VERIFY"));

    let debug = flag(var("LOGMESH_DEBUG")) || var("DEBUG").is_some();

    Ok(Config {
        node_id,
        cookie,
        mgmt_bind_addr,
        advertise_endpoint,
        state_dir,
        formation,
        push_pull_interval_ms,
        probe_interval_ms,
        tls_ca_file,
        tls_insecure_skip_verify,
        debug,
    })
}

/// Load the configuration from `LOGMESH_*` environment variables.
pub fn load_config() -> anyhow::Result<Config> {
    config_from(|key| std::env::var(key).ok())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        config_from(move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.mgmt_bind_addr, "0.0.0.0:9113");
        assert_eq!(cfg.state_dir, PathBuf::from("data"));
        assert_eq!(cfg.formation, FormationConfig::default());
        assert_eq!(cfg.push_pull_interval_ms, 1000);
        assert!(cfg.cookie.is_none());
        assert!(!cfg.debug);
        // random node id
        assert!(uuid::Uuid::parse_str(&cfg.node_id).is_ok());
    }

    #[test]
    fn test_custom_node() {
        let cfg = load(&[
            ("LOGMESH_NODE_ID", "logmesh-0"),
            ("LOGMESH_CLUSTER_KEY", "s3cret"),
            ("LOGMESH_MGMT_ADDR", "127.0.0.1:9200"),
            ("LOGMESH_ADVERTISE_ENDPOINT", "https://10.0.0.1:9200"),
            ("LOGMESH_PUSH_PULL_INTERVAL_MS", "250"),
            ("LOGMESH_TLS_INSECURE_SKIP_VERIFY", "TRUE"),
            ("LOGMESH_DEBUG", "1"),
        ])
        .unwrap();

        assert_eq!(cfg.node_id, "logmesh-0");
        assert_eq!(cfg.cookie.as_deref(), Some("s3cret"));
        assert_eq!(cfg.mgmt_bind_addr, "127.0.0.1:9200");
        assert_eq!(cfg.advertise_endpoint.unwrap().as_str(), "https://10.0.0.1:9200/");
        assert_eq!(cfg.push_pull_interval_ms, 250);
        assert!(cfg.tls_insecure_skip_verify);
        assert!(cfg.debug);
    }

    #[test]
    fn test_bad_interval_falls_back() {
        let cfg = load(&[("LOGMESH_PROBE_INTERVAL_MS", "soon")]).unwrap();
        assert_eq!(cfg.probe_interval_ms, 1000);
    }

    #[test]
    fn test_manual_formation() {
        let cfg = load(&[
            ("LOGMESH_JOIN_NODE_ID", "logmesh-1"),
            ("LOGMESH_JOIN_ENDPOINT", "http://10.0.0.2:9113"),
        ])
        .unwrap();

        assert_eq!(
            cfg.formation,
            FormationConfig::Manual {
                join_node_id: Some("logmesh-1".to_string()),
                join_endpoint: Some(Url::parse("http://10.0.0.2:9113").unwrap()),
            }
        );
    }

    #[test]
    fn test_consul_formation_defaults() {
        let cfg = load(&[("LOGMESH_FORMATION", "consul")]).unwrap();
        assert_eq!(
            cfg.formation,
            FormationConfig::Consul {
                url: Url::parse("http://127.0.0.1:8500").unwrap(),
                service: "logmesh".to_string(),
            }
        );
    }

    #[test]
    fn test_k8s_requires_service() {
        let err = load(&[("LOGMESH_FORMATION", "k8s")]).unwrap_err();
        assert!(err.to_string().contains("LOGMESH_K8S_SERVICE"));

        let cfg = load(&[("LOGMESH_FORMATION", "k8s"), ("LOGMESH_K8S_SERVICE", "logmesh-headless")]).unwrap();
        assert_eq!(cfg.formation.name(), "k8s");
    }

    #[test]
    fn test_dns_formation() {
        let cfg = load(&[
            ("LOGMESH_FORMATION", "dns"),
            ("LOGMESH_DNS_SERVER", "10.0.0.53:53"),
            ("LOGMESH_DNS_DOMAIN", "mesh.internal"),
        ])
        .unwrap();

        assert_eq!(
            cfg.formation,
            FormationConfig::Dns {
                server: "10.0.0.53:53".parse().unwrap(),
                domain: "mesh.internal".to_string(),
                service: "logmesh".to_string(),
            }
        );
        assert!(load(&[("LOGMESH_FORMATION", "dns"), ("LOGMESH_DNS_DOMAIN", "x")]).is_err());
    }

    #[test]
    fn test_unknown_formation() {
        let err = load(&[("LOGMESH_FORMATION", "etcd")]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownFormationStrategy(name)) if name == "etcd"
        ));
    }

    #[test]
    fn test_invalid_join_endpoint() {
        assert!(load(&[("LOGMESH_JOIN_ENDPOINT", "not a url")]).is_err());
    }

    #[test]
    fn test_local_endpoint() {
        let cfg = load(&[]).unwrap();
        assert_eq!(
            cfg.local_endpoint("127.0.0.1:9113".parse().unwrap()).unwrap().as_str(),
            "http://127.0.0.1:9113/"
        );
        assert!(cfg.local_endpoint("0.0.0.0:9113".parse().unwrap()).is_err());

        let cfg = load(&[("LOGMESH_ADVERTISE_ENDPOINT", "https://10.0.0.1:9113")]).unwrap();
        assert_eq!(
            cfg.local_endpoint("0.0.0.0:9113".parse().unwrap()).unwrap().as_str(),
            "https://10.0.0.1:9113/"
        );
    }

    #[test]
    fn test_cluster_config() {
        let cfg = load(&[
            ("LOGMESH_NODE_ID", "logmesh-0"),
            ("LOGMESH_CLUSTER_KEY", "s3cret"),
            ("LOGMESH_PROBE_INTERVAL_MS", "800"),
        ])
        .unwrap();

        let cluster = cfg.cluster_config();
        assert_eq!(cluster.node_id, "logmesh-0");
        assert_eq!(cluster.cookie.as_deref(), Some("s3cret"));
        assert_eq!(cluster.probe_interval, Duration::from_millis(800));
        assert_eq!(cluster.probe_timeout, Duration::from_millis(400));
        assert!(cluster.validate().is_ok());
    }
}
