use super::{authority, retry_with_jitter, ClusterFormationStrategy, RetryPolicy};
use crate::cluster::types::{ClusterJoinTarget, PeerEndpoint};
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, SRV};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::Mutex;
use reqwest::Url;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

const RECORD_TTL: u32 = 30;
const MAX_RESPONSE: usize = 4096;

fn fqdn(name: &str) -> anyhow::Result<Name> {
    let name = if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    };
    Ok(Name::from_ascii(name)?)
}

/// Build an RFC 2136 UPDATE for `zone` carrying `records` in the update section.
pub fn update_message(zone: &Name, records: Vec<Record>) -> Message {
    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Update);

    let mut zone_query = Query::new();
    zone_query.set_name(zone.clone());
    zone_query.set_query_type(RecordType::SOA);
    zone_query.set_query_class(DNSClass::IN);
    message.add_query(zone_query);

    for record in records {
        message.add_name_server(record);
    }
    message
}

/// Peers announced in an SRV response. The node id is the first label of the
/// SRV target; addresses come from the additional section when present.
pub fn targets_from_response(response: &Message, local_id: &str, scheme: &str) -> Vec<ClusterJoinTarget> {
    let mut targets = Vec::new();

    for answer in response.answers() {
        let Some(RData::SRV(srv)) = answer.data() else {
            continue;
        };
        let target = srv.target();
        let Some(label) = target.iter().next() else {
            continue;
        };
        let node_id = String::from_utf8_lossy(label).to_string();
        if node_id == local_id {
            continue;
        }

        let address = response
            .additionals()
            .iter()
            .filter(|record| record.name() == target)
            .find_map(|record| match record.data() {
                Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            });
        let host = match address {
            Some(ip) => ip.to_string(),
            None => target.to_ascii().trim_end_matches('.').to_string(),
        };

        match Url::parse(&format!("{}://{}", scheme, authority(&host, srv.port()))) {
            Ok(endpoint) => targets.push(ClusterJoinTarget::new(node_id, endpoint)),
            Err(e) => tracing::warn!("ignoring SRV target {}: {}", target, e),
        }
    }

    targets
}

/// Discovery through SRV records kept up to date with dynamic DNS updates.
pub struct DnsStrategy {
    node_id: String,
    server: SocketAddr,
    domain: String,
    service: String,
    timeout: Duration,
    retry: RetryPolicy,
    registered: Mutex<Option<PeerEndpoint>>,
}

impl DnsStrategy {
    pub fn new(node_id: &str, server: SocketAddr, domain: &str, service: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            server,
            domain: domain.trim_end_matches('.').to_string(),
            service: service.to_string(),
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(5, Duration::from_secs(1)),
            registered: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn zone(&self) -> anyhow::Result<Name> {
        fqdn(&self.domain)
    }

    fn host_name(&self) -> anyhow::Result<Name> {
        fqdn(&format!("{}.{}", self.node_id, self.domain))
    }

    fn service_name(&self) -> anyhow::Result<Name> {
        fqdn(&format!("_{}._tcp.{}", self.service, self.domain))
    }

    /// Address and SRV records announcing `local`.
    pub fn records(&self, local: &PeerEndpoint) -> anyhow::Result<Vec<Record>> {
        let host = local
            .endpoint
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("local endpoint {} has no host", local.endpoint))?
            .trim_start_matches('[')
            .trim_end_matches(']');
        let ip: IpAddr = host
            .parse()
            .map_err(|_| anyhow::anyhow!("dns formation needs an IP endpoint, got {}", host))?;
        let port = local
            .endpoint
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("local endpoint {} has no port", local.endpoint))?;

        let host_name = self.host_name()?;
        let address = match ip {
            IpAddr::V4(v4) => RData::A(A(v4)),
            IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
        };

        Ok(vec![
            Record::from_rdata(host_name.clone(), RECORD_TTL, address),
            Record::from_rdata(self.service_name()?, RECORD_TTL, RData::SRV(SRV::new(0, 0, port, host_name))),
        ])
    }

    /// UPDATE adding the local records.
    pub fn registration_update(&self, local: &PeerEndpoint) -> anyhow::Result<Message> {
        Ok(update_message(&self.zone()?, self.records(local)?))
    }

    /// UPDATE deleting exactly the local records (class NONE, TTL 0).
    pub fn removal_update(&self, local: &PeerEndpoint) -> anyhow::Result<Message> {
        let records = self
            .records(local)?
            .into_iter()
            .map(|mut record| {
                record.set_dns_class(DNSClass::NONE);
                record.set_ttl(0);
                record
            })
            .collect();
        Ok(update_message(&self.zone()?, records))
    }

    /// SRV query for the service.
    pub fn srv_query(&self) -> anyhow::Result<Message> {
        let mut message = Message::new();
        message.set_id(rand::random());
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(self.service_name()?, RecordType::SRV));
        Ok(message)
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn exchange(&self, message: &Message) -> anyhow::Result<Message> {
        let bind: SocketAddr = if self.server.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.send_to(&message.to_bytes()?, self.server).await?;

        let mut buf = vec![0u8; MAX_RESPONSE];
        let (len, _) = tokio::time::timeout(self.timeout, socket.recv_from(&mut buf)).await??;
        let response = Message::from_bytes(&buf[..len])?;

        if response.id() != message.id() {
            anyhow::bail!("dns response id {} does not match request {}", response.id(), message.id());
        }
        if response.response_code() != ResponseCode::NoError {
            anyhow::bail!("dns server answered {}", response.response_code());
        }
        Ok(response)
    }

    async fn register(&self, local: &PeerEndpoint) -> anyhow::Result<()> {
        self.exchange(&self.registration_update(local)?).await?;
        Ok(())
    }

    async fn list_peers(&self, scheme: &str) -> anyhow::Result<Vec<ClusterJoinTarget>> {
        let response = self.exchange(&self.srv_query()?).await?;
        let targets = targets_from_response(&response, &self.node_id, scheme);
        if targets.is_empty() {
            anyhow::bail!("no other nodes found under _{}._tcp.{}", self.service, self.domain);
        }
        Ok(targets)
    }
}

#[async_trait]
impl ClusterFormationStrategy for DnsStrategy {
    async fn join(&self, local: &PeerEndpoint) -> anyhow::Result<Vec<ClusterJoinTarget>> {
        tracing::info!("registering {} in dns zone {}", self.node_id, self.domain);
        match retry_with_jitter(self.retry, "dns registration", || self.register(local)).await {
            Ok(()) => {
                *self.registered.lock() = Some(local.clone());
            }
            Err(e) => tracing::warn!("failed to register in dns: {:#}", e),
        }

        let scheme = local.endpoint.scheme();
        match retry_with_jitter(self.retry, "dns discovery", || self.list_peers(scheme)).await {
            Ok(targets) => Ok(targets),
            Err(e) => {
                tracing::warn!("failed to get join nodes from dns: {:#}", e);
                Ok(Vec::new())
            }
        }
    }

    async fn leave(&self) -> anyhow::Result<()> {
        let registered = self.registered.lock().take();
        let Some(local) = registered else {
            return Ok(());
        };
        self.exchange(&self.removal_update(&local)?).await?;
        tracing::info!("removed {} from dns zone {}", self.node_id, self.domain);
        Ok(())
    }
}
