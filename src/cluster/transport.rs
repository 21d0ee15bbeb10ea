//! HTTP Transport
//!
//! Gives the gossip engine its two primitives on top of the management HTTP
//! listener:
//!
//! - datagrams: best-effort `POST /cluster/gossip` bodies tagged with an
//!   `Origin` header
//! - streams: the same route with `Upgrade: logmesh`, after which the raw
//!   connection is handed over as a duplex byte stream
//!
//! Request building and response parsing are plain functions so they can be
//! tested without sockets.

use crate::cluster::config::ClusterConfig;
use crate::cluster::directory::PeerDirectory;
use crate::cluster::types::{ClusterError, NodeId};
use bytes::Bytes;
use reqwest::Url;
use rustls::pki_types::ServerName;
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

/// Header carrying the shared cluster secret.
pub const COOKIE_HEADER: &str = "X-Logmesh-ClusterKey";
/// Header carrying the sender's node id on sync requests.
pub const NODE_ID_HEADER: &str = "X-Logmesh-NodeId";
/// Trailer carrying the new watermark at the end of a sync body.
pub const SINCE_TRAILER: &str = "X-Logmesh-Sync-Since";
/// Protocol token exchanged in the `Upgrade` handshake.
pub const UPGRADE_TOKEN: &str = "logmesh";
/// Route shared by datagrams and stream handshakes.
pub const GOSSIP_PATH: &str = "/cluster/gossip";

const MAX_HANDSHAKE_HEADERS: usize = 64;

/// Duplex byte stream handed to the gossip engine.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

pub type BoxedStream = Box<dyn PeerStream>;

/// An inbound datagram.
#[derive(Debug, Clone)]
pub struct Packet {
    pub buf: Bytes,
    pub from: SocketAddr,
    pub timestamp: Instant,
}

// ==================== Sans-IO Functions ====================

/// Parse the socket address advertised by an endpoint URL.
///
/// Only literal IPv4/IPv6 hosts are accepted.
pub fn advertise_addr(endpoint: &Url) -> Result<SocketAddr, ClusterError> {
    let invalid = || ClusterError::InvalidAdvertiseAddress(endpoint.to_string());

    let host = endpoint.host_str().ok_or_else(invalid)?;
    let ip: IpAddr = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| invalid())?;
    let port = endpoint.port_or_known_default().ok_or_else(invalid)?;

    Ok(SocketAddr::new(ip, port))
}

/// Append `path` to the endpoint's own path.
pub fn endpoint_url(endpoint: &Url, path: &str) -> Url {
    let mut url = endpoint.clone();
    let joined = format!(
        "{}/{}",
        endpoint.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url
}

/// `host[:port]` value for a `Host` header.
pub fn host_header(endpoint: &Url) -> String {
    let host = endpoint.host_str().unwrap_or_default();
    match endpoint.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Serialize an endpoint for the `Origin` header (no trailing slash).
pub fn origin_header(endpoint: &Url) -> String {
    endpoint.origin().ascii_serialization()
}

/// Build the raw upgrade request written by the dialer.
pub fn build_upgrade_request(path: &str, host: &str, cookie: Option<&str>) -> String {
    let mut request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: {}\r\nContent-Length: 0\r\n",
        path, host, UPGRADE_TOKEN
    );
    if let Some(cookie) = cookie {
        request.push_str(&format!("{}: {}\r\n", COOKIE_HEADER, cookie));
    }
    request.push_str("\r\n");
    request
}

/// Extract the status code from an HTTP/1.x status line.
pub fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.trim_end().splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Split a header line into a lowercase name and a trimmed value.
pub fn parse_header_line(line: &str) -> Option<(String, String)> {
    let (name, value) = line.trim_end().split_once(':')?;
    Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
}

/// Constant-shape cookie comparison against the configured secret.
pub fn cookie_matches(expected: Option<&str>, received: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => received == Some(expected),
    }
}

// ==================== Connector ====================

/// Opens plain or TLS connections to peer endpoints.
#[derive(Clone)]
pub struct PeerConnector {
    tls: TlsConnector,
}

impl PeerConnector {
    pub fn new(ca_file: Option<&str>, insecure_skip_verify: bool) -> anyhow::Result<Self> {
        let config = tls_client_config(ca_file, insecure_skip_verify)?;
        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Connect to the endpoint, wrapping the socket in TLS for `https`.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn connect(&self, endpoint: &Url) -> anyhow::Result<BoxedStream> {
        let host = endpoint
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("endpoint {} has no host", endpoint))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = endpoint
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("endpoint {} has no port", endpoint))?;

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;

        match endpoint.scheme() {
            "http" => Ok(Box::new(tcp)),
            "https" => {
                let server_name = ServerName::try_from(host)?;
                let tls = self.tls.connect(server_name, tcp).await?;
                Ok(Box::new(tls))
            }
            other => anyhow::bail!("unsupported endpoint scheme {}", other),
        }
    }
}

fn tls_client_config(
    ca_file: Option<&str>,
    insecure_skip_verify: bool,
) -> anyhow::Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?;

    if insecure_skip_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::SkipServerVerification::new(
                rustls::crypto::ring::default_provider(),
            )))
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore::empty();
    if let Some(path) = ca_file {
        let file = File::open(path)?;
        for cert in rustls_pemfile::certs(&mut StdBufReader::new(file)) {
            roots.add(cert?)?;
        }
        tracing::info!("loaded {} cluster CA certificates from {}", roots.len(), path);
    }

    Ok(builder
        .with_root_certificates(roots)
        .with_no_client_auth())
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    #[derive(Debug)]
    pub struct SkipServerVerification(rustls::crypto::CryptoProvider);

    impl SkipServerVerification {
        pub fn new(provider: rustls::crypto::CryptoProvider) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

/// Perform the client side of the upgrade handshake on an open connection.
pub async fn upgrade_handshake(
    mut stream: BoxedStream,
    endpoint: &Url,
    cookie: Option<&str>,
) -> anyhow::Result<BoxedStream> {
    let url = endpoint_url(endpoint, GOSSIP_PATH);
    let request = build_upgrade_request(url.path(), &host_header(endpoint), cookie);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    match parse_status_line(&line) {
        Some(101) => {}
        Some(status) => {
            return Err(ClusterError::Handshake(format!("unexpected status {}", status)).into())
        }
        None => {
            return Err(ClusterError::Handshake(format!("malformed status line {:?}", line.trim_end())).into())
        }
    }

    let mut upgrade = None;
    for _ in 0..MAX_HANDSHAKE_HEADERS {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ClusterError::Handshake("connection closed during handshake".into()).into());
        }
        if line.trim_end().is_empty() {
            return match upgrade {
                Some(token) if token == UPGRADE_TOKEN => Ok(Box::new(reader)),
                Some(token) => Err(ClusterError::Handshake(format!("unexpected upgrade token {:?}", token)).into()),
                None => Err(ClusterError::Handshake("missing upgrade header".into()).into()),
            };
        }
        if let Some((name, value)) = parse_header_line(&line) {
            if name == "upgrade" {
                upgrade = Some(value.to_ascii_lowercase());
            }
        }
    }

    Err(ClusterError::Handshake("too many response headers".into()).into())
}

// ==================== Transport ====================

/// Gossip transport over the management HTTP listener.
pub struct HttpTransport {
    local_endpoint: Url,
    cookie: Option<String>,
    directory: Arc<PeerDirectory>,
    client: reqwest::Client,
    connector: PeerConnector,
    stream_timeout: Duration,
    packet_tx: mpsc::Sender<Packet>,
    packet_rx: Option<mpsc::Receiver<Packet>>,
    stream_tx: mpsc::Sender<BoxedStream>,
    stream_rx: Option<mpsc::Receiver<BoxedStream>>,
}

impl HttpTransport {
    /// Create a transport advertising `local_endpoint`.
    pub fn new(
        config: &ClusterConfig,
        local_endpoint: Url,
        directory: Arc<PeerDirectory>,
    ) -> anyhow::Result<Self> {
        advertise_addr(&local_endpoint)?;

        let (packet_tx, packet_rx) = mpsc::channel(1024);
        let (stream_tx, stream_rx) = mpsc::channel(1024);

        let mut builder = reqwest::Client::builder().timeout(config.stream_timeout);
        if let Some(path) = &config.tls_ca_file {
            let pem = std::fs::read(path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if config.tls_insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            local_endpoint,
            cookie: config.cookie.clone(),
            directory,
            client: builder.build()?,
            connector: PeerConnector::new(
                config.tls_ca_file.as_deref(),
                config.tls_insecure_skip_verify,
            )?,
            stream_timeout: config.stream_timeout,
            packet_tx,
            packet_rx: Some(packet_rx),
            stream_tx,
            stream_rx: Some(stream_rx),
        })
    }

    /// Get the inbound packet receiver (can only be called once).
    pub fn take_packet_rx(&mut self) -> Option<mpsc::Receiver<Packet>> {
        self.packet_rx.take()
    }

    /// Get the accepted stream receiver (can only be called once).
    pub fn take_stream_rx(&mut self) -> Option<mpsc::Receiver<BoxedStream>> {
        self.stream_rx.take()
    }

    pub fn local_endpoint(&self) -> &Url {
        &self.local_endpoint
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn connector(&self) -> &PeerConnector {
        &self.connector
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    pub fn stream_timeout(&self) -> Duration {
        self.stream_timeout
    }

    /// Address other members use to reach this node.
    pub fn final_advertise_addr(&self) -> Result<SocketAddr, ClusterError> {
        advertise_addr(&self.local_endpoint)
    }

    /// Send a datagram to a peer.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn write_to(&self, buf: &[u8], target: &NodeId) -> anyhow::Result<Instant> {
        let endpoint = self
            .directory
            .get(target)
            .ok_or_else(|| ClusterError::PeerUnknown(target.clone()))?;
        let url = endpoint_url(&endpoint, GOSSIP_PATH);

        let mut request = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::ORIGIN, origin_header(&self.local_endpoint))
            .body(buf.to_vec());
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE_HEADER, cookie);
        }

        let response = request.send().await?;
        if response.status() != reqwest::StatusCode::ACCEPTED {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ClusterError::UnexpectedStatus {
                url: url.to_string(),
                status,
                message,
            }
            .into());
        }

        Ok(Instant::now())
    }

    /// Open a stream to a peer through the upgrade handshake.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn dial_timeout(&self, target: &NodeId, timeout: Duration) -> anyhow::Result<BoxedStream> {
        let endpoint = self
            .directory
            .get(target)
            .ok_or_else(|| ClusterError::PeerUnknown(target.clone()))?;

        let dial = async {
            let stream = self.connector.connect(&endpoint).await?;
            upgrade_handshake(stream, &endpoint, self.cookie.as_deref()).await
        };

        match tokio::time::timeout(timeout, dial).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout.into()),
        }
    }

    /// Check the shared secret of an inbound request.
    pub fn authorize(&self, received: Option<&str>) -> bool {
        cookie_matches(self.cookie.as_deref(), received)
    }

    /// Parse the `Origin` of an inbound datagram.
    pub fn parse_origin(origin: Option<&str>) -> Result<SocketAddr, ClusterError> {
        let origin = origin.ok_or_else(|| ClusterError::InvalidAdvertiseAddress("missing Origin".into()))?;
        let url = Url::parse(origin)
            .map_err(|_| ClusterError::InvalidAdvertiseAddress(origin.to_string()))?;
        advertise_addr(&url)
    }

    /// Queue an inbound datagram for the gossip engine.
    pub async fn publish_packet(&self, buf: Bytes, from: SocketAddr) -> anyhow::Result<()> {
        let packet = Packet {
            buf,
            from,
            timestamp: Instant::now(),
        };
        self.packet_tx
            .send(packet)
            .await
            .map_err(|_| anyhow::anyhow!("packet queue closed"))
    }

    /// Queue an accepted stream for the gossip engine.
    pub async fn publish_stream(&self, stream: BoxedStream) -> anyhow::Result<()> {
        self.stream_tx
            .send(stream)
            .await
            .map_err(|_| anyhow::anyhow!("stream queue closed"))
    }
}
