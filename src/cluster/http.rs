//! Cluster HTTP Routes
//!
//! Handlers mounted on the management listener:
//!
//! - `POST /cluster/gossip`: inbound datagrams, or stream upgrades
//! - `POST /cluster/sync/:kind`: inbound storage deltas
//! - `GET /cluster/nodes`, `GET /cluster/state`: diagnostics

use crate::cluster::delegate::ClusterDelegate;
use crate::cluster::sync::StorageSet;
use crate::cluster::transport::{BoxedStream, HttpTransport, COOKIE_HEADER, GOSSIP_PATH, NODE_ID_HEADER, SINCE_TRAILER, UPGRADE_TOKEN};
use crate::cluster::types::StorageKind;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};

const MAX_PACKET_SIZE: usize = 1024 * 1024;
const LOAD_PIPE_SIZE: usize = 64 * 1024;

/// Shared state of the cluster routes.
#[derive(Clone)]
pub struct ClusterRoutes {
    pub transport: Arc<HttpTransport>,
    pub delegate: Arc<ClusterDelegate>,
    pub storages: StorageSet,
}

/// Build the cluster router.
pub fn cluster_router(state: ClusterRoutes) -> Router {
    Router::new()
        .route("/cluster/nodes", get(nodes_handler))
        .route("/cluster/state", get(state_handler))
        .route(GOSSIP_PATH, post(gossip_handler))
        .route("/cluster/sync/:kind", post(sync_handler))
        .with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn nodes_handler(State(state): State<ClusterRoutes>) -> impl IntoResponse {
    Json(state.transport.directory().node_list())
}

async fn state_handler(State(state): State<ClusterRoutes>) -> Response {
    match state.delegate.node_state() {
        Ok(node_state) => Json(node_state).into_response(),
        Err(e) => {
            tracing::error!("failed to read node state: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn gossip_handler(State(state): State<ClusterRoutes>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();

    if !state.transport.authorize(header_str(&parts.headers, COOKIE_HEADER)) {
        return (StatusCode::UNAUTHORIZED, "invalid cluster key").into_response();
    }

    if parts.headers.contains_key(header::UPGRADE) {
        let Some(on_upgrade) = parts.extensions.remove::<hyper::upgrade::OnUpgrade>() else {
            return (StatusCode::NOT_IMPLEMENTED, "connection upgrade unavailable").into_response();
        };

        let transport = state.transport.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let stream: BoxedStream = Box::new(TokioIo::new(upgraded));
                    if let Err(e) = transport.publish_stream(stream).await {
                        tracing::warn!("dropping accepted stream: {}", e);
                    }
                }
                Err(e) => tracing::warn!("gossip stream upgrade failed: {}", e),
            }
        });

        return (
            StatusCode::SWITCHING_PROTOCOLS,
            [(header::UPGRADE, UPGRADE_TOKEN), (header::CONNECTION, "Upgrade")],
        )
            .into_response();
    }

    let from = match HttpTransport::parse_origin(header_str(&parts.headers, header::ORIGIN.as_str())) {
        Ok(from) => from,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let buf = match axum::body::to_bytes(body, MAX_PACKET_SIZE).await {
        Ok(buf) => buf,
        Err(e) => {
            tracing::warn!("failed to read gossip packet from {}: {}", from, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    if let Err(e) = state.transport.publish_packet(buf, from).await {
        tracing::error!("failed to queue gossip packet: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    StatusCode::ACCEPTED.into_response()
}

/// Copy the request body into the load pipe and return its trailers.
async fn receive_body(mut body: Body, mut writer: DuplexStream) -> anyhow::Result<Option<HeaderMap>> {
    let mut trailers = None;
    while let Some(frame) = body.frame().await {
        match frame?.into_data() {
            Ok(data) => writer.write_all(&data).await?,
            Err(frame) => {
                if let Ok(map) = frame.into_trailers() {
                    trailers = Some(map);
                }
            }
        }
    }
    writer.shutdown().await?;
    Ok(trailers)
}

async fn sync_handler(
    State(state): State<ClusterRoutes>,
    Path(kind): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    if !state.transport.authorize(header_str(&parts.headers, COOKIE_HEADER)) {
        return (StatusCode::UNAUTHORIZED, "invalid cluster key").into_response();
    }

    let Some(kind) = StorageKind::parse(&kind) else {
        return (StatusCode::NOT_FOUND, format!("unknown storage kind {}", kind)).into_response();
    };

    let peer = match header_str(&parts.headers, NODE_ID_HEADER) {
        Some(peer) if !peer.is_empty() => peer.to_string(),
        _ => return (StatusCode::BAD_REQUEST, "missing node id").into_response(),
    };

    let storage = state.storages.get(kind).clone();
    let (writer, mut reader) = tokio::io::duplex(LOAD_PIPE_SIZE);
    let load = async move { storage.load(&mut reader).await };

    let (loaded, received) = tokio::join!(load, receive_body(body, writer));

    if let Err(e) = loaded {
        tracing::warn!("failed to load {} sync from {}: {:#}", kind, peer, e);
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)).into_response();
    }

    let trailers = match received {
        Ok(trailers) => trailers,
        Err(e) => {
            tracing::warn!("incomplete {} sync from {}: {:#}", kind, peer, e);
            return (StatusCode::BAD_REQUEST, format!("failed to read sync body: {:#}", e)).into_response();
        }
    };

    let since = trailers
        .as_ref()
        .and_then(|t| header_str(t, SINCE_TRAILER))
        .map(|v| v.trim().parse::<u64>());
    match since {
        Some(Ok(since)) => {
            tracing::info!("received {} sync from {} up to {}", kind, peer, since);
            StatusCode::OK.into_response()
        }
        Some(Err(_)) => (StatusCode::BAD_REQUEST, "invalid sync trailer").into_response(),
        None => (StatusCode::BAD_REQUEST, "missing sync trailer").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::ClusterConfig;
    use crate::cluster::directory::PeerDirectory;
    use crate::cluster::sync::SyncPool;
    use crate::cluster::transport::{Packet, PeerConnector};
    use crate::cluster::types::NodeId;
    use crate::cluster::watermark::WatermarkStore;
    use crate::domain::ports::{BuildCacheInvalidator, StreamableStorage};
    use async_trait::async_trait;
    use axum::http::{HeaderName, HeaderValue, Request as HttpRequest};
    use bytes::Bytes;
    use http_body_util::StreamBody;
    use hyper::body::Frame;
    use parking_lot::Mutex;
    use reqwest::Url;
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingStorage {
        loaded: Mutex<Vec<u8>>,
        fail_load: bool,
    }

    #[async_trait]
    impl StreamableStorage for RecordingStorage {
        async fn dump(&self, _writer: &mut (dyn AsyncWrite + Send + Unpin), since: u64) -> anyhow::Result<u64> {
            Ok(since)
        }

        async fn load(&self, reader: &mut (dyn AsyncRead + Send + Unpin)) -> anyhow::Result<()> {
            if self.fail_load {
                anyhow::bail!("corrupt record at line 1");
            }
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            self.loaded.lock().extend_from_slice(&buf);
            Ok(())
        }
    }

    struct NoopCache;

    impl BuildCacheInvalidator for NoopCache {
        fn invalidate_all(&self) {}
        fn invalidate(&self, _pipeline: &str) {}
    }

    struct Fixture {
        app: Router,
        packets: mpsc::Receiver<Packet>,
        log: Arc<RecordingStorage>,
    }

    fn fixture_with(cookie: &str, fail_load: bool) -> Fixture {
        let directory = Arc::new(PeerDirectory::new());
        directory.upsert("node-b".into(), Url::parse("http://10.0.0.2:9113").unwrap());
        let config = ClusterConfig::new("node-a").cookie(cookie);
        let endpoint = Url::parse("http://127.0.0.1:9113").unwrap();

        let mut transport = HttpTransport::new(&config, endpoint.clone(), directory.clone()).unwrap();
        let packets = transport.take_packet_rx().unwrap();

        let plain: Arc<dyn StreamableStorage> = Arc::new(RecordingStorage::default());
        let log = Arc::new(RecordingStorage {
            fail_load,
            ..Default::default()
        });
        let storages = StorageSet::new(plain.clone(), plain, log.clone());
        let watermarks = Arc::new(WatermarkStore::open_in_memory().unwrap());
        let pool = Arc::new(SyncPool::new(
            "node-a".into(),
            config.cookie.clone(),
            directory.clone(),
            PeerConnector::new(None, false).unwrap(),
            storages.clone(),
            watermarks.clone(),
            Duration::from_secs(1),
        ));
        let delegate = Arc::new(ClusterDelegate::new(
            NodeId::new("node-a"),
            endpoint,
            directory,
            pool,
            watermarks,
            Arc::new(NoopCache),
        ));

        let app = cluster_router(ClusterRoutes {
            transport: Arc::new(transport),
            delegate,
            storages,
        });
        Fixture { app, packets, log }
    }

    fn fixture() -> Fixture {
        fixture_with("", false)
    }

    fn body_with_trailer(data: &'static [u8], since: Option<&'static str>) -> Body {
        let mut frames = vec![Ok::<_, std::io::Error>(Frame::data(Bytes::from_static(data)))];
        if let Some(since) = since {
            let mut trailers = HeaderMap::new();
            trailers.insert(
                HeaderName::from_bytes(SINCE_TRAILER.as_bytes()).unwrap(),
                HeaderValue::from_static(since),
            );
            frames.push(Ok(Frame::trailers(trailers)));
        }
        Body::new(StreamBody::new(futures::stream::iter(frames)))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_gossip_packet_is_queued() {
        let mut f = fixture();
        let request = HttpRequest::builder()
            .method("POST")
            .uri(GOSSIP_PATH)
            .header(header::ORIGIN, "http://10.0.0.2:9113")
            .body(Body::from("ping"))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let packet = f.packets.try_recv().unwrap();
        assert_eq!(packet.buf, Bytes::from_static(b"ping"));
        assert_eq!(packet.from, "10.0.0.2:9113".parse().unwrap());
    }

    #[tokio::test]
    async fn test_gossip_bad_origin_is_rejected() {
        for origin in [None, Some("not a url"), Some("http://node-b.local:9113")] {
            let mut f = fixture();
            let mut builder = HttpRequest::builder().method("POST").uri(GOSSIP_PATH);
            if let Some(origin) = origin {
                builder = builder.header(header::ORIGIN, origin);
            }
            let request = builder.body(Body::from("ping")).unwrap();

            let response = f.app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert!(f.packets.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_gossip_requires_cookie() {
        let mut f = fixture_with("s3cret", false);
        let request = HttpRequest::builder()
            .method("POST")
            .uri(GOSSIP_PATH)
            .header(header::ORIGIN, "http://10.0.0.2:9113")
            .header(COOKIE_HEADER, "wrong")
            .body(Body::from("ping"))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(f.packets.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_gossip_upgrade_without_connection_support() {
        let f = fixture();
        let request = HttpRequest::builder()
            .method("POST")
            .uri(GOSSIP_PATH)
            .header(header::UPGRADE, UPGRADE_TOKEN)
            .header(header::CONNECTION, "Upgrade")
            .body(Body::empty())
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_nodes_listing() {
        let f = fixture();
        let request = HttpRequest::builder().uri("/cluster/nodes").body(Body::empty()).unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value["nodes"][0]["node-id"], "node-b");
    }

    #[tokio::test]
    async fn test_state_snapshot() {
        let f = fixture();
        let request = HttpRequest::builder().uri("/cluster/state").body(Body::empty()).unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value["node_id"], "node-a");
        assert_eq!(value["last_sync"]["node-b"]["log"], 0);
    }

    #[tokio::test]
    async fn test_sync_success_loads_body() {
        let f = fixture();
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/cluster/sync/log")
            .header(NODE_ID_HEADER, "node-b")
            .body(body_with_trailer(b"{\"k\":\"v\"}\n", Some("17")))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*f.log.loaded.lock(), b"{\"k\":\"v\"}\n".to_vec());
    }

    #[tokio::test]
    async fn test_sync_unknown_kind() {
        let f = fixture();
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/cluster/sync/metrics")
            .header(NODE_ID_HEADER, "node-b")
            .body(body_with_trailer(b"", Some("1")))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sync_missing_node_id() {
        let f = fixture();
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/cluster/sync/auth")
            .body(body_with_trailer(b"", Some("1")))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sync_requires_cookie() {
        let f = fixture_with("s3cret", false);
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/cluster/sync/auth")
            .header(NODE_ID_HEADER, "node-b")
            .body(body_with_trailer(b"", Some("1")))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_sync_missing_trailer() {
        let f = fixture();
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/cluster/sync/log")
            .header(NODE_ID_HEADER, "node-b")
            .body(body_with_trailer(b"data\n", None))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "missing sync trailer");
    }

    #[tokio::test]
    async fn test_sync_invalid_trailer() {
        let f = fixture();
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/cluster/sync/log")
            .header(NODE_ID_HEADER, "node-b")
            .body(body_with_trailer(b"data\n", Some("soon")))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sync_load_error_is_reported() {
        let f = fixture_with("", true);
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/cluster/sync/log")
            .header(NODE_ID_HEADER, "node-b")
            .body(body_with_trailer(b"data\n", Some("3")))
            .unwrap();

        let response = f.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("corrupt record"));
    }
}
