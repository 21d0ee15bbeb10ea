//! Management HTTP Server
//!
//! Serves `/health` and the cluster routes on the management listener. Gossip
//! datagrams, upgraded gossip streams and sync requests all arrive here.

use crate::infrastructure::ShutdownController;
use axum::{response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Build the management router around the cluster routes.
pub fn mgmt_router(cluster: Router) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .merge(cluster)
        .layer(TraceLayer::new_for_http())
}

pub struct MgmtServer {
    listener: TcpListener,
    app: Router,
}

impl MgmtServer {
    /// Wrap an already bound listener, so the advertised endpoint can be
    /// derived from its address before the cluster starts.
    pub fn new(listener: TcpListener, cluster: Router) -> Self {
        Self {
            listener,
            app: mgmt_router(cluster),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(self, shutdown: ShutdownController) -> anyhow::Result<()> {
        tracing::info!("management server listening on {}", self.local_addr()?);
        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        tracing::info!("management server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode as HttpStatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_handler() {
        let app = mgmt_router(Router::new());

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), HttpStatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_cluster_routes_are_merged() {
        let cluster = Router::new().route("/cluster/nodes", get(|| async { "nodes" }));
        let app = mgmt_router(cluster);

        let request = Request::builder().uri("/cluster/nodes").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), HttpStatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = mgmt_router(Router::new());

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), HttpStatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = MgmtServer::new(listener, Router::new());
        assert!(server.local_addr().unwrap().port() > 0);

        let shutdown = ShutdownController::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));
        shutdown.shutdown();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
