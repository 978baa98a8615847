//! HTTP introspection server (component J): readiness, metrics, and a pprof
//! stub, each gated behind its own flag. Runs as its own task, independent
//! of the sync driver.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use log::info;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::status::Status;

#[derive(Clone, Copy)]
pub struct HttpConfig {
    pub metrics_enabled: bool,
    pub pprof_enabled: bool,
}

#[derive(Clone)]
struct AppState {
    status: Arc<Status>,
    config: HttpConfig,
}

async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.status.ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    if !state.config.metrics_enabled {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(state.status.render_prometheus())
}

async fn pprof_stub(State(state): State<AppState>) -> StatusCode {
    if !state.config.pprof_enabled {
        return StatusCode::NOT_FOUND;
    }
    // No profiler is wired up in this rewrite; the route exists so
    // operators who enable the flag get a clear signal instead of a 404.
    StatusCode::NOT_IMPLEMENTED
}

fn router(status: Arc<Status>, config: HttpConfig) -> Router {
    let state = AppState { status, config };
    Router::new()
        .route("/", get(readiness))
        .route("/metrics", get(metrics))
        .route("/debug/pprof/*path", get(pprof_stub))
        .with_state(state)
}

/// Binds `addr` and serves until `ct` is cancelled.
pub async fn serve(addr: SocketAddr, status: Arc<Status>, config: HttpConfig, ct: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding http server to {addr}"))?;
    info!("http introspection server listening on {addr}");
    axum::serve(listener, router(status, config))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .context("http server failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn readiness_reflects_status() {
        let status = Arc::new(Status::new(None));
        let app = router(status.clone(), HttpConfig { metrics_enabled: false, pprof_enabled: false });

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        status.mark_ready();
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_route_disabled_by_default() {
        let status = Arc::new(Status::new(None));
        let app = router(status, HttpConfig { metrics_enabled: false, pprof_enabled: false });
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pprof_stub_returns_not_implemented_when_enabled() {
        let status = Arc::new(Status::new(None));
        let app = router(status, HttpConfig { metrics_enabled: false, pprof_enabled: true });
        let response = app
            .oneshot(Request::builder().uri("/debug/pprof/heap").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
