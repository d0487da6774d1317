//! Serves the process metrics in the Prometheus text format.

use std::sync::Arc;

use anchor_watch_common::metrics::render;
use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Binds the exporter to `addr`.
///
/// Binding happens before the process starts its workers so that a taken port is a startup error.
pub(crate) async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics exporter to {addr}"))
}

/// Serves `/metrics` on `listener` until `cancel` fires.
pub(crate) async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "metrics exporter listening");
    }

    let router = Router::new()
        .route("/metrics", get(metrics))
        .with_state(registry);

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
    {
        error!(%e, "metrics exporter failed");
    }

    info!("metrics exporter stopped");
}

async fn metrics(State(registry): State<Arc<Registry>>) -> Response {
    match render(&registry) {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(%e, "could not encode metrics");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
