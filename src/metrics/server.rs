//! Prometheus exporter for a tessera run.
//!
//! Serves `/metrics` and `/health` until the run's shutdown token fires.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{MetricsBindSnafu, MetricsError, PrometheusInitSnafu};

/// Install the Prometheus recorder and serve it on `addr`.
///
/// The listener is bound before returning so a busy port is reported as an
/// error instead of a log line.
pub async fn init(addr: SocketAddr, shutdown: CancellationToken) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    let listener = TcpListener::bind(addr)
        .await
        .context(MetricsBindSnafu { addr })?;
    info!(%addr, "Serving metrics");

    tokio::spawn(run_server(listener, handle, shutdown));
    Ok(())
}

async fn run_server(listener: TcpListener, handle: PrometheusHandle, shutdown: CancellationToken) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle));

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}
