//! The HTTP server exposing healthchecks & metrics.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, Router};
use axum::{extract, handler::Handler, AddExtensionLayer};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::get_metrics_recorder;

/// The HTTP server.
pub struct HttpServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl HttpServer {
    /// Construct a new instance.
    pub fn new(config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self { config, shutdown_tx }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = self.run().await {
                tracing::error!(error = ?err, "error from http server, shutting down");
            }
        })
    }

    async fn run(self) -> Result<()> {
        let state = get_metrics_recorder(&self.config).handle();
        let router = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/metrics", get(prom_metrics.layer(AddExtensionLayer::new(state))));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let addr = ([0, 0, 0, 0], self.config.http_port).into();
        let res = axum::Server::bind(&addr)
            .serve(router.into_make_service())
            .with_graceful_shutdown(async move {
                let _res = shutdown_rx.recv().await;
            })
            .await
            .context("error serving http");
        if res.is_err() {
            let _res = self.shutdown_tx.send(());
        }
        res
    }
}

/// Render the metrics of this process in the Prometheus text format.
async fn prom_metrics(extract::Extension(state): extract::Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}
