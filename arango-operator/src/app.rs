//! Process lifecycle of the operator.
//!
//! The operator runs two long-lived tasks: the controller watching `ArangoDeployment` records and
//! their pods, and the HTTP server exposing health and metrics. Either a unix signal or a failure
//! of one of the tasks stops both, and the controller stops every deployment loop it launched
//! before the process exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::k8s::Controller;
use crate::server::HttpServer;

pub struct App {
    /// Broadcasts the stop of the process to the controller, the server and all deployments.
    shutdown_tx: broadcast::Sender<()>,
    /// Notices a stop triggered by a failing task.
    shutdown_rx: BroadcastStream<()>,

    server: JoinHandle<()>,
    /// Resolves once all deployment loops launched by the controller have stopped.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Connect to the K8s API and start the controller and the HTTP server.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;
        tracing::debug!(namespace = %config.namespace, "connected to K8s API");

        let server = HttpServer::new(config.clone(), shutdown_tx.clone()).spawn();
        let controller = Controller::new(client, config, shutdown_tx.clone()).spawn();
        Ok(Self {
            shutdown_tx,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            server,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        tokio::select! {
            Some((name, _)) = signals.next() => {
                tracing::info!(signal = name, "signal received, stopping deployments");
                let _ = self.shutdown_tx.send(());
            }
            _ = self.shutdown_rx.next() => tracing::info!("operator task failed, stopping deployments"),
        }

        if let Err(err) = self.controller.await.context("error joining k8s controller").and_then(|res| res) {
            tracing::error!(error = ?err, "error stopping deployment controller");
        }
        if let Err(err) = self.server.await {
            tracing::error!(error = ?err, "error joining http server");
        }
        tracing::info!("ArangoDB operator stopped");
        Ok(())
    }
}
