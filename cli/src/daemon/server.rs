// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Governance API server
//!
//! Serves the control-plane API, publishes the audit stream on the
//! configured Unix socket and exposes Prometheus metrics when enabled.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

use bulwark_core::application::GovernanceServices;
use bulwark_core::domain::governance_config::GovernanceConfigManifest;
use bulwark_core::infrastructure::stream_socket::StreamSocketServer;
use bulwark_core::presentation::router;

use super::shutdown_token;

pub async fn start_server(manifest: GovernanceConfigManifest, host: Option<String>, port: Option<u16>) -> Result<()> {
    manifest
        .validate()
        .context("Configuration validation failed")?;

    let spec = &manifest.spec;
    if let Some(metrics_port) = spec.observability.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start Prometheus exporter")?;
        info!("Prometheus metrics on {}", addr);
    }

    let services = GovernanceServices::from_manifest(&manifest)
        .await
        .context("Failed to initialize governance services")?;
    info!(
        node = %manifest.metadata.name,
        enforcing = services.enforcing,
        policies = services.engine.policy_count(),
        "Governance services ready"
    );
    if !services.enforcing {
        warn!("Running in permissive mode: audit failures will not block actions");
    }

    let shutdown = shutdown_token();

    let socket_task = match &spec.audit.stream_socket {
        Some(path) => {
            let server = StreamSocketServer::bind(path, services.event_bus.clone())
                .with_context(|| format!("Failed to bind audit stream socket {}", path.display()))?;
            info!("Audit stream socket at {}", path.display());
            Some(tokio::spawn(server.run(shutdown.clone())))
        }
        None => None,
    };

    let app = router(services);
    let addr = format!(
        "{}:{}",
        host.unwrap_or_else(|| spec.server.host.clone()),
        port.unwrap_or(spec.server.port)
    );
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Governance API listening on {}", addr);

    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    if let Some(task) = socket_task {
        if let Err(e) = task.await {
            warn!("Stream socket task ended abnormally: {}", e);
        }
    }

    info!("Governance server shut down");
    Ok(())
}
