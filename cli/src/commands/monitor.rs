// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Real-time monitor command
//!
//! Subscribes to the audit stream socket and falls back to polling the
//! control-plane API when the socket is unavailable or drops.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bulwark_core::application::monitor::feed::PollingFeed;
use bulwark_core::application::Monitor;
use bulwark_core::domain::governance_config::GovernanceConfigManifest;
use bulwark_core::infrastructure::notifications::NotificationDispatcher;
use bulwark_core::infrastructure::stream_socket::StreamSocketFeed;
use bulwark_sdk::GovernanceClient;

use crate::daemon::shutdown_token;

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// Audit stream socket (default: spec.audit.stream_socket)
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Poll interval for the HTTP fallback, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub poll_interval: Option<u64>,

    /// Skip the socket and poll the API only
    #[arg(long)]
    pub poll_only: bool,
}

pub async fn run(args: MonitorArgs, manifest: GovernanceConfigManifest, api_url: Option<String>) -> Result<()> {
    let config = &manifest.spec.monitor;
    let notifier = NotificationDispatcher::from_config(&config.sinks, true).context("Invalid monitor sink configuration")?;
    if notifier.is_empty() {
        warn!("No monitor sinks configured; alerts will only be logged");
    } else {
        info!(sinks = ?notifier.sink_names(), "Monitor sinks configured");
    }

    let mut monitor = Monitor::from_config(config, notifier);
    let shutdown = shutdown_token();

    let socket = if args.poll_only {
        None
    } else {
        args.socket.or_else(|| manifest.spec.audit.stream_socket.clone())
    };

    if let Some(path) = socket {
        match StreamSocketFeed::connect(&path).await {
            Ok(mut feed) => {
                info!("Connected to audit stream at {}", path.display());
                if monitor.run(&mut feed, &shutdown).await.is_ok() {
                    return finish(&monitor);
                }
                warn!("Audit stream lost, falling back to HTTP polling");
            }
            Err(e) => warn!("Audit stream socket {} unavailable ({}), using HTTP polling", path.display(), e),
        }
        // Events between the socket dropping and the first poll are not replayed.
        monitor.note_gap(0);
    }

    let api_url = api_url.unwrap_or_else(|| config.api_url.clone());
    let interval = Duration::from_secs(args.poll_interval.unwrap_or(config.poll_interval_seconds).max(1));
    info!(api = %api_url, interval_secs = interval.as_secs(), "Polling audit events");
    poll(&mut monitor, GovernanceClient::new(api_url), interval, &shutdown).await;
    finish(&monitor)
}

async fn poll(monitor: &mut Monitor, client: GovernanceClient, interval: Duration, shutdown: &CancellationToken) {
    let mut feed = PollingFeed::new(client, interval);
    loop {
        match monitor.run(&mut feed, shutdown).await {
            Ok(()) => return,
            Err(e) => {
                warn!("Poll failed: {}; retrying in {}s", e, interval.as_secs());
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
}

fn finish(monitor: &Monitor) -> Result<()> {
    let stats = monitor.stats();
    info!(
        events = stats.events_seen,
        alerts = stats.alerts_raised,
        missed = stats.events_missed,
        "Monitor stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::domain::governance_config::MonitorConfig;

    #[tokio::test]
    async fn test_poll_retries_until_shutdown() {
        let mut monitor = Monitor::from_config(&MonitorConfig::default(), NotificationDispatcher::default());
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        // Nothing listens on the discard port, so every poll fails.
        let client = GovernanceClient::new("http://127.0.0.1:9");
        tokio::time::timeout(
            Duration::from_secs(5),
            poll(&mut monitor, client, Duration::from_secs(1), &shutdown),
        )
        .await
        .unwrap();
        assert_eq!(monitor.stats().events_seen, 0);
    }
}
