// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Real-Time Monitor - long-lived subscriber on the audit stream
//!
//! Purely observational: it never takes part in allow/deny decisions.
//! Every event is handed to each detector in turn; resulting alerts are
//! logged, counted and fanned out to the configured sinks without waiting
//! on delivery. A lagging feed resets detectors that need to see every
//! event (the chain checkpoint) instead of raising false alarms.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Feeds:** [`feed::BusFeed`], `StreamSocketFeed`, [`feed::PollingFeed`]

pub mod detectors;
pub mod feed;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::alert::{Alert, Notification};
use crate::domain::audit::{AuditEvent, Severity};
use crate::domain::governance_config::MonitorConfig;
use crate::infrastructure::notifications::NotificationDispatcher;

use detectors::{standard_detectors, Detector};
use feed::{EventFeed, FeedError, FeedItem};

/// Counters exposed for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub events_seen: u64,
    pub alerts_raised: u64,
    pub events_missed: u64,
}

pub struct Monitor {
    detectors: Vec<Box<dyn Detector>>,
    notifier: NotificationDispatcher,
    stats: MonitorStats,
}

impl Monitor {
    pub fn new(detectors: Vec<Box<dyn Detector>>, notifier: NotificationDispatcher) -> Self {
        Self {
            detectors,
            notifier,
            stats: MonitorStats::default(),
        }
    }

    pub fn from_config(config: &MonitorConfig, notifier: NotificationDispatcher) -> Self {
        Self::new(standard_detectors(config), notifier)
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Handle one feed item and dispatch any alerts it produced.
    pub fn process(&mut self, item: FeedItem) -> Vec<Alert> {
        match item {
            FeedItem::Event(event) => self.observe(&event),
            FeedItem::Lagged(missed) => {
                self.note_gap(missed);
                vec![]
            }
        }
    }

    fn observe(&mut self, event: &AuditEvent) -> Vec<Alert> {
        self.stats.events_seen += 1;
        let alerts: Vec<Alert> = self
            .detectors
            .iter_mut()
            .flat_map(|detector| detector.observe(event))
            .collect();
        for alert in &alerts {
            self.dispatch(alert);
        }
        alerts
    }

    /// Events were missed, or the feed was switched.
    pub fn note_gap(&mut self, missed: u64) {
        warn!(missed, "Monitor feed lagged, resetting stream checkpoints");
        self.stats.events_missed += missed;
        for detector in &mut self.detectors {
            detector.on_gap(missed);
        }
    }

    fn dispatch(&mut self, alert: &Alert) {
        self.stats.alerts_raised += 1;
        metrics::counter!("bulwark_monitor_alerts_total", "severity" => alert.severity.to_string()).increment(1);
        match alert.severity {
            Severity::Critical => error!(
                detector = %alert.detector,
                agent = ?alert.agent,
                trace_id = ?alert.trace_id,
                "{}: {}", alert.title, alert.detail
            ),
            Severity::Warning => warn!(
                detector = %alert.detector,
                agent = ?alert.agent,
                "{}: {}", alert.title, alert.detail
            ),
            Severity::Info => info!(detector = %alert.detector, "{}: {}", alert.title, alert.detail),
        }
        self.notifier.notify(Notification::from(alert));
    }

    /// Consume `feed` until shutdown. A feed error is returned so the
    /// caller can fall back to another feed.
    pub async fn run(&mut self, feed: &mut dyn EventFeed, shutdown: &CancellationToken) -> Result<(), FeedError> {
        info!(
            feed = feed.name(),
            detectors = ?self.detector_names(),
            "Starting real-time monitor"
        );

        loop {
            tokio::select! {
                item = feed.next() => match item {
                    Ok(item) => {
                        self.process(item);
                    }
                    Err(e) => {
                        warn!(feed = feed.name(), error = %e, "Monitor feed failed");
                        return Err(e);
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping real-time monitor");
                    break;
                }
            }
        }

        debug!(stats = ?self.stats, "Real-time monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::audit_store::HashChainedAuditStore;
    use crate::domain::audit::{EventPayload, NewAuditEvent};
    use crate::domain::clock::SystemClock;
    use crate::domain::policy::ActionClass;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::repositories::InMemoryAuditRepository;
    use feed::BusFeed;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn destructive_call(trace: &str) -> NewAuditEvent {
        NewAuditEvent::new(
            "session-9",
            "k8s-agent",
            EventPayload::ToolCall {
                tool_name: "kubectl.delete".into(),
                params: json!({"namespace": "payments"}),
                result: None,
                duration_ms: 30,
                success: true,
            },
        )
        .with_trace(trace)
        .with_action_class(ActionClass::Destructive)
    }

    #[tokio::test]
    async fn test_monitor_sees_appends_through_bus() {
        let bus = EventBus::new(64);
        let store = HashChainedAuditStore::new(
            Arc::new(InMemoryAuditRepository::new()),
            bus.clone(),
            Arc::new(SystemClock),
            1000,
        );
        let mut feed = BusFeed::new(&bus);
        let mut monitor = Monitor::from_config(&MonitorConfig::default(), NotificationDispatcher::default());

        store.append(destructive_call("trace-x")).await.unwrap();
        let item = feed.next().await.unwrap();
        let alerts = monitor.process(item);

        assert!(alerts.iter().any(|a| a.title == "Unauthorized destructive tool call"));
        assert_eq!(monitor.stats().events_seen, 1);
        assert!(monitor.stats().alerts_raised >= 1);
    }

    #[tokio::test]
    async fn test_lag_does_not_raise_tamper_alert() {
        let bus = EventBus::new(2);
        let store = HashChainedAuditStore::new(
            Arc::new(InMemoryAuditRepository::new()),
            bus.clone(),
            Arc::new(SystemClock),
            1000,
        );
        let mut feed = BusFeed::new(&bus);
        let mut monitor = Monitor::new(
            vec![Box::new(detectors::ChainContinuityDetector::default())],
            NotificationDispatcher::default(),
        );

        store.append(destructive_call("t")).await.unwrap();
        let first = feed.next().await.unwrap();
        assert!(monitor.process(first).is_empty());

        for _ in 0..5 {
            store.append(destructive_call("t")).await.unwrap();
        }
        let mut alerts = Vec::new();
        for _ in 0..3 {
            alerts.extend(monitor.process(feed.next().await.unwrap()));
        }
        assert!(alerts.is_empty());
        assert_eq!(monitor.stats().events_missed, 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let bus = EventBus::new(8);
        let mut feed = BusFeed::new(&bus);
        let mut monitor = Monitor::from_config(&MonitorConfig::default(), NotificationDispatcher::default());
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        monitor.run(&mut feed, &shutdown).await.unwrap();
    }
}
