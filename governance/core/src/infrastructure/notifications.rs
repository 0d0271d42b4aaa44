// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Notification Sinks
//!
//! Best-effort fan-out of [`Notification`]s to webhook, syslog and e-mail.
//!
//! # Delivery Semantics
//!
//! [`NotificationDispatcher::notify`] returns nothing: each sink runs in its
//! own spawned task and failures are logged, never propagated. The awaited
//! variant [`NotificationDispatcher::notify_and_wait`] exists for callers that
//! must know the report left the process before they continue (the
//! governance-unavailable path), and it still swallows sink errors.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::domain::alert::Notification;
use crate::domain::audit::Severity;
use crate::domain::governance_config::{
    resolve_env_reference, EmailSinkConfig, SinkConfig, SyslogSinkConfig, WebhookSinkConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("HTTP delivery failed: {0}")]
    Http(String),

    #[error("Sink returned status {0}")]
    Status(u16),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sink misconfigured: {0}")]
    Config(String),
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        NotificationError::Http(err.to_string())
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Notifications below this severity are not sent to the sink.
    fn min_severity(&self) -> Severity;

    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// JSON POST of the full notification.
pub struct WebhookSink {
    url: String,
    min_severity: Severity,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(config: &WebhookSinkConfig) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            url: config.url.clone(),
            min_severity: config.min_severity,
            client,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let response = self.client.post(&self.url).json(notification).send().await?;
        if !response.status().is_success() {
            return Err(NotificationError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// RFC 5424 message over UDP.
pub struct SyslogSink {
    address: String,
    app_name: String,
    hostname: String,
    min_severity: Severity,
}

/// `log audit` facility.
const SYSLOG_FACILITY: u8 = 13;

impl SyslogSink {
    pub fn new(config: &SyslogSinkConfig) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "-".to_string());
        Self {
            address: config.address.clone(),
            app_name: config.app_name.clone(),
            hostname,
            min_severity: config.min_severity,
        }
    }

    fn priority(severity: Severity) -> u8 {
        let level = match severity {
            Severity::Critical => 2,
            Severity::Warning => 4,
            Severity::Info => 6,
        };
        SYSLOG_FACILITY * 8 + level
    }

    pub fn format(&self, notification: &Notification) -> String {
        let msg_id = serde_json::to_value(notification.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "<{}>1 {} {} {} {} {} - {}: {}",
            Self::priority(notification.severity),
            notification.created_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            self.hostname,
            self.app_name,
            std::process::id(),
            msg_id,
            notification.subject,
            notification.body.replace('\n', " ")
        )
    }
}

#[async_trait]
impl NotificationSink for SyslogSink {
    fn name(&self) -> &'static str {
        "syslog"
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(self.format(notification).as_bytes(), &self.address).await?;
        Ok(())
    }
}

/// E-mail through an HTTP mail relay accepting `{from, to, subject, text}`.
pub struct EmailSink {
    relay_url: String,
    api_key: Option<String>,
    from: String,
    to: Vec<String>,
    min_severity: Severity,
    client: reqwest::Client,
}

impl EmailSink {
    pub fn new(config: &EmailSinkConfig) -> Result<Self, NotificationError> {
        let api_key = config
            .api_key
            .as_deref()
            .map(resolve_env_reference)
            .transpose()
            .map_err(|e| NotificationError::Config(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            relay_url: config.relay_url.clone(),
            api_key,
            from: config.from.clone(),
            to: config.to.clone(),
            min_severity: config.min_severity,
            client,
        })
    }

    /// Restrict this sink to `CRITICAL` regardless of configuration.
    pub fn critical_only(mut self) -> Self {
        self.min_severity = Severity::Critical;
        self
    }
}

#[async_trait]
impl NotificationSink for EmailSink {
    fn name(&self) -> &'static str {
        "email"
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let text = format!(
            "{}\n\n{}",
            notification.body,
            serde_json::to_string_pretty(&notification.fields).unwrap_or_default()
        );
        let mut request = self.client.post(&self.relay_url).json(&serde_json::json!({
            "from": self.from,
            "to": self.to,
            "subject": notification.subject,
            "text": text,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotificationError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Fans a notification out to every configured sink.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotificationDispatcher {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    /// Build sinks from configuration. `email_critical_only` pins the e-mail
    /// sink to `CRITICAL`, as the monitor requires.
    pub fn from_config(config: &SinkConfig, email_critical_only: bool) -> Result<Self, NotificationError> {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
        if let Some(webhook) = &config.webhook {
            sinks.push(Arc::new(WebhookSink::new(webhook)?));
        }
        if let Some(syslog) = &config.syslog {
            sinks.push(Arc::new(SyslogSink::new(syslog)));
        }
        if let Some(email) = &config.email {
            let sink = EmailSink::new(email)?;
            let sink = if email_critical_only { sink.critical_only() } else { sink };
            sinks.push(Arc::new(sink));
        }
        Ok(Self { sinks })
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    fn eligible(&self, severity: Severity) -> impl Iterator<Item = &Arc<dyn NotificationSink>> + '_ {
        self.sinks.iter().filter(move |s| severity >= s.min_severity())
    }

    /// Fire-and-forget delivery. Never blocks and never fails.
    pub fn notify(&self, notification: Notification) {
        let notification = Arc::new(notification);
        for sink in self.eligible(notification.severity) {
            let sink = sink.clone();
            let notification = notification.clone();
            tokio::spawn(async move {
                deliver(sink.as_ref(), &notification).await;
            });
        }
    }

    /// Deliver to every eligible sink and wait for all attempts to finish.
    /// Returns how many sinks accepted the notification.
    pub async fn notify_and_wait(&self, notification: &Notification) -> usize {
        let attempts = self
            .eligible(notification.severity)
            .map(|sink| deliver(sink.as_ref(), notification));
        futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }
}

async fn deliver(sink: &dyn NotificationSink, notification: &Notification) -> bool {
    match sink.send(notification).await {
        Ok(()) => {
            debug!(sink = sink.name(), subject = %notification.subject, "Notification delivered");
            true
        }
        Err(e) => {
            warn!(sink = sink.name(), subject = %notification.subject, error = %e, "Notification delivery failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alert::Alert;

    fn alert(severity: Severity) -> Notification {
        Notification::from(&Alert::new(severity, "volume", "Event spike", "250 events in the last minute"))
    }

    #[tokio::test]
    async fn test_webhook_delivery() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hooks/governance")
            .match_header("content-type", "application/json")
            .with_status(204)
            .create_async()
            .await;

        let sink = WebhookSink::new(&WebhookSinkConfig {
            url: format!("{}/hooks/governance", server.url()),
            min_severity: Severity::Info,
            timeout_seconds: 5,
        })
        .unwrap();
        let dispatcher = NotificationDispatcher::new(vec![Arc::new(sink)]);

        assert_eq!(dispatcher.notify_and_wait(&alert(Severity::Warning)).await, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_failure_is_swallowed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/hook").with_status(500).create_async().await;

        let sink = WebhookSink::new(&WebhookSinkConfig {
            url: format!("{}/hook", server.url()),
            min_severity: Severity::Info,
            timeout_seconds: 5,
        })
        .unwrap();
        let dispatcher = NotificationDispatcher::new(vec![Arc::new(sink)]);
        assert_eq!(dispatcher.notify_and_wait(&alert(Severity::Critical)).await, 0);
    }

    #[tokio::test]
    async fn test_email_is_critical_only_for_monitor() {
        let config = SinkConfig {
            webhook: None,
            syslog: None,
            email: Some(EmailSinkConfig {
                relay_url: "http://127.0.0.1:9/send".into(),
                api_key: None,
                from: "bulwark@example.com".into(),
                to: vec!["oncall@example.com".into()],
                min_severity: Severity::Info,
            }),
        };
        let dispatcher = NotificationDispatcher::from_config(&config, true).unwrap();
        assert_eq!(dispatcher.eligible(Severity::Warning).count(), 0);
        assert_eq!(dispatcher.eligible(Severity::Critical).count(), 1);

        let relaxed = NotificationDispatcher::from_config(&config, false).unwrap();
        assert_eq!(relaxed.eligible(Severity::Info).count(), 1);
    }

    #[tokio::test]
    async fn test_syslog_datagram() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink = SyslogSink::new(&SyslogSinkConfig {
            address: collector.local_addr().unwrap().to_string(),
            app_name: "bulwark".into(),
            min_severity: Severity::Info,
        });

        sink.send(&alert(Severity::Critical)).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = collector.recv_from(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        // facility 13, severity 2
        assert!(line.starts_with("<106>1 "));
        assert!(line.contains(" bulwark "));
        assert!(line.contains("monitor_alert"));
        assert!(line.contains("Event spike"));
    }
}
