// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Alerts raised by the real-time monitor and the notifications fanned out
//! to webhook, syslog and e-mail sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::approval::ApprovalRequest;
use crate::domain::audit::{AuditEvent, Severity};

/// A condition detected on the audit stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Uuid,
    pub severity: Severity,
    pub detector: String,
    pub title: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        severity: Severity,
        detector: impl Into<String>,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            alert_id: Uuid::new_v4(),
            severity,
            detector: detector.into(),
            title: title.into(),
            detail: detail.into(),
            agent: None,
            session_id: None,
            trace_id: None,
            event_id: None,
            raised_at: Utc::now(),
        }
    }

    /// Attach the correlation fields of the event that triggered the alert.
    pub fn for_event(mut self, event: &AuditEvent) -> Self {
        self.agent = Some(event.agent.clone());
        self.session_id = Some(event.session_id.clone());
        self.trace_id = event.trace_id.clone();
        self.event_id = Some(event.event_id.to_string());
        self.raised_at = event.timestamp;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalRequested,
    MonitorAlert,
    GovernanceUnavailable,
}

/// Sink-agnostic message. Every sink renders the same notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub severity: Severity,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub fields: Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn approval_requested(request: &ApprovalRequest) -> Self {
        Self {
            kind: NotificationKind::ApprovalRequested,
            severity: Severity::Warning,
            subject: format!(
                "Approval required: {} on {} '{}'",
                request.action_class, request.resource_type, request.resource_name
            ),
            body: request
                .explanation
                .clone()
                .unwrap_or_else(|| format!("{} requested a {} action", request.requested_by, request.action_class)),
            fields: serde_json::json!({
                "approval_id": request.approval_id.to_string(),
                "requested_by": request.requested_by,
                "required_approvals": request.required_approvals,
                "expires_at": request.expires_at.to_rfc3339(),
                "trace_id": request.trace_id,
            }),
            created_at: request.created_at,
        }
    }

    pub fn governance_unavailable(component: &str, detail: &str) -> Self {
        Self {
            kind: NotificationKind::GovernanceUnavailable,
            severity: Severity::Critical,
            subject: format!("Governance unavailable: {}", component),
            body: detail.to_string(),
            fields: serde_json::json!({ "component": component }),
            created_at: Utc::now(),
        }
    }
}

impl From<&Alert> for Notification {
    fn from(alert: &Alert) -> Self {
        Self {
            kind: NotificationKind::MonitorAlert,
            severity: alert.severity,
            subject: format!("[{}] {}", alert.severity, alert.title),
            body: alert.detail.clone(),
            fields: serde_json::to_value(alert).unwrap_or(Value::Null),
            created_at: alert.raised_at,
        }
    }
}
