// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Request and response shapes for the control-plane API.
//!
//! Domain types are shared with `bulwark-core`; only the envelopes that
//! exist purely on the wire are defined here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use bulwark_core::application::AppendReceipt;
pub use bulwark_core::domain::approval::{
    ApprovalFilter, ApprovalId, ApprovalRequest, ApprovalStatus, NewApprovalRequest, Resolution,
};
pub use bulwark_core::domain::audit::{AuditEvent, AuditQuery, EventId, EventType, IntegrityReport, NewAuditEvent};
pub use bulwark_core::domain::policy::{ActionClass, Decision, DecisionTrace, Effect};
pub use bulwark_core::presentation::api::{ApprovalCreated, ErrorResponse, EventList};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub enforcing: bool,
    pub policy_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvents {
    pub trace_id: String,
    pub count: usize,
    pub events: Vec<AuditEvent>,
}

/// Hypothetical request for `GET /v1/governance/explain`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplainQuery {
    pub resource_type: String,
    pub resource_name: String,
    pub action: ActionClass,
    pub tags: BTreeMap<String, String>,
    pub user: Option<String>,
    pub role: Option<String>,
    pub rows_affected: Option<u64>,
    pub resources_affected: Option<u64>,
}

impl ExplainQuery {
    pub fn new(resource_type: impl Into<String>, resource_name: impl Into<String>, action: ActionClass) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_name: resource_name.into(),
            action,
            tags: BTreeMap::new(),
            user: None,
            role: None,
            rows_affected: None,
            resources_affected: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("resource_type", self.resource_type.clone()),
            ("resource_name", self.resource_name.clone()),
            ("action", self.action.to_string()),
        ];
        if !self.tags.is_empty() {
            let tags = self
                .tags
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            pairs.push(("tags", tags));
        }
        if let Some(user) = &self.user {
            pairs.push(("user", user.clone()));
        }
        if let Some(role) = &self.role {
            pairs.push(("role", role.clone()));
        }
        if let Some(rows) = self.rows_affected {
            pairs.push(("rows_affected", rows.to_string()));
        }
        if let Some(resources) = self.resources_affected {
            pairs.push(("resources_affected", resources.to_string()));
        }
        pairs
    }
}

/// Query-string form of an [`AuditQuery`]; unset filters are omitted.
pub fn audit_query_pairs(query: &AuditQuery) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();
    if let Some(session) = &query.session_id {
        pairs.push(("session_id", session.clone()));
    }
    if let Some(trace) = &query.trace_id {
        pairs.push(("trace_id", trace.clone()));
    }
    if let Some(event_type) = query.event_type {
        pairs.push(("event_type", event_type.as_str().to_string()));
    }
    if let Some(agent) = &query.agent {
        pairs.push(("agent", agent.clone()));
    }
    if let Some(action) = query.action_class {
        pairs.push(("action_class", action.to_string()));
    }
    if let Some(since) = query.since {
        pairs.push(("since", since.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)));
    }
    if let Some(after) = &query.after {
        pairs.push(("after", after.to_string()));
    }
    if let Some(limit) = query.limit {
        pairs.push(("limit", limit.to_string()));
    }
    pairs
}

pub fn approval_filter_pairs(filter: &ApprovalFilter) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();
    if let Some(status) = filter.status {
        pairs.push(("status", status.to_string()));
    }
    if let Some(agent) = &filter.agent {
        pairs.push(("agent", agent.clone()));
    }
    if let Some(limit) = filter.limit {
        pairs.push(("limit", limit.to_string()));
    }
    pairs
}
