// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Audit Event Aggregate
//!
//! Immutable, hash-chained record of everything a governed agent decided or
//! did. Events are created exactly once by the component that observed the
//! action and are never mutated afterwards; the store assigns `prev_hash` and
//! `event_hash` at append time.
//!
//! ## Hash Chain
//!
//! `event_hash = sha256(canonical_json(event without prev_hash/event_hash))`
//! and `prev_hash(n) = event_hash(n - 1)`, with [`GENESIS_HASH`] for the first
//! event. Canonical JSON is `serde_json::Value` rendering, whose object keys
//! are sorted, so the digest does not depend on struct field order.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::policy::{ActionClass, Effect};

/// `prev_hash` of the first event in the chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Globally unique, type-prefixed event identifier (`tool_<uuid>`, `policy_<uuid>`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub fn new(event_type: EventType) -> Self {
        Self(format!("{}_{}", event_type.id_prefix(), Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DelegationDecision,
    ToolCall,
    PolicyDecision,
    Reasoning,
    GovernanceViolation,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DelegationDecision => "delegation_decision",
            EventType::ToolCall => "tool_call",
            EventType::PolicyDecision => "policy_decision",
            EventType::Reasoning => "reasoning",
            EventType::GovernanceViolation => "governance_violation",
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self {
            EventType::DelegationDecision => "deleg",
            EventType::ToolCall => "tool",
            EventType::PolicyDecision => "policy",
            EventType::Reasoning => "reason",
            EventType::GovernanceViolation => "violation",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delegation_decision" => Ok(EventType::DelegationDecision),
            "tool_call" => Ok(EventType::ToolCall),
            "policy_decision" => Ok(EventType::PolicyDecision),
            "reasoning" => Ok(EventType::Reasoning),
            "governance_violation" => Ok(EventType::GovernanceViolation),
            other => Err(format!("unknown event type '{}'", other)),
        }
    }
}

/// Severity attached to governance violations and monitor alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("INFO"),
            Severity::Warning => f.write_str("WARNING"),
            Severity::Critical => f.write_str("CRITICAL"),
        }
    }
}

/// Type-specific body of an audit event. The variant tag doubles as the
/// `event_type` field on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    DelegationDecision {
        target_agent: String,
        #[serde(default)]
        reason: String,
    },
    ToolCall {
        tool_name: String,
        #[serde(default)]
        params: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default = "default_success")]
        success: bool,
    },
    PolicyDecision {
        resource_type: String,
        resource_name: String,
        action: ActionClass,
        effect: Effect,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_index: Option<usize>,
        explanation: String,
        #[serde(default)]
        post_execution: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approval_id: Option<String>,
    },
    Reasoning {
        content: String,
    },
    GovernanceViolation {
        module: String,
        severity: Severity,
        detail: String,
    },
}

fn default_success() -> bool {
    true
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::DelegationDecision { .. } => EventType::DelegationDecision,
            EventPayload::ToolCall { .. } => EventType::ToolCall,
            EventPayload::PolicyDecision { .. } => EventType::PolicyDecision,
            EventPayload::Reasoning { .. } => EventType::Reasoning,
            EventPayload::GovernanceViolation { .. } => EventType::GovernanceViolation,
        }
    }
}

/// An event as submitted by an agent, before the store has placed it on the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEvent {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_class: Option<ActionClass>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl NewAuditEvent {
    pub fn new(session_id: impl Into<String>, agent: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            trace_id: None,
            agent: agent.into(),
            action_class: None,
            payload,
        }
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_action_class(mut self, action_class: ActionClass) -> Self {
        self.action_class = Some(action_class);
        self
    }
}

/// A chained, persisted audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_class: Option<ActionClass>,
    #[serde(flatten)]
    pub payload: EventPayload,
    /// `None` only for legacy events written before the chain existed.
    #[serde(default)]
    pub prev_hash: Option<String>,
    #[serde(default)]
    pub event_hash: Option<String>,
}

/// Hashed projection of an event: every field except the hash pair.
#[derive(Serialize)]
struct HashedBody<'a> {
    event_id: &'a EventId,
    timestamp: &'a DateTime<Utc>,
    session_id: &'a str,
    trace_id: &'a Option<String>,
    agent: &'a str,
    action_class: &'a Option<ActionClass>,
    #[serde(flatten)]
    payload: &'a EventPayload,
}

impl AuditEvent {
    /// Materialize a draft with a fresh id and timestamp. Hash fields are
    /// left empty; [`AuditEvent::seal`] fills them.
    pub fn from_new(draft: NewAuditEvent, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: EventId::new(draft.payload.event_type()),
            timestamp: timestamp.trunc_subsecs(6),
            session_id: draft.session_id,
            trace_id: draft.trace_id,
            agent: draft.agent,
            action_class: draft.action_class,
            payload: draft.payload,
            prev_hash: None,
            event_hash: None,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Canonical JSON of the event body with the hash pair excluded.
    pub fn canonical_body(&self) -> Result<String, serde_json::Error> {
        let body = HashedBody {
            event_id: &self.event_id,
            timestamp: &self.timestamp,
            session_id: &self.session_id,
            trace_id: &self.trace_id,
            agent: &self.agent,
            action_class: &self.action_class,
            payload: &self.payload,
        };
        let value = serde_json::to_value(&body)?;
        serde_json::to_string(&value)
    }

    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let canonical = self.canonical_body()?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(hex::encode(digest))
    }

    /// Link this event to `prev_hash` and stamp its own hash.
    pub fn seal(&mut self, prev_hash: &str) -> Result<(), serde_json::Error> {
        self.prev_hash = Some(prev_hash.to_string());
        self.event_hash = Some(self.compute_hash()?);
        Ok(())
    }

    pub fn is_legacy(&self) -> bool {
        self.event_hash.is_none()
    }

    /// `true` when the stored hash matches a recomputation over the stored body.
    pub fn hash_is_valid(&self) -> bool {
        match (&self.event_hash, self.compute_hash()) {
            (Some(stored), Ok(recomputed)) => *stored == recomputed,
            _ => false,
        }
    }

    pub fn is_destructive(&self) -> bool {
        self.action_class == Some(ActionClass::Destructive)
            || matches!(
                self.payload,
                EventPayload::PolicyDecision { action: ActionClass::Destructive, .. }
            )
    }
}

/// Outcome of walking the chain in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub total_events: usize,
    pub legacy_events: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_broken_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_invalid_id: Option<EventId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Verify a chain given in insertion order.
///
/// Legacy events (no `event_hash`) are tolerated only as a prefix written
/// before the chain existed. The first hashed event must link to genesis and
/// every later event must carry a hash linking to its predecessor; a hashless
/// event after the chain has started is a break.
pub fn verify_chain(events: &[AuditEvent], checked_at: DateTime<Utc>) -> IntegrityReport {
    let mut legacy_events = 0;
    let mut previous: Option<&str> = None;

    for (index, event) in events.iter().enumerate() {
        let Some(stored_hash) = event.event_hash.as_deref() else {
            if previous.is_none() {
                legacy_events += 1;
                continue;
            }
            return IntegrityReport {
                valid: false,
                total_events: events.len(),
                legacy_events,
                first_broken_index: Some(index),
                first_invalid_id: Some(event.event_id.clone()),
                error: Some(format!(
                    "missing event_hash at index {} after the hash chain started",
                    index
                )),
                checked_at,
            };
        };

        let expected_prev = previous.unwrap_or(GENESIS_HASH);
        let broken = if event.prev_hash.as_deref() != Some(expected_prev) {
            Some(format!(
                "broken link at index {}: prev_hash {} does not match predecessor hash {}",
                index,
                event.prev_hash.as_deref().unwrap_or("<missing>"),
                expected_prev
            ))
        } else if !event.hash_is_valid() {
            Some(format!(
                "hash mismatch at index {}: stored event_hash {} does not match recomputed body hash",
                index, stored_hash
            ))
        } else {
            None
        };

        if let Some(error) = broken {
            return IntegrityReport {
                valid: false,
                total_events: events.len(),
                legacy_events,
                first_broken_index: Some(index),
                first_invalid_id: Some(event.event_id.clone()),
                error: Some(error),
                checked_at,
            };
        }

        previous = Some(stored_hash);
    }

    IntegrityReport {
        valid: true,
        total_events: events.len(),
        legacy_events,
        first_broken_index: None,
        first_invalid_id: None,
        error: None,
        checked_at,
    }
}

/// Filters accepted by the audit query path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub session_id: Option<String>,
    pub trace_id: Option<String>,
    pub event_type: Option<EventType>,
    pub agent: Option<String>,
    pub action_class: Option<ActionClass>,
    pub since: Option<DateTime<Utc>>,
    /// Keyset cursor: only events inserted after this one. An unknown id
    /// is ignored.
    pub after: Option<EventId>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn effective_limit(&self, max: usize) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).min(max)
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(session) = &self.session_id {
            if &event.session_id != session {
                return false;
            }
        }
        if let Some(trace) = &self.trace_id {
            if event.trace_id.as_ref() != Some(trace) {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if event.event_type() != event_type {
                return false;
            }
        }
        if let Some(agent) = &self.agent {
            if &event.agent != agent {
                return false;
            }
        }
        if let Some(action_class) = self.action_class {
            if event.action_class != Some(action_class) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        true
    }
}
