// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Approval Request Aggregate
//!
//! Human-in-the-loop decision for an action whose policy verdict was
//! `require_approval`. State machine:
//!
//! ```text
//! pending --approve (quorum reached)--> approved
//! pending --deny--------------------> denied
//! pending --expires_at passes-------> expired
//! pending --requester cancels-------> cancelled
//! ```
//!
//! Every non-pending state is terminal. Expiry is lazy: a pending request
//! whose `expires_at` has passed reads as `expired` through
//! [`ApprovalRequest::observe`], which every read path applies.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::policy::ActionClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalId(pub Uuid);

impl ApprovalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ApprovalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ApprovalId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            "expired" => Ok(ApprovalStatus::Expired),
            "cancelled" => Ok(ApprovalStatus::Cancelled),
            other => Err(format!("unknown approval status '{}'", other)),
        }
    }
}

/// Human decision applied to a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Approve,
    Deny,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalVote {
    pub approver: String,
    pub voted_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("Approval {0} not found")]
    NotFound(ApprovalId),

    #[error("Approval {id} already resolved (status: {status})")]
    AlreadyResolved { id: ApprovalId, status: ApprovalStatus },

    #[error("{actor} has already approved {id}")]
    DuplicateVote { id: ApprovalId, actor: String },

    #[error("Only the requester ({requested_by}) may cancel approval {id}")]
    NotRequester { id: ApprovalId, requested_by: String },

    #[error("Invalid approval request: {0}")]
    Invalid(String),

    #[error("Wait for approval {0} was cancelled")]
    WaitCancelled(ApprovalId),

    #[error("Approval storage failure: {0}")]
    Storage(String),
}

/// Creation payload, as submitted by a calling agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewApprovalRequest {
    pub requested_by: String,
    pub action_class: ActionClass,
    pub resource_type: String,
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default = "default_quorum")]
    pub required_approvals: u32,
    #[serde(default)]
    pub request_context: Value,
}

fn default_quorum() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: ApprovalId,
    pub status: ApprovalStatus,
    pub requested_by: String,
    pub action_class: ActionClass,
    pub resource_type: String,
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub required_approvals: u32,
    #[serde(default)]
    pub approvals: Vec<ApprovalVote>,
    #[serde(default)]
    pub request_context: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn create(
        new: NewApprovalRequest,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Self, ApprovalError> {
        if new.requested_by.trim().is_empty() {
            return Err(ApprovalError::Invalid("requested_by cannot be empty".into()));
        }
        if new.resource_name.trim().is_empty() {
            return Err(ApprovalError::Invalid("resource_name cannot be empty".into()));
        }
        Ok(Self {
            approval_id: ApprovalId::new(),
            status: ApprovalStatus::Pending,
            requested_by: new.requested_by,
            action_class: new.action_class,
            resource_type: new.resource_type,
            resource_name: new.resource_name,
            event_id: new.event_id,
            trace_id: new.trace_id,
            explanation: new.explanation,
            required_approvals: new.required_approvals.max(1),
            approvals: Vec::new(),
            request_context: new.request_context,
            created_at: now,
            expires_at: now + window,
            approved_by: None,
            denied_by: None,
            reason: None,
            resolved_at: None,
        })
    }

    /// Status as seen by a reader at `now`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ApprovalStatus {
        if self.status == ApprovalStatus::Pending && now >= self.expires_at {
            ApprovalStatus::Expired
        } else {
            self.status
        }
    }

    /// Apply lazy expiry. Returns `true` when the state changed and should be
    /// written back.
    pub fn observe(&mut self, now: DateTime<Utc>) -> bool {
        if self.effective_status(now) == ApprovalStatus::Expired && self.status == ApprovalStatus::Pending {
            self.status = ApprovalStatus::Expired;
            self.resolved_at = Some(self.expires_at);
            self.reason = Some("approval window elapsed".to_string());
            return true;
        }
        false
    }

    /// Apply a human decision. Terminal requests reject every further
    /// resolution without changing state.
    pub fn resolve(
        &mut self,
        resolution: Resolution,
        actor: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ApprovalError> {
        self.observe(now);
        if self.status.is_terminal() {
            return Err(ApprovalError::AlreadyResolved {
                id: self.approval_id,
                status: self.status,
            });
        }

        match resolution {
            Resolution::Approve => {
                if self.approvals.iter().any(|v| v.approver == actor) {
                    return Err(ApprovalError::DuplicateVote {
                        id: self.approval_id,
                        actor: actor.to_string(),
                    });
                }
                self.approvals.push(ApprovalVote {
                    approver: actor.to_string(),
                    voted_at: now,
                });
                if self.approvals.len() as u32 >= self.required_approvals {
                    self.status = ApprovalStatus::Approved;
                    self.approved_by = Some(
                        self.approvals
                            .iter()
                            .map(|v| v.approver.as_str())
                            .collect::<Vec<_>>()
                            .join(","),
                    );
                    self.reason = reason;
                    self.resolved_at = Some(now);
                }
            }
            Resolution::Deny => {
                self.status = ApprovalStatus::Denied;
                self.denied_by = Some(actor.to_string());
                self.reason = reason;
                self.resolved_at = Some(now);
            }
            Resolution::Cancel => {
                if actor != self.requested_by {
                    return Err(ApprovalError::NotRequester {
                        id: self.approval_id,
                        requested_by: self.requested_by.clone(),
                    });
                }
                self.status = ApprovalStatus::Cancelled;
                self.reason = reason;
                self.resolved_at = Some(now);
            }
        }
        Ok(())
    }

    pub fn approvals_remaining(&self) -> u32 {
        self.required_approvals.saturating_sub(self.approvals.len() as u32)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalFilter {
    pub status: Option<ApprovalStatus>,
    pub agent: Option<String>,
    pub limit: Option<usize>,
}

impl ApprovalFilter {
    pub fn pending() -> Self {
        Self {
            status: Some(ApprovalStatus::Pending),
            ..Default::default()
        }
    }

    /// Compared against the effective status, so expired requests never list as pending.
    pub fn matches(&self, request: &ApprovalRequest, now: DateTime<Utc>) -> bool {
        if let Some(status) = self.status {
            if request.effective_status(now) != status {
                return false;
            }
        }
        if let Some(agent) = &self.agent {
            if &request.requested_by != agent {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_request(quorum: u32) -> NewApprovalRequest {
        NewApprovalRequest {
            requested_by: "db-agent".into(),
            action_class: ActionClass::Destructive,
            resource_type: "database".into(),
            resource_name: "orders".into(),
            event_id: None,
            trace_id: Some("trace-1".into()),
            explanation: None,
            required_approvals: quorum,
            request_context: json!({"row_count": 1200}),
        }
    }

    #[test]
    fn test_initial_state_is_pending() {
        let now = Utc::now();
        let req = ApprovalRequest::create(new_request(1), now, Duration::minutes(60)).unwrap();
        assert_eq!(req.status, ApprovalStatus::Pending);
        assert_eq!(req.expires_at, now + Duration::minutes(60));
    }

    #[test]
    fn test_lazy_expiry() {
        let now = Utc::now();
        let mut req = ApprovalRequest::create(new_request(1), now, Duration::minutes(1)).unwrap();
        let later = now + Duration::seconds(90);
        assert_eq!(req.effective_status(later), ApprovalStatus::Expired);
        assert!(req.observe(later));
        assert_eq!(req.status, ApprovalStatus::Expired);
        assert!(!req.observe(later));
    }

    #[test]
    fn test_terminal_requests_reject_resolution() {
        let now = Utc::now();
        let mut req = ApprovalRequest::create(new_request(1), now, Duration::minutes(60)).unwrap();
        req.resolve(Resolution::Deny, "alice", Some("too risky".into()), now).unwrap();
        let err = req.resolve(Resolution::Approve, "bob", None, now).unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyResolved { status: ApprovalStatus::Denied, .. }));
        assert_eq!(req.status, ApprovalStatus::Denied);
        assert_eq!(req.denied_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_expired_request_cannot_be_approved() {
        let now = Utc::now();
        let mut req = ApprovalRequest::create(new_request(1), now, Duration::minutes(1)).unwrap();
        let err = req
            .resolve(Resolution::Approve, "alice", None, now + Duration::minutes(2))
            .unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyResolved { status: ApprovalStatus::Expired, .. }));
    }

    #[test]
    fn test_quorum() {
        let now = Utc::now();
        let mut req = ApprovalRequest::create(new_request(2), now, Duration::minutes(60)).unwrap();
        req.resolve(Resolution::Approve, "alice", None, now).unwrap();
        assert_eq!(req.status, ApprovalStatus::Pending);
        assert_eq!(req.approvals_remaining(), 1);
        assert!(matches!(
            req.resolve(Resolution::Approve, "alice", None, now),
            Err(ApprovalError::DuplicateVote { .. })
        ));
        req.resolve(Resolution::Approve, "bob", Some("ok".into()), now).unwrap();
        assert_eq!(req.status, ApprovalStatus::Approved);
        assert_eq!(req.approved_by.as_deref(), Some("alice,bob"));
    }

    #[test]
    fn test_only_requester_cancels() {
        let now = Utc::now();
        let mut req = ApprovalRequest::create(new_request(1), now, Duration::minutes(60)).unwrap();
        assert!(matches!(
            req.resolve(Resolution::Cancel, "mallory", None, now),
            Err(ApprovalError::NotRequester { .. })
        ));
        req.resolve(Resolution::Cancel, "db-agent", None, now).unwrap();
        assert_eq!(req.status, ApprovalStatus::Cancelled);
    }

    #[test]
    fn test_filter_uses_effective_status() {
        let now = Utc::now();
        let req = ApprovalRequest::create(new_request(1), now, Duration::minutes(1)).unwrap();
        let pending = ApprovalFilter::pending();
        assert!(pending.matches(&req, now));
        assert!(!pending.matches(&req, now + Duration::minutes(5)));
    }
}
