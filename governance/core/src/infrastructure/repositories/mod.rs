// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! `crate::domain::repository`.
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! - **PostgresAuditRepository** - append-only audit rows ordered by `seq`
//! - **PostgresApprovalRepository** - approval requests with compare-and-set status updates
//!
//! ## In-Memory Repositories
//!
//! Lightweight implementations for tests and single-node development:
//! - **InMemoryAuditRepository** - `Vec` in insertion order
//! - **InMemoryApprovalRepository** - `HashMap` keyed by approval id

pub mod postgres_approval;
pub mod postgres_audit;

pub use postgres_approval::PostgresApprovalRepository;
pub use postgres_audit::PostgresAuditRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::approval::{ApprovalFilter, ApprovalId, ApprovalRequest, ApprovalStatus};
use crate::domain::audit::{AuditEvent, AuditQuery, EventId};
use crate::domain::repository::{ApprovalRepository, AuditRepository, RepositoryError};

#[derive(Clone, Default)]
pub struct InMemoryAuditRepository {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl InMemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored event in place. Only tests use this, to simulate
    /// tampering with the underlying table.
    pub fn tamper<F: FnOnce(&mut AuditEvent)>(&self, index: usize, mutate: F) -> bool {
        let mut events = self.events.write();
        match events.get_mut(index) {
            Some(event) => {
                mutate(event);
                true
            }
            None => false,
        }
    }

    /// Insert a row bypassing the chain, as a pre-chain writer would have.
    pub fn insert_raw(&self, event: AuditEvent) {
        self.events.write().push(event);
    }
}

#[async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn insert(&self, event: &AuditEvent) -> Result<(), RepositoryError> {
        let mut events = self.events.write();
        if events.iter().any(|e| e.event_id == event.event_id) {
            return Err(RepositoryError::Duplicate(event.event_id.to_string()));
        }
        events.push(event.clone());
        Ok(())
    }

    async fn last(&self) -> Result<Option<AuditEvent>, RepositoryError> {
        Ok(self.events.read().last().cloned())
    }

    async fn find_by_id(&self, id: &EventId) -> Result<Option<AuditEvent>, RepositoryError> {
        Ok(self.events.read().iter().find(|e| &e.event_id == id).cloned())
    }

    async fn query(&self, query: &AuditQuery, limit: usize) -> Result<Vec<AuditEvent>, RepositoryError> {
        let events = self.events.read();
        let start = query
            .after
            .as_ref()
            .and_then(|after| events.iter().position(|e| &e.event_id == after))
            .map_or(0, |position| position + 1);
        Ok(events[start..]
            .iter()
            .filter(|e| query.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn scan_all(&self) -> Result<Vec<AuditEvent>, RepositoryError> {
        Ok(self.events.read().clone())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryApprovalRepository {
    requests: Arc<RwLock<HashMap<ApprovalId, ApprovalRequest>>>,
}

impl InMemoryApprovalRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalRepository for InMemoryApprovalRepository {
    async fn insert(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        let mut requests = self.requests.write();
        if requests.contains_key(&request.approval_id) {
            return Err(RepositoryError::Duplicate(request.approval_id.to_string()));
        }
        requests.insert(request.approval_id, request.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: ApprovalId) -> Result<Option<ApprovalRequest>, RepositoryError> {
        Ok(self.requests.read().get(&id).cloned())
    }

    async fn update_if_status(
        &self,
        request: &ApprovalRequest,
        expected: ApprovalStatus,
    ) -> Result<bool, RepositoryError> {
        let mut requests = self.requests.write();
        match requests.get_mut(&request.approval_id) {
            Some(stored) if stored.status == expected => {
                *stored = request.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(request.approval_id.to_string())),
        }
    }

    async fn list(
        &self,
        filter: &ApprovalFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let mut matched: Vec<ApprovalRequest> = self
            .requests
            .read()
            .values()
            .filter(|r| filter.matches(r, now))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::approval::NewApprovalRequest;
    use crate::domain::audit::{EventPayload, NewAuditEvent, GENESIS_HASH};
    use crate::domain::policy::ActionClass;
    use chrono::Duration;

    fn sealed(session: &str) -> AuditEvent {
        let mut event = AuditEvent::from_new(
            NewAuditEvent::new(session, "k8s-agent", EventPayload::Reasoning { content: "scale".into() }),
            Utc::now(),
        );
        event.seal(GENESIS_HASH).unwrap();
        event
    }

    #[tokio::test]
    async fn test_audit_insert_and_query_in_order() {
        let repo = InMemoryAuditRepository::new();
        let first = sealed("a");
        let second = sealed("b");
        let third = sealed("a");
        for e in [&first, &second, &third] {
            repo.insert(e).await.unwrap();
        }

        let query = AuditQuery { session_id: Some("a".into()), ..Default::default() };
        let found = repo.query(&query, 10).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].event_id, first.event_id);
        assert_eq!(found[1].event_id, third.event_id);
        assert_eq!(repo.last().await.unwrap().unwrap().event_id, third.event_id);
        assert!(matches!(repo.insert(&first).await, Err(RepositoryError::Duplicate(_))));

        let page = AuditQuery { after: Some(first.event_id.clone()), ..Default::default() };
        let found = repo.query(&page, 10).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].event_id, second.event_id);
    }

    #[tokio::test]
    async fn test_approval_compare_and_set() {
        let repo = InMemoryApprovalRepository::new();
        let now = Utc::now();
        let mut request = ApprovalRequest::create(
            NewApprovalRequest {
                requested_by: "db-agent".into(),
                action_class: ActionClass::Write,
                resource_type: "database".into(),
                resource_name: "orders".into(),
                event_id: None,
                trace_id: None,
                explanation: None,
                required_approvals: 1,
                request_context: serde_json::Value::Null,
            },
            now,
            Duration::minutes(60),
        )
        .unwrap();
        repo.insert(&request).await.unwrap();

        request.status = ApprovalStatus::Approved;
        assert!(repo.update_if_status(&request, ApprovalStatus::Pending).await.unwrap());
        assert!(!repo.update_if_status(&request, ApprovalStatus::Pending).await.unwrap());

        let pending = repo.list(&ApprovalFilter::pending(), now).await.unwrap();
        assert!(pending.is_empty());
    }
}
