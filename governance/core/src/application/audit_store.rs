// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Hash-Chained Audit Store
//!
//! Single writer of `prev_hash`/`event_hash`. Appends are serialized through
//! the chain tip mutex owned by the store: the tip is read, the event sealed
//! and persisted, and only then is the tip advanced. A failed insert leaves
//! the tip untouched, so the next append links to the last event that was
//! actually stored.
//!
//! Reads (`get`, `query`, `trace`, `verify_integrity`) go straight to the
//! repository and never wait on the tip lock.
//!
//! Every successful append is published on the [`EventBus`]. Publishing is
//! synchronous, non-blocking and infallible from the caller's point of view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::domain::audit::{
    verify_chain, AuditEvent, AuditQuery, EventId, IntegrityReport, NewAuditEvent, GENESIS_HASH,
};
use crate::domain::clock::Clock;
use crate::domain::repository::{AuditRepository, RepositoryError};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit event {0} not found")]
    NotFound(EventId),

    #[error("Invalid audit event: {0}")]
    InvalidEvent(String),

    #[error("Audit write failed: {0}")]
    Storage(#[from] RepositoryError),

    #[error("Failed to canonicalize audit event: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub event_id: EventId,
    pub event_hash: String,
    pub prev_hash: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct ChainTip {
    loaded: bool,
    hash: Option<String>,
    last_timestamp: Option<DateTime<Utc>>,
}

pub struct HashChainedAuditStore {
    repository: Arc<dyn AuditRepository>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    tip: Mutex<ChainTip>,
    query_max_limit: usize,
}

impl HashChainedAuditStore {
    pub fn new(
        repository: Arc<dyn AuditRepository>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        query_max_limit: usize,
    ) -> Self {
        Self {
            repository,
            event_bus,
            clock,
            tip: Mutex::new(ChainTip::default()),
            query_max_limit: query_max_limit.max(1),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Recover the chain tip from storage. Called lazily by the first append
    /// and eagerly at startup so a broken backend is detected before serving.
    pub async fn load_tip(&self) -> Result<(), AuditError> {
        let mut tip = self.tip.lock().await;
        self.ensure_loaded(&mut tip).await
    }

    async fn ensure_loaded(&self, tip: &mut ChainTip) -> Result<(), AuditError> {
        if tip.loaded {
            return Ok(());
        }
        let last = self.repository.last().await?;
        tip.hash = last.as_ref().and_then(|e| e.event_hash.clone());
        tip.last_timestamp = last.as_ref().map(|e| e.timestamp);
        tip.loaded = true;
        info!(
            tip = tip.hash.as_deref().unwrap_or(GENESIS_HASH),
            "Audit chain tip recovered"
        );
        Ok(())
    }

    pub async fn append(&self, draft: NewAuditEvent) -> Result<AppendReceipt, AuditError> {
        if draft.session_id.trim().is_empty() {
            return Err(AuditError::InvalidEvent("session_id cannot be empty".into()));
        }
        if draft.agent.trim().is_empty() {
            return Err(AuditError::InvalidEvent("agent cannot be empty".into()));
        }

        let event = {
            let mut tip = self.tip.lock().await;
            self.ensure_loaded(&mut tip).await?;

            let mut event = AuditEvent::from_new(draft, self.clock.now());
            // Chain order and timestamp order must agree.
            if let Some(last) = tip.last_timestamp {
                if event.timestamp < last {
                    event.timestamp = last;
                }
            }

            let prev_hash = tip.hash.clone().unwrap_or_else(|| GENESIS_HASH.to_string());
            event.seal(&prev_hash)?;

            if let Err(e) = self.repository.insert(&event).await {
                error!(event_id = %event.event_id, error = %e, "Audit write failed");
                return Err(e.into());
            }

            tip.hash = event.event_hash.clone();
            tip.last_timestamp = Some(event.timestamp);
            event
        };

        metrics::counter!("bulwark_audit_events_appended_total").increment(1);
        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type(),
            agent = %event.agent,
            "Audit event appended"
        );

        let receipt = AppendReceipt {
            event_id: event.event_id.clone(),
            event_hash: event.event_hash.clone().unwrap_or_default(),
            prev_hash: event.prev_hash.clone().unwrap_or_default(),
            timestamp: event.timestamp,
        };
        self.event_bus.publish(event);
        Ok(receipt)
    }

    pub async fn get(&self, id: &EventId) -> Result<AuditEvent, AuditError> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| AuditError::NotFound(id.clone()))
    }

    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        let limit = query.effective_limit(self.query_max_limit);
        Ok(self.repository.query(query, limit).await?)
    }

    /// Every event of one end-to-end request, in insertion order.
    pub async fn trace(&self, trace_id: &str) -> Result<Vec<AuditEvent>, AuditError> {
        let query = AuditQuery {
            trace_id: Some(trace_id.to_string()),
            limit: Some(self.query_max_limit),
            ..Default::default()
        };
        Ok(self.repository.query(&query, self.query_max_limit).await?)
    }

    pub async fn verify_integrity(&self) -> Result<IntegrityReport, AuditError> {
        let events = self.repository.scan_all().await?;
        let report = verify_chain(&events, self.clock.now());
        if report.valid {
            info!(
                total_events = report.total_events,
                legacy_events = report.legacy_events,
                "Audit chain verified"
            );
        } else {
            error!(
                first_broken_index = ?report.first_broken_index,
                first_invalid_id = ?report.first_invalid_id,
                error = ?report.error,
                "Audit chain integrity violation"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::EventPayload;
    use crate::domain::clock::{ManualClock, SystemClock};
    use crate::domain::policy::ActionClass;
    use crate::infrastructure::repositories::InMemoryAuditRepository;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;

    fn tool_call(session: &str, trace: &str) -> NewAuditEvent {
        NewAuditEvent::new(
            session,
            "db-agent",
            EventPayload::ToolCall {
                tool_name: "sql.execute".into(),
                params: json!({"statement": "UPDATE orders SET status = 'archived'"}),
                result: Some("UPDATE 12".into()),
                duration_ms: 40,
                success: true,
            },
        )
        .with_trace(trace)
        .with_action_class(ActionClass::Write)
    }

    fn store(repo: Arc<InMemoryAuditRepository>) -> HashChainedAuditStore {
        HashChainedAuditStore::new(repo, EventBus::new(64), Arc::new(SystemClock), 1000)
    }

    #[tokio::test]
    async fn test_first_event_links_to_genesis() {
        let store = store(Arc::new(InMemoryAuditRepository::new()));
        let first = store.append(tool_call("s-1", "t-1")).await.unwrap();
        let second = store.append(tool_call("s-1", "t-1")).await.unwrap();
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.event_hash);
        assert!(first.event_id.as_str().starts_with("tool_"));
    }

    #[tokio::test]
    async fn test_concurrent_appends_form_one_chain() {
        let store = Arc::new(store(Arc::new(InMemoryAuditRepository::new())));
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.append(tool_call(&format!("s-{}", i % 4), "t-1")).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let report = store.verify_integrity().await.unwrap();
        assert!(report.valid, "{:?}", report.error);
        assert_eq!(report.total_events, 32);
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let repo = Arc::new(InMemoryAuditRepository::new());
        let store = store(repo.clone());
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.append(tool_call("s-1", "t-1")).await.unwrap().event_id);
        }

        assert!(repo.tamper(3, |e| e.agent = "someone-else".into()));
        let report = store.verify_integrity().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.first_broken_index, Some(3));
        assert_eq!(report.first_invalid_id.as_ref(), Some(&ids[3]));
    }

    #[tokio::test]
    async fn test_tip_recovered_from_existing_rows() {
        let repo = Arc::new(InMemoryAuditRepository::new());
        let first_store = store(repo.clone());
        let receipt = first_store.append(tool_call("s-1", "t-1")).await.unwrap();

        let restarted = store(repo.clone());
        restarted.load_tip().await.unwrap();
        let next = restarted.append(tool_call("s-2", "t-2")).await.unwrap();
        assert_eq!(next.prev_hash, receipt.event_hash);
        assert!(restarted.verify_integrity().await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_legacy_rows_tolerated() {
        let repo = Arc::new(InMemoryAuditRepository::new());
        repo.insert_raw(AuditEvent::from_new(tool_call("old", "t-0"), Utc::now()));
        let store = store(repo);
        let receipt = store.append(tool_call("s-1", "t-1")).await.unwrap();
        assert_eq!(receipt.prev_hash, GENESIS_HASH);

        let report = store.verify_integrity().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.legacy_events, 1);
    }

    #[tokio::test]
    async fn test_hashless_row_after_chain_start_is_a_break() {
        let repo = Arc::new(InMemoryAuditRepository::new());
        let store = store(repo.clone());
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(store.append(tool_call("s-1", "t-1")).await.unwrap().event_id);
        }

        assert!(repo.tamper(2, |e| {
            e.agent = "forged-agent".into();
            e.event_hash = None;
            e.prev_hash = None;
        }));
        let report = store.verify_integrity().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.legacy_events, 0);
        assert_eq!(report.first_broken_index, Some(2));
        assert_eq!(report.first_invalid_id.as_ref(), Some(&ids[2]));
    }

    #[tokio::test]
    async fn test_timestamps_never_go_backwards() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = HashChainedAuditStore::new(
            Arc::new(InMemoryAuditRepository::new()),
            EventBus::new(8),
            clock.clone(),
            1000,
        );
        let first = store.append(tool_call("s-1", "t-1")).await.unwrap();
        clock.advance(Duration::seconds(-30));
        let second = store.append(tool_call("s-1", "t-1")).await.unwrap();
        assert_eq!(second.timestamp, first.timestamp);
    }

    #[tokio::test]
    async fn test_append_broadcasts() {
        let store = store(Arc::new(InMemoryAuditRepository::new()));
        let mut receiver = store.event_bus().subscribe();
        let receipt = store.append(tool_call("s-1", "t-1")).await.unwrap();
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_id, receipt.event_id);
    }

    #[tokio::test]
    async fn test_query_and_trace() {
        let store = store(Arc::new(InMemoryAuditRepository::new()));
        store.append(tool_call("s-1", "t-1")).await.unwrap();
        store.append(tool_call("s-1", "t-2")).await.unwrap();
        store
            .append(
                NewAuditEvent::new("s-1", "planner", EventPayload::Reasoning { content: "done".into() })
                    .with_trace("t-1"),
            )
            .await
            .unwrap();

        let journey = store.trace("t-1").await.unwrap();
        assert_eq!(journey.len(), 2);
        assert_eq!(journey[1].agent, "planner");

        let limited = store
            .query(&AuditQuery { limit: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let missing = store.get(&EventId("tool_missing".into())).await;
        assert!(matches!(missing, Err(AuditError::NotFound(_))));
    }

    struct FailingRepository;

    #[async_trait]
    impl AuditRepository for FailingRepository {
        async fn insert(&self, _event: &AuditEvent) -> Result<(), RepositoryError> {
            Err(RepositoryError::Database("connection refused".into()))
        }
        async fn last(&self) -> Result<Option<AuditEvent>, RepositoryError> {
            Ok(None)
        }
        async fn find_by_id(&self, _id: &EventId) -> Result<Option<AuditEvent>, RepositoryError> {
            Ok(None)
        }
        async fn query(&self, _q: &AuditQuery, _limit: usize) -> Result<Vec<AuditEvent>, RepositoryError> {
            Ok(vec![])
        }
        async fn scan_all(&self) -> Result<Vec<AuditEvent>, RepositoryError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces_and_nothing_is_broadcast() {
        let store = HashChainedAuditStore::new(
            Arc::new(FailingRepository),
            EventBus::new(8),
            Arc::new(SystemClock),
            1000,
        );
        let mut receiver = store.event_bus().subscribe();
        let err = store.append(tool_call("s-1", "t-1")).await.unwrap_err();
        assert!(matches!(err, AuditError::Storage(_)));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejects_empty_agent() {
        let store = store(Arc::new(InMemoryAuditRepository::new()));
        let mut draft = tool_call("s-1", "t-1");
        draft.agent = " ".into();
        assert!(matches!(store.append(draft).await, Err(AuditError::InvalidEvent(_))));
    }
}
