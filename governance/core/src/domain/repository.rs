// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the two persisted aggregates. Interfaces live in
//! the domain layer; implementations live in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `AuditRepository` | `AuditEvent` | `InMemoryAuditRepository`, `PostgresAuditRepository` |
//! | `ApprovalRepository` | `ApprovalRequest` | `InMemoryApprovalRepository`, `PostgresApprovalRepository` |
//!
//! The audit repository is a dumb, append-only row store: chaining is the
//! job of [`crate::application::audit_store::HashChainedAuditStore`], which is
//! the only writer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::approval::{ApprovalFilter, ApprovalId, ApprovalRequest, ApprovalStatus};
use crate::domain::audit::{AuditEvent, AuditQuery, EventId};

/// Storage backend selected at startup.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    InMemory,
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

/// Append-only audit row store.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Persist a sealed event. The row and its hash pair are written in one statement.
    async fn insert(&self, event: &AuditEvent) -> Result<(), RepositoryError>;

    /// Most recently inserted event, used to recover the chain tip at startup.
    async fn last(&self) -> Result<Option<AuditEvent>, RepositoryError>;

    async fn find_by_id(&self, id: &EventId) -> Result<Option<AuditEvent>, RepositoryError>;

    /// Matching events in insertion order, at most `limit`.
    async fn query(&self, query: &AuditQuery, limit: usize) -> Result<Vec<AuditEvent>, RepositoryError>;

    /// Every event in insertion order.
    async fn scan_all(&self) -> Result<Vec<AuditEvent>, RepositoryError>;
}

#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn insert(&self, request: &ApprovalRequest) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: ApprovalId) -> Result<Option<ApprovalRequest>, RepositoryError>;

    /// Write `request` only if the stored status still equals `expected`.
    /// Returns `false` when another writer got there first.
    async fn update_if_status(
        &self,
        request: &ApprovalRequest,
        expected: ApprovalStatus,
    ) -> Result<bool, RepositoryError>;

    /// Newest first.
    async fn list(
        &self,
        filter: &ApprovalFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Duplicate entity: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return RepositoryError::Duplicate(db.message().to_string());
            }
        }
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            other => RepositoryError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
