// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Creates concrete repository implementations based on the storage backend
//! configuration. The domain layer only sees the traits.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Select in-memory or PostgreSQL repositories at startup

use sqlx::PgPool;
use std::sync::Arc;

use crate::domain::repository::{ApprovalRepository, AuditRepository, RepositoryError, StorageBackend};
use crate::infrastructure::repositories::{
    InMemoryApprovalRepository, InMemoryAuditRepository, PostgresApprovalRepository, PostgresAuditRepository,
};

fn missing_pool() -> RepositoryError {
    RepositoryError::Database("PostgreSQL backend selected but no connection pool was provided".to_string())
}

/// Creates an AuditRepository implementation based on the configured backend
pub fn create_audit_repository(
    backend: &StorageBackend,
    pool: Option<PgPool>,
) -> Result<Arc<dyn AuditRepository>, RepositoryError> {
    match backend {
        StorageBackend::InMemory => Ok(Arc::new(InMemoryAuditRepository::new())),
        StorageBackend::PostgreSQL(_) => Ok(Arc::new(PostgresAuditRepository::new(pool.ok_or_else(missing_pool)?))),
    }
}

/// Creates an ApprovalRepository implementation based on the configured backend
pub fn create_approval_repository(
    backend: &StorageBackend,
    pool: Option<PgPool>,
) -> Result<Arc<dyn ApprovalRepository>, RepositoryError> {
    match backend {
        StorageBackend::InMemory => Ok(Arc::new(InMemoryApprovalRepository::new())),
        StorageBackend::PostgreSQL(_) => Ok(Arc::new(PostgresApprovalRepository::new(
            pool.ok_or_else(missing_pool)?,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::PostgresConfig;

    #[test]
    fn test_postgres_requires_pool() {
        let backend = StorageBackend::PostgreSQL(PostgresConfig {
            connection_string: "postgres://localhost/bulwark".into(),
            max_connections: 1,
        });
        assert!(matches!(
            create_audit_repository(&backend, None),
            Err(RepositoryError::Database(_))
        ));
        assert!(create_approval_repository(&StorageBackend::InMemory, None).is_ok());
    }
}
