// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, QueryBuilder, Row};

use crate::domain::approval::{ApprovalFilter, ApprovalId, ApprovalRequest, ApprovalStatus};
use crate::domain::repository::{ApprovalRepository, RepositoryError};

/// Approval rows keep the searchable columns next to the full JSON body.
pub struct PostgresApprovalRepository {
    pool: PgPool,
}

impl PostgresApprovalRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode(body: serde_json::Value) -> Result<ApprovalRequest, RepositoryError> {
        serde_json::from_value(body)
            .map_err(|e| RepositoryError::Serialization(format!("Failed to deserialize approval: {}", e)))
    }
}

#[async_trait]
impl ApprovalRepository for PostgresApprovalRepository {
    async fn insert(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        let body = serde_json::to_value(request)?;
        sqlx::query(
            r#"
            INSERT INTO approval_requests (approval_id, status, requested_by, created_at, expires_at, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(request.approval_id.0)
        .bind(request.status.as_str())
        .bind(&request.requested_by)
        .bind(request.created_at)
        .bind(request.expires_at)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: ApprovalId) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM approval_requests WHERE approval_id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::decode(row.try_get("body")?)?)),
            None => Ok(None),
        }
    }

    async fn update_if_status(
        &self,
        request: &ApprovalRequest,
        expected: ApprovalStatus,
    ) -> Result<bool, RepositoryError> {
        let body = serde_json::to_value(request)?;
        let result = sqlx::query(
            r#"
            UPDATE approval_requests
            SET status = $1, body = $2
            WHERE approval_id = $3 AND status = $4
            "#,
        )
        .bind(request.status.as_str())
        .bind(body)
        .bind(request.approval_id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(
        &self,
        filter: &ApprovalFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT body FROM approval_requests WHERE TRUE");

        // Stored `pending` rows past their deadline read as expired.
        match filter.status {
            Some(ApprovalStatus::Pending) => {
                builder.push(" AND status = 'pending' AND expires_at > ").push_bind(now);
            }
            Some(ApprovalStatus::Expired) => {
                builder
                    .push(" AND (status = 'expired' OR (status = 'pending' AND expires_at <= ")
                    .push_bind(now)
                    .push("))");
            }
            Some(status) => {
                builder.push(" AND status = ").push_bind(status.as_str());
            }
            None => {}
        }
        if let Some(agent) = &filter.agent {
            builder.push(" AND requested_by = ").push_bind(agent.clone());
        }
        builder.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| Self::decode(row.try_get("body")?))
            .collect()
    }
}
