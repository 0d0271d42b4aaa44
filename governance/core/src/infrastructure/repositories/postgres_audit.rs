// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::domain::audit::{AuditEvent, AuditQuery, EventId, EventPayload};
use crate::domain::policy::ActionClass;
use crate::domain::repository::{AuditRepository, RepositoryError};

const SELECT_COLUMNS: &str = "SELECT event_id, timestamp, session_id, trace_id, agent, action_class, \
                              payload, prev_hash, event_hash FROM audit_events";

pub struct PostgresAuditRepository {
    pool: PgPool,
}

impl PostgresAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> Result<AuditEvent, RepositoryError> {
        let event_id: String = row.try_get("event_id")?;
        let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
        let action_class: Option<String> = row.try_get("action_class")?;
        let payload_val: serde_json::Value = row.try_get("payload")?;

        let action_class = action_class
            .map(|s| s.parse::<ActionClass>())
            .transpose()
            .map_err(RepositoryError::Serialization)?;
        let payload: EventPayload = serde_json::from_value(payload_val)
            .map_err(|e| RepositoryError::Serialization(format!("Failed to deserialize payload of {}: {}", event_id, e)))?;

        Ok(AuditEvent {
            event_id: EventId(event_id),
            timestamp,
            session_id: row.try_get("session_id")?,
            trace_id: row.try_get("trace_id")?,
            agent: row.try_get("agent")?,
            action_class,
            payload,
            prev_hash: row.try_get("prev_hash")?,
            event_hash: row.try_get("event_hash")?,
        })
    }
}

#[async_trait]
impl AuditRepository for PostgresAuditRepository {
    async fn insert(&self, event: &AuditEvent) -> Result<(), RepositoryError> {
        let payload = serde_json::to_value(&event.payload)?;

        // Row and hash pair land in a single statement.
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                event_id, timestamp, event_type, session_id, trace_id,
                agent, action_class, payload, prev_hash, event_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.event_id.as_str())
        .bind(event.timestamp)
        .bind(event.event_type().as_str())
        .bind(&event.session_id)
        .bind(&event.trace_id)
        .bind(&event.agent)
        .bind(event.action_class.map(|a| a.as_str()))
        .bind(payload)
        .bind(&event.prev_hash)
        .bind(&event.event_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last(&self) -> Result<Option<AuditEvent>, RepositoryError> {
        let row = sqlx::query(&format!("{} ORDER BY seq DESC LIMIT 1", SELECT_COLUMNS))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn find_by_id(&self, id: &EventId) -> Result<Option<AuditEvent>, RepositoryError> {
        let row = sqlx::query(&format!("{} WHERE event_id = $1", SELECT_COLUMNS))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn query(&self, query: &AuditQuery, limit: usize) -> Result<Vec<AuditEvent>, RepositoryError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_COLUMNS);
        builder.push(" WHERE TRUE");

        if let Some(session_id) = &query.session_id {
            builder.push(" AND session_id = ").push_bind(session_id.clone());
        }
        if let Some(trace_id) = &query.trace_id {
            builder.push(" AND trace_id = ").push_bind(trace_id.clone());
        }
        if let Some(event_type) = query.event_type {
            builder.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        if let Some(agent) = &query.agent {
            builder.push(" AND agent = ").push_bind(agent.clone());
        }
        if let Some(action_class) = query.action_class {
            builder.push(" AND action_class = ").push_bind(action_class.as_str());
        }
        if let Some(since) = query.since {
            builder.push(" AND timestamp >= ").push_bind(since);
        }
        if let Some(after) = &query.after {
            builder
                .push(" AND seq > COALESCE((SELECT seq FROM audit_events WHERE event_id = ")
                .push_bind(after.as_str().to_string())
                .push("), 0)");
        }
        builder.push(" ORDER BY seq ASC LIMIT ").push_bind(limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn scan_all(&self) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = sqlx::query(&format!("{} ORDER BY seq ASC", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::from_row).collect()
    }
}
