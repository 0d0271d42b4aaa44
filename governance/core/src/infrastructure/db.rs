// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Connection Pool
//!
//! Wraps `sqlx::postgres::PgPool` in a thin `Database` newtype that is
//! injected into the PostgreSQL repository implementations, and owns the
//! schema bootstrap run once at startup.
//!
//! The audit table carries a `BIGSERIAL seq` column: insertion order is the
//! chain order, and timestamps alone cannot break ties.

use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::domain::repository::PostgresConfig;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS audit_events (
        seq           BIGSERIAL PRIMARY KEY,
        event_id      TEXT NOT NULL UNIQUE,
        timestamp     TIMESTAMPTZ NOT NULL,
        event_type    TEXT NOT NULL,
        session_id    TEXT NOT NULL,
        trace_id      TEXT,
        agent         TEXT NOT NULL,
        action_class  TEXT,
        payload       JSONB NOT NULL,
        prev_hash     TEXT,
        event_hash    TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_audit_events_trace ON audit_events (trace_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_events_session ON audit_events (session_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_events_agent ON audit_events (agent)",
    "CREATE INDEX IF NOT EXISTS idx_audit_events_action_class ON audit_events (action_class)",
    "CREATE INDEX IF NOT EXISTS idx_audit_events_timestamp ON audit_events (timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS approval_requests (
        approval_id   UUID PRIMARY KEY,
        status        TEXT NOT NULL,
        requested_by  TEXT NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL,
        expires_at    TIMESTAMPTZ NOT NULL,
        body          JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_approval_requests_status ON approval_requests (status, expires_at)",
];

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables and indexes if they do not exist.
    pub async fn bootstrap_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Governance schema ready");
        Ok(())
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}
