// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Control-Plane HTTP API
//!
//! JSON over HTTP in front of the audit store, the approval workflow and
//! the policy engine. Policy denials are never HTTP errors: `explain`
//! always answers 200 with the full decision trace.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | POST | `/v1/events` | Append an audit event |
//! | GET | `/v1/events` | Query events; `after=<event_id>` pages in insertion order |
//! | GET | `/v1/events/{id}` | Fetch one event |
//! | GET | `/v1/traces/{trace_id}` | Every event of one trace |
//! | GET | `/v1/verify` | Hash-chain integrity check |
//! | POST | `/v1/approvals` | Create an approval request |
//! | GET | `/v1/approvals`, `/v1/approvals/pending` | List approvals |
//! | GET | `/v1/approvals/{id}` | Fetch one approval |
//! | GET | `/v1/approvals/{id}/wait?timeout=` | Long-poll for resolution |
//! | POST | `/v1/approvals/{id}/approve`, `/deny`, `/cancel` | Resolve |
//! | GET | `/v1/governance/explain` | Hypothetical decision, no side effects |
//! | GET | `/health` | Liveness |

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::application::audit_store::AuditError;
use crate::application::services::GovernanceServices;
use crate::domain::approval::{
    ApprovalError, ApprovalFilter, ApprovalId, ApprovalRequest, ApprovalStatus, NewApprovalRequest, Resolution,
};
use crate::domain::audit::{AuditEvent, AuditQuery, EventId, NewAuditEvent};
use crate::domain::policy::{ActionClass, Principal, PolicyRequest, Resource};
use crate::domain::repository::RepositoryError;
use crate::infrastructure::inventory::enrich_resource;

pub struct AppState {
    pub services: GovernanceServices,
    pub started_at: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Governance unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "GOVERNANCE_UNAVAILABLE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::NotFound(id) => ApiError::NotFound(format!("audit event {}", id)),
            AuditError::InvalidEvent(reason) => ApiError::BadRequest(reason),
            AuditError::Storage(RepositoryError::Duplicate(reason)) => ApiError::Conflict(reason),
            AuditError::Storage(e) => ApiError::Unavailable(e.to_string()),
            AuditError::Serialization(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ApprovalError::AlreadyResolved { .. } | ApprovalError::DuplicateVote { .. } => {
                ApiError::Conflict(err.to_string())
            }
            ApprovalError::NotRequester { .. } => ApiError::Forbidden(err.to_string()),
            ApprovalError::Invalid(reason) => ApiError::BadRequest(reason),
            ApprovalError::WaitCancelled(_) => ApiError::Internal(err.to_string()),
            ApprovalError::Storage(reason) => ApiError::Unavailable(reason),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn router(services: GovernanceServices) -> Router {
    let state = Arc::new(AppState {
        services,
        started_at: Instant::now(),
    });

    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/events", post(append_event_handler).get(query_events_handler))
        .route("/v1/events/{id}", get(get_event_handler))
        .route("/v1/traces/{trace_id}", get(trace_handler))
        .route("/v1/verify", get(verify_handler))
        .route("/v1/approvals", post(create_approval_handler).get(list_approvals_handler))
        .route("/v1/approvals/pending", get(pending_approvals_handler))
        .route("/v1/approvals/{id}", get(get_approval_handler))
        .route("/v1/approvals/{id}/wait", get(wait_approval_handler))
        .route("/v1/approvals/{id}/approve", post(approve_handler))
        .route("/v1/approvals/{id}/deny", post(deny_handler))
        .route("/v1/approvals/{id}/cancel", post(cancel_handler))
        .route("/v1/governance/explain", get(explain_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "enforcing": state.services.enforcing,
        "policy_count": state.services.engine.policy_count(),
    }))
}

async fn append_event_handler(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<NewAuditEvent>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state.services.audit.append(draft).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventList {
    pub count: usize,
    pub events: Vec<AuditEvent>,
}

async fn query_events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<EventList>> {
    let events = state.services.audit.query(&query).await?;
    Ok(Json(EventList {
        count: events.len(),
        events,
    }))
}

async fn get_event_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AuditEvent>> {
    Ok(Json(state.services.audit.get(&EventId(id)).await?))
}

async fn trace_handler(
    State(state): State<Arc<AppState>>,
    Path(trace_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let events = state.services.audit.trace(&trace_id).await?;
    Ok(Json(serde_json::json!({
        "trace_id": trace_id,
        "count": events.len(),
        "events": events,
    })))
}

async fn verify_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let report = state.services.audit.verify_integrity().await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalCreated {
    pub approval_id: ApprovalId,
    pub status: ApprovalStatus,
    pub expires_at: DateTime<Utc>,
}

async fn create_approval_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewApprovalRequest>,
) -> ApiResult<impl IntoResponse> {
    let created = state.services.approvals.create(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApprovalCreated {
            approval_id: created.approval_id,
            status: created.status,
            expires_at: created.expires_at,
        }),
    ))
}

async fn list_approvals_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ApprovalFilter>,
) -> ApiResult<Json<Vec<ApprovalRequest>>> {
    Ok(Json(state.services.approvals.list(&filter).await?))
}

async fn pending_approvals_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ApprovalRequest>>> {
    Ok(Json(state.services.approvals.pending().await?))
}

fn parse_approval_id(raw: &str) -> ApiResult<ApprovalId> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("'{}' is not a valid approval id", raw)))
}

async fn get_approval_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApprovalRequest>> {
    let id = parse_approval_id(&id)?;
    Ok(Json(state.services.approvals.get(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct WaitParams {
    /// Seconds; capped by the server.
    pub timeout: Option<u64>,
}

async fn wait_approval_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<WaitParams>,
) -> ApiResult<Json<ApprovalRequest>> {
    let id = parse_approval_id(&id)?;
    let max_wait = state.services.approvals.settings().max_wait;
    let timeout = params.timeout.map(Duration::from_secs).unwrap_or(max_wait);
    Ok(Json(state.services.approvals.wait_for_resolution(id, timeout).await?))
}

/// `{"approved_by": ...}`, `{"denied_by": ...}` or `{"cancelled_by": ...}`.
#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    #[serde(alias = "approved_by", alias = "denied_by", alias = "cancelled_by", alias = "requested_by")]
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

async fn resolve(
    state: &AppState,
    id: &str,
    resolution: Resolution,
    body: ResolveBody,
) -> ApiResult<Json<ApprovalRequest>> {
    let id = parse_approval_id(id)?;
    match state
        .services
        .approvals
        .resolve(id, resolution, &body.actor, body.reason)
        .await
    {
        Ok(request) => Ok(Json(request)),
        Err(e) => {
            warn!(approval_id = %id, actor = %body.actor, error = %e, "Approval resolution rejected");
            Err(e.into())
        }
    }
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Json<ApprovalRequest>> {
    resolve(&state, &id, Resolution::Approve, body).await
}

async fn deny_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Json<ApprovalRequest>> {
    resolve(&state, &id, Resolution::Deny, body).await
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Json<ApprovalRequest>> {
    resolve(&state, &id, Resolution::Cancel, body).await
}

#[derive(Debug, Deserialize)]
pub struct ExplainParams {
    pub resource_type: String,
    pub resource_name: String,
    pub action: ActionClass,
    /// `key=value,key2=value2`
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub rows_affected: Option<u64>,
    #[serde(default)]
    pub resources_affected: Option<u64>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// Parse `key=value` pairs separated by commas.
pub fn parse_tags(raw: &str) -> Result<BTreeMap<String, String>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
            _ => Err(format!("tag '{}' is not key=value", pair)),
        })
        .collect()
}

async fn explain_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExplainParams>,
) -> ApiResult<impl IntoResponse> {
    let mut resource = Resource::new(params.resource_type, params.resource_name);
    if let Some(raw) = params.tags.as_deref() {
        resource.tags = parse_tags(raw).map_err(ApiError::BadRequest)?;
    }
    if let Some(inventory) = &state.services.inventory {
        enrich_resource(inventory.as_ref(), &mut resource).await;
    }
    let mut principal = Principal::new(params.user.unwrap_or_else(|| "anonymous".to_string()));
    if let Some(role) = params.role {
        principal = principal.with_role(role);
    }

    let mut request = PolicyRequest::new(principal, resource, params.action);
    request.context.rows_affected = params.rows_affected;
    request.context.resources_affected = params.resources_affected;
    request.context.trace_id = params.trace_id;

    let trace = state.services.engine.explain(&request);
    info!(
        resource = %request.resource.name,
        action = %request.action,
        effect = %trace.decision.effect,
        "Explained hypothetical policy decision"
    );
    Ok(Json(trace))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("env=production, tier=critical").unwrap();
        assert_eq!(tags.get("env").map(String::as_str), Some("production"));
        assert_eq!(tags.get("tier").map(String::as_str), Some("critical"));
        assert!(parse_tags("").unwrap().is_empty());
        assert!(parse_tags("env").is_err());
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(ApprovalError::AlreadyResolved {
                id: ApprovalId::new(),
                status: ApprovalStatus::Denied,
            })
            .into_response()
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(AuditError::Storage(RepositoryError::Database("down".into())))
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
