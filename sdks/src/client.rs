// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bulwark_core::application::monitor::feed::{FeedError, PollSource};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::types::*;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid URL: {0}")]
    Url(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{code} ({status}): {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
    },
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Http(e) => e.status(),
            ClientError::Url(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Client for the bulwark control-plane API.
#[derive(Clone)]
pub struct GovernanceClient {
    base_url: String,
    client: Client,
    api_key: Option<String>,
}

impl GovernanceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            api_key: None,
        }
    }

    /// Set the API key sent as a bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str, params: &[(&'static str, String)]) -> Result<Url> {
        let raw = format!("{}{}", self.base_url, path);
        let parsed = if params.is_empty() {
            Url::parse(&raw)
        } else {
            Url::parse_with_params(&raw, params)
        };
        parsed.map_err(|e| ClientError::Url(format!("{}: {}", raw, e)))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, params: &[(&'static str, String)]) -> Result<T> {
        let url = self.url(path, params)?;
        debug!(%url, "GET");
        let response = self.authorize(self.client.get(url)).send().await?;
        decode(response).await
    }

    async fn post<B: serde::Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path, &[])?;
        debug!(%url, "POST");
        let response = self.authorize(self.client.post(url).json(body)).send().await?;
        decode(response).await
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        self.get("/health", &[]).await
    }

    pub async fn append_event(&self, event: &NewAuditEvent) -> Result<AppendReceipt> {
        self.post("/v1/events", event).await
    }

    pub async fn query_events(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let list: EventList = self.get("/v1/events", &audit_query_pairs(query)).await?;
        Ok(list.events)
    }

    pub async fn get_event(&self, event_id: &str) -> Result<AuditEvent> {
        self.get(&format!("/v1/events/{}", event_id), &[]).await
    }

    pub async fn trace(&self, trace_id: &str) -> Result<Vec<AuditEvent>> {
        let trace: TraceEvents = self.get(&format!("/v1/traces/{}", trace_id), &[]).await?;
        Ok(trace.events)
    }

    pub async fn verify(&self) -> Result<IntegrityReport> {
        self.get("/v1/verify", &[]).await
    }

    pub async fn create_approval(&self, request: &NewApprovalRequest) -> Result<ApprovalCreated> {
        self.post("/v1/approvals", request).await
    }

    pub async fn list_approvals(&self, filter: &ApprovalFilter) -> Result<Vec<ApprovalRequest>> {
        self.get("/v1/approvals", &approval_filter_pairs(filter)).await
    }

    pub async fn pending_approvals(&self) -> Result<Vec<ApprovalRequest>> {
        self.get("/v1/approvals/pending", &[]).await
    }

    pub async fn get_approval(&self, id: ApprovalId) -> Result<ApprovalRequest> {
        self.get(&format!("/v1/approvals/{}", id), &[]).await
    }

    /// Long-poll until the request is resolved or `timeout` passes. The
    /// server caps the wait; a still-pending request is returned as such.
    pub async fn wait_for_approval(&self, id: ApprovalId, timeout: Duration) -> Result<ApprovalRequest> {
        self.get(
            &format!("/v1/approvals/{}/wait", id),
            &[("timeout", timeout.as_secs().to_string())],
        )
        .await
    }

    pub async fn resolve_approval(
        &self,
        id: ApprovalId,
        resolution: Resolution,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<ApprovalRequest> {
        let verb = match resolution {
            Resolution::Approve => "approve",
            Resolution::Deny => "deny",
            Resolution::Cancel => "cancel",
        };
        let body = serde_json::json!({ "actor": actor, "reason": reason });
        self.post(&format!("/v1/approvals/{}/{}", id, verb), &body).await
    }

    pub async fn approve(&self, id: ApprovalId, actor: &str, reason: Option<&str>) -> Result<ApprovalRequest> {
        self.resolve_approval(id, Resolution::Approve, actor, reason).await
    }

    pub async fn deny(&self, id: ApprovalId, actor: &str, reason: Option<&str>) -> Result<ApprovalRequest> {
        self.resolve_approval(id, Resolution::Deny, actor, reason).await
    }

    pub async fn cancel(&self, id: ApprovalId, actor: &str, reason: Option<&str>) -> Result<ApprovalRequest> {
        self.resolve_approval(id, Resolution::Cancel, actor, reason).await
    }

    /// Evaluate a hypothetical request. Nothing is recorded.
    pub async fn explain(&self, query: &ExplainQuery) -> Result<DecisionTrace> {
        self.get("/v1/governance/explain", &query.query_pairs()).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => Err(ClientError::Api {
            status,
            code: err.code,
            message: err.error,
        }),
        Err(_) => Err(ClientError::Api {
            status,
            code: status.canonical_reason().unwrap_or("UNKNOWN").to_string(),
            message: body,
        }),
    }
}

/// Lets the monitor fall back to polling the API.
#[async_trait]
impl PollSource for GovernanceClient {
    async fn events_after(
        &self,
        since: DateTime<Utc>,
        after: Option<&EventId>,
        limit: usize,
    ) -> std::result::Result<Vec<AuditEvent>, FeedError> {
        let query = AuditQuery {
            since: Some(since),
            after: after.cloned(),
            limit: Some(limit),
            ..Default::default()
        };
        self.query_events(&query)
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_health() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"healthy","version":"0.4.0","uptime_seconds":12,"enforcing":true,"policy_count":3}"#)
            .create_async()
            .await;

        let client = GovernanceClient::new(server.url());
        let health = client.health().await.unwrap();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.policy_count, 3);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error_is_typed() {
        let mut server = mockito::Server::new_async().await;
        let id = ApprovalId::new();
        server
            .mock("POST", format!("/v1/approvals/{}/approve", id).as_str())
            .match_body(Matcher::PartialJson(serde_json::json!({"actor": "alice"})))
            .with_status(409)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"Conflict: already resolved","code":"CONFLICT"}"#)
            .create_async()
            .await;

        let client = GovernanceClient::new(server.url());
        let err = client.approve(id, "alice", None).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::CONFLICT));
        assert!(matches!(err, ClientError::Api { ref code, .. } if code == "CONFLICT"));
    }

    #[tokio::test]
    async fn test_poll_source_sends_cursor_and_limit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/events")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("limit".into(), "50".into()),
                Matcher::UrlEncoded("after".into(), "tool_abc".into()),
                Matcher::Regex("since=".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"count":0,"events":[]}"#)
            .create_async()
            .await;

        let client = GovernanceClient::new(server.url());
        let after = EventId("tool_abc".into());
        let events = client.events_after(Utc::now(), Some(&after), 50).await.unwrap();
        assert!(events.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let client = GovernanceClient::new("http://127.0.0.1:9");
        let err = client.events_after(Utc::now(), None, 10).await.unwrap_err();
        assert!(matches!(err, FeedError::Transport(_)));
    }
}
