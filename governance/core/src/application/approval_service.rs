// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Approval Service - human-in-the-loop gate for `require_approval` decisions
//!
//! Sole writer of `ApprovalRequest.status`. Manages creation with
//! best-effort notification, lazy expiry on every read path, quorum voting,
//! and the bounded long-poll wait used by calling agents.
//!
//! # Waiting
//!
//! `wait_for_resolution` never busy-polls. It parks on a broadcast channel
//! of resolved ids and wakes on whichever comes first: a resolution of the
//! awaited request, the request's own expiry instant, the storage re-check
//! period (resolutions made by another replica), the capped deadline, or
//! caller cancellation.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::alert::Notification;
use crate::domain::approval::{
    ApprovalError, ApprovalFilter, ApprovalId, ApprovalRequest, ApprovalStatus, NewApprovalRequest, Resolution,
};
use crate::domain::clock::Clock;
use crate::domain::governance_config::{ApprovalConfig, MAX_APPROVAL_WINDOW_MINUTES};
use crate::domain::repository::{ApprovalRepository, RepositoryError};
use crate::infrastructure::notifications::NotificationDispatcher;

impl From<RepositoryError> for ApprovalError {
    fn from(err: RepositoryError) -> Self {
        ApprovalError::Storage(err.to_string())
    }
}

/// Timing knobs of the workflow.
#[derive(Debug, Clone)]
pub struct ApprovalSettings {
    /// `expires_at = created_at + window`
    pub window: chrono::Duration,
    /// Hard cap on a single wait call.
    pub max_wait: Duration,
    pub recheck_interval: Duration,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            window: chrono::Duration::minutes(60),
            max_wait: Duration::from_secs(120),
            recheck_interval: Duration::from_secs(5),
        }
    }
}

impl From<&ApprovalConfig> for ApprovalSettings {
    fn from(config: &ApprovalConfig) -> Self {
        Self {
            window: chrono::Duration::try_minutes(config.window_minutes.clamp(1, MAX_APPROVAL_WINDOW_MINUTES))
                .unwrap_or_else(|| chrono::Duration::hours(1)),
            max_wait: Duration::from_secs(config.max_wait_seconds),
            recheck_interval: Duration::from_secs(config.recheck_interval_seconds.max(1)),
        }
    }
}

pub struct ApprovalService {
    repository: Arc<dyn ApprovalRepository>,
    notifier: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    settings: ApprovalSettings,
    resolved_tx: broadcast::Sender<ApprovalId>,
    /// Serializes read-modify-write of votes within this process.
    resolve_lock: Mutex<()>,
}

impl ApprovalService {
    pub fn new(
        repository: Arc<dyn ApprovalRepository>,
        notifier: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        settings: ApprovalSettings,
    ) -> Self {
        let (resolved_tx, _) = broadcast::channel(256);
        Self {
            repository,
            notifier,
            clock,
            settings,
            resolved_tx,
            resolve_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ApprovalSettings {
        &self.settings
    }

    pub async fn create(&self, new: NewApprovalRequest) -> Result<ApprovalRequest, ApprovalError> {
        let request = ApprovalRequest::create(new, self.clock.now(), self.settings.window)?;
        self.repository.insert(&request).await?;

        info!(
            approval_id = %request.approval_id,
            requested_by = %request.requested_by,
            action_class = %request.action_class,
            resource = %request.resource_name,
            expires_at = %request.expires_at,
            "Approval requested"
        );

        // Notification failure never fails creation.
        self.notifier.notify(Notification::approval_requested(&request));
        Ok(request)
    }

    /// Fetch a request, applying and persisting lazy expiry.
    pub async fn get(&self, id: ApprovalId) -> Result<ApprovalRequest, ApprovalError> {
        let request = self
            .repository
            .find_by_id(id)
            .await?
            .ok_or(ApprovalError::NotFound(id))?;
        self.observe(request, self.clock.now()).await
    }

    async fn observe(&self, mut request: ApprovalRequest, now: DateTime<Utc>) -> Result<ApprovalRequest, ApprovalError> {
        if !request.observe(now) {
            return Ok(request);
        }
        if self.repository.update_if_status(&request, ApprovalStatus::Pending).await? {
            info!(approval_id = %request.approval_id, "Approval expired");
            metrics::counter!("bulwark_approvals_resolved_total", "status" => "expired").increment(1);
            let _ = self.resolved_tx.send(request.approval_id);
            Ok(request)
        } else {
            // Someone resolved it first; their write wins.
            self.repository
                .find_by_id(request.approval_id)
                .await?
                .ok_or(ApprovalError::NotFound(request.approval_id))
        }
    }

    pub async fn list(&self, filter: &ApprovalFilter) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let now = self.clock.now();
        let found = self.repository.list(filter, now).await?;
        let mut out = Vec::with_capacity(found.len());
        for request in found {
            out.push(self.observe(request, now).await?);
        }
        Ok(out)
    }

    pub async fn pending(&self) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        self.list(&ApprovalFilter::pending()).await
    }

    /// Apply an approve/deny/cancel. Resolving a terminal request is an
    /// error and leaves it untouched.
    pub async fn resolve(
        &self,
        id: ApprovalId,
        resolution: Resolution,
        actor: &str,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        if actor.trim().is_empty() {
            return Err(ApprovalError::Invalid("actor cannot be empty".into()));
        }

        let _guard = self.resolve_lock.lock().await;
        let now = self.clock.now();
        let mut request = self.get(id).await?;
        let expected = request.status;
        request.resolve(resolution, actor, reason, now)?;

        if !self.repository.update_if_status(&request, expected).await? {
            let current = self.get(id).await?;
            warn!(approval_id = %id, status = %current.status, "Concurrent resolution lost the race");
            return Err(ApprovalError::AlreadyResolved { id, status: current.status });
        }

        if request.status.is_terminal() {
            info!(
                approval_id = %id,
                status = %request.status,
                actor = %actor,
                "Approval resolved"
            );
            metrics::counter!("bulwark_approvals_resolved_total", "status" => request.status.as_str()).increment(1);
        } else {
            info!(
                approval_id = %id,
                actor = %actor,
                remaining = request.approvals_remaining(),
                "Approval vote recorded"
            );
        }
        let _ = self.resolved_tx.send(id);
        Ok(request)
    }

    /// Long-poll for a terminal state, capped at the configured maximum.
    /// Returns the current (possibly still pending) request when the wait
    /// times out.
    pub async fn wait_for_resolution(&self, id: ApprovalId, timeout: Duration) -> Result<ApprovalRequest, ApprovalError> {
        self.wait_for_resolution_until_cancelled(id, timeout, &CancellationToken::new())
            .await
    }

    pub async fn wait_for_resolution_until_cancelled(
        &self,
        id: ApprovalId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let timeout = timeout.min(self.settings.max_wait);
        let deadline = Instant::now() + timeout;
        // Subscribe before the first read so a resolution in between is not missed.
        let mut resolved = self.resolved_tx.subscribe();

        loop {
            let current = self.get(id).await?;
            let started = Instant::now();
            if current.status.is_terminal() || started >= deadline {
                return Ok(current);
            }

            let until_expiry = (current.expires_at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let wake_at = deadline
                .min(started + until_expiry)
                .min(started + self.settings.recheck_interval);
            debug!(approval_id = %id, "Waiting for approval resolution");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ApprovalError::WaitCancelled(id));
                    }
                    _ = tokio::time::sleep_until(wake_at) => break,
                    message = resolved.recv() => match message {
                        Ok(resolved_id) if resolved_id == id => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => {
                            tokio::time::sleep_until(wake_at).await;
                            break;
                        }
                    },
                }
            }
        }
    }
}
