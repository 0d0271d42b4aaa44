// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Governance Gate
//!
//! The per-tool-call control flow a calling agent runs in-process:
//!
//! ```text
//! preflight -> evaluate -> audit decision -> [approval + wait] -> execute
//!           -> audit tool call -> blast-radius re-check -> [audit post-execution deny]
//! ```
//!
//! Policy denials and unapproved actions are returned as [`GateOutcome`]
//! values carrying the full explanation. Errors are reserved for
//! governance itself being unavailable. In enforcing mode a failed audit
//! write stops the action and is reported through the notification
//! dispatcher before the error surfaces, since the audit path is the
//! broken channel.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::approval_service::ApprovalService;
use crate::application::audit_store::{AuditError, HashChainedAuditStore};
use crate::application::guardrail::{BlastRadiusGuardrail, GuardrailOutcome};
use crate::application::policy_engine::PolicyEngine;
use crate::domain::alert::Notification;
use crate::domain::approval::{ApprovalError, ApprovalRequest, ApprovalStatus, NewApprovalRequest};
use crate::domain::audit::{EventId, EventPayload, NewAuditEvent};
use crate::domain::policy::{ActionClass, Decision, Effect, PolicyRequest};
use crate::infrastructure::inventory::{enrich_resource, InventoryLookup};
use crate::infrastructure::notifications::NotificationDispatcher;

#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("Governance unavailable: {0}")]
    Unavailable(String),

    #[error("Audit write failed, action blocked: {0}")]
    AuditUnavailable(#[source] AuditError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),
}

/// One governed tool call, as described by the calling agent.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub session_id: String,
    pub trace_id: Option<String>,
    pub agent: String,
    pub tool_name: String,
    pub params: Value,
    pub request: PolicyRequest,
    /// Snapshot attached to an approval request, e.g. the resource state before mutation.
    pub approval_context: Value,
}

impl ToolInvocation {
    pub fn new(
        session_id: impl Into<String>,
        agent: impl Into<String>,
        tool_name: impl Into<String>,
        request: PolicyRequest,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            trace_id: request.context.trace_id.clone(),
            agent: agent.into(),
            tool_name: tool_name.into(),
            params: Value::Null,
            request,
            approval_context: Value::Null,
        }
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        let trace_id = trace_id.into();
        self.request.context.trace_id = Some(trace_id.clone());
        self.trace_id = Some(trace_id);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_approval_context(mut self, context: Value) -> Self {
        self.approval_context = context;
        self
    }

    fn event(&self, payload: EventPayload) -> NewAuditEvent {
        let mut event = NewAuditEvent::new(&self.session_id, &self.agent, payload).with_action_class(self.request.action);
        event.trace_id = self.trace_id.clone();
        event
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Tool ran and its output may be used.
    Completed { decision: Decision, output: String },
    /// Policy said no; the tool never ran.
    Denied { decision: Decision },
    /// Approval ended denied, expired or cancelled; the tool never ran.
    ApprovalNotGranted { decision: Decision, approval: ApprovalRequest },
    /// Tool ran but its observed scope exceeded a limit. Output discarded.
    Withheld { decision: Decision },
    /// Tool itself failed.
    Failed { decision: Decision, error: String },
}

impl GateOutcome {
    /// Text to relay verbatim to the operator.
    pub fn explanation(&self) -> String {
        match self {
            GateOutcome::Completed { decision, .. }
            | GateOutcome::Denied { decision }
            | GateOutcome::Withheld { decision }
            | GateOutcome::Failed { decision, .. } => decision.explanation.clone(),
            GateOutcome::ApprovalNotGranted { decision, approval } => {
                let mut text = format!("Approval {} {}", approval.approval_id, approval.status);
                if let Some(actor) = &approval.denied_by {
                    text.push_str(&format!(" by {}", actor));
                }
                if let Some(reason) = &approval.reason {
                    text.push_str(&format!(": {}", reason));
                }
                format!("{}. {}", text, decision.explanation)
            }
        }
    }

    pub fn output(&self) -> Option<&str> {
        match self {
            GateOutcome::Completed { output, .. } => Some(output),
            _ => None,
        }
    }
}

pub struct GovernanceGate {
    audit: Arc<HashChainedAuditStore>,
    engine: Arc<PolicyEngine>,
    approvals: Arc<ApprovalService>,
    guardrail: BlastRadiusGuardrail,
    inventory: Option<Arc<dyn InventoryLookup>>,
    notifier: NotificationDispatcher,
    enforcing: bool,
}

impl GovernanceGate {
    pub fn new(
        audit: Arc<HashChainedAuditStore>,
        engine: Arc<PolicyEngine>,
        approvals: Arc<ApprovalService>,
        notifier: NotificationDispatcher,
        enforcing: bool,
    ) -> Self {
        Self {
            audit,
            guardrail: BlastRadiusGuardrail::new(engine.clone()),
            engine,
            approvals,
            inventory: None,
            notifier,
            enforcing,
        }
    }

    pub fn with_inventory(mut self, inventory: Arc<dyn InventoryLookup>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn is_enforcing(&self) -> bool {
        self.enforcing
    }

    /// Hot-path check run before every governed call. Configuration only,
    /// no I/O.
    pub fn preflight(&self, action: ActionClass) -> Result<(), GovernanceError> {
        if !self.enforcing || !action.is_mutating() {
            return Ok(());
        }
        let config = self.engine.config();
        if config.policies.is_empty() && config.default_effect == Effect::Allow {
            return Err(GovernanceError::Unavailable(
                "no policies loaded and the default effect allows every action".into(),
            ));
        }
        Ok(())
    }

    /// Startup check. A failure here means destructive tools must not be served.
    pub async fn startup_check(&self) -> Result<(), GovernanceError> {
        self.preflight(ActionClass::Destructive)?;
        if let Err(e) = self.audit.load_tip().await {
            if self.enforcing {
                return Err(self.report_audit_failure(e).await);
            }
            warn!(error = %e, "Audit store unreachable at startup, continuing in permissive mode");
        }
        info!(
            enforcing = self.enforcing,
            policies = self.engine.policy_count(),
            "Governance gate ready"
        );
        Ok(())
    }

    /// Govern and run one tool call.
    pub async fn execute<F, Fut, E>(
        &self,
        mut invocation: ToolInvocation,
        cancel: &CancellationToken,
        tool: F,
    ) -> Result<GateOutcome, GovernanceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: std::fmt::Display,
    {
        self.preflight(invocation.request.action)?;
        if let Some(inventory) = &self.inventory {
            enrich_resource(inventory.as_ref(), &mut invocation.request.resource).await;
        }

        let decision = self.engine.evaluate(&invocation.request);
        metrics::counter!("bulwark_policy_decisions_total", "effect" => decision.effect.as_str()).increment(1);
        let decision_event = self.record(invocation.event(decision_payload(&invocation, &decision, None))).await?;

        let decision = match decision.effect {
            Effect::Deny => {
                info!(
                    agent = %invocation.agent,
                    tool = %invocation.tool_name,
                    explanation = %decision.explanation,
                    "Tool call denied by policy"
                );
                return Ok(GateOutcome::Denied { decision });
            }
            Effect::RequireApproval => {
                let approval = self
                    .await_approval(&invocation, &decision, decision_event, cancel)
                    .await?;
                if approval.status != ApprovalStatus::Approved {
                    return Ok(GateOutcome::ApprovalNotGranted { decision, approval });
                }
                let approved = approved_decision(&decision, &approval);
                self.record(invocation.event(decision_payload(
                    &invocation,
                    &approved,
                    Some(approval.approval_id.to_string()),
                )))
                .await?;
                approved
            }
            Effect::Allow => decision,
        };

        let started = Instant::now();
        let result = tool().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let error = e.to_string();
                self.record(invocation.event(EventPayload::ToolCall {
                    tool_name: invocation.tool_name.clone(),
                    params: invocation.params.clone(),
                    result: Some(error.clone()),
                    duration_ms,
                    success: false,
                }))
                .await?;
                return Ok(GateOutcome::Failed { decision, error });
            }
        };

        let guardrail = self.guardrail.check(&invocation.request, &output);
        let withheld = guardrail.is_withheld();
        self.record(invocation.event(EventPayload::ToolCall {
            tool_name: invocation.tool_name.clone(),
            params: invocation.params.clone(),
            result: if withheld { None } else { Some(output.clone()) },
            duration_ms,
            success: true,
        }))
        .await?;

        if let GuardrailOutcome::Withheld { decision: post, .. } = guardrail {
            metrics::counter!("bulwark_policy_decisions_total", "effect" => post.effect.as_str()).increment(1);
            self.record(invocation.event(decision_payload(&invocation, &post, None)))
                .await?;
            return Ok(GateOutcome::Withheld { decision: post });
        }

        Ok(GateOutcome::Completed { decision, output })
    }

    async fn await_approval(
        &self,
        invocation: &ToolInvocation,
        decision: &Decision,
        decision_event: Option<EventId>,
        cancel: &CancellationToken,
    ) -> Result<ApprovalRequest, GovernanceError> {
        let request = &invocation.request;
        let created = self
            .approvals
            .create(NewApprovalRequest {
                requested_by: invocation.agent.clone(),
                action_class: request.action,
                resource_type: request.resource.resource_type.clone(),
                resource_name: request.resource.name.clone(),
                event_id: decision_event.map(|id| id.to_string()),
                trace_id: invocation.trace_id.clone(),
                explanation: Some(decision.explanation.clone()),
                required_approvals: decision.required_approvals.unwrap_or(1),
                request_context: invocation.approval_context.clone(),
            })
            .await?;

        // Each wait is capped by the service; re-issue until the request
        // is terminal. Expiry guarantees termination.
        let max_wait = self.approvals.settings().max_wait;
        loop {
            let current = self
                .approvals
                .wait_for_resolution_until_cancelled(created.approval_id, max_wait, cancel)
                .await?;
            if current.status.is_terminal() {
                info!(
                    approval_id = %current.approval_id,
                    status = %current.status,
                    "Approval wait finished"
                );
                return Ok(current);
            }
            if max_wait.is_zero() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    /// Append an event. In enforcing mode a failure blocks the action;
    /// otherwise it is logged and the call proceeds.
    async fn record(&self, event: NewAuditEvent) -> Result<Option<EventId>, GovernanceError> {
        match self.audit.append(event).await {
            Ok(receipt) => Ok(Some(receipt.event_id)),
            Err(e) if self.enforcing => Err(self.report_audit_failure(e).await),
            Err(e) => {
                warn!(error = %e, "Audit write failed, continuing in permissive mode");
                Ok(None)
            }
        }
    }

    async fn report_audit_failure(&self, err: AuditError) -> GovernanceError {
        error!(error = %err, "Audit store unavailable in enforcing mode, blocking action");
        let delivered = self
            .notifier
            .notify_and_wait(&Notification::governance_unavailable("audit", &err.to_string()))
            .await;
        if delivered == 0 {
            error!("Governance-unavailable notification reached no sink");
        }
        GovernanceError::AuditUnavailable(err)
    }
}

fn decision_payload(invocation: &ToolInvocation, decision: &Decision, approval_id: Option<String>) -> EventPayload {
    EventPayload::PolicyDecision {
        resource_type: invocation.request.resource.resource_type.clone(),
        resource_name: invocation.request.resource.name.clone(),
        action: invocation.request.action,
        effect: decision.effect,
        policy_name: decision.policy_name.clone(),
        rule_index: decision.rule_index,
        explanation: decision.explanation.clone(),
        post_execution: decision.post_execution,
        approval_id,
    }
}

fn approved_decision(decision: &Decision, approval: &ApprovalRequest) -> Decision {
    let mut approved = decision.clone();
    approved.effect = Effect::Allow;
    approved.explanation = format!(
        "Approved by {} (approval {}). {}",
        approval.approved_by.as_deref().unwrap_or("unknown"),
        approval.approval_id,
        decision.explanation
    );
    approved
}
