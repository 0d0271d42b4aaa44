// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod approval_service;
pub mod audit_store;
pub mod governance_gate;
pub mod guardrail;
pub mod monitor;
pub mod policy_engine;
pub mod repository_factory;
pub mod services;

pub use approval_service::{ApprovalService, ApprovalSettings};
pub use audit_store::{AppendReceipt, AuditError, HashChainedAuditStore};
pub use governance_gate::{GateOutcome, GovernanceError, GovernanceGate, ToolInvocation};
pub use guardrail::{BlastRadius, BlastRadiusGuardrail, GuardrailOutcome};
pub use monitor::Monitor;
pub use policy_engine::PolicyEngine;
pub use services::{GovernanceServices, ServiceOptions};
