// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # bulwark-core
//!
//! Governance layer for autonomous infrastructure agents. Every tool call
//! an agent makes passes through the [`application::GovernanceGate`]:
//! the policy engine decides, the approval workflow holds risky actions
//! for humans, the blast-radius guardrail withholds oversized results,
//! and everything lands in a tamper-evident, hash-chained audit log that
//! the real-time monitor watches.
//!
//! ## Layers
//!
//! - [`domain`]: events, policies, approvals, alerts and repository traits
//! - [`application`]: audit store, policy engine, approvals, gate, monitor
//! - [`infrastructure`]: PostgreSQL and in-memory repositories, event bus,
//!   notification sinks, stream socket
//! - [`presentation`]: the control-plane HTTP API

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
