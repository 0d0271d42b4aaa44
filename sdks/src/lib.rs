// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! bulwark Rust SDK
//!
//! Typed client for the governance control-plane API: audit events,
//! approvals and hypothetical policy decisions.

pub mod client;
pub mod types;

pub use client::{ClientError, GovernanceClient};
pub use types::*;
