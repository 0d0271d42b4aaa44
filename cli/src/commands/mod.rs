// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the bulwark CLI

pub mod approvals;
pub mod config;
pub mod events;
pub mod governance;
pub mod monitor;

pub use self::approvals::ApprovalCommand;
pub use self::config::ConfigCommand;
pub use self::events::EventsCommand;
pub use self::governance::ExplainArgs;
pub use self::monitor::MonitorArgs;

use anyhow::Result;
use serde::Serialize;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
