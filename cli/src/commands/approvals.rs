// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Approval workflow commands
//!
//! Commands: list, get, approve, deny, cancel, wait

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::time::Duration;

use bulwark_sdk::{ApprovalFilter, ApprovalId, ApprovalRequest, ApprovalStatus, GovernanceClient, Resolution};

use super::print_json;

#[derive(Subcommand)]
pub enum ApprovalCommand {
    /// List approval requests (pending by default)
    List {
        /// Filter by status; `all` lists every request
        #[arg(long, default_value = "pending")]
        status: String,

        #[arg(long)]
        agent: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Show one approval request
    Get {
        #[arg(value_name = "APPROVAL_ID")]
        id: ApprovalId,
    },

    /// Approve a pending request
    Approve {
        #[arg(value_name = "APPROVAL_ID")]
        id: ApprovalId,

        /// Approver identity
        #[arg(long = "by", env = "BULWARK_OPERATOR")]
        actor: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Deny a pending request
    Deny {
        #[arg(value_name = "APPROVAL_ID")]
        id: ApprovalId,

        #[arg(long = "by", env = "BULWARK_OPERATOR")]
        actor: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Cancel a pending request (requester only)
    Cancel {
        #[arg(value_name = "APPROVAL_ID")]
        id: ApprovalId,

        #[arg(long = "by", env = "BULWARK_OPERATOR")]
        actor: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Block until a request is resolved or the timeout passes
    Wait {
        #[arg(value_name = "APPROVAL_ID")]
        id: ApprovalId,

        /// Seconds; the server caps each wait
        #[arg(short, long, default_value = "120")]
        timeout: u64,
    },
}

pub async fn handle_command(command: ApprovalCommand, client: &GovernanceClient) -> Result<()> {
    match command {
        ApprovalCommand::List {
            status,
            agent,
            limit,
            json,
        } => {
            let status = match status.as_str() {
                "all" => None,
                other => Some(other.parse::<ApprovalStatus>().map_err(anyhow::Error::msg)?),
            };
            let filter = ApprovalFilter { status, agent, limit };
            let approvals = client.list_approvals(&filter).await.context("Failed to list approvals")?;
            if json {
                return print_json(&approvals);
            }
            if approvals.is_empty() {
                println!("{}", "No approval requests".dimmed());
            }
            for approval in &approvals {
                print_summary(approval);
            }
            Ok(())
        }
        ApprovalCommand::Get { id } => {
            let approval = client.get_approval(id).await.context("Failed to fetch approval")?;
            print_json(&approval)
        }
        ApprovalCommand::Approve { id, actor, reason } => resolve(client, id, Resolution::Approve, &actor, reason).await,
        ApprovalCommand::Deny { id, actor, reason } => resolve(client, id, Resolution::Deny, &actor, reason).await,
        ApprovalCommand::Cancel { id, actor, reason } => resolve(client, id, Resolution::Cancel, &actor, reason).await,
        ApprovalCommand::Wait { id, timeout } => {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let approval = client
                    .wait_for_approval(id, remaining)
                    .await
                    .context("Failed to wait for approval")?;
                if approval.status.is_terminal() || remaining.as_secs() == 0 {
                    print_summary(&approval);
                    return Ok(());
                }
            }
        }
    }
}

async fn resolve(
    client: &GovernanceClient,
    id: ApprovalId,
    resolution: Resolution,
    actor: &str,
    reason: Option<String>,
) -> Result<()> {
    let approval = client
        .resolve_approval(id, resolution, actor, reason.as_deref())
        .await
        .with_context(|| format!("Failed to resolve approval {}", id))?;
    print_summary(&approval);
    if approval.status == ApprovalStatus::Pending {
        println!(
            "  {} of {} approval(s) recorded",
            approval.approvals.len(),
            approval.required_approvals
        );
    }
    Ok(())
}

fn print_summary(approval: &ApprovalRequest) {
    let status = match approval.status {
        ApprovalStatus::Pending => approval.status.to_string().yellow(),
        ApprovalStatus::Approved => approval.status.to_string().green(),
        _ => approval.status.to_string().red(),
    };
    println!(
        "{}  {:<9} {} {} '{}' requested by {} (expires {})",
        approval.approval_id.to_string().bold(),
        status,
        approval.action_class,
        approval.resource_type,
        approval.resource_name,
        approval.requested_by,
        approval.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(explanation) = &approval.explanation {
        println!("  {}", explanation.dimmed());
    }
}
