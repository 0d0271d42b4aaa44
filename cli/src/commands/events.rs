// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Audit event commands
//!
//! Commands: list, get, trace

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::Colorize;

use bulwark_sdk::{ActionClass, AuditEvent, AuditQuery, EventType, GovernanceClient};
use bulwark_core::domain::audit::EventPayload;

use super::print_json;

#[derive(Subcommand)]
pub enum EventsCommand {
    /// Query audit events
    List {
        #[arg(long)]
        session: Option<String>,

        #[arg(long)]
        trace: Option<String>,

        /// Event type (tool_call, policy_decision, ...)
        #[arg(long = "type", value_name = "TYPE")]
        event_type: Option<EventType>,

        #[arg(long)]
        agent: Option<String>,

        /// Action class (read, write, destructive, ...)
        #[arg(long)]
        action: Option<ActionClass>,

        /// RFC 3339 lower bound on the event timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        #[arg(short, long, default_value = "50")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show one event
    Get {
        #[arg(value_name = "EVENT_ID")]
        event_id: String,
    },

    /// Show every event of a trace in order
    Trace {
        #[arg(value_name = "TRACE_ID")]
        trace_id: String,

        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: EventsCommand, client: &GovernanceClient) -> Result<()> {
    match command {
        EventsCommand::List {
            session,
            trace,
            event_type,
            agent,
            action,
            since,
            limit,
            json,
        } => {
            let query = AuditQuery {
                session_id: session,
                trace_id: trace,
                event_type,
                agent,
                action_class: action,
                since,
                after: None,
                limit: Some(limit),
            };
            let events = client.query_events(&query).await.context("Failed to query events")?;
            if json {
                return print_json(&events);
            }
            print_events(&events);
            Ok(())
        }
        EventsCommand::Get { event_id } => {
            let event = client.get_event(&event_id).await.context("Failed to fetch event")?;
            print_json(&event)
        }
        EventsCommand::Trace { trace_id, json } => {
            let events = client.trace(&trace_id).await.context("Failed to fetch trace")?;
            if json {
                return print_json(&events);
            }
            println!("{} {}", "Trace".bold(), trace_id);
            print_events(&events);
            Ok(())
        }
    }
}

fn print_events(events: &[AuditEvent]) {
    if events.is_empty() {
        println!("{}", "No events found".dimmed());
        return;
    }
    for event in events {
        println!(
            "{}  {}  {:<20} {:<14} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.event_id.as_str().dimmed(),
            event.event_type().as_str(),
            event.agent,
            summary(event)
        );
    }
}

fn summary(event: &AuditEvent) -> String {
    match &event.payload {
        EventPayload::ToolCall { tool_name, success, .. } => {
            let status = if *success { "ok".green() } else { "failed".red() };
            format!("{} [{}]", tool_name, status)
        }
        EventPayload::PolicyDecision {
            effect,
            resource_name,
            action,
            ..
        } => format!("{} {} -> {}", action, resource_name, effect),
        EventPayload::DelegationDecision { target_agent, .. } => format!("delegated to {}", target_agent),
        EventPayload::Reasoning { content } => content.chars().take(60).collect(),
        EventPayload::GovernanceViolation { module, severity, .. } => format!("{} [{}]", module, severity),
    }
}
