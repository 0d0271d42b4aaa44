// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Chain verification and policy explanation commands

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use bulwark_core::application::{GovernanceServices, PolicyEngine};
use bulwark_core::domain::governance_config::GovernanceConfigManifest;
use bulwark_core::domain::policy::{Principal, PolicyRequest, Resource};
use bulwark_core::infrastructure::policy_loader::PolicyLoader;
use bulwark_sdk::{ActionClass, DecisionTrace, ExplainQuery, GovernanceClient, IntegrityReport};

use super::print_json;

/// Verify the audit hash chain, through the API or directly against storage.
pub async fn verify(client: &GovernanceClient, manifest: &GovernanceConfigManifest, local: bool, json: bool) -> Result<()> {
    let report = if local {
        let services = GovernanceServices::from_manifest(manifest)
            .await
            .context("Failed to open governance storage")?;
        services.audit.verify_integrity().await?
    } else {
        client.verify().await.context("Failed to verify audit chain")?
    };

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    if !report.valid {
        bail!("Audit chain integrity check failed");
    }
    Ok(())
}

fn print_report(report: &IntegrityReport) {
    if report.valid {
        println!("{} {} events verified", "✓".green(), report.total_events);
    } else {
        println!("{} audit chain is broken", "✗".red().bold());
        if let Some(index) = report.first_broken_index {
            println!("  First broken link at index {}", index);
        }
        if let Some(id) = &report.first_invalid_id {
            println!("  Event: {}", id);
        }
        if let Some(error) = &report.error {
            println!("  {}", error);
        }
    }
    if report.legacy_events > 0 {
        println!(
            "  {} legacy event(s) without hashes were skipped",
            report.legacy_events.to_string().yellow()
        );
    }
}

#[derive(Debug, Args)]
pub struct ExplainArgs {
    /// Resource type, e.g. database or kubernetes_namespace
    #[arg(value_name = "TYPE")]
    pub resource_type: String,

    /// Resource name
    #[arg(value_name = "NAME")]
    pub resource_name: String,

    /// Action class (read, write, destructive, ...)
    #[arg(value_name = "ACTION")]
    pub action: ActionClass,

    /// Resource tag as key=value; repeatable
    #[arg(long = "tag", value_name = "KEY=VALUE")]
    pub tags: Vec<String>,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub role: Option<String>,

    /// Observed rows affected
    #[arg(long)]
    pub rows: Option<u64>,

    /// Observed resources affected
    #[arg(long)]
    pub resources: Option<u64>,

    /// Evaluate against a local policy file instead of the server
    #[arg(long, value_name = "FILE")]
    pub policy: Option<PathBuf>,

    #[arg(long)]
    pub json: bool,
}

impl ExplainArgs {
    fn to_query(&self) -> Result<ExplainQuery> {
        let mut query = ExplainQuery::new(&self.resource_type, &self.resource_name, self.action);
        for tag in &self.tags {
            let (key, value) = tag
                .split_once('=')
                .with_context(|| format!("Tag '{}' is not key=value", tag))?;
            query = query.with_tag(key, value);
        }
        query.user = self.user.clone();
        query.role = self.role.clone();
        query.rows_affected = self.rows;
        query.resources_affected = self.resources;
        Ok(query)
    }
}

fn local_request(query: &ExplainQuery) -> PolicyRequest {
    let mut resource = Resource::new(&query.resource_type, &query.resource_name);
    resource.tags = query.tags.clone();
    let mut principal = Principal::new(query.user.clone().unwrap_or_else(|| "anonymous".to_string()));
    if let Some(role) = &query.role {
        principal = principal.with_role(role);
    }
    let mut request = PolicyRequest::new(principal, resource, query.action);
    request.context.rows_affected = query.rows_affected;
    request.context.resources_affected = query.resources_affected;
    request
}

/// Evaluate locally when `--policy` is given, otherwise ask the server.
async fn evaluate(args: &ExplainArgs, client: &GovernanceClient) -> Result<DecisionTrace> {
    let query = args.to_query()?;
    match &args.policy {
        Some(path) => {
            let config = PolicyLoader::from_file(path)
                .with_context(|| format!("Failed to load policy file {}", path.display()))?;
            Ok(PolicyEngine::new(config).explain(&local_request(&query)))
        }
        None => client.explain(&query).await.context("Failed to explain decision"),
    }
}

pub async fn explain(args: ExplainArgs, client: &GovernanceClient) -> Result<()> {
    let trace = evaluate(&args, client).await?;
    if args.json {
        return print_json(&trace);
    }
    print_trace(&trace);
    Ok(())
}

fn print_trace(trace: &DecisionTrace) {
    let decision = &trace.decision;
    let effect = match decision.effect.as_str() {
        "allow" => decision.effect.to_string().green().bold(),
        "deny" => decision.effect.to_string().red().bold(),
        _ => decision.effect.to_string().yellow().bold(),
    };
    println!("{} {}", "Decision:".bold(), effect);
    println!("  {}", decision.explanation);
    if let Some(message) = &decision.message {
        println!("  Message: {}", message);
    }
    println!();

    println!("{}", "Policies:".bold());
    for policy in &trace.policies {
        let marker = if policy.matched { "●".green() } else { "○".dimmed() };
        print!("  {} {}", marker, policy.policy_name);
        match &policy.skip_reason {
            Some(reason) => println!(" ({:?})", reason),
            None => println!(),
        }
        for rule in &policy.rules {
            let marker = if rule.matched { "→".green() } else { " ".normal() };
            println!("      {} rule #{} {}", marker, rule.index, rule.detail.dimmed());
        }
    }

    if !trace.conditions.is_empty() {
        println!();
        println!("{}", "Conditions:".bold());
        for check in &trace.conditions {
            println!("  {:<22} {:?}  {}", check.kind, check.outcome, check.detail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_sdk::Effect;

    const POLICY: &str = r#"
default_effect: deny
policies:
  - name: production-databases
    resources:
      - type: database
        tags:
          env: production
    rules:
      - actions: [read]
        effect: allow
      - actions: [write]
        effect: allow
        conditions:
          max_rows_affected: 100
      - actions: [destructive]
        effect: require_approval
"#;

    fn args(action: ActionClass, tags: &[&str]) -> ExplainArgs {
        ExplainArgs {
            resource_type: "database".into(),
            resource_name: "orders".into(),
            action,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            user: None,
            role: None,
            rows: None,
            resources: None,
            policy: None,
            json: false,
        }
    }

    #[test]
    fn test_tags_parse_as_key_value() {
        let mut explain = args(ActionClass::Write, &["env=production", "owner=payments=core"]);
        explain.rows = Some(250);
        explain.user = Some("alice".into());
        let query = explain.to_query().unwrap();
        assert_eq!(query.tags.get("env").map(String::as_str), Some("production"));
        // Only the first '=' separates key from value.
        assert_eq!(query.tags.get("owner").map(String::as_str), Some("payments=core"));
        assert_eq!(query.rows_affected, Some(250));

        let request = local_request(&query);
        assert_eq!(request.principal.user, "alice");
        assert_eq!(request.resource.tags.len(), 2);
        assert_eq!(request.context.rows_affected, Some(250));
    }

    #[test]
    fn test_tag_without_separator_is_rejected() {
        let err = args(ActionClass::Read, &["production"]).to_query().unwrap_err();
        assert!(err.to_string().contains("not key=value"));
    }

    #[test]
    fn test_local_request_defaults_to_anonymous() {
        let query = args(ActionClass::Read, &[]).to_query().unwrap();
        assert_eq!(local_request(&query).principal.user, "anonymous");
    }

    #[tokio::test]
    async fn test_local_policy_matches_server_decision() {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("policies.yaml");
        std::fs::write(&policy_path, POLICY).unwrap();

        let services = GovernanceServices::in_memory(PolicyLoader::from_yaml_str(POLICY).unwrap(), true);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, bulwark_core::presentation::router(services)).await.unwrap();
        });
        let client = GovernanceClient::new(format!("http://{}", addr));

        let mut cases = vec![
            args(ActionClass::Read, &["env=production"]),
            args(ActionClass::Destructive, &["env=production"]),
            args(ActionClass::Read, &["env=staging"]),
        ];
        let mut oversized = args(ActionClass::Write, &["env=production"]);
        oversized.rows = Some(101);
        cases.push(oversized);

        for mut case in cases {
            let remote = evaluate(&case, &client).await.unwrap();
            case.policy = Some(policy_path.clone());
            let local = evaluate(&case, &client).await.unwrap();
            assert_eq!(local.decision, remote.decision);
            assert_eq!(local.conditions.len(), remote.conditions.len());
        }

        let mut oversized = args(ActionClass::Write, &["env=production"]);
        oversized.rows = Some(101);
        oversized.policy = Some(policy_path);
        assert_eq!(evaluate(&oversized, &client).await.unwrap().decision.effect, Effect::Deny);
    }

    #[tokio::test]
    async fn test_verify_fails_on_broken_chain() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/verify")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"valid":false,"total_events":3,"legacy_events":0,"first_broken_index":2,
                    "first_invalid_id":"tool_x","error":"hash mismatch","checked_at":"2026-03-04T12:00:00Z"}"#,
            )
            .create_async()
            .await;

        let client = GovernanceClient::new(server.url());
        let manifest = GovernanceConfigManifest::default();
        let err = verify(&client, &manifest, false, true).await.unwrap_err();
        assert!(err.to_string().contains("integrity check failed"));
    }
}
