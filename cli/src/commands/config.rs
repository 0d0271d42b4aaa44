// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use bulwark_core::domain::governance_config::{GovernanceConfigManifest, StorageKind};
use bulwark_core::infrastructure::policy_loader::PolicyLoader;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file and the policy file it references
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./bulwark-config.yaml)
        #[arg(short, long, default_value = "./bulwark-config.yaml")]
        output: PathBuf,

        /// Include every section with comments
        #[arg(long)]
        examples: bool,

        /// Also write a sample policy file next to the config
        #[arg(long)]
        policies: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate {
            output,
            examples,
            policies,
        } => generate(&output, examples, policies),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = GovernanceConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. BULWARK_CONFIG_PATH: {}",
            std::env::var("BULWARK_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./bulwark-config.yaml");
        println!("  4. ~/.bulwark/config.yaml");
        println!("  5. /etc/bulwark/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();
    println!("  Node: {}", config.metadata.name);
    println!("  API: {}:{}", spec.server.host, spec.server.port);
    println!(
        "  Mode: {}",
        if spec.audit.enforcing {
            "enforcing".green()
        } else {
            "permissive".yellow()
        }
    );
    let storage = match spec.storage.backend {
        StorageKind::InMemory => "in-memory".to_string(),
        StorageKind::Postgres => format!("postgres (max {} connections)", spec.storage.max_connections),
    };
    println!("  Storage: {}", storage);
    println!(
        "  Stream socket: {}",
        spec.audit
            .stream_socket
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(disabled)".to_string())
    );
    println!(
        "  Policy file: {}",
        config
            .policy_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none, default effect only)".to_string())
    );
    println!();

    println!("{}", "Approvals:".bold());
    println!("  Window: {} min", spec.approvals.window_minutes);
    println!("  Max wait: {} s", spec.approvals.max_wait_seconds);
    print_sinks(
        spec.approvals.notifications.webhook.is_some(),
        spec.approvals.notifications.syslog.is_some(),
        spec.approvals.notifications.email.is_some(),
    );
    println!();

    println!("{}", "Monitor:".bold());
    let hours = &spec.monitor.business_hours;
    println!(
        "  Business hours: {:02}:00-{:02}:00 UTC{:+}{}",
        hours.start_hour,
        hours.end_hour,
        hours.utc_offset_hours,
        if hours.weekdays_only { ", weekdays" } else { "" }
    );
    println!("  Volume threshold: {}/min", spec.monitor.volume_threshold_per_minute);
    println!(
        "  Loop threshold: {} calls in {}s",
        spec.monitor.loop_threshold, spec.monitor.loop_window_seconds
    );
    print_sinks(
        spec.monitor.sinks.webhook.is_some(),
        spec.monitor.sinks.syslog.is_some(),
        spec.monitor.sinks.email.is_some(),
    );

    Ok(())
}

fn print_sinks(webhook: bool, syslog: bool, email: bool) {
    let sinks: Vec<&str> = [("webhook", webhook), ("syslog", syslog), ("email", email)]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect();
    if sinks.is_empty() {
        println!("  Sinks: {}", "(none)".dimmed());
    } else {
        println!("  Sinks: {}", sinks.join(", "));
    }
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = GovernanceConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    println!("{}", "✓ Configuration is valid".green());

    if let Some(path) = config.policy_path() {
        let policy = PolicyLoader::from_file(path)
            .with_context(|| format!("Policy file {} is invalid", path.display()))?;
        println!(
            "{}",
            format!(
                "✓ Policy file is valid ({} policies, default {})",
                policy.policies.len(),
                policy.default_effect
            )
            .green()
        );
    }

    Ok(())
}

fn generate(output: &Path, with_examples: bool, with_policies: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    };

    std::fs::write(output, sample).with_context(|| format!("Failed to write config to {:?}", output))?;
    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    if with_policies {
        let policy_path = output
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("policies.yaml");
        std::fs::write(&policy_path, include_str!("../../templates/policies-example.yaml"))
            .with_context(|| format!("Failed to write policies to {:?}", policy_path))?;
        println!("{}", format!("✓ Policies generated: {}", policy_path.display()).green());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_parse_and_validate() {
        let minimal = GovernanceConfigManifest::from_yaml_str(include_str!("../../templates/config-minimal.yaml")).unwrap();
        minimal.validate().unwrap();

        let full =
            GovernanceConfigManifest::from_yaml_str(include_str!("../../templates/config-with-examples.yaml")).unwrap();
        full.validate().unwrap();
        assert!(full.spec.monitor.sinks.email.is_some());
        assert_eq!(full.spec.observability.metrics_port, Some(9090));
    }

    #[test]
    fn test_policy_template_loads() {
        let policy = PolicyLoader::from_yaml_str(include_str!("../../templates/policies-example.yaml")).unwrap();
        assert_eq!(policy.policies.len(), 3);
    }

    #[test]
    fn test_generate_writes_config_and_policies() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("bulwark-config.yaml");
        generate(&output, false, true).unwrap();
        assert!(output.exists());
        assert!(dir.path().join("policies.yaml").exists());
    }
}
