// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # bulwark
//!
//! Governance for autonomous infrastructure agents.
//!
//! ## Commands
//!
//! - `bulwark serve` - Run the control-plane API and audit stream
//! - `bulwark monitor` - Watch the audit stream and raise alerts
//! - `bulwark verify` - Check the audit hash chain
//! - `bulwark explain` - Show how policy would decide a hypothetical request
//! - `bulwark events list|get|trace` - Query the audit log
//! - `bulwark approvals list|get|approve|deny|cancel|wait` - Human approvals
//! - `bulwark config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use bulwark_cli::commands::{self, ApprovalCommand, ConfigCommand, EventsCommand, ExplainArgs, MonitorArgs};
use bulwark_cli::daemon;
use bulwark_core::domain::governance_config::{GovernanceConfigManifest, LogFormat};
use bulwark_sdk::GovernanceClient;

/// bulwark - audit, policy and approvals for infrastructure agents
#[derive(Parser)]
#[command(name = "bulwark")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "BULWARK_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Control-plane API base URL for client commands
    #[arg(long, global = true, env = "BULWARK_API_URL")]
    api_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "BULWARK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format (default: from config, else compact)
    #[arg(long, global = true, env = "BULWARK_LOG_FORMAT")]
    log_format: Option<LogOutput>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogOutput {
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the governance API server
    Serve {
        /// Bind host (default: spec.server.host)
        #[arg(long, env = "BULWARK_HOST")]
        host: Option<String>,

        /// Bind port (default: spec.server.port)
        #[arg(long, env = "BULWARK_PORT")]
        port: Option<u16>,
    },

    /// Run the real-time monitor
    Monitor(MonitorArgs),

    /// Verify the audit hash chain
    Verify {
        /// Read storage directly instead of calling the API
        #[arg(long)]
        local: bool,

        #[arg(long)]
        json: bool,
    },

    /// Explain the decision for a hypothetical request
    Explain(ExplainArgs),

    /// Query audit events
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },

    /// Manage approval requests
    Approvals {
        #[command(subcommand)]
        command: ApprovalCommand,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before parsing so clap's env fallbacks see it.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        eprintln!("{}", "No command specified. Use --help for usage.".yellow());
        std::process::exit(1);
    };

    // Config subcommands work on files and must not fail on a bad manifest.
    if let Commands::Config { command } = command {
        init_logging(&cli.log_level, cli.log_format.unwrap_or(LogOutput::Compact))?;
        return commands::config::handle_command(command, cli.config).await;
    }

    let manifest = GovernanceConfigManifest::load_or_default(cli.config.clone()).context("Failed to load configuration")?;
    let format = cli.log_format.unwrap_or(match manifest.spec.observability.log_format {
        LogFormat::Compact => LogOutput::Compact,
        LogFormat::Json => LogOutput::Json,
    });
    init_logging(&cli.log_level, format)?;

    let api_url = cli.api_url.clone();
    let client = GovernanceClient::new(api_url.clone().unwrap_or_else(|| manifest.spec.monitor.api_url.clone()));

    match command {
        Commands::Serve { host, port } => {
            info!("Starting bulwark governance server");
            daemon::start_server(manifest, host, port).await
        }
        Commands::Monitor(args) => commands::monitor::run(args, manifest, api_url).await,
        Commands::Verify { local, json } => commands::governance::verify(&client, &manifest, local, json).await,
        Commands::Explain(args) => commands::governance::explain(args, &client).await,
        Commands::Events { command } => commands::events::handle_command(command, &client).await,
        Commands::Approvals { command } => commands::approvals::handle_command(command, &client).await,
        Commands::Config { .. } => Ok(()),
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: LogOutput) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    match format {
        LogOutput::Compact => builder.compact().init(),
        LogOutput::Json => builder.json().init(),
    }

    Ok(())
}
