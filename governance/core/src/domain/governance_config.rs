// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Governance Configuration Types
//
// Defines the configuration schema for a bulwark governance node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - HTTP server and stream-socket endpoints
// - Storage backend (in-memory or PostgreSQL)
// - Enforcement mode, approval windows and notification targets
// - Real-time monitor thresholds and alert sinks
// - Observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::audit::Severity;
use crate::domain::repository::{PostgresConfig, StorageBackend};

pub const API_VERSION: &str = "bulwark.dev/v1";
pub const KIND: &str = "GovernanceConfig";

/// One year. Longer approval windows are rejected.
pub const MAX_APPROVAL_WINDOW_MINUTES: i64 = 525_600;

/// Top-level Kubernetes-style governance configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfigManifest {
    /// API version (must be "bulwark.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "GovernanceConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: GovernanceConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceConfigSpec {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub policy: PolicySourceConfig,

    #[serde(default)]
    pub approvals: ApprovalConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory: Option<InventoryConfig>,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    InMemory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_kind")]
    pub backend: StorageKind,

    /// PostgreSQL connection string (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_kind(),
            connection_string: None,
            max_connections: default_max_connections(),
        }
    }
}

impl StorageConfig {
    pub fn to_backend(&self) -> anyhow::Result<StorageBackend> {
        match self.backend {
            StorageKind::InMemory => Ok(StorageBackend::InMemory),
            StorageKind::Postgres => {
                let raw = self
                    .connection_string
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("spec.storage.connection_string is required for postgres"))?;
                Ok(StorageBackend::PostgreSQL(PostgresConfig {
                    connection_string: resolve_env_reference(raw)?,
                    max_connections: self.max_connections,
                }))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enforcing mode: audit/approval failures block mutating actions.
    #[serde(default = "default_true")]
    pub enforcing: bool,

    /// Unix domain socket carrying the live line-delimited event feed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_socket: Option<PathBuf>,

    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    #[serde(default = "default_query_max_limit")]
    pub query_max_limit: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enforcing: true,
            stream_socket: None,
            broadcast_capacity: default_broadcast_capacity(),
            query_max_limit: default_query_max_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySourceConfig {
    /// Declarative rule file loaded once at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,

    /// Hard cap on a single wait call; agents re-issue for longer waits.
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,

    /// Storage re-check period while waiting, for resolutions made by other replicas.
    #[serde(default = "default_recheck_seconds")]
    pub recheck_interval_seconds: u64,

    #[serde(default)]
    pub notifications: SinkConfig,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            window_minutes: default_window_minutes(),
            max_wait_seconds: default_max_wait_seconds(),
            recheck_interval_seconds: default_recheck_seconds(),
            notifications: SinkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSinkConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub syslog: Option<SyslogSinkConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailSinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSinkConfig {
    pub url: String,
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
    #[serde(default = "default_sink_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyslogSinkConfig {
    /// UDP address of the collector, e.g. "127.0.0.1:514".
    pub address: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSinkConfig {
    /// HTTP mail relay endpoint accepting `{from, to, subject, text}`.
    pub relay_url: String,
    /// API key for the relay (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Base URL of the control-plane API used by the polling fallback.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Events per rolling minute that trigger a volume alert.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold_per_minute: usize,

    #[serde(default)]
    pub business_hours: BusinessHours,

    /// Identical tool calls in one session before a loop alert.
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,

    #[serde(default = "default_loop_window")]
    pub loop_window_seconds: i64,

    #[serde(default = "default_error_rate")]
    pub error_rate_threshold: f64,

    #[serde(default = "default_error_min_calls")]
    pub error_rate_min_calls: u64,

    #[serde(default)]
    pub sinks: SinkConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            poll_interval_seconds: default_poll_interval(),
            volume_threshold_per_minute: default_volume_threshold(),
            business_hours: BusinessHours::default(),
            loop_threshold: default_loop_threshold(),
            loop_window_seconds: default_loop_window(),
            error_rate_threshold: default_error_rate(),
            error_rate_min_calls: default_error_min_calls(),
            sinks: SinkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessHours {
    #[serde(default = "default_business_start")]
    pub start_hour: u32,
    #[serde(default = "default_business_end")]
    pub end_hour: u32,
    #[serde(default)]
    pub utc_offset_hours: i32,
    #[serde(default = "default_true")]
    pub weekdays_only: bool,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: default_business_start(),
            end_hour: default_business_end(),
            utc_offset_hours: 0,
            weekdays_only: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Prometheus exporter port; disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for GovernanceConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "bulwark-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: GovernanceConfigSpec::default(),
        }
    }
}

impl GovernanceConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. BULWARK_CONFIG_PATH environment variable
    /// 2. ./bulwark-config.yaml (working directory)
    /// 3. ~/.bulwark/config.yaml (user home)
    /// 4. /etc/bulwark/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("BULWARK_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./bulwark-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".bulwark").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/bulwark/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path: fail if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("BULWARK_ENFORCING") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: BULWARK_ENFORCING=true");
                    self.spec.audit.enforcing = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: BULWARK_ENFORCING=false");
                    self.spec.audit.enforcing = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for BULWARK_ENFORCING: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(url) = std::env::var("BULWARK_DATABASE_URL") {
            tracing::info!("Environment override: BULWARK_DATABASE_URL (postgres backend)");
            self.spec.storage.backend = StorageKind::Postgres;
            self.spec.storage.connection_string = Some(url);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.storage.backend == StorageKind::Postgres && spec.storage.connection_string.is_none() {
            anyhow::bail!("spec.storage.connection_string is required when backend is postgres");
        }

        if spec.approvals.window_minutes <= 0 || spec.approvals.window_minutes > MAX_APPROVAL_WINDOW_MINUTES {
            anyhow::bail!(
                "spec.approvals.window_minutes must be between 1 and {}",
                MAX_APPROVAL_WINDOW_MINUTES
            );
        }

        if spec.approvals.max_wait_seconds == 0 || spec.approvals.max_wait_seconds > 120 {
            anyhow::bail!("spec.approvals.max_wait_seconds must be between 1 and 120");
        }

        if spec.audit.broadcast_capacity == 0 {
            anyhow::bail!("spec.audit.broadcast_capacity must be positive");
        }

        let hours = &spec.monitor.business_hours;
        if hours.start_hour >= hours.end_hour || hours.end_hour > 24 {
            anyhow::bail!(
                "spec.monitor.business_hours window {}-{} is invalid",
                hours.start_hour,
                hours.end_hour
            );
        }

        if !(0.0..=1.0).contains(&spec.monitor.error_rate_threshold) {
            anyhow::bail!("spec.monitor.error_rate_threshold must be within 0.0..=1.0");
        }

        for sinks in [&spec.approvals.notifications, &spec.monitor.sinks] {
            if let Some(email) = &sinks.email {
                if email.to.is_empty() {
                    anyhow::bail!("email sink requires at least one recipient");
                }
            }
        }

        Ok(())
    }

    pub fn policy_path(&self) -> Option<&Path> {
        self.spec.policy.path.as_deref()
    }
}

/// Resolve "env:VAR_NAME" references used for secrets.
pub fn resolve_env_reference(value: &str) -> anyhow::Result<String> {
    match value.strip_prefix("env:") {
        Some(var) => std::env::var(var)
            .map_err(|_| anyhow::anyhow!("Environment variable '{}' referenced by config is not set", var)),
        None => Ok(value.to_string()),
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8088
}

fn default_storage_kind() -> StorageKind {
    StorageKind::InMemory
}

fn default_max_connections() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_broadcast_capacity() -> usize {
    1000
}

fn default_query_max_limit() -> usize {
    1000
}

fn default_window_minutes() -> i64 {
    60
}

fn default_max_wait_seconds() -> u64 {
    120
}

fn default_recheck_seconds() -> u64 {
    5
}

fn default_min_severity() -> Severity {
    Severity::Info
}

fn default_sink_timeout() -> u64 {
    5
}

fn default_app_name() -> String {
    "bulwark".to_string()
}

fn default_api_url() -> String {
    "http://127.0.0.1:8088".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_volume_threshold() -> usize {
    120
}

fn default_business_start() -> u32 {
    8
}

fn default_business_end() -> u32 {
    19
}

fn default_loop_threshold() -> usize {
    5
}

fn default_loop_window() -> i64 {
    300
}

fn default_error_rate() -> f64 {
    0.5
}

fn default_error_min_calls() -> u64 {
    10
}

fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = GovernanceConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(!manifest.metadata.name.is_empty());
        assert!(manifest.spec.audit.enforcing);
        assert_eq!(manifest.spec.approvals.window_minutes, 60);
        assert_eq!(manifest.spec.approvals.max_wait_seconds, 120);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_minimal_yaml_fills_defaults() {
        let yaml = r#"
apiVersion: bulwark.dev/v1
kind: GovernanceConfig
metadata:
  name: helpdesk-governance
spec:
  policy:
    path: /etc/bulwark/policies.yaml
  monitor:
    sinks:
      email:
        relay_url: https://mail.internal/send
        from: bulwark@example.com
        to: [oncall@example.com]
"#;
        let manifest = GovernanceConfigManifest::from_yaml_str(yaml).unwrap();
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.spec.server.port, 8088);
        assert_eq!(manifest.spec.storage.backend, StorageKind::InMemory);
        assert_eq!(manifest.policy_path(), Some(Path::new("/etc/bulwark/policies.yaml")));
        assert_eq!(manifest.spec.monitor.sinks.email.as_ref().unwrap().to.len(), 1);
    }

    #[test]
    fn test_validation() {
        let mut manifest = GovernanceConfigManifest::default();

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.approvals.max_wait_seconds = 600;
        assert!(manifest.validate().is_err());
        manifest.spec.approvals.max_wait_seconds = 120;

        manifest.spec.approvals.window_minutes = i64::MAX;
        assert!(manifest.validate().is_err());
        manifest.spec.approvals.window_minutes = MAX_APPROVAL_WINDOW_MINUTES;
        assert!(manifest.validate().is_ok());
        manifest.spec.approvals.window_minutes = 60;

        manifest.spec.storage.backend = StorageKind::Postgres;
        assert!(manifest.validate().is_err());
        manifest.spec.storage.connection_string = Some("postgres://localhost/bulwark".into());
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let manifest = GovernanceConfigManifest::default();
        manifest.to_yaml_file(&path).unwrap();
        let loaded = GovernanceConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, manifest.metadata.name);
    }
}
