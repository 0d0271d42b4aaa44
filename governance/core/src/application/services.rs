// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Service wiring shared by the daemon, the HTTP API and tests.

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::approval_service::{ApprovalService, ApprovalSettings};
use crate::application::audit_store::HashChainedAuditStore;
use crate::application::governance_gate::GovernanceGate;
use crate::application::policy_engine::PolicyEngine;
use crate::application::repository_factory::{create_approval_repository, create_audit_repository};
use crate::domain::clock::{Clock, SystemClock};
use crate::domain::governance_config::GovernanceConfigManifest;
use crate::domain::policy::PolicyConfig;
use crate::domain::repository::{ApprovalRepository, AuditRepository, StorageBackend};
use crate::infrastructure::db::Database;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::inventory::{InventoryLookup, StaticInventory};
use crate::infrastructure::notifications::NotificationDispatcher;
use crate::infrastructure::policy_loader::PolicyLoader;

#[derive(Clone)]
pub struct GovernanceServices {
    pub audit: Arc<HashChainedAuditStore>,
    pub engine: Arc<PolicyEngine>,
    pub approvals: Arc<ApprovalService>,
    pub gate: Arc<GovernanceGate>,
    pub event_bus: EventBus,
    /// Tag source for requests that omit tags. The gate and explain share it.
    pub inventory: Option<Arc<dyn InventoryLookup>>,
    pub enforcing: bool,
}

impl GovernanceServices {
    /// Build every service from a manifest: storage, policy file, sinks and
    /// inventory. In enforcing mode an unreachable audit store is fatal.
    pub async fn from_manifest(manifest: &GovernanceConfigManifest) -> anyhow::Result<Self> {
        let spec = &manifest.spec;
        let backend = spec.storage.to_backend()?;

        let pool = match &backend {
            StorageBackend::InMemory => {
                info!("Using in-memory governance storage");
                None
            }
            StorageBackend::PostgreSQL(config) => {
                let database = Database::new(config)
                    .await
                    .context("Failed to connect to the governance database")?;
                database.bootstrap_schema().await?;
                info!("Using PostgreSQL governance storage");
                Some(database.get_pool().clone())
            }
        };

        let policy = match manifest.policy_path() {
            Some(path) => {
                let config = PolicyLoader::from_file(path)?;
                info!(path = %path.display(), policies = config.policies.len(), "Policy configuration loaded");
                config
            }
            None => {
                warn!("No policy file configured; every request falls through to the default effect");
                PolicyConfig::default()
            }
        };

        let inventory: Option<Arc<dyn InventoryLookup>> = match &spec.inventory {
            Some(inventory) => {
                let loaded = StaticInventory::from_file(&inventory.path)?;
                info!(path = %inventory.path.display(), resources = loaded.len(), "Inventory loaded");
                Some(Arc::new(loaded))
            }
            None => None,
        };

        let services = Self::assemble(
            create_audit_repository(&backend, pool.clone())?,
            create_approval_repository(&backend, pool)?,
            policy,
            NotificationDispatcher::from_config(&spec.approvals.notifications, false)?,
            Arc::new(SystemClock),
            ServiceOptions {
                enforcing: spec.audit.enforcing,
                broadcast_capacity: spec.audit.broadcast_capacity,
                query_max_limit: spec.audit.query_max_limit,
                approvals: ApprovalSettings::from(&spec.approvals),
                inventory,
            },
        );
        services.gate.startup_check().await?;
        Ok(services)
    }

    /// In-memory services for development and tests.
    pub fn in_memory(policy: PolicyConfig, enforcing: bool) -> Self {
        Self::assemble(
            Arc::new(crate::infrastructure::repositories::InMemoryAuditRepository::new()),
            Arc::new(crate::infrastructure::repositories::InMemoryApprovalRepository::new()),
            policy,
            NotificationDispatcher::default(),
            Arc::new(SystemClock),
            ServiceOptions {
                enforcing,
                ..Default::default()
            },
        )
    }

    pub fn assemble(
        audit_repository: Arc<dyn AuditRepository>,
        approval_repository: Arc<dyn ApprovalRepository>,
        policy: PolicyConfig,
        notifier: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        options: ServiceOptions,
    ) -> Self {
        let event_bus = EventBus::new(options.broadcast_capacity);
        let audit = Arc::new(HashChainedAuditStore::new(
            audit_repository,
            event_bus.clone(),
            clock.clone(),
            options.query_max_limit,
        ));
        let engine = Arc::new(PolicyEngine::new(policy));
        let approvals = Arc::new(ApprovalService::new(
            approval_repository,
            notifier.clone(),
            clock,
            options.approvals,
        ));
        let mut gate = GovernanceGate::new(
            audit.clone(),
            engine.clone(),
            approvals.clone(),
            notifier,
            options.enforcing,
        );
        if let Some(inventory) = &options.inventory {
            gate = gate.with_inventory(inventory.clone());
        }

        Self {
            audit,
            engine,
            approvals,
            gate: Arc::new(gate),
            event_bus,
            inventory: options.inventory,
            enforcing: options.enforcing,
        }
    }
}

pub struct ServiceOptions {
    pub enforcing: bool,
    pub broadcast_capacity: usize,
    pub query_max_limit: usize,
    pub approvals: ApprovalSettings,
    pub inventory: Option<Arc<dyn InventoryLookup>>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            enforcing: true,
            broadcast_capacity: 1000,
            query_max_limit: 1000,
            approvals: ApprovalSettings::default(),
            inventory: None,
        }
    }
}
