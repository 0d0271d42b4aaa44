// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Governance Policy Model
//!
//! Declarative policy configuration evaluated by
//! [`crate::application::policy_engine::PolicyEngine`]. A [`PolicyConfig`] is an
//! ordered list of [`Policy`] records; each is scoped by resource matchers and
//! optional principal matchers and holds an ordered list of [`Rule`]s.
//!
//! ## Condition Kinds
//!
//! Conditions are a closed set ([`Condition`]). The on-disk `conditions:` map
//! ([`ConditionSet`]) rejects unknown keys at load time, so a typo such as
//! `max_row_affected` fails loudly instead of silently disabling a limit.

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to read policy file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Invalid policy document: {0}")]
    Parse(String),

    #[error("Invalid policy '{policy}': {reason}")]
    Invalid { policy: String, reason: String },
}

/// Coarse risk tier of a requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Read,
    Write,
    Destructive,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::Read => "read",
            ActionClass::Write => "write",
            ActionClass::Destructive => "destructive",
        }
    }

    /// `write` and `destructive` actions mutate infrastructure.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, ActionClass::Read)
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(ActionClass::Read),
            "write" => Ok(ActionClass::Write),
            "destructive" => Ok(ActionClass::Destructive),
            other => Err(format!("unknown action class '{}'", other)),
        }
    }
}

/// Verdict of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
    RequireApproval,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
            Effect::RequireApproval => "require_approval",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root of a policy file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default = "default_effect")]
    pub default_effect: Effect,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

fn default_effect() -> Effect {
    Effect::Deny
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_effect: Effect::Deny,
            policies: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let mut seen = std::collections::HashSet::new();
        for policy in &self.policies {
            let invalid = |reason: &str| PolicyError::Invalid {
                policy: policy.name.clone(),
                reason: reason.to_string(),
            };
            if policy.name.trim().is_empty() {
                return Err(invalid("policy name cannot be empty"));
            }
            if !seen.insert(policy.name.as_str()) {
                return Err(invalid("duplicate policy name"));
            }
            if policy.resources.is_empty() {
                return Err(invalid("at least one resource matcher is required"));
            }
            if policy.rules.is_empty() {
                return Err(invalid("at least one rule is required"));
            }
            for (index, rule) in policy.rules.iter().enumerate() {
                if rule.actions.is_empty() {
                    return Err(invalid(&format!("rule #{} declares no actions", index)));
                }
                if let Some(schedule) = &rule.conditions.schedule {
                    schedule.validate().map_err(|e| invalid(&format!("rule #{}: {}", index, e)))?;
                }
                if rule.conditions.required_approvals == Some(0) {
                    return Err(invalid(&format!("rule #{}: required_approvals must be at least 1", index)));
                }
            }
            for principal in &policy.principals {
                if principal.user.is_none() && principal.role.is_none() {
                    return Err(invalid("principal matcher needs a user or a role"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub resources: Vec<ResourceMatcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<PrincipalMatcher>,
    pub rules: Vec<Rule>,
}

fn default_enabled() -> bool {
    true
}

/// Resource type plus tag predicate. `type: "*"` matches any type; a tag
/// value of `"*"` only requires the key to be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceMatcher {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl ResourceMatcher {
    pub fn matches(&self, resource: &Resource) -> bool {
        if !matches_pattern(&self.resource_type, &resource.resource_type) {
            return false;
        }
        if let Some(name) = &self.name {
            if !matches_pattern(name, &resource.name) {
                return false;
            }
        }
        self.tags.iter().all(|(key, expected)| match resource.tags.get(key) {
            Some(actual) => expected == "*" || expected == actual,
            None => false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrincipalMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl PrincipalMatcher {
    pub fn matches(&self, principal: &Principal) -> bool {
        let user_ok = self
            .user
            .as_ref()
            .map(|user| matches_pattern(user, &principal.user))
            .unwrap_or(true);
        let role_ok = self
            .role
            .as_ref()
            .map(|role| principal.roles.iter().any(|r| r == role))
            .unwrap_or(true);
        user_ok && role_ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub actions: Vec<ActionClass>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "ConditionSet::is_empty")]
    pub conditions: ConditionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Rule {
    pub fn applies_to(&self, action: ActionClass) -> bool {
        self.actions.contains(&action)
    }
}

/// The on-disk `conditions:` map of a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_resources_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_approvals: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
}

impl ConditionSet {
    pub fn is_empty(&self) -> bool {
        self.conditions().is_empty()
    }

    /// Enumerate declared conditions in evaluation order.
    pub fn conditions(&self) -> Vec<Condition> {
        let mut out = Vec::new();
        if let Some(schedule) = &self.schedule {
            out.push(Condition::Schedule(schedule.clone()));
        }
        if let Some(limit) = self.max_rows_affected {
            out.push(Condition::MaxRowsAffected(limit));
        }
        if let Some(limit) = self.max_resources_affected {
            out.push(Condition::MaxResourcesAffected(limit));
        }
        if let Some(quorum) = self.required_approvals {
            out.push(Condition::RequiredApprovals(quorum));
        }
        out
    }
}

/// A single typed condition with its own evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    MaxRowsAffected(u64),
    MaxResourcesAffected(u64),
    RequiredApprovals(u32),
    Schedule(Schedule),
}

impl Condition {
    pub fn kind(&self) -> &'static str {
        match self {
            Condition::MaxRowsAffected(_) => "max_rows_affected",
            Condition::MaxResourcesAffected(_) => "max_resources_affected",
            Condition::RequiredApprovals(_) => "required_approvals",
            Condition::Schedule(_) => "schedule",
        }
    }
}

/// Time-of-day window during which a rule is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Schedule {
    /// Days the window is open. Empty means every day.
    #[serde(default)]
    pub days: Vec<Weekday>,
    /// Start hour, inclusive (0-23).
    pub start_hour: u32,
    /// End hour, exclusive (1-24).
    pub end_hour: u32,
    #[serde(default)]
    pub utc_offset_hours: i32,
}

impl Schedule {
    fn validate(&self) -> Result<(), String> {
        if self.start_hour > 23 || self.end_hour > 24 || self.start_hour >= self.end_hour {
            return Err(format!(
                "schedule window {}:00-{}:00 is invalid",
                self.start_hour, self.end_hour
            ));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(format!("utc_offset_hours {} out of range", self.utc_offset_hours));
        }
        Ok(())
    }

    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_hours * 3600) else {
            return false;
        };
        let local = at.with_timezone(&offset);
        let day_ok = self.days.is_empty() || self.days.contains(&local.weekday());
        let hour = local.hour();
        day_ok && hour >= self.start_hour && hour < self.end_hour
    }

    pub fn describe(&self) -> String {
        let days = if self.days.is_empty() {
            "every day".to_string()
        } else {
            self.days.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",")
        };
        format!(
            "{} {:02}:00-{:02}:00 UTC{:+}",
            days, self.start_hour, self.end_hour, self.utc_offset_hours
        )
    }
}

/// Identity on whose behalf an action is requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Observed scope and correlation data attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Evaluation instant for schedule conditions; defaults to now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl RequestContext {
    /// A request carrying an observed count is a post-execution re-check.
    pub fn is_post_execution(&self) -> bool {
        self.rows_affected.is_some() || self.resources_affected.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub principal: Principal,
    pub resource: Resource,
    pub action: ActionClass,
    #[serde(default)]
    pub context: RequestContext,
}

impl PolicyRequest {
    pub fn new(principal: Principal, resource: Resource, action: ActionClass) -> Self {
        Self {
            principal,
            resource,
            action,
            context: RequestContext::default(),
        }
    }

    pub fn with_rows_affected(mut self, rows: u64) -> Self {
        self.context.rows_affected = Some(rows);
        self
    }

    pub fn with_resources_affected(mut self, resources: u64) -> Self {
        self.context.resources_affected = Some(resources);
        self
    }

    pub fn at(mut self, instant: DateTime<Utc>) -> Self {
        self.context.evaluated_at = Some(instant);
        self
    }
}

/// Why a policy did not contribute a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    ResourceMismatch,
    PrincipalMismatch,
    NoRuleMatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOutcome {
    Passed,
    Failed,
    /// Limit declared but no observed count supplied yet.
    NotEvaluated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionCheck {
    pub kind: String,
    pub outcome: ConditionOutcome,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTrace {
    pub index: usize,
    pub matched: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTrace {
    pub policy_name: String,
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleTrace>,
}

/// Final verdict of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub effect: Effect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_index: Option<usize>,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub default_applied: bool,
    pub post_execution: bool,
    /// Quorum for `require_approval` decisions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_approvals: Option<u32>,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.effect == Effect::Allow
    }
}

/// Decision plus every policy considered and every condition checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub decision: Decision,
    pub policies: Vec<PolicyTrace>,
    pub conditions: Vec<ConditionCheck>,
}

/// Glob match supporting `*`, `prefix*`, `*suffix` and `*.domain`.
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern == "*" || pattern == value {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return value.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    false
}
