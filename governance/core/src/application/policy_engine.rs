// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Policy Engine
//!
//! Pure evaluation of a [`PolicyRequest`] against an immutable
//! [`PolicyConfig`] snapshot. The engine holds no locks and writes nothing;
//! it is shared behind an `Arc` and called concurrently by every agent.
//!
//! ## Evaluation Order
//!
//! 1. Policies in declared order. A policy is skipped when disabled, when no
//!    resource matcher matches, or when it declares principals and none match.
//! 2. Inside a matched policy, rules in declared order. A rule applies when
//!    its action set contains the requested action and, if it declares a
//!    schedule, the schedule window is open.
//! 3. The first applicable rule decides. Its limit conditions can turn
//!    `allow`/`require_approval` into `deny`; they never fall through to a
//!    later rule. A `deny` rule stays `deny`.
//! 4. A matched policy with no applicable rule yields no verdict and the
//!    next policy is tried. With no verdict at all, the configured default
//!    effect applies with `default_applied = true`.
//!
//! `evaluate` and `explain` run the same evaluation; `evaluate` drops the trace.

use chrono::Utc;
use std::sync::Arc;

use crate::domain::policy::{
    Condition, ConditionCheck, ConditionOutcome, Decision, DecisionTrace, Effect, Policy,
    PolicyConfig, PolicyRequest, PolicyTrace, Rule, RuleTrace, SkipReason,
};

pub struct PolicyEngine {
    config: Arc<PolicyConfig>,
}

/// Which explanation template renders a decision.
enum Template<'a> {
    Allowed,
    DeniedByCondition(Vec<&'a ConditionCheck>),
    DeniedByRule,
    ApprovalRequired(u32),
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn from_shared(config: Arc<PolicyConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn policy_count(&self) -> usize {
        self.config.policies.len()
    }

    pub fn evaluate(&self, request: &PolicyRequest) -> Decision {
        self.explain(request).decision
    }

    pub fn explain(&self, request: &PolicyRequest) -> DecisionTrace {
        let mut policies = Vec::new();
        let mut conditions = Vec::new();

        for policy in &self.config.policies {
            if let Some(reason) = Self::skip_reason(policy, request) {
                policies.push(PolicyTrace {
                    policy_name: policy.name.clone(),
                    matched: false,
                    skip_reason: Some(reason),
                    rules: Vec::new(),
                });
                continue;
            }

            let mut rules = Vec::new();
            let decision = self.evaluate_rules(policy, request, &mut rules, &mut conditions);
            let decided = decision.is_some();
            policies.push(PolicyTrace {
                policy_name: policy.name.clone(),
                matched: true,
                skip_reason: if decided { None } else { Some(SkipReason::NoRuleMatched) },
                rules,
            });

            if let Some(decision) = decision {
                return DecisionTrace {
                    decision,
                    policies,
                    conditions,
                };
            }
        }

        DecisionTrace {
            decision: self.default_decision(request),
            policies,
            conditions,
        }
    }

    fn skip_reason(policy: &Policy, request: &PolicyRequest) -> Option<SkipReason> {
        if !policy.enabled {
            return Some(SkipReason::Disabled);
        }
        if !policy.resources.iter().any(|m| m.matches(&request.resource)) {
            return Some(SkipReason::ResourceMismatch);
        }
        if !policy.principals.is_empty() && !policy.principals.iter().any(|p| p.matches(&request.principal)) {
            return Some(SkipReason::PrincipalMismatch);
        }
        None
    }

    fn evaluate_rules(
        &self,
        policy: &Policy,
        request: &PolicyRequest,
        rules: &mut Vec<RuleTrace>,
        conditions: &mut Vec<ConditionCheck>,
    ) -> Option<Decision> {
        let at = request.context.evaluated_at.unwrap_or_else(Utc::now);

        for (index, rule) in policy.rules.iter().enumerate() {
            if !rule.applies_to(request.action) {
                rules.push(RuleTrace {
                    index,
                    matched: false,
                    detail: format!(
                        "action {} not in [{}]",
                        request.action,
                        rule.actions.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", ")
                    ),
                });
                continue;
            }

            if let Some(schedule) = &rule.conditions.schedule {
                let active = schedule.is_active(at);
                conditions.push(ConditionCheck {
                    kind: "schedule".to_string(),
                    outcome: if active { ConditionOutcome::Passed } else { ConditionOutcome::Failed },
                    detail: format!(
                        "rule #{} window {} is {}",
                        index,
                        schedule.describe(),
                        if active { "open" } else { "closed" }
                    ),
                });
                if !active {
                    rules.push(RuleTrace {
                        index,
                        matched: false,
                        detail: format!("outside schedule {}", schedule.describe()),
                    });
                    continue;
                }
            }

            rules.push(RuleTrace {
                index,
                matched: true,
                detail: format!("action {} matched, effect {}", request.action, rule.effect),
            });
            let first_check = conditions.len();
            Self::check_conditions(rule, request, conditions);
            return Some(self.rule_decision(policy, index, rule, request, &conditions[first_check..]));
        }

        None
    }

    /// Record outcomes of every non-schedule condition of the winning rule.
    fn check_conditions(rule: &Rule, request: &PolicyRequest, conditions: &mut Vec<ConditionCheck>) {
        for condition in rule.conditions.conditions() {
            let check = match &condition {
                Condition::Schedule(_) => continue,
                Condition::MaxRowsAffected(limit) => {
                    Self::check_limit(condition.kind(), "rows_affected", request.context.rows_affected, *limit)
                }
                Condition::MaxResourcesAffected(limit) => Self::check_limit(
                    condition.kind(),
                    "resources_affected",
                    request.context.resources_affected,
                    *limit,
                ),
                Condition::RequiredApprovals(quorum) => ConditionCheck {
                    kind: condition.kind().to_string(),
                    outcome: ConditionOutcome::Passed,
                    detail: format!("quorum of {} approval(s)", quorum),
                },
            };
            conditions.push(check);
        }
    }

    fn check_limit(kind: &str, field: &str, observed: Option<u64>, limit: u64) -> ConditionCheck {
        let (outcome, detail) = match observed {
            Some(observed) if observed > limit => (
                ConditionOutcome::Failed,
                format!("{} {} exceeds limit {}", field, observed, limit),
            ),
            Some(observed) => (
                ConditionOutcome::Passed,
                format!("{} {} within limit {}", field, observed, limit),
            ),
            None => (
                ConditionOutcome::NotEvaluated,
                format!("{} not yet observed; limit {} applies after execution", field, limit),
            ),
        };
        ConditionCheck {
            kind: kind.to_string(),
            outcome,
            detail,
        }
    }

    fn rule_decision(
        &self,
        policy: &Policy,
        index: usize,
        rule: &Rule,
        request: &PolicyRequest,
        checks: &[ConditionCheck],
    ) -> Decision {
        let failed: Vec<&ConditionCheck> = checks
            .iter()
            .filter(|c| c.outcome == ConditionOutcome::Failed)
            .collect();

        let (effect, template) = match rule.effect {
            Effect::Deny => (Effect::Deny, Template::DeniedByRule),
            _ if !failed.is_empty() => (Effect::Deny, Template::DeniedByCondition(failed)),
            Effect::Allow => (Effect::Allow, Template::Allowed),
            Effect::RequireApproval => {
                let quorum = rule.conditions.required_approvals.unwrap_or(1);
                (Effect::RequireApproval, Template::ApprovalRequired(quorum))
            }
        };

        let pending: Vec<&ConditionCheck> = checks
            .iter()
            .filter(|c| c.outcome == ConditionOutcome::NotEvaluated)
            .collect();
        let post_execution = request.context.is_post_execution();
        let explanation = Self::render(policy, index, rule, request, &template, &pending, post_execution);

        Decision {
            effect,
            policy_name: Some(policy.name.clone()),
            rule_index: Some(index),
            explanation,
            message: rule.message.clone(),
            default_applied: false,
            post_execution,
            required_approvals: match template {
                Template::ApprovalRequired(quorum) => Some(quorum),
                _ => None,
            },
        }
    }

    fn render(
        policy: &Policy,
        index: usize,
        rule: &Rule,
        request: &PolicyRequest,
        template: &Template<'_>,
        pending: &[&ConditionCheck],
        post_execution: bool,
    ) -> String {
        let target = format!(
            "{} on {} '{}'",
            request.action, request.resource.resource_type, request.resource.name
        );
        let origin = format!("rule #{} of policy '{}'", index, policy.name);

        let mut text = match template {
            Template::Allowed => format!("Allowed: {} permits {}.", origin, target),
            Template::DeniedByCondition(failed) => format!(
                "Denied by condition: {} ({}{}).",
                failed.iter().map(|c| c.detail.as_str()).collect::<Vec<_>>().join("; "),
                origin,
                if post_execution { ", post-execution check" } else { "" }
            ),
            Template::DeniedByRule => format!(
                "Denied by {}: {}.",
                origin,
                rule.message
                    .clone()
                    .unwrap_or_else(|| format!("{} is not permitted", target))
            ),
            Template::ApprovalRequired(quorum) => format!(
                "Approval required: {} requires {} human approval(s) for {}.",
                origin, quorum, target
            ),
        };

        if !pending.is_empty() && !matches!(template, Template::DeniedByRule) {
            text.push_str(&format!(
                " Pending post-execution checks: {}.",
                pending.iter().map(|c| c.kind.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }
        if let (Some(message), false) = (&rule.message, matches!(template, Template::DeniedByRule)) {
            text.push_str(&format!(" {}", message));
        }
        text
    }

    fn default_decision(&self, request: &PolicyRequest) -> Decision {
        let effect = self.config.default_effect;
        let verdict = match effect {
            Effect::Allow => "Allowed by default",
            Effect::Deny => "Denied by default",
            Effect::RequireApproval => "Approval required by default",
        };
        Decision {
            effect,
            policy_name: None,
            rule_index: None,
            explanation: format!(
                "{}: no policy matched {} on {} '{}'.",
                verdict, request.action, request.resource.resource_type, request.resource.name
            ),
            message: None,
            default_applied: true,
            post_execution: request.context.is_post_execution(),
            required_approvals: match effect {
                Effect::RequireApproval => Some(1),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::{ActionClass, Principal, Resource};
    use crate::infrastructure::policy_loader::PolicyLoader;
    use chrono::TimeZone;

    fn engine(yaml: &str) -> PolicyEngine {
        PolicyEngine::new(PolicyLoader::from_yaml_str(yaml).unwrap())
    }

    fn request(resource: Resource, action: ActionClass) -> PolicyRequest {
        PolicyRequest::new(Principal::new("db-agent").with_role("operator"), resource, action)
    }

    fn orders() -> Resource {
        Resource::new("database", "orders").with_tag("environment", "production")
    }

    #[test]
    fn test_read_allowed() {
        let engine = engine(
            r#"
policies:
  - name: reads
    resources: [{ type: database }]
    rules:
      - actions: [read]
        effect: allow
"#,
        );
        let decision = engine.evaluate(&request(orders(), ActionClass::Read));
        assert_eq!(decision.effect, Effect::Allow);
        assert!(!decision.default_applied);
        assert_eq!(decision.policy_name.as_deref(), Some("reads"));
        assert_eq!(decision.rule_index, Some(0));
    }

    #[test]
    fn test_default_deny_when_no_policy_matches() {
        let engine = engine(
            r#"
default_effect: deny
policies:
  - name: orders-only
    resources: [{ type: database, name: orders }]
    rules:
      - actions: [read]
        effect: allow
"#,
        );
        let trace = engine.explain(&request(Resource::new("database", "unknown-db"), ActionClass::Read));
        assert_eq!(trace.decision.effect, Effect::Deny);
        assert!(trace.decision.default_applied);
        assert!(trace.decision.explanation.contains("no policy matched"));
        assert_eq!(trace.policies[0].skip_reason, Some(SkipReason::ResourceMismatch));
    }

    #[test]
    fn test_hard_deny_carries_message() {
        let engine = engine(
            r#"
policies:
  - name: no-drops
    resources: [{ type: database }]
    rules:
      - actions: [destructive]
        effect: deny
        message: prohibited
"#,
        );
        let decision = engine.evaluate(&request(orders(), ActionClass::Destructive));
        assert_eq!(decision.effect, Effect::Deny);
        assert_eq!(decision.message.as_deref(), Some("prohibited"));
        assert_eq!(decision.required_approvals, None);
        assert!(decision.explanation.contains("prohibited"));
    }

    #[test]
    fn test_only_matching_policy_contributes() {
        let engine = engine(
            r#"
policies:
  - name: staging
    resources: [{ type: database, tags: { environment: staging } }]
    rules:
      - actions: [write]
        effect: allow
  - name: production
    resources: [{ type: database, tags: { environment: production } }]
    rules:
      - actions: [write]
        effect: require_approval
      - actions: [write]
        effect: allow
"#,
        );
        let trace = engine.explain(&request(orders(), ActionClass::Write));
        assert_eq!(trace.decision.effect, Effect::RequireApproval);
        assert_eq!(trace.decision.policy_name.as_deref(), Some("production"));
        assert_eq!(trace.decision.rule_index, Some(0));
        assert_eq!(trace.policies.len(), 2);
        assert!(!trace.policies[0].matched);
        assert_eq!(trace.policies[1].rules.len(), 1);
    }

    #[test]
    fn test_deny_rule_never_becomes_approval() {
        let engine = engine(
            r#"
policies:
  - name: prod
    resources: [{ type: database }]
    rules:
      - actions: [destructive]
        effect: deny
        conditions:
          required_approvals: 3
      - actions: [destructive]
        effect: require_approval
"#,
        );
        let decision = engine.evaluate(&request(orders(), ActionClass::Destructive).with_rows_affected(0));
        assert_eq!(decision.effect, Effect::Deny);
        assert_eq!(decision.required_approvals, None);
    }

    const LIMITED: &str = r#"
policies:
  - name: bulk-writes
    resources: [{ type: database }]
    rules:
      - actions: [write]
        effect: allow
        conditions:
          max_rows_affected: 100
"#;

    #[test]
    fn test_limit_is_strictly_greater_than() {
        let engine = engine(LIMITED);

        let at_limit = engine.evaluate(&request(orders(), ActionClass::Write).with_rows_affected(100));
        assert_eq!(at_limit.effect, Effect::Allow);
        assert!(at_limit.post_execution);

        let over = engine.explain(&request(orders(), ActionClass::Write).with_rows_affected(101));
        assert_eq!(over.decision.effect, Effect::Deny);
        assert!(over.decision.post_execution);
        let failed = over
            .conditions
            .iter()
            .find(|c| c.outcome == ConditionOutcome::Failed)
            .unwrap();
        assert!(failed.detail.contains("101"));
        assert!(failed.detail.contains("100"));
        assert!(over.decision.explanation.contains("post-execution"));
    }

    #[test]
    fn test_limit_not_evaluated_before_execution() {
        let engine = engine(LIMITED);
        let trace = engine.explain(&request(orders(), ActionClass::Write));
        assert_eq!(trace.decision.effect, Effect::Allow);
        assert!(!trace.decision.post_execution);
        assert_eq!(trace.conditions[0].outcome, ConditionOutcome::NotEvaluated);
        assert!(trace.decision.explanation.contains("max_rows_affected"));
    }

    #[test]
    fn test_failed_condition_does_not_fall_through() {
        let engine = engine(
            r#"
policies:
  - name: writes
    resources: [{ type: "*" }]
    rules:
      - actions: [write]
        effect: allow
        conditions:
          max_resources_affected: 2
      - actions: [write]
        effect: allow
"#,
        );
        let decision = engine.evaluate(
            &request(Resource::new("kubernetes_deployment", "api"), ActionClass::Write).with_resources_affected(5),
        );
        assert_eq!(decision.effect, Effect::Deny);
        assert_eq!(decision.rule_index, Some(0));
    }

    #[test]
    fn test_explanations_are_byte_identical() {
        let engine = engine(LIMITED);
        let req = request(orders(), ActionClass::Write).with_rows_affected(500);
        let a = engine.explain(&req);
        let b = engine.explain(&req);
        assert_eq!(a.decision.explanation, b.decision.explanation);
        assert_eq!(a, b);
    }

    #[test]
    fn test_principal_and_disabled_skips() {
        let engine = engine(
            r#"
policies:
  - name: retired
    enabled: false
    resources: [{ type: "*" }]
    rules:
      - actions: [read]
        effect: deny
  - name: dba-only
    resources: [{ type: database }]
    principals: [{ role: dba }]
    rules:
      - actions: [read]
        effect: deny
  - name: everyone
    resources: [{ type: database }]
    rules:
      - actions: [read]
        effect: allow
"#,
        );
        let trace = engine.explain(&request(orders(), ActionClass::Read));
        assert_eq!(trace.decision.effect, Effect::Allow);
        assert_eq!(trace.policies[0].skip_reason, Some(SkipReason::Disabled));
        assert_eq!(trace.policies[1].skip_reason, Some(SkipReason::PrincipalMismatch));
        assert_eq!(trace.decision.policy_name.as_deref(), Some("everyone"));
    }

    #[test]
    fn test_matched_policy_without_rule_falls_to_default() {
        let engine = engine(
            r#"
default_effect: require_approval
policies:
  - name: reads-only
    resources: [{ type: database }]
    rules:
      - actions: [read]
        effect: allow
"#,
        );
        let trace = engine.explain(&request(orders(), ActionClass::Write));
        assert_eq!(trace.decision.effect, Effect::RequireApproval);
        assert!(trace.decision.default_applied);
        assert_eq!(trace.policies[0].skip_reason, Some(SkipReason::NoRuleMatched));
    }

    #[test]
    fn test_schedule_gates_rule() {
        let engine = engine(
            r#"
policies:
  - name: maintenance-window
    resources: [{ type: database }]
    rules:
      - actions: [destructive]
        effect: require_approval
        conditions:
          required_approvals: 2
          schedule: { days: [Sat, Sun], start_hour: 1, end_hour: 5 }
      - actions: [destructive]
        effect: deny
        message: destructive changes only inside the weekend window
"#,
        );
        // 2026-10-17 is a Saturday.
        let inside = Utc.with_ymd_and_hms(2026, 10, 17, 2, 30, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2026, 10, 19, 14, 0, 0).unwrap();

        let open = engine.evaluate(&request(orders(), ActionClass::Destructive).at(inside));
        assert_eq!(open.effect, Effect::RequireApproval);
        assert_eq!(open.required_approvals, Some(2));

        let closed = engine.explain(&request(orders(), ActionClass::Destructive).at(outside));
        assert_eq!(closed.decision.effect, Effect::Deny);
        assert_eq!(closed.decision.rule_index, Some(1));
        assert_eq!(closed.conditions[0].outcome, ConditionOutcome::Failed);
    }
}
