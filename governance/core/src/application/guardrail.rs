// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Blast-Radius Guardrail
//!
//! Second, mandatory evaluation of a mutating action after it ran. The
//! affected count is read from the tool's own confirmation output and fed
//! back into the [`PolicyEngine`]. A `deny` on the re-check means the
//! result must be withheld from downstream consumers; it does not undo the
//! mutation.

use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::application::policy_engine::PolicyEngine;
use crate::domain::policy::{Decision, Effect, PolicyRequest};

static ROW_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d+)\s+rows?\b").expect("invalid row count pattern"));

/// PostgreSQL command tags: `DELETE 12`, `UPDATE 3`, `INSERT 0 40`.
static COMMAND_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:(?:DELETE|UPDATE|MERGE)\s+(\d+)|INSERT\s+\d+\s+(\d+))\s*$")
        .expect("invalid command tag pattern")
});

static RESOURCE_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d+)\s+resources?\b").expect("invalid resource count pattern"));

/// kubectl confirmation lines: `pod "web-7d4f" deleted`.
static KUBECTL_DELETED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*[\w.\-/]+\s+"[^"]+"\s+deleted\b"#).expect("invalid kubectl pattern")
});

/// Affected counts read from tool output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlastRadius {
    pub rows_affected: Option<u64>,
    pub resources_affected: Option<u64>,
}

/// Captures are digit runs, so the only parse failure is overflow.
fn saturating_count(digits: &str) -> u64 {
    digits.parse().unwrap_or(u64::MAX)
}

impl BlastRadius {
    /// Largest count reported for each dimension. Output with no
    /// recognizable count yields an empty radius.
    pub fn parse(output: &str) -> Self {
        let rows = ROW_COUNT
            .captures_iter(output)
            .filter_map(|c| c.get(1))
            .chain(
                COMMAND_TAG
                    .captures_iter(output)
                    .filter_map(|c| c.get(1).or_else(|| c.get(2))),
            )
            .map(|m| saturating_count(m.as_str()))
            .max();

        let stated = RESOURCE_COUNT
            .captures_iter(output)
            .filter_map(|c| c.get(1))
            .map(|m| saturating_count(m.as_str()))
            .max();
        let deleted = KUBECTL_DELETED.find_iter(output).count() as u64;
        let resources = match (stated, deleted) {
            (Some(n), d) => Some(n.max(d)),
            (None, 0) => None,
            (None, d) => Some(d),
        };

        Self {
            rows_affected: rows,
            resources_affected: resources,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows_affected.is_none() && self.resources_affected.is_none()
    }

    fn apply(&self, request: &PolicyRequest) -> PolicyRequest {
        let mut request = request.clone();
        if let Some(rows) = self.rows_affected {
            request = request.with_rows_affected(rows);
        }
        if let Some(resources) = self.resources_affected {
            request = request.with_resources_affected(resources);
        }
        request
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailOutcome {
    /// Read-only action; nothing to re-check.
    NotApplicable,
    /// Output carried no count, so limits could not be evaluated.
    Unmeasured,
    Passed { radius: BlastRadius, decision: Decision },
    /// Observed scope exceeded a limit. The tool result must be withheld.
    Withheld { radius: BlastRadius, decision: Decision },
}

impl GuardrailOutcome {
    pub fn is_withheld(&self) -> bool {
        matches!(self, GuardrailOutcome::Withheld { .. })
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            GuardrailOutcome::Passed { decision, .. } | GuardrailOutcome::Withheld { decision, .. } => Some(decision),
            _ => None,
        }
    }
}

pub struct BlastRadiusGuardrail {
    engine: Arc<PolicyEngine>,
}

impl BlastRadiusGuardrail {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self { engine }
    }

    /// Re-evaluate `request` (the pre-execution request) with the scope
    /// observed in `output`.
    pub fn check(&self, request: &PolicyRequest, output: &str) -> GuardrailOutcome {
        if !request.action.is_mutating() {
            return GuardrailOutcome::NotApplicable;
        }
        let radius = BlastRadius::parse(output);
        if radius.is_empty() {
            debug!(resource = %request.resource.name, "No affected count in tool output");
            return GuardrailOutcome::Unmeasured;
        }
        self.check_observed(request, radius)
    }

    pub fn check_observed(&self, request: &PolicyRequest, radius: BlastRadius) -> GuardrailOutcome {
        let decision = self.engine.evaluate(&radius.apply(request));
        if decision.effect == Effect::Deny {
            warn!(
                resource_type = %request.resource.resource_type,
                resource = %request.resource.name,
                rows = ?radius.rows_affected,
                resources = ?radius.resources_affected,
                explanation = %decision.explanation,
                "Blast radius exceeded, withholding tool result"
            );
            GuardrailOutcome::Withheld { radius, decision }
        } else {
            GuardrailOutcome::Passed { radius, decision }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::policy_loader::PolicyLoader;
    use crate::domain::policy::{ActionClass, Principal, Resource};

    const POLICY: &str = r#"
default_effect: deny
policies:
  - name: orders-writes
    resources:
      - type: database
        name: orders
    rules:
      - actions: [write, destructive]
        effect: allow
        conditions:
          max_rows_affected: 100
      - actions: [read]
        effect: allow
  - name: cluster
    resources:
      - type: kubernetes_namespace
    rules:
      - actions: [destructive]
        effect: allow
        conditions:
          max_resources_affected: 3
"#;

    fn guardrail() -> BlastRadiusGuardrail {
        let config = PolicyLoader::from_yaml_str(POLICY).unwrap();
        BlastRadiusGuardrail::new(Arc::new(PolicyEngine::new(config)))
    }

    fn db_request(action: ActionClass) -> PolicyRequest {
        PolicyRequest::new(Principal::new("db-agent"), Resource::new("database", "orders"), action)
    }

    #[test]
    fn test_parse_command_tags() {
        assert_eq!(BlastRadius::parse("DELETE 1200").rows_affected, Some(1200));
        assert_eq!(BlastRadius::parse("UPDATE 7\n").rows_affected, Some(7));
        assert_eq!(BlastRadius::parse("INSERT 0 40").rows_affected, Some(40));
        assert_eq!(BlastRadius::parse("Query OK, 3 rows affected").rows_affected, Some(3));
        assert_eq!(BlastRadius::parse("(1 row)").rows_affected, Some(1));
    }

    #[test]
    fn test_parse_kubectl_output() {
        let output = "pod \"web-1\" deleted\npod \"web-2\" deleted\ndeployment.apps \"web\" deleted\n";
        let radius = BlastRadius::parse(output);
        assert_eq!(radius.resources_affected, Some(3));
        assert_eq!(radius.rows_affected, None);
        assert_eq!(BlastRadius::parse("scaled 12 resources").resources_affected, Some(12));
    }

    #[test]
    fn test_parse_nothing() {
        assert!(BlastRadius::parse("ok").is_empty());
    }

    #[test]
    fn test_limit_is_strict() {
        let guardrail = guardrail();
        let at_limit = guardrail.check(&db_request(ActionClass::Write), "UPDATE 100");
        assert!(matches!(at_limit, GuardrailOutcome::Passed { .. }));

        let over = guardrail.check(&db_request(ActionClass::Write), "UPDATE 101");
        assert!(over.is_withheld());
        let decision = over.decision().unwrap();
        assert_eq!(decision.effect, Effect::Deny);
        assert!(decision.post_execution);
        assert!(decision.explanation.contains("101"));
        assert!(decision.explanation.contains("100"));
    }

    #[test]
    fn test_overflowing_count_saturates() {
        let radius = BlastRadius::parse("DELETE 99999999999999999999999");
        assert_eq!(radius.rows_affected, Some(u64::MAX));

        let outcome = guardrail().check(&db_request(ActionClass::Write), "99999999999999999999999 rows affected");
        assert!(outcome.is_withheld());
    }

    #[test]
    fn test_reads_skip_recheck() {
        let outcome = guardrail().check(&db_request(ActionClass::Read), "(5000 rows)");
        assert_eq!(outcome, GuardrailOutcome::NotApplicable);
    }

    #[test]
    fn test_unmeasured_output() {
        let outcome = guardrail().check(&db_request(ActionClass::Destructive), "done");
        assert_eq!(outcome, GuardrailOutcome::Unmeasured);
    }

    #[test]
    fn test_resource_limit() {
        let request = PolicyRequest::new(
            Principal::new("k8s-agent"),
            Resource::new("kubernetes_namespace", "payments"),
            ActionClass::Destructive,
        );
        let output = (1..=4).map(|i| format!("pod \"api-{}\" deleted\n", i)).collect::<String>();
        assert!(guardrail().check(&request, &output).is_withheld());
    }
}
