// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Stream detectors. Each one sees every event once, in feed order, and
//! keeps only the rolling state it needs. Time is taken from event
//! timestamps, never from the wall clock.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Utc, Weekday};
use lru::LruCache;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;

use crate::domain::alert::Alert;
use crate::domain::audit::{AuditEvent, EventPayload, Severity};
use crate::domain::governance_config::{BusinessHours, MonitorConfig};
use crate::domain::policy::{ActionClass, Effect};

const TRACKED_TRACES: usize = 10_000;
const TRACKED_SESSIONS: usize = 1_024;

pub trait Detector: Send {
    fn name(&self) -> &'static str;

    fn observe(&mut self, event: &AuditEvent) -> Vec<Alert>;

    /// The feed dropped events. Detectors whose state depends on seeing
    /// every event reset here.
    fn on_gap(&mut self, _missed: u64) {}
}

/// The full detector set, configured from the monitor section.
pub fn standard_detectors(config: &MonitorConfig) -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(VolumeDetector::new(config.volume_threshold_per_minute)),
        Box::new(OffHoursDetector::new(config.business_hours.clone())),
        Box::new(DestructiveActionDetector::new()),
        Box::new(ViolationDetector),
        Box::new(ChainContinuityDetector::default()),
        Box::new(LoopDetector::new(
            config.loop_threshold,
            Duration::seconds(config.loop_window_seconds),
        )),
        Box::new(ErrorRateDetector::new(config.error_rate_threshold, config.error_rate_min_calls)),
    ]
}

/// Events per rolling minute above a threshold. One alert per minute at most.
pub struct VolumeDetector {
    threshold: usize,
    window: VecDeque<DateTime<Utc>>,
    quiet_until: Option<DateTime<Utc>>,
}

impl VolumeDetector {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            window: VecDeque::new(),
            quiet_until: None,
        }
    }
}

impl Detector for VolumeDetector {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn observe(&mut self, event: &AuditEvent) -> Vec<Alert> {
        let now = event.timestamp;
        self.window.push_back(now);
        while let Some(oldest) = self.window.front() {
            if now - *oldest >= Duration::minutes(1) {
                self.window.pop_front();
            } else {
                break;
            }
        }

        if self.window.len() <= self.threshold || self.quiet_until.is_some_and(|until| now < until) {
            return vec![];
        }
        self.quiet_until = Some(now + Duration::minutes(1));
        vec![Alert::new(
            Severity::Warning,
            self.name(),
            "Audit event volume spike",
            format!(
                "{} events in the last minute exceeds threshold {}",
                self.window.len(),
                self.threshold
            ),
        )
        .for_event(event)]
    }
}

/// Mutating tool calls outside business hours.
pub struct OffHoursDetector {
    hours: BusinessHours,
}

impl OffHoursDetector {
    pub fn new(hours: BusinessHours) -> Self {
        Self { hours }
    }

    fn is_business_time(&self, at: DateTime<Utc>) -> bool {
        let Some(offset) = FixedOffset::east_opt(self.hours.utc_offset_hours * 3600) else {
            return true;
        };
        let local = at.with_timezone(&offset);
        if self.hours.weekdays_only && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        (self.hours.start_hour..self.hours.end_hour).contains(&local.hour())
    }
}

impl Detector for OffHoursDetector {
    fn name(&self) -> &'static str {
        "off_hours"
    }

    fn observe(&mut self, event: &AuditEvent) -> Vec<Alert> {
        let EventPayload::ToolCall { tool_name, .. } = &event.payload else {
            return vec![];
        };
        let Some(action) = event.action_class.filter(|a| a.is_mutating()) else {
            return vec![];
        };
        if self.is_business_time(event.timestamp) {
            return vec![];
        }
        let severity = if action == ActionClass::Destructive {
            Severity::Critical
        } else {
            Severity::Warning
        };
        vec![Alert::new(
            severity,
            self.name(),
            "Off-hours mutation",
            format!(
                "{} ran {} tool '{}' at {} outside business hours {:02}:00-{:02}:00",
                event.agent,
                action,
                tool_name,
                event.timestamp.to_rfc3339(),
                self.hours.start_hour,
                self.hours.end_hour
            ),
        )
        .for_event(event)]
    }
}

/// Destructive tool calls with no allowing decision seen for them, denied
/// destructive requests, and post-execution denials.
///
/// Traced calls are authorized by any allowing decision on their trace.
/// Untraced calls fall back to the session: each allowed destructive
/// decision grants exactly one destructive call in that session.
pub struct DestructiveActionDetector {
    authorized_traces: LruCache<String, ()>,
    session_grants: LruCache<String, u32>,
}

impl DestructiveActionDetector {
    pub fn new() -> Self {
        Self {
            authorized_traces: LruCache::new(NonZeroUsize::new(TRACKED_TRACES).unwrap_or(NonZeroUsize::MIN)),
            session_grants: LruCache::new(NonZeroUsize::new(TRACKED_SESSIONS).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    fn grant(&mut self, event: &AuditEvent, action: ActionClass) {
        match &event.trace_id {
            Some(trace) => {
                self.authorized_traces.put(trace.clone(), ());
            }
            None if action == ActionClass::Destructive => {
                let grants = self.session_grants.get_or_insert_mut(event.session_id.clone(), || 0);
                *grants = grants.saturating_add(1);
            }
            None => {}
        }
    }

    fn consume(&mut self, event: &AuditEvent) -> bool {
        match &event.trace_id {
            Some(trace) => self.authorized_traces.get(trace).is_some(),
            None => match self.session_grants.get_mut(&event.session_id) {
                Some(grants) if *grants > 0 => {
                    *grants -= 1;
                    true
                }
                _ => false,
            },
        }
    }
}

impl Default for DestructiveActionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for DestructiveActionDetector {
    fn name(&self) -> &'static str {
        "destructive_action"
    }

    fn observe(&mut self, event: &AuditEvent) -> Vec<Alert> {
        match &event.payload {
            EventPayload::PolicyDecision {
                action,
                effect,
                post_execution,
                resource_type,
                resource_name,
                explanation,
                ..
            } => match (effect, post_execution) {
                (Effect::Allow, false) => {
                    self.grant(event, *action);
                    vec![]
                }
                (Effect::Deny, true) => vec![Alert::new(
                    Severity::Critical,
                    self.name(),
                    "Blast radius exceeded",
                    format!("{} on {} '{}': {}", action, resource_type, resource_name, explanation),
                )
                .for_event(event)],
                (Effect::Deny, false) if *action == ActionClass::Destructive => vec![Alert::new(
                    Severity::Warning,
                    self.name(),
                    "Destructive action denied",
                    format!("{} on {} '{}': {}", event.agent, resource_type, resource_name, explanation),
                )
                .for_event(event)],
                _ => vec![],
            },
            EventPayload::ToolCall { tool_name, .. } if event.action_class == Some(ActionClass::Destructive) => {
                if self.consume(event) {
                    return vec![];
                }
                vec![Alert::new(
                    Severity::Critical,
                    self.name(),
                    "Unauthorized destructive tool call",
                    format!(
                        "{} ran destructive tool '{}' with no allowing policy decision for {}",
                        event.agent,
                        tool_name,
                        match &event.trace_id {
                            Some(trace) => format!("trace {}", trace),
                            None => format!("session {}", event.session_id),
                        }
                    ),
                )
                .for_event(event)]
            }
            _ => vec![],
        }
    }
}

/// Surfaces `governance_violation` events at their recorded severity.
pub struct ViolationDetector;

impl Detector for ViolationDetector {
    fn name(&self) -> &'static str {
        "governance_violation"
    }

    fn observe(&mut self, event: &AuditEvent) -> Vec<Alert> {
        match &event.payload {
            EventPayload::GovernanceViolation { module, severity, detail } => vec![Alert::new(
                *severity,
                self.name(),
                format!("Governance violation in {}", module),
                detail.clone(),
            )
            .for_event(event)],
            _ => vec![],
        }
    }
}

/// Real-time tamper check, independent of the store's own verification.
#[derive(Default)]
pub struct ChainContinuityDetector {
    last_seen_hash: Option<String>,
}

impl ChainContinuityDetector {
    pub fn last_seen_hash(&self) -> Option<&str> {
        self.last_seen_hash.as_deref()
    }
}

impl Detector for ChainContinuityDetector {
    fn name(&self) -> &'static str {
        "chain_continuity"
    }

    fn observe(&mut self, event: &AuditEvent) -> Vec<Alert> {
        if event.is_legacy() {
            return vec![];
        }
        let mut alerts = Vec::new();
        if !event.hash_is_valid() {
            alerts.push(
                Alert::new(
                    Severity::Critical,
                    self.name(),
                    "Audit event hash mismatch",
                    format!("stored hash of {} does not match its body", event.event_id),
                )
                .for_event(event),
            );
        }
        if let Some(expected) = &self.last_seen_hash {
            if event.prev_hash.as_deref() != Some(expected.as_str()) {
                alerts.push(
                    Alert::new(
                        Severity::Critical,
                        self.name(),
                        "Audit chain discontinuity",
                        format!(
                            "{} links to {} but the last seen hash is {}",
                            event.event_id,
                            event.prev_hash.as_deref().unwrap_or("<none>"),
                            expected
                        ),
                    )
                    .for_event(event),
                );
            }
        }
        self.last_seen_hash = event.event_hash.clone();
        alerts
    }

    fn on_gap(&mut self, _missed: u64) {
        self.last_seen_hash = None;
    }
}

/// Identical tool calls repeated inside one session.
pub struct LoopDetector {
    threshold: usize,
    window: Duration,
    sessions: LruCache<String, VecDeque<(DateTime<Utc>, String)>>,
}

impl LoopDetector {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(2),
            window,
            sessions: LruCache::new(NonZeroUsize::new(TRACKED_SESSIONS).unwrap_or(NonZeroUsize::MIN)),
        }
    }
}

impl Detector for LoopDetector {
    fn name(&self) -> &'static str {
        "loop"
    }

    fn observe(&mut self, event: &AuditEvent) -> Vec<Alert> {
        let EventPayload::ToolCall { tool_name, params, .. } = &event.payload else {
            return vec![];
        };
        let fingerprint = format!("{}:{}", tool_name, params);
        let now = event.timestamp;
        let window = self.window;

        let history = self.sessions.get_or_insert_mut(event.session_id.clone(), VecDeque::new);
        history.retain(|(at, _)| now - *at < window);
        history.push_back((now, fingerprint.clone()));
        let repeats = history.iter().filter(|(_, f)| *f == fingerprint).count();

        // Alert once, when the threshold is crossed.
        if repeats != self.threshold {
            return vec![];
        }
        vec![Alert::new(
            Severity::Warning,
            self.name(),
            "Repeated tool call",
            format!(
                "{} called '{}' with identical parameters {} times within {}s",
                event.agent,
                tool_name,
                repeats,
                window.num_seconds()
            ),
        )
        .for_event(event)]
    }
}

#[derive(Default)]
struct AgentCalls {
    calls: u64,
    errors: u64,
    alerting: bool,
}

/// Per-agent tool failure rate. Alerts when the rate crosses the threshold
/// and re-arms once it falls back below.
pub struct ErrorRateDetector {
    threshold: f64,
    min_calls: u64,
    agents: HashMap<String, AgentCalls>,
}

impl ErrorRateDetector {
    pub fn new(threshold: f64, min_calls: u64) -> Self {
        Self {
            threshold,
            min_calls: min_calls.max(1),
            agents: HashMap::new(),
        }
    }
}

impl Detector for ErrorRateDetector {
    fn name(&self) -> &'static str {
        "error_rate"
    }

    fn observe(&mut self, event: &AuditEvent) -> Vec<Alert> {
        let EventPayload::ToolCall { success, .. } = &event.payload else {
            return vec![];
        };
        let stats = self.agents.entry(event.agent.clone()).or_default();
        stats.calls += 1;
        if !success {
            stats.errors += 1;
        }
        if stats.calls < self.min_calls {
            return vec![];
        }

        let rate = stats.errors as f64 / stats.calls as f64;
        if rate <= self.threshold {
            stats.alerting = false;
            return vec![];
        }
        if stats.alerting {
            return vec![];
        }
        stats.alerting = true;
        vec![Alert::new(
            Severity::Warning,
            "error_rate",
            "Elevated tool error rate",
            format!(
                "{} failed {} of {} tool calls ({:.0}%)",
                event.agent,
                stats.errors,
                stats.calls,
                rate * 100.0
            ),
        )
        .for_event(event)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::{NewAuditEvent, GENESIS_HASH};
    use chrono::TimeZone;
    use serde_json::json;

    fn sealed(draft: NewAuditEvent, at: DateTime<Utc>, prev: &str) -> AuditEvent {
        let mut event = AuditEvent::from_new(draft, at);
        event.seal(prev).unwrap();
        event
    }

    fn tool_call(trace: &str, action: ActionClass, success: bool) -> NewAuditEvent {
        NewAuditEvent::new(
            "session-1",
            "k8s-agent",
            EventPayload::ToolCall {
                tool_name: "kubectl.delete".into(),
                params: json!({"namespace": "payments", "kind": "pod"}),
                result: None,
                duration_ms: 12,
                success,
            },
        )
        .with_trace(trace)
        .with_action_class(action)
    }

    fn decision(trace: &str, effect: Effect, post_execution: bool) -> NewAuditEvent {
        NewAuditEvent::new(
            "session-1",
            "k8s-agent",
            EventPayload::PolicyDecision {
                resource_type: "kubernetes_namespace".into(),
                resource_name: "payments".into(),
                action: ActionClass::Destructive,
                effect,
                policy_name: Some("k8s".into()),
                rule_index: Some(0),
                explanation: "test".into(),
                post_execution,
                approval_id: None,
            },
        )
        .with_trace(trace)
        .with_action_class(ActionClass::Destructive)
    }

    // Wednesday
    fn midday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_volume_spike_alerts_once_per_minute() {
        let mut detector = VolumeDetector::new(3);
        let start = midday();
        let alerts: usize = (0..10)
            .map(|i| {
                let event = sealed(tool_call("t", ActionClass::Read, true), start + Duration::seconds(i), GENESIS_HASH);
                detector.observe(&event).len()
            })
            .sum();
        assert_eq!(alerts, 1);

        // Window has rolled over: quiet again.
        let later = sealed(tool_call("t", ActionClass::Read, true), start + Duration::minutes(5), GENESIS_HASH);
        assert!(detector.observe(&later).is_empty());
    }

    #[test]
    fn test_off_hours_write() {
        let mut detector = OffHoursDetector::new(BusinessHours::default());
        let night = Utc.with_ymd_and_hms(2026, 3, 4, 2, 0, 0).unwrap();
        let saturday = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();

        let write = sealed(tool_call("t", ActionClass::Write, true), night, GENESIS_HASH);
        assert_eq!(detector.observe(&write)[0].severity, Severity::Warning);

        let destructive = sealed(tool_call("t", ActionClass::Destructive, true), saturday, GENESIS_HASH);
        assert_eq!(detector.observe(&destructive)[0].severity, Severity::Critical);

        let read = sealed(tool_call("t", ActionClass::Read, true), night, GENESIS_HASH);
        assert!(detector.observe(&read).is_empty());

        let daytime = sealed(tool_call("t", ActionClass::Write, true), midday(), GENESIS_HASH);
        assert!(detector.observe(&daytime).is_empty());
    }

    #[test]
    fn test_unauthorized_destructive_call() {
        let mut detector = DestructiveActionDetector::new();
        let unapproved = sealed(tool_call("trace-a", ActionClass::Destructive, true), midday(), GENESIS_HASH);
        let alerts = detector.observe(&unapproved);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);

        let allow = sealed(decision("trace-b", Effect::Allow, false), midday(), GENESIS_HASH);
        assert!(detector.observe(&allow).is_empty());
        let approved = sealed(tool_call("trace-b", ActionClass::Destructive, true), midday(), GENESIS_HASH);
        assert!(detector.observe(&approved).is_empty());
    }

    #[test]
    fn test_untraced_destructive_call_uses_session_grant() {
        let mut detector = DestructiveActionDetector::new();
        let mut allow = decision("unused", Effect::Allow, false);
        allow.trace_id = None;
        let mut call = tool_call("unused", ActionClass::Destructive, true);
        call.trace_id = None;

        let allow = sealed(allow, midday(), GENESIS_HASH);
        assert!(detector.observe(&allow).is_empty());
        let first = sealed(call.clone(), midday(), GENESIS_HASH);
        assert!(detector.observe(&first).is_empty());

        // The single grant is spent.
        let second = sealed(call.clone(), midday(), GENESIS_HASH);
        let alerts = detector.observe(&second);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].detail.contains("session session-1"));

        let mut other_session = call;
        other_session.session_id = "session-2".into();
        let other = sealed(other_session, midday(), GENESIS_HASH);
        assert_eq!(detector.observe(&other).len(), 1);
    }

    #[test]
    fn test_denials() {
        let mut detector = DestructiveActionDetector::new();
        let denied = sealed(decision("t", Effect::Deny, false), midday(), GENESIS_HASH);
        assert_eq!(detector.observe(&denied)[0].severity, Severity::Warning);
        let post = sealed(decision("t", Effect::Deny, true), midday(), GENESIS_HASH);
        let alerts = detector.observe(&post);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].title, "Blast radius exceeded");
    }

    #[test]
    fn test_violation_keeps_severity() {
        let mut detector = ViolationDetector;
        let event = sealed(
            NewAuditEvent::new(
                "s",
                "db-agent",
                EventPayload::GovernanceViolation {
                    module: "audit".into(),
                    severity: Severity::Critical,
                    detail: "audit store unreachable".into(),
                },
            ),
            midday(),
            GENESIS_HASH,
        );
        let alerts = detector.observe(&event);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].detail, "audit store unreachable");
    }

    #[test]
    fn test_chain_continuity() {
        let mut detector = ChainContinuityDetector::default();
        let first = sealed(tool_call("t", ActionClass::Read, true), midday(), GENESIS_HASH);
        let second = sealed(
            tool_call("t", ActionClass::Read, true),
            midday(),
            first.event_hash.as_deref().unwrap(),
        );
        assert!(detector.observe(&first).is_empty());
        assert!(detector.observe(&second).is_empty());

        // An event that skips its predecessor.
        let forged = sealed(tool_call("t", ActionClass::Read, true), midday(), GENESIS_HASH);
        let alerts = detector.observe(&forged);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].title, "Audit chain discontinuity");

        // A body edited after sealing.
        let mut tampered = sealed(
            tool_call("t", ActionClass::Read, true),
            midday(),
            forged.event_hash.as_deref().unwrap(),
        );
        tampered.agent = "someone-else".into();
        let alerts = detector.observe(&tampered);
        assert_eq!(alerts[0].title, "Audit event hash mismatch");
    }

    #[test]
    fn test_gap_resets_checkpoint() {
        let mut detector = ChainContinuityDetector::default();
        let first = sealed(tool_call("t", ActionClass::Read, true), midday(), GENESIS_HASH);
        detector.observe(&first);
        detector.on_gap(4);
        assert!(detector.last_seen_hash().is_none());

        let unrelated = sealed(tool_call("t", ActionClass::Read, true), midday(), &"f".repeat(64));
        assert!(detector.observe(&unrelated).is_empty());
    }

    #[test]
    fn test_loop_detection() {
        let mut detector = LoopDetector::new(3, Duration::minutes(5));
        let start = midday();
        let alerts: Vec<_> = (0..5)
            .flat_map(|i| {
                let event = sealed(tool_call("t", ActionClass::Read, true), start + Duration::seconds(i), GENESIS_HASH);
                detector.observe(&event)
            })
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].detector, "loop");
    }

    #[test]
    fn test_error_rate() {
        let mut detector = ErrorRateDetector::new(0.5, 4);
        let outcomes = [false, false, true, false, false, true];
        let alerts: usize = outcomes
            .iter()
            .map(|ok| {
                let event = sealed(tool_call("t", ActionClass::Read, *ok), midday(), GENESIS_HASH);
                detector.observe(&event).len()
            })
            .sum();
        assert_eq!(alerts, 1);
    }
}
