//! Risk assessment for remediation plans
//!
//! An ordered set of [`RiskRule`] value objects scores a plan before it may
//! execute. Built-in rules scan each step's command text for destructive
//! keyword families; the accumulated score is quantised into a
//! [`RiskLevel`] via configurable thresholds, which in turn decides whether
//! execution needs interactive confirmation or explicit approval.
//!
//! Assessment is pure: it never mutates the plan and touches no external
//! state.

use crate::plan::Plan;
use crate::snapshot::infer_targets;
use serde::{Deserialize, Serialize};

/// Quantised severity derived from the accumulated rule score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::Critical => "Critical",
        };
        write!(f, "{name}")
    }
}

/// Score thresholds mapping to levels, plus the auto-confirm bound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Scores at or above this are at least Medium
    pub medium: u32,
    /// Scores at or above this are at least High
    pub high: u32,
    /// Scores at or above this are Critical
    pub critical: u32,
    /// Scores below this skip interactive confirmation
    pub auto_confirm_below: u32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium: 30,
            high: 60,
            critical: 90,
            auto_confirm_below: 20,
        }
    }
}

impl RiskThresholds {
    /// Level for an accumulated score
    pub fn level_for(&self, score: u32) -> RiskLevel {
        if score >= self.critical {
            RiskLevel::Critical
        } else if score >= self.high {
            RiskLevel::High
        } else if score >= self.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Estimated blast radius of executing a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactEstimate {
    /// Identifiers of resources the plan is expected to touch
    pub affected_resources: Vec<String>,
    /// Expected unavailability in seconds
    pub estimated_downtime_secs: u64,
    /// Whether the effects can be undone
    pub reversible: bool,
    /// Whether data may be lost
    pub data_loss_risk: bool,
}

/// Full result of assessing one plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Accumulated score, 0-100
    pub score: u32,
    /// Level derived from the thresholds
    pub level: RiskLevel,
    /// One reason per matched rule, in rule order
    pub reasons: Vec<String>,
    /// One mitigation suggestion per matched rule, in rule order
    pub mitigations: Vec<String>,
    /// Estimated impact
    pub impact: ImpactEstimate,
    /// Execution must be confirmed interactively
    pub requires_confirm: bool,
    /// Execution additionally needs explicit approval
    pub requires_approval: bool,
}

/// What a matched rule contributes to the assessment
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    /// Score contribution (counted once per rule)
    pub score: u32,
    /// Why the rule matched
    pub reason: String,
    /// How to reduce the risk
    pub mitigation: String,
}

/// One risk rule: a predicate over a plan plus its contribution
pub trait RiskRule: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;
    /// Does this rule apply to the plan?
    fn matches(&self, plan: &Plan) -> bool;
    /// Contribution when matched
    fn evaluate(&self, plan: &Plan) -> RuleOutcome;
}

/// Keyword-scanning rule over each step's command text
pub struct KeywordRule {
    name: String,
    keywords: Vec<&'static str>,
    score: u32,
    reason: String,
    mitigation: String,
}

impl KeywordRule {
    /// Build a rule matching any of the given upper-case keywords
    pub fn new(
        name: impl Into<String>,
        keywords: Vec<&'static str>,
        score: u32,
        reason: impl Into<String>,
        mitigation: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            keywords,
            score,
            reason: reason.into(),
            mitigation: mitigation.into(),
        }
    }

    /// Commands that destroy data
    pub fn data_deletion() -> Self {
        Self::new(
            "data_deletion",
            vec!["DELETE", "DEL", "TRUNCATE", "DROP", "FLUSHALL", "FLUSHDB"],
            70,
            "plan contains data-deletion commands, data loss is possible",
            "take a verified backup before executing and confirm the target scope",
        )
    }

    /// Commands that bounce a service
    pub fn service_restart() -> Self {
        Self::new(
            "service_restart",
            vec!["RESTART", "SHUTDOWN", "KILL"],
            40,
            "plan restarts or stops a service, expect short unavailability",
            "schedule a maintenance window or drain traffic first",
        )
    }

    /// Commands that change runtime configuration
    pub fn config_change() -> Self {
        Self::new(
            "config_change",
            vec!["CONFIG SET", "SET GLOBAL", "SED", "ECHO"],
            30,
            "plan changes configuration, service behaviour will change",
            "record the previous values so the change can be reverted",
        )
    }
}

impl RiskRule for KeywordRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, plan: &Plan) -> bool {
        plan.steps.iter().any(|step| {
            let text = step.command_text().to_uppercase();
            self.keywords.iter().any(|kw| text.contains(kw))
        })
    }

    fn evaluate(&self, _plan: &Plan) -> RuleOutcome {
        RuleOutcome {
            score: self.score,
            reason: self.reason.clone(),
            mitigation: self.mitigation.clone(),
        }
    }
}

/// Evaluates an ordered rule set against plans
pub struct RiskAssessor {
    rules: Vec<Box<dyn RiskRule>>,
    thresholds: RiskThresholds,
}

impl RiskAssessor {
    /// Assessor with the built-in rules and default thresholds
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(KeywordRule::data_deletion()),
                Box::new(KeywordRule::service_restart()),
                Box::new(KeywordRule::config_change()),
            ],
            thresholds: RiskThresholds::default(),
        }
    }

    /// Assessor with no rules (everything scores Low)
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            thresholds: RiskThresholds::default(),
        }
    }

    /// Override the thresholds
    pub fn with_thresholds(mut self, thresholds: RiskThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Register an additional rule. A rule with the same name replaces the
    /// existing one, keeping its position in the order.
    pub fn register(&mut self, rule: Box<dyn RiskRule>) {
        if let Some(existing) = self.rules.iter_mut().find(|r| r.name() == rule.name()) {
            *existing = rule;
        } else {
            self.rules.push(rule);
        }
    }

    /// Names of the registered rules, in evaluation order
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Assess a plan. Each rule contributes at most once, regardless of how
    /// many steps match it.
    pub fn assess(&self, plan: &Plan) -> RiskAssessment {
        let mut score: u32 = 0;
        let mut reasons = Vec::new();
        let mut mitigations = Vec::new();

        for rule in &self.rules {
            if !rule.matches(plan) {
                continue;
            }
            let outcome = rule.evaluate(plan);
            score = score.saturating_add(outcome.score);
            reasons.push(outcome.reason);
            mitigations.push(outcome.mitigation);
        }
        let score = score.min(100);
        let level = self.thresholds.level_for(score);

        let affected_resources: Vec<String> = infer_targets(plan)
            .into_iter()
            .map(|target| target.id)
            .collect();
        let impact = ImpactEstimate {
            affected_resources,
            estimated_downtime_secs: match level {
                RiskLevel::High | RiskLevel::Critical => 300,
                RiskLevel::Medium => 60,
                RiskLevel::Low => 0,
            },
            reversible: level < RiskLevel::High,
            data_loss_risk: level >= RiskLevel::High,
        };

        RiskAssessment {
            score,
            level,
            reasons,
            mitigations,
            impact,
            requires_confirm: score >= self.thresholds.auto_confirm_below,
            requires_approval: level == RiskLevel::Critical,
        }
    }
}

impl Default for RiskAssessor {
    fn default() -> Self {
        Self::new()
    }
}
