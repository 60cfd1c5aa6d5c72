//! Declarative invalidation rules.
//!
//! A rule is data: an applicability filter (temporal types, optional fact
//! types) plus a list of [`Criterion`] values. Criteria are always evaluated
//! in the fixed order age → confidence → source pattern, whatever order they
//! were declared in, and the first one that fires decides the reason.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LetheError, Result};
use crate::fact::{Fact, FactType, InvalidationReason, TemporalType};

/// One test a rule applies to a fact. Each carries the reason it reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Criterion {
    /// Fires when the fact is older than `days`.
    MaxAge {
        days: f64,
        reason: InvalidationReason,
    },
    /// Fires when the fact's confidence is below `threshold`.
    MinConfidence {
        threshold: f64,
        reason: InvalidationReason,
    },
    /// Fires when the fact's source contains any of `patterns`
    /// (case-insensitive).
    SourcePattern {
        patterns: Vec<String>,
        reason: InvalidationReason,
    },
}

impl Criterion {
    pub fn max_age(days: f64) -> Self {
        Criterion::MaxAge {
            days,
            reason: InvalidationReason::TemporalExpiry,
        }
    }

    pub fn min_confidence(threshold: f64) -> Self {
        Criterion::MinConfidence {
            threshold,
            reason: InvalidationReason::ConfidenceThreshold,
        }
    }

    pub fn source_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Criterion::SourcePattern {
            patterns: patterns.into_iter().map(Into::into).collect(),
            reason: InvalidationReason::SourceOutdated,
        }
    }

    /// Override the reason this criterion reports.
    pub fn with_reason(mut self, new_reason: InvalidationReason) -> Self {
        match &mut self {
            Criterion::MaxAge { reason, .. }
            | Criterion::MinConfidence { reason, .. }
            | Criterion::SourcePattern { reason, .. } => *reason = new_reason,
        }
        self
    }

    pub fn reason(&self) -> InvalidationReason {
        match self {
            Criterion::MaxAge { reason, .. }
            | Criterion::MinConfidence { reason, .. }
            | Criterion::SourcePattern { reason, .. } => *reason,
        }
    }

    /// Evaluation rank: age, then confidence, then source.
    fn rank(&self) -> u8 {
        match self {
            Criterion::MaxAge { .. } => 0,
            Criterion::MinConfidence { .. } => 1,
            Criterion::SourcePattern { .. } => 2,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Criterion::MaxAge { days, .. } if !days.is_finite() || *days < 0.0 => {
                Err(LetheError::InvalidRule(format!(
                    "max age must be a non-negative number of days, got {days}"
                )))
            }
            Criterion::MinConfidence { threshold, .. }
                if !threshold.is_finite() || !(0.0..=1.0).contains(threshold) =>
            {
                Err(LetheError::InvalidRule(format!(
                    "confidence threshold must be within [0, 1], got {threshold}"
                )))
            }
            Criterion::SourcePattern { patterns, .. }
                if patterns.is_empty() || patterns.iter().any(|p| p.is_empty()) =>
            {
                Err(LetheError::InvalidRule(
                    "source patterns must be a non-empty list of non-empty strings".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    fn fires(&self, fact: &Fact, now: DateTime<Utc>) -> bool {
        match self {
            Criterion::MaxAge { days, .. } => fact.age_days(now) > *days,
            Criterion::MinConfidence { threshold, .. } => fact.confidence() < *threshold,
            Criterion::SourcePattern { patterns, .. } => {
                let source = fact.source.to_lowercase();
                patterns
                    .iter()
                    .any(|p| source.contains(p.to_lowercase().as_str()))
            }
        }
    }
}

/// How a rule combines its criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// The first criterion that fires matches the rule.
    #[default]
    Any,
    /// Every criterion must fire; the reason is the first criterion's.
    All,
}

/// Result of testing one fact against one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Matched(InvalidationReason),
    NoMatch,
}

fn default_true() -> bool {
    true
}

/// A named, persisted invalidation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationRule {
    pub rule_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Temporal types this rule considers. Facts of any other type never match.
    pub temporal_types: Vec<TemporalType>,
    /// Optional narrowing by fact type.
    #[serde(default)]
    pub fact_types: Option<Vec<FactType>>,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub match_mode: MatchMode,
    /// Registration order, assigned by the registry.
    #[serde(default)]
    pub position: u64,
}

impl InvalidationRule {
    pub fn new(
        rule_id: impl Into<String>,
        name: impl Into<String>,
        temporal_types: impl IntoIterator<Item = TemporalType>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            temporal_types: temporal_types.into_iter().collect(),
            fact_types: None,
            criteria: Vec::new(),
            match_mode: MatchMode::Any,
            position: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_fact_types(mut self, fact_types: impl IntoIterator<Item = FactType>) -> Self {
        self.fact_types = Some(fact_types.into_iter().collect());
        self
    }

    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn with_match_mode(mut self, mode: MatchMode) -> Self {
        self.match_mode = mode;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check the rule is well formed before it is registered.
    pub fn validate(&self) -> Result<()> {
        if self.rule_id.trim().is_empty() {
            return Err(LetheError::InvalidRule("rule id must not be empty".to_string()));
        }
        if self.temporal_types.is_empty() {
            return Err(LetheError::InvalidRule(format!(
                "rule `{}` must apply to at least one temporal type",
                self.rule_id
            )));
        }
        if self.criteria.is_empty() {
            return Err(LetheError::InvalidRule(format!(
                "rule `{}` has no criteria",
                self.rule_id
            )));
        }
        self.criteria.iter().try_for_each(Criterion::validate)
    }

    /// Test `fact` against this rule at `now`.
    ///
    /// Errors only when a criterion is malformed (for example a rule edited
    /// in storage to carry a NaN threshold).
    pub fn evaluate(&self, fact: &Fact, now: DateTime<Utc>) -> Result<RuleOutcome> {
        if !self.enabled || !self.temporal_types.contains(&fact.temporal_type) {
            return Ok(RuleOutcome::NoMatch);
        }
        if let Some(fact_types) = &self.fact_types {
            if !fact_types.contains(&fact.fact_type) {
                return Ok(RuleOutcome::NoMatch);
            }
        }

        let mut ordered: Vec<&Criterion> = self.criteria.iter().collect();
        ordered.sort_by_key(|c| c.rank());

        match self.match_mode {
            MatchMode::Any => {
                for criterion in ordered {
                    criterion.validate()?;
                    if criterion.fires(fact, now) {
                        return Ok(RuleOutcome::Matched(criterion.reason()));
                    }
                }
                Ok(RuleOutcome::NoMatch)
            }
            MatchMode::All => {
                let Some(first) = ordered.first() else {
                    return Ok(RuleOutcome::NoMatch);
                };
                for criterion in &ordered {
                    criterion.validate()?;
                    if !criterion.fires(fact, now) {
                        return Ok(RuleOutcome::NoMatch);
                    }
                }
                Ok(RuleOutcome::Matched(first.reason()))
            }
        }
    }

    /// Like [`evaluate`](Self::evaluate), with a malformed criterion counting
    /// as no match.
    pub fn matches(&self, fact: &Fact, now: DateTime<Utc>) -> (bool, Option<InvalidationReason>) {
        match self.evaluate(fact, now) {
            Ok(RuleOutcome::Matched(reason)) => (true, Some(reason)),
            Ok(RuleOutcome::NoMatch) | Err(_) => (false, None),
        }
    }
}

/// The rule set seeded into an empty registry, in evaluation order.
pub fn default_rules() -> Vec<InvalidationRule> {
    vec![
        InvalidationRule::new("dynamic_30d", "Dynamic facts - 30 days", [TemporalType::Dynamic])
            .with_description("Dynamic facts expire after 30 days")
            .with_criterion(Criterion::max_age(30.0)),
        InvalidationRule::new("predictions_90d", "Predictions - 90 days", TemporalType::ALL)
            .with_description("Predictions expire after 90 days")
            .with_fact_types([FactType::Prediction])
            .with_criterion(Criterion::max_age(90.0)),
        InvalidationRule::new("opinions_180d", "Opinions - 180 days", TemporalType::ALL)
            .with_description("Opinions expire after 180 days")
            .with_fact_types([FactType::Opinion])
            .with_criterion(Criterion::max_age(180.0)),
        InvalidationRule::new(
            "low_confidence_dynamic_7d",
            "Low confidence dynamic facts - 7 days",
            [TemporalType::Dynamic],
        )
        .with_description("Dynamic facts below 0.5 confidence expire after 7 days")
        .with_match_mode(MatchMode::All)
        .with_criterion(
            Criterion::max_age(7.0).with_reason(InvalidationReason::ConfidenceThreshold),
        )
        .with_criterion(Criterion::min_confidence(0.5)),
        InvalidationRule::new("test_sources_1d", "Test sources - 1 day", TemporalType::ALL)
            .with_description("Facts from test or temporary sources expire after 1 day")
            .with_match_mode(MatchMode::All)
            .with_criterion(Criterion::max_age(1.0).with_reason(InvalidationReason::SourceOutdated))
            .with_criterion(Criterion::source_patterns(["test", "temp"])),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
