//! The fact model: a classified subject-predicate-object triple with a
//! one-way active → invalidated lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{LetheError, Result};

// ---------------------------------------------------------------------------
// Identifiers and classification
// ---------------------------------------------------------------------------

/// A stable, time-sortable identifier for a [`Fact`].
///
/// ULIDs sort by creation time, so index scans return facts oldest first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactId(pub String);

impl FactId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FactId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FactId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What kind of statement a fact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Fact,
    Opinion,
    Prediction,
    Instruction,
    Definition,
}

impl FactType {
    pub const ALL: [FactType; 5] = [
        FactType::Fact,
        FactType::Opinion,
        FactType::Prediction,
        FactType::Instruction,
        FactType::Definition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::Fact => "fact",
            FactType::Opinion => "opinion",
            FactType::Prediction => "prediction",
            FactType::Instruction => "instruction",
            FactType::Definition => "definition",
        }
    }
}

impl std::fmt::Display for FactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FactType {
    type Err = LetheError;

    fn from_str(s: &str) -> Result<Self> {
        FactType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| LetheError::InvalidFact(format!("unknown fact type `{s}`")))
    }
}

/// How a fact's validity relates to time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalType {
    /// True once established (a birth date).
    Static,
    /// Expected to change (a job title, a ticket status).
    Dynamic,
    /// Not anchored in time at all (a definition).
    Atemporal,
    /// True only within a known window.
    TemporalBound,
}

impl TemporalType {
    pub const ALL: [TemporalType; 4] = [
        TemporalType::Static,
        TemporalType::Dynamic,
        TemporalType::Atemporal,
        TemporalType::TemporalBound,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TemporalType::Static => "static",
            TemporalType::Dynamic => "dynamic",
            TemporalType::Atemporal => "atemporal",
            TemporalType::TemporalBound => "temporal_bound",
        }
    }
}

impl std::fmt::Display for TemporalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TemporalType {
    type Err = LetheError;

    fn from_str(s: &str) -> Result<Self> {
        TemporalType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| LetheError::InvalidFact(format!("unknown temporal type `{s}`")))
    }
}

/// Why a fact stopped being trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    TemporalExpiry,
    ContradictionDetected,
    SourceOutdated,
    ManualInvalidation,
    ConfidenceThreshold,
    BatchCleanup,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationReason::TemporalExpiry => "temporal_expiry",
            InvalidationReason::ContradictionDetected => "contradiction_detected",
            InvalidationReason::SourceOutdated => "source_outdated",
            InvalidationReason::ManualInvalidation => "manual_invalidation",
            InvalidationReason::ConfidenceThreshold => "confidence_threshold",
            InvalidationReason::BatchCleanup => "batch_cleanup",
        }
    }
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured audit metadata attached to a fact when it is invalidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationRecord {
    pub reason: InvalidationReason,
    /// Rule that fired, when the invalidation came from a sweep.
    #[serde(default)]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    pub invalidated_at: DateTime<Utc>,
    /// The newer fact that replaced this one, if any.
    #[serde(default)]
    pub superseded_by: Option<FactId>,
}

impl InvalidationRecord {
    pub fn new(reason: InvalidationReason, at: DateTime<Utc>) -> Self {
        Self {
            reason,
            rule_id: None,
            detail: None,
            invalidated_at: at,
            superseded_by: None,
        }
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn superseded_by(mut self, fact_id: FactId) -> Self {
        self.superseded_by = Some(fact_id);
        self
    }
}

/// Outcome of a lookup that may legitimately find nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Lookup::Found(v),
            None => Lookup::NotFound,
        }
    }
}

// ---------------------------------------------------------------------------
// Fact
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// The atomic unit of knowledge.
///
/// Content fields are public. Lifecycle fields (`is_active`, `valid_until`,
/// `invalidated_by`, `invalidation_reason`) are only changed through
/// invalidation, which is one-way: an inactive fact never becomes active again.
/// Newer knowledge is a new fact, not a resurrected old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Stable time-sortable ID.
    pub id: FactId,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub fact_type: FactType,
    pub temporal_type: TemporalType,
    confidence: f64,
    /// Where this fact came from (document ID, conversation ID, importer name).
    pub source: String,
    #[serde(default)]
    pub extraction_method: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub original_text: Option<String>,
    /// When this fact was created.
    pub valid_from: DateTime<Utc>,
    /// Set exactly when the fact is invalidated.
    #[serde(default)]
    valid_until: Option<DateTime<Utc>>,
    pub last_verified: DateTime<Utc>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default)]
    invalidated_by: Option<FactId>,
    #[serde(default)]
    invalidation_reason: Option<InvalidationRecord>,
    /// Advisory links to facts this one references.
    #[serde(default)]
    pub related_facts: Vec<FactId>,
}

impl Fact {
    /// Create an active fact with a fresh id.
    ///
    /// Classification defaults to a static `fact` with full confidence from an
    /// `unknown` source; use the `with_*` builders to fill in what the
    /// extraction pipeline produced.
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
        valid_from: DateTime<Utc>,
    ) -> Self {
        let mut fact = Self {
            id: FactId::new(),
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            fact_type: FactType::Fact,
            temporal_type: TemporalType::Static,
            confidence: 1.0,
            source: "unknown".to_string(),
            extraction_method: "manual".to_string(),
            context: None,
            original_text: None,
            valid_from,
            valid_until: None,
            last_verified: valid_from,
            entities: Vec::new(),
            is_active: true,
            invalidated_by: None,
            invalidation_reason: None,
            related_facts: Vec::new(),
        };
        fact.ensure_entities();
        fact
    }

    pub fn with_fact_type(mut self, fact_type: FactType) -> Self {
        self.fact_type = fact_type;
        self
    }

    pub fn with_temporal_type(mut self, temporal_type: TemporalType) -> Self {
        self.temporal_type = temporal_type;
        self
    }

    /// Set the confidence, clamped to `[0.0, 1.0]` (NaN becomes 0.0).
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_extraction_method(mut self, method: impl Into<String>) -> Self {
        self.extraction_method = method.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_original_text(mut self, text: impl Into<String>) -> Self {
        self.original_text = Some(text.into());
        self
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self.ensure_entities();
        self
    }

    pub fn with_related_facts(mut self, related: impl IntoIterator<Item = FactId>) -> Self {
        self.related_facts = related.into_iter().collect();
        self
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        self.valid_until
    }

    pub fn invalidated_by(&self) -> Option<&FactId> {
        self.invalidated_by.as_ref()
    }

    pub fn invalidation_reason(&self) -> Option<&InvalidationRecord> {
        self.invalidation_reason.as_ref()
    }

    /// De-duplicated entity names; always contains `subject` and `object`.
    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    /// Age in fractional days at `now`. Never negative.
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        let seconds = (now - self.valid_from).num_milliseconds().max(0) as f64 / 1000.0;
        seconds / 86_400.0
    }

    /// Same subject and predicate, different object (all case-insensitive),
    /// different ids.
    pub fn contradicts(&self, other: &Fact) -> bool {
        self.id != other.id
            && self.subject.to_lowercase() == other.subject.to_lowercase()
            && self.predicate.to_lowercase() == other.predicate.to_lowercase()
            && self.object.to_lowercase() != other.object.to_lowercase()
    }

    /// Reject triples with an empty subject, predicate, or object.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("subject", &self.subject),
            ("predicate", &self.predicate),
            ("object", &self.object),
        ] {
            if value.trim().is_empty() {
                return Err(LetheError::InvalidFact(format!(
                    "fact {} has an empty {name}",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Record that the fact was re-confirmed at `at`.
    pub fn mark_verified(&mut self, at: DateTime<Utc>) {
        self.last_verified = at;
    }

    /// Transition to the terminal inactive state.
    ///
    /// Returns `false` (and leaves the fact untouched) when it was already
    /// inactive. `valid_until` never precedes `valid_from`.
    pub(crate) fn invalidate(&mut self, record: InvalidationRecord) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.valid_until = Some(record.invalidated_at.max(self.valid_from));
        self.invalidated_by = record.superseded_by.clone();
        self.invalidation_reason = Some(record);
        true
    }

    /// Re-establish the constructor invariants on a deserialized record.
    pub(crate) fn normalize(mut self) -> Self {
        self.confidence = clamp_confidence(self.confidence);
        self.ensure_entities();
        if self.is_active {
            self.valid_until = None;
        } else if self.valid_until.is_none() {
            self.valid_until = Some(self.valid_from);
        }
        self
    }

    fn ensure_entities(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.entities.retain(|e| seen.insert(e.clone()));
        for required in [self.subject.clone(), self.object.clone()] {
            if seen.insert(required.clone()) {
                self.entities.push(required);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
