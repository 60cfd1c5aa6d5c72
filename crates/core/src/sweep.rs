//! The batch invalidation sweep.
//!
//! One sweep moves through `Loading → Evaluating → (Applying | DryRunReport)
//! → Recording → Done`:
//!
//! 1. rules and candidate facts are loaded concurrently;
//! 2. each fact is tested against the enabled rules in registration order,
//!    first match wins;
//! 3. matches are invalidated in bounded batches (skipped on a dry run);
//! 4. one history entry is appended to a bounded log.
//!
//! A failed batch only lowers the invalidated count. A store that cannot be
//! reached aborts the sweep with an error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::fact::{Fact, FactId, InvalidationReason, InvalidationRecord};
use crate::kv::{KeyValueStore, WriteBatch};
use crate::registry::RuleRegistry;
use crate::rule::{InvalidationRule, RuleOutcome};
use crate::store::{FactQuery, FactStore};

pub const SWEEP_HISTORY_KEY: &str = "lethe:history:sweeps";

/// Stages of a single sweep, reported in debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    Loading,
    Evaluating,
    Applying,
    DryRunReport,
    Recording,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    /// Matches were applied.
    Completed,
    /// Matches were computed but not applied.
    DryRun,
    /// There were no candidate facts.
    NothingToDo,
}

/// What a caller asks a sweep to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOptions {
    /// Restrict candidates to facts from this exact source.
    pub source_filter: Option<String>,
    pub dry_run: bool,
}

impl SweepOptions {
    pub fn live() -> Self {
        Self::default()
    }

    pub fn dry_run() -> Self {
        Self {
            source_filter: None,
            dry_run: true,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_filter = Some(source.into());
        self
    }
}

/// Knobs a sweep reads from [`EngineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub batch_size: usize,
    pub history_limit: usize,
    pub sample_size: usize,
    pub max_candidates: usize,
}

impl From<&EngineConfig> for SweepSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            history_limit: config.history_limit.max(1),
            sample_size: config.dry_run_sample_size,
            max_candidates: config.max_candidates,
        }
    }
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// A fact a dry run would invalidate, with enough context to review it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSample {
    pub fact_id: FactId,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub source: String,
    pub confidence: f64,
    pub age_days: f64,
    pub rule_id: String,
    pub reason: InvalidationReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub status: SweepStatus,
    pub started_at: DateTime<Utc>,
    pub source_filter: Option<String>,
    pub dry_run: bool,
    pub facts_processed: usize,
    pub facts_identified: usize,
    pub facts_invalidated: usize,
    /// Wall-clock seconds.
    pub processing_time: f64,
    /// Matches per enabled rule (rules without matches report zero).
    pub rule_statistics: BTreeMap<String, usize>,
    /// Rule/fact pairs that could not be evaluated.
    pub rule_errors: usize,
    /// Dry runs only: the first matches, capped by the configured sample size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Vec<SweepSample>>,
}

/// One audit-log line per sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepHistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source_filter: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub facts_processed: usize,
    #[serde(default)]
    pub facts_identified: usize,
    #[serde(default)]
    pub facts_invalidated: usize,
    #[serde(default)]
    pub processing_time: f64,
    #[serde(default)]
    pub rule_statistics: BTreeMap<String, usize>,
}

impl From<&SweepResult> for SweepHistoryEntry {
    fn from(result: &SweepResult) -> Self {
        Self {
            timestamp: result.started_at,
            source_filter: result.source_filter.clone(),
            dry_run: result.dry_run,
            facts_processed: result.facts_processed,
            facts_identified: result.facts_identified,
            facts_invalidated: result.facts_invalidated,
            processing_time: result.processing_time,
            rule_statistics: result.rule_statistics.clone(),
        }
    }
}

struct RuleMatch {
    fact: Fact,
    rule_id: String,
    reason: InvalidationReason,
}

impl RuleMatch {
    fn sample(&self, now: DateTime<Utc>) -> SweepSample {
        SweepSample {
            fact_id: self.fact.id.clone(),
            subject: self.fact.subject.clone(),
            predicate: self.fact.predicate.clone(),
            object: self.fact.object.clone(),
            source: self.fact.source.clone(),
            confidence: self.fact.confidence(),
            age_days: self.fact.age_days(now),
            rule_id: self.rule_id.clone(),
            reason: self.reason,
        }
    }

    fn record(&self, now: DateTime<Utc>) -> InvalidationRecord {
        InvalidationRecord::new(self.reason, now)
            .with_rule(self.rule_id.clone())
            .with_detail(format!("matched rule `{}` during sweep", self.rule_id))
    }
}

/// Runs sweeps against a fact store and rule registry.
#[derive(Clone)]
pub struct SweepEngine {
    store: FactStore,
    rules: RuleRegistry,
    kv: Arc<dyn KeyValueStore>,
    settings: SweepSettings,
}

impl SweepEngine {
    pub fn new(
        store: FactStore,
        rules: RuleRegistry,
        kv: Arc<dyn KeyValueStore>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            store,
            rules,
            kv,
            settings,
        }
    }

    pub async fn run(&self, options: &SweepOptions) -> Result<SweepResult> {
        self.run_at(options, Utc::now()).await
    }

    /// Run a sweep with fact ages measured at `now`.
    pub async fn run_at(&self, options: &SweepOptions, now: DateTime<Utc>) -> Result<SweepResult> {
        let started = Instant::now();

        debug!(phase = ?SweepPhase::Loading, source = ?options.source_filter, dry_run = options.dry_run);
        self.store.ping().await?;
        let mut query = FactQuery::new().limit(self.settings.max_candidates);
        if let Some(source) = &options.source_filter {
            query = query.source(source.clone());
        }
        let (rules, facts) =
            tokio::try_join!(self.rules.list_rules(), self.store.get_by_criteria(&query))?;

        let mut result = SweepResult {
            status: SweepStatus::NothingToDo,
            started_at: now,
            source_filter: options.source_filter.clone(),
            dry_run: options.dry_run,
            facts_processed: facts.len(),
            facts_identified: 0,
            facts_invalidated: 0,
            processing_time: 0.0,
            rule_statistics: BTreeMap::new(),
            rule_errors: 0,
            sample: None,
        };

        if facts.is_empty() {
            result.processing_time = started.elapsed().as_secs_f64();
            debug!(phase = ?SweepPhase::Done, "no candidate facts");
            return Ok(result);
        }

        debug!(phase = ?SweepPhase::Evaluating, facts = facts.len(), rules = rules.len());
        let enabled: Vec<&InvalidationRule> = rules.iter().filter(|r| r.enabled).collect();
        result.rule_statistics = enabled.iter().map(|r| (r.rule_id.clone(), 0)).collect();
        let matches = self.evaluate(facts, &enabled, now, &mut result);
        result.facts_identified = matches.len();

        if options.dry_run {
            debug!(phase = ?SweepPhase::DryRunReport, identified = matches.len());
            result.status = SweepStatus::DryRun;
            result.sample = Some(
                matches
                    .iter()
                    .take(self.settings.sample_size)
                    .map(|m| m.sample(now))
                    .collect(),
            );
        } else {
            debug!(phase = ?SweepPhase::Applying, identified = matches.len());
            result.status = SweepStatus::Completed;
            result.facts_invalidated = self.apply(&matches, now).await;
        }

        debug!(phase = ?SweepPhase::Recording);
        result.processing_time = started.elapsed().as_secs_f64();
        if let Err(e) = self.record(&SweepHistoryEntry::from(&result)).await {
            warn!(error = %e, "failed to record sweep history");
        }

        debug!(phase = ?SweepPhase::Done);
        info!(
            dry_run = result.dry_run,
            facts_processed = result.facts_processed,
            facts_identified = result.facts_identified,
            facts_invalidated = result.facts_invalidated,
            processing_time = result.processing_time,
            "sweep complete"
        );
        Ok(result)
    }

    fn evaluate(
        &self,
        facts: Vec<Fact>,
        rules: &[&InvalidationRule],
        now: DateTime<Utc>,
        result: &mut SweepResult,
    ) -> Vec<RuleMatch> {
        let mut matches = Vec::new();
        for fact in facts {
            let hit = rules.iter().find_map(|rule| match rule.evaluate(&fact, now) {
                Ok(RuleOutcome::Matched(reason)) => Some((rule.rule_id.clone(), reason)),
                Ok(RuleOutcome::NoMatch) => None,
                Err(e) => {
                    result.rule_errors += 1;
                    warn!(rule_id = %rule.rule_id, fact_id = %fact.id, error = %e, "rule evaluation failed; treating as no match");
                    None
                }
            });
            if let Some((rule_id, reason)) = hit {
                *result.rule_statistics.entry(rule_id.clone()).or_insert(0) += 1;
                matches.push(RuleMatch {
                    fact,
                    rule_id,
                    reason,
                });
            }
        }
        matches
    }

    /// Invalidate `matches` in batches; returns how many were committed.
    async fn apply(&self, matches: &[RuleMatch], now: DateTime<Utc>) -> usize {
        let mut invalidated = 0;
        for (batch, chunk) in matches.chunks(self.settings.batch_size.max(1)).enumerate() {
            let items = chunk
                .iter()
                .map(|m| (m.fact.clone(), m.record(now)))
                .collect();
            match self.store.mark_invalidated_many(items).await {
                Ok(count) => invalidated += count,
                Err(e) => warn!(
                    batch,
                    size = chunk.len(),
                    error = %e,
                    "invalidation batch failed; continuing with next batch"
                ),
            }
        }
        invalidated
    }

    async fn record(&self, entry: &SweepHistoryEntry) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.list_push(
            SWEEP_HISTORY_KEY,
            serde_json::to_string(entry)?,
            self.settings.history_limit,
        );
        self.kv.apply(batch).await
    }

    /// Most recent history entries first.
    pub async fn history(&self, limit: usize) -> Result<Vec<SweepHistoryEntry>> {
        let raw = self.kv.list_range(SWEEP_HISTORY_KEY, limit).await?;
        Ok(raw
            .iter()
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "skipping malformed sweep history entry");
                    None
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
