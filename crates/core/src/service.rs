//! The invalidation service: one constructed instance that owns the fact
//! store, rule registry, contradiction detector and sweep engine, and is
//! handed to whoever needs them (the scheduler, the daemon, an API layer).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::contradiction::ContradictionDetector;
use crate::error::{LetheError, Result};
use crate::fact::{Fact, FactId, InvalidationReason, InvalidationRecord, Lookup};
use crate::kv::{KeyValueStore, WriteBatch};
use crate::redb_store::RedbStore;
use crate::registry::RuleRegistry;
use crate::rule::InvalidationRule;
use crate::store::{FactQuery, FactStore};
use crate::sweep::{SweepEngine, SweepHistoryEntry, SweepOptions, SweepResult, SweepSettings};

pub const EXTRACTION_HISTORY_KEY: &str = "lethe:history:extraction";

/// Result of [`InvalidationService::store_fact`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOutcome {
    pub fact_id: FactId,
    /// Facts invalidated because the new fact contradicts them.
    pub superseded: Vec<FactId>,
}

/// Facts handed over by the extraction pipeline in one go.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionBatch {
    /// Label for the producer (document, conversation, importer run).
    pub source: String,
    pub facts: Vec<Fact>,
    pub check_contradictions: bool,
}

impl ExtractionBatch {
    pub fn new(source: impl Into<String>, facts: Vec<Fact>) -> Self {
        Self {
            source: source.into(),
            facts,
            check_contradictions: true,
        }
    }

    pub fn without_contradiction_check(mut self) -> Self {
        self.check_contradictions = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedFact {
    pub fact_id: FactId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub received: usize,
    pub stored: Vec<FactId>,
    pub rejected: Vec<RejectedFact>,
    pub superseded: Vec<FactId>,
}

/// One line of the extraction audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionHistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub received: usize,
    #[serde(default)]
    pub stored: usize,
    #[serde(default)]
    pub rejected: usize,
    #[serde(default)]
    pub superseded: usize,
}

/// Aggregates over the invalidated set and recent sweep history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationStatistics {
    pub total_invalidated: usize,
    pub total_active: usize,
    /// Most recent first.
    pub recent_sweeps: Vec<SweepHistoryEntry>,
    /// Mean seconds per recent sweep.
    pub average_processing_time: f64,
    /// Invalidated over processed, across recent live sweeps.
    pub invalidation_rate: f64,
    /// Matches per rule across recent sweeps.
    pub rule_usage: BTreeMap<String, usize>,
}

impl InvalidationStatistics {
    fn summarize(
        total_invalidated: usize,
        total_active: usize,
        recent_sweeps: Vec<SweepHistoryEntry>,
    ) -> Self {
        let average_processing_time = if recent_sweeps.is_empty() {
            0.0
        } else {
            recent_sweeps.iter().map(|s| s.processing_time).sum::<f64>()
                / recent_sweeps.len() as f64
        };

        let (processed, invalidated) = recent_sweeps
            .iter()
            .filter(|s| !s.dry_run)
            .fold((0usize, 0usize), |(p, i), s| {
                (p + s.facts_processed, i + s.facts_invalidated)
            });
        let invalidation_rate = if processed == 0 {
            0.0
        } else {
            invalidated as f64 / processed as f64
        };

        let mut rule_usage = BTreeMap::new();
        for sweep in &recent_sweeps {
            for (rule_id, count) in &sweep.rule_statistics {
                *rule_usage.entry(rule_id.clone()).or_insert(0) += count;
            }
        }

        Self {
            total_invalidated,
            total_active,
            recent_sweeps,
            average_processing_time,
            invalidation_rate,
            rule_usage,
        }
    }
}

/// Entry point for everything the engine does. Cloning is cheap and shares
/// the same backend.
#[derive(Clone)]
pub struct InvalidationService {
    kv: Arc<dyn KeyValueStore>,
    store: FactStore,
    rules: RuleRegistry,
    sweeps: SweepEngine,
    detector: ContradictionDetector,
    config: Arc<EngineConfig>,
}

impl InvalidationService {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: EngineConfig) -> Self {
        let store = FactStore::new(Arc::clone(&kv));
        let rules = RuleRegistry::new(Arc::clone(&kv));
        let sweeps = SweepEngine::new(
            store.clone(),
            rules.clone(),
            Arc::clone(&kv),
            SweepSettings::from(&config),
        );
        Self {
            kv,
            store,
            rules,
            sweeps,
            detector: ContradictionDetector::new(config.contradiction_min_confidence),
            config: Arc::new(config),
        }
    }

    /// Open the redb database at `config.db_path`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let kv: Arc<dyn KeyValueStore> = Arc::new(RedbStore::open(&config.db_path)?);
        Ok(Self::new(kv, config))
    }

    /// A service over a throwaway in-memory database.
    pub fn open_in_memory(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let kv: Arc<dyn KeyValueStore> = Arc::new(RedbStore::open_in_memory()?);
        Ok(Self::new(kv, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn fact_store(&self) -> &FactStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Facts
    // -----------------------------------------------------------------------

    /// Persist `fact`. With `check_contradictions`, active dynamic facts it
    /// supersedes are invalidated afterwards and reported in the outcome.
    ///
    /// Fails with `AlreadyExists` when a record with the same id is stored;
    /// facts are never overwritten.
    pub async fn store_fact(&self, fact: Fact, check_contradictions: bool) -> Result<StoreOutcome> {
        fact.validate()?;

        let mut superseded = Vec::new();
        if check_contradictions && fact.is_active() {
            let pool = self
                .store
                .active_with_subject_predicate(&fact.subject, &fact.predicate)
                .await?;
            superseded = self
                .detector
                .find_superseded(&fact, &pool)
                .into_iter()
                .cloned()
                .collect();
        }

        let fact_id = self.store.store(&fact).await?;

        let now = Utc::now();
        let mut superseded_ids = Vec::with_capacity(superseded.len());
        for mut old in superseded {
            let record = InvalidationRecord::new(InvalidationReason::ContradictionDetected, now)
                .superseded_by(fact_id.clone())
                .with_detail(format!(
                    "{} {} changed from `{}` to `{}`",
                    fact.subject, fact.predicate, old.object, fact.object
                ));
            // A concurrent sweep may have invalidated it since the pool was read.
            if self.store.mark_invalidated(&mut old, record).await? {
                info!(old = %old.id, new = %fact_id, "fact superseded by contradiction");
                superseded_ids.push(old.id);
            }
        }

        Ok(StoreOutcome {
            fact_id,
            superseded: superseded_ids,
        })
    }

    pub async fn get_fact(&self, id: &FactId) -> Result<Lookup<Fact>> {
        self.store.get(id).await
    }

    pub async fn get_facts(&self, query: &FactQuery) -> Result<Vec<Fact>> {
        self.store.get_by_criteria(query).await
    }

    /// Invalidate one fact by hand.
    ///
    /// Returns `false` when the fact was already inactive.
    pub async fn invalidate_fact(
        &self,
        id: &FactId,
        detail: impl Into<String>,
        superseded_by: Option<FactId>,
    ) -> Result<bool> {
        let Lookup::Found(mut fact) = self.store.get(id).await? else {
            return Err(LetheError::NotFound(format!("fact {id}")));
        };
        let mut record =
            InvalidationRecord::new(InvalidationReason::ManualInvalidation, Utc::now())
                .with_detail(detail);
        if let Some(new_id) = superseded_by {
            record = record.superseded_by(new_id);
        }
        let changed = self.store.mark_invalidated(&mut fact, record).await?;
        info!(fact_id = %id, changed, "manual invalidation");
        Ok(changed)
    }

    /// Store a batch from the extraction pipeline and log it.
    ///
    /// Facts that fail validation or reuse a stored id are rejected
    /// individually; storage errors abort the batch.
    pub async fn ingest(&self, batch: ExtractionBatch) -> Result<IngestReport> {
        let mut report = IngestReport {
            received: batch.facts.len(),
            stored: Vec::new(),
            rejected: Vec::new(),
            superseded: Vec::new(),
        };

        for fact in batch.facts {
            let fact_id = fact.id.clone();
            match self.store_fact(fact, batch.check_contradictions).await {
                Ok(outcome) => {
                    report.stored.push(outcome.fact_id);
                    report.superseded.extend(outcome.superseded);
                }
                Err(LetheError::InvalidFact(reason) | LetheError::AlreadyExists(reason)) => {
                    warn!(fact_id = %fact_id, source = %batch.source, reason = %reason, "rejected extracted fact");
                    report.rejected.push(RejectedFact {
                        fact_id,
                        error: reason,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let entry = ExtractionHistoryEntry {
            timestamp: Utc::now(),
            source: batch.source,
            received: report.received,
            stored: report.stored.len(),
            rejected: report.rejected.len(),
            superseded: report.superseded.len(),
        };
        if let Err(e) = self.record_extraction(&entry).await {
            warn!(error = %e, "failed to record extraction history");
        }
        info!(
            source = %entry.source,
            received = entry.received,
            stored = entry.stored,
            rejected = entry.rejected,
            superseded = entry.superseded,
            "ingested extraction batch"
        );
        Ok(report)
    }

    async fn record_extraction(&self, entry: &ExtractionHistoryEntry) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.list_push(
            EXTRACTION_HISTORY_KEY,
            serde_json::to_string(entry)?,
            self.config.extraction_history_limit,
        );
        self.kv.apply(batch).await
    }

    pub async fn extraction_history(&self, limit: usize) -> Result<Vec<ExtractionHistoryEntry>> {
        let raw = self.kv.list_range(EXTRACTION_HISTORY_KEY, limit).await?;
        Ok(raw
            .iter()
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "skipping malformed extraction history entry");
                    None
                }
            })
            .collect())
    }

    pub async fn rebuild_indices(&self) -> Result<usize> {
        self.store.rebuild_indices().await
    }

    // -----------------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------------

    pub async fn run_sweep(&self, options: &SweepOptions) -> Result<SweepResult> {
        self.sweeps.run(options).await.inspect_err(|e| {
            error!(error = %e, source = ?options.source_filter, dry_run = options.dry_run, "sweep aborted");
        })
    }

    pub async fn sweep_history(&self, limit: usize) -> Result<Vec<SweepHistoryEntry>> {
        self.sweeps.history(limit).await
    }

    pub async fn get_statistics(&self) -> Result<InvalidationStatistics> {
        let (total_invalidated, total_active, recent) = tokio::try_join!(
            self.store.invalidated_count(),
            self.store.active_count(),
            self.sweeps.history(self.config.recent_sweeps_in_stats),
        )?;
        Ok(InvalidationStatistics::summarize(
            total_invalidated,
            total_active,
            recent,
        ))
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    pub async fn add_rule(&self, rule: InvalidationRule) -> Result<InvalidationRule> {
        self.rules.add_rule(rule).await
    }

    pub async fn remove_rule(&self, rule_id: &str) -> Result<bool> {
        self.rules.remove_rule(rule_id).await
    }

    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<InvalidationRule> {
        self.rules.set_enabled(rule_id, enabled).await
    }

    pub async fn list_rules(&self) -> Result<Vec<InvalidationRule>> {
        self.rules.list_rules().await
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<Lookup<InvalidationRule>> {
        self.rules.get_rule(rule_id).await
    }

    /// Seed the default rules into an empty registry.
    pub async fn ensure_default_rules(&self) -> Result<usize> {
        self.rules.ensure_defaults().await
    }
}
