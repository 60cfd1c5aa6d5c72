//! Fact persistence and secondary indices.
//!
//! Each fact is one hash: a `data` field holding the versioned JSON record
//! plus a projection of its scalar fields, readable without decoding the
//! whole record. Index sets:
//!
//! - `lethe:idx:active` / `lethe:idx:invalidated`: lifecycle state
//! - `lethe:idx:source:{source}`, `lethe:idx:fact_type:{type}`,
//!   `lethe:idx:temporal_type:{type}`: active facts per category
//! - `lethe:idx:sp:{subject}\0{predicate}` (lowercased): active facts per
//!   subject and predicate, the contradiction candidates
//! - `lethe:idx:all`: every id ever stored, the input to [`FactStore::rebuild_indices`]
//!
//! The record and its index memberships are written in one [`WriteBatch`].
//! Writes that depend on the stored state carry a [`WriteBatch::expect`]
//! guard on the record's `is_active` projection (or on `data` being absent),
//! so a concurrent change makes them retry against fresh state instead of
//! overwriting it.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LetheError, Result};
use crate::fact::{Fact, FactId, FactType, InvalidationRecord, Lookup, TemporalType};
use crate::kv::{KeyValueStore, WriteBatch};

/// Attempts at a guarded invalidation before giving up with `Conflict`.
const MAX_WRITE_ATTEMPTS: usize = 5;

/// Version written into every fact record. Readers accept any version and
/// ignore fields they do not know.
pub const FACT_SCHEMA_VERSION: u32 = 1;

pub mod keys {
    use crate::fact::{FactId, FactType, TemporalType};

    pub const ACTIVE_INDEX: &str = "lethe:idx:active";
    pub const INVALIDATED_INDEX: &str = "lethe:idx:invalidated";
    pub const ALL_INDEX: &str = "lethe:idx:all";
    pub const DATA_FIELD: &str = "data";
    pub const ACTIVE_FIELD: &str = "is_active";

    pub fn fact(id: &FactId) -> String {
        format!("lethe:fact:{id}")
    }

    pub fn source_index(source: &str) -> String {
        format!("lethe:idx:source:{source}")
    }

    pub fn fact_type_index(fact_type: FactType) -> String {
        format!("lethe:idx:fact_type:{fact_type}")
    }

    pub fn temporal_type_index(temporal_type: TemporalType) -> String {
        format!("lethe:idx:temporal_type:{temporal_type}")
    }

    /// Case-insensitive, like [`Fact::contradicts`](crate::fact::Fact::contradicts).
    pub fn subject_predicate_index(subject: &str, predicate: &str) -> String {
        format!(
            "lethe:idx:sp:{}\0{}",
            subject.to_lowercase(),
            predicate.to_lowercase()
        )
    }
}

#[derive(Serialize, Deserialize)]
struct FactEnvelope<F> {
    #[serde(default)]
    schema_version: u32,
    fact: F,
}

fn encode(fact: &Fact) -> Result<Vec<(String, String)>> {
    let data = serde_json::to_string(&FactEnvelope {
        schema_version: FACT_SCHEMA_VERSION,
        fact,
    })?;
    Ok(vec![
        (keys::DATA_FIELD.to_string(), data),
        ("subject".to_string(), fact.subject.clone()),
        ("predicate".to_string(), fact.predicate.clone()),
        ("object".to_string(), fact.object.clone()),
        ("fact_type".to_string(), fact.fact_type.to_string()),
        ("temporal_type".to_string(), fact.temporal_type.to_string()),
        ("confidence".to_string(), fact.confidence().to_string()),
        ("source".to_string(), fact.source.clone()),
        (keys::ACTIVE_FIELD.to_string(), fact.is_active().to_string()),
        ("valid_from".to_string(), fact.valid_from.to_rfc3339()),
    ])
}

fn decode(raw: &str) -> Result<Fact> {
    let envelope: FactEnvelope<Fact> = serde_json::from_str(raw)?;
    Ok(envelope.fact.normalize())
}

fn category_indices(fact: &Fact) -> [String; 4] {
    [
        keys::subject_predicate_index(&fact.subject, &fact.predicate),
        keys::source_index(&fact.source),
        keys::fact_type_index(fact.fact_type),
        keys::temporal_type_index(fact.temporal_type),
    ]
}

/// Filter for [`FactStore::get_by_criteria`].
#[derive(Debug, Clone, PartialEq)]
pub struct FactQuery {
    pub source: Option<String>,
    pub fact_type: Option<FactType>,
    pub temporal_type: Option<TemporalType>,
    /// Inclusive lower bound on confidence.
    pub min_confidence: Option<f64>,
    pub active_only: bool,
    pub limit: usize,
}

impl Default for FactQuery {
    fn default() -> Self {
        Self {
            source: None,
            fact_type: None,
            temporal_type: None,
            min_confidence: None,
            active_only: true,
            limit: 100,
        }
    }
}

impl FactQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn fact_type(mut self, fact_type: FactType) -> Self {
        self.fact_type = Some(fact_type);
        self
    }

    pub fn temporal_type(mut self, temporal_type: TemporalType) -> Self {
        self.temporal_type = Some(temporal_type);
        self
    }

    pub fn min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = Some(min_confidence);
        self
    }

    pub fn include_invalidated(mut self) -> Self {
        self.active_only = false;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn category_keys(&self) -> Vec<String> {
        let mut index_keys = Vec::new();
        if let Some(source) = &self.source {
            index_keys.push(keys::source_index(source));
        }
        if let Some(fact_type) = self.fact_type {
            index_keys.push(keys::fact_type_index(fact_type));
        }
        if let Some(temporal_type) = self.temporal_type {
            index_keys.push(keys::temporal_type_index(temporal_type));
        }
        index_keys
    }

    /// Client-side check applied after index resolution.
    pub fn matches(&self, fact: &Fact) -> bool {
        (!self.active_only || fact.is_active())
            && self.source.as_deref().is_none_or(|s| fact.source == s)
            && self.fact_type.is_none_or(|t| fact.fact_type == t)
            && self.temporal_type.is_none_or(|t| fact.temporal_type == t)
            && self.min_confidence.is_none_or(|c| fact.confidence() >= c)
    }
}

/// Durable fact storage over a [`KeyValueStore`]. Cloning shares the backend.
#[derive(Clone)]
pub struct FactStore {
    kv: Arc<dyn KeyValueStore>,
}

impl FactStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub async fn ping(&self) -> Result<()> {
        self.kv.ping().await
    }

    /// Persist a new `fact` and add it to every applicable index.
    ///
    /// Fails with `AlreadyExists` when a record with the same id is stored:
    /// an existing fact only changes through invalidation.
    pub async fn store(&self, fact: &Fact) -> Result<FactId> {
        fact.validate()?;
        let key = keys::fact(&fact.id);
        let id = fact.id.to_string();

        let mut batch = WriteBatch::new();
        batch
            .expect(key.clone(), keys::DATA_FIELD, None)
            .hash_set(key, encode(fact)?)
            .set_add(keys::ALL_INDEX, id.clone());
        if fact.is_active() {
            batch.set_add(keys::ACTIVE_INDEX, id.clone());
            for index in category_indices(fact) {
                batch.set_add(index, id.clone());
            }
        } else {
            batch.set_add(keys::INVALIDATED_INDEX, id.clone());
        }
        self.kv.apply(batch).await.map_err(|e| match e {
            LetheError::Conflict(_) => LetheError::AlreadyExists(format!("fact {}", fact.id)),
            other => other,
        })?;

        debug!(fact_id = %fact.id, source = %fact.source, "stored fact");
        Ok(fact.id.clone())
    }

    /// Fetch a fact by id. A missing or undecodable record is `NotFound`.
    pub async fn get(&self, id: &FactId) -> Result<Lookup<Fact>> {
        let Some(raw) = self.kv.hash_get(&keys::fact(id), keys::DATA_FIELD).await? else {
            return Ok(Lookup::NotFound);
        };
        match decode(&raw) {
            Ok(fact) => Ok(Lookup::Found(fact)),
            Err(e) => {
                warn!(fact_id = %id, error = %e, "skipping malformed fact record");
                Ok(Lookup::NotFound)
            }
        }
    }

    /// Facts matching `query`, at most `query.limit` of them.
    ///
    /// Active facts are resolved by intersecting the requested index sets
    /// (or the whole active set when no filter is given). With
    /// `active_only = false`, invalidated facts are appended afterwards and
    /// filtered client-side, since they have left the category indices.
    pub async fn get_by_criteria(&self, query: &FactQuery) -> Result<Vec<Fact>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        let mut index_keys = vec![keys::ACTIVE_INDEX.to_string()];
        index_keys.extend(query.category_keys());
        let active_ids = if index_keys.len() == 1 {
            self.kv.set_members(keys::ACTIVE_INDEX).await?
        } else {
            self.kv.set_intersect(&index_keys).await?
        };

        let mut facts = self.fetch_matching(&active_ids, query, query.limit).await?;

        if !query.active_only && facts.len() < query.limit {
            let invalidated_ids = self.kv.set_members(keys::INVALIDATED_INDEX).await?;
            let remaining = query.limit - facts.len();
            facts.extend(
                self.fetch_matching(&invalidated_ids, query, remaining)
                    .await?,
            );
        }

        Ok(facts)
    }

    async fn fetch_matching(
        &self,
        ids: &[String],
        query: &FactQuery,
        limit: usize,
    ) -> Result<Vec<Fact>> {
        let mut facts = Vec::new();
        for id in ids {
            if facts.len() >= limit {
                break;
            }
            if let Lookup::Found(fact) = self.get(&FactId(id.clone())).await? {
                if query.matches(&fact) {
                    facts.push(fact);
                }
            }
        }
        Ok(facts)
    }

    /// Active facts sharing `subject` and `predicate` (case-insensitive).
    /// Not capped: this is the complete contradiction candidate pool.
    pub async fn active_with_subject_predicate(
        &self,
        subject: &str,
        predicate: &str,
    ) -> Result<Vec<Fact>> {
        let index_keys = [
            keys::ACTIVE_INDEX.to_string(),
            keys::subject_predicate_index(subject, predicate),
        ];
        let ids = self.kv.set_intersect(&index_keys).await?;
        self.fetch_matching(&ids, &FactQuery::new(), usize::MAX).await
    }

    /// Invalidate one fact: the single mutation primitive.
    ///
    /// Works on the stored record, not on `fact`, which only supplies the id
    /// and is refreshed with the stored state afterwards. Returns `false`
    /// without writing when the stored fact is already inactive, so the first
    /// recorded reason is kept. Fails with `NotFound` when no record exists.
    pub async fn mark_invalidated(
        &self,
        fact: &mut Fact,
        record: InvalidationRecord,
    ) -> Result<bool> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Lookup::Found(mut current) = self.get(&fact.id).await? else {
                return Err(LetheError::NotFound(format!("fact {}", fact.id)));
            };
            if !current.invalidate(record.clone()) {
                *fact = current;
                debug!(fact_id = %fact.id, "fact already invalidated");
                return Ok(false);
            }
            match self.kv.apply(guarded_invalidation(&current)?).await {
                Ok(()) => {
                    *fact = current;
                    debug!(fact_id = %fact.id, "marked fact invalidated");
                    return Ok(true);
                }
                Err(LetheError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(LetheError::Conflict(format!(
            "fact {} kept changing during invalidation",
            fact.id
        )))
    }

    /// Invalidate several facts in a single atomic write.
    ///
    /// Each fact is re-read first; those already inactive (or gone) are
    /// skipped and not counted. Returns how many transitioned from active to
    /// inactive. When the write fails, none of them are persisted.
    pub async fn mark_invalidated_many(
        &self,
        items: Vec<(Fact, InvalidationRecord)>,
    ) -> Result<usize> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut batch = WriteBatch::new();
            let mut changed = 0;
            let mut seen = HashSet::new();
            for (fact, record) in &items {
                if !seen.insert(&fact.id) {
                    continue;
                }
                let Lookup::Found(mut current) = self.get(&fact.id).await? else {
                    continue;
                };
                if current.invalidate(record.clone()) {
                    batch.extend(guarded_invalidation(&current)?);
                    changed += 1;
                }
            }
            if batch.is_empty() {
                return Ok(0);
            }
            match self.kv.apply(batch).await {
                Ok(()) => return Ok(changed),
                Err(LetheError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(LetheError::Conflict(
            "facts kept changing during batch invalidation".to_string(),
        ))
    }

    /// Recompute index membership for every stored fact from its record.
    ///
    /// Repairs state left behind by partial writes. Returns the number of
    /// facts re-indexed; malformed records are skipped.
    pub async fn rebuild_indices(&self) -> Result<usize> {
        let ids = self.kv.set_members(keys::ALL_INDEX).await?;
        let mut batch = WriteBatch::new();
        let mut count = 0;

        for id in ids {
            let Lookup::Found(fact) = self.get(&FactId(id.clone())).await? else {
                continue;
            };
            if fact.is_active() {
                batch
                    .set_add(keys::ACTIVE_INDEX, id.clone())
                    .set_remove(keys::INVALIDATED_INDEX, id.clone());
                for index in category_indices(&fact) {
                    batch.set_add(index, id.clone());
                }
            } else {
                batch
                    .set_remove(keys::ACTIVE_INDEX, id.clone())
                    .set_add(keys::INVALIDATED_INDEX, id.clone());
                for index in category_indices(&fact) {
                    batch.set_remove(index, id.clone());
                }
            }
            count += 1;
        }

        self.kv.apply(batch).await?;
        debug!(count, "rebuilt fact indices");
        Ok(count)
    }

    pub async fn active_count(&self) -> Result<usize> {
        self.kv.set_len(keys::ACTIVE_INDEX).await
    }

    pub async fn invalidated_count(&self) -> Result<usize> {
        self.kv.set_len(keys::INVALIDATED_INDEX).await
    }
}

/// Rewrite an invalidated fact and move it between indices, provided the
/// stored record is still active.
fn guarded_invalidation(fact: &Fact) -> Result<WriteBatch> {
    let id = fact.id.to_string();
    let key = keys::fact(&fact.id);
    let mut batch = WriteBatch::new();
    batch
        .expect(key.clone(), keys::ACTIVE_FIELD, Some(true.to_string()))
        .hash_set(key, encode(fact)?)
        .set_remove(keys::ACTIVE_INDEX, id.clone())
        .set_add(keys::INVALIDATED_INDEX, id.clone());
    for index in category_indices(fact) {
        batch.set_remove(index, id.clone());
    }
    Ok(batch)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::InvalidationReason;
    use crate::redb_store::RedbStore;
    use chrono::Utc;

    fn open_store() -> (FactStore, Arc<dyn KeyValueStore>) {
        let kv: Arc<dyn KeyValueStore> = Arc::new(RedbStore::open_in_memory().unwrap());
        (FactStore::new(Arc::clone(&kv)), kv)
    }

    fn dynamic(subject: &str, object: &str, source: &str) -> Fact {
        Fact::new(subject, "status", object, Utc::now())
            .with_temporal_type(TemporalType::Dynamic)
            .with_source(source)
    }

    #[tokio::test]
    async fn store_and_get_round_trip() {
        let (store, kv) = open_store();
        let fact = dynamic("ticket-1", "open", "jira").with_confidence(0.8);
        let id = store.store(&fact).await.unwrap();

        let loaded = store.get(&id).await.unwrap().into_option().unwrap();
        assert_eq!(loaded, fact);

        let projected = kv.hash_get(&keys::fact(&id), "temporal_type").await.unwrap();
        assert_eq!(projected.as_deref(), Some("dynamic"));
        assert_eq!(
            kv.hash_get(&keys::fact(&id), "is_active").await.unwrap().as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn get_missing_fact_is_not_found() {
        let (store, _kv) = open_store();
        let lookup = store.get(&FactId::new()).await.unwrap();
        assert_eq!(lookup, Lookup::NotFound);
    }

    #[tokio::test]
    async fn store_rejects_empty_triple() {
        let (store, _kv) = open_store();
        let fact = Fact::new("ticket-1", "", "open", Utc::now());
        assert!(store.store(&fact).await.is_err());
        assert_eq!(store.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn criteria_intersect_indices() {
        let (store, _kv) = open_store();
        store.store(&dynamic("a", "open", "jira")).await.unwrap();
        store
            .store(&dynamic("b", "open", "jira").with_fact_type(FactType::Opinion))
            .await
            .unwrap();
        store.store(&dynamic("c", "open", "slack")).await.unwrap();
        store
            .store(&Fact::new("d", "born", "1990", Utc::now()).with_source("jira"))
            .await
            .unwrap();

        let jira = store
            .get_by_criteria(&FactQuery::new().source("jira"))
            .await
            .unwrap();
        assert_eq!(jira.len(), 3);

        let jira_dynamic_facts = store
            .get_by_criteria(
                &FactQuery::new()
                    .source("jira")
                    .temporal_type(TemporalType::Dynamic)
                    .fact_type(FactType::Fact),
            )
            .await
            .unwrap();
        assert_eq!(jira_dynamic_facts.len(), 1);
        assert_eq!(jira_dynamic_facts[0].subject, "a");

        let all = store.get_by_criteria(&FactQuery::new()).await.unwrap();
        assert_eq!(all.len(), 4);

        let limited = store
            .get_by_criteria(&FactQuery::new().limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn min_confidence_filters_client_side() {
        let (store, _kv) = open_store();
        store
            .store(&dynamic("a", "open", "jira").with_confidence(0.3))
            .await
            .unwrap();
        store
            .store(&dynamic("b", "open", "jira").with_confidence(0.9))
            .await
            .unwrap();

        let confident = store
            .get_by_criteria(&FactQuery::new().min_confidence(0.5))
            .await
            .unwrap();
        assert_eq!(confident.len(), 1);
        assert_eq!(confident[0].subject, "b");
    }

    #[tokio::test]
    async fn mark_invalidated_moves_between_indices() {
        let (store, kv) = open_store();
        let mut fact = dynamic("ticket-1", "open", "jira");
        store.store(&fact).await.unwrap();

        let record = InvalidationRecord::new(InvalidationReason::ManualInvalidation, Utc::now());
        assert!(store.mark_invalidated(&mut fact, record).await.unwrap());
        assert!(!fact.is_active());

        let id = fact.id.to_string();
        assert!(!kv.set_members(keys::ACTIVE_INDEX).await.unwrap().contains(&id));
        assert!(!kv
            .set_members(&keys::source_index("jira"))
            .await
            .unwrap()
            .contains(&id));
        assert_eq!(kv.set_members(keys::INVALIDATED_INDEX).await.unwrap(), vec![id]);

        let active = store
            .get_by_criteria(&FactQuery::new().source("jira"))
            .await
            .unwrap();
        assert!(active.is_empty());

        let everything = store
            .get_by_criteria(&FactQuery::new().source("jira").include_invalidated())
            .await
            .unwrap();
        assert_eq!(everything.len(), 1);
        assert_eq!(
            everything[0].invalidation_reason().map(|r| r.reason),
            Some(InvalidationReason::ManualInvalidation)
        );
        assert!(everything[0].valid_until().is_some());
    }

    #[tokio::test]
    async fn repeated_invalidation_is_harmless() {
        let (store, _kv) = open_store();
        let mut fact = dynamic("ticket-1", "open", "jira");
        store.store(&fact).await.unwrap();

        let first = InvalidationRecord::new(InvalidationReason::TemporalExpiry, Utc::now());
        let second = InvalidationRecord::new(InvalidationReason::ManualInvalidation, Utc::now());
        assert!(store.mark_invalidated(&mut fact, first).await.unwrap());
        assert!(!store.mark_invalidated(&mut fact, second).await.unwrap());

        let stored = store.get(&fact.id).await.unwrap().into_option().unwrap();
        assert_eq!(
            stored.invalidation_reason().map(|r| r.reason),
            Some(InvalidationReason::TemporalExpiry)
        );
        assert_eq!(store.invalidated_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn restoring_an_invalidated_fact_is_rejected() {
        let (store, kv) = open_store();
        let mut fact = dynamic("ticket-1", "open", "jira");
        let earlier_copy = fact.clone();
        store.store(&fact).await.unwrap();
        store
            .mark_invalidated(
                &mut fact,
                InvalidationRecord::new(InvalidationReason::ManualInvalidation, Utc::now()),
            )
            .await
            .unwrap();

        assert!(matches!(
            store.store(&earlier_copy).await,
            Err(LetheError::AlreadyExists(_))
        ));
        let stored = store.get(&fact.id).await.unwrap().into_option().unwrap();
        assert!(!stored.is_active(), "invalidation must stay one-way");
        assert_eq!(store.active_count().await.unwrap(), 0);
        assert_eq!(store.invalidated_count().await.unwrap(), 1);
        assert!(kv
            .set_members(&keys::source_index("jira"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn stale_copies_do_not_overwrite_first_invalidation() {
        let (store, _kv) = open_store();
        let fact = dynamic("ticket-1", "open", "jira");
        store.store(&fact).await.unwrap();
        let loaded_by_sweep = store.get(&fact.id).await.unwrap().into_option().unwrap();

        let mut current = fact.clone();
        let replacement = FactId::new();
        store
            .mark_invalidated(
                &mut current,
                InvalidationRecord::new(InvalidationReason::ContradictionDetected, Utc::now())
                    .superseded_by(replacement.clone()),
            )
            .await
            .unwrap();

        let counted = store
            .mark_invalidated_many(vec![
                (
                    loaded_by_sweep.clone(),
                    InvalidationRecord::new(InvalidationReason::TemporalExpiry, Utc::now()),
                ),
                (
                    loaded_by_sweep,
                    InvalidationRecord::new(InvalidationReason::TemporalExpiry, Utc::now()),
                ),
            ])
            .await
            .unwrap();
        assert_eq!(counted, 0, "already inactive facts are not counted");

        let stored = store.get(&fact.id).await.unwrap().into_option().unwrap();
        assert_eq!(
            stored.invalidation_reason().map(|r| r.reason),
            Some(InvalidationReason::ContradictionDetected)
        );
        assert_eq!(stored.invalidated_by(), Some(&replacement));

        // The single-fact primitive also refreshes the caller's stale copy.
        let mut stale = fact.clone();
        assert!(!store
            .mark_invalidated(
                &mut stale,
                InvalidationRecord::new(InvalidationReason::ManualInvalidation, Utc::now()),
            )
            .await
            .unwrap());
        assert_eq!(stale.invalidated_by(), Some(&replacement));
    }

    #[tokio::test]
    async fn duplicate_items_in_a_batch_count_once() {
        let (store, _kv) = open_store();
        let fact = dynamic("ticket-1", "open", "jira");
        store.store(&fact).await.unwrap();
        let record = InvalidationRecord::new(InvalidationReason::BatchCleanup, Utc::now());
        let counted = store
            .mark_invalidated_many(vec![(fact.clone(), record.clone()), (fact, record)])
            .await
            .unwrap();
        assert_eq!(counted, 1);
        assert_eq!(store.invalidated_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn subject_predicate_index_tracks_active_facts() {
        let (store, _kv) = open_store();
        let mut open = Fact::new("Ticket-1", "Status", "open", Utc::now());
        store.store(&open).await.unwrap();
        store
            .store(&Fact::new("ticket-1", "owner", "bob", Utc::now()))
            .await
            .unwrap();
        store.store(&dynamic("ticket-2", "open", "jira")).await.unwrap();

        let pool = store
            .active_with_subject_predicate("TICKET-1", "status")
            .await
            .unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].id, open.id);

        store
            .mark_invalidated(
                &mut open,
                InvalidationRecord::new(InvalidationReason::TemporalExpiry, Utc::now()),
            )
            .await
            .unwrap();
        assert!(store
            .active_with_subject_predicate("ticket-1", "status")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn invalidating_an_unknown_fact_is_not_found() {
        let (store, _kv) = open_store();
        let mut never_stored = dynamic("ticket-9", "open", "jira");
        let result = store
            .mark_invalidated(
                &mut never_stored,
                InvalidationRecord::new(InvalidationReason::ManualInvalidation, Utc::now()),
            )
            .await;
        assert!(matches!(result, Err(LetheError::NotFound(_))));
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let (store, kv) = open_store();
        store.store(&dynamic("good", "open", "jira")).await.unwrap();

        let bad = FactId::new();
        let mut batch = WriteBatch::new();
        batch
            .hash_set(
                keys::fact(&bad),
                vec![(keys::DATA_FIELD.to_string(), "{not json".to_string())],
            )
            .set_add(keys::ACTIVE_INDEX, bad.to_string());
        kv.apply(batch).await.unwrap();

        assert_eq!(store.get(&bad).await.unwrap(), Lookup::NotFound);
        let facts = store.get_by_criteria(&FactQuery::new()).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].subject, "good");
    }

    #[tokio::test]
    async fn rebuild_indices_repairs_stale_membership() {
        let (store, kv) = open_store();
        let mut fact = dynamic("ticket-1", "open", "jira");
        store.store(&fact).await.unwrap();
        store
            .mark_invalidated(
                &mut fact,
                InvalidationRecord::new(InvalidationReason::TemporalExpiry, Utc::now()),
            )
            .await
            .unwrap();
        let live = dynamic("ticket-2", "open", "jira");
        store.store(&live).await.unwrap();

        // Simulate a partial write that left both ids in the wrong places.
        let mut batch = WriteBatch::new();
        batch
            .set_add(keys::ACTIVE_INDEX, fact.id.to_string())
            .set_remove(keys::ACTIVE_INDEX, live.id.to_string())
            .set_remove(&keys::source_index("jira"), live.id.to_string());
        kv.apply(batch).await.unwrap();

        assert_eq!(store.rebuild_indices().await.unwrap(), 2);
        assert_eq!(
            kv.set_members(keys::ACTIVE_INDEX).await.unwrap(),
            vec![live.id.to_string()]
        );
        assert_eq!(
            kv.set_members(&keys::source_index("jira")).await.unwrap(),
            vec![live.id.to_string()]
        );
        assert_eq!(
            kv.set_members(keys::INVALIDATED_INDEX).await.unwrap(),
            vec![fact.id.to_string()]
        );
    }
}
