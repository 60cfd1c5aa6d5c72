//! Lethe: lifecycle management for extracted facts.
//!
//! The core primitive is a [`Fact`]: a subject-predicate-object triple with
//! a classification ([`FactType`], [`TemporalType`]), a confidence, a source
//! and a validity window. Facts are never deleted. They are *invalidated*, a
//! one-way transition that records why ([`InvalidationReason`]) and, when a
//! newer fact replaced it, by what.
//!
//! Two mechanisms invalidate facts:
//!
//! - **Contradiction detection** when a fact is stored: an active dynamic
//!   fact with the same subject and predicate but a different object yields
//!   to a newer, more confident one.
//! - **Sweeps**: a batch pass that tests every active fact against the
//!   registered [`InvalidationRule`]s (first enabled match wins), either live
//!   or as a dry run for review. [`SweepScheduler`] runs live sweeps
//!   periodically.
//!
//! Everything is persisted in an embedded redb database through the
//! [`KeyValueStore`] abstraction.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use lethe::{EngineConfig, Fact, InvalidationService, SweepOptions, TemporalType};
//!
//! # async fn demo() -> lethe::Result<()> {
//! let service = InvalidationService::open(EngineConfig::default())?;
//! service.ensure_default_rules().await?;
//!
//! let fact = Fact::new("ticket-42", "status", "open", Utc::now())
//!     .with_temporal_type(TemporalType::Dynamic)
//!     .with_confidence(0.8)
//!     .with_source("jira");
//! service.store_fact(fact, true).await?;
//!
//! // Review what a sweep would do before running it for real.
//! let preview = service.run_sweep(&SweepOptions::dry_run()).await?;
//! println!("{} facts would be invalidated", preview.facts_identified);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod contradiction;
pub mod error;
pub mod fact;
pub mod kv;
pub mod redb_store;
pub mod registry;
pub mod rule;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod sweep;

pub use config::EngineConfig;
pub use contradiction::ContradictionDetector;
pub use error::{LetheError, Result};
pub use fact::{
    Fact, FactId, FactType, InvalidationReason, InvalidationRecord, Lookup, TemporalType,
};
pub use kv::{KeyValueStore, WriteBatch, WriteOp};
pub use redb_store::RedbStore;
pub use registry::RuleRegistry;
pub use rule::{default_rules, Criterion, InvalidationRule, MatchMode, RuleOutcome};
pub use scheduler::{SchedulerHandle, SchedulerReport, SweepScheduler};
pub use service::{
    ExtractionBatch, ExtractionHistoryEntry, IngestReport, InvalidationService,
    InvalidationStatistics, RejectedFact, StoreOutcome,
};
pub use store::{FactQuery, FactStore};
pub use sweep::{
    SweepEngine, SweepHistoryEntry, SweepOptions, SweepResult, SweepSample, SweepSettings,
    SweepStatus,
};

#[cfg(test)]
pub(crate) mod testing {
    //! Fault injection for storage-failure tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::error::{LetheError, Result};
    use crate::kv::{KeyValueStore, WriteBatch};
    use crate::redb_store::RedbStore;

    /// In-memory store that can be switched off or made to drop writes.
    pub struct FlakyStore {
        inner: RedbStore,
        unavailable: AtomicBool,
        failing_applies: AtomicUsize,
    }

    impl FlakyStore {
        pub fn new() -> Self {
            Self {
                inner: RedbStore::open_in_memory().unwrap(),
                unavailable: AtomicBool::new(false),
                failing_applies: AtomicUsize::new(0),
            }
        }

        /// Every call fails with [`LetheError::Unavailable`] while set.
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// The next `n` calls to `apply` fail without writing anything.
        pub fn fail_next_applies(&self, n: usize) {
            self.failing_applies.store(n, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                Err(LetheError::Unavailable("injected outage".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn ping(&self) -> Result<()> {
            self.check()?;
            self.inner.ping().await
        }

        async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
            self.check()?;
            self.inner.hash_get(key, field).await
        }

        async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>> {
            self.check()?;
            self.inner.hash_get_all(key).await
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>> {
            self.check()?;
            self.inner.set_members(key).await
        }

        async fn set_intersect(&self, keys: &[String]) -> Result<Vec<String>> {
            self.check()?;
            self.inner.set_intersect(keys).await
        }

        async fn set_len(&self, key: &str) -> Result<usize> {
            self.check()?;
            self.inner.set_len(key).await
        }

        async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
            self.check()?;
            self.inner.list_range(key, limit).await
        }

        async fn apply(&self, batch: WriteBatch) -> Result<()> {
            self.check()?;
            let drop_write = self
                .failing_applies
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if drop_write {
                return Err(LetheError::Storage("injected write failure".into()));
            }
            self.inner.apply(batch).await
        }
    }
}
