//! Persisted rule set.
//!
//! Rules live in one hash (`lethe:rules`, rule id → JSON). Evaluation order
//! is registration order, kept in each rule's `position`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{LetheError, Result};
use crate::fact::Lookup;
use crate::kv::{KeyValueStore, WriteBatch};
use crate::rule::{default_rules, InvalidationRule};

pub const RULES_KEY: &str = "lethe:rules";

#[derive(Clone)]
pub struct RuleRegistry {
    kv: Arc<dyn KeyValueStore>,
}

impl RuleRegistry {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Every decodable rule, in registration order. Malformed entries are
    /// logged and skipped.
    pub async fn list_rules(&self) -> Result<Vec<InvalidationRule>> {
        let mut rules = Vec::new();
        for (rule_id, raw) in self.kv.hash_get_all(RULES_KEY).await? {
            match serde_json::from_str::<InvalidationRule>(&raw) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(rule_id = %rule_id, error = %e, "skipping malformed rule"),
            }
        }
        rules.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        Ok(rules)
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<Lookup<InvalidationRule>> {
        let Some(raw) = self.kv.hash_get(RULES_KEY, rule_id).await? else {
            return Ok(Lookup::NotFound);
        };
        match serde_json::from_str(&raw) {
            Ok(rule) => Ok(Lookup::Found(rule)),
            Err(e) => {
                warn!(rule_id, error = %e, "skipping malformed rule");
                Ok(Lookup::NotFound)
            }
        }
    }

    /// Insert or replace a rule.
    ///
    /// A new rule goes to the end of the evaluation order; replacing an
    /// existing rule keeps its place.
    pub async fn add_rule(&self, mut rule: InvalidationRule) -> Result<InvalidationRule> {
        rule.validate()?;
        let existing = self.list_rules().await?;
        rule.position = match existing.iter().find(|r| r.rule_id == rule.rule_id) {
            Some(current) => current.position,
            None => existing.iter().map(|r| r.position).max().unwrap_or(0) + 1,
        };
        self.write(&rule).await?;
        info!(rule_id = %rule.rule_id, position = rule.position, "registered rule");
        Ok(rule)
    }

    /// Delete a rule. Returns `false` when it did not exist.
    pub async fn remove_rule(&self, rule_id: &str) -> Result<bool> {
        if self.kv.hash_get(RULES_KEY, rule_id).await?.is_none() {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        batch.hash_delete(RULES_KEY, rule_id);
        self.kv.apply(batch).await?;
        info!(rule_id, "removed rule");
        Ok(true)
    }

    pub async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<InvalidationRule> {
        let Lookup::Found(mut rule) = self.get_rule(rule_id).await? else {
            return Err(LetheError::NotFound(format!("rule {rule_id}")));
        };
        rule.enabled = enabled;
        self.write(&rule).await?;
        debug!(rule_id, enabled, "toggled rule");
        Ok(rule)
    }

    /// Seed the default rule set when no rules are registered yet.
    ///
    /// Returns how many rules were seeded (zero when rules already exist).
    pub async fn ensure_defaults(&self) -> Result<usize> {
        if !self.kv.hash_get_all(RULES_KEY).await?.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        let defaults = default_rules();
        let count = defaults.len();
        for (position, mut rule) in (1..).zip(defaults) {
            rule.position = position;
            batch.hash_set(RULES_KEY, vec![(rule.rule_id.clone(), serde_json::to_string(&rule)?)]);
        }
        self.kv.apply(batch).await?;
        info!(count, "seeded default invalidation rules");
        Ok(count)
    }

    async fn write(&self, rule: &InvalidationRule) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.hash_set(
            RULES_KEY,
            vec![(rule.rule_id.clone(), serde_json::to_string(rule)?)],
        );
        self.kv.apply(batch).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::TemporalType;
    use crate::redb_store::RedbStore;
    use crate::rule::Criterion;

    fn open_registry() -> (RuleRegistry, Arc<dyn KeyValueStore>) {
        let kv: Arc<dyn KeyValueStore> = Arc::new(RedbStore::open_in_memory().unwrap());
        (RuleRegistry::new(Arc::clone(&kv)), kv)
    }

    fn rule(id: &str) -> InvalidationRule {
        InvalidationRule::new(id, id, [TemporalType::Dynamic]).with_criterion(Criterion::max_age(1.0))
    }

    #[tokio::test]
    async fn defaults_are_seeded_once_in_order() {
        let (registry, _kv) = open_registry();
        assert_eq!(registry.ensure_defaults().await.unwrap(), 5);
        assert_eq!(registry.ensure_defaults().await.unwrap(), 0);

        let ids: Vec<String> = registry
            .list_rules()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.rule_id)
            .collect();
        assert_eq!(
            ids,
            [
                "dynamic_30d",
                "predictions_90d",
                "opinions_180d",
                "low_confidence_dynamic_7d",
                "test_sources_1d"
            ]
        );
    }

    #[tokio::test]
    async fn registration_order_not_alphabetical() {
        let (registry, _kv) = open_registry();
        registry.add_rule(rule("zulu")).await.unwrap();
        registry.add_rule(rule("alpha")).await.unwrap();
        registry.add_rule(rule("mike")).await.unwrap();
        // Replacing keeps the original slot.
        registry
            .add_rule(rule("zulu").with_description("updated"))
            .await
            .unwrap();

        let rules = registry.list_rules().await.unwrap();
        let ids: Vec<&str> = rules.iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(ids, ["zulu", "alpha", "mike"]);
        assert_eq!(rules[0].description, "updated");
    }

    #[tokio::test]
    async fn add_rule_validates() {
        let (registry, _kv) = open_registry();
        let bad = InvalidationRule::new("empty", "empty", [TemporalType::Dynamic]);
        assert!(matches!(
            registry.add_rule(bad).await,
            Err(LetheError::InvalidRule(_))
        ));
        assert!(registry.list_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_and_toggle() {
        let (registry, _kv) = open_registry();
        registry.add_rule(rule("a")).await.unwrap();
        registry.add_rule(rule("b")).await.unwrap();

        let toggled = registry.set_enabled("a", false).await.unwrap();
        assert!(!toggled.enabled);
        let stored = registry.get_rule("a").await.unwrap().into_option().unwrap();
        assert!(!stored.enabled);

        assert!(registry.remove_rule("b").await.unwrap());
        assert!(!registry.remove_rule("b").await.unwrap());
        assert_eq!(registry.get_rule("b").await.unwrap(), Lookup::NotFound);
        assert!(matches!(
            registry.set_enabled("b", true).await,
            Err(LetheError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_rules_are_skipped() {
        let (registry, kv) = open_registry();
        registry.add_rule(rule("good")).await.unwrap();
        let mut batch = WriteBatch::new();
        batch.hash_set(RULES_KEY, vec![("broken".to_string(), "{\"rule_id\":".to_string())]);
        kv.apply(batch).await.unwrap();

        let rules = registry.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule_id, "good");
        assert_eq!(registry.get_rule("broken").await.unwrap(), Lookup::NotFound);
    }
}
