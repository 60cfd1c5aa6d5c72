//! Pairwise contradiction detection between a new fact and existing ones.

use crate::fact::{Fact, TemporalType};

/// Confidence a new fact needs before it may supersede anything.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.6;

/// Decides when a newer fact supersedes an older, conflicting one.
///
/// Only `dynamic` facts are ever superseded automatically. Equal confidence
/// keeps the older fact, so near-duplicates cannot invalidate each other in
/// turn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContradictionDetector {
    min_confidence: f64,
}

impl Default for ContradictionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CONFIDENCE)
    }
}

impl ContradictionDetector {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// Whether `new` is allowed to supersede `old`.
    ///
    /// Requires `old` to be dynamic, the two to contradict, `new` to be
    /// strictly newer, and `new.confidence` to reach the absolute floor.
    pub fn should_invalidate(&self, old: &Fact, new: &Fact) -> bool {
        old.temporal_type == TemporalType::Dynamic
            && new.contradicts(old)
            && new.valid_from > old.valid_from
            && new.confidence() >= self.min_confidence
    }

    /// Active facts in `pool` that `new` supersedes: those passing
    /// [`should_invalidate`](Self::should_invalidate) with strictly lower
    /// confidence than `new`.
    pub fn find_superseded<'a>(&self, new: &Fact, pool: &'a [Fact]) -> Vec<&'a Fact> {
        pool.iter()
            .filter(|old| {
                old.is_active()
                    && self.should_invalidate(old, new)
                    && new.confidence() > old.confidence()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn status(object: &str, confidence: f64, at: &str) -> Fact {
        Fact::new("X", "status", object, dt(at))
            .with_temporal_type(TemporalType::Dynamic)
            .with_confidence(confidence)
    }

    #[test]
    fn newer_more_confident_fact_supersedes() {
        let detector = ContradictionDetector::default();
        let a = status("open", 0.7, "2024-01-01T00:00:00Z");
        let b = status("closed", 0.9, "2024-02-01T00:00:00Z");

        assert!(detector.should_invalidate(&a, &b));
        let pool = [a.clone()];
        let superseded = detector.find_superseded(&b, &pool);
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].id, a.id);
    }

    #[test]
    fn equal_confidence_keeps_older_fact() {
        let detector = ContradictionDetector::default();
        let a = status("open", 0.7, "2024-01-01T00:00:00Z");
        let b = status("closed", 0.7, "2024-02-01T00:00:00Z");

        assert!(detector.should_invalidate(&a, &b), "the pair qualifies");
        assert!(
            detector.find_superseded(&b, &[a]).is_empty(),
            "but a tie must not invalidate"
        );
    }

    #[test]
    fn static_facts_are_never_superseded() {
        let detector = ContradictionDetector::default();
        let a = status("open", 0.1, "2024-01-01T00:00:00Z")
            .with_temporal_type(TemporalType::Static);
        let b = status("closed", 1.0, "2024-02-01T00:00:00Z");
        assert!(!detector.should_invalidate(&a, &b));

        for temporal_type in [TemporalType::Atemporal, TemporalType::TemporalBound] {
            let old = a.clone().with_temporal_type(temporal_type);
            assert!(!detector.should_invalidate(&old, &b));
        }
    }

    #[test]
    fn older_or_simultaneous_fact_cannot_supersede() {
        let detector = ContradictionDetector::default();
        let a = status("open", 0.5, "2024-02-01T00:00:00Z");
        let earlier = status("closed", 0.9, "2024-01-01T00:00:00Z");
        let same_time = status("closed", 0.9, "2024-02-01T00:00:00Z");
        assert!(!detector.should_invalidate(&a, &earlier));
        assert!(!detector.should_invalidate(&a, &same_time));
    }

    #[test]
    fn confidence_floor_is_absolute() {
        let detector = ContradictionDetector::default();
        let a = status("open", 0.1, "2024-01-01T00:00:00Z");
        let weak = status("closed", 0.59, "2024-02-01T00:00:00Z");
        assert!(!detector.should_invalidate(&a, &weak));

        let at_floor = status("closed", 0.6, "2024-02-01T00:00:00Z");
        assert!(detector.should_invalidate(&a, &at_floor));
    }

    #[test]
    fn agreeing_and_unrelated_facts_are_ignored() {
        let detector = ContradictionDetector::default();
        let new = status("closed", 0.9, "2024-02-01T00:00:00Z");
        let pool = vec![
            status("CLOSED", 0.1, "2024-01-01T00:00:00Z"),
            Fact::new("Y", "status", "open", dt("2024-01-01T00:00:00Z"))
                .with_temporal_type(TemporalType::Dynamic)
                .with_confidence(0.1),
            Fact::new("X", "owner", "bob", dt("2024-01-01T00:00:00Z"))
                .with_temporal_type(TemporalType::Dynamic)
                .with_confidence(0.1),
            new.clone(),
        ];
        assert!(detector.find_superseded(&new, &pool).is_empty());
    }
}
