//! Engine configuration: defaults, `LETHE_*` environment overrides, validation.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::contradiction::DEFAULT_MIN_CONFIDENCE;
use crate::error::{LetheError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path of the redb database file.
    pub db_path: PathBuf,
    /// Pause between scheduled sweeps.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// Facts invalidated per storage write during a sweep.
    pub batch_size: usize,
    /// Sweep history entries kept (oldest trimmed).
    pub history_limit: usize,
    /// Extraction history entries kept (oldest trimmed).
    pub extraction_history_limit: usize,
    /// Facts included in a dry-run sample.
    pub dry_run_sample_size: usize,
    /// Upper bound on candidate facts loaded per sweep.
    pub max_candidates: usize,
    /// Confidence floor for a new fact to supersede a contradicting one.
    pub contradiction_min_confidence: f64,
    /// History entries summarised by statistics.
    pub recent_sweeps_in_stats: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./lethe.redb"),
            sweep_interval: Duration::from_secs(3600),
            batch_size: 100,
            history_limit: 100,
            extraction_history_limit: 100,
            dry_run_sample_size: 10,
            max_candidates: 10_000,
            contradiction_min_confidence: DEFAULT_MIN_CONFIDENCE,
            recent_sweeps_in_stats: 10,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `LETHE_*` environment variables, validated.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("LETHE_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LETHE_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(v) = parse_var(&lookup, "LETHE_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "LETHE_HISTORY_LIMIT")? {
            config.history_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "LETHE_EXTRACTION_HISTORY_LIMIT")? {
            config.extraction_history_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "LETHE_DRY_RUN_SAMPLE_SIZE")? {
            config.dry_run_sample_size = v;
        }
        if let Some(v) = parse_var(&lookup, "LETHE_MAX_CANDIDATES")? {
            config.max_candidates = v;
        }
        if let Some(v) = parse_var(&lookup, "LETHE_CONTRADICTION_MIN_CONFIDENCE")? {
            config.contradiction_min_confidence = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(LetheError::Config("sweep interval must be positive".into()));
        }
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("history_limit", self.history_limit),
            ("extraction_history_limit", self.extraction_history_limit),
            ("max_candidates", self.max_candidates),
        ] {
            if value == 0 {
                return Err(LetheError::Config(format!("{name} must be at least 1")));
            }
        }
        if !(0.0..=1.0).contains(&self.contradiction_min_confidence) {
            return Err(LetheError::Config(format!(
                "contradiction_min_confidence must be within [0, 1], got {}",
                self.contradiction_min_confidence
            )));
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| LetheError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
