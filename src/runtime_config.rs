// =============================================================================
// Runtime Configuration — Hot-reloadable pipeline settings with atomic save
// =============================================================================
//
// Central configuration hub for the Foresight pipeline. Every tunable
// parameter lives here so the engine can be reconfigured at runtime without a
// restart: worker intervals, the predictor TTL, the review gray zone, dedup
// lookback, and the default promotion criteria.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::BacktestCriteria;
use crate::types::EngineMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_predictor_ttl_hours() -> i64 {
    24
}

fn default_dedup_lookback_hours() -> i64 {
    72
}

fn default_resolution_horizon_hours() -> i64 {
    24
}

fn default_review_low() -> f64 {
    0.4
}

fn default_review_high() -> f64 {
    0.7
}

fn default_neutral_band_pct() -> f64 {
    0.25
}

fn default_evaluation_window_days() -> i64 {
    30
}

fn default_missed_min_move_pct() -> f64 {
    2.0
}

fn default_source_failure_limit() -> u32 {
    5
}

fn default_external_timeout_secs() -> u64 {
    20
}

fn default_min_sample_size() -> usize {
    30
}

fn default_min_accuracy_lift() -> f64 {
    0.05
}

fn default_max_false_positive_increase() -> f64 {
    0.02
}

fn default_min_significance() -> f64 {
    0.95
}

// =============================================================================
// WorkerIntervals
// =============================================================================

fn default_source_crawl_secs() -> u64 {
    60
}

fn default_signal_batch_secs() -> u64 {
    30
}

fn default_prediction_batch_secs() -> u64 {
    30
}

fn default_outcome_tracking_secs() -> u64 {
    300
}

fn default_evaluation_secs() -> u64 {
    3600
}

fn default_missed_opportunity_secs() -> u64 {
    3600
}

fn default_expiration_sweep_secs() -> u64 {
    600
}

/// Per-worker tick intervals in seconds. Each worker runs on its own clock;
/// no worker waits on another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIntervals {
    #[serde(default = "default_source_crawl_secs")]
    pub source_crawl_secs: u64,
    #[serde(default = "default_signal_batch_secs")]
    pub signal_batch_secs: u64,
    #[serde(default = "default_prediction_batch_secs")]
    pub prediction_batch_secs: u64,
    #[serde(default = "default_outcome_tracking_secs")]
    pub outcome_tracking_secs: u64,
    #[serde(default = "default_evaluation_secs")]
    pub evaluation_secs: u64,
    #[serde(default = "default_missed_opportunity_secs")]
    pub missed_opportunity_secs: u64,
    #[serde(default = "default_expiration_sweep_secs")]
    pub expiration_sweep_secs: u64,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            source_crawl_secs: default_source_crawl_secs(),
            signal_batch_secs: default_signal_batch_secs(),
            prediction_batch_secs: default_prediction_batch_secs(),
            outcome_tracking_secs: default_outcome_tracking_secs(),
            evaluation_secs: default_evaluation_secs(),
            missed_opportunity_secs: default_missed_opportunity_secs(),
            expiration_sweep_secs: default_expiration_sweep_secs(),
        }
    }
}

// =============================================================================
// PromotionDefaults
// =============================================================================

/// Default backtest criteria applied when a promotion request does not carry
/// its own. All four must pass for a promotion to proceed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionDefaults {
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: usize,
    #[serde(default = "default_min_accuracy_lift")]
    pub min_accuracy_lift: f64,
    #[serde(default = "default_max_false_positive_increase")]
    pub max_false_positive_increase: f64,
    #[serde(default = "default_min_significance")]
    pub min_significance: f64,
}

impl Default for PromotionDefaults {
    fn default() -> Self {
        Self {
            min_sample_size: default_min_sample_size(),
            min_accuracy_lift: default_min_accuracy_lift(),
            max_false_positive_increase: default_max_false_positive_increase(),
            min_significance: default_min_significance(),
        }
    }
}

impl PromotionDefaults {
    pub fn to_criteria(&self) -> BacktestCriteria {
        BacktestCriteria {
            min_sample_size: self.min_sample_size,
            min_accuracy_lift: self.min_accuracy_lift,
            max_false_positive_increase: self.max_false_positive_increase,
            min_significance: self.min_significance,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Foresight pipeline.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational mode ----------------------------------------------------

    /// Demo routes analyst dispatch to the deterministic backend; Live uses
    /// the configured LLM providers.
    #[serde(default)]
    pub engine_mode: EngineMode,

    // --- Pipeline parameters -------------------------------------------------

    /// How long a predictor stays live after dispatch.
    #[serde(default = "default_predictor_ttl_hours")]
    pub predictor_ttl_hours: i64,

    /// Window within which an identical fingerprint for the same target is a
    /// duplicate.
    #[serde(default = "default_dedup_lookback_hours")]
    pub dedup_lookback_hours: i64,

    /// Global resolution horizon; universes may override.
    #[serde(default = "default_resolution_horizon_hours")]
    pub resolution_horizon_hours: i64,

    /// Lower bound of the review gray zone (inclusive).
    #[serde(default = "default_review_low")]
    pub review_confidence_low: f64,

    /// Upper bound of the review gray zone (inclusive).
    #[serde(default = "default_review_high")]
    pub review_confidence_high: f64,

    /// Moves within ±this percentage resolve as Neutral.
    #[serde(default = "default_neutral_band_pct")]
    pub neutral_band_pct: f64,

    /// Evaluation aggregation window.
    #[serde(default = "default_evaluation_window_days")]
    pub evaluation_window_days: i64,

    /// Minimum realized move for a missed-opportunity flag.
    #[serde(default = "default_missed_min_move_pct")]
    pub missed_min_move_pct: f64,

    /// Consecutive crawl failures before a source is disabled.
    #[serde(default = "default_source_failure_limit")]
    pub source_failure_limit: u32,

    /// Timeout for each external call (crawl fetch, LLM dispatch, price
    /// fetch). One timeout fails one unit of work, never the batch.
    #[serde(default = "default_external_timeout_secs")]
    pub external_timeout_secs: u64,

    // --- Worker scheduling ---------------------------------------------------

    #[serde(default)]
    pub intervals: WorkerIntervals,

    // --- Promotion gate ------------------------------------------------------

    #[serde(default)]
    pub promotion: PromotionDefaults,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine_mode: EngineMode::Demo,
            predictor_ttl_hours: default_predictor_ttl_hours(),
            dedup_lookback_hours: default_dedup_lookback_hours(),
            resolution_horizon_hours: default_resolution_horizon_hours(),
            review_confidence_low: default_review_low(),
            review_confidence_high: default_review_high(),
            neutral_band_pct: default_neutral_band_pct(),
            evaluation_window_days: default_evaluation_window_days(),
            missed_min_move_pct: default_missed_min_move_pct(),
            source_failure_limit: default_source_failure_limit(),
            external_timeout_secs: default_external_timeout_secs(),
            intervals: WorkerIntervals::default(),
            promotion: PromotionDefaults::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            engine_mode = %config.engine_mode,
            predictor_ttl_hours = config.predictor_ttl_hours,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Whether `confidence` falls inside the review gray zone.
    pub fn in_review_gray_zone(&self, confidence: f64) -> bool {
        confidence >= self.review_confidence_low && confidence <= self.review_confidence_high
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.engine_mode, EngineMode::Demo);
        assert_eq!(cfg.predictor_ttl_hours, 24);
        assert_eq!(cfg.dedup_lookback_hours, 72);
        assert!((cfg.review_confidence_low - 0.4).abs() < f64::EPSILON);
        assert!((cfg.review_confidence_high - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.promotion.min_sample_size, 30);
        assert!((cfg.promotion.min_significance - 0.95).abs() < f64::EPSILON);
        assert_eq!(cfg.intervals.source_crawl_secs, 60);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.engine_mode, EngineMode::Demo);
        assert_eq!(cfg.predictor_ttl_hours, 24);
        assert_eq!(cfg.source_failure_limit, 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "predictor_ttl_hours": 6, "intervals": { "source_crawl_secs": 10 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.predictor_ttl_hours, 6);
        assert_eq!(cfg.intervals.source_crawl_secs, 10);
        assert_eq!(cfg.intervals.signal_batch_secs, 30);
        assert_eq!(cfg.evaluation_window_days, 30);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.predictor_ttl_hours, cfg2.predictor_ttl_hours);
        assert_eq!(cfg.engine_mode, cfg2.engine_mode);
        assert_eq!(cfg.promotion.min_sample_size, cfg2.promotion.min_sample_size);
    }

    #[test]
    fn gray_zone_bounds_are_inclusive() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.in_review_gray_zone(0.4));
        assert!(cfg.in_review_gray_zone(0.55));
        assert!(cfg.in_review_gray_zone(0.7));
        assert!(!cfg.in_review_gray_zone(0.39));
        assert!(!cfg.in_review_gray_zone(0.71));
    }
}
