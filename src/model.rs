// =============================================================================
// Pipeline Entities — Universe through PromotionRecord
// =============================================================================
//
// Every entity the pipeline persists. Ids are `uuid::Uuid`, timestamps are
// `chrono::DateTime<Utc>`. Three fields recur everywhere and carry the
// isolation invariants:
//
//   is_test          — derived from the originating Source, propagated
//                      unchanged through every downstream entity.
//   scenario_run_id  — groups all synthetic entities created by one scenario
//                      run, enabling bulk cleanup and backtest replay.
//   superseded_by    — supersession lineage; superseded rows are kept, never
//                      deleted.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::types::{Direction, Domain, LlmTier, SourceKind};

// =============================================================================
// Universe
// =============================================================================

/// Provider + model behind one LLM tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub provider: String,
    pub model: String,
}

/// The three consensus gates. All must hold simultaneously for a Prediction
/// to be created or refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsensusThresholds {
    /// Minimum count of live predictors.
    pub min_predictors: usize,
    /// Minimum sum of predictor strengths.
    pub min_combined_strength: f64,
    /// Minimum fraction of predictors agreeing on the dominant direction.
    pub min_direction_consensus: f64,
}

impl Default for ConsensusThresholds {
    fn default() -> Self {
        Self {
            min_predictors: 3,
            min_combined_strength: 15.0,
            min_direction_consensus: 0.6,
        }
    }
}

impl ConsensusThresholds {
    /// Reject malformed thresholds before they reach the consensus engine.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.min_predictors == 0 {
            return Err(PipelineError::validation(
                "INVALID_THRESHOLDS",
                "min_predictors must be at least 1",
            ));
        }
        if self.min_combined_strength < 0.0 {
            return Err(PipelineError::validation(
                "INVALID_THRESHOLDS",
                "min_combined_strength must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_direction_consensus) {
            return Err(PipelineError::validation(
                "INVALID_THRESHOLDS",
                format!(
                    "min_direction_consensus must be within [0, 1], got {}",
                    self.min_direction_consensus
                ),
            ));
        }
        Ok(())
    }
}

/// One analyst slot in a Universe's ensemble roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystSpec {
    /// Stable analyst identifier, e.g. "macro", "sentiment", "contrarian".
    pub id: String,
    pub name: String,
    pub tier: LlmTier,
    /// Relative weight applied to this analyst's strength during consensus.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

/// Where threshold-crossing predictions get announced. Delivery itself is a
/// log line; the config is kept so operators can route it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub channel: String,
    #[serde(default)]
    pub min_strength: f64,
}

/// A scoped analysis context: one domain, one agent, its tier mapping,
/// consensus thresholds, and analyst roster. Never hard-deleted, only
/// deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Universe {
    pub id: Uuid,
    pub org_id: String,
    pub agent_id: String,
    pub name: String,
    pub domain: Domain,
    pub tiers: HashMap<LlmTier, TierConfig>,
    pub thresholds: ConsensusThresholds,
    pub analysts: Vec<AnalystSpec>,
    /// Per-universe override of the global resolution horizon.
    #[serde(default)]
    pub resolution_horizon_hours: Option<i64>,
    #[serde(default)]
    pub notification: Option<NotificationConfig>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Target & Source
// =============================================================================

/// A tracked subject within a Universe. Archived, not deleted, so history
/// stays resolvable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    pub universe_id: Uuid,
    pub symbol: String,
    /// Free-form type label: "equity", "token", "market", ...
    pub kind: String,
    #[serde(default)]
    pub tier_override: Option<LlmTier>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

/// A content origin. `is_test` here is the root of the isolation invariant:
/// every Signal inherits it and propagates it downstream unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub universe_id: Uuid,
    pub name: String,
    pub kind: SourceKind,
    /// Fetch URL for web/feed sources; unused for test_db.
    #[serde(default)]
    pub url: Option<String>,
    pub crawl_interval_minutes: u64,
    pub is_test: bool,
    /// Stamped by the test tooling when a scenario run loads this source.
    #[serde(default)]
    pub scenario_run_id: Option<Uuid>,
    pub enabled: bool,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One raw content item produced by a crawl, before extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawledItem {
    pub source_id: Uuid,
    pub title: String,
    pub body: String,
    /// Symbols the item references; resolved to Targets by the extractor.
    pub symbols: Vec<String>,
    #[serde(default)]
    pub direction_hint: Option<Direction>,
    /// Hinted strength in [0, 10], when the source provides one.
    #[serde(default)]
    pub strength_hint: Option<f64>,
    pub published_at: DateTime<Utc>,
}

// =============================================================================
// Signal & Predictor
// =============================================================================

/// One piece of evidence about a Target. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub universe_id: Uuid,
    pub target_id: Uuid,
    pub source_id: Uuid,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub direction_hint: Option<Direction>,
    #[serde(default)]
    pub strength_hint: Option<f64>,
    /// Content-derived dedup fingerprint (sha256 over normalized title+body).
    pub fingerprint: String,
    pub is_test: bool,
    #[serde(default)]
    pub scenario_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// How a predictor stands with respect to human review. Only `Auto` and
/// `Approved` predictors feed the consensus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDisposition {
    /// Confidence outside the gray zone; flows straight to consensus.
    Auto,
    /// Held pending a human decision.
    Held,
    Approved,
    Rejected,
}

/// One analyst's assessment of one Signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predictor {
    pub id: Uuid,
    pub universe_id: Uuid,
    pub target_id: Uuid,
    pub signal_id: Uuid,
    pub analyst_id: String,
    pub direction: Direction,
    /// Strength in [0, 10].
    pub strength: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub tier: LlmTier,
    pub disposition: ReviewDisposition,
    pub is_test: bool,
    #[serde(default)]
    pub scenario_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set by the expiration sweep. Archived predictors are excluded from
    /// consensus but kept for audit.
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Predictor {
    /// Live means: not expired, not archived, and not held or rejected by
    /// review. TTL is evaluated lazily at read time.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
            && self.archived_at.is_none()
            && matches!(
                self.disposition,
                ReviewDisposition::Auto | ReviewDisposition::Approved
            )
    }
}

// =============================================================================
// Prediction & Outcome
// =============================================================================

/// The aggregated, threshold-gated forecast for a Target at a point in time.
/// A refresh supersedes (never deletes) the prior row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub universe_id: Uuid,
    pub target_id: Uuid,
    pub direction: Direction,
    pub combined_strength: f64,
    /// Fraction of contributing predictors agreeing on `direction`.
    pub consensus_ratio: f64,
    pub predictor_ids: Vec<Uuid>,
    pub thresholds_met: bool,
    /// Reference price captured at creation, used for outcome resolution.
    #[serde(default)]
    pub price_at_creation: Option<f64>,
    pub is_test: bool,
    #[serde(default)]
    pub scenario_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Resolution horizon; the outcome tracker ignores this row until then.
    pub resolve_after: DateTime<Utc>,
    #[serde(default)]
    pub superseded_by: Option<Uuid>,
    pub resolved: bool,
}

/// Ground truth resolution of a Prediction. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub id: Uuid,
    pub prediction_id: Uuid,
    pub universe_id: Uuid,
    pub target_id: Uuid,
    pub predicted_direction: Direction,
    pub realized_direction: Direction,
    /// Signed percentage move between prediction and resolution.
    pub magnitude_pct: f64,
    pub correct: bool,
    pub is_test: bool,
    #[serde(default)]
    pub scenario_run_id: Option<Uuid>,
    pub resolved_at: DateTime<Utc>,
}

// =============================================================================
// Scope, Evaluation, Learning
// =============================================================================

/// Scope level shared by Evaluations and Learnings. Broader scopes apply by
/// default; a narrower scope overrides them for matching targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "level", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Runner,
    Domain(Domain),
    Universe(Uuid),
    Target(Uuid),
}

impl Scope {
    /// Specificity rank: higher wins when two learnings conflict.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::Runner => 0,
            Self::Domain(_) => 1,
            Self::Universe(_) => 2,
            Self::Target(_) => 3,
        }
    }

    /// Whether this scope covers the given target coordinates.
    pub fn covers(&self, domain: Domain, universe_id: Uuid, target_id: Uuid) -> bool {
        match self {
            Self::Runner => true,
            Self::Domain(d) => *d == domain,
            Self::Universe(u) => *u == universe_id,
            Self::Target(t) => *t == target_id,
        }
    }
}

/// Aggregate accuracy over a window of Outcomes at one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Uuid,
    pub scope: Scope,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub sample_count: usize,
    pub hit_count: usize,
    pub accuracy: f64,
    pub avg_magnitude_pct: f64,
    pub is_test: bool,
    pub created_at: DateTime<Utc>,
}

/// What kind of adjustment a Learning encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningKind {
    Rule,
    Pattern,
    Weight,
    Threshold,
    Avoid,
}

/// The config payload a Learning applies to consensus / ensemble runs in its
/// scope. Every field is optional; unset fields leave the base config alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default)]
    pub min_predictors: Option<usize>,
    #[serde(default)]
    pub min_combined_strength: Option<f64>,
    #[serde(default)]
    pub min_direction_consensus: Option<f64>,
    /// Per-analyst strength weight overrides.
    #[serde(default)]
    pub analyst_weights: HashMap<String, f64>,
    /// Multiplier applied to every predictor strength in scope.
    #[serde(default)]
    pub strength_multiplier: Option<f64>,
    /// Suppress predictions entirely for targets in scope.
    #[serde(default)]
    pub avoid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStatus {
    Active,
    Superseded,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningSource {
    Human,
    AiSuggested,
    AiApproved,
}

/// A scoring-rule adjustment at some scope. Superseded learnings keep a
/// lineage pointer; nothing is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: Uuid,
    pub scope: Scope,
    pub kind: LearningKind,
    pub config: LearningConfig,
    pub status: LearningStatus,
    pub source: LearningSource,
    /// True while the learning is only proven on test data; production
    /// scoring ignores it until promotion.
    pub is_test: bool,
    #[serde(default)]
    pub scenario_run_id: Option<Uuid>,
    #[serde(default)]
    pub evaluation_id: Option<Uuid>,
    #[serde(default)]
    pub superseded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Learning Queue
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
}

/// A pending AI-suggested Learning awaiting a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningQueueItem {
    pub id: Uuid,
    pub suggested_scope: Scope,
    pub suggested_kind: LearningKind,
    pub suggested_config: LearningConfig,
    pub reasoning: String,
    pub ai_confidence: f64,
    pub status: QueueStatus,
    #[serde(default)]
    pub resolved_learning_id: Option<Uuid>,
    pub is_test: bool,
    #[serde(default)]
    pub scenario_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Promotion
// =============================================================================

/// Gate a test Learning must clear before it may touch production scoring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BacktestCriteria {
    pub min_sample_size: usize,
    pub min_accuracy_lift: f64,
    pub max_false_positive_increase: f64,
    /// Required confidence level of the two-proportion significance test.
    pub min_significance: f64,
}

impl Default for BacktestCriteria {
    fn default() -> Self {
        Self {
            min_sample_size: 30,
            min_accuracy_lift: 0.05,
            max_false_positive_increase: 0.02,
            min_significance: 0.95,
        }
    }
}

/// Result of one backtest run: accuracy with vs. without the Learning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub sample_size: usize,
    pub baseline_accuracy: f64,
    pub adjusted_accuracy: f64,
    pub accuracy_lift: f64,
    pub baseline_false_positive_rate: f64,
    pub adjusted_false_positive_rate: f64,
    pub false_positive_increase: f64,
    /// Confidence level that the lift is real (1 - p, two-proportion z-test).
    pub significance: f64,
    /// Names of criteria that failed; empty when the gate passed.
    pub failing_criteria: Vec<String>,
    pub passed: bool,
}

/// Record of a test Learning being elevated to production scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub id: Uuid,
    pub test_learning_id: Uuid,
    pub production_learning_id: Uuid,
    pub report: BacktestReport,
    pub reviewer: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub scenario_run_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Review Queue
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
}

/// A gray-zone predictor awaiting human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: Uuid,
    pub predictor_id: Uuid,
    pub universe_id: Uuid,
    pub confidence: f64,
    pub status: ReviewStatus,
    #[serde(default)]
    pub strength_override: Option<f64>,
    /// Free-text learning note; seeds a LearningQueue candidate on approval.
    #[serde(default)]
    pub note: Option<String>,
    pub is_test: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Test fixtures
// =============================================================================

/// A named bundle of synthetic articles and price data for isolated
/// experimentation. Running a scenario mints a fresh `scenario_run_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestScenario {
    pub id: Uuid,
    pub universe_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub last_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Synthetic article served by a `test_db` source. Symbols must carry the
/// `T_` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestArticle {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub symbol: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub direction_hint: Option<Direction>,
    #[serde(default)]
    pub strength_hint: Option<f64>,
    pub published_at: DateTime<Utc>,
    /// Set once a crawl has emitted this article.
    pub consumed: bool,
}

/// Synthetic price point for a `T_` symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPriceData {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub symbol: String,
    pub at: DateTime<Utc>,
    pub price: f64,
}

/// Maps a `T_` mirrored symbol back to the production Target it shadows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestTargetMirror {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub universe_id: Uuid,
    pub test_symbol: String,
    pub real_symbol: String,
    /// The test-side Target created for the mirror.
    pub target_id: Uuid,
}
