// =============================================================================
// Store — typed tables, single source of truth
// =============================================================================
//
// In-process relational-style store: one RwLock-guarded table per entity.
// Cross-entity consistency is enforced by re-querying at decision time, not
// by caching derived state. Each entity type has exactly one writer role
// (the crawler writes Sources' crawl state, only the consensus engine writes
// Predictions, only the outcome tracker writes Outcomes, and so on), so no
// cross-worker locks are needed.
//
// Test-only tables (articles, price data, mirrors) refuse symbols without
// the `T_` prefix; that check plus the prefix-based price routing is what
// keeps the synthetic path from ever crossing into production scoring.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{
    Evaluation, Learning, LearningQueueItem, Outcome, Prediction, Predictor, PromotionRecord,
    QueueStatus, ReviewItem, ReviewStatus, Signal, Source, Target, TestArticle, TestPriceData,
    TestScenario, TestTargetMirror, Universe,
};
use crate::symbols;

/// All pipeline tables. Wrapped in `Arc` and shared across workers.
#[derive(Default)]
pub struct Store {
    universes: RwLock<HashMap<Uuid, Universe>>,
    targets: RwLock<HashMap<Uuid, Target>>,
    sources: RwLock<HashMap<Uuid, Source>>,
    signals: RwLock<HashMap<Uuid, Signal>>,
    predictors: RwLock<HashMap<Uuid, Predictor>>,
    predictions: RwLock<HashMap<Uuid, Prediction>>,
    outcomes: RwLock<HashMap<Uuid, Outcome>>,
    evaluations: RwLock<HashMap<Uuid, Evaluation>>,
    learnings: RwLock<HashMap<Uuid, Learning>>,
    learning_queue: RwLock<HashMap<Uuid, LearningQueueItem>>,
    promotions: RwLock<HashMap<Uuid, PromotionRecord>>,
    review_items: RwLock<HashMap<Uuid, ReviewItem>>,

    // Test-only tables.
    test_scenarios: RwLock<HashMap<Uuid, TestScenario>>,
    test_articles: RwLock<HashMap<Uuid, TestArticle>>,
    test_prices: RwLock<HashMap<Uuid, TestPriceData>>,
    test_mirrors: RwLock<HashMap<Uuid, TestTargetMirror>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Universes
    // =========================================================================

    pub fn insert_universe(&self, universe: Universe) {
        self.universes.write().insert(universe.id, universe);
    }

    pub fn universe(&self, id: Uuid) -> PipelineResult<Universe> {
        self.universes
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("universe", id.to_string()))
    }

    pub fn list_universes(&self) -> Vec<Universe> {
        self.universes.read().values().cloned().collect()
    }

    pub fn active_universes(&self) -> Vec<Universe> {
        self.universes
            .read()
            .values()
            .filter(|u| u.active)
            .cloned()
            .collect()
    }

    pub fn update_universe<F>(&self, id: Uuid, mutate: F) -> PipelineResult<Universe>
    where
        F: FnOnce(&mut Universe),
    {
        let mut table = self.universes.write();
        let universe = table
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("universe", id.to_string()))?;
        mutate(universe);
        Ok(universe.clone())
    }

    // =========================================================================
    // Targets
    // =========================================================================

    pub fn insert_target(&self, target: Target) {
        self.targets.write().insert(target.id, target);
    }

    pub fn target(&self, id: Uuid) -> PipelineResult<Target> {
        self.targets
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("target", id.to_string()))
    }

    pub fn target_by_symbol(&self, universe_id: Uuid, symbol: &str) -> Option<Target> {
        self.targets
            .read()
            .values()
            .find(|t| t.universe_id == universe_id && t.symbol == symbol && !t.archived)
            .cloned()
    }

    pub fn list_targets(&self, universe_id: Uuid) -> Vec<Target> {
        self.targets
            .read()
            .values()
            .filter(|t| t.universe_id == universe_id)
            .cloned()
            .collect()
    }

    pub fn update_target<F>(&self, id: Uuid, mutate: F) -> PipelineResult<Target>
    where
        F: FnOnce(&mut Target),
    {
        let mut table = self.targets.write();
        let target = table
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("target", id.to_string()))?;
        mutate(target);
        Ok(target.clone())
    }

    // =========================================================================
    // Sources
    // =========================================================================

    pub fn insert_source(&self, source: Source) {
        self.sources.write().insert(source.id, source);
    }

    pub fn source(&self, id: Uuid) -> PipelineResult<Source> {
        self.sources
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("source", id.to_string()))
    }

    pub fn list_sources(&self) -> Vec<Source> {
        self.sources.read().values().cloned().collect()
    }

    /// Enabled sources whose crawl interval has elapsed.
    pub fn due_sources(&self, now: DateTime<Utc>) -> Vec<Source> {
        self.sources
            .read()
            .values()
            .filter(|s| {
                s.enabled
                    && match s.last_crawled_at {
                        None => true,
                        Some(last) => {
                            now - last
                                >= chrono::Duration::minutes(s.crawl_interval_minutes as i64)
                        }
                    }
            })
            .cloned()
            .collect()
    }

    pub fn update_source<F>(&self, id: Uuid, mutate: F) -> PipelineResult<Source>
    where
        F: FnOnce(&mut Source),
    {
        let mut table = self.sources.write();
        let source = table
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("source", id.to_string()))?;
        mutate(source);
        Ok(source.clone())
    }

    // =========================================================================
    // Signals
    // =========================================================================

    pub fn insert_signal(&self, signal: Signal) {
        self.signals.write().insert(signal.id, signal);
    }

    pub fn signal(&self, id: Uuid) -> PipelineResult<Signal> {
        self.signals
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("signal", id.to_string()))
    }

    /// Whether a signal with this fingerprint already exists for the target
    /// within the lookback window.
    pub fn duplicate_signal_exists(
        &self,
        target_id: Uuid,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> bool {
        self.signals.read().values().any(|s| {
            s.target_id == target_id && s.fingerprint == fingerprint && s.created_at >= since
        })
    }

    pub fn signals_for_target(&self, target_id: Uuid) -> Vec<Signal> {
        self.signals
            .read()
            .values()
            .filter(|s| s.target_id == target_id)
            .cloned()
            .collect()
    }

    pub fn list_signals(&self) -> Vec<Signal> {
        self.signals.read().values().cloned().collect()
    }

    // =========================================================================
    // Predictors
    // =========================================================================

    pub fn insert_predictor(&self, predictor: Predictor) {
        self.predictors.write().insert(predictor.id, predictor);
    }

    pub fn predictor(&self, id: Uuid) -> PipelineResult<Predictor> {
        self.predictors
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("predictor", id.to_string()))
    }

    /// Whether this analyst has already assessed this signal. Used by the
    /// ensemble to make re-dispatch after a per-analyst failure idempotent.
    pub fn predictor_exists(&self, signal_id: Uuid, analyst_id: &str) -> bool {
        self.predictors
            .read()
            .values()
            .any(|p| p.signal_id == signal_id && p.analyst_id == analyst_id)
    }

    /// Live predictors for a target. TTL, archive state, and review holds are
    /// all evaluated here, at read time.
    pub fn live_predictors(&self, target_id: Uuid, now: DateTime<Utc>) -> Vec<Predictor> {
        self.predictors
            .read()
            .values()
            .filter(|p| p.target_id == target_id && p.is_live(now))
            .cloned()
            .collect()
    }

    pub fn update_predictor<F>(&self, id: Uuid, mutate: F) -> PipelineResult<Predictor>
    where
        F: FnOnce(&mut Predictor),
    {
        let mut table = self.predictors.write();
        let predictor = table
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("predictor", id.to_string()))?;
        mutate(predictor);
        Ok(predictor.clone())
    }

    /// Expired, not-yet-archived predictors. The sweep stamps `archived_at`
    /// on these; it never deletes rows.
    pub fn expired_unarchived_predictors(&self, now: DateTime<Utc>) -> Vec<Predictor> {
        self.predictors
            .read()
            .values()
            .filter(|p| p.expires_at <= now && p.archived_at.is_none())
            .cloned()
            .collect()
    }

    pub fn predictors_for_signal(&self, signal_id: Uuid) -> Vec<Predictor> {
        self.predictors
            .read()
            .values()
            .filter(|p| p.signal_id == signal_id)
            .cloned()
            .collect()
    }

    // =========================================================================
    // Predictions
    // =========================================================================

    pub fn insert_prediction(&self, prediction: Prediction) {
        self.predictions.write().insert(prediction.id, prediction);
    }

    pub fn prediction(&self, id: Uuid) -> PipelineResult<Prediction> {
        self.predictions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("prediction", id.to_string()))
    }

    /// The current (non-superseded) prediction for a target, if any.
    pub fn current_prediction(&self, target_id: Uuid) -> Option<Prediction> {
        self.predictions
            .read()
            .values()
            .filter(|p| p.target_id == target_id && p.superseded_by.is_none())
            .max_by_key(|p| p.created_at)
            .cloned()
    }

    pub fn update_prediction<F>(&self, id: Uuid, mutate: F) -> PipelineResult<Prediction>
    where
        F: FnOnce(&mut Prediction),
    {
        let mut table = self.predictions.write();
        let prediction = table
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("prediction", id.to_string()))?;
        mutate(prediction);
        Ok(prediction.clone())
    }

    /// Unresolved predictions whose resolution horizon has elapsed.
    pub fn resolvable_predictions(&self, now: DateTime<Utc>) -> Vec<Prediction> {
        self.predictions
            .read()
            .values()
            .filter(|p| !p.resolved && p.resolve_after <= now)
            .cloned()
            .collect()
    }

    pub fn predictions_for_target(&self, target_id: Uuid) -> Vec<Prediction> {
        self.predictions
            .read()
            .values()
            .filter(|p| p.target_id == target_id)
            .cloned()
            .collect()
    }

    pub fn list_predictions(&self) -> Vec<Prediction> {
        self.predictions.read().values().cloned().collect()
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    pub fn insert_outcome(&self, outcome: Outcome) {
        self.outcomes.write().insert(outcome.id, outcome);
    }

    pub fn outcome_for_prediction(&self, prediction_id: Uuid) -> Option<Outcome> {
        self.outcomes
            .read()
            .values()
            .find(|o| o.prediction_id == prediction_id)
            .cloned()
    }

    /// Outcomes resolved within `[start, end)`, split by provenance.
    pub fn outcomes_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        is_test: bool,
    ) -> Vec<Outcome> {
        self.outcomes
            .read()
            .values()
            .filter(|o| o.is_test == is_test && o.resolved_at >= start && o.resolved_at < end)
            .cloned()
            .collect()
    }

    pub fn list_outcomes(&self) -> Vec<Outcome> {
        self.outcomes.read().values().cloned().collect()
    }

    // =========================================================================
    // Evaluations
    // =========================================================================

    pub fn insert_evaluation(&self, evaluation: Evaluation) {
        self.evaluations.write().insert(evaluation.id, evaluation);
    }

    pub fn list_evaluations(&self) -> Vec<Evaluation> {
        self.evaluations.read().values().cloned().collect()
    }

    // =========================================================================
    // Learnings
    // =========================================================================

    pub fn insert_learning(&self, learning: Learning) {
        self.learnings.write().insert(learning.id, learning);
    }

    pub fn learning(&self, id: Uuid) -> PipelineResult<Learning> {
        self.learnings
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("learning", id.to_string()))
    }

    /// Active learnings for the given provenance. Production scoring passes
    /// `is_test = false` and therefore never sees unpromoted test learnings.
    pub fn active_learnings(&self, is_test: bool) -> Vec<Learning> {
        self.learnings
            .read()
            .values()
            .filter(|l| {
                l.status == crate::model::LearningStatus::Active && l.is_test == is_test
            })
            .cloned()
            .collect()
    }

    pub fn update_learning<F>(&self, id: Uuid, mutate: F) -> PipelineResult<Learning>
    where
        F: FnOnce(&mut Learning),
    {
        let mut table = self.learnings.write();
        let learning = table
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("learning", id.to_string()))?;
        mutate(learning);
        Ok(learning.clone())
    }

    pub fn list_learnings(&self) -> Vec<Learning> {
        self.learnings.read().values().cloned().collect()
    }

    // =========================================================================
    // Learning queue
    // =========================================================================

    pub fn insert_queue_item(&self, item: LearningQueueItem) {
        self.learning_queue.write().insert(item.id, item);
    }

    pub fn queue_item(&self, id: Uuid) -> PipelineResult<LearningQueueItem> {
        self.learning_queue
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("learning_queue_item", id.to_string()))
    }

    pub fn list_queue_items(&self) -> Vec<LearningQueueItem> {
        self.learning_queue.read().values().cloned().collect()
    }

    pub fn pending_queue_items(&self) -> Vec<LearningQueueItem> {
        self.learning_queue
            .read()
            .values()
            .filter(|i| i.status == QueueStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn update_queue_item<F>(&self, id: Uuid, mutate: F) -> PipelineResult<LearningQueueItem>
    where
        F: FnOnce(&mut LearningQueueItem),
    {
        let mut table = self.learning_queue.write();
        let item = table
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("learning_queue_item", id.to_string()))?;
        mutate(item);
        Ok(item.clone())
    }

    // =========================================================================
    // Promotions
    // =========================================================================

    pub fn insert_promotion(&self, record: PromotionRecord) {
        self.promotions.write().insert(record.id, record);
    }

    pub fn list_promotions(&self) -> Vec<PromotionRecord> {
        self.promotions.read().values().cloned().collect()
    }

    // =========================================================================
    // Review queue
    // =========================================================================

    pub fn insert_review_item(&self, item: ReviewItem) {
        self.review_items.write().insert(item.id, item);
    }

    pub fn review_item(&self, id: Uuid) -> PipelineResult<ReviewItem> {
        self.review_items
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("review_item", id.to_string()))
    }

    pub fn pending_review_items(&self) -> Vec<ReviewItem> {
        self.review_items
            .read()
            .values()
            .filter(|i| i.status == ReviewStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn update_review_item<F>(&self, id: Uuid, mutate: F) -> PipelineResult<ReviewItem>
    where
        F: FnOnce(&mut ReviewItem),
    {
        let mut table = self.review_items.write();
        let item = table
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("review_item", id.to_string()))?;
        mutate(item);
        Ok(item.clone())
    }

    // =========================================================================
    // Test fixtures
    // =========================================================================

    pub fn insert_test_scenario(&self, scenario: TestScenario) {
        self.test_scenarios.write().insert(scenario.id, scenario);
    }

    pub fn test_scenario(&self, id: Uuid) -> PipelineResult<TestScenario> {
        self.test_scenarios
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("test_scenario", id.to_string()))
    }

    pub fn list_test_scenarios(&self) -> Vec<TestScenario> {
        self.test_scenarios.read().values().cloned().collect()
    }

    pub fn update_test_scenario<F>(&self, id: Uuid, mutate: F) -> PipelineResult<TestScenario>
    where
        F: FnOnce(&mut TestScenario),
    {
        let mut table = self.test_scenarios.write();
        let scenario = table
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("test_scenario", id.to_string()))?;
        mutate(scenario);
        Ok(scenario.clone())
    }

    /// Insert a synthetic article. Refuses symbols outside the `T_`
    /// namespace.
    pub fn insert_test_article(&self, article: TestArticle) -> PipelineResult<()> {
        if !symbols::is_test_symbol(&article.symbol) {
            return Err(PipelineError::consistency(format!(
                "test article symbol '{}' lacks the {} prefix",
                article.symbol,
                symbols::TEST_PREFIX
            )));
        }
        self.test_articles.write().insert(article.id, article);
        Ok(())
    }

    pub fn unconsumed_test_articles(&self, scenario_id: Uuid) -> Vec<TestArticle> {
        self.test_articles
            .read()
            .values()
            .filter(|a| a.scenario_id == scenario_id && !a.consumed)
            .cloned()
            .collect()
    }

    pub fn list_test_articles(&self, scenario_id: Uuid) -> Vec<TestArticle> {
        self.test_articles
            .read()
            .values()
            .filter(|a| a.scenario_id == scenario_id)
            .cloned()
            .collect()
    }

    /// Reset consumption flags so a scenario rerun replays its articles.
    pub fn reset_consumed_articles(&self, scenario_id: Uuid) -> usize {
        let mut table = self.test_articles.write();
        let mut reset = 0;
        for article in table.values_mut() {
            if article.scenario_id == scenario_id && article.consumed {
                article.consumed = false;
                reset += 1;
            }
        }
        reset
    }

    pub fn mark_article_consumed(&self, id: Uuid) -> PipelineResult<()> {
        let mut table = self.test_articles.write();
        let article = table
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("test_article", id.to_string()))?;
        article.consumed = true;
        Ok(())
    }

    /// Insert a synthetic price point. Refuses symbols outside the `T_`
    /// namespace.
    pub fn insert_test_price(&self, price: TestPriceData) -> PipelineResult<()> {
        if !symbols::is_test_symbol(&price.symbol) {
            return Err(PipelineError::consistency(format!(
                "test price symbol '{}' lacks the {} prefix",
                price.symbol,
                symbols::TEST_PREFIX
            )));
        }
        self.test_prices.write().insert(price.id, price);
        Ok(())
    }

    /// Latest synthetic price for `symbol` at or before `at`. Non-`T_`
    /// symbols must never reach this table.
    pub fn test_price_at(&self, symbol: &str, at: DateTime<Utc>) -> PipelineResult<f64> {
        if !symbols::is_test_symbol(symbol) {
            return Err(PipelineError::consistency(format!(
                "production symbol '{symbol}' queried against the test price table"
            )));
        }
        self.test_prices
            .read()
            .values()
            .filter(|p| p.symbol == symbol && p.at <= at)
            .max_by_key(|p| p.at)
            .map(|p| p.price)
            .ok_or_else(|| {
                PipelineError::transient(format!("no test price for {symbol} at or before {at}"))
            })
    }

    pub fn insert_test_mirror(&self, mirror: TestTargetMirror) -> PipelineResult<()> {
        if !symbols::is_test_symbol(&mirror.test_symbol) {
            return Err(PipelineError::consistency(format!(
                "test mirror symbol '{}' lacks the {} prefix",
                mirror.test_symbol,
                symbols::TEST_PREFIX
            )));
        }
        self.test_mirrors.write().insert(mirror.id, mirror);
        Ok(())
    }

    pub fn list_test_mirrors(&self, scenario_id: Uuid) -> Vec<TestTargetMirror> {
        self.test_mirrors
            .read()
            .values()
            .filter(|m| m.scenario_id == scenario_id)
            .cloned()
            .collect()
    }

    // =========================================================================
    // Scenario cleanup
    // =========================================================================

    /// Remove every pipeline row created by one scenario run. Only synthetic
    /// rows carry a `scenario_run_id`, so production data is untouchable
    /// here by construction.
    pub fn purge_scenario_run(&self, run_id: Uuid) -> usize {
        let mut removed = 0;

        removed += purge_by(&self.signals, |s: &Signal| s.scenario_run_id == Some(run_id));
        removed += purge_by(&self.predictors, |p: &Predictor| {
            p.scenario_run_id == Some(run_id)
        });
        removed += purge_by(&self.predictions, |p: &Prediction| {
            p.scenario_run_id == Some(run_id)
        });
        removed += purge_by(&self.outcomes, |o: &Outcome| {
            o.scenario_run_id == Some(run_id)
        });
        removed += purge_by(&self.learnings, |l: &Learning| {
            l.scenario_run_id == Some(run_id)
        });
        removed += purge_by(&self.learning_queue, |i: &LearningQueueItem| {
            i.scenario_run_id == Some(run_id)
        });

        removed
    }

    /// Remove a scenario's fixture rows (articles, prices, mirrors) and the
    /// scenario itself.
    pub fn delete_scenario_fixtures(&self, scenario_id: Uuid) -> usize {
        let mut removed = 0;
        removed += purge_by(&self.test_articles, |a: &TestArticle| {
            a.scenario_id == scenario_id
        });
        removed += purge_by(&self.test_prices, |p: &TestPriceData| {
            p.scenario_id == scenario_id
        });
        removed += purge_by(&self.test_mirrors, |m: &TestTargetMirror| {
            m.scenario_id == scenario_id
        });
        if self.test_scenarios.write().remove(&scenario_id).is_some() {
            removed += 1;
        }
        removed
    }
}

fn purge_by<T, F>(table: &RwLock<HashMap<Uuid, T>>, predicate: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut guard = table.write();
    let before = guard.len();
    guard.retain(|_, v| !predicate(v));
    before - guard.len()
}
