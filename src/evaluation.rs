// =============================================================================
// Evaluation Runner — scoped accuracy windows and missed opportunities
// =============================================================================
//
// Two scheduled passes feed the learning loop:
//
//   run_evaluation          — aggregates resolved Outcomes into accuracy
//                             windows at every scope level (runner, domain,
//                             universe, target), separately per provenance,
//                             and queues a learning suggestion when a scope
//                             underperforms.
//   run_missed_opportunity_scan — finds signals that never produced a
//                             qualifying prediction, checks what the market
//                             actually did, and queues a threshold-loosening
//                             suggestion when the signal was right.
//
// Both passes only ever *suggest*; nothing becomes an active Learning without
// a human decision on the queue.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::learning;
use crate::model::{Evaluation, LearningConfig, LearningKind, Outcome, Scope};
use crate::outcome::PriceRouter;
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::symbols;
use crate::types::{Direction, Domain};

/// A scope whose windowed accuracy drops below this (with enough samples)
/// gets a dampening suggestion queued.
const UNDERPERFORMANCE_ACCURACY: f64 = 0.45;
const UNDERPERFORMANCE_MIN_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    pub evaluations: usize,
    pub suggestions: usize,
}

fn aggregate(
    scope: Scope,
    outcomes: &[&Outcome],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    is_test: bool,
    now: DateTime<Utc>,
) -> Evaluation {
    let sample_count = outcomes.len();
    let hit_count = outcomes.iter().filter(|o| o.correct).count();
    let avg_magnitude_pct = if sample_count == 0 {
        0.0
    } else {
        outcomes.iter().map(|o| o.magnitude_pct.abs()).sum::<f64>() / sample_count as f64
    };
    Evaluation {
        id: Uuid::new_v4(),
        scope,
        window_start,
        window_end,
        sample_count,
        hit_count,
        accuracy: if sample_count == 0 {
            0.0
        } else {
            hit_count as f64 / sample_count as f64
        },
        avg_magnitude_pct,
        is_test,
        created_at: now,
    }
}

/// Whether an equivalent suggestion is already sitting in the queue. Keeps
/// repeated evaluation passes from piling up duplicates.
fn already_suggested(store: &Store, scope: Scope, kind: LearningKind) -> bool {
    store
        .pending_queue_items()
        .iter()
        .any(|i| i.suggested_scope == scope && i.suggested_kind == kind)
}

/// One evaluation pass over both provenances. Emits one Evaluation row per
/// non-empty scope and queues suggestions for underperforming universes and
/// targets.
pub fn run_evaluation(store: &Store, config: &RuntimeConfig, now: DateTime<Utc>) -> EvaluationReport {
    let window_start = now - Duration::days(config.evaluation_window_days);
    let mut report = EvaluationReport::default();

    // Universe -> domain lookup, resolved once per pass.
    let domains: HashMap<Uuid, Domain> = store
        .list_universes()
        .into_iter()
        .map(|u| (u.id, u.domain))
        .collect();

    for is_test in [false, true] {
        let outcomes = store.outcomes_in_window(window_start, now, is_test);
        if outcomes.is_empty() {
            continue;
        }

        let mut by_scope: HashMap<Scope, Vec<&Outcome>> = HashMap::new();
        for outcome in &outcomes {
            by_scope.entry(Scope::Runner).or_default().push(outcome);
            if let Some(domain) = domains.get(&outcome.universe_id) {
                by_scope.entry(Scope::Domain(*domain)).or_default().push(outcome);
            }
            by_scope
                .entry(Scope::Universe(outcome.universe_id))
                .or_default()
                .push(outcome);
            by_scope
                .entry(Scope::Target(outcome.target_id))
                .or_default()
                .push(outcome);
        }

        for (scope, scoped) in by_scope {
            let evaluation = aggregate(scope, &scoped, window_start, now, is_test, now);
            debug!(
                scope = ?scope,
                samples = evaluation.sample_count,
                accuracy = evaluation.accuracy,
                is_test,
                "evaluation window"
            );

            let underperforming = evaluation.sample_count >= UNDERPERFORMANCE_MIN_SAMPLES
                && evaluation.accuracy < UNDERPERFORMANCE_ACCURACY
                && matches!(scope, Scope::Universe(_) | Scope::Target(_));

            if underperforming && !already_suggested(store, scope, LearningKind::Threshold) {
                let scenario_run_id = if is_test {
                    scoped.iter().find_map(|o| o.scenario_run_id)
                } else {
                    None
                };
                learning::suggest(
                    store,
                    scope,
                    LearningKind::Threshold,
                    LearningConfig {
                        strength_multiplier: Some(0.8),
                        ..Default::default()
                    },
                    format!(
                        "accuracy {:.2} over {} outcomes in the last {} days; dampen strengths in this scope",
                        evaluation.accuracy, evaluation.sample_count, config.evaluation_window_days
                    ),
                    1.0 - evaluation.accuracy,
                    is_test,
                    scenario_run_id,
                    now,
                );
                report.suggestions += 1;
            }

            store.insert_evaluation(evaluation);
            report.evaluations += 1;
        }
    }

    if report.evaluations > 0 {
        info!(
            evaluations = report.evaluations,
            suggestions = report.suggestions,
            "evaluation pass done"
        );
    }
    report
}

// =============================================================================
// Missed opportunities
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MissedOpportunityReport {
    pub scanned: usize,
    pub missed: usize,
    pub suggestions: usize,
}

/// Whether any prediction for the target was created inside the signal's
/// resolution window. Superseded predictions count; the signal did produce
/// an actionable forecast at the time.
fn had_qualifying_prediction(
    store: &Store,
    target_id: Uuid,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> bool {
    store
        .predictions_for_target(target_id)
        .iter()
        .any(|p| p.thresholds_met && p.created_at >= from && p.created_at <= until)
}

/// Scan directional signals whose horizon has elapsed without a qualifying
/// prediction, and check what the price actually did. A move past
/// `missed_min_move_pct` in the hinted direction is a missed opportunity and
/// queues a threshold-loosening suggestion for the target.
pub async fn run_missed_opportunity_scan(
    store: &Store,
    config: &RuntimeConfig,
    router: &PriceRouter,
    now: DateTime<Utc>,
) -> MissedOpportunityReport {
    let mut report = MissedOpportunityReport::default();
    let horizon = Duration::hours(config.resolution_horizon_hours);
    let oldest = now - Duration::days(config.evaluation_window_days);

    // Signal ids already turned into queue items, so reruns stay quiet.
    let seen: Vec<String> = store
        .list_queue_items()
        .into_iter()
        .map(|i| i.reasoning)
        .collect();

    for signal in store.list_signals() {
        let Some(hint) = signal.direction_hint else { continue };
        if hint == Direction::Neutral {
            continue;
        }
        if signal.created_at < oldest || signal.created_at + horizon > now {
            continue;
        }
        report.scanned += 1;

        if had_qualifying_prediction(store, signal.target_id, signal.created_at, signal.created_at + horizon)
        {
            continue;
        }

        let Ok(target) = store.target(signal.target_id) else { continue };
        if signal.is_test != symbols::is_test_symbol(&target.symbol) {
            warn!(signal_id = %signal.id, symbol = %target.symbol, "signal provenance disagrees with symbol namespace, skipping");
            continue;
        }

        let marker = format!("signal {}", signal.id);
        if seen.iter().any(|r| r.contains(&marker)) {
            continue;
        }

        let (start, end) = match (
            router.price_at(&target.symbol, signal.created_at).await,
            router.price_at(&target.symbol, signal.created_at + horizon).await,
        ) {
            (Ok(s), Ok(e)) if s > 0.0 => (s, e),
            _ => continue,
        };

        let move_pct = (end - start) / start * 100.0;
        let realized = if move_pct >= config.missed_min_move_pct {
            Direction::Bullish
        } else if move_pct <= -config.missed_min_move_pct {
            Direction::Bearish
        } else {
            Direction::Neutral
        };
        if realized != hint {
            continue;
        }

        report.missed += 1;
        // Bigger realized moves make a stronger case for loosening the gate.
        let suggestion_confidence =
            (0.5 + (move_pct.abs() / config.missed_min_move_pct - 1.0) * 0.1).clamp(0.5, 0.9);
        learning::suggest(
            store,
            Scope::Target(signal.target_id),
            LearningKind::Threshold,
            LearningConfig {
                min_combined_strength: Some(
                    crate::model::ConsensusThresholds::default().min_combined_strength * 0.8,
                ),
                ..Default::default()
            },
            format!(
                "missed opportunity on {}: {} ({}) moved {:.2}% as hinted but no prediction qualified",
                target.symbol, marker, hint, move_pct
            ),
            suggestion_confidence,
            signal.is_test,
            signal.scenario_run_id,
            now,
        );
        report.suggestions += 1;
        info!(
            signal_id = %signal.id,
            symbol = %target.symbol,
            move_pct,
            "missed opportunity recorded"
        );
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineResult;
    use crate::model::{Prediction, Signal, Target, TestPriceData};
    use crate::outcome::PriceFeed;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn outcome(
        universe_id: Uuid,
        target_id: Uuid,
        correct: bool,
        is_test: bool,
        resolved_at: DateTime<Utc>,
    ) -> Outcome {
        Outcome {
            id: Uuid::new_v4(),
            prediction_id: Uuid::new_v4(),
            universe_id,
            target_id,
            predicted_direction: Direction::Bullish,
            realized_direction: if correct { Direction::Bullish } else { Direction::Bearish },
            magnitude_pct: 2.0,
            correct,
            is_test,
            scenario_run_id: if is_test { Some(Uuid::new_v4()) } else { None },
            resolved_at,
        }
    }

    #[test]
    fn evaluation_aggregates_per_scope_and_provenance() {
        let store = Store::new();
        let config = RuntimeConfig::default();
        let now = Utc::now();
        let universe = Uuid::new_v4();
        let target = Uuid::new_v4();

        for correct in [true, true, false] {
            store.insert_outcome(outcome(universe, target, correct, false, now - Duration::hours(1)));
        }
        // Test-side outcome must not blend into production windows.
        store.insert_outcome(outcome(universe, target, false, true, now - Duration::hours(1)));

        let report = run_evaluation(&store, &config, now);
        // Production: runner + universe + target; test side the same trio.
        // (No Universe row exists in the store, so no domain scope.)
        assert_eq!(report.evaluations, 6);

        let evals = store.list_evaluations();
        let prod_runner = evals
            .iter()
            .find(|e| e.scope == Scope::Runner && !e.is_test)
            .unwrap();
        assert_eq!(prod_runner.sample_count, 3);
        assert_eq!(prod_runner.hit_count, 2);
        assert!((prod_runner.accuracy - 2.0 / 3.0).abs() < 1e-9);

        let test_runner = evals
            .iter()
            .find(|e| e.scope == Scope::Runner && e.is_test)
            .unwrap();
        assert_eq!(test_runner.sample_count, 1);
    }

    #[test]
    fn underperforming_target_gets_one_suggestion() {
        let store = Store::new();
        let config = RuntimeConfig::default();
        let now = Utc::now();
        let universe = Uuid::new_v4();
        let target = Uuid::new_v4();

        for i in 0..12 {
            store.insert_outcome(outcome(
                universe,
                target,
                i < 3, // 25% accuracy
                false,
                now - Duration::hours(1),
            ));
        }

        let report = run_evaluation(&store, &config, now);
        assert!(report.suggestions >= 1);
        let pending = store.pending_queue_items();
        assert!(pending
            .iter()
            .any(|i| i.suggested_scope == Scope::Target(target)));

        // Rerun: existing pending suggestion suppresses duplicates.
        let again = run_evaluation(&store, &config, now);
        assert_eq!(again.suggestions, 0);
    }

    struct NoMarket;

    #[async_trait]
    impl PriceFeed for NoMarket {
        async fn price_at(&self, _symbol: &str, _at: DateTime<Utc>) -> PipelineResult<f64> {
            Err(crate::error::PipelineError::transient("no market in tests"))
        }
    }

    fn seed_target(store: &Store, symbol: &str) -> Target {
        let t = Target {
            id: Uuid::new_v4(),
            universe_id: Uuid::new_v4(),
            symbol: symbol.into(),
            kind: "equity".into(),
            tier_override: None,
            archived: false,
            created_at: Utc::now(),
        };
        store.insert_target(t.clone());
        t
    }

    fn seed_signal(store: &Store, target: &Target, hint: Direction, created_at: DateTime<Utc>) -> Signal {
        let s = Signal {
            id: Uuid::new_v4(),
            universe_id: target.universe_id,
            target_id: target.id,
            source_id: Uuid::new_v4(),
            title: "t".into(),
            body: "b".into(),
            direction_hint: Some(hint),
            strength_hint: Some(7.0),
            fingerprint: Uuid::new_v4().to_string(),
            is_test: true,
            scenario_run_id: Some(Uuid::new_v4()),
            created_at,
        };
        store.insert_signal(s.clone());
        s
    }

    fn seed_prices(store: &Store, symbol: &str, t0: DateTime<Utc>, prices: &[(i64, f64)]) {
        let scenario = Uuid::new_v4();
        for (hours, price) in prices {
            store
                .insert_test_price(TestPriceData {
                    id: Uuid::new_v4(),
                    scenario_id: scenario,
                    symbol: symbol.into(),
                    at: t0 + Duration::hours(*hours),
                    price: *price,
                })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn missed_move_in_hinted_direction_is_suggested_once() {
        let store = Arc::new(Store::new());
        let config = RuntimeConfig::default();
        let now = Utc::now();
        let t0 = now - Duration::hours(48);

        let target = seed_target(&store, "T_AAPL");
        let signal = seed_signal(&store, &target, Direction::Bullish, t0);
        // +5% over the horizon, well past missed_min_move_pct.
        seed_prices(&store, "T_AAPL", t0, &[(0, 100.0), (24, 105.0)]);

        let router = PriceRouter::new(store.clone(), Arc::new(NoMarket));
        let report = run_missed_opportunity_scan(&store, &config, &router, now).await;
        assert_eq!(report.missed, 1);

        let pending = store.pending_queue_items();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].reasoning.contains(&format!("signal {}", signal.id)));
        assert!(pending[0].is_test);

        // Rerun stays quiet.
        let again = run_missed_opportunity_scan(&store, &config, &router, now).await;
        assert_eq!(again.suggestions, 0);
    }

    #[tokio::test]
    async fn qualifying_prediction_suppresses_missed_opportunity() {
        let store = Arc::new(Store::new());
        let config = RuntimeConfig::default();
        let now = Utc::now();
        let t0 = now - Duration::hours(48);

        let target = seed_target(&store, "T_AAPL");
        seed_signal(&store, &target, Direction::Bullish, t0);
        seed_prices(&store, "T_AAPL", t0, &[(0, 100.0), (24, 105.0)]);

        store.insert_prediction(Prediction {
            id: Uuid::new_v4(),
            universe_id: target.universe_id,
            target_id: target.id,
            direction: Direction::Bullish,
            combined_strength: 18.0,
            consensus_ratio: 1.0,
            predictor_ids: vec![],
            thresholds_met: true,
            price_at_creation: None,
            is_test: true,
            scenario_run_id: None,
            created_at: t0 + Duration::hours(1),
            resolve_after: t0 + Duration::hours(25),
            superseded_by: None,
            resolved: false,
        });

        let router = PriceRouter::new(store.clone(), Arc::new(NoMarket));
        let report = run_missed_opportunity_scan(&store, &config, &router, now).await;
        assert_eq!(report.missed, 0);
        assert!(store.pending_queue_items().is_empty());
    }

    #[tokio::test]
    async fn flat_move_or_wrong_direction_is_not_missed() {
        let store = Arc::new(Store::new());
        let config = RuntimeConfig::default();
        let now = Utc::now();
        let t0 = now - Duration::hours(48);

        // Hinted bullish, moved down.
        let down = seed_target(&store, "T_DOWN");
        seed_signal(&store, &down, Direction::Bullish, t0);
        seed_prices(&store, "T_DOWN", t0, &[(0, 100.0), (24, 94.0)]);

        // Hinted bullish, barely moved.
        let flat = seed_target(&store, "T_FLAT");
        seed_signal(&store, &flat, Direction::Bullish, t0);
        seed_prices(&store, "T_FLAT", t0, &[(0, 100.0), (24, 100.5)]);

        let router = PriceRouter::new(store.clone(), Arc::new(NoMarket));
        let report = run_missed_opportunity_scan(&store, &config, &router, now).await;
        assert_eq!(report.scanned, 2);
        assert_eq!(report.missed, 0);
    }
}
