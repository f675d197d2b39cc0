// =============================================================================
// Promotion — backtest gate between test learnings and production scoring
// =============================================================================
//
// A test learning only reaches production scoring through here. The backtest
// compares accuracy over outcomes produced with the learning active (test
// provenance, after the learning was created) against the baseline
// (production outcomes in the same scope), then checks four criteria:
//
//   min_sample_size              — enough adjusted outcomes to mean anything
//   min_accuracy_lift            — the learning must actually help
//   max_false_positive_increase  — and not by firing wildly
//   min_significance             — the lift must survive a two-proportion
//                                  z-test at the configured confidence level
//
// Failing criteria come back by name. A passing report plus a named reviewer
// produces the production learning, supersedes the test one, and records the
// promotion with the scenario runs that proved it.
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::learning;
use crate::model::{BacktestCriteria, BacktestReport, Learning, Outcome, PromotionRecord};
use crate::store::Store;
use crate::types::{Direction, Domain};

/// One-sided standard normal CDF, Abramowitz & Stegun 7.1.26. Good to ~1e-7,
/// far tighter than any criteria threshold here.
fn normal_cdf(z: f64) -> f64 {
    let x = z / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let erf = 1.0 - poly * (-x * x).exp();
    let erf = if x < 0.0 { -erf } else { erf };
    0.5 * (1.0 + erf)
}

/// Two-proportion z-test: confidence that `p2` (adjusted) beats `p1`
/// (baseline) beyond sampling noise. Returns 0 when either sample is empty.
fn lift_significance(hits1: usize, n1: usize, hits2: usize, n2: usize) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 0.0;
    }
    let p1 = hits1 as f64 / n1 as f64;
    let p2 = hits2 as f64 / n2 as f64;
    let pooled = (hits1 + hits2) as f64 / (n1 + n2) as f64;
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 as f64 + 1.0 / n2 as f64)).sqrt();
    if se == 0.0 {
        // Identical, saturated proportions carry no evidence either way.
        return if p2 > p1 { 1.0 } else { 0.0 };
    }
    normal_cdf((p2 - p1) / se)
}

/// A directional call that resolved against the predicted direction.
fn is_false_positive(outcome: &Outcome) -> bool {
    outcome.predicted_direction != Direction::Neutral
        && outcome.realized_direction == outcome.predicted_direction.inverse()
}

fn rates(outcomes: &[Outcome]) -> (usize, usize, f64, f64) {
    let n = outcomes.len();
    let hits = outcomes.iter().filter(|o| o.correct).count();
    let fps = outcomes.iter().filter(|o| is_false_positive(o)).count();
    if n == 0 {
        (0, 0, 0.0, 0.0)
    } else {
        (hits, fps, hits as f64 / n as f64, fps as f64 / n as f64)
    }
}

/// Outcomes covered by the learning's scope, split by provenance. Adjusted
/// outcomes additionally must postdate the learning, so only runs it could
/// have influenced count.
fn partition_outcomes(store: &Store, learning: &Learning) -> (Vec<Outcome>, Vec<Outcome>) {
    let domain_of = |universe_id: Uuid| -> Option<Domain> {
        store.universe(universe_id).ok().map(|u| u.domain)
    };

    let mut baseline = Vec::new();
    let mut adjusted = Vec::new();
    for outcome in store.list_outcomes() {
        let Some(domain) = domain_of(outcome.universe_id) else { continue };
        if !learning.scope.covers(domain, outcome.universe_id, outcome.target_id) {
            continue;
        }
        if outcome.is_test {
            if outcome.resolved_at >= learning.created_at {
                adjusted.push(outcome);
            }
        } else {
            baseline.push(outcome);
        }
    }
    (baseline, adjusted)
}

/// Backtest one test learning against the criteria. Pure read; promotion is
/// a separate, reviewer-gated step.
pub fn backtest(
    store: &Store,
    learning_id: Uuid,
    criteria: &BacktestCriteria,
) -> PipelineResult<BacktestReport> {
    let learning = store.learning(learning_id)?;
    if !learning.is_test {
        return Err(PipelineError::validation(
            "NOT_A_TEST_LEARNING",
            format!("learning {learning_id} already runs in production"),
        ));
    }

    let (baseline, adjusted) = partition_outcomes(store, &learning);
    let (base_hits, _base_fps, baseline_accuracy, baseline_fp_rate) = rates(&baseline);
    let (adj_hits, _adj_fps, adjusted_accuracy, adjusted_fp_rate) = rates(&adjusted);

    let accuracy_lift = adjusted_accuracy - baseline_accuracy;
    let false_positive_increase = adjusted_fp_rate - baseline_fp_rate;
    let significance = lift_significance(base_hits, baseline.len(), adj_hits, adjusted.len());

    let mut failing = Vec::new();
    if adjusted.len() < criteria.min_sample_size {
        failing.push("min_sample_size".to_string());
    }
    if accuracy_lift < criteria.min_accuracy_lift {
        failing.push("min_accuracy_lift".to_string());
    }
    if false_positive_increase > criteria.max_false_positive_increase {
        failing.push("max_false_positive_increase".to_string());
    }
    if significance < criteria.min_significance {
        failing.push("min_significance".to_string());
    }

    Ok(BacktestReport {
        sample_size: adjusted.len(),
        baseline_accuracy,
        adjusted_accuracy,
        accuracy_lift,
        baseline_false_positive_rate: baseline_fp_rate,
        adjusted_false_positive_rate: adjusted_fp_rate,
        false_positive_increase,
        significance,
        passed: failing.is_empty(),
        failing_criteria: failing,
    })
}

/// Promote a test learning to production. Requires a passing backtest and a
/// named reviewer; the test learning is superseded, never deleted.
pub fn promote(
    store: &Store,
    learning_id: Uuid,
    reviewer: &str,
    notes: Option<String>,
    criteria: &BacktestCriteria,
    now: DateTime<Utc>,
) -> PipelineResult<PromotionRecord> {
    if reviewer.trim().is_empty() {
        return Err(PipelineError::validation(
            "REVIEWER_REQUIRED",
            "promotion requires a named reviewer",
        ));
    }

    let learning = store.learning(learning_id)?;
    let report = backtest(store, learning_id, criteria)?;
    if !report.passed {
        return Err(PipelineError::validation(
            "PROMOTION_CRITERIA_NOT_MET",
            format!("backtest failed: {}", report.failing_criteria.join(", ")),
        ));
    }

    let (_, adjusted) = partition_outcomes(store, &learning);
    let mut scenario_run_ids: Vec<Uuid> =
        adjusted.iter().filter_map(|o| o.scenario_run_id).collect();
    scenario_run_ids.sort();
    scenario_run_ids.dedup();

    let production = learning::create_learning(
        store,
        learning.scope,
        learning.kind,
        learning.config.clone(),
        learning.source,
        false,
        None,
        learning.evaluation_id,
        now,
    );
    learning::supersede(store, learning.id, production.id)?;

    let record = PromotionRecord {
        id: Uuid::new_v4(),
        test_learning_id: learning.id,
        production_learning_id: production.id,
        report,
        reviewer: reviewer.to_string(),
        notes,
        scenario_run_ids,
        created_at: now,
    };
    store.insert_promotion(record.clone());
    info!(
        test_learning = %learning.id,
        production_learning = %production.id,
        reviewer,
        "learning promoted to production"
    );
    Ok(record)
}
