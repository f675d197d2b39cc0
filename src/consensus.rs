// =============================================================================
// Consensus Engine — threshold-gated aggregation of live predictors
// =============================================================================
//
// Triggered whenever a predictor is written for a target, and again by the
// periodic prediction batch. Always recomputes from the full live set, never
// from a delta, so predictor arrival order cannot change the result.
//
// Three gates must hold simultaneously:
//   min_predictors          — count of live predictors
//   min_combined_strength   — weighted sum of strengths
//   min_direction_consensus — fraction agreeing on the dominant direction
//
// An exact bullish/bearish tie declares no consensus; low-confidence flips
// are worse than silence. A refresh supersedes the prior prediction, it
// never deletes it.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::learning::{effective_config, EffectiveConfig};
use crate::model::{Prediction, Predictor, Target, Universe};
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::symbols;
use crate::types::Direction;

// =============================================================================
// Pure decision
// =============================================================================

/// Result of evaluating the threshold set over one live predictor set.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusDecision {
    pub met: bool,
    pub direction: Direction,
    pub combined_strength: f64,
    pub consensus_ratio: f64,
    pub contributing: Vec<Uuid>,
    /// Which gate blocked consensus, for the decision log.
    pub blocked_by: Option<&'static str>,
}

impl ConsensusDecision {
    fn blocked(reason: &'static str) -> Self {
        Self {
            met: false,
            direction: Direction::Neutral,
            combined_strength: 0.0,
            consensus_ratio: 0.0,
            contributing: Vec::new(),
            blocked_by: Some(reason),
        }
    }
}

/// Evaluate the three consensus gates over a live predictor set. Pure: no
/// store access, no clock.
pub fn evaluate(
    predictors: &[Predictor],
    config: &EffectiveConfig,
    roster_weight: impl Fn(&str) -> f64,
) -> ConsensusDecision {
    if predictors.len() < config.thresholds.min_predictors {
        return ConsensusDecision::blocked("min_predictors");
    }

    let combined_strength: f64 = predictors
        .iter()
        .map(|p| {
            p.strength
                * config.analyst_weight(&p.analyst_id, roster_weight(&p.analyst_id))
                * config.strength_multiplier
        })
        .sum();

    if combined_strength < config.thresholds.min_combined_strength {
        return ConsensusDecision::blocked("min_combined_strength");
    }

    let bullish = predictors.iter().filter(|p| p.direction == Direction::Bullish).count();
    let bearish = predictors.iter().filter(|p| p.direction == Direction::Bearish).count();

    // All-neutral sets have no dominant direction; exact ties are treated as
    // below threshold rather than flipping a coin.
    let dominant = if bullish > bearish {
        Direction::Bullish
    } else if bearish > bullish {
        Direction::Bearish
    } else {
        return ConsensusDecision::blocked("direction_tie");
    };

    let agreeing = bullish.max(bearish);
    let consensus_ratio = agreeing as f64 / predictors.len() as f64;

    if consensus_ratio < config.thresholds.min_direction_consensus {
        return ConsensusDecision::blocked("min_direction_consensus");
    }

    ConsensusDecision {
        met: true,
        direction: dominant,
        combined_strength,
        consensus_ratio,
        contributing: predictors.iter().map(|p| p.id).collect(),
        blocked_by: None,
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Re-evaluate consensus for one target and create/refresh its Prediction if
/// all gates hold. Returns the new prediction when one was emitted.
pub fn evaluate_target(
    store: &Store,
    config: &RuntimeConfig,
    universe: &Universe,
    target: &Target,
    now: DateTime<Utc>,
) -> PipelineResult<Option<Prediction>> {
    let is_test = symbols::is_test_symbol(&target.symbol);

    // Test learnings shape test scoring only; production scoring sees only
    // promoted (production) learnings.
    let learnings = store.active_learnings(is_test);
    let effective = effective_config(
        universe.thresholds,
        &learnings,
        universe.domain,
        universe.id,
        target.id,
    );

    if effective.avoid {
        debug!(target = %target.symbol, "consensus skipped: avoid learning in scope");
        return Ok(None);
    }

    let predictors = store.live_predictors(target.id, now);

    // Every live predictor must share the target's provenance.
    if let Some(crossed) = predictors.iter().find(|p| p.is_test != is_test) {
        warn!(
            target = %target.symbol,
            predictor_id = %crossed.id,
            "test/production provenance crossing detected; aborting consensus"
        );
        return Err(PipelineError::consistency(format!(
            "predictor {} provenance (is_test={}) does not match target '{}' (is_test={})",
            crossed.id, crossed.is_test, target.symbol, is_test
        )));
    }

    let roster = universe.analysts.clone();
    let roster_weight = |analyst_id: &str| {
        roster
            .iter()
            .find(|a| a.id == analyst_id)
            .map(|a| a.weight)
            .unwrap_or(1.0)
    };

    let decision = evaluate(&predictors, &effective, roster_weight);
    if !decision.met {
        debug!(
            target = %target.symbol,
            live = predictors.len(),
            blocked_by = decision.blocked_by.unwrap_or("none"),
            "consensus not reached"
        );
        return Ok(None);
    }

    let horizon = universe
        .resolution_horizon_hours
        .unwrap_or(config.resolution_horizon_hours);

    let prediction = Prediction {
        id: Uuid::new_v4(),
        universe_id: universe.id,
        target_id: target.id,
        direction: decision.direction,
        combined_strength: decision.combined_strength,
        consensus_ratio: decision.consensus_ratio,
        predictor_ids: decision.contributing,
        thresholds_met: true,
        price_at_creation: None,
        is_test,
        scenario_run_id: predictors.iter().find_map(|p| p.scenario_run_id),
        created_at: now,
        resolve_after: now + Duration::hours(horizon),
        superseded_by: None,
        resolved: false,
    };

    // Supersede, never delete: the prior prediction stays for evaluation.
    if let Some(prior) = store.current_prediction(target.id) {
        store.update_prediction(prior.id, |p| p.superseded_by = Some(prediction.id))?;
    }
    store.insert_prediction(prediction.clone());

    info!(
        target = %target.symbol,
        direction = %prediction.direction,
        combined_strength = prediction.combined_strength,
        consensus_ratio = prediction.consensus_ratio,
        is_test,
        "prediction emitted"
    );

    if let Some(notify) = &universe.notification {
        if prediction.combined_strength >= notify.min_strength {
            info!(
                channel = %notify.channel,
                target = %target.symbol,
                direction = %prediction.direction,
                "notification dispatched"
            );
        }
    }

    Ok(Some(prediction))
}

/// Periodic batch: re-evaluate every non-archived target of every active
/// universe. Per-target errors are logged and skipped.
pub fn run_prediction_batch(store: &Store, config: &RuntimeConfig, now: DateTime<Utc>) -> usize {
    let mut emitted = 0;
    for universe in store.active_universes() {
        for target in store.list_targets(universe.id) {
            if target.archived {
                continue;
            }
            match evaluate_target(store, config, &universe, &target, now) {
                Ok(Some(_)) => emitted += 1,
                Ok(None) => {}
                Err(e) => warn!(target = %target.symbol, error = %e, "consensus evaluation failed"),
            }
        }
    }
    emitted
}

/// Archive (never delete) predictors whose TTL has elapsed. Lazy filtering
/// at read time is authoritative; this sweep only stamps `archived_at` so
/// audit queries can separate live history from dead rows.
pub fn run_expiration_sweep(store: &Store, now: DateTime<Utc>) -> usize {
    let expired = store.expired_unarchived_predictors(now);
    let mut archived = 0;
    for predictor in expired {
        if store
            .update_predictor(predictor.id, |p| p.archived_at = Some(now))
            .is_ok()
        {
            archived += 1;
        }
    }
    if archived > 0 {
        debug!(archived, "expired predictors archived");
    }
    archived
}
