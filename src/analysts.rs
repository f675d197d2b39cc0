// =============================================================================
// Analyst Ensemble — fan-out of signals to tiered analysts
// =============================================================================
//
// For every signal that still lacks an assessment from an enabled analyst,
// dispatches that (signal, analyst) pair to the backend. Dispatches for one
// signal run concurrently and independently: a failed analyst logs, produces
// no predictor, and is retried on the next scheduled pass because the
// (signal, analyst) pair still has no predictor row.
//
// Tier selection: a target-level override beats the analyst's configured
// tier. Gray-zone confidence holds the predictor for human review instead of
// feeding consensus.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::consensus;
use crate::llm::{AnalystBackend, AssessRequest};
use crate::model::{Predictor, ReviewDisposition, Signal, Target, Universe};
use crate::review_queue;
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::types::LlmTier;

/// Counters for one ensemble pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsembleReport {
    pub dispatched: usize,
    pub created: usize,
    pub held: usize,
    pub failed: usize,
    pub predictions_emitted: usize,
}

/// Resolve which tier a dispatch uses.
fn resolve_tier(target: &Target, analyst_tier: LlmTier) -> LlmTier {
    target.tier_override.unwrap_or(analyst_tier)
}

/// Run one ensemble pass over all active universes, then re-evaluate
/// consensus for every target that received new predictors.
pub async fn run_signal_batch(
    store: &Store,
    config: &RuntimeConfig,
    backend: &Arc<dyn AnalystBackend>,
    now: DateTime<Utc>,
) -> EnsembleReport {
    let mut report = EnsembleReport::default();
    let mut touched_targets: HashSet<Uuid> = HashSet::new();

    // Signals older than the TTL would only yield already-expired predictors.
    let cutoff = now - Duration::hours(config.predictor_ttl_hours);

    for universe in store.active_universes() {
        for target in store.list_targets(universe.id) {
            if target.archived {
                continue;
            }
            for signal in store.signals_for_target(target.id) {
                if signal.created_at < cutoff {
                    continue;
                }
                let created = assess_signal(
                    store, config, backend, &universe, &target, &signal, now, &mut report,
                )
                .await;
                if created {
                    touched_targets.insert(target.id);
                }
            }
        }
    }

    // Consensus is recomputed from the full live set per target, so arrival
    // order within the batch is irrelevant.
    for target_id in touched_targets {
        let Ok(target) = store.target(target_id) else { continue };
        let Ok(universe) = store.universe(target.universe_id) else { continue };
        match consensus::evaluate_target(store, config, &universe, &target, now) {
            Ok(Some(_)) => report.predictions_emitted += 1,
            Ok(None) => {}
            Err(e) => warn!(target = %target.symbol, error = %e, "consensus after ensemble failed"),
        }
    }

    report
}

/// Dispatch one signal to every enabled analyst that has not yet assessed
/// it. Returns whether any predictor was created.
#[allow(clippy::too_many_arguments)]
async fn assess_signal(
    store: &Store,
    config: &RuntimeConfig,
    backend: &Arc<dyn AnalystBackend>,
    universe: &Universe,
    target: &Target,
    signal: &Signal,
    now: DateTime<Utc>,
    report: &mut EnsembleReport,
) -> bool {
    let pending: Vec<_> = universe
        .analysts
        .iter()
        .filter(|a| a.enabled && !store.predictor_exists(signal.id, &a.id))
        .collect();

    if pending.is_empty() {
        return false;
    }

    let futures = pending.iter().map(|analyst| {
        let tier = resolve_tier(target, analyst.tier);
        let request = AssessRequest {
            analyst_id: analyst.id.clone(),
            analyst_name: analyst.name.clone(),
            symbol: target.symbol.clone(),
            title: signal.title.clone(),
            body: signal.body.clone(),
            direction_hint: signal.direction_hint,
            strength_hint: signal.strength_hint,
            tier,
            tier_config: universe.tiers.get(&tier).cloned(),
        };
        async move { (analyst.id.clone(), tier, backend.assess(&request).await) }
    });

    let mut any_created = false;
    for (analyst_id, tier, result) in join_all(futures).await {
        report.dispatched += 1;
        match result {
            Ok(assessment) => {
                let assessment = assessment.clamped();
                let disposition = review_queue::disposition_for(config, assessment.confidence);
                let predictor = Predictor {
                    id: Uuid::new_v4(),
                    universe_id: universe.id,
                    target_id: target.id,
                    signal_id: signal.id,
                    analyst_id: analyst_id.clone(),
                    direction: assessment.direction,
                    strength: assessment.strength,
                    confidence: assessment.confidence,
                    tier,
                    disposition,
                    // Provenance flows from the signal.
                    is_test: signal.is_test,
                    scenario_run_id: signal.scenario_run_id,
                    created_at: now,
                    expires_at: now + Duration::hours(config.predictor_ttl_hours),
                    archived_at: None,
                };
                store.insert_predictor(predictor.clone());
                report.created += 1;
                any_created = true;

                if disposition == ReviewDisposition::Held {
                    review_queue::enqueue(store, &predictor, now);
                    report.held += 1;
                }

                debug!(
                    analyst = %analyst_id,
                    target = %target.symbol,
                    direction = %assessment.direction,
                    strength = assessment.strength,
                    confidence = assessment.confidence,
                    "predictor created"
                );
            }
            Err(e) => {
                // One analyst failing never blocks its siblings; the pair is
                // retried next pass.
                report.failed += 1;
                warn!(
                    analyst = %analyst_id,
                    target = %target.symbol,
                    signal_id = %signal.id,
                    error = %e,
                    "analyst dispatch failed"
                );
            }
        }
    }
    any_created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, PipelineResult};
    use crate::llm::{Assessment, DemoBackend};
    use crate::model::{AnalystSpec, ConsensusThresholds};
    use crate::types::{Direction, Domain};
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn build_world(store: &Store, analysts: Vec<AnalystSpec>) -> (Universe, Target, Signal) {
        let universe = Universe {
            id: Uuid::new_v4(),
            org_id: "org".into(),
            agent_id: "agent".into(),
            name: "equities".into(),
            domain: Domain::Equities,
            tiers: HashMap::new(),
            thresholds: ConsensusThresholds::default(),
            analysts,
            resolution_horizon_hours: None,
            notification: None,
            active: true,
            created_at: Utc::now(),
        };
        let target = Target {
            id: Uuid::new_v4(),
            universe_id: universe.id,
            symbol: "AAPL".into(),
            kind: "equity".into(),
            tier_override: None,
            archived: false,
            created_at: Utc::now(),
        };
        let signal = Signal {
            id: Uuid::new_v4(),
            universe_id: universe.id,
            target_id: target.id,
            source_id: Uuid::new_v4(),
            title: "Earnings beat".into(),
            body: "Strong quarter.".into(),
            direction_hint: Some(Direction::Bullish),
            strength_hint: Some(7.0),
            fingerprint: "fp".into(),
            is_test: false,
            scenario_run_id: None,
            created_at: Utc::now(),
        };
        store.insert_universe(universe.clone());
        store.insert_target(target.clone());
        store.insert_signal(signal.clone());
        (universe, target, signal)
    }

    fn roster(ids: &[&str]) -> Vec<AnalystSpec> {
        ids.iter()
            .map(|id| AnalystSpec {
                id: id.to_string(),
                name: id.to_string(),
                tier: LlmTier::Silver,
                weight: 1.0,
                enabled: true,
            })
            .collect()
    }

    /// Backend returning a fixed assessment, failing for named analysts.
    struct ScriptedBackend {
        assessment: Assessment,
        fail_for: Vec<String>,
    }

    #[async_trait]
    impl AnalystBackend for ScriptedBackend {
        async fn assess(&self, request: &AssessRequest) -> PipelineResult<Assessment> {
            if self.fail_for.contains(&request.analyst_id) {
                return Err(PipelineError::transient("provider 503"));
            }
            Ok(self.assessment.clone())
        }
    }

    #[tokio::test]
    async fn batch_creates_one_predictor_per_enabled_analyst() {
        let store = Store::new();
        let config = RuntimeConfig::default();
        let mut analysts = roster(&["macro", "sentiment", "quant"]);
        analysts[2].enabled = false;
        build_world(&store, analysts);

        let backend: Arc<dyn AnalystBackend> = Arc::new(DemoBackend);
        let report = run_signal_batch(&store, &config, &backend, Utc::now()).await;
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.created, 2);
    }

    #[tokio::test]
    async fn second_pass_is_idempotent() {
        let store = Store::new();
        let config = RuntimeConfig::default();
        build_world(&store, roster(&["macro", "sentiment"]));

        let backend: Arc<dyn AnalystBackend> = Arc::new(DemoBackend);
        let now = Utc::now();
        let first = run_signal_batch(&store, &config, &backend, now).await;
        assert_eq!(first.created, 2);

        let second = run_signal_batch(&store, &config, &backend, now).await;
        assert_eq!(second.dispatched, 0);
        assert_eq!(second.created, 0);
    }

    #[tokio::test]
    async fn one_failing_analyst_does_not_block_siblings() {
        let store = Store::new();
        let config = RuntimeConfig::default();
        let (_, target, signal) = build_world(&store, roster(&["macro", "sentiment", "quant"]));

        let backend: Arc<dyn AnalystBackend> = Arc::new(ScriptedBackend {
            assessment: Assessment {
                direction: Direction::Bullish,
                strength: 7.0,
                confidence: 0.9,
            },
            fail_for: vec!["sentiment".into()],
        });

        let now = Utc::now();
        let report = run_signal_batch(&store, &config, &backend, now).await;
        assert_eq!(report.created, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(store.live_predictors(target.id, now).len(), 2);

        // Next pass retries only the failed pair.
        let healthy: Arc<dyn AnalystBackend> = Arc::new(ScriptedBackend {
            assessment: Assessment {
                direction: Direction::Bullish,
                strength: 7.0,
                confidence: 0.9,
            },
            fail_for: vec![],
        });
        let retry = run_signal_batch(&store, &config, &healthy, now).await;
        assert_eq!(retry.dispatched, 1);
        assert_eq!(retry.created, 1);
        assert_eq!(store.predictors_for_signal(signal.id).len(), 3);
    }

    #[tokio::test]
    async fn gray_zone_confidence_routes_to_review() {
        let store = Store::new();
        let config = RuntimeConfig::default();
        let (_, target, _) = build_world(&store, roster(&["macro"]));

        let backend: Arc<dyn AnalystBackend> = Arc::new(ScriptedBackend {
            assessment: Assessment {
                direction: Direction::Bullish,
                strength: 7.0,
                confidence: 0.55,
            },
            fail_for: vec![],
        });

        let now = Utc::now();
        let report = run_signal_batch(&store, &config, &backend, now).await;
        assert_eq!(report.created, 1);
        assert_eq!(report.held, 1);

        // Held predictor is excluded from consensus input.
        assert!(store.live_predictors(target.id, now).is_empty());
        assert_eq!(store.pending_review_items().len(), 1);
    }

    #[tokio::test]
    async fn full_ensemble_reaches_consensus() {
        let store = Store::new();
        let config = RuntimeConfig::default();
        let (_, target, _) = build_world(&store, roster(&["macro", "sentiment", "quant"]));

        let backend: Arc<dyn AnalystBackend> = Arc::new(ScriptedBackend {
            assessment: Assessment {
                direction: Direction::Bullish,
                strength: 7.0,
                confidence: 0.9,
            },
            fail_for: vec![],
        });

        let report = run_signal_batch(&store, &config, &backend, Utc::now()).await;
        assert_eq!(report.created, 3);
        assert_eq!(report.predictions_emitted, 1);

        let prediction = store.current_prediction(target.id).unwrap();
        assert_eq!(prediction.direction, Direction::Bullish);
        assert!((prediction.combined_strength - 21.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn predictor_inherits_signal_provenance() {
        let store = Store::new();
        let config = RuntimeConfig::default();
        let (universe, _, _) = build_world(&store, roster(&["macro"]));

        // Add a test-path target + signal in the same universe.
        let run_id = Uuid::new_v4();
        let test_target = Target {
            id: Uuid::new_v4(),
            universe_id: universe.id,
            symbol: "T_AAPL".into(),
            kind: "equity".into(),
            tier_override: None,
            archived: false,
            created_at: Utc::now(),
        };
        let test_signal = Signal {
            id: Uuid::new_v4(),
            universe_id: universe.id,
            target_id: test_target.id,
            source_id: Uuid::new_v4(),
            title: "synthetic".into(),
            body: "synthetic body".into(),
            direction_hint: Some(Direction::Bearish),
            strength_hint: Some(6.0),
            fingerprint: "fp2".into(),
            is_test: true,
            scenario_run_id: Some(run_id),
            created_at: Utc::now(),
        };
        store.insert_target(test_target.clone());
        store.insert_signal(test_signal.clone());

        let backend: Arc<dyn AnalystBackend> = Arc::new(DemoBackend);
        run_signal_batch(&store, &config, &backend, Utc::now()).await;

        for p in store.predictors_for_signal(test_signal.id) {
            assert!(p.is_test);
            assert_eq!(p.scenario_run_id, Some(run_id));
        }
    }
}
