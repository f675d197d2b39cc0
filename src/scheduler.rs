// =============================================================================
// Scheduler — interval loops for the pipeline workers
// =============================================================================
//
// Seven workers, each on its own clock, each owned by one spawned task.
// Intervals come from the runtime config and are re-read every tick, so a
// config update takes effect on the next cycle without a restart.
//
// A manual trigger (`runner-triggers.run` or the REST trigger endpoint) runs
// the exact same body as the scheduled tick and returns its counters.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use crate::app_state::AppState;
use crate::runtime_config::WorkerIntervals;
use crate::{analysts, consensus, evaluation, outcome};

/// The scheduled workers. Names double as the manual-trigger identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    SourceCrawl,
    SignalBatch,
    PredictionBatch,
    OutcomeTracking,
    Evaluation,
    MissedOpportunity,
    ExpirationSweep,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 7] = [
        Self::SourceCrawl,
        Self::SignalBatch,
        Self::PredictionBatch,
        Self::OutcomeTracking,
        Self::Evaluation,
        Self::MissedOpportunity,
        Self::ExpirationSweep,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::SourceCrawl => "source_crawl",
            Self::SignalBatch => "signal_batch",
            Self::PredictionBatch => "prediction_batch",
            Self::OutcomeTracking => "outcome_tracking",
            Self::Evaluation => "evaluation",
            Self::MissedOpportunity => "missed_opportunity",
            Self::ExpirationSweep => "expiration_sweep",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    fn interval_secs(&self, intervals: &WorkerIntervals) -> u64 {
        match self {
            Self::SourceCrawl => intervals.source_crawl_secs,
            Self::SignalBatch => intervals.signal_batch_secs,
            Self::PredictionBatch => intervals.prediction_batch_secs,
            Self::OutcomeTracking => intervals.outcome_tracking_secs,
            Self::Evaluation => intervals.evaluation_secs,
            Self::MissedOpportunity => intervals.missed_opportunity_secs,
            Self::ExpirationSweep => intervals.expiration_sweep_secs,
        }
    }
}

/// Run one worker pass. This is the single body shared by the scheduled
/// loop and the manual trigger; the returned counters are the trigger's
/// response payload.
pub async fn run_worker(state: &Arc<AppState>, kind: WorkerKind) -> Value {
    let config = state.runtime_config.read().clone();
    let now = Utc::now();
    let store = &state.store;

    let report = match kind {
        WorkerKind::SourceCrawl => {
            let r = state.crawler.run_crawl_pass(store, &config, now).await;
            json!({
                "sources_crawled": r.sources_crawled,
                "sources_failed": r.sources_failed,
                "signals_created": r.signals_created,
            })
        }
        WorkerKind::SignalBatch => {
            let backend = state.analyst_backend();
            let r = analysts::run_signal_batch(store, &config, &backend, now).await;
            json!({
                "dispatched": r.dispatched,
                "created": r.created,
                "held": r.held,
                "failed": r.failed,
                "predictions_emitted": r.predictions_emitted,
            })
        }
        WorkerKind::PredictionBatch => {
            let emitted = consensus::run_prediction_batch(store, &config, now);
            json!({ "predictions_emitted": emitted })
        }
        WorkerKind::OutcomeTracking => {
            let r = outcome::run_outcome_tracking(store, &config, &state.price_router, now).await;
            json!({ "resolved": r.resolved, "failed": r.failed })
        }
        WorkerKind::Evaluation => {
            let r = evaluation::run_evaluation(store, &config, now);
            json!({ "evaluations": r.evaluations, "suggestions": r.suggestions })
        }
        WorkerKind::MissedOpportunity => {
            let r = evaluation::run_missed_opportunity_scan(store, &config, &state.price_router, now)
                .await;
            json!({ "scanned": r.scanned, "missed": r.missed, "suggestions": r.suggestions })
        }
        WorkerKind::ExpirationSweep => {
            let archived = consensus::run_expiration_sweep(store, now);
            json!({ "archived": archived })
        }
    };

    state.increment_version();
    report
}

/// Spawn one interval loop per worker. Each loop sleeps its configured
/// interval, then runs the shared body; interval changes apply on the next
/// cycle.
pub fn spawn_workers(state: Arc<AppState>) {
    for kind in WorkerKind::ALL {
        let worker_state = state.clone();
        tokio::spawn(async move {
            info!(worker = kind.name(), "worker loop started");
            loop {
                let secs = kind
                    .interval_secs(&worker_state.runtime_config.read().intervals)
                    .max(1);
                tokio::time::sleep(tokio::time::Duration::from_secs(secs)).await;
                run_worker(&worker_state, kind).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;

    #[test]
    fn worker_names_round_trip() {
        for kind in WorkerKind::ALL {
            assert_eq!(WorkerKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(WorkerKind::parse("no_such_worker"), None);
    }

    #[tokio::test]
    async fn manual_trigger_runs_on_empty_state() {
        let state = Arc::new(AppState::new(RuntimeConfig::default()));
        let v0 = state.current_state_version();

        for kind in [
            WorkerKind::PredictionBatch,
            WorkerKind::Evaluation,
            WorkerKind::ExpirationSweep,
            WorkerKind::SignalBatch,
        ] {
            let report = run_worker(&state, kind).await;
            assert!(report.is_object(), "{kind:?} returned {report}");
        }
        assert!(state.current_state_version() > v0);
    }
}
