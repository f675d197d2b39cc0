// =============================================================================
// Central Application State — Foresight Signal Nexus
// =============================================================================
//
// The single source of truth for the running service. All workers and the
// API hold an `Arc<AppState>`; the store owns the entity tables, the config
// lock owns the tunables, and the backends own their HTTP clients.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for the config and the error ring.
//   - Arc wrappers for subsystems with interior mutability of their own.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::crawler::Crawler;
use crate::llm::{AnalystBackend, DemoBackend, HttpLlmBackend};
use crate::outcome::{MarketDataClient, PriceRouter};
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::types::EngineMode;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the operator status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// mutation so pollers can detect change cheaply.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub store: Arc<Store>,

    /// Analyst backends. Which one a dispatch uses follows the engine mode
    /// at call time, so flipping Demo/Live needs no restart.
    pub demo_backend: Arc<dyn AnalystBackend>,
    pub live_backend: Arc<dyn AnalystBackend>,

    pub price_router: Arc<PriceRouter>,
    pub crawler: Arc<Crawler>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Instant when the service started, for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig) -> Self {
        let store = Arc::new(Store::new());
        let timeout = Duration::from_secs(config.external_timeout_secs);

        let market_url = std::env::var("FORESIGHT_MARKET_DATA_URL")
            .unwrap_or_else(|_| "http://localhost:8081".into());
        let market = Arc::new(MarketDataClient::new(market_url, timeout));
        let price_router = Arc::new(PriceRouter::new(store.clone(), market));

        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            store,
            demo_backend: Arc::new(DemoBackend),
            live_backend: Arc::new(HttpLlmBackend::new(
                std::env::var("FORESIGHT_LLM_API_KEY").unwrap_or_default(),
                timeout,
            )),
            price_router,
            crawler: Arc::new(Crawler::new(timeout)),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    /// The backend the current engine mode routes analyst dispatch to.
    pub fn analyst_backend(&self) -> Arc<dyn AnalystBackend> {
        match self.runtime_config.read().engine_mode {
            EngineMode::Demo => self.demo_backend.clone(),
            EngineMode::Live => self.live_backend.clone(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Record an error for the status surface. The ring is capped at
    /// [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, message: String, code: Option<String>) {
        let record = ErrorRecord { message, code, at: Utc::now().to_rfc3339() };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    /// Build the serialisable status snapshot for `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.runtime_config.read();
        let now = Utc::now();

        let counts = TableCounts {
            universes: self.store.list_universes().len(),
            sources: self.store.list_sources().len(),
            signals: self.store.list_signals().len(),
            predictions: self.store.list_predictions().len(),
            outcomes: self.store.list_outcomes().len(),
            evaluations: self.store.list_evaluations().len(),
            learnings: self.store.list_learnings().len(),
            pending_learning_queue: self.store.pending_queue_items().len(),
            pending_review: self.store.pending_review_items().len(),
            test_scenarios: self.store.list_test_scenarios().len(),
        };

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now.timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            engine_mode: config.engine_mode.to_string(),
            counts,
            runtime_config: RuntimeConfigSummary {
                predictor_ttl_hours: config.predictor_ttl_hours,
                dedup_lookback_hours: config.dedup_lookback_hours,
                resolution_horizon_hours: config.resolution_horizon_hours,
                review_gray_zone: (config.review_confidence_low, config.review_confidence_high),
                neutral_band_pct: config.neutral_band_pct,
                source_failure_limit: config.source_failure_limit,
            },
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub engine_mode: String,
    pub counts: TableCounts,
    pub runtime_config: RuntimeConfigSummary,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableCounts {
    pub universes: usize,
    pub sources: usize,
    pub signals: usize,
    pub predictions: usize,
    pub outcomes: usize,
    pub evaluations: usize,
    pub learnings: usize,
    pub pending_learning_queue: usize,
    pub pending_review: usize,
    pub test_scenarios: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeConfigSummary {
    pub predictor_ttl_hours: i64,
    pub dedup_lookback_hours: i64,
    pub resolution_horizon_hours: i64,
    pub review_gray_zone: (f64, f64),
    pub neutral_band_pct: f64,
    pub source_failure_limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_increments_monotonically() {
        let state = AppState::new(RuntimeConfig::default());
        let v0 = state.current_state_version();
        state.increment_version();
        state.increment_version();
        assert_eq!(state.current_state_version(), v0 + 2);
    }

    #[test]
    fn error_ring_is_capped() {
        let state = AppState::new(RuntimeConfig::default());
        for i in 0..60 {
            state.push_error(format!("error {i}"), None);
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), 50);
        assert_eq!(errors[0].message, "error 10");
    }

    #[test]
    fn demo_mode_selects_demo_backend() {
        let state = AppState::new(RuntimeConfig::default());
        assert_eq!(
            state.runtime_config.read().engine_mode,
            EngineMode::Demo
        );
        // Snapshot reflects mode and empty tables.
        let snap = state.build_snapshot();
        assert_eq!(snap.engine_mode, "Demo");
        assert_eq!(snap.counts.universes, 0);
    }
}
