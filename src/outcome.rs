// =============================================================================
// Outcome Tracker — resolving predictions against ground truth
// =============================================================================
//
// Runs on a schedule. Each unresolved prediction past its resolution horizon
// gets a ground-truth price pair (at creation, at horizon) and an immutable
// Outcome row. Predictions whose horizon has not elapsed are simply left
// alone.
//
// Price routing is keyed on the symbol namespace and the two paths never
// merge: `T_` symbols read the synthetic test price table, everything else
// goes to the external market data provider. A prediction whose provenance
// disagrees with its symbol's namespace is a consistency violation and is
// never silently coerced.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{Outcome, Prediction};
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::symbols;
use crate::types::Direction;

// =============================================================================
// Price boundary
// =============================================================================

/// External price/outcome data boundary.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> PipelineResult<f64>;
}

/// Market data provider client. Expects a JSON `{ "price": <f64> }` from
/// `GET {base}/v1/price?symbol=..&at=<rfc3339>`.
pub struct MarketDataClient {
    client: reqwest::Client,
    base_url: String,
}

impl MarketDataClient {
    pub fn new(base_url: String, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }
}

#[derive(serde::Deserialize)]
struct PriceResponse {
    price: f64,
}

#[async_trait]
impl PriceFeed for MarketDataClient {
    async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> PipelineResult<f64> {
        let url = format!("{}/v1/price", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("at", &at.to_rfc3339())])
            .send()
            .await
            .map_err(|e| PipelineError::transient(format!("price fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(PipelineError::transient(format!(
                "market data provider returned {} for {symbol}",
                response.status()
            )));
        }

        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::transient(format!("malformed price response: {e}")))?;
        Ok(body.price)
    }
}

/// Routes price lookups by symbol namespace. The test path reads the
/// synthetic price table; the market path calls the provider. The two paths
/// are mutually exclusive per symbol.
pub struct PriceRouter {
    store: Arc<Store>,
    market: Arc<dyn PriceFeed>,
}

impl PriceRouter {
    pub fn new(store: Arc<Store>, market: Arc<dyn PriceFeed>) -> Self {
        Self { store, market }
    }

    pub async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> PipelineResult<f64> {
        if symbols::is_test_symbol(symbol) {
            self.store.test_price_at(symbol, at)
        } else {
            self.market.price_at(symbol, at).await
        }
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Classify a percentage move into a direction; moves inside the neutral
/// band resolve Neutral.
pub fn classify_move(magnitude_pct: f64, neutral_band_pct: f64) -> Direction {
    if magnitude_pct > neutral_band_pct {
        Direction::Bullish
    } else if magnitude_pct < -neutral_band_pct {
        Direction::Bearish
    } else {
        Direction::Neutral
    }
}

/// Counters for one outcome tracking pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeReport {
    pub resolved: usize,
    pub failed: usize,
}

/// Resolve one prediction. Fetches both price points, classifies the move,
/// and writes the Outcome in one go; a failed fetch leaves the prediction
/// unresolved for the next pass.
async fn resolve_prediction(
    store: &Store,
    config: &RuntimeConfig,
    router: &PriceRouter,
    prediction: &Prediction,
) -> PipelineResult<Outcome> {
    let target = store.target(prediction.target_id)?;

    // The prediction's provenance must agree with its symbol's namespace
    // before any price path is chosen.
    if prediction.is_test != symbols::is_test_symbol(&target.symbol) {
        return Err(PipelineError::consistency(format!(
            "prediction {} (is_test={}) resolves symbol '{}' in the wrong namespace",
            prediction.id, prediction.is_test, target.symbol
        )));
    }

    let price_start = router.price_at(&target.symbol, prediction.created_at).await?;
    let price_end = router.price_at(&target.symbol, prediction.resolve_after).await?;

    if price_start <= 0.0 {
        return Err(PipelineError::transient(format!(
            "non-positive reference price {price_start} for {}",
            target.symbol
        )));
    }

    let magnitude_pct = (price_end - price_start) / price_start * 100.0;
    let realized = classify_move(magnitude_pct, config.neutral_band_pct);

    let outcome = Outcome {
        id: Uuid::new_v4(),
        prediction_id: prediction.id,
        universe_id: prediction.universe_id,
        target_id: prediction.target_id,
        predicted_direction: prediction.direction,
        realized_direction: realized,
        magnitude_pct,
        correct: realized == prediction.direction,
        is_test: prediction.is_test,
        scenario_run_id: prediction.scenario_run_id,
        resolved_at: prediction.resolve_after,
    };

    store.update_prediction(prediction.id, |p| {
        p.resolved = true;
        p.price_at_creation = Some(price_start);
    })?;
    store.insert_outcome(outcome.clone());

    info!(
        target = %target.symbol,
        predicted = %outcome.predicted_direction,
        realized = %outcome.realized_direction,
        magnitude_pct = outcome.magnitude_pct,
        correct = outcome.correct,
        is_test = outcome.is_test,
        "outcome recorded"
    );
    Ok(outcome)
}

/// One outcome tracking pass. Per-prediction failures are logged and
/// retried next pass; consistency violations are logged loudly and skipped.
pub async fn run_outcome_tracking(
    store: &Store,
    config: &RuntimeConfig,
    router: &PriceRouter,
    now: DateTime<Utc>,
) -> OutcomeReport {
    let mut report = OutcomeReport::default();
    for prediction in store.resolvable_predictions(now) {
        match resolve_prediction(store, config, router, &prediction).await {
            Ok(_) => report.resolved += 1,
            Err(e @ PipelineError::Consistency { .. }) => {
                report.failed += 1;
                error!(prediction_id = %prediction.id, error = %e, "outcome resolution refused");
            }
            Err(e) => {
                report.failed += 1;
                warn!(prediction_id = %prediction.id, error = %e, "outcome resolution failed");
            }
        }
    }
    if report.resolved > 0 || report.failed > 0 {
        debug!(resolved = report.resolved, failed = report.failed, "outcome tracking pass done");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Target, TestPriceData};
    use chrono::Duration;
    use parking_lot::Mutex;

    /// Stub market feed with fixed prices; records every symbol it is asked
    /// about so tests can assert the test path never reaches it.
    struct StubMarket {
        prices: Vec<(DateTime<Utc>, f64)>,
        asked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PriceFeed for StubMarket {
        async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> PipelineResult<f64> {
            self.asked.lock().push(symbol.to_string());
            self.prices
                .iter()
                .filter(|(t, _)| *t <= at)
                .last()
                .map(|(_, p)| *p)
                .ok_or_else(|| PipelineError::transient("no price"))
        }
    }

    fn target(store: &Store, symbol: &str) -> Target {
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

    fn prediction(t: &Target, direction: Direction, created: DateTime<Utc>, is_test: bool) -> Prediction {
        Prediction {
            id: Uuid::new_v4(),
            universe_id: t.universe_id,
            target_id: t.id,
            direction,
            combined_strength: 18.0,
            consensus_ratio: 1.0,
            predictor_ids: vec![],
            thresholds_met: true,
            price_at_creation: None,
            is_test,
            scenario_run_id: if is_test { Some(Uuid::new_v4()) } else { None },
            created_at: created,
            resolve_after: created + Duration::hours(24),
            superseded_by: None,
            resolved: false,
        }
    }

    #[test]
    fn classify_move_respects_neutral_band() {
        assert_eq!(classify_move(1.0, 0.25), Direction::Bullish);
        assert_eq!(classify_move(-1.0, 0.25), Direction::Bearish);
        assert_eq!(classify_move(0.2, 0.25), Direction::Neutral);
        assert_eq!(classify_move(-0.25, 0.25), Direction::Neutral);
    }

    #[tokio::test]
    async fn production_symbol_resolves_via_market_feed() {
        let store = Arc::new(Store::new());
        let config = RuntimeConfig::default();
        let t0 = Utc::now() - Duration::hours(48);

        let market = Arc::new(StubMarket {
            prices: vec![(t0, 100.0), (t0 + Duration::hours(24), 103.0)],
            asked: Mutex::new(vec![]),
        });
        let router = PriceRouter::new(store.clone(), market.clone());

        let tgt = target(&store, "AAPL");
        store.insert_prediction(prediction(&tgt, Direction::Bullish, t0, false));

        let report = run_outcome_tracking(&store, &config, &router, Utc::now()).await;
        assert_eq!(report.resolved, 1);

        let p = store.resolvable_predictions(Utc::now());
        assert!(p.is_empty());

        let outcomes = store.list_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].correct);
        assert!((outcomes[0].magnitude_pct - 3.0).abs() < 1e-9);
        assert!(!outcomes[0].is_test);
    }

    #[tokio::test]
    async fn test_symbol_never_touches_market_feed() {
        let store = Arc::new(Store::new());
        let config = RuntimeConfig::default();
        let t0 = Utc::now() - Duration::hours(48);
        let scenario = Uuid::new_v4();

        for (offset, price) in [(0i64, 50.0), (24, 48.0)] {
            store
                .insert_test_price(TestPriceData {
                    id: Uuid::new_v4(),
                    scenario_id: scenario,
                    symbol: "T_AAPL".into(),
                    at: t0 + Duration::hours(offset),
                    price,
                })
                .unwrap();
        }

        let market = Arc::new(StubMarket { prices: vec![], asked: Mutex::new(vec![]) });
        let router = PriceRouter::new(store.clone(), market.clone());

        let tgt = target(&store, "T_AAPL");
        store.insert_prediction(prediction(&tgt, Direction::Bearish, t0, true));

        let report = run_outcome_tracking(&store, &config, &router, Utc::now()).await;
        assert_eq!(report.resolved, 1);
        assert!(market.asked.lock().is_empty());

        let outcomes = store.list_outcomes();
        assert_eq!(outcomes[0].realized_direction, Direction::Bearish);
        assert!(outcomes[0].correct);
        assert!(outcomes[0].is_test);
        assert!(outcomes[0].scenario_run_id.is_some());
    }

    #[tokio::test]
    async fn unelapsed_horizon_is_left_untouched() {
        let store = Arc::new(Store::new());
        let config = RuntimeConfig::default();
        let market = Arc::new(StubMarket { prices: vec![], asked: Mutex::new(vec![]) });
        let router = PriceRouter::new(store.clone(), market.clone());

        let tgt = target(&store, "AAPL");
        store.insert_prediction(prediction(&tgt, Direction::Bullish, Utc::now(), false));

        let report = run_outcome_tracking(&store, &config, &router, Utc::now()).await;
        assert_eq!(report.resolved, 0);
        assert_eq!(report.failed, 0);
        assert!(store.list_outcomes().is_empty());
    }

    #[tokio::test]
    async fn provenance_namespace_mismatch_is_refused() {
        let store = Arc::new(Store::new());
        let config = RuntimeConfig::default();
        let t0 = Utc::now() - Duration::hours(48);

        let market = Arc::new(StubMarket {
            prices: vec![(t0, 100.0), (t0 + Duration::hours(24), 103.0)],
            asked: Mutex::new(vec![]),
        });
        let router = PriceRouter::new(store.clone(), market.clone());

        // Production symbol, but the prediction claims test provenance.
        let tgt = target(&store, "AAPL");
        store.insert_prediction(prediction(&tgt, Direction::Bullish, t0, true));

        let report = run_outcome_tracking(&store, &config, &router, Utc::now()).await;
        assert_eq!(report.failed, 1);
        assert!(store.list_outcomes().is_empty());
        // No price path was consulted.
        assert!(market.asked.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_prediction_for_next_pass() {
        let store = Arc::new(Store::new());
        let config = RuntimeConfig::default();
        let t0 = Utc::now() - Duration::hours(48);

        let market = Arc::new(StubMarket { prices: vec![], asked: Mutex::new(vec![]) });
        let router = PriceRouter::new(store.clone(), market.clone());

        let tgt = target(&store, "AAPL");
        store.insert_prediction(prediction(&tgt, Direction::Bullish, t0, false));

        let report = run_outcome_tracking(&store, &config, &router, Utc::now()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(store.resolvable_predictions(Utc::now()).len(), 1);
    }
}
