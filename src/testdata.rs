// =============================================================================
// Test Data Manager — scenarios, fixtures, mirrors, and run lineage
// =============================================================================
//
// Operators exercise the full pipeline without touching production state by
// loading a scenario: a bundle of synthetic articles and price points over
// `T_` symbols, optionally mirroring real targets. Running a scenario mints
// a fresh `scenario_run_id`, stamps it onto a `test_db` source, and lets the
// normal crawl/extract/ensemble/consensus/outcome machinery do the rest —
// the same code paths production takes, just in the test namespace.
//
// Every synthetic row carries the run id, so one call tears a run down
// without a single production row being reachable by the purge.
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{
    Source, Target, TestArticle, TestPriceData, TestScenario, TestTargetMirror,
};
use crate::store::Store;
use crate::symbols;
use crate::types::{Direction, SourceKind};

fn scenario_source_name(scenario_id: Uuid) -> String {
    format!("scenario:{scenario_id}")
}

pub fn create_scenario(
    store: &Store,
    universe_id: Uuid,
    name: String,
    description: Option<String>,
    now: DateTime<Utc>,
) -> PipelineResult<TestScenario> {
    store.universe(universe_id)?;
    let scenario = TestScenario {
        id: Uuid::new_v4(),
        universe_id,
        name,
        description,
        last_run_id: None,
        created_at: now,
    };
    store.insert_test_scenario(scenario.clone());
    Ok(scenario)
}

#[allow(clippy::too_many_arguments)]
pub fn add_article(
    store: &Store,
    scenario_id: Uuid,
    symbol: String,
    title: String,
    body: String,
    direction_hint: Option<Direction>,
    strength_hint: Option<f64>,
    published_at: DateTime<Utc>,
) -> PipelineResult<TestArticle> {
    store.test_scenario(scenario_id)?;
    let article = TestArticle {
        id: Uuid::new_v4(),
        scenario_id,
        symbol,
        title,
        body,
        direction_hint,
        strength_hint,
        published_at,
        consumed: false,
    };
    store.insert_test_article(article.clone())?;
    Ok(article)
}

pub fn add_price(
    store: &Store,
    scenario_id: Uuid,
    symbol: String,
    at: DateTime<Utc>,
    price: f64,
) -> PipelineResult<TestPriceData> {
    store.test_scenario(scenario_id)?;
    if price <= 0.0 {
        return Err(PipelineError::validation(
            "INVALID_PRICE",
            format!("price must be positive, got {price}"),
        ));
    }
    let point = TestPriceData { id: Uuid::new_v4(), scenario_id, symbol, at, price };
    store.insert_test_price(point.clone())?;
    Ok(point)
}

/// Mirror a production target into the test namespace: creates the `T_`
/// Target alongside the real one and records the mapping.
pub fn create_mirror(
    store: &Store,
    scenario_id: Uuid,
    real_symbol: &str,
    now: DateTime<Utc>,
) -> PipelineResult<TestTargetMirror> {
    let scenario = store.test_scenario(scenario_id)?;
    if symbols::is_test_symbol(real_symbol) {
        return Err(PipelineError::validation(
            "INVALID_SYMBOL",
            format!("'{real_symbol}' is already in the test namespace"),
        ));
    }
    let real = store
        .target_by_symbol(scenario.universe_id, real_symbol)
        .ok_or_else(|| PipelineError::not_found("target", real_symbol))?;

    let test_symbol = symbols::test_symbol(real_symbol);
    let target = match store.target_by_symbol(scenario.universe_id, &test_symbol) {
        Some(existing) => existing,
        None => {
            let t = Target {
                id: Uuid::new_v4(),
                universe_id: scenario.universe_id,
                symbol: test_symbol.clone(),
                kind: real.kind.clone(),
                tier_override: real.tier_override,
                archived: false,
                created_at: now,
            };
            store.insert_target(t.clone());
            t
        }
    };

    let mirror = TestTargetMirror {
        id: Uuid::new_v4(),
        scenario_id,
        universe_id: scenario.universe_id,
        test_symbol,
        real_symbol: real_symbol.to_string(),
        target_id: target.id,
    };
    store.insert_test_mirror(mirror.clone())?;
    Ok(mirror)
}

/// Handle to one scenario run: the minted run id and the `test_db` source
/// the crawler will pick up.
#[derive(Debug, Clone)]
pub struct ScenarioRun {
    pub run_id: Uuid,
    pub source_id: Uuid,
}

/// Start a scenario run. Mints a fresh run id, resets article consumption so
/// the scenario replays from the top, and points the scenario's `test_db`
/// source at the new run.
pub fn run_scenario(store: &Store, scenario_id: Uuid, now: DateTime<Utc>) -> PipelineResult<ScenarioRun> {
    let scenario = store.test_scenario(scenario_id)?;
    let run_id = Uuid::new_v4();
    store.reset_consumed_articles(scenario_id);

    let name = scenario_source_name(scenario_id);
    let existing = store.list_sources().into_iter().find(|s| s.name == name);
    let source_id = match existing {
        Some(source) => {
            store.update_source(source.id, |s| {
                s.scenario_run_id = Some(run_id);
                s.enabled = true;
                s.consecutive_failures = 0;
                s.last_crawled_at = None;
            })?;
            source.id
        }
        None => {
            let source = Source {
                id: Uuid::new_v4(),
                universe_id: scenario.universe_id,
                name,
                kind: SourceKind::TestDb,
                url: None,
                crawl_interval_minutes: 1,
                is_test: true,
                scenario_run_id: Some(run_id),
                enabled: true,
                consecutive_failures: 0,
                last_crawled_at: None,
                created_at: now,
            };
            let id = source.id;
            store.insert_source(source);
            id
        }
    };

    store.update_test_scenario(scenario_id, |s| s.last_run_id = Some(run_id))?;
    info!(scenario = %scenario.name, %run_id, "scenario run started");
    Ok(ScenarioRun { run_id, source_id })
}

/// Tear down one scenario run: purge every pipeline row stamped with the run
/// id and park its `test_db` source. Fixtures survive for the next run.
pub fn cleanup_run(store: &Store, run_id: Uuid) -> usize {
    let removed = store.purge_scenario_run(run_id);
    for source in store.list_sources() {
        if source.scenario_run_id == Some(run_id) {
            let _ = store.update_source(source.id, |s| {
                s.enabled = false;
                s.scenario_run_id = None;
            });
        }
    }
    info!(%run_id, removed, "scenario run purged");
    removed
}

/// Delete a scenario outright: last run's pipeline rows, all fixtures, and
/// the scenario row itself.
pub fn delete_scenario(store: &Store, scenario_id: Uuid) -> PipelineResult<usize> {
    let scenario = store.test_scenario(scenario_id)?;
    let mut removed = 0;
    if let Some(run_id) = scenario.last_run_id {
        removed += cleanup_run(store, run_id);
    }
    removed += store.delete_scenario_fixtures(scenario_id);
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConsensusThresholds, Signal, Universe};
    use crate::types::Domain;
    use std::collections::HashMap;

    fn seed_universe(store: &Store) -> Universe {
        let u = Universe {
            id: Uuid::new_v4(),
            org_id: "org".into(),
            agent_id: "agent".into(),
            name: "us-equities".into(),
            domain: Domain::Equities,
            tiers: HashMap::new(),
            thresholds: ConsensusThresholds::default(),
            analysts: vec![],
            resolution_horizon_hours: None,
            notification: None,
            active: true,
            created_at: Utc::now(),
        };
        store.insert_universe(u.clone());
        u
    }

    #[test]
    fn article_symbols_are_namespace_checked() {
        let store = Store::new();
        let universe = seed_universe(&store);
        let scenario =
            create_scenario(&store, universe.id, "earnings".into(), None, Utc::now()).unwrap();

        let err = add_article(
            &store,
            scenario.id,
            "AAPL".into(),
            "t".into(),
            "b".into(),
            None,
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "CONSISTENCY_VIOLATION");

        assert!(add_article(
            &store,
            scenario.id,
            "T_AAPL".into(),
            "t".into(),
            "b".into(),
            Some(Direction::Bullish),
            Some(7.0),
            Utc::now(),
        )
        .is_ok());
    }

    #[test]
    fn mirror_creates_test_target_next_to_real_one() {
        let store = Store::new();
        let universe = seed_universe(&store);
        store.insert_target(Target {
            id: Uuid::new_v4(),
            universe_id: universe.id,
            symbol: "NVDA".into(),
            kind: "equity".into(),
            tier_override: None,
            archived: false,
            created_at: Utc::now(),
        });
        let scenario =
            create_scenario(&store, universe.id, "mirror".into(), None, Utc::now()).unwrap();

        let mirror = create_mirror(&store, scenario.id, "NVDA", Utc::now()).unwrap();
        assert_eq!(mirror.test_symbol, "T_NVDA");

        let test_target = store.target(mirror.target_id).unwrap();
        assert_eq!(test_target.symbol, "T_NVDA");
        assert_eq!(test_target.kind, "equity");

        // Unknown real symbol is a 404-shaped error, not a silent create.
        let err = create_mirror(&store, scenario.id, "ZZZZ", Utc::now()).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn run_mints_fresh_id_and_reuses_source() {
        let store = Store::new();
        let universe = seed_universe(&store);
        let scenario =
            create_scenario(&store, universe.id, "replay".into(), None, Utc::now()).unwrap();

        let run1 = run_scenario(&store, scenario.id, Utc::now()).unwrap();
        let run2 = run_scenario(&store, scenario.id, Utc::now()).unwrap();
        assert_ne!(run1.run_id, run2.run_id);
        assert_eq!(run1.source_id, run2.source_id);

        let source = store.source(run2.source_id).unwrap();
        assert_eq!(source.kind, SourceKind::TestDb);
        assert!(source.is_test);
        assert_eq!(source.scenario_run_id, Some(run2.run_id));

        let reloaded = store.test_scenario(scenario.id).unwrap();
        assert_eq!(reloaded.last_run_id, Some(run2.run_id));
    }

    #[test]
    fn rerun_replays_consumed_articles() {
        let store = Store::new();
        let universe = seed_universe(&store);
        let scenario =
            create_scenario(&store, universe.id, "replay".into(), None, Utc::now()).unwrap();
        let article = add_article(
            &store,
            scenario.id,
            "T_AAPL".into(),
            "t".into(),
            "b".into(),
            None,
            None,
            Utc::now(),
        )
        .unwrap();
        store.mark_article_consumed(article.id).unwrap();
        assert!(store.unconsumed_test_articles(scenario.id).is_empty());

        run_scenario(&store, scenario.id, Utc::now()).unwrap();
        assert_eq!(store.unconsumed_test_articles(scenario.id).len(), 1);
    }

    #[test]
    fn cleanup_purges_run_rows_and_parks_source() {
        let store = Store::new();
        let universe = seed_universe(&store);
        let scenario =
            create_scenario(&store, universe.id, "teardown".into(), None, Utc::now()).unwrap();
        let run = run_scenario(&store, scenario.id, Utc::now()).unwrap();

        store.insert_signal(Signal {
            id: Uuid::new_v4(),
            universe_id: universe.id,
            target_id: Uuid::new_v4(),
            source_id: run.source_id,
            title: "t".into(),
            body: "b".into(),
            direction_hint: None,
            strength_hint: None,
            fingerprint: "f".into(),
            is_test: true,
            scenario_run_id: Some(run.run_id),
            created_at: Utc::now(),
        });
        // A production row must be unreachable by the purge.
        store.insert_signal(Signal {
            id: Uuid::new_v4(),
            universe_id: universe.id,
            target_id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            title: "t".into(),
            body: "b".into(),
            direction_hint: None,
            strength_hint: None,
            fingerprint: "g".into(),
            is_test: false,
            scenario_run_id: None,
            created_at: Utc::now(),
        });

        let removed = cleanup_run(&store, run.run_id);
        assert_eq!(removed, 1);
        assert_eq!(store.list_signals().len(), 1);

        let source = store.source(run.source_id).unwrap();
        assert!(!source.enabled);
        assert_eq!(source.scenario_run_id, None);

        // Fixtures and the scenario survive for the next run.
        assert!(store.test_scenario(scenario.id).is_ok());
    }

    #[test]
    fn delete_scenario_removes_fixtures_too() {
        let store = Store::new();
        let universe = seed_universe(&store);
        let scenario =
            create_scenario(&store, universe.id, "gone".into(), None, Utc::now()).unwrap();
        add_article(
            &store,
            scenario.id,
            "T_AAPL".into(),
            "t".into(),
            "b".into(),
            None,
            None,
            Utc::now(),
        )
        .unwrap();
        add_price(&store, scenario.id, "T_AAPL".into(), Utc::now(), 100.0).unwrap();

        let removed = delete_scenario(&store, scenario.id).unwrap();
        assert!(removed >= 3); // article + price + scenario row
        assert!(store.test_scenario(scenario.id).is_err());
    }
}
