// =============================================================================
// Signal Extractor — crawled items to deduplicated Signals
// =============================================================================
//
// Converts one crawled content item into zero or more Signals, one per
// referenced Target. Two gates run before any write:
//
//   1. For test_db sources, every referenced symbol must carry the `T_`
//      prefix; one bad symbol rejects the whole item with INVALID_SYMBOL and
//      zero signals are written.
//   2. Dedup: a content-derived fingerprint (sha256 over normalized
//      title+body) matching an existing signal for the same target within
//      the lookback window drops the item silently. The fingerprint is
//      content-derived, never id-derived, so a false positive (dropping new
//      content) cannot happen from id reuse; an occasional false negative
//      (duplicate slipping through) is acceptable.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{CrawledItem, Signal, Source};
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::symbols;
use crate::types::SourceKind;

/// What happened to one crawled item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    /// Signal ids created.
    pub created: Vec<Uuid>,
    /// Target symbols skipped as duplicates.
    pub duplicates: usize,
    /// Symbols that resolved to no known target.
    pub unknown_symbols: usize,
}

/// Lowercase, collapse whitespace, trim.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable content fingerprint over normalized title + body.
pub fn fingerprint(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(title).as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize(body).as_bytes());
    hex::encode(hasher.finalize())
}

/// Process one crawled item against its source. Returns the per-item report
/// or a typed rejection; nothing is written on rejection.
pub fn process_item(
    store: &Store,
    config: &RuntimeConfig,
    source: &Source,
    item: &CrawledItem,
    now: DateTime<Utc>,
) -> PipelineResult<ExtractReport> {
    // Gate 1: symbol namespace. A test_db source may only reference the T_
    // namespace; one violation rejects the whole item before any write.
    if source.kind == SourceKind::TestDb {
        for symbol in &item.symbols {
            if !symbols::is_test_symbol(symbol) {
                return Err(PipelineError::validation(
                    "INVALID_SYMBOL",
                    format!(
                        "test_db source '{}' references symbol '{}' without the {} prefix",
                        source.name,
                        symbol,
                        symbols::TEST_PREFIX
                    ),
                ));
            }
        }
    }

    let fp = fingerprint(&item.title, &item.body);
    let lookback_start = now - Duration::hours(config.dedup_lookback_hours);
    let mut report = ExtractReport::default();

    for symbol in &item.symbols {
        let Some(target) = store.target_by_symbol(source.universe_id, symbol) else {
            debug!(symbol, source = %source.name, "crawled item references unknown symbol");
            report.unknown_symbols += 1;
            continue;
        };

        // A production source must never write against a test-namespace
        // target; that would cross the isolation boundary.
        if !source.is_test && symbols::is_test_symbol(&target.symbol) {
            warn!(
                symbol = %target.symbol,
                source = %source.name,
                "production source matched a test-namespace target; refusing"
            );
            return Err(PipelineError::consistency(format!(
                "production source '{}' resolved test-namespace target '{}'",
                source.name, target.symbol
            )));
        }

        // Gate 2: dedup within the lookback window.
        if store.duplicate_signal_exists(target.id, &fp, lookback_start) {
            debug!(
                target = %target.symbol,
                fingerprint = %&fp[..12],
                "duplicate signal suppressed"
            );
            report.duplicates += 1;
            continue;
        }

        let signal = Signal {
            id: Uuid::new_v4(),
            universe_id: source.universe_id,
            target_id: target.id,
            source_id: source.id,
            title: item.title.clone(),
            body: item.body.clone(),
            direction_hint: item.direction_hint,
            strength_hint: item.strength_hint,
            fingerprint: fp.clone(),
            // Provenance derives solely from the source.
            is_test: source.is_test,
            scenario_run_id: source.scenario_run_id,
            created_at: now,
        };
        let id = signal.id;
        store.insert_signal(signal);
        report.created.push(id);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Target;
    use crate::types::Direction;

    fn setup() -> (Store, RuntimeConfig, Uuid) {
        let store = Store::new();
        let universe_id = Uuid::new_v4();
        (store, RuntimeConfig::default(), universe_id)
    }

    fn add_target(store: &Store, universe_id: Uuid, symbol: &str) -> Uuid {
        let target = Target {
            id: Uuid::new_v4(),
            universe_id,
            symbol: symbol.to_string(),
            kind: "equity".into(),
            tier_override: None,
            archived: false,
            created_at: Utc::now(),
        };
        let id = target.id;
        store.insert_target(target);
        id
    }

    fn source(universe_id: Uuid, kind: SourceKind, is_test: bool) -> Source {
        Source {
            id: Uuid::new_v4(),
            universe_id,
            name: "src".into(),
            kind,
            url: None,
            crawl_interval_minutes: 10,
            is_test,
            scenario_run_id: if is_test { Some(Uuid::new_v4()) } else { None },
            enabled: true,
            consecutive_failures: 0,
            last_crawled_at: None,
            created_at: Utc::now(),
        }
    }

    fn item(source_id: Uuid, symbols: &[&str], title: &str, body: &str) -> CrawledItem {
        CrawledItem {
            source_id,
            title: title.into(),
            body: body.into(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            direction_hint: Some(Direction::Bullish),
            strength_hint: Some(6.0),
            published_at: Utc::now(),
        }
    }

    #[test]
    fn fingerprint_is_normalization_stable() {
        let a = fingerprint("Fed Cuts  Rates", "markets RALLY hard");
        let b = fingerprint("fed cuts rates", "Markets  rally HARD ");
        assert_eq!(a, b);
        assert_ne!(a, fingerprint("fed holds rates", "markets rally hard"));
    }

    #[test]
    fn first_item_creates_signal_duplicate_is_dropped() {
        let (store, cfg, universe) = setup();
        add_target(&store, universe, "AAPL");
        let src = source(universe, SourceKind::Web, false);
        let now = Utc::now();

        let it = item(src.id, &["AAPL"], "Earnings beat", "Big quarter.");
        let r1 = process_item(&store, &cfg, &src, &it, now).unwrap();
        assert_eq!(r1.created.len(), 1);

        let r2 = process_item(&store, &cfg, &src, &it, now).unwrap();
        assert!(r2.created.is_empty());
        assert_eq!(r2.duplicates, 1);
        assert_eq!(store.list_signals().len(), 1);
    }

    #[test]
    fn duplicate_outside_lookback_is_new_again() {
        let (store, cfg, universe) = setup();
        add_target(&store, universe, "AAPL");
        let src = source(universe, SourceKind::Web, false);
        let t0 = Utc::now();

        let it = item(src.id, &["AAPL"], "Earnings beat", "Big quarter.");
        process_item(&store, &cfg, &src, &it, t0).unwrap();

        let later = t0 + Duration::hours(cfg.dedup_lookback_hours + 1);
        let r = process_item(&store, &cfg, &src, &it, later).unwrap();
        assert_eq!(r.created.len(), 1);
    }

    #[test]
    fn test_db_source_rejects_unprefixed_symbol() {
        let (store, cfg, universe) = setup();
        add_target(&store, universe, "T_AAPL");
        let src = source(universe, SourceKind::TestDb, true);

        let it = item(src.id, &["AAPL"], "synthetic", "body");
        let err = process_item(&store, &cfg, &src, &it, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_SYMBOL");
        assert!(store.list_signals().is_empty());
    }

    #[test]
    fn one_bad_symbol_rejects_the_whole_item() {
        let (store, cfg, universe) = setup();
        add_target(&store, universe, "T_AAPL");
        let src = source(universe, SourceKind::TestDb, true);

        let it = item(src.id, &["T_AAPL", "MSFT"], "synthetic", "body");
        assert!(process_item(&store, &cfg, &src, &it, Utc::now()).is_err());
        assert!(store.list_signals().is_empty());
    }

    #[test]
    fn signal_inherits_source_provenance() {
        let (store, cfg, universe) = setup();
        add_target(&store, universe, "T_AAPL");
        let src = source(universe, SourceKind::TestDb, true);

        let it = item(src.id, &["T_AAPL"], "synthetic", "body");
        let r = process_item(&store, &cfg, &src, &it, Utc::now()).unwrap();
        let signal = store.signal(r.created[0]).unwrap();
        assert!(signal.is_test);
        assert_eq!(signal.scenario_run_id, src.scenario_run_id);
    }

    #[test]
    fn unknown_symbol_is_skipped_not_fatal() {
        let (store, cfg, universe) = setup();
        add_target(&store, universe, "AAPL");
        let src = source(universe, SourceKind::Web, false);

        let it = item(src.id, &["AAPL", "ZZZZ"], "t", "b");
        let r = process_item(&store, &cfg, &src, &it, Utc::now()).unwrap();
        assert_eq!(r.created.len(), 1);
        assert_eq!(r.unknown_symbols, 1);
    }
}
