// =============================================================================
// Source Crawler — due-source polling and per-source failure tracking
// =============================================================================
//
// Each pass picks up enabled sources whose crawl interval has elapsed and
// pulls their content:
//
//   web / feed — HTTP fetch of a JSON item list from the source URL
//   test_db    — unconsumed synthetic articles of the scenario whose current
//                run the source is stamped with
//
// Every fetched item goes through the extractor. A failed crawl bumps the
// source's consecutive failure count and disables the source at the
// configured limit; a successful crawl resets the count. `last_crawled_at`
// advances on success AND failure so a broken source cannot hot-loop.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::extractor;
use crate::model::{CrawledItem, Source};
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::types::{Direction, SourceKind};

/// Wire shape of one item in a web/feed source's JSON response.
#[derive(Debug, Deserialize)]
struct FeedItem {
    title: String,
    body: String,
    symbols: Vec<String>,
    #[serde(default)]
    direction_hint: Option<Direction>,
    #[serde(default)]
    strength_hint: Option<f64>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub sources_crawled: usize,
    pub sources_failed: usize,
    pub signals_created: usize,
}

pub struct Crawler {
    client: reqwest::Client,
}

impl Crawler {
    pub fn new(timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn fetch_web(&self, source: &Source, now: DateTime<Utc>) -> PipelineResult<Vec<CrawledItem>> {
        let url = source.url.as_deref().ok_or_else(|| {
            PipelineError::validation(
                "MISSING_URL",
                format!("source '{}' has no fetch URL", source.name),
            )
        })?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::transient(format!("fetch of '{}' failed: {e}", source.name)))?;
        if !response.status().is_success() {
            return Err(PipelineError::transient(format!(
                "source '{}' returned {}",
                source.name,
                response.status()
            )));
        }

        let items: Vec<FeedItem> = response
            .json()
            .await
            .map_err(|e| PipelineError::transient(format!("malformed feed from '{}': {e}", source.name)))?;

        Ok(items
            .into_iter()
            .map(|i| CrawledItem {
                source_id: source.id,
                title: i.title,
                body: i.body,
                symbols: i.symbols,
                direction_hint: i.direction_hint,
                strength_hint: i.strength_hint,
                published_at: i.published_at.unwrap_or(now),
            })
            .collect())
    }

    /// Pull and consume the unconsumed articles of the scenario whose current
    /// run this source carries.
    fn fetch_test_db(&self, store: &Store, source: &Source) -> PipelineResult<Vec<CrawledItem>> {
        let run_id = source.scenario_run_id.ok_or_else(|| {
            PipelineError::validation(
                "NO_ACTIVE_RUN",
                format!("test_db source '{}' has no active scenario run", source.name),
            )
        })?;
        let scenario = store
            .list_test_scenarios()
            .into_iter()
            .find(|s| s.last_run_id == Some(run_id))
            .ok_or_else(|| PipelineError::not_found("test_scenario_run", run_id.to_string()))?;

        let mut items = Vec::new();
        for article in store.unconsumed_test_articles(scenario.id) {
            store.mark_article_consumed(article.id)?;
            items.push(CrawledItem {
                source_id: source.id,
                title: article.title,
                body: article.body,
                symbols: vec![article.symbol],
                direction_hint: article.direction_hint,
                strength_hint: article.strength_hint,
                published_at: article.published_at,
            });
        }
        Ok(items)
    }

    async fn crawl_source(
        &self,
        store: &Store,
        config: &RuntimeConfig,
        source: &Source,
        now: DateTime<Utc>,
    ) -> PipelineResult<usize> {
        let items = match source.kind {
            SourceKind::Web | SourceKind::Feed => self.fetch_web(source, now).await?,
            SourceKind::TestDb => self.fetch_test_db(store, source)?,
        };

        let mut created = 0;
        for item in &items {
            let report = extractor::process_item(store, config, source, item, now)?;
            created += report.created.len();
        }
        debug!(source = %source.name, items = items.len(), created, "source crawled");
        Ok(created)
    }

    /// One crawl pass over all due sources.
    pub async fn run_crawl_pass(
        &self,
        store: &Store,
        config: &RuntimeConfig,
        now: DateTime<Utc>,
    ) -> CrawlReport {
        let mut report = CrawlReport::default();

        for source in store.due_sources(now) {
            match self.crawl_source(store, config, &source, now).await {
                Ok(created) => {
                    report.sources_crawled += 1;
                    report.signals_created += created;
                    let _ = store.update_source(source.id, |s| {
                        s.consecutive_failures = 0;
                        s.last_crawled_at = Some(now);
                    });
                }
                Err(e) => {
                    report.sources_failed += 1;
                    let failures = source.consecutive_failures + 1;
                    let disable = failures >= config.source_failure_limit;
                    let _ = store.update_source(source.id, |s| {
                        s.consecutive_failures = failures;
                        s.last_crawled_at = Some(now);
                        if disable {
                            s.enabled = false;
                        }
                    });
                    if disable {
                        warn!(
                            source = %source.name,
                            failures,
                            error = %e,
                            "source disabled after repeated crawl failures"
                        );
                    } else {
                        warn!(source = %source.name, failures, error = %e, "crawl failed");
                    }
                }
            }
        }

        if report.sources_crawled + report.sources_failed > 0 {
            info!(
                crawled = report.sources_crawled,
                failed = report.sources_failed,
                signals = report.signals_created,
                "crawl pass done"
            );
        }
        report
    }
}
