// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// tests/pipeline_tests.rs - End-to-end aggregation pipeline over canned HTML

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use anifeed_node::aggregate::{
    AggregateConfig, AggregateError, DocumentFetcher, Extractor, FeedAggregator, FetchError,
    Orchestrator, ParsedDocument, SectionExtractor, SectionRule, SnapshotSupervisor, SourceConfig,
};

const ALPHA_HOME: &str = r#"
    <html><body>
      <div class="swiper-slide">
        <a href="/watch/shared-show" title="Shared Show"></a>
        <img src="/posters/shared.jpg">
      </div>
      <div class="swiper-slide">
        <a href="/watch/alpha-only" title="Alpha Only"></a>
      </div>
    </body></html>
"#;

const BETA_HOME: &str = r#"
    <html><body>
      <div class="swiper-slide">
        <a href="https://alpha.example/watch/shared-show" title="Shared Show (mirror)"></a>
      </div>
      <div class="swiper-slide">
        <a href="/watch/beta-only" title="Beta Only"></a>
      </div>
    </body></html>
"#;

struct CannedFetcher {
    pages: HashMap<String, String>,
}

impl CannedFetcher {
    fn new(pages: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            pages: pages
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_string()))
                .collect(),
        })
    }
}

#[async_trait]
impl DocumentFetcher for CannedFetcher {
    async fn fetch_and_load(&self, url: &str) -> Result<ParsedDocument, FetchError> {
        self.pages
            .get(url)
            .map(|body| ParsedDocument {
                url: url.to_string(),
                body: body.clone(),
            })
            .ok_or_else(|| FetchError::Status {
                status: 502,
                url: url.to_string(),
            })
    }
}

fn slider_extractors() -> Vec<Arc<dyn Extractor>> {
    let mut rule = SectionRule::new("slider", &[".swiper-slide"]);
    rule.max_items = 8;
    rule.fast_path = true;
    vec![Arc::new(SectionExtractor::new(rule))]
}

fn test_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::new("alpha", "https://alpha.example/home"),
        SourceConfig::new("beta", "https://beta.example/home"),
    ]
}

#[tokio::test]
async fn test_two_sources_merge_and_dedup() {
    let fetcher = CannedFetcher::new(&[
        ("https://alpha.example/home", ALPHA_HOME),
        ("https://beta.example/home", BETA_HOME),
    ]);
    let orchestrator = Orchestrator::new(fetcher, &AggregateConfig::default());

    let result = orchestrator
        .run(&test_sources(), &slider_extractors(), false)
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.errors.is_empty());

    // Beta's mirror of the shared show resolves to the same absolute href
    // and is deduplicated away; alpha's copy (first in merge order) wins
    assert_eq!(result.total, 3);
    let shared = result
        .records
        .iter()
        .find(|r| r.href.as_deref() == Some("https://alpha.example/watch/shared-show"))
        .unwrap();
    assert_eq!(shared.title.as_deref(), Some("Shared Show"));
    assert_eq!(shared.source.as_deref(), Some("alpha"));

    // Per-section indices are 1-based and contiguous across sources
    let mut indices: Vec<u32> = result.records.iter().filter_map(|r| r.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![1, 2, 3]);
    assert_eq!(result.section_totals.get("slider"), Some(&3));
}

#[tokio::test]
async fn test_one_source_down_degrades_to_partial() {
    // Beta's page is missing: its fetch 502s
    let fetcher = CannedFetcher::new(&[("https://alpha.example/home", ALPHA_HOME)]);
    let orchestrator = Orchestrator::new(fetcher, &AggregateConfig::default());

    let result = orchestrator
        .run(&test_sources(), &slider_extractors(), false)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].source, "beta");
    assert_eq!(result.total, 2);
    assert!(result
        .records
        .iter()
        .all(|r| r.source.as_deref() == Some("alpha")));
}

#[tokio::test]
async fn test_every_source_down_is_total_failure() {
    let fetcher = CannedFetcher::new(&[]);
    let orchestrator = Orchestrator::new(fetcher, &AggregateConfig::default());

    let result = orchestrator
        .run(&test_sources(), &slider_extractors(), false)
        .await;

    assert!(matches!(
        result,
        Err(AggregateError::AllSourcesFailed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_over_real_pipeline() {
    let fetcher = CannedFetcher::new(&[
        ("https://alpha.example/home", ALPHA_HOME),
        ("https://beta.example/home", BETA_HOME),
    ]);

    let config = AggregateConfig {
        snapshot_ttl_ms: 60_000,
        min_force_interval_ms: 60_000,
        ..AggregateConfig::default()
    };

    let orchestrator = Orchestrator::new(fetcher, &config);
    let aggregator = FeedAggregator::new(orchestrator, test_sources(), slider_extractors());
    let supervisor = SnapshotSupervisor::new(Arc::new(aggregator), &config);

    // Cold start populates the snapshot
    let first = supervisor.get(false, false).await.unwrap();
    assert_eq!(first.value.total, 3);
    assert!(!first.rate_limited);

    // Within the TTL the snapshot is served as-is
    tokio::time::advance(Duration::from_millis(30_000)).await;
    let cached = supervisor.get(false, false).await.unwrap();
    assert_eq!(cached.last_updated, first.last_updated);

    // Forced refresh is admitted once, then guarded
    let forced = supervisor.get(false, true).await.unwrap();
    assert!(!forced.rate_limited);
    tokio::time::advance(Duration::from_millis(1_000)).await;
    let limited = supervisor.get(false, true).await.unwrap();
    assert!(limited.rate_limited);
    assert_eq!(limited.last_updated, forced.last_updated);
}

/// Fetcher whose pages can be pulled out from under the pipeline mid-test
struct FlakyFetcher {
    pages: std::sync::Mutex<HashMap<String, String>>,
}

#[async_trait]
impl DocumentFetcher for FlakyFetcher {
    async fn fetch_and_load(&self, url: &str) -> Result<ParsedDocument, FetchError> {
        self.pages
            .lock()
            .ok()
            .and_then(|pages| pages.get(url).cloned())
            .map(|body| ParsedDocument {
                url: url.to_string(),
                body,
            })
            .ok_or_else(|| FetchError::Status {
                status: 502,
                url: url.to_string(),
            })
    }
}

#[tokio::test]
async fn test_supervisor_serves_stale_when_sources_disappear() {
    let fetcher = Arc::new(FlakyFetcher {
        pages: std::sync::Mutex::new(
            [
                ("https://alpha.example/home".to_string(), ALPHA_HOME.to_string()),
                ("https://beta.example/home".to_string(), BETA_HOME.to_string()),
            ]
            .into_iter()
            .collect(),
        ),
    });

    let config = AggregateConfig {
        // Everything is immediately stale, so each get re-aggregates
        snapshot_ttl_ms: 1,
        ..AggregateConfig::default()
    };

    let orchestrator = Orchestrator::new(Arc::clone(&fetcher) as Arc<dyn DocumentFetcher>, &config);
    let aggregator = FeedAggregator::new(orchestrator, test_sources(), slider_extractors());
    let supervisor = SnapshotSupervisor::new(Arc::new(aggregator), &config);

    let first = supervisor.get(false, false).await.unwrap();
    assert_eq!(first.value.total, 3);
    assert!(first.stale_error.is_none());

    // Every origin goes dark; the next refresh fails outright
    fetcher.pages.lock().unwrap().clear();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let stale = supervisor.get(false, false).await.unwrap();
    assert_eq!(stale.value.total, 3);
    assert!(stale.stale_error.is_some());
    assert_eq!(stale.last_updated, first.last_updated);
}
