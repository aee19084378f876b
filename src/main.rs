// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use std::env;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::signal;

use anifeed_node::aggregate::{
    default_rules, AggregateConfig, DocumentFetcher, Extractor, FeedAggregator, HttpFetcher,
    Orchestrator, SectionExtractor, SnapshotSupervisor,
};
use anifeed_node::cache::CacheManager;

/// Aggregate anime listing feeds from the configured site mirrors
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Fetch per-record detail pages (episode counts)
    #[arg(long)]
    details: bool,

    /// Force a refresh, bypassing the snapshot TTL
    #[arg(long)]
    fresh: bool,

    /// Keep running and refresh the snapshot in the background
    #[arg(long)]
    warm: bool,

    /// Override the warm refresh interval in milliseconds
    #[arg(long, env = "FEED_WARM_INTERVAL_MS")]
    interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = AggregateConfig::from_env();
    if let Some(interval_ms) = args.interval_ms {
        config.warm_interval_ms = interval_ms;
    }
    config.validate().map_err(|e| anyhow!(e))?;
    if config.sources.is_empty() {
        return Err(anyhow!(
            "no sources configured; set FEED_SOURCES=\"id=url;id=url\""
        ));
    }

    let cache = CacheManager::new();
    let fetcher: Arc<dyn DocumentFetcher> = Arc::new(HttpFetcher::new(&config, &cache)?);

    let extractors: Vec<Arc<dyn Extractor>> = default_rules(config.detail_concurrency)
        .into_iter()
        .map(|rule| {
            Arc::new(SectionExtractor::with_fetcher(rule, Arc::clone(&fetcher)))
                as Arc<dyn Extractor>
        })
        .collect();

    let orchestrator = Orchestrator::new(Arc::clone(&fetcher), &config);
    let aggregator = FeedAggregator::new(orchestrator, config.sources.clone(), extractors);
    let supervisor = Arc::new(SnapshotSupervisor::new(Arc::new(aggregator), &config));

    if args.warm {
        let warm = supervisor.spawn_warm(config.warm_interval());
        println!(
            "Warming snapshot every {}ms; press Ctrl-C to stop",
            config.warm_interval_ms
        );
        signal::ctrl_c().await?;
        warm.stop();
        warm.stopped().await;
        return Ok(());
    }

    let response = supervisor.get(args.details, args.fresh).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
