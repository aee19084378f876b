// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Configuration for feed aggregation

use std::env;
use std::time::Duration;

use url::Url;

/// One remote source: a page to fetch and a base for resolving its links
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Symbolic id used in logs, records and failure entries
    pub id: String,
    /// Page URL to fetch
    pub url: String,
    /// Base URL relative links resolve against
    pub base: String,
}

impl SourceConfig {
    /// Create a source, deriving the resolution base from the URL's origin
    pub fn new(id: &str, url: &str) -> Self {
        let base = Url::parse(url)
            .map(|u| u.origin().ascii_serialization())
            .unwrap_or_else(|_| url.to_string());
        Self {
            id: id.to_string(),
            url: url.to_string(),
            base,
        }
    }
}

/// Configuration for the aggregation pipeline
#[derive(Debug, Clone)]
pub struct AggregateConfig {
    /// Remote sources to aggregate, in configured order
    pub sources: Vec<SourceConfig>,
    /// Snapshot freshness window in milliseconds
    pub snapshot_ttl_ms: u64,
    /// Minimum interval between admitted forced refreshes
    pub min_force_interval_ms: u64,
    /// Background warm refresh interval (defaults to the snapshot TTL)
    pub warm_interval_ms: u64,
    /// Soft timeout for a single extractor invocation
    pub extractor_timeout_ms: u64,
    /// Hard timeout for one document fetch
    pub fetch_timeout_ms: u64,
    /// TTL of the short-lived response cache in front of origin fetches
    pub response_cache_ttl_ms: u64,
    /// Reject document bodies larger than this
    pub max_response_bytes: usize,
    /// Sources fetched concurrently
    pub source_concurrency: usize,
    /// Detail pages fetched concurrently during enrichment
    pub detail_concurrency: usize,
    /// Outbound fetch budget per minute
    pub fetch_rate_per_minute: u32,
}

impl AggregateConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let snapshot_ttl_ms = parse_env("FEED_SNAPSHOT_TTL_MS", 60_000);
        Self {
            sources: env::var("FEED_SOURCES")
                .map(|raw| Self::parse_sources(&raw))
                .unwrap_or_default(),
            snapshot_ttl_ms,
            min_force_interval_ms: parse_env("FEED_MIN_FORCE_INTERVAL_MS", 60_000),
            warm_interval_ms: parse_env("FEED_WARM_INTERVAL_MS", snapshot_ttl_ms),
            extractor_timeout_ms: parse_env("FEED_EXTRACTOR_TIMEOUT_MS", 3_000),
            fetch_timeout_ms: parse_env("FEED_FETCH_TIMEOUT_MS", 8_000),
            response_cache_ttl_ms: parse_env("FEED_RESPONSE_CACHE_TTL_MS", 30_000),
            max_response_bytes: parse_env("FEED_MAX_RESPONSE_BYTES", 10 * 1024 * 1024),
            source_concurrency: parse_env("FEED_SOURCE_CONCURRENCY", 4),
            detail_concurrency: parse_env("FEED_DETAIL_CONCURRENCY", 6),
            fetch_rate_per_minute: parse_env("FEED_FETCH_RATE_PER_MINUTE", 60),
        }
    }

    /// Parse `id=url` pairs separated by `;`
    ///
    /// Malformed pairs are skipped rather than failing the whole list.
    pub fn parse_sources(raw: &str) -> Vec<SourceConfig> {
        raw.split(';')
            .filter_map(|pair| {
                let (id, url) = pair.split_once('=')?;
                let id = id.trim();
                let url = url.trim();
                if id.is_empty() || url.is_empty() {
                    return None;
                }
                Some(SourceConfig::new(id, url))
            })
            .collect()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.extractor_timeout_ms == 0 {
            return Err("extractor timeout must be greater than 0".to_string());
        }
        if self.fetch_timeout_ms == 0 {
            return Err("fetch timeout must be greater than 0".to_string());
        }
        if self.source_concurrency == 0 {
            return Err("source concurrency must be at least 1".to_string());
        }
        if self.detail_concurrency == 0 {
            return Err("detail concurrency must be at least 1".to_string());
        }
        for source in &self.sources {
            if Url::parse(&source.url).is_err() {
                return Err(format!("source '{}' has an invalid url", source.id));
            }
        }
        Ok(())
    }

    /// Snapshot TTL as a [`Duration`]
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    /// Forced-refresh guard interval as a [`Duration`]
    pub fn min_force_interval(&self) -> Duration {
        Duration::from_millis(self.min_force_interval_ms)
    }

    /// Warm loop interval as a [`Duration`]
    pub fn warm_interval(&self) -> Duration {
        Duration::from_millis(self.warm_interval_ms)
    }

    /// Per-extractor soft timeout as a [`Duration`]
    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_millis(self.extractor_timeout_ms)
    }

    /// Per-fetch hard timeout as a [`Duration`]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Response cache TTL as a [`Duration`]
    pub fn response_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.response_cache_ttl_ms)
    }
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            snapshot_ttl_ms: 60_000,
            min_force_interval_ms: 60_000,
            warm_interval_ms: 60_000,
            extractor_timeout_ms: 3_000,
            fetch_timeout_ms: 8_000,
            response_cache_ttl_ms: 30_000,
            max_response_bytes: 10 * 1024 * 1024,
            source_concurrency: 4,
            detail_concurrency: 6,
            fetch_rate_per_minute: 60,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
