// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Aggregation orchestration
//!
//! Fetches every configured source once, runs the registered extraction
//! strategies over each document with per-strategy timeouts, and merges the
//! produced records into one deduplicated, per-section-indexed result.
//! Individual strategy or source failures degrade to "no contribution";
//! only structural errors or a total wipeout reach the caller.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::utils::map_bounded;

use super::config::{AggregateConfig, SourceConfig};
use super::extractor::{Extractor, ExtractorError};
use super::fetcher::{DocumentFetcher, ParsedDocument, UrlResolver};
use super::types::{AggregateError, AggregationResult, Record, SourceFailure};

/// Runs the fetch → extract → merge pipeline across sources
pub struct Orchestrator {
    fetcher: Arc<dyn DocumentFetcher>,
    extractor_timeout: Duration,
    source_concurrency: usize,
}

impl Orchestrator {
    /// Create an orchestrator over the given fetcher
    pub fn new(fetcher: Arc<dyn DocumentFetcher>, config: &AggregateConfig) -> Self {
        Self {
            fetcher,
            extractor_timeout: config.extractor_timeout(),
            source_concurrency: config.source_concurrency,
        }
    }

    /// Aggregate every source with every extraction strategy
    ///
    /// Partial failures populate the result's `errors`; the call itself only
    /// fails on an empty source list or when every source fetch failed.
    pub async fn run(
        &self,
        sources: &[SourceConfig],
        extractors: &[Arc<dyn Extractor>],
        include_details: bool,
    ) -> Result<AggregationResult, AggregateError> {
        if sources.is_empty() {
            return Err(AggregateError::NoSources);
        }

        let start = tokio::time::Instant::now();
        let failures = Mutex::new(Vec::<SourceFailure>::new());

        let outcomes = map_bounded(
            sources.to_vec(),
            self.source_concurrency,
            |source, _| {
                let failures = &failures;
                async move {
                    match self.fetcher.fetch_and_load(&source.url).await {
                        Ok(doc) => Ok::<_, ()>(
                            self.run_extractors(
                                &doc,
                                &source,
                                extractors,
                                include_details,
                                failures,
                            )
                            .await,
                        ),
                        Err(err) => {
                            warn!("Source '{}' fetch failed: {}", source.id, err);
                            push_failure(failures, &source.id, &err.to_string());
                            Err(())
                        }
                    }
                }
            },
        )
        .await;

        let errors = failures.into_inner().unwrap_or_else(|e| e.into_inner());

        if outcomes.iter().all(Option::is_none) {
            return Err(AggregateError::AllSourcesFailed { errors });
        }

        // One merge pass over everything, in source-then-strategy order
        let combined: Vec<Record> = outcomes.into_iter().flatten().flatten().collect();
        let (records, section_totals) = merge(combined);

        info!(
            "Aggregated {} records across {} sections in {}ms ({} failures)",
            records.len(),
            section_totals.len(),
            start.elapsed().as_millis(),
            errors.len()
        );

        Ok(AggregationResult {
            success: true,
            total: records.len(),
            records,
            section_totals,
            errors,
        })
    }

    async fn run_extractors(
        &self,
        doc: &ParsedDocument,
        source: &SourceConfig,
        extractors: &[Arc<dyn Extractor>],
        include_details: bool,
        failures: &Mutex<Vec<SourceFailure>>,
    ) -> Vec<Record> {
        let resolver = UrlResolver::new(&source.base);
        let mut records = Vec::new();

        let (fast, rest): (Vec<_>, Vec<_>) =
            extractors.iter().partition(|extractor| extractor.fast_path());

        // The designated fast-path strategy lands its records ahead of the
        // slower panel; merge correctness does not depend on this ordering.
        for extractor in &fast {
            match self
                .run_one(extractor.as_ref(), doc, &resolver, source, include_details)
                .await
            {
                Ok(extracted) => records.extend(extracted),
                Err(err) => {
                    warn!(
                        "Extractor '{}' failed for '{}': {}",
                        extractor.name(),
                        source.id,
                        err
                    );
                    push_failure(
                        failures,
                        &source.id,
                        &format!("{}: {}", extractor.name(), err),
                    );
                }
            }
        }

        let results = join_all(rest.iter().map(|extractor| {
            self.run_one(extractor.as_ref(), doc, &resolver, source, include_details)
        }))
        .await;

        for (extractor, result) in rest.iter().zip(results) {
            match result {
                Ok(extracted) => records.extend(extracted),
                Err(err) => {
                    warn!(
                        "Extractor '{}' failed for '{}': {}",
                        extractor.name(),
                        source.id,
                        err
                    );
                    push_failure(
                        failures,
                        &source.id,
                        &format!("{}: {}", extractor.name(), err),
                    );
                }
            }
        }

        records
    }

    async fn run_one(
        &self,
        extractor: &dyn Extractor,
        doc: &ParsedDocument,
        resolver: &UrlResolver,
        source: &SourceConfig,
        include_details: bool,
    ) -> Result<Vec<Record>, ExtractorError> {
        match timeout(
            self.extractor_timeout,
            extractor.extract(doc, resolver, &source.id, include_details),
        )
        .await
        {
            Ok(result) => result,
            // The losing future is dropped at the race; selector work
            // already in flight inside it is not interrupted.
            Err(_) => Err(ExtractorError::Timeout {
                timeout_ms: self.extractor_timeout.as_millis() as u64,
            }),
        }
    }
}

fn push_failure(failures: &Mutex<Vec<SourceFailure>>, source: &str, error: &str) {
    if let Ok(mut failures) = failures.lock() {
        failures.push(SourceFailure {
            source: source.to_string(),
            error: error.to_string(),
        });
    }
}

/// Drop keyless records, dedup first-wins, assign per-section indices
fn merge(combined: Vec<Record>) -> (Vec<Record>, BTreeMap<String, usize>) {
    let mut seen = HashSet::new();
    let mut deduped: Vec<Record> = Vec::new();
    for record in combined {
        let Some(key) = record.dedup_key() else {
            continue;
        };
        if seen.insert(key) {
            deduped.push(record);
        }
    }

    let mut counters: HashMap<String, u32> = HashMap::new();
    let mut section_totals = BTreeMap::new();
    for record in &mut deduped {
        let section = record.section_tag().to_string();
        let counter = counters.entry(section.clone()).or_insert(0);
        *counter += 1;
        record.index = Some(*counter);
        *section_totals.entry(section).or_insert(0) += 1;
    }

    (deduped, section_totals)
}
