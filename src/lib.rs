// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod aggregate;
pub mod cache;
pub mod utils;

// Re-export the caller-facing surface
pub use aggregate::{
    AggregateConfig, AggregateError, AggregationResult, DocumentFetcher, Extractor, FeedAggregator,
    HttpFetcher, Orchestrator, Record, SectionExtractor, SectionRule, SnapshotSupervisor,
    SourceConfig, SupervisorResponse,
};
pub use cache::{CacheError, CacheManager, CacheNamespace};
pub use utils::map_bounded;
