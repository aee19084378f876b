// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Core types for feed aggregation

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single extracted listing record
///
/// Records are an open bag of attributes: the fields every section strategy
/// produces are typed here, anything strategy-specific rides along in
/// `extra`. The only contract is that a content key and a section are
/// derivable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Record {
    /// 1-based position within its section, assigned after the final merge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Display title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Absolute link to the detail page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    /// Absolute poster/cover image URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Section tag (e.g. "trending", "slider")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Symbolic id of the source the record came from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Latest episode number as displayed by the source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<String>,
    /// Original-language title when the source exposes one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_title: Option<String>,
    /// Short synopsis, where the section carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Subtitled episode count from the detail page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_count: Option<u32>,
    /// Dubbed episode count from the detail page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dub_count: Option<u32>,
    /// Strategy-specific attributes
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Section tag used when a record carries none
pub const UNKNOWN_SECTION: &str = "unknown";

impl Record {
    /// Lowercased content identity: the first non-empty of href, title, image
    ///
    /// A record with none of the three has no identity and is dropped before
    /// deduplication.
    pub fn content_key(&self) -> Option<String> {
        [&self.href, &self.title, &self.image]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
    }

    /// Section tag, defaulting to [`UNKNOWN_SECTION`]
    pub fn section_tag(&self) -> &str {
        self.section.as_deref().unwrap_or(UNKNOWN_SECTION)
    }

    /// Full deduplication key: content key scoped by section
    pub fn dedup_key(&self) -> Option<String> {
        self.content_key()
            .map(|key| format!("{}::{}", key, self.section_tag()))
    }
}

/// A source or extractor failure carried alongside partial data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFailure {
    /// Symbolic id of the failing source
    pub source: String,
    /// Human-readable failure description
    pub error: String,
}

/// The merged output of one aggregation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    /// False only for structural failures, never for partial ones
    pub success: bool,
    /// Deduplicated records with per-section indices assigned
    pub records: Vec<Record>,
    /// Number of surviving records
    pub total: usize,
    /// Record count per section over the final set
    pub section_totals: BTreeMap<String, usize>,
    /// Sources and extractors that failed; empty on a clean run
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<SourceFailure>,
}

/// Aggregation-level failures that reach the caller
#[derive(Debug, Error)]
pub enum AggregateError {
    /// The orchestrator was invoked with no sources
    #[error("no sources configured")]
    NoSources,

    /// Every source failed and there is nothing to merge
    #[error("all {} sources failed", errors.len())]
    AllSourcesFailed {
        /// Per-source failure details
        errors: Vec<SourceFailure>,
    },
}
