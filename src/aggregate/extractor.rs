// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Extraction strategy trait definition

use async_trait::async_trait;
use thiserror::Error;

use super::fetcher::{FetchError, ParsedDocument, UrlResolver};
use super::types::Record;

/// Errors from a single extraction strategy
#[derive(Debug, Error)]
pub enum ExtractorError {
    /// The strategy ran past its soft timeout
    #[error("extractor timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A detail fetch inside the strategy failed
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A configured CSS selector does not parse
    #[error("invalid selector: {selector}")]
    Selector {
        /// Offending selector string
        selector: String,
    },

    /// Anything else the strategy reports
    #[error("extractor failed: {message}")]
    Failed {
        /// Failure description
        message: String,
    },
}

/// Trait for implementing section extraction strategies
///
/// Strategies convert a fetched document into zero or more records. The
/// orchestrator runs every registered strategy over every source document,
/// isolates failures and merges whatever was produced; a strategy never has
/// to care about its siblings.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract records from a document
    ///
    /// # Arguments
    /// * `doc` - The fetched document
    /// * `resolver` - Resolves the document's relative links
    /// * `source` - Symbolic id of the originating source
    /// * `include_details` - Whether to spend extra fetches on per-record detail
    async fn extract(
        &self,
        doc: &ParsedDocument,
        resolver: &UrlResolver,
        source: &str,
        include_details: bool,
    ) -> Result<Vec<Record>, ExtractorError>;

    /// Strategy name for logging and failure entries
    fn name(&self) -> &str;

    /// Whether this strategy is the designated low-latency one
    ///
    /// The orchestrator may run a fast-path strategy ahead of the rest as a
    /// latency optimization; merge correctness never depends on it.
    fn fast_path(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockExtractor {
        records: usize,
    }

    #[async_trait]
    impl Extractor for MockExtractor {
        async fn extract(
            &self,
            _doc: &ParsedDocument,
            _resolver: &UrlResolver,
            source: &str,
            _include_details: bool,
        ) -> Result<Vec<Record>, ExtractorError> {
            Ok((0..self.records)
                .map(|i| Record {
                    title: Some(format!("title-{}", i)),
                    source: Some(source.to_string()),
                    ..Record::default()
                })
                .collect())
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    #[tokio::test]
    async fn test_mock_extractor() {
        let extractor = MockExtractor { records: 2 };
        let doc = ParsedDocument {
            url: "https://example.com".to_string(),
            body: String::new(),
        };
        let resolver = UrlResolver::new("https://example.com");

        let records = extractor
            .extract(&doc, &resolver, "alpha", false)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_default_fast_path_is_false() {
        let extractor = MockExtractor { records: 0 };
        assert!(!extractor.fast_path());
    }

    #[test]
    fn test_extractor_error_display() {
        let err = ExtractorError::Timeout { timeout_ms: 3000 };
        assert!(err.to_string().contains("3000"));

        let err = ExtractorError::Selector {
            selector: "div[".to_string(),
        };
        assert!(err.to_string().contains("div["));
    }
}
