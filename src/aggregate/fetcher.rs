// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Document fetching with response caching and origin politeness
//!
//! Retrieves remote HTML documents with a hard timeout, a response size cap
//! and a short-lived response cache that absorbs duplicate origin hits
//! within a burst window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL};
use reqwest::Client;
use scraper::Html;
use std::num::NonZeroU32;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheError, CacheManager, CacheNamespace};

use super::config::AggregateConfig;

/// Cache namespace holding raw response bodies keyed by URL
pub const RESPONSE_CACHE_NAMESPACE: &str = "http_responses";

/// Past this many cached bodies, expired entries are purged on insert
const RESPONSE_CACHE_PURGE_THRESHOLD: usize = 50;

/// Errors from a document fetch
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The request exceeded the hard fetch timeout
    #[error("timeout fetching {url}")]
    Timeout {
        /// URL that timed out
        url: String,
    },

    /// Non-2xx response status
    #[error("HTTP {status} for {url}")]
    Status {
        /// Response status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// The response body exceeded the configured size cap
    #[error("response for {url} exceeds {limit} bytes")]
    TooLarge {
        /// Requested URL
        url: String,
        /// Configured byte cap
        limit: usize,
    },

    /// Transport-level request failure
    #[error("HTTP error: {message}")]
    Http {
        /// Underlying error description
        message: String,
    },

    /// The URL could not be parsed at all
    #[error("invalid url: {url}")]
    InvalidUrl {
        /// Offending input
        url: String,
    },
}

/// A fetched document: the raw body plus the URL it came from
///
/// The body is kept as a string and parsed on demand — `scraper::Html` is
/// not `Send`, so the parsed tree must never cross an await point.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    /// URL the document was fetched from
    pub url: String,
    /// Raw HTML body
    pub body: String,
}

impl ParsedDocument {
    /// Parse the body into a queryable DOM
    pub fn dom(&self) -> Html {
        Html::parse_document(&self.body)
    }
}

/// Contract for retrieving remote documents
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Fetch a URL and return its document
    async fn fetch_and_load(&self, url: &str) -> Result<ParsedDocument, FetchError>;
}

/// Resolves possibly-relative links against a source's base URL
///
/// Resolution never fails: unresolvable input yields `None`, everything else
/// comes back as an absolute URL string.
#[derive(Debug, Clone)]
pub struct UrlResolver {
    base: Option<Url>,
    base_raw: String,
}

impl UrlResolver {
    /// Create a resolver for the given base URL
    pub fn new(base: &str) -> Self {
        Self {
            base: Url::parse(base).ok(),
            base_raw: base.trim_end_matches('/').to_string(),
        }
    }

    /// Resolve a raw link to an absolute URL
    pub fn resolve(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(base) = &self.base {
            if let Ok(resolved) = base.join(raw) {
                return Some(resolved.into());
            }
        }
        // Base missing or join refused: scheme-relative and path fallbacks
        if let Some(rest) = raw.strip_prefix("//") {
            return Some(format!("https://{}", rest));
        }
        if raw.starts_with('/') {
            return Some(format!("{}{}", self.base_raw, raw));
        }
        // Only pass through input that is already absolute
        Url::parse(raw).ok().map(String::from)
    }
}

/// HTTP-backed [`DocumentFetcher`]
pub struct HttpFetcher {
    client: Client,
    responses: Arc<CacheNamespace<String>>,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    max_response_bytes: usize,
}

impl HttpFetcher {
    /// Create a fetcher wired to the shared cache manager
    pub fn new(config: &AggregateConfig, cache: &CacheManager) -> Result<Self, CacheError> {
        let client = Client::builder()
            .timeout(config.fetch_timeout())
            .redirect(reqwest::redirect::Policy::limited(2))
            .user_agent("Mozilla/5.0 (compatible; AnifeedBot/1.0; +https://example.com/bot)")
            .default_headers(default_headers())
            .build()
            .expect("Failed to create HTTP client");

        let responses =
            cache.namespace::<String>(RESPONSE_CACHE_NAMESPACE, config.response_cache_ttl())?;

        let rate = NonZeroU32::new(config.fetch_rate_per_minute)
            .unwrap_or_else(|| NonZeroU32::new(60).expect("60 is non-zero"));
        let limiter = RateLimiter::direct(Quota::per_minute(rate));

        Ok(Self {
            client,
            responses,
            limiter,
            max_response_bytes: config.max_response_bytes,
        })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch_and_load(&self, url: &str) -> Result<ParsedDocument, FetchError> {
        if Url::parse(url).is_err() {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
            });
        }

        if let Some(body) = self.responses.get(url) {
            debug!("Response cache hit for {}", url);
            return Ok(ParsedDocument {
                url: url.to_string(),
                body,
            });
        }

        // Cache misses hit the origin; stay inside the outbound budget
        self.limiter.until_ready().await;

        debug!("Fetching {}", url);
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Http {
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.max_response_bytes {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_response_bytes,
                });
            }
        }

        let bytes = response.bytes().await.map_err(|e| FetchError::Http {
            message: e.to_string(),
        })?;
        if bytes.len() > self.max_response_bytes {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                limit: self.max_response_bytes,
            });
        }

        let body = String::from_utf8_lossy(&bytes).into_owned();
        self.responses.set(url, body.clone());
        if self.responses.len() > RESPONSE_CACHE_PURGE_THRESHOLD {
            self.responses.purge_expired();
        }

        info!("Fetched {} bytes from {}", body.len(), url);
        Ok(ParsedDocument {
            url: url.to_string(),
            body,
        })
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers
}
