//! Rule-driven section extraction
//!
//! One strategy type driven by data: an ordered list of item selectors, an
//! optional container gate keyed on heading text, and a shared
//! attribute-probing pass that covers the markup conventions every supported
//! listing page uses.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::utils::map_bounded;

use super::extractor::{Extractor, ExtractorError};
use super::fetcher::{DocumentFetcher, FetchError, ParsedDocument, UrlResolver};
use super::types::Record;

/// Restricts item selection to container blocks whose heading matches
#[derive(Debug, Clone)]
pub struct ContainerRule {
    /// Container selectors tried in order; the first that yields items wins
    pub selectors: Vec<String>,
    /// Where to read the container's heading text from
    pub heading_selectors: Vec<String>,
    /// Case-insensitive regex the heading must match
    pub heading_pattern: String,
}

/// Per-record detail page probing, applied when details are requested
#[derive(Debug, Clone)]
pub struct DetailRule {
    /// Selectors for the subtitled episode count on the detail page
    pub sub_selectors: Vec<String>,
    /// Selectors for the dubbed episode count on the detail page
    pub dub_selectors: Vec<String>,
    /// Detail pages fetched concurrently
    pub concurrency: usize,
}

impl DetailRule {
    /// The badge selectors shared by the supported listing layouts
    pub fn standard(concurrency: usize) -> Self {
        Self {
            sub_selectors: vec![".tick-item.tick-sub".to_string()],
            dub_selectors: vec![".tick-item.tick-dub".to_string()],
            concurrency,
        }
    }
}

/// Declarative description of one section of a listing page
#[derive(Debug, Clone)]
pub struct SectionRule {
    /// Section tag stamped on every extracted record
    pub section: String,
    /// Optional heading-gated container scope
    pub container: Option<ContainerRule>,
    /// Item selectors tried in order, accumulating until `max_items`
    pub item_selectors: Vec<String>,
    /// Stop after this many records; zero means no cap
    pub max_items: usize,
    /// Mark this section as the designated low-latency strategy
    pub fast_path: bool,
    /// Detail enrichment, if the section supports it
    pub detail: Option<DetailRule>,
}

impl SectionRule {
    /// A bare rule with just a section tag and item selectors
    pub fn new(section: &str, item_selectors: &[&str]) -> Self {
        Self {
            section: section.to_string(),
            container: None,
            item_selectors: item_selectors.iter().map(|s| s.to_string()).collect(),
            max_items: 0,
            fast_path: false,
            detail: None,
        }
    }
}

/// The built-in section rules covering the listing layouts the supported
/// site mirrors share
pub fn default_rules(detail_concurrency: usize) -> Vec<SectionRule> {
    vec![
        SectionRule {
            section: "slider".to_string(),
            container: None,
            item_selectors: vec![
                ".swiper-slide".to_string(),
                ".slider .item".to_string(),
                ".home-slider .slide".to_string(),
                ".featured-slider .item".to_string(),
            ],
            max_items: 8,
            fast_path: true,
            detail: None,
        },
        SectionRule {
            section: "trending".to_string(),
            container: None,
            item_selectors: vec![
                "#trending-home .swiper-slide.item-qtip".to_string(),
                ".trending-list .swiper-slide.item-qtip".to_string(),
                ".swiper-slide.item-qtip".to_string(),
            ],
            max_items: 8,
            fast_path: false,
            detail: Some(DetailRule::standard(detail_concurrency)),
        },
        SectionRule {
            section: "most_popular".to_string(),
            container: Some(ContainerRule {
                selectors: vec!["div.anif-block".to_string()],
                heading_selectors: vec![".anif-block-header".to_string()],
                heading_pattern: r"most\s*popular".to_string(),
            }),
            item_selectors: vec!["ul.ulclear > li".to_string(), ".anif-block-ul li".to_string()],
            max_items: 6,
            fast_path: false,
            detail: None,
        },
        SectionRule {
            section: "top_airing".to_string(),
            container: Some(ContainerRule {
                selectors: vec!["div.anif-block".to_string()],
                heading_selectors: vec![".anif-block-header".to_string()],
                heading_pattern: r"top\s*airing".to_string(),
            }),
            item_selectors: vec!["ul.ulclear > li".to_string(), ".anif-block-ul li".to_string()],
            max_items: 6,
            fast_path: false,
            detail: None,
        },
        SectionRule {
            section: "most_favorite".to_string(),
            container: Some(ContainerRule {
                selectors: vec!["div.anif-block".to_string()],
                heading_selectors: vec![".anif-block-header".to_string()],
                heading_pattern: r"most\s*favorite".to_string(),
            }),
            item_selectors: vec!["ul.ulclear > li".to_string(), ".anif-block-ul li".to_string()],
            max_items: 6,
            fast_path: false,
            detail: None,
        },
        SectionRule {
            section: "ongoing".to_string(),
            container: Some(ContainerRule {
                selectors: vec!["div.widget".to_string()],
                heading_selectors: vec![".widget-title".to_string()],
                heading_pattern: r"ongoing|hotnew".to_string(),
            }),
            item_selectors: vec![".link-list .item".to_string(), ".link-list a.name".to_string()],
            max_items: 60,
            fast_path: false,
            detail: None,
        },
    ]
}

/// [`Extractor`] that applies one [`SectionRule`] to a document
pub struct SectionExtractor {
    rule: SectionRule,
    fetcher: Option<Arc<dyn DocumentFetcher>>,
}

impl SectionExtractor {
    /// Create an extractor without detail-fetch capability
    pub fn new(rule: SectionRule) -> Self {
        Self {
            rule,
            fetcher: None,
        }
    }

    /// Create an extractor that can fetch detail pages for enrichment
    pub fn with_fetcher(rule: SectionRule, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        Self {
            rule,
            fetcher: Some(fetcher),
        }
    }

    fn at_capacity(&self, records: &[Record]) -> bool {
        self.rule.max_items > 0 && records.len() >= self.rule.max_items
    }

    fn collect(
        &self,
        dom: &Html,
        resolver: &UrlResolver,
        source: &str,
    ) -> Result<Vec<Record>, ExtractorError> {
        let mut records = Vec::new();

        match &self.rule.container {
            Some(container) => {
                let heading_re = RegexBuilder::new(&container.heading_pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|_| ExtractorError::Failed {
                        message: format!(
                            "invalid heading pattern '{}'",
                            container.heading_pattern
                        ),
                    })?;

                for container_sel in &container.selectors {
                    let selector = parse_selector(container_sel)?;
                    for block in dom.select(&selector) {
                        let heading_selectors: Vec<&str> = container
                            .heading_selectors
                            .iter()
                            .map(String::as_str)
                            .collect();
                        let heading = first_descendant(block, &heading_selectors)
                            .map(element_text)
                            .unwrap_or_default();
                        if !heading_re.is_match(&heading) {
                            continue;
                        }
                        self.collect_within(block, resolver, source, &mut records)?;
                    }
                    if !records.is_empty() {
                        break;
                    }
                }
            }
            None => {
                for item_sel in &self.rule.item_selectors {
                    let selector = parse_selector(item_sel)?;
                    for item in dom.select(&selector) {
                        if self.at_capacity(&records) {
                            break;
                        }
                        if let Some(record) = self.record_from_item(item, resolver, source) {
                            records.push(record);
                        }
                    }
                    if self.at_capacity(&records) {
                        break;
                    }
                }
            }
        }

        Ok(records)
    }

    fn collect_within(
        &self,
        scope: ElementRef<'_>,
        resolver: &UrlResolver,
        source: &str,
        records: &mut Vec<Record>,
    ) -> Result<(), ExtractorError> {
        let before = records.len();
        for item_sel in &self.rule.item_selectors {
            let selector = parse_selector(item_sel)?;
            for item in scope.select(&selector) {
                if self.at_capacity(records) {
                    return Ok(());
                }
                if let Some(record) = self.record_from_item(item, resolver, source) {
                    records.push(record);
                }
            }
            // First item selector that matched anything in this block wins
            if records.len() > before {
                break;
            }
        }
        Ok(())
    }

    fn record_from_item(
        &self,
        item: ElementRef<'_>,
        resolver: &UrlResolver,
        source: &str,
    ) -> Option<Record> {
        let anchor = if item.value().name() == "a" {
            Some(item)
        } else {
            first_descendant(item, &anchor_selectors())
        };

        let href = anchor
            .and_then(|a| a.value().attr("href"))
            .and_then(|raw| resolver.resolve(raw));

        let title_node = first_descendant(item, &title_selectors());
        let title = anchor
            .and_then(|a| attr_probe(a, &["data-jtitle", "data-title", "title"]))
            .or_else(|| title_node.map(element_text).filter(|t| !t.is_empty()))
            .or_else(|| anchor.map(element_text).filter(|t| !t.is_empty()))
            .or_else(|| {
                first_descendant(item, &["img"])
                    .and_then(|img| attr_probe(img, &["alt"]))
            });

        // Nothing addressable or nameable: not a listing item
        if title.is_none() && href.is_none() {
            return None;
        }

        let alt_title = anchor
            .and_then(|a| attr_probe(a, &["data-jname", "data-iname"]))
            .or_else(|| title_node.and_then(|n| attr_probe(n, &["data-jname"])))
            .or_else(|| {
                first_descendant(item, &["[data-jname]"])
                    .and_then(|n| attr_probe(n, &["data-jname"]))
            });

        let image = first_descendant(item, &["img"])
            .and_then(|img| attr_probe(img, &["data-src", "data-lazy", "src", "data-original"]))
            .or_else(|| {
                first_descendant(item, &[".film-poster"])
                    .and_then(|poster| attr_probe(poster, &["style"]))
                    .and_then(|style| style_background_url(&style))
            })
            .or_else(|| attr_probe(item, &["data-background", "data-image"]))
            .and_then(|raw| resolver.resolve(&raw));

        let episode = first_descendant(item, &["span.watch", ".status", ".tick-eps"])
            .map(element_text)
            .and_then(|text| first_number(&text));

        let sub_count = first_descendant(item, &[".tick-item.tick-sub"])
            .map(element_text)
            .and_then(|text| first_number(&text))
            .and_then(|n| n.parse().ok());
        let dub_count = first_descendant(item, &[".tick-item.tick-dub"])
            .map(element_text)
            .and_then(|text| first_number(&text))
            .and_then(|n| n.parse().ok());

        let description = first_descendant(
            item,
            &[".desi-description", ".description", ".synopsis", ".summary"],
        )
        .map(element_text)
        .filter(|t| !t.is_empty());

        let mut extra = serde_json::Map::new();
        if let Some(fdi) = first_descendant(item, &[".fdi-item", ".fd-infor .fdi-item"]) {
            if tv_re().is_match(&element_text(fdi)) {
                extra.insert("tv".to_string(), serde_json::Value::Bool(true));
            }
        }

        Some(Record {
            title,
            href,
            image,
            section: Some(self.rule.section.clone()),
            source: Some(source.to_string()),
            episode,
            alt_title,
            description,
            sub_count,
            dub_count,
            extra,
            ..Record::default()
        })
    }

    /// Fetch each record's detail page and fill in missing episode counts
    async fn enrich(&self, records: &mut [Record]) {
        let (Some(detail), Some(fetcher)) = (&self.rule.detail, &self.fetcher) else {
            return;
        };

        let targets: Vec<(usize, String)> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.sub_count.is_none() || r.dub_count.is_none())
            .filter_map(|(i, r)| r.href.clone().map(|href| (i, href)))
            .collect();
        if targets.is_empty() {
            return;
        }

        debug!(
            "Enriching {} '{}' records from detail pages",
            targets.len(),
            self.rule.section
        );

        let counts = map_bounded(targets, detail.concurrency, |(i, href), _| {
            let fetcher = Arc::clone(fetcher);
            let detail = detail.clone();
            async move {
                let doc = fetcher.fetch_and_load(&href).await?;
                let (sub, dub) = {
                    let dom = doc.dom();
                    (
                        probe_count(&dom, &detail.sub_selectors),
                        probe_count(&dom, &detail.dub_selectors),
                    )
                };
                Ok::<_, FetchError>((i, sub, dub))
            }
        })
        .await;

        for (i, sub, dub) in counts.into_iter().flatten() {
            if let Some(record) = records.get_mut(i) {
                if record.sub_count.is_none() {
                    record.sub_count = sub;
                }
                if record.dub_count.is_none() {
                    record.dub_count = dub;
                }
            }
        }
    }
}

#[async_trait]
impl Extractor for SectionExtractor {
    async fn extract(
        &self,
        doc: &ParsedDocument,
        resolver: &UrlResolver,
        source: &str,
        include_details: bool,
    ) -> Result<Vec<Record>, ExtractorError> {
        // Parse inside a block so the non-Send DOM never crosses an await
        let mut records = {
            let dom = doc.dom();
            self.collect(&dom, resolver, source)?
        };

        if include_details {
            self.enrich(&mut records).await;
        }

        debug!(
            "Section '{}' extracted {} records from {}",
            self.rule.section,
            records.len(),
            doc.url
        );
        Ok(records)
    }

    fn name(&self) -> &str {
        &self.rule.section
    }

    fn fast_path(&self) -> bool {
        self.rule.fast_path
    }
}

fn anchor_selectors() -> [&'static str; 4] {
    ["h3.film-name a", "a.film-poster", "a.name", "a"]
}

fn title_selectors() -> [&'static str; 6] {
    [
        ".desi-head-title",
        ".film-title",
        "h3.film-name",
        ".title",
        ".name",
        "h3",
    ]
}

fn parse_selector(raw: &str) -> Result<Selector, ExtractorError> {
    Selector::parse(raw).map_err(|_| ExtractorError::Selector {
        selector: raw.to_string(),
    })
}

fn first_descendant<'a>(scope: ElementRef<'a>, selectors: &[&str]) -> Option<ElementRef<'a>> {
    for raw in selectors {
        if let Ok(selector) = Selector::parse(raw) {
            if let Some(element) = scope.select(&selector).next() {
                return Some(element);
            }
        }
    }
    None
}

fn attr_probe(element: ElementRef<'_>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| element.value().attr(name))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(String::from)
}

/// Collapse an element's text into single-spaced trimmed prose
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_number(text: &str) -> Option<String> {
    static NUMBER_RE: OnceLock<Regex> = OnceLock::new();
    let re = NUMBER_RE.get_or_init(|| Regex::new(r"\d{1,4}").expect("static pattern"));
    re.find(text).map(|m| m.as_str().to_string())
}

fn style_background_url(style: &str) -> Option<String> {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    let re = URL_RE.get_or_init(|| Regex::new(r#"url\(['"]?(.*?)['"]?\)"#).expect("static pattern"));
    re.captures(style)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|url| !url.is_empty())
}

fn tv_re() -> &'static Regex {
    static TV_RE: OnceLock<Regex> = OnceLock::new();
    TV_RE.get_or_init(|| Regex::new(r"\bTV\b").expect("static pattern"))
}

fn probe_count(dom: &Html, selectors: &[String]) -> Option<u32> {
    for raw in selectors {
        if let Ok(selector) = Selector::parse(raw) {
            if let Some(element) = dom.select(&selector).next() {
                if let Some(number) = first_number(&element_text(element)) {
                    return number.parse().ok();
                }
            }
        }
    }
    None
}
