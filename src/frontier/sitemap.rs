//! Sitemap index walker
//!
//! Fetches a root sitemap, descends into child documents (optionally filtered
//! by an allow-list of URL substrings) and emits one job per `<url>` entry with
//! its `lastmod` and first `image:loc`. A root that is already a `<urlset>` is
//! processed as a single document.
//!
//! Failures on child documents are logged and skipped; only a failure on the
//! root aborts the walk.

use super::{FrontierSource, JobSink, PageFetcher};
use crate::error::FrontierError;
use crate::types::CrawlJob;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::{HashSet, VecDeque};

/// Walk limits; `None` or `0` means unbounded
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SitemapLimits {
    /// Child documents fetched
    pub max_documents: Option<usize>,
    /// `<url>` entries read from each document
    pub max_urls_per_document: Option<usize>,
}

impl SitemapLimits {
    fn documents(&self) -> Option<usize> {
        self.max_documents.filter(|n| *n > 0)
    }

    fn urls_per_document(&self) -> Option<usize> {
        self.max_urls_per_document.filter(|n| *n > 0)
    }
}

/// One `<url>` entry
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SitemapEntry {
    /// `<loc>`
    pub loc: String,
    /// `<lastmod>`, as written
    pub lastmod: Option<String>,
    /// First `<image:image><image:loc>`
    pub image: Option<String>,
}

/// Parsed sitemap document
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SitemapDocument {
    /// `<sitemapindex>` with child sitemap locations
    Index(Vec<String>),
    /// `<urlset>` with article entries
    UrlSet(Vec<SitemapEntry>),
}

/// Sitemap frontier source
pub struct SitemapSource {
    root: String,
    allow: Vec<String>,
    limits: SitemapLimits,
    fetcher: PageFetcher,
}

impl SitemapSource {
    /// Walker starting at `root`
    pub fn new(root: impl Into<String>, fetcher: PageFetcher) -> Self {
        Self {
            root: root.into(),
            allow: Vec::new(),
            limits: SitemapLimits::default(),
            fetcher,
        }
    }

    /// Only descend into child sitemaps containing one of these substrings
    pub fn with_allow_list(mut self, allow: Vec<String>) -> Self {
        self.allow = allow;
        self
    }

    /// Apply document and per-document URL limits
    pub fn with_limits(mut self, limits: SitemapLimits) -> Self {
        self.limits = limits;
        self
    }

    fn allowed(&self, loc: &str) -> bool {
        self.allow.is_empty() || self.allow.iter().any(|needle| loc.contains(needle.as_str()))
    }

    async fn fetch_document(&self, locator: &str) -> Result<SitemapDocument> {
        let body = self.fetcher.get_text(locator).await?;
        Ok(parse_sitemap(&body, locator)?)
    }

    async fn emit_entries(
        &self,
        sink: &mut JobSink,
        locator: &str,
        entries: Vec<SitemapEntry>,
    ) -> Result<()> {
        let limit = self.limits.urls_per_document().unwrap_or(usize::MAX);
        for entry in entries.into_iter().take(limit) {
            let Some(url) = join_loc(locator, &entry.loc).and_then(|loc| normalize_sitemap_url(&loc)) else {
                sink.reject_invalid();
                continue;
            };
            let image_hint = entry
                .image
                .as_deref()
                .and_then(|image| join_loc(&url, image))
                .and_then(|image| normalize_sitemap_url(&image));
            let job = CrawlJob {
                url,
                lastmod: entry.lastmod.as_deref().and_then(normalize_lastmod),
                source_locator: Some(locator.to_string()),
                image_hint,
                category: None,
            };
            sink.offer(job).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FrontierSource for SitemapSource {
    fn name(&self) -> &str {
        "sitemap"
    }

    async fn produce(&mut self, sink: &mut JobSink) -> Result<()> {
        let root = self.root.clone();
        let children = match self.fetch_document(&root).await? {
            SitemapDocument::UrlSet(entries) => {
                return self.emit_entries(sink, &root, entries).await;
            }
            SitemapDocument::Index(children) => children
                .iter()
                .filter_map(|child| join_loc(&root, child))
                .collect::<Vec<_>>(),
        };

        let mut queue: VecDeque<String> = children.into_iter().collect();
        let mut visited: HashSet<String> = HashSet::from([root.clone()]);
        let max_documents = self.limits.documents().unwrap_or(usize::MAX);
        let mut documents = 0usize;

        while let Some(locator) = queue.pop_front() {
            if documents >= max_documents {
                tracing::info!(max_documents, "Sitemap document limit reached");
                break;
            }
            if !visited.insert(locator.clone()) {
                continue;
            }
            if !self.allowed(&locator) {
                tracing::debug!(sitemap = %locator, "Sitemap not in allow-list, skipping");
                continue;
            }
            documents += 1;

            match self.fetch_document(&locator).await {
                Ok(SitemapDocument::UrlSet(entries)) => {
                    tracing::debug!(sitemap = %locator, entries = entries.len(), "Processing sitemap");
                    self.emit_entries(sink, &locator, entries).await?;
                }
                Ok(SitemapDocument::Index(nested)) => {
                    tracing::debug!(sitemap = %locator, children = nested.len(), "Descending into nested index");
                    queue.extend(nested.iter().filter_map(|child| join_loc(&locator, child)));
                }
                Err(e) => {
                    tracing::warn!(sitemap = %locator, error = %e, "Failed to process sitemap, skipping");
                }
            }
        }

        Ok(())
    }
}

/// Parse a sitemap index or urlset
pub fn parse_sitemap(xml: &str, locator: &str) -> std::result::Result<SitemapDocument, FrontierError> {
    let invalid = |reason: String| FrontierError::InvalidXml {
        url: locator.to_string(),
        reason,
    };

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut root: Option<String> = None;
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut children = Vec::new();
    let mut entries = Vec::new();
    let mut current: Option<SitemapEntry> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_lowercase();
                if root.is_none() {
                    root = Some(name.clone());
                }
                if name == "url" {
                    current = Some(SitemapEntry::default());
                }
                stack.push(name);
                text.clear();
            }
            Ok(Event::Text(t)) => {
                let raw = std::str::from_utf8(t.as_ref()).map_err(|e| invalid(e.to_string()))?;
                let unescaped =
                    quick_xml::escape::unescape(raw).map_err(|e| invalid(e.to_string()))?;
                text.push_str(&unescaped);
            }
            Ok(Event::CData(c)) => {
                text.push_str(&String::from_utf8_lossy(c.as_ref()));
            }
            Ok(Event::GeneralRef(r)) => {
                let name = std::str::from_utf8(r.as_ref()).map_err(|e| invalid(e.to_string()))?;
                let entity = format!("&{name};");
                let resolved = quick_xml::escape::unescape(&entity).map_err(|e| invalid(e.to_string()))?;
                text.push_str(&resolved);
            }
            Ok(Event::End(_)) => {
                let name = stack.pop().unwrap_or_default();
                let parent = stack.last().map(String::as_str);
                let value = text.trim().to_string();
                text.clear();

                match (name.as_str(), parent) {
                    ("loc", Some("sitemap")) if !value.is_empty() => children.push(value),
                    ("loc", Some("url")) => {
                        if let Some(entry) = current.as_mut() {
                            entry.loc = value;
                        }
                    }
                    ("lastmod", Some("url")) if !value.is_empty() => {
                        if let Some(entry) = current.as_mut() {
                            entry.lastmod = Some(value);
                        }
                    }
                    ("loc", Some("image")) if !value.is_empty() => {
                        if let Some(entry) = current.as_mut()
                            && entry.image.is_none()
                        {
                            entry.image = Some(value);
                        }
                    }
                    ("url", _) => {
                        if let Some(entry) = current.take() {
                            entries.push(entry);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(invalid(e.to_string())),
            _ => {}
        }
    }

    match root.as_deref() {
        Some("sitemapindex") => Ok(SitemapDocument::Index(children)),
        Some("urlset") => Ok(SitemapDocument::UrlSet(entries)),
        other => Err(FrontierError::NotASitemap {
            url: locator.to_string(),
            root: other.unwrap_or("none").to_string(),
        }),
    }
}

/// Resolve a possibly relative `<loc>` against the document it appeared in
///
/// Empty locations and ones containing whitespace are rejected. A base that
/// is not a URL (a bare file path) leaves `loc` as written.
pub fn join_loc(base: &str, loc: &str) -> Option<String> {
    let loc = loc.trim();
    if loc.is_empty() || loc.contains(char::is_whitespace) {
        return None;
    }
    Some(match url::Url::parse(base).and_then(|base| base.join(loc)) {
        Ok(joined) => joined.into(),
        Err(_) => loc.to_string(),
    })
}

/// Normalise a sitemap `<loc>`
///
/// Forces `https`, lowercases the host, defaults the path to `/` and strips
/// query and fragment.
pub fn normalize_sitemap_url(raw: &str) -> Option<String> {
    let canonical = crate::utils::canonicalize_url(raw)?;
    let mut url = url::Url::parse(&canonical).ok()?;
    if url.scheme() == "http" {
        url.set_scheme("https").ok()?;
    }
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

/// Normalise a `lastmod` value to RFC 3339
///
/// Accepts RFC 3339, RFC 2822, W3C minute precision, naive date-times (taken
/// as UTC) and bare dates. Anything else yields `None`.
pub fn normalize_lastmod(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.to_rfc3339());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.to_rfc3339());
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M%:z") {
        return Some(dt.to_rfc3339());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
    {
        return Some(naive.and_utc().to_rfc3339());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc).to_rfc3339());
    }
    None
}
