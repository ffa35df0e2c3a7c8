//! Paginated category crawler
//!
//! For each category: optionally scrape the landing page, then walk numbered
//! listing pages until one of three conditions holds:
//!
//! 1. `max_pages` pages have been fetched
//! 2. `max_empty_pages` consecutive pages produced no new URL
//! 3. the first `fingerprint_size` links of a page equal those of the previous
//!    page, which is how sites that clamp out-of-range page numbers look
//!
//! Condition 3 is a heuristic: a site that repeats the same top stories on
//! adjacent pages will stop early. It is kept because clamped pagination
//! otherwise never terminates.
//!
//! A page that fails (4xx, exhausted retries, unreadable body) ends that page
//! only and counts as empty.

use super::{FrontierSource, JobSink, Offer, PageFetcher};
use crate::error::FrontierError;
use crate::types::CrawlJob;
use crate::utils::resolve_url;
use crate::Result;
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use url::Url;

/// Attributes that may carry an article link, in preference order
const LINK_ATTRIBUTES: [&str; 4] = ["data-io-canonical-url", "data-link", "data-url", "href"];

/// One category to crawl
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDefinition {
    /// Stable identifier, attached to emitted jobs
    pub slug: String,
    /// Display name
    pub name: String,
    /// Publisher's numeric/string id when listing URLs need it
    #[serde(default)]
    pub category_id: Option<String>,
    /// Landing page scraped before numbered pages
    #[serde(default)]
    pub landing_url: Option<String>,
    /// Listing page URL with a `{page}` placeholder (1-based)
    pub page_url_template: String,
}

impl CategoryDefinition {
    /// URL of numbered page `page`
    pub fn page_url(&self, page: u32) -> String {
        let url = self.page_url_template.replace("{page}", &page.to_string());
        match &self.category_id {
            Some(id) => url.replace("{id}", id),
            None => url,
        }
    }

    fn validate(&self) -> std::result::Result<Url, FrontierError> {
        if !self.page_url_template.contains("{page}") {
            return Err(FrontierError::InvalidCategory {
                slug: self.slug.clone(),
                reason: "page_url_template has no {page} placeholder".to_string(),
            });
        }
        let first = self.landing_url.clone().unwrap_or_else(|| self.page_url(1));
        Url::parse(&first).map_err(|e| FrontierError::InvalidCategory {
            slug: self.slug.clone(),
            reason: format!("invalid URL {first}: {e}"),
        })
    }
}

/// Termination limits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CategoryLimits {
    /// Numbered pages per category (`None` = unbounded)
    pub max_pages: Option<u32>,
    /// Consecutive pages without new URLs (`None` or `0` = disabled)
    pub max_empty_pages: Option<u32>,
    /// Links compared between adjacent pages (`0` = disabled)
    pub fingerprint_size: usize,
}

impl Default for CategoryLimits {
    fn default() -> Self {
        Self {
            max_pages: Some(50),
            max_empty_pages: Some(2),
            fingerprint_size: 5,
        }
    }
}

impl CategoryLimits {
    /// Empty-page guard actually applied
    ///
    /// With no page limit the guard falls back to one page so a category
    /// always terminates.
    fn empty_page_guard(&self) -> Option<u32> {
        match self.max_empty_pages.filter(|n| *n > 0) {
            Some(n) => Some(n),
            None if self.max_pages.is_none() => Some(1),
            None => None,
        }
    }
}

/// Category frontier source
pub struct CategorySource {
    categories: Vec<CategoryDefinition>,
    limits: CategoryLimits,
    article_pattern: Option<Regex>,
    fetcher: PageFetcher,
}

impl CategorySource {
    /// Crawler over `categories`
    pub fn new(categories: Vec<CategoryDefinition>, fetcher: PageFetcher) -> Self {
        Self {
            categories,
            limits: CategoryLimits::default(),
            article_pattern: None,
            fetcher,
        }
    }

    /// Replace the termination limits
    pub fn with_limits(mut self, limits: CategoryLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Only accept links whose absolute URL matches `pattern`
    pub fn with_article_pattern(mut self, pattern: Regex) -> Self {
        self.article_pattern = Some(pattern);
        self
    }

    async fn fetch_links(&self, url: &str, base: &Url) -> Option<Vec<String>> {
        match self.fetcher.get_text(url).await {
            Ok(body) => Some(extract_article_links(
                &body,
                base,
                self.article_pattern.as_ref(),
            )),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Category page failed, skipping page");
                None
            }
        }
    }

    async fn offer_links(
        &self,
        sink: &mut JobSink,
        category: &CategoryDefinition,
        page_url: &str,
        links: Vec<String>,
    ) -> Result<u32> {
        let mut new_urls = 0;
        for link in links {
            let job = CrawlJob {
                url: link,
                lastmod: None,
                source_locator: Some(page_url.to_string()),
                image_hint: None,
                category: Some(category.slug.clone()),
            };
            if sink.offer(job).await? == Offer::Emitted {
                new_urls += 1;
            }
        }
        Ok(new_urls)
    }

    async fn crawl_category(&self, sink: &mut JobSink, category: &CategoryDefinition) -> Result<()> {
        let base = category.validate()?;

        if let Some(landing) = &category.landing_url {
            if let Some(links) = self.fetch_links(landing, &base).await {
                let new_urls = self.offer_links(sink, category, landing, links).await?;
                tracing::debug!(category = %category.slug, new_urls, "Landing page scraped");
            }
        }

        let empty_guard = self.limits.empty_page_guard();
        let mut previous_fingerprint: Option<Vec<String>> = None;
        let mut empty_streak = 0u32;
        let mut page = 1u32;

        loop {
            if self.limits.max_pages.is_some_and(|max| page > max) {
                tracing::debug!(category = %category.slug, page, "Page limit reached");
                break;
            }

            let page_url = category.page_url(page);
            let links = self
                .fetch_links(&page_url, &base)
                .await
                .unwrap_or_default();

            if self.limits.fingerprint_size > 0 && !links.is_empty() {
                let size = self.limits.fingerprint_size.min(links.len());
                let fingerprint = links[..size].to_vec();
                if previous_fingerprint.as_ref() == Some(&fingerprint) {
                    tracing::info!(
                        category = %category.slug,
                        page,
                        "Page repeats the previous page, stopping category"
                    );
                    break;
                }
                previous_fingerprint = Some(fingerprint);
            }

            let new_urls = self.offer_links(sink, category, &page_url, links).await?;
            if new_urls == 0 {
                empty_streak += 1;
                if empty_guard.is_some_and(|guard| empty_streak >= guard) {
                    tracing::debug!(category = %category.slug, page, empty_streak, "Empty-page guard reached");
                    break;
                }
            } else {
                empty_streak = 0;
            }

            page += 1;
        }

        Ok(())
    }
}

#[async_trait]
impl FrontierSource for CategorySource {
    fn name(&self) -> &str {
        "category"
    }

    async fn produce(&mut self, sink: &mut JobSink) -> Result<()> {
        for category in &self.categories {
            tracing::info!(category = %category.slug, "Crawling category");
            match self.crawl_category(sink, category).await {
                Ok(()) => {}
                Err(crate::Error::Frontier(FrontierError::InvalidCategory { slug, reason })) => {
                    tracing::warn!(category = %slug, reason = %reason, "Skipping invalid category");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Extract article links from a listing page, in document order
///
/// Bodies shaped like `{"html": "..."}` (infinite-scroll endpoints) are
/// unwrapped first. Links must stay on the listing's host (ignoring `www.`)
/// and match `pattern` when one is given.
pub fn extract_article_links(body: &str, base: &Url, pattern: Option<&Regex>) -> Vec<String> {
    let html = unwrap_json_fragment(body);
    let document = Html::parse_document(html.as_deref().unwrap_or(body));
    let Ok(selector) = Selector::parse("a, [data-link], [data-url], [data-io-canonical-url]") else {
        return Vec::new();
    };

    let host = base.host_str().map(strip_www).unwrap_or_default().to_string();
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(&selector) {
        let attrs = element.value();
        let candidate = LINK_ATTRIBUTES
            .iter()
            .filter_map(|name| attrs.attr(name))
            .filter_map(|value| resolve_url(base, value))
            .find(|url| {
                url.host_str().map(strip_www) == Some(host.as_str())
                    && pattern.is_none_or(|re| re.is_match(url.as_str()))
            });

        if let Some(url) = candidate {
            let url = url.to_string();
            if seen.insert(url.clone()) {
                links.push(url);
            }
        }
    }

    links
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

fn unwrap_json_fragment(body: &str) -> Option<String> {
    let trimmed = body.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    ["html", "data", "content"]
        .iter()
        .find_map(|key| value.get(key).and_then(|v| v.as_str()).map(str::to_string))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://thanhnien.vn/thoi-su/phap-luat.htm").unwrap()
    }

    #[test]
    fn prefers_canonical_data_attribute_over_href() {
        let body = r#"
            <div class="box-category-item">
              <a data-io-canonical-url="/timeline-article-185000000000000003.htm" href="/redirect">x</a>
            </div>"#;
        assert_eq!(
            extract_article_links(body, &base(), None),
            vec!["https://thanhnien.vn/timeline-article-185000000000000003.htm"]
        );
    }

    #[test]
    fn keeps_same_host_matching_links_in_order_once() {
        let pattern = Regex::new(r"-\d{10,}\.htm$").unwrap();
        let body = r#"
            <a href="https://www.thanhnien.vn/b-185000000000000002.htm">b</a>
            <a href="/a-185000000000000001.htm">a</a>
            <a href="/b-185000000000000002.htm#comments">b again</a>
            <a href="/the-thao.htm">section</a>
            <a href="https://other.vn/c-185000000000000009.htm">offsite</a>
            <div data-link="/d-185000000000000004.htm"></div>"#;

        assert_eq!(
            extract_article_links(body, &base(), Some(&pattern)),
            vec![
                "https://www.thanhnien.vn/b-185000000000000002.htm",
                "https://thanhnien.vn/a-185000000000000001.htm",
                "https://thanhnien.vn/b-185000000000000002.htm",
                "https://thanhnien.vn/d-185000000000000004.htm",
            ]
        );
    }

    #[test]
    fn unwraps_json_wrapped_fragments() {
        let body = r#"{"html":"<a href=\"/x-1234567890.chn\">x</a>","page":2}"#;
        let base = Url::parse("https://kenh14.vn/timeline/2.chn").unwrap();
        assert_eq!(
            extract_article_links(body, &base, None),
            vec!["https://kenh14.vn/x-1234567890.chn"]
        );
    }

    #[test]
    fn page_url_fills_page_and_id() {
        let category = CategoryDefinition {
            slug: "phap-luat".to_string(),
            name: "Pháp luật".to_string(),
            category_id: Some("1855".to_string()),
            landing_url: None,
            page_url_template: "https://thanhnien.vn/timelinelist/{id}/{page}.htm".to_string(),
        };
        assert_eq!(category.page_url(3), "https://thanhnien.vn/timelinelist/1855/3.htm");
    }

    #[test]
    fn unbounded_pagination_still_has_an_empty_guard() {
        let limits = CategoryLimits {
            max_pages: None,
            max_empty_pages: None,
            fingerprint_size: 0,
        };
        assert_eq!(limits.empty_page_guard(), Some(1));

        let bounded = CategoryLimits {
            max_pages: Some(3),
            max_empty_pages: Some(0),
            fingerprint_size: 0,
        };
        assert_eq!(bounded.empty_page_guard(), None);
    }
}
