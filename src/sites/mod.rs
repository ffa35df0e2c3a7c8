//! Supported publishers
//!
//! A closed table: each [`SiteDefinition`] names how its crawl jobs are
//! discovered ([`FrontierKind`]) and which parser reads its pages. Category
//! catalogues carry the publisher's timeline ids; a JSON file of
//! [`CategoryDefinition`]s replaces the built-in catalogue when ids change.

mod parser;

pub use parser::{ArticleParser, GenericArticleParser};

use crate::config::{Config, DEFAULT_USER_AGENT};
use crate::frontier::{
    CategoryDefinition, CategoryLimits, CategorySource, FrontierSource, NdjsonSource, PageFetcher,
    SitemapLimits, SitemapSource,
};
use crate::{Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One entry of a built-in category catalogue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CategorySeed {
    /// Slug attached to emitted jobs
    pub slug: &'static str,
    /// Display name
    pub name: &'static str,
    /// Publisher timeline id
    pub id: &'static str,
}

/// How a site's crawl jobs are discovered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrontierKind {
    /// Walk a sitemap index
    Sitemap {
        /// Root sitemap URL
        root: &'static str,
        /// Child sitemaps must contain one of these substrings
        allow: &'static [&'static str],
    },
    /// Page through category timelines
    Categories {
        /// Built-in catalogue
        catalogue: &'static [CategorySeed],
        /// Listing URL with `{id}` and `{page}` placeholders
        page_url_template: &'static str,
        /// Site root; landing pages are `<base_url>/<slug>.htm`
        base_url: &'static str,
        /// Absolute article URLs match this
        article_pattern: &'static str,
    },
}

/// Parser used for a site's pages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserKind {
    /// [`GenericArticleParser`]
    Generic,
}

/// A supported publisher
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SiteDefinition {
    /// Stable identifier, stored with every article
    pub slug: &'static str,
    /// User agent sent when the configuration keeps the default
    pub user_agent: &'static str,
    /// Job discovery
    pub frontier: FrontierKind,
    /// Page parser
    pub parser: ParserKind,
}

const THANHNIEN_CATEGORIES: &[CategorySeed] = &[
    CategorySeed { slug: "thoi-su", name: "Thời sự", id: "185227" },
    CategorySeed { slug: "the-gioi", name: "Thế giới", id: "185228" },
    CategorySeed { slug: "kinh-te", name: "Kinh tế", id: "185229" },
    CategorySeed { slug: "doi-song", name: "Đời sống", id: "185230" },
    CategorySeed { slug: "the-thao", name: "Thể thao", id: "185237" },
];

const NLD_CATEGORIES: &[CategorySeed] = &[
    CategorySeed { slug: "thoi-su", name: "Thời sự", id: "1961206" },
    CategorySeed { slug: "quoc-te", name: "Quốc tế", id: "1961207" },
    CategorySeed { slug: "kinh-te", name: "Kinh tế", id: "1961208" },
    CategorySeed { slug: "phap-luat", name: "Pháp luật", id: "1961209" },
];

const KENH14_CATEGORIES: &[CategorySeed] = &[
    CategorySeed { slug: "star", name: "Star", id: "215" },
    CategorySeed { slug: "cine", name: "Ciné", id: "216" },
    CategorySeed { slug: "musik", name: "Musik", id: "217" },
    CategorySeed { slug: "sport", name: "Sport", id: "223" },
];

const SITES: &[SiteDefinition] = &[
    SiteDefinition {
        slug: "kenh14",
        user_agent: "kenh14-ingestor/1.0",
        frontier: FrontierKind::Categories {
            catalogue: KENH14_CATEGORIES,
            page_url_template: "https://kenh14.vn/timeline/laytinmoitronglist-{page}-2-1-1-1-1-{id}-0-0-0-0.chn",
            base_url: "https://kenh14.vn",
            article_pattern: r"^https://kenh14\.vn/[a-z0-9-]+-\d+\.chn$",
        },
        parser: ParserKind::Generic,
    },
    SiteDefinition {
        slug: "nld",
        user_agent: "nld-ingestor/1.0",
        frontier: FrontierKind::Categories {
            catalogue: NLD_CATEGORIES,
            page_url_template: "https://nld.com.vn/timelinelist/{id}/{page}.htm",
            base_url: "https://nld.com.vn",
            article_pattern: r"^https://nld\.com\.vn/[a-z0-9-]+-\d+\.htm$",
        },
        parser: ParserKind::Generic,
    },
    SiteDefinition {
        slug: "thanhnien",
        user_agent: "thanhnien-ingestor/1.0",
        frontier: FrontierKind::Categories {
            catalogue: THANHNIEN_CATEGORIES,
            page_url_template: "https://thanhnien.vn/timelinelist/{id}/{page}.htm",
            base_url: "https://thanhnien.vn",
            article_pattern: r"^https://thanhnien\.vn/[a-z0-9-]+-\d+\.htm$",
        },
        parser: ParserKind::Generic,
    },
    SiteDefinition {
        slug: "znews",
        user_agent: "znews-ingestor/1.0",
        frontier: FrontierKind::Sitemap {
            root: "https://znews.vn/sitemap/sitemap.xml",
            allow: &["sitemap-article"],
        },
        parser: ParserKind::Generic,
    },
];

/// Site by slug
pub fn get_site(slug: &str) -> Result<&'static SiteDefinition> {
    SITES.iter().find(|site| site.slug == slug).ok_or_else(|| {
        Error::NotFound(format!(
            "unknown site '{slug}' (supported: {})",
            list_sites().join(", ")
        ))
    })
}

/// Supported slugs, sorted
pub fn list_sites() -> Vec<&'static str> {
    SITES.iter().map(|site| site.slug).collect()
}

impl SiteDefinition {
    /// Where the crawl log of emitted jobs goes by default
    pub fn default_jobs_file(&self) -> PathBuf {
        PathBuf::from("data").join(format!("{}_jobs.ndjson", self.slug))
    }

    /// The configured user agent, or this site's when the default is kept
    pub fn user_agent<'a>(&'a self, config: &'a Config) -> &'a str {
        if config.user_agent == DEFAULT_USER_AGENT {
            self.user_agent
        } else {
            &config.user_agent
        }
    }

    /// Parser for this site's pages
    pub fn parser(&self) -> Arc<dyn ArticleParser> {
        match self.parser {
            ParserKind::Generic => Arc::new(GenericArticleParser),
        }
    }

    /// Built-in category catalogue (empty for sitemap sites)
    pub fn categories(&self) -> Vec<CategoryDefinition> {
        let FrontierKind::Categories {
            catalogue,
            page_url_template,
            base_url,
            ..
        } = self.frontier
        else {
            return Vec::new();
        };
        catalogue
            .iter()
            .map(|seed| CategoryDefinition {
                slug: seed.slug.to_string(),
                name: seed.name.to_string(),
                category_id: Some(seed.id.to_string()),
                landing_url: Some(format!("{base_url}/{}.htm", seed.slug)),
                page_url_template: page_url_template.to_string(),
            })
            .collect()
    }
}

/// Overrides for [`build_source`]
#[derive(Clone, Debug, Default)]
pub struct SourceOptions {
    /// Replay this NDJSON job log instead of crawling
    pub jobs_file: Option<PathBuf>,
    /// Replaces the built-in category catalogue
    pub categories: Option<Vec<CategoryDefinition>>,
    /// Only crawl these category slugs (empty = all)
    pub only_categories: Vec<String>,
}

/// Read a JSON array of category definitions
pub async fn load_categories(path: &Path) -> Result<Vec<CategoryDefinition>> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::config("categories", format!("failed to read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        Error::config("categories", format!("invalid category file {}: {e}", path.display()))
    })
}

/// Frontier source for one crawl of `site`
pub fn build_source(
    site: &SiteDefinition,
    config: &Config,
    client: reqwest::Client,
    options: &SourceOptions,
) -> Result<Box<dyn FrontierSource>> {
    if let Some(path) = &options.jobs_file {
        tracing::info!(site = site.slug, path = %path.display(), "Replaying job log");
        return Ok(Box::new(NdjsonSource::new(path)));
    }

    let frontier = &config.frontier;
    let fetcher = PageFetcher::new(client, frontier.fetch_retry.clone());

    match site.frontier {
        FrontierKind::Sitemap { root, allow } => {
            let allow = if frontier.sitemap_allow.is_empty() {
                allow.iter().map(|s| s.to_string()).collect()
            } else {
                frontier.sitemap_allow.clone()
            };
            Ok(Box::new(
                SitemapSource::new(root, fetcher)
                    .with_allow_list(allow)
                    .with_limits(SitemapLimits {
                        max_documents: frontier.sitemap_max_documents,
                        max_urls_per_document: frontier.sitemap_max_urls_per_document,
                    }),
            ))
        }
        FrontierKind::Categories { article_pattern, .. } => {
            let mut categories = options.categories.clone().unwrap_or_else(|| site.categories());
            if !options.only_categories.is_empty() {
                categories.retain(|c| options.only_categories.contains(&c.slug));
            }
            if categories.is_empty() {
                return Err(Error::config("categories", format!("no categories selected for {}", site.slug)));
            }
            let pattern = Regex::new(article_pattern)
                .map_err(|e| Error::Other(format!("invalid article pattern for {}: {e}", site.slug)))?;
            Ok(Box::new(
                CategorySource::new(categories, fetcher)
                    .with_article_pattern(pattern)
                    .with_limits(CategoryLimits {
                        max_pages: frontier.category_max_pages,
                        max_empty_pages: frontier.category_max_empty_pages,
                        fingerprint_size: frontier.category_fingerprint_size,
                    }),
            ))
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn table_lookup() {
        assert_eq!(list_sites(), vec!["kenh14", "nld", "thanhnien", "znews"]);
        assert_eq!(get_site("znews").unwrap().slug, "znews");
        let err = get_site("vnexpress").unwrap_err();
        assert!(err.to_string().contains("thanhnien"));
    }

    #[test]
    fn category_catalogue_expands_to_timeline_urls() {
        let site = get_site("thanhnien").unwrap();
        let categories = site.categories();
        let kinh_te = categories.iter().find(|c| c.slug == "kinh-te").unwrap();
        assert_eq!(kinh_te.page_url(3), "https://thanhnien.vn/timelinelist/185229/3.htm");
        assert_eq!(kinh_te.landing_url.as_deref(), Some("https://thanhnien.vn/kinh-te.htm"));

        let kenh14 = get_site("kenh14").unwrap().categories();
        assert_eq!(
            kenh14[0].page_url(2),
            "https://kenh14.vn/timeline/laytinmoitronglist-2-2-1-1-1-1-215-0-0-0-0.chn"
        );
        assert!(get_site("znews").unwrap().categories().is_empty());
    }

    #[test]
    fn user_agent_prefers_explicit_configuration() {
        let site = get_site("nld").unwrap();
        let mut config = Config::default();
        assert_eq!(site.user_agent(&config), "nld-ingestor/1.0");
        config.user_agent = "custom/2.0".to_string();
        assert_eq!(site.user_agent(&config), "custom/2.0");
        assert_eq!(site.default_jobs_file(), PathBuf::from("data/nld_jobs.ndjson"));
    }

    #[test]
    fn source_selection() {
        let config = Config::default();
        let client = reqwest::Client::new();

        let sitemap = build_source(get_site("znews").unwrap(), &config, client.clone(), &SourceOptions::default()).unwrap();
        assert_eq!(sitemap.name(), "sitemap");

        let replay = build_source(
            get_site("znews").unwrap(),
            &config,
            client.clone(),
            &SourceOptions {
                jobs_file: Some(PathBuf::from("jobs.ndjson")),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(replay.name(), "ndjson");

        let err = build_source(
            get_site("thanhnien").unwrap(),
            &config,
            client,
            &SourceOptions {
                only_categories: vec!["no-such-category".to_string()],
                ..Default::default()
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn category_file_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("categories.json");
        std::fs::write(
            &path,
            r#"[{"slug":"video","name":"Video","category_id":"9","page_url_template":"https://thanhnien.vn/timelinelist/{id}/{page}.htm"}]"#,
        )
        .unwrap();
        let categories = load_categories(&path).await.unwrap();
        assert_eq!(categories[0].page_url(1), "https://thanhnien.vn/timelinelist/9/1.htm");

        std::fs::write(&path, "not json").unwrap();
        assert!(load_categories(&path).await.is_err());
    }
}
