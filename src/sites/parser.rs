//! Generic article metadata parser
//!
//! Reads the fields most publishers expose the same way: `<h1>`/OpenGraph
//! title, the article body container, breadcrumb or `article:section`
//! category, `article:published_time`, tag links and the images and videos
//! inside the body in document order.

use crate::types::{ArticleCategory, AssetKind, AssetRef, ParsedArticle};
use crate::utils::resolve_url;
use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Body containers, most specific first
const BODY_SELECTORS: [&str; 5] = [
    "div.detail__content",
    "div.detail-content",
    "[itemprop=\"articleBody\"]",
    "article",
    "main",
];

/// Turns an article page into structured metadata
pub trait ArticleParser: Send + Sync {
    /// Parse `html` fetched from `url`
    ///
    /// Fails with [`Error::Parse`] when the title or body is missing.
    fn parse(&self, url: &str, html: &str) -> Result<ParsedArticle>;
}

/// Parser relying on OpenGraph tags and common body markup
#[derive(Clone, Debug, Default)]
pub struct GenericArticleParser;

impl ArticleParser for GenericArticleParser {
    fn parse(&self, url: &str, html: &str) -> Result<ParsedArticle> {
        let base = Url::parse(url).map_err(|e| parse_error(url, format!("invalid article URL: {e}")))?;
        let document = Html::parse_document(html);

        let title = first_text(&document, "h1")
            .or_else(|| meta_content(&document, "meta[property=\"og:title\"]"))
            .or_else(|| first_text(&document, "title"))
            .ok_or_else(|| parse_error(url, "article title not found"))?;

        let body = BODY_SELECTORS
            .iter()
            .filter_map(|css| select_first(&document, css))
            .next()
            .ok_or_else(|| parse_error(url, "article body not found"))?;

        let content = paragraphs(body).join("\n\n");
        if content.is_empty() {
            return Err(parse_error(url, "article body is empty"));
        }

        let description = meta_content(&document, "meta[property=\"og:description\"]")
            .or_else(|| meta_content(&document, "meta[name=\"description\"]"))
            .or_else(|| first_text(&document, "h2"));

        Ok(ParsedArticle {
            title,
            description,
            content,
            category: category(&document),
            publish_date: publish_date(&document),
            tags: tags(&document),
            assets: assets(body, &base),
        })
    }
}

fn parse_error(url: &str, reason: impl Into<String>) -> Error {
    Error::Parse {
        url: url.to_string(),
        reason: reason.into(),
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn select_first<'a>(document: &'a Html, css: &str) -> Option<ElementRef<'a>> {
    document.select(&selector(css)?).next()
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    select_first(document, css)
        .map(element_text)
        .filter(|text| !text.is_empty())
}

fn meta_content(document: &Html, css: &str) -> Option<String> {
    select_first(document, css)
        .and_then(|meta| meta.value().attr("content"))
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
}

fn paragraphs(body: ElementRef<'_>) -> Vec<String> {
    let Some(p) = selector("p") else {
        return Vec::new();
    };
    body.select(&p)
        .map(element_text)
        .filter(|text| !text.is_empty())
        .collect()
}

fn category(document: &Html) -> Option<ArticleCategory> {
    let from_breadcrumb = selector(".breadcrumb a, .detail-cate a, [itemprop=\"itemListElement\"] a")
        .and_then(|s| document.select(&s).map(element_text).filter(|t| !t.is_empty()).last());
    let name = from_breadcrumb.or_else(|| meta_content(document, "meta[property=\"article:section\"]"))?;
    let id = name.to_lowercase().split_whitespace().collect::<Vec<_>>().join("-");
    Some(ArticleCategory {
        id: Some(id),
        name: Some(name),
    })
}

fn publish_date(document: &Html) -> Option<DateTime<Utc>> {
    let raw = meta_content(document, "meta[property=\"article:published_time\"]")
        .or_else(|| meta_content(document, "meta[itemprop=\"datePublished\"]"))
        .or_else(|| {
            select_first(document, "time[datetime]")
                .and_then(|t| t.value().attr("datetime"))
                .map(str::to_string)
        })?;
    parse_timestamp(&raw)
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS` taken as UTC
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn tags(document: &Html) -> Vec<String> {
    let linked: Vec<String> = selector(".detail__tags a, .tags a, a[rel=\"tag\"]")
        .map(|s| document.select(&s).map(element_text).filter(|t| !t.is_empty()).collect())
        .unwrap_or_default();
    if !linked.is_empty() {
        return linked;
    }

    let meta_tags: Vec<String> = selector("meta[property=\"article:tag\"]")
        .map(|s| {
            document
                .select(&s)
                .filter_map(|m| m.value().attr("content"))
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if !meta_tags.is_empty() {
        return meta_tags;
    }

    meta_content(document, "meta[name=\"keywords\"]")
        .map(|keywords| {
            keywords
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Images and videos of the body in document order
///
/// One counter numbers both kinds, so a sequence identifies an asset within
/// its article.
fn assets(body: ElementRef<'_>, base: &Url) -> Vec<AssetRef> {
    let (Some(media), Some(source), Some(figcaption)) =
        (selector("img, video"), selector("source[src]"), selector("figcaption"))
    else {
        return Vec::new();
    };

    let mut assets: Vec<AssetRef> = Vec::new();
    for element in body.select(&media) {
        let (kind, raw) = match element.value().name() {
            "img" => (
                AssetKind::Image,
                element
                    .value()
                    .attr("data-src")
                    .or_else(|| element.value().attr("src")),
            ),
            _ => (
                AssetKind::Video,
                element
                    .value()
                    .attr("src")
                    .or_else(|| element.value().attr("data-src"))
                    .or_else(|| {
                        element
                            .select(&source)
                            .next()
                            .and_then(|s| s.value().attr("src"))
                    }),
            ),
        };
        let Some(url) = raw
            .filter(|r| !r.trim_start().starts_with("data:"))
            .and_then(|r| resolve_url(base, r))
        else {
            continue;
        };
        if assets.iter().any(|a| a.source_url == url.as_str()) {
            continue;
        }

        let caption = element
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|a| a.value().name() == "figure")
            .and_then(|figure| figure.select(&figcaption).next())
            .map(element_text)
            .filter(|c| !c.is_empty());

        let sequence = u32::try_from(assets.len() + 1).unwrap_or(u32::MAX);
        let mut asset = AssetRef::new(url.as_str(), kind, sequence);
        asset.caption = caption;
        assets.push(asset);
    }
    assets
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE: &str = r#"
        <html><head>
          <title>Fallback title</title>
          <meta property="og:description" content="Short summary">
          <meta property="article:published_time" content="2024-05-01T08:30:00+07:00">
          <meta name="keywords" content="kinh te, xuat khau">
        </head><body>
          <ul class="breadcrumb"><li><a href="/">Home</a></li><li><a href="/kinh-te.htm">Kinh Te</a></li></ul>
          <h1>  Export figures rise  </h1>
          <div class="detail__content">
            <p>First paragraph.</p>
            <figure><img data-src="/img/a.jpg" src="data:image/gif;base64,R0lG"><figcaption>Port of Hai Phong</figcaption></figure>
            <p>Second   paragraph.</p>
            <figure><video><source src="https://cdn.example.vn/v/clip.m3u8"></video></figure>
            <img src="https://cdn.example.vn/img/b.png">
            <img src="/img/a.jpg">
            <p></p>
          </div>
        </body></html>
    "#;

    #[test]
    fn extracts_fields_and_numbers_assets_in_document_order() {
        let parsed = GenericArticleParser
            .parse("https://news.example.vn/export-123.htm", ARTICLE)
            .unwrap();

        assert_eq!(parsed.title, "Export figures rise");
        assert_eq!(parsed.description.as_deref(), Some("Short summary"));
        assert_eq!(parsed.content, "First paragraph.\n\nSecond paragraph.");
        let category = parsed.category.unwrap();
        assert_eq!(category.name.as_deref(), Some("Kinh Te"));
        assert_eq!(category.id.as_deref(), Some("kinh-te"));
        assert_eq!(
            parsed.publish_date.unwrap().to_rfc3339(),
            "2024-05-01T01:30:00+00:00"
        );
        assert_eq!(parsed.tags, vec!["kinh te", "xuat khau"]);

        let assets: Vec<_> = parsed
            .assets
            .iter()
            .map(|a| (a.sequence, a.kind, a.source_url.as_str()))
            .collect();
        assert_eq!(
            assets,
            vec![
                (1, AssetKind::Image, "https://news.example.vn/img/a.jpg"),
                (2, AssetKind::Video, "https://cdn.example.vn/v/clip.m3u8"),
                (3, AssetKind::Image, "https://cdn.example.vn/img/b.png"),
            ]
        );
        assert_eq!(parsed.assets[0].caption.as_deref(), Some("Port of Hai Phong"));
        assert_eq!(parsed.assets[2].caption, None);
    }

    #[test]
    fn missing_body_is_a_parse_error() {
        let err = GenericArticleParser
            .parse("https://news.example.vn/a.htm", "<html><body><h1>Title</h1></body></html>")
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
    }

    #[test]
    fn missing_title_is_a_parse_error() {
        let err = GenericArticleParser
            .parse("https://news.example.vn/a.htm", "<html><body><article><p>Body</p></article></body></html>")
            .unwrap_err();
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn naive_timestamps_are_utc() {
        assert_eq!(
            parse_timestamp("2024-01-02 03:04:05").unwrap().to_rfc3339(),
            "2024-01-02T03:04:05+00:00"
        );
        assert!(parse_timestamp("yesterday").is_none());
    }
}
