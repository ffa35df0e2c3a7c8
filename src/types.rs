//! Core types for news-ingest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a stored article
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArticleId(pub i64);

impl ArticleId {
    /// Create a new ArticleId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for ArticleId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<ArticleId> for i64 {
    fn from(id: ArticleId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ArticleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ArticleId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl sqlx::Type<sqlx::Sqlite> for ArticleId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ArticleId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ArticleId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// One unit of frontier output: an article URL to fetch
///
/// The serialized form is the NDJSON job log line
/// (`{url, lastmod?, sitemap_url?, image_url?}`), so jobs written by one
/// run can be replayed by another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlJob {
    /// Article URL
    pub url: String,

    /// Last modification timestamp (RFC 3339) when the source knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastmod: Option<String>,

    /// Sitemap, category page or log file this job came from
    #[serde(
        default,
        rename = "sitemap_url",
        alias = "source_locator",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_locator: Option<String>,

    /// Lead image announced by the source
    #[serde(
        default,
        rename = "image_url",
        alias = "image_hint",
        skip_serializing_if = "Option::is_none"
    )]
    pub image_hint: Option<String>,

    /// Category slug when the source is category-driven
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl CrawlJob {
    /// Job with only a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            lastmod: None,
            source_locator: None,
            image_hint: None,
            category: None,
        }
    }
}

/// Frontier counters, reset at the start of every full iteration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierStats {
    /// Candidates seen (including blank and invalid lines)
    pub total: u64,
    /// Jobs handed to the consumer
    pub emitted: u64,
    /// Already ingested (resume set) or unchanged in the checkpoint store
    pub skipped_existing: u64,
    /// Already emitted earlier in this iteration
    pub skipped_duplicate: u64,
    /// Unparseable or missing URL
    pub skipped_invalid: u64,
}

/// Media type of an asset
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Still image
    Image,
    /// Video file or stream
    Video,
}

impl AssetKind {
    /// Name stored in the database and used in payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Video => "video",
        }
    }

    /// Directory under the article folder
    pub fn dir_name(&self) -> &'static str {
        match self {
            AssetKind::Image => "images",
            AssetKind::Video => "videos",
        }
    }

    /// Extension used when the URL does not carry one
    pub fn default_extension(&self) -> &'static str {
        match self {
            AssetKind::Image => "jpg",
            AssetKind::Video => "mp4",
        }
    }

    /// Parse a stored name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "image" => Some(AssetKind::Image),
            "video" => Some(AssetKind::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a media asset inside an article
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    /// Where to fetch the asset from
    pub source_url: String,
    /// Image or video
    #[serde(alias = "asset_type")]
    pub kind: AssetKind,
    /// 1-based authored order within the article
    pub sequence: u32,
    /// Caption text
    #[serde(default)]
    pub caption: Option<String>,
    /// Page that embeds the asset, sent as `Referer`
    #[serde(default)]
    pub referrer: Option<String>,
}

impl AssetRef {
    /// New asset without caption or referrer
    pub fn new(source_url: impl Into<String>, kind: AssetKind, sequence: u32) -> Self {
        Self {
            source_url: source_url.into(),
            kind,
            sequence,
            caption: None,
            referrer: None,
        }
    }
}

/// An asset durably written to disk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAsset {
    /// The reference this file was produced from (after URL resolution)
    pub source: AssetRef,
    /// Final file path
    pub path: PathBuf,
    /// Hex sha256 of the file contents
    pub checksum: String,
    /// Size of the file in bytes
    pub bytes_written: u64,
}

/// Category an article was published under
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleCategory {
    /// Publisher's category id, when exposed
    pub id: Option<String>,
    /// Display name
    pub name: Option<String>,
}

/// Structured result of the fetch+parse collaborator
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedArticle {
    /// Headline
    pub title: String,
    /// Lead/summary
    pub description: Option<String>,
    /// Body text
    pub content: String,
    /// Publisher category
    pub category: Option<ArticleCategory>,
    /// Publication time
    pub publish_date: Option<DateTime<Utc>>,
    /// Keyword tags
    pub tags: Vec<String>,
    /// Media in authored order
    pub assets: Vec<AssetRef>,
}
