//! HTML fixtures, wiremock helpers and seeded rows

use news_ingest::types::ArticleCategory;
use news_ingest::{AppContext, ArticleId, AssetRef, ParsedArticle, TaskPayload};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Bytes served for every fixture image
pub const IMAGE_BYTES: &[u8] = b"\x89PNG fixture image bytes";

/// Bytes served for every progressive fixture video
pub const VIDEO_BYTES: &[u8] = b"fixture mp4 bytes";

/// Category timeline page linking to `links`
pub fn category_listing(links: &[&str]) -> String {
    let items: String = links
        .iter()
        .map(|href| format!(r#"<li class="news-item"><h3><a href="{href}">story</a></h3></li>"#))
        .collect();
    format!("<html><body><ul class=\"timeline\">{items}</ul></body></html>")
}

/// Article page with a breadcrumb category, two paragraphs and the given media
pub fn article_html(title: &str, category: &str, images: &[&str], videos: &[&str]) -> String {
    let figures: String = images
        .iter()
        .map(|src| format!(r#"<figure><img src="{src}"><figcaption>{title} photo</figcaption></figure>"#))
        .collect();
    let clips: String = videos
        .iter()
        .map(|src| format!(r#"<video src="{src}"></video>"#))
        .collect();
    format!(
        r#"<html>
<head>
  <title>{title} | News</title>
  <meta property="og:description" content="Summary of {title}">
  <meta property="article:published_time" content="2024-05-01T08:30:00+07:00">
</head>
<body>
  <div class="breadcrumb"><a href="/">Home</a><a href="/{category}.htm">{category}</a></div>
  <h1>{title}</h1>
  <div class="detail-content">
    <p>First paragraph of {title}.</p>
    {figures}
    <p>Second paragraph of {title}.</p>
    {clips}
  </div>
</body>
</html>"#
    )
}

/// Serve `body` as HTML at `route`
pub async fn mount_html(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html; charset=utf-8")
                .set_body_string(body),
        )
        .mount(server)
        .await;
}

/// Serve `body` at `route`, optionally after `delay`
pub async fn mount_bytes(server: &MockServer, route: &str, body: &[u8], delay: Option<Duration>) {
    let mut response = ResponseTemplate::new(200).set_body_bytes(body.to_vec());
    if let Some(delay) = delay {
        response = response.set_delay(delay);
    }
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(response)
        .mount(server)
        .await;
}

/// Answer every request to `route` with `status`
pub async fn mount_status(server: &MockServer, route: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Insert an article row for `url` with a business category
pub async fn seed_article(ctx: &AppContext, url: &str) -> ArticleId {
    let article = ParsedArticle {
        title: "Seeded story".to_string(),
        content: "Seeded body".to_string(),
        category: Some(ArticleCategory {
            id: Some("business".to_string()),
            name: Some("Business".to_string()),
        }),
        ..ParsedArticle::default()
    };
    let (id, _) = ctx
        .db
        .upsert_article("kenh14", url, &article)
        .await
        .expect("Failed to seed article");
    id
}

/// Queue a download task for `assets` with the context's storage settings
pub async fn queue_download(ctx: &AppContext, article_id: ArticleId, article_url: &str, assets: Vec<AssetRef>) -> i64 {
    let payload = TaskPayload {
        article_id,
        db_url: ctx.db_url.clone(),
        article_url: article_url.to_string(),
        site: "kenh14".to_string(),
        assets,
        config: ctx.payload_config().expect("Failed to build payload config"),
        resolve: None,
    };
    ctx.queue.enqueue(&payload).await.expect("Failed to enqueue task")
}
