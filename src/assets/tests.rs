use super::*;
use crate::config::{BlacklistConfig, ProbeRule};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ARTICLE: ArticleId = ArticleId(42);

fn config() -> DownloadConfig {
    DownloadConfig {
        search_path: false,
        blacklist: BlacklistConfig {
            domains: Vec::new(),
            url_substrings: Vec::new(),
        },
        ..DownloadConfig::default()
    }
}

fn manager(root: &Path, config: &DownloadConfig) -> AssetManager {
    AssetManager::new(reqwest::Client::new(), root, "news-ingest-test", config).unwrap()
}

async fn serve(server: &MockServer, route: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

/// Writes fixed bytes instead of running ffmpeg
struct FakeTranscoder {
    body: &'static [u8],
    calls: AtomicUsize,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn remux(&self, request: &TranscodeRequest<'_>) -> std::result::Result<(), DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(request.output, self.body).await.unwrap();
        if self.body == b"fail" {
            return Err(DownloadError::Transcode {
                url: request.source_url.to_string(),
                reason: "exit status: 1: Invalid data found".to_string(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

fn fake(body: &'static [u8]) -> Arc<FakeTranscoder> {
    Arc::new(FakeTranscoder {
        body,
        calls: AtomicUsize::new(0),
    })
}

#[tokio::test]
async fn results_follow_sequence_order_not_completion_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"slow image".to_vec())
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    serve(&server, "/fast.jpg", b"fast image").await;
    serve(&server, "/clip.mp4", b"video bytes").await;

    let temp_dir = TempDir::new().unwrap();
    let assets = vec![
        AssetRef::new(format!("{}/clip.mp4", server.uri()), AssetKind::Video, 3),
        AssetRef::new(format!("{}/fast.jpg", server.uri()), AssetKind::Image, 2),
        AssetRef::new(format!("{}/slow.png", server.uri()), AssetKind::Image, 1),
    ];

    let stored = manager(temp_dir.path(), &config())
        .download(ARTICLE, assets)
        .await
        .unwrap();

    let sequences: Vec<u32> = stored.iter().map(|s| s.source.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);

    let article_dir = temp_dir.path().join("articles/42");
    assert_eq!(stored[0].path, article_dir.join("images/001.png"));
    assert_eq!(stored[1].path, article_dir.join("images/002.jpg"));
    assert_eq!(stored[2].path, article_dir.join("videos/003.mp4"));
    assert_eq!(stored[0].bytes_written, 10);
    assert_eq!(
        stored[1].checksum,
        crate::utils::sha256_hex("fast image"),
        "checksum is the sha256 of the written bytes"
    );
    assert_eq!(std::fs::read(&stored[2].path).unwrap(), b"video bytes");
}

#[tokio::test]
async fn empty_body_is_an_error_and_leaves_no_file() {
    let server = MockServer::start().await;
    serve(&server, "/empty.jpg", b"").await;

    let temp_dir = TempDir::new().unwrap();
    let err = manager(temp_dir.path(), &config())
        .download(
            ARTICLE,
            vec![AssetRef::new(format!("{}/empty.jpg", server.uri()), AssetKind::Image, 1)],
        )
        .await
        .unwrap_err();

    assert!(
        matches!(
            &err,
            crate::Error::Download(DownloadError::Asset { source, sequence: 1, .. })
                if matches!(**source, DownloadError::EmptyBody { .. })
        ),
        "unexpected error: {err}"
    );
    let images = temp_dir.path().join("articles/42/images");
    let leftovers: Vec<_> = std::fs::read_dir(&images).unwrap().collect();
    assert!(leftovers.is_empty(), "no partial or empty file may remain");
}

#[tokio::test]
async fn repeated_and_inline_sources_are_fetched_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"a".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let url = format!("{}/a.jpg", server.uri());
    let stored = manager(temp_dir.path(), &config())
        .download(
            ARTICLE,
            vec![
                AssetRef::new("data:image/gif;base64,R0lGOD", AssetKind::Image, 1),
                AssetRef::new(url.clone(), AssetKind::Image, 2),
                AssetRef::new(url, AssetKind::Image, 3),
            ],
        )
        .await
        .unwrap();

    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].source.sequence, 2);
}

#[tokio::test]
async fn blacklisted_assets_are_skipped_without_a_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tracker".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = config();
    config.blacklist.url_substrings = vec!["/pixel/".to_string()];

    let temp_dir = TempDir::new().unwrap();
    let batch = manager(temp_dir.path(), &config)
        .download_each(
            ARTICLE,
            vec![AssetRef::new(
                format!("{}/pixel/1x1.gif", server.uri()),
                AssetKind::Image,
                1,
            )],
        )
        .await;

    assert!(batch.stored.is_empty());
    assert!(batch.failed.is_empty());
    assert_eq!(batch.blocked.len(), 1);
}

#[tokio::test]
async fn referrer_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/guarded.jpg"))
        .and(header("Referer", "https://news.example.com/a-1.htm"))
        .and(header("Origin", "https://news.example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let mut asset = AssetRef::new(format!("{}/guarded.jpg", server.uri()), AssetKind::Image, 1);
    asset.referrer = Some("https://news.example.com/a-1.htm".to_string());

    let temp_dir = TempDir::new().unwrap();
    let stored = manager(temp_dir.path(), &config())
        .download(ARTICLE, vec![asset])
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn failed_probe_falls_back_to_the_original_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/meta"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    serve(&server, "/video/clip.mp4", b"progressive").await;

    let mut config = config();
    config.probe_rules = vec![ProbeRule {
        pattern: "/video/".to_string(),
        probe_template: format!("{}/meta?src={{url}}", server.uri()),
    }];
    let transcoder = fake(b"hls");

    let temp_dir = TempDir::new().unwrap();
    let source = format!("{}/video/clip.mp4", server.uri());
    let stored = manager(temp_dir.path(), &config)
        .with_transcoder(transcoder.clone())
        .download(ARTICLE, vec![AssetRef::new(source.clone(), AssetKind::Video, 1)])
        .await
        .unwrap();

    assert_eq!(stored[0].source.source_url, source);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(std::fs::read(&stored[0].path).unwrap(), b"progressive");
}

#[tokio::test]
async fn images_are_fetched_from_their_own_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/meta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"mhls": "/x.m3u8"})))
        .expect(0)
        .mount(&server)
        .await;
    serve(&server, "/video/poster.jpg", b"poster").await;

    let mut config = config();
    config.probe_rules = vec![ProbeRule {
        pattern: "/video/".to_string(),
        probe_template: format!("{}/meta?src={{url}}", server.uri()),
    }];

    let temp_dir = TempDir::new().unwrap();
    let source = format!("{}/video/poster.jpg", server.uri());
    let stored = manager(temp_dir.path(), &config)
        .download(ARTICLE, vec![AssetRef::new(source.clone(), AssetKind::Image, 1)])
        .await
        .unwrap();

    assert_eq!(stored[0].source.source_url, source);
    assert_eq!(std::fs::read(&stored[0].path).unwrap(), b"poster");
}

#[tokio::test]
async fn probe_to_hls_goes_through_the_transcoder() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/meta"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"hls": "", "mhls": "/streams/clip/master.m3u8"})),
        )
        .mount(&server)
        .await;

    let mut config = config();
    config.probe_rules = vec![ProbeRule {
        pattern: "/watch/".to_string(),
        probe_template: format!("{}/meta?src={{url}}", server.uri()),
    }];
    let transcoder = fake(b"remuxed mp4");

    let temp_dir = TempDir::new().unwrap();
    let stored = manager(temp_dir.path(), &config)
        .with_transcoder(transcoder.clone())
        .download(
            ARTICLE,
            vec![AssetRef::new(
                "https://video.example.com/watch/clip.html",
                AssetKind::Video,
                2,
            )],
        )
        .await
        .unwrap();

    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        stored[0].source.source_url,
        format!("{}/streams/clip/master.m3u8", server.uri())
    );
    assert_eq!(stored[0].path, temp_dir.path().join("articles/42/videos/002.mp4"));
    assert_eq!(stored[0].bytes_written, 11);
}

#[tokio::test]
async fn failed_transcode_removes_its_temp_file() {
    let temp_dir = TempDir::new().unwrap();
    let batch = manager(temp_dir.path(), &config())
        .with_transcoder(fake(b"fail"))
        .download_each(
            ARTICLE,
            vec![AssetRef::new(
                "https://cdn.example.com/v/master.m3u8",
                AssetKind::Video,
                1,
            )],
        )
        .await;

    assert_eq!(batch.failed.len(), 1);
    assert!(matches!(batch.failed[0].1, DownloadError::Transcode { .. }));
    let videos = temp_dir.path().join("articles/42/videos");
    assert_eq!(std::fs::read_dir(&videos).unwrap().count(), 0);
}

#[tokio::test]
async fn one_failed_asset_does_not_hide_the_others() {
    let server = MockServer::start().await;
    serve(&server, "/ok.jpg", b"ok").await;
    Mock::given(method("GET"))
        .and(path("/gone.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let batch = manager(temp_dir.path(), &config())
        .download_each(
            ARTICLE,
            vec![
                AssetRef::new(format!("{}/gone.jpg", server.uri()), AssetKind::Image, 1),
                AssetRef::new(format!("{}/ok.jpg", server.uri()), AssetKind::Image, 2),
            ],
        )
        .await;

    assert_eq!(batch.stored.len(), 1);
    assert_eq!(batch.failed.len(), 1);
    assert!(matches!(
        batch.failed[0].1,
        DownloadError::HttpStatus { status: 404, .. }
    ));
}

#[tokio::test]
async fn cancelled_batch_skips_assets_not_yet_started() {
    let server = MockServer::start().await;
    serve(&server, "/1.jpg", b"first").await;
    Mock::given(method("GET"))
        .and(path("/2.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"second".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let config = DownloadConfig {
        max_concurrent_assets: 1,
        ..config()
    };
    let cancel = CancellationToken::new();
    cancel.cancel();
    let batch = manager(temp_dir.path(), &config)
        .download_each_until(
            ARTICLE,
            vec![
                AssetRef::new(format!("{}/1.jpg", server.uri()), AssetKind::Image, 1),
                AssetRef::new(format!("{}/2.jpg", server.uri()), AssetKind::Image, 2),
            ],
            &cancel,
        )
        .await;

    assert!(batch.stored.is_empty());
    assert_eq!(batch.failed.len(), 2);
    assert!(matches!(batch.failed[1].1, DownloadError::Cancelled { .. }));
    assert_eq!(batch.failed[1].1.kind(), crate::error::ErrorKind::Transient);
}

#[tokio::test]
async fn leftover_part_files_are_removed() {
    let temp_dir = TempDir::new().unwrap();
    let manager = manager(temp_dir.path(), &config());
    let videos = manager.article_dir(ARTICLE).join("videos");
    tokio::fs::create_dir_all(&videos).await.unwrap();
    tokio::fs::write(videos.join("001.mp4.part"), b"half").await.unwrap();
    tokio::fs::write(videos.join("002.mp4"), b"whole").await.unwrap();

    assert_eq!(manager.remove_partials(ARTICLE).await.unwrap(), 1);
    assert!(!videos.join("001.mp4.part").exists());
    assert!(videos.join("002.mp4").exists());
    assert_eq!(manager.remove_partials(ArticleId(7)).await.unwrap(), 0);
}
