//! Re-drive tests: deferred videos and failed media back into the queue

mod common;

use common::*;
use news_ingest::db::{DeferredStatus, MediaFilter, NewDeferredVideos, NewFailedMedia};
use news_ingest::{ArticleId, AssetKind, AssetRef, RedriveOptions, Worker, redrive};
use wiremock::MockServer;

const ARTICLE_URL: &str = "https://news.example/markets-2002.htm";

fn both() -> RedriveOptions {
    RedriveOptions {
        include_failed: true,
        include_deferred: true,
        filter: MediaFilter::default(),
    }
}

async fn defer_video(ctx: &news_ingest::AppContext, article: ArticleId, video: &AssetRef) {
    ctx.db
        .save_deferred_video_assets(&NewDeferredVideos {
            article_id: article,
            site_slug: "kenh14",
            article_url: ARTICLE_URL,
            category_id: Some("business"),
            category_name: Some("Business"),
            ingest_category: Some("business"),
            assets: std::slice::from_ref(video),
            reason: None,
        })
        .await
        .unwrap();
}

async fn fail_image(ctx: &news_ingest::AppContext, article: ArticleId, image: &AssetRef) {
    ctx.db
        .record_failed_media_downloads(&NewFailedMedia {
            article_id: article,
            site_slug: "kenh14",
            article_url: ARTICLE_URL,
            assets: std::slice::from_ref(image),
            error: "HTTP 503",
            error_type: Some("transient"),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn enabled_category_brings_deferred_videos_and_failures_back() {
    let server = MockServer::start().await;
    mount_bytes(&server, "/img/1.jpg", IMAGE_BYTES, None).await;
    mount_bytes(&server, "/media/2.mp4", VIDEO_BYTES, None).await;

    let mut env = TestEnv::new();
    env.config.video.enabled_categories = Some(vec!["Business".to_string()]);
    let ctx = env.context().await;
    let article = seed_article(&ctx, ARTICLE_URL).await;
    let image = AssetRef::new(format!("{}/img/1.jpg", server.uri()), AssetKind::Image, 1);
    let video = AssetRef::new(format!("{}/media/2.mp4", server.uri()), AssetKind::Video, 2);
    fail_image(&ctx, article, &image).await;
    defer_video(&ctx, article, &video).await;

    let stats = redrive(&ctx, &both()).await.unwrap();

    assert_eq!(stats.articles, 1);
    assert_eq!(stats.assets, 2);
    assert_eq!(stats.enqueued_tasks, 1, "one task per article");
    assert_eq!(stats.skipped_policy, 0);
    let row = ctx.db.get_deferred_video(article, 2).await.unwrap().unwrap();
    assert_eq!(row.status, DeferredStatus::Enqueued.as_str());
    assert!(row.enqueued_at.is_some());

    let worker = Worker::new(ctx.clone()).run_until_idle().await.unwrap();
    assert_eq!(worker.succeeded, 1);

    assert_eq!(
        stored_assets(&ctx, article).await,
        vec![("image".to_string(), 1), ("video".to_string(), 2)]
    );
    let row = ctx.db.get_deferred_video(article, 2).await.unwrap().unwrap();
    assert_eq!(row.status, DeferredStatus::Resolved.as_str());
    let failures = ctx.db.failures_for_article(article).await.unwrap();
    assert_eq!(failures[0].status, "resolved");

    let again = redrive(&ctx, &both()).await.unwrap();
    assert_eq!(again.enqueued_tasks, 0, "resolved rows are not re-driven");
}

#[tokio::test]
async fn deferred_videos_of_still_disabled_categories_stay_parked() {
    let mut env = TestEnv::new();
    env.config.video.enabled_categories = Some(vec!["sports".to_string()]);
    let ctx = env.context().await;
    let article = seed_article(&ctx, ARTICLE_URL).await;
    let video = AssetRef::new("https://cdn.example/clip.mp4", AssetKind::Video, 3);
    defer_video(&ctx, article, &video).await;

    let stats = redrive(&ctx, &both()).await.unwrap();

    assert_eq!(stats.skipped_policy, 1);
    assert_eq!(stats.enqueued_tasks, 0);
    assert_eq!(task_counts(&ctx).await.queued, 0);
    let row = ctx.db.get_deferred_video(article, 3).await.unwrap().unwrap();
    assert_eq!(row.status, DeferredStatus::Deferred.as_str());
}

#[tokio::test]
async fn already_stored_sequences_are_not_queued_again() {
    let server = MockServer::start().await;
    mount_bytes(&server, "/img/1.jpg", IMAGE_BYTES, None).await;

    let env = TestEnv::new();
    let ctx = env.context().await;
    let article = seed_article(&ctx, ARTICLE_URL).await;
    let image = AssetRef::new(format!("{}/img/1.jpg", server.uri()), AssetKind::Image, 1);
    queue_download(&ctx, article, ARTICLE_URL, vec![image.clone()]).await;
    Worker::new(ctx.clone()).run_until_idle().await.unwrap();

    // A late failure report for an asset that is already on disk
    fail_image(&ctx, article, &image).await;
    let stats = redrive(&ctx, &both()).await.unwrap();

    assert_eq!(stats.skipped_stored, 1);
    assert_eq!(stats.enqueued_tasks, 0);
}

#[tokio::test]
async fn filters_limit_what_is_re_driven() {
    let env = TestEnv::new();
    let ctx = env.context().await;
    let article = seed_article(&ctx, ARTICLE_URL).await;
    let image = AssetRef::new("https://cdn.example/1.jpg", AssetKind::Image, 1);
    let video = AssetRef::new("https://cdn.example/2.mp4", AssetKind::Video, 2);
    fail_image(&ctx, article, &image).await;
    defer_video(&ctx, article, &video).await;

    let other_site = RedriveOptions {
        filter: MediaFilter {
            site_slug: Some("nld".to_string()),
            ..MediaFilter::default()
        },
        ..both()
    };
    assert_eq!(redrive(&ctx, &other_site).await.unwrap().enqueued_tasks, 0);

    let failed_only = RedriveOptions {
        include_deferred: false,
        ..both()
    };
    let stats = redrive(&ctx, &failed_only).await.unwrap();
    assert_eq!(stats.assets, 1);
    let row = ctx.db.get_deferred_video(article, 2).await.unwrap().unwrap();
    assert_eq!(row.status, DeferredStatus::Deferred.as_str(), "deferrals were not included");
}
