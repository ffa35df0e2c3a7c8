//! Page fetcher shared by the sitemap and category sources

use crate::config::RetryConfig;
use crate::retry::with_retry;
use crate::{Error, Result};
use std::path::PathBuf;

/// GET text bodies with retry on timeouts and 5xx
///
/// `file://` URLs and bare filesystem paths are read from disk, which lets a
/// sitemap walk start from a downloaded copy.
#[derive(Clone)]
pub struct PageFetcher {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl PageFetcher {
    /// Fetcher over an existing client
    pub fn new(client: reqwest::Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Fetch a document body as text
    pub async fn get_text(&self, locator: &str) -> Result<String> {
        if let Some(path) = local_path(locator) {
            return Ok(tokio::fs::read_to_string(&path).await?);
        }

        with_retry(&self.retry, || async move {
            let response = self.client.get(locator).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::Http {
                    url: locator.to_string(),
                    status: status.as_u16(),
                });
            }
            Ok(response.text().await?)
        })
        .await
    }
}

fn local_path(locator: &str) -> Option<PathBuf> {
    if locator.starts_with("file://") {
        return url::Url::parse(locator).ok()?.to_file_path().ok();
    }
    if locator.contains("://") {
        return None;
    }
    Some(PathBuf::from(locator))
}
