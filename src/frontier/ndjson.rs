//! NDJSON job log replay and writer
//!
//! One JSON object per line: `{"url": ..., "lastmod"?: ..., "sitemap_url"?: ...,
//! "image_url"?: ...}`. Blank lines count toward `total` only; lines that fail
//! to parse or carry an empty URL count as invalid.

use super::{FrontierSource, JobSink};
use crate::error::FrontierError;
use crate::types::CrawlJob;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Replays a job log written by an earlier run
pub struct NdjsonSource {
    path: PathBuf,
}

impl NdjsonSource {
    /// Source over the log at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FrontierSource for NdjsonSource {
    fn name(&self) -> &str {
        "ndjson"
    }

    async fn produce(&mut self, sink: &mut JobSink) -> Result<()> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FrontierError::MissingJobsFile(self.path.clone()).into());
            }
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                sink.count_blank();
                continue;
            }

            match serde_json::from_str::<CrawlJob>(line) {
                Ok(job) if !job.url.trim().is_empty() => {
                    sink.offer(job).await?;
                }
                Ok(_) => {
                    tracing::warn!(path = %self.path.display(), line = line_no, "Job line has an empty url");
                    sink.reject_invalid();
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), line = line_no, error = %e, "Invalid job line");
                    sink.reject_invalid();
                }
            }
        }

        Ok(())
    }
}

/// Append-only NDJSON writer
///
/// Used for the discovery job log and the fetch-failure log. Each record is
/// written and flushed as a single line so concurrent appenders never
/// interleave partial lines.
pub struct NdjsonJobWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl NdjsonJobWriter {
    /// Open `path` for appending, creating parent directories
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Append one record
    pub async fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Log location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writer_appends_lines_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("logs/jobs.ndjson");

        let writer = NdjsonJobWriter::open(&path).await.unwrap();
        writer.append(&CrawlJob::new("https://example.com/a.htm")).await.unwrap();
        drop(writer);

        let writer = NdjsonJobWriter::open(&path).await.unwrap();
        writer.append(&CrawlJob::new("https://example.com/b.htm")).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], r#"{"url":"https://example.com/b.htm"}"#);
    }
}
