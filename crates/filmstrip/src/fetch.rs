// Segment fetcher: downloads one segment body into the scratch directory
// so ffmpeg can seek inside it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};
use url::Url;

use crate::error::{GeneratorError, Result};

/// Hands segment bodies to the extraction stage as local files.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    /// Materialize `uri` under the scratch directory as
    /// `<file_stem>.seg`. The caller removes the file once the segment
    /// has been processed, error or not.
    async fn fetch_to_temp(&self, uri: &Url, file_stem: &str) -> Result<PathBuf>;
}

pub struct SegmentFetcher {
    http_client: Client,
    temp_dir: PathBuf,
    fetch_timeout: Duration,
}

impl SegmentFetcher {
    pub fn new(http_client: Client, temp_dir: impl Into<PathBuf>, fetch_timeout: Duration) -> Self {
        Self {
            http_client,
            temp_dir: temp_dir.into(),
            fetch_timeout,
        }
    }

    async fn download(&self, uri: &Url, path: &Path) -> Result<u64> {
        let response = self
            .http_client
            .get(uri.clone())
            .timeout(self.fetch_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GeneratorError::http_status(
                response.status(),
                uri.as_str(),
                "segment fetch",
            ));
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| GeneratorError::SegmentFetch {
                reason: format!("body read failed for {uri}: {e}"),
            })?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            debug!(uri = %uri, "segment body was empty");
            return Err(GeneratorError::SegmentFetch {
                reason: format!("empty segment body for {uri}"),
            });
        }
        Ok(written)
    }
}

#[async_trait]
impl SegmentSource for SegmentFetcher {
    async fn fetch_to_temp(&self, uri: &Url, file_stem: &str) -> Result<PathBuf> {
        let path = self.temp_dir.join(format!("{file_stem}.seg"));
        match self.download(uri, &path).await {
            Ok(bytes) => {
                trace!(uri = %uri, bytes, path = %path.display(), "segment downloaded");
                Ok(path)
            }
            Err(err) => {
                // A partial body is useless to ffmpeg.
                let _ = tokio::fs::remove_file(&path).await;
                Err(err)
            }
        }
    }
}
