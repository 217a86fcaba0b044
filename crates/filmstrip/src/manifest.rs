// Manifest: the JSON file consumers poll to discover which thumbnails
// currently exist. Distinct from the HLS playlist the pipeline consumes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GeneratorError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// True once `#EXT-X-ENDLIST` has been observed. Never goes back to
    /// false.
    pub ended: bool,
    /// Ordered by insertion, in practice ascending by `sn`.
    pub segments: Vec<ManifestSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSegment {
    pub sn: u64,
    /// Unix milliseconds the segment left the playlist window, or null
    /// while it is still listed.
    pub removal_time: Option<i64>,
    pub thumbnails: Vec<ManifestThumbnail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestThumbnail {
    /// Seconds into the segment.
    pub time: f64,
    pub name: String,
}

/// Serializes the manifest with atomic-replace semantics: readers see
/// either the previous valid content or the new one, never a torn write.
pub struct ManifestWriter {
    path: PathBuf,
    staging_path: PathBuf,
}

impl ManifestWriter {
    pub fn new(output_dir: &Path, file_name: &str) -> Self {
        let path = output_dir.join(file_name);
        let staging_path = output_dir.join(format!("{file_name}.tmp"));
        Self { path, staging_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, manifest: &Manifest) -> Result<()> {
        let body = serde_json::to_vec(manifest).map_err(|e| GeneratorError::Manifest {
            reason: format!("serialization failed: {e}"),
        })?;
        tokio::fs::write(&self.staging_path, &body).await?;
        tokio::fs::rename(&self.staging_path, &self.path).await?;
        debug!(path = %self.path.display(), segments = manifest.segments.len(), "manifest written");
        Ok(())
    }

    /// Best-effort write: in-memory state stays authoritative, the next
    /// state change retries.
    pub async fn write_logged(&self, manifest: &Manifest) {
        if let Err(err) = self.write(manifest).await {
            warn!(path = %self.path.display(), error = %err, "manifest write failed, will retry on next change");
        }
    }

    /// Unlink the manifest. Already-gone counts as success.
    pub async fn remove(&self) {
        for path in [&self.staging_path, &self.path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to unlink manifest")
                }
            }
        }
    }
}
