// Frame extraction: turns one downloaded segment into zero or more JPEG
// frames at evenly spaced offsets.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::GeneratorConfig;
use crate::error::{GeneratorError, Result};

/// One extraction pass over a single segment.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    /// Local path of the downloaded segment.
    pub segment: PathBuf,
    /// First offset inside the segment, in seconds.
    pub start: f64,
    /// Spacing between frames, in seconds.
    pub interval: f64,
    /// Segment duration; frames are grabbed while `offset < limit`.
    pub limit: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Directory the finished frames land in.
    pub output_dir: PathBuf,
    /// Frames are named `<basename>-<index>.jpg`.
    pub basename: String,
    /// Index of the first frame; keeps names unique when a segment is
    /// revisited after a partial failure.
    pub first_index: usize,
}

/// A frame that made it to disk.
#[derive(Debug, Clone)]
pub struct ExtractedFrame {
    pub index: usize,
    /// Offset inside the segment, in seconds, rounded to milliseconds.
    pub time: f64,
    pub name: String,
}

/// Produces frames from segment files. The pipeline only depends on this
/// contract, so tests substitute a scripted implementation.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// Grab frames at `start, start + interval, …` while the offset is
    /// below `limit`. Offsets the encoder could not produce a frame for
    /// (end-of-segment rounding) are silently absent from the result.
    async fn extract(
        &self,
        request: ExtractRequest,
        token: &CancellationToken,
    ) -> Result<Vec<ExtractedFrame>>;
}

/// Offsets an extraction pass will attempt, rounded to milliseconds.
pub(crate) fn frame_offsets(start: f64, interval: f64, limit: f64) -> Vec<f64> {
    (0..)
        .map(|i| start + i as f64 * interval)
        .take_while(|offset| *offset < limit)
        .map(round_to_millis)
        .collect()
}

fn round_to_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

/// ffmpeg-backed extractor: one `-ss <offset> … -frames:v 1` run per
/// frame, bounded by a timeout.
pub struct FfmpegExtractor {
    ffmpeg_path: String,
    timeout: Duration,
    /// Frames are written here first, then moved into the output
    /// directory once complete.
    temp_dir: PathBuf,
    jpeg_quality: u32,
}

impl FfmpegExtractor {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            timeout: config.ffmpeg_timeout,
            temp_dir: config.temp_dir.clone(),
            jpeg_quality: config.jpeg_quality,
        }
    }

    fn scale_filter(width: Option<u32>, height: Option<u32>) -> String {
        match (width, height) {
            (Some(w), Some(h)) => format!("scale={w}:{h}"),
            (Some(w), None) => format!("scale={w}:-1"),
            (None, Some(h)) => format!("scale=-1:{h}"),
            // Config validation guarantees at least one dimension.
            (None, None) => "scale=150:-1".to_string(),
        }
    }

    fn build_args(&self, request: &ExtractRequest, offset: f64, out: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            format!("{offset:.3}"),
            "-i".to_string(),
            request.segment.display().to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-vf".to_string(),
            Self::scale_filter(request.width, request.height),
            "-q:v".to_string(),
            self.jpeg_quality.to_string(),
            out.display().to_string(),
        ]
    }

    async fn grab_one(
        &self,
        request: &ExtractRequest,
        offset: f64,
        name: &str,
        token: &CancellationToken,
    ) -> Result<bool> {
        let staging = self.temp_dir.join(name);
        let args = self.build_args(request, offset, &staging);
        trace!(ffmpeg = %self.ffmpeg_path, ?args, "spawning frame grab");

        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|e| {
            GeneratorError::extraction(format!("failed to spawn {}: {e}", self.ffmpeg_path))
        })?;

        let output = tokio::select! {
            biased;
            _ = token.cancelled() => {
                // kill_on_drop reaps the child.
                return Err(GeneratorError::Cancelled);
            }
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(GeneratorError::extraction(format!("ffmpeg wait failed: {e}"))),
                Err(_) => {
                    let _ = tokio::fs::remove_file(&staging).await;
                    return Err(GeneratorError::extraction(format!(
                        "ffmpeg timed out after {:?} at offset {offset:.3}",
                        self.timeout
                    )));
                }
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(GeneratorError::extraction(format!(
                "ffmpeg exited with {} at offset {offset:.3}: {}",
                output.status,
                stderr.lines().next().unwrap_or("no diagnostics")
            )));
        }

        // A clean exit with no (or an empty) output file means the offset
        // fell past the last decodable frame. Not an error.
        let produced = match tokio::fs::metadata(&staging).await {
            Ok(meta) => meta.len() > 0,
            Err(_) => false,
        };
        if !produced {
            let _ = tokio::fs::remove_file(&staging).await;
            debug!(offset, segment = %request.segment.display(), "no frame at offset");
            return Ok(false);
        }

        move_into_place(&staging, &request.output_dir.join(name)).await?;
        Ok(true)
    }
}

#[async_trait]
impl FrameExtractor for FfmpegExtractor {
    async fn extract(
        &self,
        request: ExtractRequest,
        token: &CancellationToken,
    ) -> Result<Vec<ExtractedFrame>> {
        let mut frames = Vec::new();
        for (i, offset) in frame_offsets(request.start, request.interval, request.limit)
            .into_iter()
            .enumerate()
        {
            if token.is_cancelled() {
                return Err(GeneratorError::Cancelled);
            }
            let index = request.first_index + i;
            let name = format!("{}-{index}.jpg", request.basename);
            if self.grab_one(&request, offset, &name, token).await? {
                frames.push(ExtractedFrame {
                    index,
                    time: offset,
                    name,
                });
            }
        }
        Ok(frames)
    }
}

/// Move `from` to `to` atomically, falling back to copy-and-remove when
/// the rename crosses devices.
pub(crate) async fn move_into_place(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tokio::fs::copy(from, to).await.map_err(|copy_err| {
                warn!(
                    from = %from.display(),
                    to = %to.display(),
                    %rename_err,
                    %copy_err,
                    "failed to move frame into place"
                );
                GeneratorError::Io { source: copy_err }
            })?;
            let _ = tokio::fs::remove_file(from).await;
            Ok(())
        }
    }
}
