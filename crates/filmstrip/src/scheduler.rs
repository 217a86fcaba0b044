// Thumbnail scheduler: decides where the next frame grab lands on the
// playlist timeline and walks segments forward issuing extraction work.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::{GeneratorConfig, Spacing};
use crate::error::{GeneratorError, Result};
use crate::extractor::{ExtractRequest, FrameExtractor};
use crate::fetch::SegmentSource;
use crate::lifecycle::LifecycleManager;
use crate::playlist::PlaylistSnapshot;

/// Cursor: where the last thumbnail was grabbed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThumbnailLocation {
    pub sn: u64,
    /// Seconds into the segment.
    pub time: f64,
}

/// One thumbnail that reached the output directory.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedThumbnail {
    pub sn: u64,
    pub name: String,
    /// Seconds into the segment.
    pub time: f64,
}

pub struct ThumbnailScheduler {
    spacing: Spacing,
    initial_thumbnail_count: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    output_dir: PathBuf,
    last_location: Option<ThumbnailLocation>,
}

impl ThumbnailScheduler {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            spacing: config.spacing(),
            initial_thumbnail_count: config.initial_thumbnail_count,
            width: config.effective_width(),
            height: config.effective_height(),
            output_dir: config.output_dir.clone(),
            last_location: None,
        }
    }

    pub fn last_location(&self) -> Option<ThumbnailLocation> {
        self.last_location
    }

    /// Spacing in seconds for this tick. Adaptive spacing is recomputed
    /// from the current total duration on every poll; a zero-duration
    /// playlist yields no interval and the tick is skipped.
    fn interval_seconds(&self, playlist: &PlaylistSnapshot) -> Option<f64> {
        match self.spacing {
            Spacing::Fixed(seconds) => Some(seconds),
            Spacing::Adaptive(count) => {
                let total = playlist.total_duration();
                if total <= 0.0 {
                    None
                } else {
                    Some(total / f64::from(count))
                }
            }
        }
    }

    /// Where on the playlist timeline (T=0 at the first listed segment)
    /// the next grab should land.
    fn next_time(&self, playlist: &PlaylistSnapshot, interval: f64) -> f64 {
        if let Some(location) = &self.last_location
            && playlist.contains_sequence(location.sn)
        {
            let index = (location.sn - playlist.media_sequence) as usize;
            let start: f64 = playlist.segments[..index].iter().map(|s| s.duration).sum();
            let segment = &playlist.segments[index];
            let end = start + segment.duration;
            // Anchored to the segment end so edge rounding stays
            // consistent; equals start + location.time + interval.
            end + interval - (segment.duration - location.time)
        } else if let Some(count) = self.initial_thumbnail_count {
            (playlist.total_duration() - f64::from(count) * interval).max(0.0)
        } else {
            0.0
        }
    }

    /// Walk forward from the segment containing the next grab time,
    /// extracting frames until the window runs out of duration.
    ///
    /// Fetch and extraction failures end the walk with whatever was
    /// produced so far; the cursor is left on the last produced frame so
    /// the failed offset is reattempted while its segment stays in the
    /// window.
    pub async fn run_tick(
        &mut self,
        playlist: &PlaylistSnapshot,
        lifecycle: &LifecycleManager,
        segments: &dyn SegmentSource,
        extractor: &dyn FrameExtractor,
        prefix: &str,
        token: &CancellationToken,
    ) -> Result<Vec<GeneratedThumbnail>> {
        let Some(interval) = self.interval_seconds(playlist) else {
            debug!("playlist has no duration yet, skipping tick");
            return Ok(Vec::new());
        };
        let mut next_time = self.next_time(playlist, interval);
        trace!(next_time, interval, "starting emission walk");

        let mut produced = Vec::new();
        let mut start = 0.0;
        for (index, segment) in playlist.segments.iter().enumerate() {
            if token.is_cancelled() {
                return Err(GeneratorError::Cancelled);
            }
            let end = start + segment.duration;
            if next_time >= start && next_time < end {
                let sn = playlist.media_sequence + index as u64;
                let stem = format!("{prefix}-{sn}");

                let segment_path = match segments.fetch_to_temp(&segment.uri, &stem).await {
                    Ok(path) => path,
                    Err(GeneratorError::Cancelled) => return Err(GeneratorError::Cancelled),
                    Err(err) => {
                        error!(sn, error = %err, "segment fetch failed, will retry this offset");
                        break;
                    }
                };

                let request = ExtractRequest {
                    segment: segment_path.clone(),
                    start: next_time - start,
                    interval,
                    limit: segment.duration,
                    width: self.width,
                    height: self.height,
                    output_dir: self.output_dir.clone(),
                    basename: stem,
                    first_index: lifecycle.thumbnail_count(sn),
                };
                let extracted = extractor.extract(request, token).await;
                // Scratch segment is single-use, error or not.
                let _ = tokio::fs::remove_file(&segment_path).await;

                let frames = match extracted {
                    Ok(frames) => frames,
                    Err(GeneratorError::Cancelled) => return Err(GeneratorError::Cancelled),
                    Err(err) => {
                        error!(sn, error = %err, "frame extraction failed, will retry this offset");
                        break;
                    }
                };
                for frame in frames {
                    self.last_location = Some(ThumbnailLocation {
                        sn,
                        time: frame.time,
                    });
                    next_time = start + frame.time + interval;
                    produced.push(GeneratedThumbnail {
                        sn,
                        name: frame.name,
                        time: frame.time,
                    });
                }
            }
            start = end;
        }
        Ok(produced)
    }
}
