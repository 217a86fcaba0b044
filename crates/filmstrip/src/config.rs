use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GeneratorError, Result};

/// Output width applied when neither `width` nor `height` is configured.
pub const DEFAULT_WIDTH: u32 = 150;

/// Thumbnail count used when neither `interval` nor
/// `target_thumbnail_count` is configured.
pub const DEFAULT_TARGET_THUMBNAIL_COUNT: u32 = 30;

/// Configuration for a single thumbnail generator.
///
/// One generator is bound to one playlist URL for its whole lifetime.
/// Validation happens once, at construction; everything that can be
/// misconfigured fails there rather than mid-stream.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// URL of the HLS playlist to watch. A master playlist is accepted;
    /// its first variant becomes the effective playlist.
    pub playlist_url: String,

    /// Directory thumbnails and the manifest are written to.
    /// Created if missing.
    pub output_dir: PathBuf,

    /// Scratch directory for downloaded segments and in-progress frames.
    /// May be shared between generators; files are namespaced by the
    /// generator prefix. Created if missing.
    pub temp_dir: PathBuf,

    /// Fixed spacing between thumbnails. Mutually exclusive with
    /// `target_thumbnail_count`.
    pub interval: Option<Duration>,

    /// Desired number of thumbnails spread over the stream duration.
    /// The spacing is recomputed on every poll as the window slides.
    pub target_thumbnail_count: Option<u32>,

    /// How many thumbnails to backfill when the generator first sees the
    /// playlist. Unset means backfill from the start of the window.
    pub initial_thumbnail_count: Option<u32>,

    /// Output frame width. When only one dimension is set the other is
    /// derived from the source aspect ratio.
    pub width: Option<u32>,

    /// Output frame height.
    pub height: Option<u32>,

    /// How long a thumbnail outlives its segment leaving the playlist
    /// window. Unset behaves as zero: reaped by the next sweep.
    /// Must be unset when `never_delete` is on.
    pub expire_time: Option<Duration>,

    /// Keep every thumbnail for the lifetime of the process and never run
    /// the expiry sweep.
    pub never_delete: bool,

    /// Treat a 404 on the playlist as a normal transient failure instead
    /// of declaring the stream gone.
    pub ignore_playlist_404: bool,

    /// Retries per poll after the initial attempt. `-1` retries forever.
    pub playlist_retry_count: i32,

    /// Delay between playlist fetch attempts within one poll.
    pub playlist_retry_delay: Duration,

    /// Per-attempt timeout for playlist and segment requests.
    pub fetch_timeout: Duration,

    /// Period of the expiry sweep.
    pub gc_interval: Duration,

    /// Filename prefix for thumbnails. Defaults to the hex sha1 of the
    /// effective playlist URL.
    pub output_name_prefix: Option<String>,

    /// Name of the JSON manifest inside `output_dir`.
    pub manifest_file_name: String,

    /// Path to the ffmpeg binary. Falls back to `FFMPEG_PATH`, then plain
    /// `ffmpeg` on the search path.
    pub ffmpeg_path: String,

    /// Upper bound on a single frame extraction.
    pub ffmpeg_timeout: Duration,

    /// JPEG quality, 1-31, lower is better.
    pub jpeg_quality: u32,
}

impl GeneratorConfig {
    pub fn new(playlist_url: impl Into<String>) -> Self {
        Self {
            playlist_url: playlist_url.into(),
            output_dir: PathBuf::from("."),
            temp_dir: std::env::temp_dir(),
            interval: None,
            target_thumbnail_count: None,
            initial_thumbnail_count: None,
            width: None,
            height: None,
            expire_time: None,
            never_delete: false,
            ignore_playlist_404: false,
            playlist_retry_count: 2,
            playlist_retry_delay: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(15),
            gc_interval: Duration::from_secs(30),
            output_name_prefix: None,
            manifest_file_name: "thumbnails.json".to_string(),
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffmpeg_timeout: Duration::from_secs(30),
            jpeg_quality: 2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.playlist_url.is_empty() {
            return Err(GeneratorError::configuration("playlist_url is required"));
        }
        if self.interval.is_some() && self.target_thumbnail_count.is_some() {
            return Err(GeneratorError::configuration(
                "interval and target_thumbnail_count are mutually exclusive",
            ));
        }
        if self.interval.is_some_and(|i| i.is_zero()) {
            return Err(GeneratorError::configuration("interval must be non-zero"));
        }
        if self.target_thumbnail_count == Some(0) {
            return Err(GeneratorError::configuration(
                "target_thumbnail_count must be at least 1",
            ));
        }
        if self.never_delete && self.expire_time.is_some() {
            return Err(GeneratorError::configuration(
                "expire_time must be unset when never_delete is on",
            ));
        }
        if self.playlist_retry_count < -1 {
            return Err(GeneratorError::configuration(
                "playlist_retry_count must be -1 (unlimited) or non-negative",
            ));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(GeneratorError::configuration(
                "width and height must be non-zero when set",
            ));
        }
        if !(1..=31).contains(&self.jpeg_quality) {
            return Err(GeneratorError::configuration(
                "jpeg_quality must be within 1..=31",
            ));
        }
        if self.manifest_file_name.is_empty() {
            return Err(GeneratorError::configuration(
                "manifest_file_name must not be empty",
            ));
        }
        Ok(())
    }

    /// Output width after defaulting: `DEFAULT_WIDTH` when neither
    /// dimension was configured.
    pub fn effective_width(&self) -> Option<u32> {
        match (self.width, self.height) {
            (None, None) => Some(DEFAULT_WIDTH),
            (w, _) => w,
        }
    }

    pub fn effective_height(&self) -> Option<u32> {
        self.height
    }

    /// How thumbnails are spaced along the stream timeline.
    pub fn spacing(&self) -> Spacing {
        match (self.interval, self.target_thumbnail_count) {
            (Some(interval), _) => Spacing::Fixed(interval.as_secs_f64()),
            (None, Some(count)) => Spacing::Adaptive(count),
            (None, None) => Spacing::Adaptive(DEFAULT_TARGET_THUMBNAIL_COUNT),
        }
    }
}

/// Spacing policy between consecutive thumbnails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Spacing {
    /// Operator-supplied spacing in seconds, used verbatim.
    Fixed(f64),
    /// Spread this many thumbnails over the current total duration;
    /// recomputed on every poll.
    Adaptive(u32),
}
