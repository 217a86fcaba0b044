// Playlist poller: fetches and parses a live HLS playlist on demand and
// classifies each poll as changed, unchanged, or gone.

use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::GeneratorConfig;
use crate::error::{GeneratorError, Result};

/// Immutable snapshot of a media playlist, valid for one scheduling
/// iteration.
#[derive(Debug, Clone)]
pub struct PlaylistSnapshot {
    /// Sequence number of the first listed segment.
    pub media_sequence: u64,
    /// Advertised maximum segment duration in seconds, if known.
    pub target_duration: Option<u64>,
    /// Whether `#EXT-X-ENDLIST` was present.
    pub end_list: bool,
    pub segments: Vec<SegmentInfo>,
}

#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// Segment URI resolved against the effective playlist URL.
    pub uri: Url,
    /// Duration in seconds from `#EXTINF`.
    pub duration: f64,
}

impl PlaylistSnapshot {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Whether `sn` is inside the current sliding window.
    pub fn contains_sequence(&self, sn: u64) -> bool {
        sn >= self.media_sequence && sn < self.media_sequence + self.segments.len() as u64
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// The playlist slid, appended, or was reset since the previous poll.
    Changed(PlaylistSnapshot),
    Unchanged,
    /// The playlist is not coming back: 404, or retries exhausted.
    Gone,
}

enum Parsed {
    Media(PlaylistSnapshot),
    /// Master playlist; carries the first variant's URI resolved against
    /// the master URL.
    Master(Url),
}

fn parse_playlist(bytes: &[u8], base: &Url) -> Result<Parsed> {
    match m3u8_rs::parse_playlist_res(bytes) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => {
            let variant = master.variants.first().ok_or_else(|| {
                GeneratorError::playlist(format!("master playlist {base} has no variants"))
            })?;
            let media_url = base.join(&variant.uri).map_err(|e| {
                GeneratorError::playlist(format!(
                    "could not resolve variant URI `{}` against {base}: {e}",
                    variant.uri
                ))
            })?;
            Ok(Parsed::Master(media_url))
        }
        Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => {
            let mut segments = Vec::with_capacity(media.segments.len());
            for segment in &media.segments {
                let uri = base.join(&segment.uri).map_err(|e| {
                    GeneratorError::playlist(format!(
                        "could not resolve segment URI `{}` against {base}: {e}",
                        segment.uri
                    ))
                })?;
                segments.push(SegmentInfo {
                    uri,
                    duration: f64::from(segment.duration),
                });
            }
            Ok(Parsed::Media(PlaylistSnapshot {
                media_sequence: media.media_sequence,
                target_duration: (media.target_duration > 0).then_some(media.target_duration),
                end_list: media.end_list,
                segments,
            }))
        }
        Err(e) => Err(GeneratorError::playlist(format!(
            "failed to parse playlist {base}: {e}"
        ))),
    }
}

pub struct PlaylistPoller {
    http_client: Client,
    source_url: Url,
    /// Media playlist URL actually polled. Resolved from the first
    /// variant on the first successful master parse, then cached.
    effective_url: Option<Url>,
    ignore_404: bool,
    /// Retries per poll after the initial attempt; `-1` retries forever.
    retry_count: i32,
    retry_delay: Duration,
    fetch_timeout: Duration,
    /// `(segments.len(), media_sequence)` of the last snapshot. Lossy on
    /// purpose: a live playlist only ever slides or appends.
    last_seen: Option<(usize, u64)>,
    last_target_duration: Option<u64>,
    last_end_list: bool,
}

impl PlaylistPoller {
    pub fn new(http_client: Client, config: &GeneratorConfig) -> Result<Self> {
        let source_url =
            Url::parse(&config.playlist_url).map_err(|e| GeneratorError::InvalidUrl {
                input: config.playlist_url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            http_client,
            source_url,
            effective_url: None,
            ignore_404: config.ignore_playlist_404,
            retry_count: config.playlist_retry_count,
            retry_delay: config.playlist_retry_delay,
            fetch_timeout: config.fetch_timeout,
            last_seen: None,
            last_target_duration: None,
            last_end_list: false,
        })
    }

    /// Media playlist URL in effect, once a poll has succeeded.
    pub fn effective_url(&self) -> Option<&Url> {
        self.effective_url.as_ref()
    }

    /// Fetch the playlist, retrying transient failures, and classify the
    /// result against the previous snapshot.
    ///
    /// A 404 short-circuits to `Gone` unless `ignore_playlist_404` is
    /// set, in which case it counts as a normal failure subject to
    /// retries. Exhausting retries also yields `Gone`.
    pub async fn poll(&mut self, token: &CancellationToken) -> Result<PollOutcome> {
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                return Err(GeneratorError::Cancelled);
            }
            match self.fetch_snapshot().await {
                Ok(snapshot) => return Ok(self.classify(snapshot)),
                Err(err) => {
                    if err.is_not_found() && !self.ignore_404 {
                        debug!(url = %self.source_url, "playlist returned 404, treating as gone");
                        return Ok(PollOutcome::Gone);
                    }
                    if self.retry_count >= 0 && attempt >= self.retry_count as u32 {
                        warn!(
                            url = %self.source_url,
                            attempts = attempt + 1,
                            error = %err,
                            "playlist retries exhausted, treating as gone"
                        );
                        return Ok(PollOutcome::Gone);
                    }
                    // Saturating keeps the unlimited (-1) mode safe from
                    // counter overflow while preserving the backoff.
                    attempt = attempt.saturating_add(1);
                    warn!(url = %self.source_url, attempt, error = %err, "playlist fetch failed, retrying");
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(GeneratorError::Cancelled),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
    }

    /// Advisory delay until the next poll, derived from the last
    /// successful snapshot.
    pub fn next_poll_delay(&self) -> Duration {
        if self.last_end_list {
            Duration::from_secs(30)
        } else if let Some(target) = self.last_target_duration {
            Duration::from_secs(target / 2).max(Duration::from_secs(1))
        } else {
            Duration::from_secs(2)
        }
    }

    async fn fetch_snapshot(&mut self) -> Result<PlaylistSnapshot> {
        let url = self
            .effective_url
            .clone()
            .unwrap_or_else(|| self.source_url.clone());
        let body = self.fetch_bytes(&url).await?;
        match parse_playlist(&body, &url)? {
            Parsed::Media(snapshot) => {
                if self.effective_url.is_none() {
                    self.effective_url = Some(url);
                }
                Ok(snapshot)
            }
            Parsed::Master(media_url) => {
                debug!(master = %url, media = %media_url, "selected first variant of master playlist");
                let body = self.fetch_bytes(&media_url).await?;
                match parse_playlist(&body, &media_url)? {
                    Parsed::Media(snapshot) => {
                        self.effective_url = Some(media_url);
                        Ok(snapshot)
                    }
                    Parsed::Master(_) => Err(GeneratorError::playlist(format!(
                        "variant {media_url} resolved to another master playlist"
                    ))),
                }
            }
        }
    }

    async fn fetch_bytes(&self, url: &Url) -> Result<bytes::Bytes> {
        let response = self
            .http_client
            .get(url.clone())
            .timeout(self.fetch_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GeneratorError::http_status(
                response.status(),
                url.as_str(),
                "playlist fetch",
            ));
        }
        Ok(response.bytes().await?)
    }

    fn classify(&mut self, snapshot: PlaylistSnapshot) -> PollOutcome {
        self.last_target_duration = snapshot.target_duration;
        self.last_end_list = snapshot.end_list;
        let key = (snapshot.segments.len(), snapshot.media_sequence);
        if self.last_seen == Some(key) {
            PollOutcome::Unchanged
        } else {
            self.last_seen = Some(key);
            PollOutcome::Changed(snapshot)
        }
    }
}
