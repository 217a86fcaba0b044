// Generator: wires the poller, scheduler, lifecycle manager, and
// manifest writer into one cooperative pipeline task per playlist.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::GeneratorConfig;
use crate::error::{GeneratorError, Result};
use crate::events::GeneratorEvent;
use crate::extractor::{FfmpegExtractor, FrameExtractor};
use crate::fetch::SegmentFetcher;
use crate::lifecycle::{LifecycleManager, unix_millis};
use crate::manifest::ManifestWriter;
use crate::playlist::{PlaylistPoller, PlaylistSnapshot, PollOutcome};
use crate::scheduler::{GeneratedThumbnail, ThumbnailScheduler};

/// Default filename prefix: hex sha1 of the effective playlist URL.
fn default_prefix(url: &Url) -> String {
    let mut hasher = Sha1::new();
    hasher.update(url.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Default)]
struct SharedState {
    thumbnails: Vec<GeneratedThumbnail>,
    playlist_ended: bool,
    finished: bool,
}

struct GeneratorShared {
    token: CancellationToken,
    keep_files_on_destroy: AtomicBool,
    state: Mutex<SharedState>,
}

/// Handle to one running pipeline, bound to a single playlist URL.
///
/// Dropping the handle does not stop the pipeline; call
/// [`ThumbnailGenerator::destroy`].
pub struct ThumbnailGenerator {
    shared: Arc<GeneratorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThumbnailGenerator {
    /// Validate the configuration and start the pipeline with the given
    /// frame extractor. Returns the handle and the event stream.
    pub fn spawn(
        config: GeneratorConfig,
        extractor: Arc<dyn FrameExtractor>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GeneratorEvent>)> {
        config.validate()?;
        std::fs::create_dir_all(&config.output_dir)?;
        std::fs::create_dir_all(&config.temp_dir)?;

        let http_client = reqwest::Client::new();
        let poller = PlaylistPoller::new(http_client.clone(), &config)?;
        let fetcher = SegmentFetcher::new(http_client, &config.temp_dir, config.fetch_timeout);
        let scheduler = ThumbnailScheduler::new(&config);
        let manifest = ManifestWriter::new(&config.output_dir, &config.manifest_file_name);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(GeneratorShared {
            token: CancellationToken::new(),
            keep_files_on_destroy: AtomicBool::new(false),
            state: Mutex::new(SharedState::default()),
        });

        let worker = GeneratorWorker {
            config,
            poller,
            fetcher,
            scheduler,
            lifecycle: LifecycleManager::default(),
            manifest,
            extractor,
            events: event_tx,
            shared: Arc::clone(&shared),
            prefix: None,
            last_window: None,
            gone: false,
            ended: false,
        };
        let handle = tokio::spawn(worker.run());

        Ok((
            Self {
                shared,
                worker: Mutex::new(Some(handle)),
            },
            event_rx,
        ))
    }

    /// Start the pipeline with the bundled ffmpeg extractor.
    pub fn spawn_with_ffmpeg(
        config: GeneratorConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GeneratorEvent>)> {
        let extractor = Arc::new(FfmpegExtractor::new(&config));
        Self::spawn(config, extractor)
    }

    /// Thumbnails produced so far and not yet expired.
    pub fn thumbnails(&self) -> Vec<GeneratedThumbnail> {
        self.shared.state.lock().unwrap().thumbnails.clone()
    }

    pub fn has_playlist_ended(&self) -> bool {
        self.shared.state.lock().unwrap().playlist_ended
    }

    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().unwrap().finished
    }

    /// Stop the pipeline: no further events are emitted, timers are
    /// cancelled and in-flight work is aborted best-effort. Unless
    /// `keep_files` is set (or `never_delete` was configured), every
    /// thumbnail this generator produced and its manifest are unlinked.
    pub async fn destroy(&self, keep_files: bool) {
        self.shared
            .keep_files_on_destroy
            .store(keep_files, Ordering::SeqCst);
        self.shared.token.cancel();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "generator worker did not shut down cleanly");
            }
        }
    }
}

struct GeneratorWorker {
    config: GeneratorConfig,
    poller: PlaylistPoller,
    fetcher: SegmentFetcher,
    scheduler: ThumbnailScheduler,
    lifecycle: LifecycleManager,
    manifest: ManifestWriter,
    extractor: Arc<dyn FrameExtractor>,
    events: mpsc::UnboundedSender<GeneratorEvent>,
    shared: Arc<GeneratorShared>,
    /// Filename prefix, fixed once the effective playlist URL is known.
    prefix: Option<String>,
    /// `(media_sequence, segments.len())` of the last snapshot, for
    /// marking the whole window removed when the playlist disappears.
    last_window: Option<(u64, usize)>,
    gone: bool,
    /// Sticky end-list latch; `PlaylistEnded` fires exactly once.
    ended: bool,
}

impl GeneratorWorker {
    async fn run(mut self) {
        let token = self.shared.token.clone();
        let mut gc = tokio::time::interval_at(
            Instant::now() + self.config.gc_interval,
            self.config.gc_interval,
        );
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_poll = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.teardown().await;
                    return;
                }
                _ = tokio::time::sleep_until(next_poll), if !self.gone => {
                    match self.iteration(&token).await {
                        Ok(()) => {}
                        Err(GeneratorError::Cancelled) => {
                            self.teardown().await;
                            return;
                        }
                        Err(err) => {
                            error!(error = %err, url = %self.config.playlist_url, "generator failed before initialization");
                            let _ = self.events.send(GeneratorEvent::Error(Arc::new(err)));
                            return;
                        }
                    }
                    if self.gone && self.lifecycle.is_drained() {
                        self.finish().await;
                        return;
                    }
                    // The timer re-arms only once the iteration is done;
                    // ticks never overlap.
                    next_poll = Instant::now() + self.poller.next_poll_delay();
                }
                _ = gc.tick(), if !self.config.never_delete => {
                    if self.collect_garbage().await {
                        return;
                    }
                }
            }
        }
    }

    async fn iteration(&mut self, token: &CancellationToken) -> Result<()> {
        match self.poller.poll(token).await? {
            PollOutcome::Unchanged => Ok(()),
            PollOutcome::Changed(snapshot) => self.handle_changed(snapshot, token).await,
            PollOutcome::Gone => {
                if self.poller.effective_url().is_none() {
                    // Never got a playlist; surface instead of lingering.
                    return Err(GeneratorError::PlaylistGone {
                        url: self.config.playlist_url.clone(),
                    });
                }
                self.handle_gone().await;
                Ok(())
            }
        }
    }

    async fn handle_changed(
        &mut self,
        snapshot: PlaylistSnapshot,
        token: &CancellationToken,
    ) -> Result<()> {
        let now = unix_millis();
        let prefix = match &self.prefix {
            Some(prefix) => prefix.clone(),
            None => {
                let prefix = self.config.output_name_prefix.clone().unwrap_or_else(|| {
                    self.poller
                        .effective_url()
                        .map(default_prefix)
                        .unwrap_or_else(|| "thumbnail".to_string())
                });
                debug!(prefix, "output name prefix selected");
                self.prefix = Some(prefix.clone());
                prefix
            }
        };

        let marked = self.lifecycle.observe_window_start(snapshot.media_sequence, now);
        let produced = self
            .scheduler
            .run_tick(
                &snapshot,
                &self.lifecycle,
                &self.fetcher,
                self.extractor.as_ref(),
                &prefix,
                token,
            )
            .await?;

        for thumbnail in &produced {
            self.lifecycle
                .record_thumbnail(thumbnail.sn, thumbnail.time, thumbnail.name.clone());
        }
        let ended_now = snapshot.end_list && !self.ended;
        if ended_now {
            self.ended = true;
        }
        self.last_window = Some((snapshot.media_sequence, snapshot.segments.len()));

        {
            let mut state = self.shared.state.lock().unwrap();
            state.thumbnails.extend(produced.iter().cloned());
            if ended_now {
                state.playlist_ended = true;
            }
        }

        // Manifest lands before the events so readers woken by an event
        // never observe staler state than the event itself.
        let dirty = marked > 0 || !produced.is_empty() || ended_now;
        if dirty {
            self.manifest
                .write_logged(&self.lifecycle.to_manifest(self.ended))
                .await;
        }
        for thumbnail in &produced {
            let _ = self
                .events
                .send(GeneratorEvent::ThumbnailCreated(thumbnail.clone()));
        }
        if ended_now {
            info!(url = %self.config.playlist_url, "playlist ended");
            let _ = self.events.send(GeneratorEvent::PlaylistEnded);
        }
        if !produced.is_empty() {
            let _ = self.events.send(GeneratorEvent::ThumbnailsChanged);
        }
        Ok(())
    }

    async fn handle_gone(&mut self) {
        info!(url = %self.config.playlist_url, "playlist gone");
        self.gone = true;
        let now = unix_millis();
        if let Some((first, len)) = self.last_window {
            self.lifecycle.mark_all_removed(first, len, now);
        }
        self.manifest
            .write_logged(&self.lifecycle.to_manifest(self.ended))
            .await;
    }

    /// One expiry sweep. Returns true when the generator is finished.
    async fn collect_garbage(&mut self) -> bool {
        let now = unix_millis();
        let expire_ms = self
            .config
            .expire_time
            .map_or(0, |d| d.as_millis() as i64);
        let reaped = self.lifecycle.sweep(now, expire_ms);

        if !reaped.is_empty() {
            let mut removed = Vec::new();
            for record in &reaped {
                for thumbnail in &record.thumbnails {
                    remove_file_verified(&self.config.output_dir.join(&thumbnail.name)).await;
                    removed.push((record.sn, thumbnail.name.clone()));
                }
            }
            {
                let mut state = self.shared.state.lock().unwrap();
                state
                    .thumbnails
                    .retain(|t| !removed.iter().any(|(sn, name)| t.sn == *sn && t.name == *name));
            }
            self.manifest
                .write_logged(&self.lifecycle.to_manifest(self.ended))
                .await;
            for (sn, name) in removed {
                let _ = self
                    .events
                    .send(GeneratorEvent::ThumbnailRemoved { sn, name });
            }
            let _ = self.events.send(GeneratorEvent::ThumbnailsChanged);
        }

        if self.gone && self.lifecycle.is_drained() {
            self.finish().await;
            return true;
        }
        false
    }

    async fn finish(&mut self) {
        info!(url = %self.config.playlist_url, "generator finished");
        self.shared.state.lock().unwrap().finished = true;
        if !self.config.never_delete {
            self.manifest.remove().await;
        }
        let _ = self.events.send(GeneratorEvent::Finished);
    }

    /// Cleanup after `destroy()`. Emits nothing.
    async fn teardown(&mut self) {
        let keep = self.config.never_delete
            || self.shared.keep_files_on_destroy.load(Ordering::SeqCst);
        if keep {
            debug!(url = %self.config.playlist_url, "destroyed, files kept");
            return;
        }
        // A prefix only exists once a playlist was seen; without one,
        // nothing was ever written.
        if let Some(prefix) = self.prefix.clone() {
            remove_prefixed_files(&self.config.output_dir, &prefix).await;
            remove_prefixed_files(&self.config.temp_dir, &prefix).await;
        }
        self.manifest.remove().await;
        debug!(url = %self.config.playlist_url, "destroyed, files removed");
    }
}

/// Unlink with gone-is-success semantics.
async fn remove_file_verified(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to unlink thumbnail"),
    }
}

/// Remove every file in `dir` that belongs to this generator per the
/// `<prefix>-` naming scheme. Catches frames a cancelled extraction left
/// behind that were never recorded.
async fn remove_prefixed_files(dir: &Path, prefix: &str) {
    let marker = format!("{prefix}-");
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "failed to scan directory during teardown");
            return;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if name
            .to_str()
            .is_some_and(|name| name.starts_with(&marker))
        {
            remove_file_verified(&entry.path()).await;
        }
    }
}
