//! End-to-end pipeline tests against an in-process HLS fixture server.
//!
//! The fixture serves a mutable media playlist plus dummy segment bodies
//! (frame extraction is scripted, so segment content is irrelevant).
//! Server startup follows the local-fixture pattern: bind
//! `127.0.0.1:0`, mark non-blocking, hand off to tokio, spawn
//! `axum::serve` in the background.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use url::Url;

use filmstrip::{
    ExtractRequest, ExtractedFrame, FrameExtractor, GeneratedThumbnail, GeneratorConfig,
    GeneratorError, GeneratorEvent, Manifest, ThumbnailGenerator,
};

#[derive(Default)]
struct FixtureState {
    /// `None` makes the playlist endpoint return 404.
    playlist: Option<String>,
    playlist_hits: u64,
}

#[derive(Clone, Default)]
struct StreamFixture {
    state: Arc<Mutex<FixtureState>>,
}

impl StreamFixture {
    fn set_playlist(&self, body: impl Into<String>) {
        self.state.lock().unwrap().playlist = Some(body.into());
    }

    fn set_missing(&self) {
        self.state.lock().unwrap().playlist = None;
    }

    fn playlist_hits(&self) -> u64 {
        self.state.lock().unwrap().playlist_hits
    }

    /// Start the fixture server and return the playlist URL.
    async fn start(&self) -> Url {
        let state = Arc::clone(&self.state);
        let app = Router::new()
            .route(
                "/live.m3u8",
                get(move || {
                    let state = Arc::clone(&state);
                    async move {
                        let mut state = state.lock().unwrap();
                        state.playlist_hits += 1;
                        match &state.playlist {
                            Some(body) => (
                                StatusCode::OK,
                                [("content-type", "application/vnd.apple.mpegurl")],
                                body.clone(),
                            )
                                .into_response(),
                            None => StatusCode::NOT_FOUND.into_response(),
                        }
                    }
                }),
            )
            .route(
                "/{segment}",
                get(|| async { Bytes::from_static(b"not-really-mpegts") }),
            );

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind fixture server");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/live.m3u8")).unwrap()
    }
}

fn media_playlist(media_sequence: u64, target_duration: u64, count: usize, end_list: bool) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration}\n"));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));
    for i in 0..count {
        out.push_str("#EXTINF:6.0,\n");
        out.push_str(&format!("seg{}.ts\n", media_sequence + i as u64));
    }
    if end_list {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

/// Scripted extractor: one dummy JPEG per requested offset.
struct ScriptedExtractor;

async fn produce_frames(request: &ExtractRequest) -> filmstrip::Result<Vec<ExtractedFrame>> {
    let mut frames = Vec::new();
    let mut i = 0usize;
    loop {
        let offset = request.start + i as f64 * request.interval;
        if offset >= request.limit {
            break;
        }
        let index = request.first_index + i;
        let name = format!("{}-{index}.jpg", request.basename);
        tokio::fs::write(request.output_dir.join(&name), b"jpg").await?;
        frames.push(ExtractedFrame {
            index,
            time: (offset * 1000.0).round() / 1000.0,
            name,
        });
        i += 1;
    }
    Ok(frames)
}

#[async_trait]
impl FrameExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        request: ExtractRequest,
        _token: &CancellationToken,
    ) -> filmstrip::Result<Vec<ExtractedFrame>> {
        produce_frames(&request).await
    }
}

/// Extracts the first segment normally, then parks until cancelled.
#[derive(Default)]
struct BlockingExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl FrameExtractor for BlockingExtractor {
    async fn extract(
        &self,
        request: ExtractRequest,
        token: &CancellationToken,
    ) -> filmstrip::Result<Vec<ExtractedFrame>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return produce_frames(&request).await;
        }
        token.cancelled().await;
        Err(GeneratorError::Cancelled)
    }
}

/// Opt-in log output: `RUST_LOG=filmstrip=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config(url: &Url, output_dir: &Path, temp_dir: &Path) -> GeneratorConfig {
    init_tracing();
    let mut config = GeneratorConfig::new(url.as_str());
    config.output_dir = output_dir.to_path_buf();
    config.temp_dir = temp_dir.to_path_buf();
    config.output_name_prefix = Some("t".to_string());
    config.playlist_retry_delay = Duration::from_millis(100);
    config.gc_interval = Duration::from_millis(150);
    config
}

async fn next_event(events: &mut UnboundedReceiver<GeneratorEvent>) -> GeneratorEvent {
    tokio::time::timeout(Duration::from_secs(15), events.recv())
        .await
        .expect("timed out waiting for generator event")
        .expect("event channel closed")
}

/// Drain events until one matches, collecting thumbnails seen on the way.
async fn wait_for(
    events: &mut UnboundedReceiver<GeneratorEvent>,
    mut pred: impl FnMut(&GeneratorEvent) -> bool,
) -> (Vec<GeneratedThumbnail>, GeneratorEvent) {
    let mut created = Vec::new();
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return (created, event);
        }
        if let GeneratorEvent::ThumbnailCreated(thumbnail) = event {
            created.push(thumbnail);
        }
    }
}

async fn read_manifest(path: &Path) -> Manifest {
    let body = tokio::fs::read(path).await.expect("manifest readable");
    serde_json::from_slice(&body).expect("manifest deserializes")
}

#[tokio::test]
async fn vod_playlist_backfills_target_count_evenly() {
    let fixture = StreamFixture::default();
    fixture.set_playlist(media_playlist(0, 6, 10, true));
    let url = fixture.start().await;

    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&url, output.path(), temp.path());
    config.target_thumbnail_count = Some(5);

    let (generator, mut events) =
        ThumbnailGenerator::spawn(config, Arc::new(ScriptedExtractor)).unwrap();

    let (created, _) = wait_for(&mut events, |e| {
        matches!(e, GeneratorEvent::PlaylistEnded)
    })
    .await;
    let positions: Vec<(u64, f64)> = created.iter().map(|t| (t.sn, t.time)).collect();
    assert_eq!(
        positions,
        vec![(0, 0.0), (2, 0.0), (4, 0.0), (6, 0.0), (8, 0.0)]
    );
    assert!(generator.has_playlist_ended());

    let manifest = read_manifest(&output.path().join("thumbnails.json")).await;
    assert!(manifest.ended);
    let sns: Vec<u64> = manifest.segments.iter().map(|s| s.sn).collect();
    assert_eq!(sns, vec![0, 2, 4, 6, 8]);
    for thumbnail in &created {
        assert!(output.path().join(&thumbnail.name).exists());
    }

    // Destroy with files kept.
    generator.destroy(true).await;
    assert!(output.path().join("t-0-0.jpg").exists());
    assert!(output.path().join("thumbnails.json").exists());
}

#[tokio::test]
async fn initial_count_backfills_only_the_tail() {
    let fixture = StreamFixture::default();
    fixture.set_playlist(media_playlist(0, 6, 10, true));
    let url = fixture.start().await;

    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&url, output.path(), temp.path());
    config.interval = Some(Duration::from_secs(6));
    config.initial_thumbnail_count = Some(3);

    let (generator, mut events) =
        ThumbnailGenerator::spawn(config, Arc::new(ScriptedExtractor)).unwrap();

    let (created, _) = wait_for(&mut events, |e| {
        matches!(e, GeneratorEvent::PlaylistEnded)
    })
    .await;
    let positions: Vec<(u64, f64)> = created.iter().map(|t| (t.sn, t.time)).collect();
    assert_eq!(positions, vec![(7, 0.0), (8, 0.0), (9, 0.0)]);

    // Destroy removes thumbnails and the manifest.
    generator.destroy(false).await;
    assert!(!output.path().join("t-7-0.jpg").exists());
    assert!(!output.path().join("thumbnails.json").exists());
}

#[tokio::test]
async fn sliding_window_extends_and_marks_removed() {
    let fixture = StreamFixture::default();
    // Target duration 2 keeps the poll cadence at one second.
    fixture.set_playlist(media_playlist(100, 2, 6, false));
    let url = fixture.start().await;

    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&url, output.path(), temp.path());
    config.interval = Some(Duration::from_secs(6));
    // Keep the sweep out of this test so sn 100 stays in the manifest.
    config.never_delete = true;

    let (generator, mut events) =
        ThumbnailGenerator::spawn(config, Arc::new(ScriptedExtractor)).unwrap();

    let (created, _) = wait_for(&mut events, |e| {
        matches!(e, GeneratorEvent::ThumbnailsChanged)
    })
    .await;
    assert_eq!(created.len(), 6);
    assert_eq!(created[0].sn, 100);
    assert_eq!(created[5].sn, 105);

    // SN 100 slides out, SN 106 slides in.
    fixture.set_playlist(media_playlist(101, 2, 6, false));
    let (created, _) = wait_for(&mut events, |e| {
        matches!(e, GeneratorEvent::ThumbnailCreated(t) if t.sn == 106)
    })
    .await;
    assert!(created.is_empty(), "only sn 106 should be new");

    let manifest = read_manifest(&output.path().join("thumbnails.json")).await;
    let removed: Vec<(u64, bool)> = manifest
        .segments
        .iter()
        .map(|s| (s.sn, s.removal_time.is_some()))
        .collect();
    assert!(removed.contains(&(100, true)), "sn 100 must carry a removal time");
    assert!(removed.contains(&(101, false)));

    generator.destroy(true).await;
}

#[tokio::test]
async fn playlist_404_is_tolerated_with_unlimited_retries() {
    let fixture = StreamFixture::default();
    let url = fixture.start().await;

    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&url, output.path(), temp.path());
    config.interval = Some(Duration::from_secs(6));
    config.ignore_playlist_404 = true;
    config.playlist_retry_count = -1;

    let (generator, mut events) =
        ThumbnailGenerator::spawn(config, Arc::new(ScriptedExtractor)).unwrap();

    // Let several 404 attempts happen before the stream appears.
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(fixture.playlist_hits() >= 3);
    fixture.set_playlist(media_playlist(0, 2, 2, false));

    let (created, _) = wait_for(&mut events, |e| {
        matches!(e, GeneratorEvent::ThumbnailsChanged)
    })
    .await;
    assert_eq!(created.len(), 2, "pipeline resumed after the 404 burst");
    assert!(!generator.is_finished());

    generator.destroy(false).await;
}

#[tokio::test]
async fn expired_segment_is_reaped_and_leaves_the_manifest() {
    let fixture = StreamFixture::default();
    fixture.set_playlist(media_playlist(100, 2, 6, false));
    let url = fixture.start().await;

    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&url, output.path(), temp.path());
    config.interval = Some(Duration::from_secs(6));
    config.expire_time = Some(Duration::from_millis(300));
    config.gc_interval = Duration::from_millis(100);

    let (generator, mut events) =
        ThumbnailGenerator::spawn(config, Arc::new(ScriptedExtractor)).unwrap();
    wait_for(&mut events, |e| {
        matches!(e, GeneratorEvent::ThumbnailsChanged)
    })
    .await;

    fixture.set_playlist(media_playlist(101, 2, 6, false));
    let (_, event) = wait_for(&mut events, |e| {
        matches!(e, GeneratorEvent::ThumbnailRemoved { sn: 100, .. })
    })
    .await;
    let GeneratorEvent::ThumbnailRemoved { name, .. } = event else {
        unreachable!();
    };
    assert!(
        !output.path().join(&name).exists(),
        "file must be gone once the removal event is out"
    );

    let manifest = read_manifest(&output.path().join("thumbnails.json")).await;
    assert!(manifest.segments.iter().all(|s| s.sn != 100));

    generator.destroy(false).await;
}

#[tokio::test]
async fn gone_playlist_drains_and_finishes() {
    let fixture = StreamFixture::default();
    fixture.set_playlist(media_playlist(100, 2, 2, false));
    let url = fixture.start().await;

    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&url, output.path(), temp.path());
    config.interval = Some(Duration::from_secs(6));
    config.playlist_retry_count = 0;
    config.gc_interval = Duration::from_millis(100);

    let (generator, mut events) =
        ThumbnailGenerator::spawn(config, Arc::new(ScriptedExtractor)).unwrap();
    wait_for(&mut events, |e| {
        matches!(e, GeneratorEvent::ThumbnailsChanged)
    })
    .await;

    fixture.set_missing();
    let mut removed = 0;
    loop {
        match next_event(&mut events).await {
            GeneratorEvent::ThumbnailRemoved { .. } => removed += 1,
            GeneratorEvent::Finished => break,
            _ => {}
        }
    }
    assert_eq!(removed, 2, "both thumbnails expire after the stream vanishes");
    assert!(generator.is_finished());
    assert!(
        !output.path().join("thumbnails.json").exists(),
        "manifest is unlinked once finished"
    );

    generator.destroy(false).await;
}

#[tokio::test]
async fn destroy_mid_extraction_unlinks_everything_silently() {
    let fixture = StreamFixture::default();
    fixture.set_playlist(media_playlist(100, 2, 2, false));
    let url = fixture.start().await;

    let output = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&url, output.path(), temp.path());
    config.interval = Some(Duration::from_secs(6));

    let (generator, mut events) =
        ThumbnailGenerator::spawn(config, Arc::new(BlockingExtractor::default())).unwrap();

    // First segment extracts, second parks; give the pipeline time to
    // write the first frame and block.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(output.path().join("t-100-0.jpg").exists());

    generator.destroy(false).await;

    // The tick never completed, so nothing was ever emitted and nothing
    // survives on disk.
    assert!(events.try_recv().is_err(), "no events may follow destroy");
    assert!(!output.path().join("t-100-0.jpg").exists());
    assert!(!output.path().join("thumbnails.json").exists());
    let mut leftovers = std::fs::read_dir(temp.path()).unwrap();
    assert!(
        leftovers.next().is_none(),
        "scratch directory must be clean after destroy"
    );
}
