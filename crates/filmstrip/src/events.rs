use std::sync::Arc;

use crate::error::GeneratorError;
use crate::scheduler::GeneratedThumbnail;

/// Events emitted by a generator, in the order the pipeline produced
/// them. Within one generator, thumbnail events are non-decreasing by
/// `(sn, time)`; `PlaylistEnded` and `Finished` fire at most once.
#[derive(Debug, Clone)]
pub enum GeneratorEvent {
    ThumbnailCreated(GeneratedThumbnail),
    ThumbnailRemoved {
        sn: u64,
        name: String,
    },
    /// Coalescing signal after any batch of created or removed
    /// thumbnails; consumers that only re-read the manifest can watch
    /// this one.
    ThumbnailsChanged,
    /// `#EXT-X-ENDLIST` was observed.
    PlaylistEnded,
    /// The playlist is gone and every segment record has been reaped.
    /// The generator is done after this.
    Finished,
    /// Fatal error before the generator could establish the effective
    /// playlist URL.
    Error(Arc<GeneratorError>),
}
