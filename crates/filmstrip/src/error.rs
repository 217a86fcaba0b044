use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("generator cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("playlist gone: {url}")]
    PlaylistGone { url: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("segment fetch error: {reason}")]
    SegmentFetch { reason: String },

    #[error("frame extraction error: {reason}")]
    Extraction { reason: String },

    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

pub type Result<T> = std::result::Result<T, GeneratorError>;

impl GeneratorError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn extraction(reason: impl Into<String>) -> Self {
        Self::Extraction {
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    /// Whether this error means the source playlist is not coming back.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::HttpStatus {
                status: StatusCode::NOT_FOUND,
                ..
            }
        )
    }

    /// Errors that tear the generator down rather than being absorbed by
    /// the per-tick taxonomy (skip segment, rewrite manifest next event).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Configuration { .. }
                | Self::InvalidUrl { .. }
                | Self::PlaylistGone { .. }
        )
    }
}
