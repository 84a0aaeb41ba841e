//! # Error taxonomy

use thiserror::Error;

/// Errors produced while segmenting a video.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing user supplied configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The frame source could not be opened, or it yielded no initial frame.
    #[error("video source unavailable: {0}")]
    SourceUnavailable(String),
    /// Two grids that must be co-sized are not.
    #[error("dimension mismatch: {left:?} vs {right:?}")]
    DimensionMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// A sink failed to accept a frame.
    #[error("failed to write to {sink} sink")]
    SinkWrite {
        sink: String,
        #[source]
        source: Box<Error>,
    },
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
