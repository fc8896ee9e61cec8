//! Error types for myko_vision.
//!
//! Every stage boundary returns one of these. The `Display` text of
//! `EngineError` doubles as the status string handed back to the caller of
//! `propose`/`select`, so keep it human-readable.

use thiserror::Error;

/// Failures while turning a wire payload into pixels or back.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("empty frame payload")]
    Empty,

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Failures reported by an instance-finding backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend `{0}` is not registered")]
    Unavailable(String),

    #[error("backend `{backend}` timed out after {millis} ms")]
    Timeout { backend: String, millis: u64 },

    #[error("backend `{backend}` failed: {reason}")]
    Failed { backend: String, reason: String },
}

/// Failures of the CPU worker pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,

    #[error("worker job panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Top-level error of the segmentation session.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No image available - send a frame over the WebSocket first.")]
    NoImage,

    #[error("No valid proposal indices provided ({proposal_count} proposal(s) live).")]
    NoValidIndices { proposal_count: usize },

    #[error("Selected indices did not contain valid filled contours.")]
    EmptySelection,

    #[error("Frame codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
