//! Error types shared by frame sources and the live buffer

use thiserror::Error;

/// Raised when a frame source cannot establish its stream.
///
/// Descriptors embedded in these messages are always redacted.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("unsupported stream descriptor: {0}")]
    UnsupportedScheme(String),
    #[error("media backend failed to initialize: {0}")]
    Init(String),
    #[error("failed to build capture pipeline: {0}")]
    Pipeline(String),
    #[error("stream {descriptor} failed to start: {reason}")]
    Start { descriptor: String, reason: String },
    #[error("stream {0} did not start within the connect timeout")]
    Timeout(String),
}

/// Lifecycle errors returned by [`LiveFrameBuffer::start`](crate::pipeline::LiveFrameBuffer::start).
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("acquisition is already running")]
    AlreadyRunning,
    #[error("buffer was stopped and its source closed")]
    Closed,
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[from] std::io::Error),
}
