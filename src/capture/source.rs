//! The contract the live buffer consumes to pull frames

use crate::capture::Frame;
use crate::error::ConnectionError;

/// A stream that yields decoded frames one at a time.
///
/// Methods take `&self`: the acquisition thread sits in [`read_one`](Self::read_one)
/// while the controlling thread may call [`close`](Self::close) to release the
/// stream, so implementations synchronise internally.
pub trait FrameSource: Send + Sync + 'static {
    /// Establish the stream named by an opaque descriptor.
    fn open(descriptor: &str) -> Result<Self, ConnectionError>
    where
        Self: Sized;

    /// Block until the next frame is decoded.
    ///
    /// Returns `None` on a transient miss (timeout, decode failure, closed
    /// stream) instead of erroring.
    fn read_one(&self) -> Option<Frame>;

    /// Release the stream. Idempotent, and wakes a blocked `read_one`
    /// where the backend allows it.
    fn close(&self);
}
