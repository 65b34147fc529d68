//! Background acquisition loop relaying the freshest frame to readers

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use crate::capture::FrameSource;
use crate::error::{BufferError, ConnectionError};
use crate::pipeline::slot::{FrameSlot, Grab, SlotStats};

const WORKER_NAME: &str = "livecam-acquire";

/// Lifecycle of the acquisition loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcquisitionState {
    /// Constructed, never started
    Stopped = 0,
    Running = 1,
    /// Stop requested and source closed; terminal
    Stopping = 2,
}

impl AcquisitionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AcquisitionState::Stopped,
            1 => AcquisitionState::Running,
            _ => AcquisitionState::Stopping,
        }
    }
}

struct Shared<S> {
    source: S,
    slot: FrameSlot,
    state: AtomicU8,
}

impl<S> Shared<S> {
    fn state(&self) -> AcquisitionState {
        AcquisitionState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Keeps the newest frame from a [`FrameSource`] available to any number of readers.
///
/// One dedicated thread pulls frames and publishes each result into a
/// [`FrameSlot`]; stale frames are overwritten, never queued. [`read`](Self::read)
/// returns whatever was published last without waiting on the producer.
///
/// The buffer is single-use: [`stop`](Self::stop) closes the source, after
/// which [`start`](Self::start) fails with [`BufferError::Closed`].
pub struct LiveFrameBuffer<S: FrameSource> {
    shared: Arc<Shared<S>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: FrameSource> LiveFrameBuffer<S> {
    pub fn new(source: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                slot: FrameSlot::new(),
                state: AtomicU8::new(AcquisitionState::Stopped as u8),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Open the source named by `descriptor` and wrap it, not yet started.
    pub fn open(descriptor: &str) -> Result<Self, ConnectionError> {
        Ok(Self::new(S::open(descriptor)?))
    }

    /// Spawn the acquisition thread.
    ///
    /// Only the caller that moves the state from `Stopped` to `Running`
    /// spawns, so concurrent calls start at most one loop.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), BufferError> {
        // Held across the spawn so a concurrent join() sees the handle.
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);

        if let Err(current) = self.shared.state.compare_exchange(
            AcquisitionState::Stopped as u8,
            AcquisitionState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match AcquisitionState::from_u8(current) {
                AcquisitionState::Stopping => BufferError::Closed,
                _ => BufferError::AlreadyRunning,
            });
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn(move || acquire(shared));

        match handle {
            Ok(handle) => {
                *worker = Some(handle);
                info!("Acquisition started");
                Ok(())
            }
            Err(e) => {
                self.abandon_start();
                Err(BufferError::Spawn(e))
            }
        }
    }

    /// Undo the `Stopped -> Running` move of a start whose spawn failed.
    /// A concurrent `stop()` wins and stays terminal.
    fn abandon_start(&self) {
        let _ = self.shared.state.compare_exchange(
            AcquisitionState::Running as u8,
            AcquisitionState::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Signal the loop to exit and close the source. Does not wait.
    ///
    /// A `read_one` already in flight is allowed to return; its result is
    /// dropped unless it raced past the state check, so at most one publish
    /// can land after this returns.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        let previous = AcquisitionState::from_u8(
            self.shared
                .state
                .swap(AcquisitionState::Stopping as u8, Ordering::AcqRel),
        );
        if previous == AcquisitionState::Stopping {
            return;
        }
        self.shared.source.close();
        info!(?previous, "Acquisition stopping, source closed");
    }

    /// Block until the acquisition thread has exited.
    ///
    /// Returns `false` when there was no thread to wait for. Call after
    /// [`stop`](Self::stop); on a running buffer this waits until the source
    /// ends on its own.
    pub fn join(&self) -> bool {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    error!("Acquisition thread panicked");
                }
                true
            }
            None => false,
        }
    }

    /// Latest published result; `Grab::Pending` until the first publish.
    pub fn read(&self) -> Grab {
        self.shared.slot.read()
    }

    /// Latest published result as a shared handle.
    pub fn latest(&self) -> Arc<Grab> {
        self.shared.slot.latest()
    }

    pub fn state(&self) -> AcquisitionState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == AcquisitionState::Running
    }

    pub fn stats(&self) -> SlotStats {
        self.shared.slot.stats()
    }
}

impl<S: FrameSource> Drop for LiveFrameBuffer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acquire<S: FrameSource>(shared: Arc<Shared<S>>) {
    let warn_after = crate::CONFIG.load().pipeline.miss_warn_threshold;
    let mut warned = false;

    loop {
        let read_start = Instant::now();
        let read = shared.source.read_one();
        metrics::histogram!("livecam_read_time_us").record(read_start.elapsed().as_micros() as f64);

        if shared.state() != AcquisitionState::Running {
            debug!("Discarding read completed after stop");
            break;
        }

        let grab = Grab::from(read);
        if grab.success() {
            metrics::counter!("livecam_frames_total").increment(1);
        } else {
            metrics::counter!("livecam_misses_total").increment(1);
        }
        shared.slot.publish(grab);

        let streak = shared.slot.stats().miss_streak;
        if streak == 0 && warned {
            info!("Stream recovered");
            warned = false;
        } else if warn_after > 0 && streak >= warn_after && !warned {
            warn!(streak, "Source keeps failing to deliver frames");
            warned = true;
        }
    }

    let stats = shared.slot.stats();
    info!(
        frames = stats.frames,
        misses = stats.misses,
        "Acquisition stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, FrameMetadata, PixelFormat, SyntheticSource};
    use std::time::Duration;

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            vec![0u8; 3],
            FrameMetadata::packed(sequence, 1, 1, PixelFormat::Rgb24),
        )
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn new_buffer_is_stopped_and_pending() {
        let buffer = LiveFrameBuffer::new(SyntheticSource::scripted([Some(frame(1))]));
        assert_eq!(buffer.state(), AcquisitionState::Stopped);
        assert!(buffer.read().is_pending());
        assert!(!buffer.join());
    }

    #[test]
    fn start_twice_is_rejected() {
        let buffer = LiveFrameBuffer::new(SyntheticSource::scripted([Some(frame(1))]));
        buffer.start().unwrap();
        assert!(matches!(buffer.start(), Err(BufferError::AlreadyRunning)));
        assert!(buffer.is_running());
        buffer.stop();
        assert!(buffer.join());
    }

    #[test]
    fn restart_after_stop_is_closed() {
        let buffer = LiveFrameBuffer::new(SyntheticSource::scripted([Some(frame(1))]));
        buffer.start().unwrap();
        buffer.stop();
        buffer.join();
        assert_eq!(buffer.state(), AcquisitionState::Stopping);
        assert!(matches!(buffer.start(), Err(BufferError::Closed)));
    }

    #[test]
    fn stop_before_start_closes_source() {
        let source = SyntheticSource::scripted([Some(frame(1))]);
        let probe = source.probe();
        let buffer = LiveFrameBuffer::new(source);
        buffer.stop();
        buffer.stop();
        assert_eq!(probe.closes(), 1);
        assert!(matches!(buffer.start(), Err(BufferError::Closed)));
        assert_eq!(probe.reads(), 0);
    }

    #[test]
    fn publishes_first_frame() {
        let buffer = LiveFrameBuffer::new(SyntheticSource::scripted([Some(frame(9))]));
        buffer.start().unwrap();
        assert!(wait_for(|| buffer.read().success()));
        assert_eq!(buffer.read().frame().map(Frame::sequence), Some(9));
        assert_eq!(buffer.stats().frames, 1);
        buffer.stop();
        buffer.join();
    }

    #[test]
    fn failed_spawn_rolls_back_to_stopped() {
        let buffer = LiveFrameBuffer::new(SyntheticSource::scripted([Some(frame(1))]));
        buffer
            .shared
            .state
            .store(AcquisitionState::Running as u8, Ordering::Release);
        buffer.abandon_start();
        assert_eq!(buffer.state(), AcquisitionState::Stopped);
    }

    #[test]
    fn failed_spawn_keeps_concurrent_stop() {
        let source = SyntheticSource::scripted([Some(frame(1))]);
        let probe = source.probe();
        let buffer = LiveFrameBuffer::new(source);
        buffer
            .shared
            .state
            .store(AcquisitionState::Running as u8, Ordering::Release);

        // stop() lands between the winning CAS and the failed spawn
        buffer.stop();
        buffer.abandon_start();

        assert_eq!(buffer.state(), AcquisitionState::Stopping);
        assert!(matches!(buffer.start(), Err(BufferError::Closed)));
        assert_eq!(probe.closes(), 1);
        assert_eq!(probe.reads(), 0);
    }

    #[test]
    fn open_propagates_connection_errors() {
        let result = LiveFrameBuffer::<SyntheticSource>::open("rtsp://cam/main");
        assert!(matches!(result, Err(ConnectionError::UnsupportedScheme(_))));
    }
}
