//! Single-slot "latest frame" cell shared by one producer and many readers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;

use crate::capture::Frame;

/// Outcome of the most recent acquisition, as seen by readers.
///
/// Both `Pending` and `Missed` read as `(false, None)` through
/// [`into_parts`](Self::into_parts); the variants keep "never published" and
/// "last read failed" apart for callers that care.
#[derive(Debug, Clone, Default)]
pub enum Grab {
    /// Nothing has been published yet.
    #[default]
    Pending,
    /// The source failed to produce a frame on its last read.
    Missed,
    Frame(Frame),
}

impl Grab {
    pub fn success(&self) -> bool {
        matches!(self, Grab::Frame(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Grab::Pending)
    }

    pub fn frame(&self) -> Option<&Frame> {
        match self {
            Grab::Frame(frame) => Some(frame),
            Grab::Pending | Grab::Missed => None,
        }
    }

    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Grab::Frame(frame) => Some(frame),
            Grab::Pending | Grab::Missed => None,
        }
    }

    /// The `(success, frame)` pair view.
    pub fn into_parts(self) -> (bool, Option<Frame>) {
        let success = self.success();
        (success, self.into_frame())
    }
}

impl From<Option<Frame>> for Grab {
    fn from(read: Option<Frame>) -> Self {
        read.map_or(Grab::Missed, Grab::Frame)
    }
}

/// Snapshot of the slot's publish counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub published: u64,
    pub frames: u64,
    pub misses: u64,
    /// Consecutive misses since the last frame
    pub miss_streak: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    frames: AtomicU64,
    misses: AtomicU64,
    miss_streak: AtomicU64,
}

/// Holds the latest [`Grab`] behind an atomic pointer swap.
///
/// A publish replaces the whole value at once, so a reader gets either the
/// old pair or the new one. Reads never block and never allocate.
pub struct FrameSlot {
    latest: ArcSwap<Grab>,
    stats: CachePadded<Counters>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            latest: ArcSwap::from_pointee(Grab::Pending),
            stats: CachePadded::new(Counters::default()),
        }
    }

    /// Producer: replace the current value.
    pub fn publish(&self, grab: Grab) {
        match &grab {
            Grab::Frame(_) => {
                self.stats.frames.fetch_add(1, Ordering::Relaxed);
                self.stats.miss_streak.store(0, Ordering::Relaxed);
            }
            Grab::Missed => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.stats.miss_streak.fetch_add(1, Ordering::Relaxed);
            }
            Grab::Pending => {}
        }
        self.latest.store(Arc::new(grab));
        self.stats.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer: clone of the current value.
    pub fn read(&self) -> Grab {
        Grab::clone(&self.latest.load())
    }

    /// Consumer: shared handle to the current value without cloning the frame.
    pub fn latest(&self) -> Arc<Grab> {
        self.latest.load_full()
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            published: self.stats.published.load(Ordering::Relaxed),
            frames: self.stats.frames.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            miss_streak: self.stats.miss_streak.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            vec![sequence as u8; 3],
            FrameMetadata::packed(sequence, 1, 1, PixelFormat::Rgb24),
        )
    }

    #[test]
    fn starts_pending() {
        let slot = FrameSlot::new();
        let grab = slot.read();
        assert!(grab.is_pending());
        let (success, frame) = grab.into_parts();
        assert!(!success);
        assert!(frame.is_none());
        assert_eq!(slot.stats(), SlotStats::default());
    }

    #[test]
    fn read_returns_latest_publish() {
        let slot = FrameSlot::new();
        slot.publish(Grab::Frame(frame(1)));
        slot.publish(Grab::Frame(frame(2)));
        assert_eq!(slot.read().frame().map(Frame::sequence), Some(2));

        slot.publish(Grab::Missed);
        let (success, frame) = slot.read().into_parts();
        assert!(!success);
        assert!(frame.is_none());
        assert!(!slot.read().is_pending());
    }

    #[test]
    fn reads_share_pixels() {
        let slot = FrameSlot::new();
        slot.publish(Grab::Frame(frame(7)));
        let a = slot.read().into_frame().unwrap();
        let b = slot.latest();
        assert_eq!(a.data.as_ptr(), b.frame().unwrap().data.as_ptr());
    }

    #[test]
    fn stats_track_miss_streaks() {
        let slot = FrameSlot::new();
        slot.publish(Grab::from(None));
        slot.publish(Grab::from(None));
        assert_eq!(slot.stats().miss_streak, 2);

        slot.publish(Grab::from(Some(frame(1))));
        slot.publish(Grab::Missed);
        assert_eq!(
            slot.stats(),
            SlotStats {
                published: 4,
                frames: 1,
                misses: 3,
                miss_streak: 1,
            }
        );
    }
}
