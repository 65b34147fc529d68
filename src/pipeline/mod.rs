pub mod live;
pub mod slot;

pub use live::{AcquisitionState, LiveFrameBuffer};
pub use slot::{FrameSlot, Grab, SlotStats};
