//! Stream DMA engine.
//!
//! A [`Device`](device::Device) owns two fixed pools of DMA buffers and
//! a card implementing [`HardwareOps`](hw::HardwareOps). Receive
//! buffers cycle through the hardware free list and come back as
//! completion ring entries, which the service path routes to whichever
//! [`Channel`](channel::Channel) has claimed the entry's destination.
//! Transmit buffers cycle between the device free queue, the card's
//! submit FIFO and back.
//!
//! Bus memory and register access live in the `sdma-mem` crate; this
//! crate is the ownership and routing machinery on top.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod hw;
pub mod queue;
pub mod registry;
pub mod ring;

pub use buffer::{Buffer, BufferFlags, BufferPool, Direction, OwnerState, StateCounts};
pub use channel::{Channel, DestMask, MAX_DEST};
pub use config::DeviceConfig;
pub use device::{Device, DeviceReport, MappedRegion, ReadResult, WriteRequest};
pub use error::{DmaError, FrameError, Result};
pub use hw::{CardReport, HardwareOps, HwCommand, RingCard};
pub use queue::BufferQueue;
pub use registry::{DeviceHandle, DeviceRegistry};
pub use ring::{CompletionRing, DescriptorWidth, RingEntry};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, riding through poisoning. The engine's shared state
/// stays structurally valid even if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
