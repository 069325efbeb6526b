use bitflags::bitflags;
use thiserror::Error;

use sdma_mem::MemError;

#[derive(Debug, Error)]
pub enum DmaError {
    #[error(transparent)]
    Mem(#[from] MemError),
    #[error("software queue full")]
    QueueFull,
    #[error("no transmit buffer available")]
    WouldBlock,
    #[error("wait interrupted by shutdown")]
    Interrupted,
    #[error("invalid buffer index {0}")]
    InvalidIndex(u32),
    #[error("buffer {0} not held by this channel")]
    NotOwner(u32),
    #[error("destination {0} out of range or unsupported")]
    InvalidDestination(u16),
    #[error("destination {0} already claimed by another channel")]
    DestinationBusy(u16),
    #[error("channel already has a destination mask registered")]
    MaskAlreadySet,
    #[error("zero-length write")]
    EmptyWrite,
    #[error("frame size {size} exceeds buffer size {limit}")]
    SizeTooLarge { size: u32, limit: u32 },
    #[error("register offset {offset:#x} outside the permitted window")]
    RegisterOutOfRange { offset: u64 },
    #[error("mapping offset {offset:#x} rejected: {reason}")]
    BadMapping { offset: u64, reason: &'static str },
    #[error("invalid device configuration: {0}")]
    BadConfig(&'static str),
    #[error("device registry full")]
    RegistryFull,
    #[error("stale or unknown device handle")]
    StaleHandle,
    #[error("device has been shut down")]
    DeviceGone,
}

pub type Result<T> = std::result::Result<T, DmaError>;

bitflags! {
    /// Per-frame receive error flags, accumulated by the completion path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameError: u8 {
        /// Hardware FIFO overflowed while receiving the frame.
        const FIFO = 0x01;
        /// Frame length mismatched what the protocol promised.
        const LEN = 0x02;
        /// Frame was larger than the receive buffer or caller space.
        const MAX = 0x04;
        /// Bus error while the frame was in flight.
        const BUS = 0x08;
    }
}
