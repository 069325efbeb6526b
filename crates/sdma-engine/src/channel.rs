//! Destination-routed consumer channels.
//!
//! A channel is one consumer endpoint on a device. It claims a set of
//! destinations exactly once; completions for those destinations land
//! in its receive queue in completion order. Reads and writes come in a
//! copying form and a zero-copy form, where the zero-copy form moves
//! buffer ownership to the consumer by index.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use crate::buffer::{Buffer, OwnerState};
use crate::device::{Device, ReadResult, WriteRequest};
use crate::error::{DmaError, FrameError, Result};
use crate::lock;
use crate::queue::BufferQueue;

/// Destinations addressable on one device.
pub const MAX_DEST: usize = 256;

/// Set of destinations, one bit per destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DestMask {
    bits: [u64; MAX_DEST / 64],
}

impl DestMask {
    pub const EMPTY: Self = Self { bits: [0; MAX_DEST / 64] };

    pub fn all() -> Self {
        Self { bits: [u64::MAX; MAX_DEST / 64] }
    }

    pub fn single(dest: u16) -> Self {
        let mut m = Self::EMPTY;
        m.set(dest);
        m
    }

    pub fn from_dests(dests: &[u16]) -> Self {
        let mut m = Self::EMPTY;
        for &d in dests {
            m.set(d);
        }
        m
    }

    /// Destinations past [`MAX_DEST`] are ignored.
    pub fn set(&mut self, dest: u16) {
        if usize::from(dest) < MAX_DEST {
            self.bits[usize::from(dest) / 64] |= 1 << (dest % 64);
        }
    }

    pub fn contains(&self, dest: u16) -> bool {
        usize::from(dest) < MAX_DEST && self.bits[usize::from(dest) / 64] & 1 << (dest % 64) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..MAX_DEST as u16).filter(|&d| self.contains(d))
    }
}

pub struct Channel {
    id: u64,
    dev: Weak<Device>,
    queue: BufferQueue,
    mask: Mutex<DestMask>,
    closed: AtomicBool,
}

impl Channel {
    pub(crate) fn new(id: u64, dev: Weak<Device>, queue_capacity: usize) -> Self {
        Self {
            id,
            dev,
            queue: BufferQueue::new(queue_capacity),
            mask: Mutex::new(DestMask::EMPTY),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn device(&self) -> Result<Arc<Device>> {
        self.dev.upgrade().ok_or(DmaError::DeviceGone)
    }

    pub(crate) fn push_receive(&self, buf: Arc<Buffer>) -> std::result::Result<(), Arc<Buffer>> {
        self.queue.push(buf)
    }

    /// Claim a destination set. At most one registration per channel,
    /// and the claim is atomic: if any destination is already owned the
    /// whole call fails and nothing is granted.
    pub fn register_destinations(self: &Arc<Self>, mask: DestMask) -> Result<()> {
        if mask.is_empty() {
            return Err(DmaError::BadConfig("destination mask is empty"));
        }
        let dev = self.device()?;
        let mut cur = lock(&self.mask);
        if !cur.is_empty() {
            return Err(DmaError::MaskAlreadySet);
        }
        dev.claim_destinations(self, mask)?;
        *cur = mask;
        Ok(())
    }

    pub fn destinations(&self) -> DestMask {
        *lock(&self.mask)
    }

    /// Whether a completed frame is waiting.
    pub fn read_ready(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Take the next completed frame without blocking.
    ///
    /// With `dst` the payload is copied out and the buffer immediately
    /// recycled. If `dst` is shorter than the frame the copy truncates
    /// and [`FrameError::MAX`] is set on the result. Without `dst` the
    /// buffer itself is handed to this channel and must come back via
    /// [`return_indexes`](Self::return_indexes) or a zero-copy write.
    pub fn try_read(&self, dst: Option<&mut [u8]>) -> Result<Option<ReadResult>> {
        let dev = self.device()?;
        let Some(buf) = self.queue.pop() else {
            return Ok(None);
        };
        let (dest, flags, mut error, size) = {
            let m = buf.meta();
            (m.dest, m.flags, m.error, m.size)
        };
        match dst {
            None => {
                let mut m = buf.meta();
                m.state = OwnerState::HeldByConsumer;
                m.owner = Some(self.id);
            }
            Some(out) => {
                if out.len() < size as usize {
                    warn!(index = buf.index(), size, space = out.len(), "frame truncated");
                    error |= FrameError::MAX;
                }
                let copy = (size as usize).min(out.len()).min(buf.capacity());
                let copied = buf.read_payload(0, &mut out[..copy]);
                dev.return_buffer(&buf);
                copied?;
            }
        }
        Ok(Some(ReadResult {
            index: buf.index(),
            dest,
            flags,
            error,
            size,
        }))
    }

    /// Blocking form of [`try_read`](Self::try_read). Fails with
    /// [`DmaError::Interrupted`] if the channel closes while waiting.
    pub fn read_blocking(&self, mut dst: Option<&mut [u8]>) -> Result<ReadResult> {
        loop {
            if let Some(r) = self.try_read(dst.as_deref_mut())? {
                return Ok(r);
            }
            if !self.queue.wait_for_data() {
                return Err(DmaError::Interrupted);
            }
        }
    }

    /// Send one frame. See [`WriteRequest`] for the copying and
    /// zero-copy forms. Returns the submitted payload size.
    pub fn write(&self, req: &WriteRequest<'_>) -> Result<u32> {
        let dev = self.device()?;
        dev.submit_from_channel(self.id, req)
    }

    /// Pop a free transmit buffer and hand it to this channel for
    /// zero-copy filling.
    pub fn acquire_tx_index(&self) -> Result<u32> {
        let dev = self.device()?;
        let buf = dev.free_queue().pop().ok_or(DmaError::WouldBlock)?;
        let mut m = buf.meta();
        m.state = OwnerState::HeldByConsumer;
        m.owner = Some(self.id);
        Ok(buf.index())
    }

    /// Return consumer-held buffers without transmitting. The whole
    /// batch is validated before any buffer moves, so an invalid index
    /// mutates nothing.
    pub fn return_indexes(&self, indexes: &[u32]) -> Result<()> {
        let dev = self.device()?;
        let mut bufs = Vec::with_capacity(indexes.len());
        for &idx in indexes {
            let buf = dev.buffer(idx).ok_or(DmaError::InvalidIndex(idx))?;
            {
                let m = buf.meta();
                if m.state != OwnerState::HeldByConsumer || m.owner != Some(self.id) {
                    return Err(DmaError::NotOwner(idx));
                }
            }
            bufs.push(buf);
        }
        for buf in bufs {
            buf.meta().owner = None;
            dev.return_buffer(&buf);
        }
        Ok(())
    }

    /// Release destinations, cancel blocked readers and hand every
    /// buffer this channel holds back to the device. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(dev) = self.dev.upgrade() else {
            return;
        };
        dev.release_destinations(self.id);
        *lock(&self.mask) = DestMask::EMPTY;
        self.queue.close();
        while let Some(buf) = self.queue.pop() {
            dev.return_buffer(&buf);
        }
        dev.reclaim_held_by(self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
