//! One DMA engine instance: buffer pools, the card behind the
//! capability seam and the destination routing table.
//!
//! Locking is deliberately small: the card's submit lock covers all
//! hardware occupancy state, the routing table has its own lock and is
//! only ever taken after the submit lock, and the control lock
//! serializes register-level control operations. Nothing is held across
//! a blocking wait.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{info, warn};

use sdma_mem::mmio::RegisterIo;
use sdma_mem::{BusAddr, BusHeap};

use crate::buffer::{Buffer, BufferFlags, BufferPool, Direction, OwnerState, StateCounts};
use crate::channel::{Channel, DestMask, MAX_DEST};
use crate::config::DeviceConfig;
use crate::error::{DmaError, FrameError, Result};
use crate::hw::{CardReport, HardwareOps, HwCommand, RingCard};
use crate::lock;
use crate::queue::BufferQueue;

/// One outbound frame.
///
/// `data` selects the form: `Some` copies the payload into a free
/// transmit buffer, `None` submits the consumer-held buffer named by
/// `index` with `size` valid bytes already in place.
#[derive(Debug, Clone)]
pub struct WriteRequest<'a> {
    pub data: Option<&'a [u8]>,
    pub index: u32,
    pub size: u32,
    pub dest: u16,
    pub flags: BufferFlags,
}

impl<'a> WriteRequest<'a> {
    pub fn copying(dest: u16, data: &'a [u8]) -> Self {
        Self { data: Some(data), index: 0, size: 0, dest, flags: BufferFlags::default() }
    }

    pub fn by_index(dest: u16, index: u32, size: u32) -> Self {
        Self { data: None, index, size, dest, flags: BufferFlags::default() }
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// One completed inbound frame as seen by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult {
    /// Buffer index; owned by the caller after a zero-copy read.
    pub index: u32,
    pub dest: u16,
    pub flags: BufferFlags,
    pub error: FrameError,
    pub size: u32,
}

/// What a mapping offset resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedRegion {
    /// One whole buffer, identified by device-global index.
    Buffer { index: u32 },
    /// A window into register space, offset relative to its base.
    Registers { offset: u64 },
}

/// Occupancy snapshot across the whole device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceReport {
    pub rx: StateCounts,
    pub tx: StateCounts,
    pub free_queue_len: u32,
    pub card: CardReport,
}

pub struct Device {
    cfg: DeviceConfig,
    regs: Arc<dyn RegisterIo>,
    hw: Box<dyn HardwareOps>,
    tx_pool: BufferPool,
    rx_pool: BufferPool,
    free_queue: BufferQueue,
    /// Destination routing table, indexed by destination.
    channels: Mutex<Vec<Option<Weak<Channel>>>>,
    /// Serializes control operations that touch registers.
    control: Mutex<()>,
    valid_dests: DestMask,
    debug: AtomicU8,
    next_channel_id: AtomicU64,
}

impl Device {
    /// Bring up a device: allocate both pools, build the card, program
    /// it and seed the receive free list. Fails without side effects if
    /// any allocation fails.
    pub fn new(
        cfg: DeviceConfig,
        heap: Arc<BusHeap>,
        regs: Arc<dyn RegisterIo>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let tx_pool = BufferPool::allocate(
            &heap,
            cfg.tx_count,
            0,
            Direction::ToDevice,
            cfg.mode,
            cfg.buffer_size as usize,
        )?;
        let rx_pool = BufferPool::allocate(
            &heap,
            cfg.rx_count,
            cfg.tx_count,
            Direction::Bidirectional,
            cfg.mode,
            cfg.buffer_size as usize,
        )?;
        let free_queue = BufferQueue::new(cfg.tx_count as usize);
        for buf in tx_pool.iter() {
            buf.set_state(OwnerState::Free);
            if free_queue.push(buf.clone()).is_err() {
                return Err(DmaError::QueueFull);
            }
        }
        let hw = Box::new(RingCard::new(&heap, regs.clone(), &cfg)?);
        let dev = Arc::new(Self {
            regs,
            hw,
            tx_pool,
            rx_pool,
            free_queue,
            channels: Mutex::new(vec![None; MAX_DEST]),
            control: Mutex::new(()),
            valid_dests: DestMask::all(),
            debug: AtomicU8::new(0),
            next_channel_id: AtomicU64::new(1),
            cfg,
        });
        dev.hw.init(&dev)?;
        dev.hw.enable(&dev);
        info!(
            rx = dev.cfg.rx_count,
            tx = dev.cfg.tx_count,
            buffer_size = dev.cfg.buffer_size,
            "device online"
        );
        Ok(dev)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    pub fn rx_pool(&self) -> &BufferPool {
        &self.rx_pool
    }

    pub fn tx_pool(&self) -> &BufferPool {
        &self.tx_pool
    }

    pub fn free_queue(&self) -> &BufferQueue {
        &self.free_queue
    }

    pub fn hw_ops(&self) -> &dyn HardwareOps {
        self.hw.as_ref()
    }

    pub fn buffer_count(&self) -> u32 {
        self.rx_pool.count() + self.tx_pool.count()
    }

    pub fn rx_buffer_count(&self) -> u32 {
        self.rx_pool.count()
    }

    pub fn tx_buffer_count(&self) -> u32 {
        self.tx_pool.count()
    }

    pub fn buffer_size(&self) -> u32 {
        self.cfg.buffer_size
    }

    pub fn debug(&self) -> u8 {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, level: u8) {
        self.debug.store(level, Ordering::Relaxed);
    }

    /// Look up any buffer of either pool by device-global index.
    pub fn buffer(&self, index: u32) -> Option<Arc<Buffer>> {
        self.tx_pool
            .get(index)
            .or_else(|| self.rx_pool.get(index))
            .cloned()
    }

    pub fn find_by_handle(&self, handle: BusAddr) -> Option<Arc<Buffer>> {
        self.tx_pool
            .find_by_handle(handle)
            .or_else(|| self.rx_pool.find_by_handle(handle))
            .cloned()
    }

    /// Open a consumer channel. The channel owns no destinations until
    /// it registers a mask.
    pub fn open(self: &Arc<Self>) -> Arc<Channel> {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Channel::new(
            id,
            Arc::downgrade(self),
            self.cfg.rx_count as usize,
        ))
    }

    /// Atomically claim every destination in `mask` for `ch`. Either
    /// the whole mask is granted or nothing changes.
    pub(crate) fn claim_destinations(&self, ch: &Arc<Channel>, mask: DestMask) -> Result<()> {
        let mut tbl = lock(&self.channels);
        for d in mask.iter() {
            let live = tbl[usize::from(d)]
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|c| !c.is_closed());
            if live {
                return Err(DmaError::DestinationBusy(d));
            }
        }
        for d in mask.iter() {
            tbl[usize::from(d)] = Some(Arc::downgrade(ch));
        }
        Ok(())
    }

    pub(crate) fn release_destinations(&self, chan_id: u64) {
        let mut tbl = lock(&self.channels);
        for slot in tbl.iter_mut() {
            let owned = slot
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|c| c.id() == chan_id);
            if owned {
                *slot = None;
            }
        }
    }

    pub(crate) fn channel_for(&self, dest: u16) -> Option<Arc<Channel>> {
        if usize::from(dest) >= MAX_DEST {
            return None;
        }
        lock(&self.channels)[usize::from(dest)]
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|c| !c.is_closed())
    }

    /// Hand a buffer back to its home: transmit buffers to the free
    /// queue, receive buffers to the hardware free path.
    pub(crate) fn return_buffer(&self, buf: &Arc<Buffer>) {
        if self.tx_pool.contains_index(buf.index()) {
            buf.set_state(OwnerState::Free);
            if self.free_queue.push(buf.clone()).is_err() {
                warn!(index = buf.index(), "free queue rejected returned buffer");
            }
        } else if let Err(err) = self.hw.reclaim(self, std::slice::from_ref(buf)) {
            warn!(index = buf.index(), %err, "could not reclaim receive buffer");
        }
    }

    /// Reclaim every buffer a closing channel still holds by index.
    pub(crate) fn reclaim_held_by(&self, chan_id: u64) {
        for pool in [&self.tx_pool, &self.rx_pool] {
            for buf in pool.iter() {
                let held = {
                    let mut m = buf.meta();
                    if m.state == OwnerState::HeldByConsumer && m.owner == Some(chan_id) {
                        m.owner = None;
                        true
                    } else {
                        false
                    }
                };
                if held {
                    self.return_buffer(buf);
                }
            }
        }
    }

    pub(crate) fn submit_from_channel(&self, chan_id: u64, req: &WriteRequest<'_>) -> Result<u32> {
        if !self.valid_dests.contains(req.dest) {
            return Err(DmaError::InvalidDestination(req.dest));
        }
        let (buf, size) = match req.data {
            Some(data) => {
                if data.is_empty() {
                    return Err(DmaError::EmptyWrite);
                }
                if data.len() > self.cfg.buffer_size as usize {
                    return Err(DmaError::SizeTooLarge {
                        size: data.len() as u32,
                        limit: self.cfg.buffer_size,
                    });
                }
                let buf = self.free_queue.pop().ok_or(DmaError::WouldBlock)?;
                if let Err(err) = buf.write_payload(0, data) {
                    buf.set_state(OwnerState::Free);
                    let _ = self.free_queue.push(buf);
                    return Err(err);
                }
                (buf, data.len() as u32)
            }
            None => {
                if req.size == 0 {
                    return Err(DmaError::EmptyWrite);
                }
                if req.size > self.cfg.buffer_size {
                    return Err(DmaError::SizeTooLarge {
                        size: req.size,
                        limit: self.cfg.buffer_size,
                    });
                }
                let buf = self
                    .buffer(req.index)
                    .ok_or(DmaError::InvalidIndex(req.index))?;
                {
                    let mut m = buf.meta();
                    if m.state != OwnerState::HeldByConsumer || m.owner != Some(chan_id) {
                        return Err(DmaError::NotOwner(req.index));
                    }
                    m.owner = None;
                }
                (buf, req.size)
            }
        };
        {
            let mut m = buf.meta();
            m.dest = req.dest;
            m.size = size;
            m.flags = req.flags;
            m.error = FrameError::empty();
            m.use_count += 1;
        }
        if let Err(err) = self.hw.submit(self, std::slice::from_ref(&buf)) {
            // Undo the ownership move so the buffer is not lost.
            if self.tx_pool.contains_index(buf.index()) && req.data.is_some() {
                buf.set_state(OwnerState::Free);
                let _ = self.free_queue.push(buf);
            } else {
                let mut m = buf.meta();
                m.state = OwnerState::HeldByConsumer;
                m.owner = Some(chan_id);
            }
            return Err(err);
        }
        Ok(size)
    }

    /// Whether a copying write could currently obtain a buffer.
    pub fn write_ready(&self) -> bool {
        !self.free_queue.is_empty()
    }

    /// Run one service pass over the card's completion rings. This is
    /// the interrupt bottom half; call it when the card raises its
    /// line, or periodically when polling.
    pub fn service_interrupt(&self) -> u32 {
        self.hw.service(self)
    }

    pub fn hw_command(&self, cmd: HwCommand) -> Result<u32> {
        let _g = lock(&self.control);
        self.hw.command(self, cmd)
    }

    pub fn rx_state_counts(&self) -> StateCounts {
        self.rx_pool.state_counts()
    }

    pub fn tx_state_counts(&self) -> StateCounts {
        self.tx_pool.state_counts()
    }

    pub fn report(&self) -> DeviceReport {
        DeviceReport {
            rx: self.rx_pool.state_counts(),
            tx: self.tx_pool.state_counts(),
            free_queue_len: self.free_queue.len() as u32,
            card: self.hw.report(),
        }
    }

    /// Read a register inside the permitted window.
    pub fn read_register(&self, offset: u64) -> Result<u32> {
        self.check_register_offset(offset)?;
        let _g = lock(&self.control);
        Ok(self.regs.read_reg32(offset))
    }

    /// Write a register inside the permitted window.
    pub fn write_register(&self, offset: u64, value: u32) -> Result<()> {
        self.check_register_offset(offset)?;
        let _g = lock(&self.control);
        self.regs.write_reg32(offset, value);
        Ok(())
    }

    fn check_register_offset(&self, offset: u64) -> Result<()> {
        let w = &self.cfg.register_window;
        if offset < w.start || offset.checked_add(4).map_or(true, |end| end > w.end) {
            return Err(DmaError::RegisterOutOfRange { offset });
        }
        Ok(())
    }

    /// Resolve a mapping request. Offsets below the buffer span map a
    /// single whole buffer at a buffer-size-aligned offset; offsets
    /// above it map register space, bounds checked against the window.
    pub fn resolve_mapping(&self, offset: u64, len: u64) -> Result<MappedRegion> {
        let span = self.cfg.buffer_span();
        let bsize = u64::from(self.cfg.buffer_size);
        if offset < span {
            if offset % bsize != 0 {
                return Err(DmaError::BadMapping {
                    offset,
                    reason: "offset not aligned to a buffer boundary",
                });
            }
            if len != bsize {
                return Err(DmaError::BadMapping {
                    offset,
                    reason: "length must be exactly one buffer",
                });
            }
            return Ok(MappedRegion::Buffer {
                index: (offset / bsize) as u32,
            });
        }
        let rel = offset - span;
        let w = &self.cfg.register_window;
        if rel < w.start || rel.checked_add(len).map_or(true, |end| end > w.end) {
            return Err(DmaError::RegisterOutOfRange { offset: rel });
        }
        Ok(MappedRegion::Registers { offset: rel })
    }

    /// Quiesce the card and cancel every channel. Buffers end parked in
    /// their pools; dropping the device releases them.
    pub fn shutdown(self: &Arc<Self>) {
        let chans: Vec<Arc<Channel>> = {
            let tbl = lock(&self.channels);
            tbl.iter().filter_map(|s| s.as_ref().and_then(Weak::upgrade)).collect()
        };
        for ch in chans {
            ch.close();
        }
        self.hw.clear(self);
        self.free_queue.close();
        info!("device offline");
    }
}
