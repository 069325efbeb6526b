//! Card capability seam and the ring-FIFO card behind it.
//!
//! [`HardwareOps`] is everything the device core needs from a card
//! generation. [`RingCard`] implements it for cards that complete
//! through descriptor rings and accept work through register FIFOs,
//! in either descriptor width.
//!
//! All submission state lives behind one lock: in-hardware occupancy
//! counters, ring consume positions and the FIFO register writes that
//! compose a descriptor. Holding that lock across the word writes is
//! what keeps descriptors from interleaving when several submitters
//! race.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use sdma_mem::mmio::RegisterIo;
use sdma_mem::BusHeap;

use crate::buffer::{Buffer, BufferFlags, OwnerState};
use crate::config::DeviceConfig;
use crate::device::Device;
use crate::error::{DmaError, FrameError, Result};
use crate::lock;
use crate::queue::BufferQueue;
use crate::ring::{CompletionRing, DescriptorWidth, RingEntry, SlotRead};

/// Register layout of the ring-FIFO card.
pub mod regs {
    pub const ENABLE: u64 = 0x00;
    pub const ONLINE: u64 = 0x04;
    pub const INT_ENABLE: u64 = 0x08;
    pub const INT_ACK: u64 = 0x0c;
    pub const MAX_SIZE: u64 = 0x10;
    pub const CONT_ENABLE: u64 = 0x14;
    pub const FIFO_RESET: u64 = 0x18;
    /// Free-list FIFO. Wide cards take the page frame in B then the
    /// index in A; narrow cards take only the index in A, with the page
    /// frame pre-written to the address table.
    pub const FREE_FIFO_A: u64 = 0x20;
    pub const FREE_FIFO_B: u64 = 0x24;
    /// Submit FIFO, written high word to low; A is the committing write.
    pub const SUBMIT_FIFO_A: u64 = 0x30;
    pub const SUBMIT_FIFO_B: u64 = 0x34;
    pub const SUBMIT_FIFO_C: u64 = 0x38;
    pub const SUBMIT_FIFO_D: u64 = 0x3c;
    pub const RX_RING_LO: u64 = 0x40;
    pub const RX_RING_HI: u64 = 0x44;
    pub const TX_RING_LO: u64 = 0x48;
    pub const TX_RING_HI: u64 = 0x4c;
    /// Per-index bus page frames, used by narrow cards whose FIFO words
    /// have no room for an address.
    pub const ADDR_TABLE: u64 = 0x1000;
}

/// Card commands routed through [`Device::hw_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCommand {
    /// Acknowledge a read-side interrupt.
    AckRead,
    /// Number of service calls that found no work.
    MissedServiceCount,
}

/// Occupancy and diagnostics snapshot of one card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardReport {
    pub width: DescriptorWidth,
    pub ring_depth: u32,
    pub hw_free_count: u32,
    pub hw_submit_count: u32,
    pub rx_slot: u32,
    pub tx_slot: u32,
    pub continue_frames: u32,
    pub missed_service: u32,
    pub corrupt_entries: u32,
    pub free_overflow: u32,
    pub submit_overflow: u32,
}

/// Everything the device core asks of a card generation.
pub trait HardwareOps: Send + Sync {
    /// Program static card state and seed the receive free list.
    fn init(&self, dev: &Device) -> Result<()>;
    fn enable(&self, dev: &Device);
    /// Quiesce the card; no completions arrive after this returns.
    fn clear(&self, dev: &Device);
    /// Post filled buffers for transmission.
    fn submit(&self, dev: &Device, bufs: &[Arc<Buffer>]) -> Result<()>;
    /// Return receive buffers to the hardware free path.
    fn reclaim(&self, dev: &Device, bufs: &[Arc<Buffer>]) -> Result<()>;
    fn command(&self, dev: &Device, cmd: HwCommand) -> Result<u32>;
    /// Drain completion rings, route buffers, refill from overflow.
    /// Returns the number of entries handled.
    fn service(&self, dev: &Device) -> u32;
    fn report(&self) -> CardReport;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Default)]
struct SubmitState {
    hw_free_count: u32,
    hw_submit_count: u32,
    rx_slot: u32,
    tx_slot: u32,
    continue_frames: u32,
    missed_service: u32,
    corrupt_entries: u32,
}

pub struct RingCard {
    width: DescriptorWidth,
    service_burst: u32,
    regs: Arc<dyn RegisterIo>,
    rx_ring: CompletionRing,
    tx_ring: CompletionRing,
    /// Receive buffers waiting for free-list capacity (wide mode only).
    free_overflow: BufferQueue,
    /// Transmit descriptors waiting for submit capacity (wide mode only).
    submit_overflow: BufferQueue,
    submit: Mutex<SubmitState>,
}

impl RingCard {
    pub fn new(
        heap: &Arc<BusHeap>,
        regs: Arc<dyn RegisterIo>,
        cfg: &DeviceConfig,
    ) -> Result<Self> {
        let rx_ring = CompletionRing::new(heap, cfg.ring_depth, cfg.width)?;
        let tx_ring = CompletionRing::new(heap, cfg.ring_depth, cfg.width)?;
        Ok(Self {
            width: cfg.width,
            service_burst: cfg.service_burst,
            regs,
            rx_ring,
            tx_ring,
            free_overflow: BufferQueue::new(cfg.rx_count as usize),
            submit_overflow: BufferQueue::new((cfg.rx_count + cfg.tx_count) as usize),
            submit: Mutex::new(SubmitState::default()),
        })
    }

    pub fn rx_ring(&self) -> &CompletionRing {
        &self.rx_ring
    }

    pub fn tx_ring(&self) -> &CompletionRing {
        &self.tx_ring
    }

    fn lock_submit(&self) -> MutexGuard<'_, SubmitState> {
        lock(&self.submit)
    }

    /// Buffers hardware may hold per direction; one ring slot stays
    /// free so full and empty are distinguishable.
    fn limit(&self) -> u32 {
        self.rx_ring.depth() - 1
    }

    fn page_frame(buf: &Buffer) -> u32 {
        (buf.handle().0 >> 12) as u32
    }

    /// Write the free-list descriptor words for one buffer. Caller
    /// holds the submit lock.
    fn write_free_words(&self, buf: &Buffer) {
        match self.width {
            DescriptorWidth::Wide => {
                self.regs
                    .write_reg32(regs::FREE_FIFO_B, Self::page_frame(buf));
                self.regs.write_reg32(regs::FREE_FIFO_A, buf.index());
            }
            DescriptorWidth::Narrow => {
                self.regs.write_reg32(
                    regs::ADDR_TABLE + u64::from(buf.index()) * 4,
                    Self::page_frame(buf),
                );
                self.regs.write_reg32(regs::FREE_FIFO_A, buf.index());
            }
        }
    }

    /// Write the submit descriptor words for one buffer. Caller holds
    /// the submit lock.
    fn write_submit_words(&self, buf: &Buffer) {
        let (dest, size, flags) = {
            let m = buf.meta();
            (m.dest, m.size, m.flags)
        };
        match self.width {
            DescriptorWidth::Wide => {
                self.regs
                    .write_reg32(regs::SUBMIT_FIFO_D, Self::page_frame(buf));
                self.regs.write_reg32(regs::SUBMIT_FIFO_C, buf.index());
                self.regs.write_reg32(
                    regs::SUBMIT_FIFO_B,
                    u32::from(flags.cont()) << 31 | (size & 0x7fff_ffff),
                );
                self.regs.write_reg32(
                    regs::SUBMIT_FIFO_A,
                    u32::from(dest) << 16
                        | u32::from(flags.first_user()) << 8
                        | u32::from(flags.last_user()),
                );
            }
            DescriptorWidth::Narrow => {
                self.regs.write_reg32(
                    regs::ADDR_TABLE + u64::from(buf.index()) * 4,
                    Self::page_frame(buf),
                );
                self.regs.write_reg32(
                    regs::SUBMIT_FIFO_B,
                    u32::from(dest & 0x7f) << 24 | (size & 0xff_ffff),
                );
                self.regs.write_reg32(
                    regs::SUBMIT_FIFO_A,
                    u32::from(flags.first_user()) << 24
                        | u32::from(flags.last_user()) << 16
                        | (buf.index() & 0xfff) << 4
                        | u32::from(flags.cont()) << 3,
                );
            }
        }
    }

    fn post_free_direct(&self, s: &mut SubmitState, buf: &Arc<Buffer>) -> Result<()> {
        buf.sync_to_hardware()?;
        self.write_free_words(buf);
        s.hw_free_count += 1;
        buf.set_state(OwnerState::InHardware);
        Ok(())
    }

    fn post_submit_direct(&self, s: &mut SubmitState, buf: &Arc<Buffer>) -> Result<()> {
        buf.sync_to_hardware()?;
        self.write_submit_words(buf);
        s.hw_submit_count += 1;
        buf.set_state(OwnerState::InHardware);
        Ok(())
    }

    /// Single entry point of the receive free path. Posts directly when
    /// the free list has capacity, otherwise parks the buffer in the
    /// software overflow queue until service drains it.
    fn push_free_locked(&self, s: &mut SubmitState, buf: &Arc<Buffer>) -> Result<()> {
        if self.width == DescriptorWidth::Wide && s.hw_free_count >= self.limit() {
            buf.set_state(OwnerState::InSoftwareQueue);
            if let Err(back) = self.free_overflow.push(buf.clone()) {
                warn!(index = back.index(), "free overflow queue full, buffer stranded");
                return Err(DmaError::QueueFull);
            }
            return Ok(());
        }
        self.post_free_direct(s, buf)
    }

    fn push_free(&self, buf: &Arc<Buffer>) -> Result<()> {
        let mut s = self.lock_submit();
        self.push_free_locked(&mut s, buf)
    }

    /// Refill hardware from the overflow queues while capacity lasts.
    fn drain_overflow_locked(&self, s: &mut SubmitState) {
        while s.hw_free_count < self.limit() {
            let Some(buf) = self.free_overflow.pop() else { break };
            if let Err(err) = self.post_free_direct(s, &buf) {
                warn!(index = buf.index(), %err, "free overflow drain failed");
                buf.set_state(OwnerState::InSoftwareQueue);
                let _ = self.free_overflow.push(buf);
                break;
            }
        }
        while s.hw_submit_count < self.limit() {
            let Some(buf) = self.submit_overflow.pop() else { break };
            if let Err(err) = self.post_submit_direct(s, &buf) {
                warn!(index = buf.index(), %err, "submit overflow drain failed");
                buf.set_state(OwnerState::InSoftwareQueue);
                let _ = self.submit_overflow.push(buf);
                break;
            }
        }
    }

    fn advance(ring: &CompletionRing, slot: &mut u32) {
        *slot = (*slot + 1) % ring.depth();
    }

    fn handle_tx_entry(&self, dev: &Device, s: &mut SubmitState, e: &RingEntry) {
        match dev.buffer(e.index) {
            None => warn!(index = e.index, "transmit return names an unknown buffer"),
            Some(buf) => {
                buf.sync_from_hardware();
                if dev.tx_pool().contains_index(e.index) {
                    buf.set_state(OwnerState::Free);
                    if dev.free_queue().push(buf.clone()).is_err() {
                        warn!(index = e.index, "free queue rejected returned transmit buffer");
                    }
                } else if let Err(err) = self.push_free_locked(s, &buf) {
                    warn!(index = e.index, %err, "could not return receive buffer to hardware");
                }
            }
        }
    }

    fn handle_rx_entry(&self, dev: &Device, s: &mut SubmitState, e: &RingEntry) {
        if e.cont {
            s.continue_frames += 1;
        }
        let Some(buf) = dev.rx_pool().get(e.index).cloned() else {
            warn!(index = e.index, "completion names an unknown receive buffer");
            return;
        };
        {
            let mut m = buf.meta();
            m.dest = e.dest;
            m.size = e.size;
            m.flags = BufferFlags::from_parts(e.first_user, e.last_user, e.cont);
            m.error = if e.size == 0 {
                FrameError::FIFO
            } else {
                FrameError::from_bits_truncate(e.result)
            };
            m.use_count += 1;
        }
        if dev.debug() > 0 {
            debug!(index = e.index, dest = e.dest, size = e.size, "receive completion");
        }
        match dev.channel_for(e.dest) {
            Some(ch) => {
                buf.sync_from_hardware();
                buf.set_state(OwnerState::InSoftwareQueue);
                if let Err(back) = ch.push_receive(buf) {
                    // Channel closed between lookup and push; keep the
                    // buffer cycling instead of leaking it.
                    if let Err(err) = self.push_free_locked(s, &back) {
                        warn!(index = e.index, %err, "could not recover buffer from closing channel");
                    }
                }
            }
            None => {
                if dev.debug() > 0 {
                    debug!(dest = e.dest, index = e.index, "no channel owns destination, resubmitting");
                }
                if let Err(err) = self.push_free_locked(s, &buf) {
                    warn!(index = e.index, %err, "could not resubmit unroutable buffer");
                }
            }
        }
    }
}

impl HardwareOps for RingCard {
    fn init(&self, dev: &Device) -> Result<()> {
        let cfg = dev.config();
        self.regs.write_reg32(regs::FIFO_RESET, 1);
        self.regs.write_reg32(regs::FIFO_RESET, 0);
        self.regs.write_reg32(regs::MAX_SIZE, cfg.buffer_size);
        self.regs
            .write_reg32(regs::CONT_ENABLE, u32::from(cfg.cont_enable));
        let rx = self.rx_ring.base().0;
        let tx = self.tx_ring.base().0;
        self.regs.write_reg32(regs::RX_RING_LO, rx as u32);
        self.regs.write_reg32(regs::RX_RING_HI, (rx >> 32) as u32);
        self.regs.write_reg32(regs::TX_RING_LO, tx as u32);
        self.regs.write_reg32(regs::TX_RING_HI, (tx >> 32) as u32);
        for buf in dev.rx_pool().iter() {
            self.push_free(buf)?;
        }
        Ok(())
    }

    fn enable(&self, _dev: &Device) {
        self.regs.write_reg32(regs::ENABLE, 1);
        self.regs.write_reg32(regs::ONLINE, 1);
        self.regs.write_reg32(regs::INT_ENABLE, 1);
    }

    fn clear(&self, _dev: &Device) {
        self.regs.write_reg32(regs::INT_ENABLE, 0);
        self.regs.write_reg32(regs::ONLINE, 0);
        self.regs.write_reg32(regs::ENABLE, 0);
        self.regs.write_reg32(regs::FIFO_RESET, 1);
    }

    fn submit(&self, _dev: &Device, bufs: &[Arc<Buffer>]) -> Result<()> {
        let mut s = self.lock_submit();
        for buf in bufs {
            if self.width == DescriptorWidth::Wide && s.hw_submit_count >= self.limit() {
                buf.set_state(OwnerState::InSoftwareQueue);
                if let Err(back) = self.submit_overflow.push(buf.clone()) {
                    warn!(index = back.index(), "submit overflow queue full");
                    return Err(DmaError::QueueFull);
                }
                continue;
            }
            self.post_submit_direct(&mut s, buf)?;
        }
        Ok(())
    }

    fn reclaim(&self, _dev: &Device, bufs: &[Arc<Buffer>]) -> Result<()> {
        let mut s = self.lock_submit();
        for buf in bufs {
            self.push_free_locked(&mut s, buf)?;
        }
        Ok(())
    }

    fn command(&self, _dev: &Device, cmd: HwCommand) -> Result<u32> {
        match cmd {
            HwCommand::AckRead => {
                self.regs.write_reg32(regs::INT_ACK, 1);
                Ok(0)
            }
            HwCommand::MissedServiceCount => Ok(self.lock_submit().missed_service),
        }
    }

    fn service(&self, dev: &Device) -> u32 {
        let mut s = self.lock_submit();
        let mut handled = 0u32;

        while handled < self.service_burst {
            let slot = s.tx_slot;
            match self.tx_ring.take(slot) {
                SlotRead::Empty => break,
                SlotRead::Corrupt(raw) => {
                    warn!(slot, raw, "malformed transmit return entry, skipping");
                    s.corrupt_entries += 1;
                    s.hw_submit_count = s.hw_submit_count.saturating_sub(1);
                    Self::advance(&self.tx_ring, &mut s.tx_slot);
                    handled += 1;
                }
                SlotRead::Entry(e) => {
                    s.hw_submit_count = s.hw_submit_count.saturating_sub(1);
                    Self::advance(&self.tx_ring, &mut s.tx_slot);
                    handled += 1;
                    self.handle_tx_entry(dev, &mut s, &e);
                }
            }
        }

        while handled < self.service_burst {
            let slot = s.rx_slot;
            match self.rx_ring.take(slot) {
                SlotRead::Empty => break,
                SlotRead::Corrupt(raw) => {
                    warn!(slot, raw, "malformed receive completion entry, skipping");
                    s.corrupt_entries += 1;
                    s.hw_free_count = s.hw_free_count.saturating_sub(1);
                    Self::advance(&self.rx_ring, &mut s.rx_slot);
                    handled += 1;
                }
                SlotRead::Entry(e) => {
                    s.hw_free_count = s.hw_free_count.saturating_sub(1);
                    Self::advance(&self.rx_ring, &mut s.rx_slot);
                    handled += 1;
                    self.handle_rx_entry(dev, &mut s, &e);
                }
            }
        }

        if self.width == DescriptorWidth::Wide {
            self.drain_overflow_locked(&mut s);
        }
        if handled == 0 {
            s.missed_service += 1;
        }
        drop(s);
        self.regs.write_reg32(regs::INT_ACK, handled);
        handled
    }

    fn report(&self) -> CardReport {
        let s = self.lock_submit();
        CardReport {
            width: self.width,
            ring_depth: self.rx_ring.depth(),
            hw_free_count: s.hw_free_count,
            hw_submit_count: s.hw_submit_count,
            rx_slot: s.rx_slot,
            tx_slot: s.tx_slot,
            continue_frames: s.continue_frames,
            missed_service: s.missed_service,
            corrupt_entries: s.corrupt_entries,
            free_overflow: self.free_overflow.len() as u32,
            submit_overflow: self.submit_overflow.len() as u32,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
