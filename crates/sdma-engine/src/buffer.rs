//! Fixed DMA buffers and the pools that own them.
//!
//! Buffers are allocated once at device bring-up and never freed until
//! teardown; everything after that is ownership movement. Each buffer is
//! always in exactly one of the [`OwnerState`]s, and the sum of buffers
//! per state equals the pool size at every quiesced point.

use std::sync::{Arc, Mutex, MutexGuard};

use sdma_mem::{BusAddr, BusHeap, CoherencyMode, DmaRegion};

use crate::error::{DmaError, FrameError, Result};
use crate::lock;

/// Buffers per chunk in the pool's two-tier index table. Keeps any single
/// allocation bounded no matter how large the pool is configured.
pub const BUFFERS_PER_CHUNK: usize = 4096;

/// Who owns a buffer right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerState {
    /// In the device free queue, available for transmit.
    Free,
    /// Posted to hardware (free list or submit FIFO).
    InHardware,
    /// In a software queue: a channel receive queue or a card overflow queue.
    InSoftwareQueue,
    /// Handed out to a consumer by index.
    HeldByConsumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    FromDevice,
    Bidirectional,
}

/// Packed per-frame flags: first-user byte, last-user byte and the
/// continue bit linking multi-buffer frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    const CONT: u32 = 1 << 16;

    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn from_parts(first_user: u8, last_user: u8, cont: bool) -> Self {
        Self(u32::from(first_user) | u32::from(last_user) << 8 | if cont { Self::CONT } else { 0 })
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn first_user(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub fn last_user(self) -> u8 {
        (self.0 >> 8 & 0xff) as u8
    }

    /// Frame continues into the next buffer.
    pub fn cont(self) -> bool {
        self.0 & Self::CONT != 0
    }
}

/// Mutable per-buffer bookkeeping, all behind one lock.
#[derive(Debug)]
pub struct BufferMeta {
    pub state: OwnerState,
    pub dest: u16,
    pub flags: BufferFlags,
    pub error: FrameError,
    /// Valid payload bytes for the current frame.
    pub size: u32,
    /// Transfers this buffer has carried since allocation.
    pub use_count: u32,
    /// Channel id while [`OwnerState::HeldByConsumer`].
    pub owner: Option<u64>,
}

pub struct Buffer {
    index: u32,
    mem: DmaRegion,
    meta: Mutex<BufferMeta>,
}

impl Buffer {
    fn new(index: u32, mem: DmaRegion) -> Self {
        Self {
            index,
            mem,
            meta: Mutex::new(BufferMeta {
                state: OwnerState::Free,
                dest: 0,
                flags: BufferFlags::default(),
                error: FrameError::empty(),
                size: 0,
                use_count: 0,
                owner: None,
            }),
        }
    }

    /// Device-global index, unique across all pools of one device.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Current bus handle. Only stable across transfers outside
    /// streaming mode.
    pub fn handle(&self) -> BusAddr {
        self.mem.handle()
    }

    pub fn capacity(&self) -> usize {
        self.mem.len()
    }

    pub fn meta(&self) -> MutexGuard<'_, BufferMeta> {
        lock(&self.meta)
    }

    pub fn state(&self) -> OwnerState {
        self.meta().state
    }

    pub(crate) fn set_state(&self, state: OwnerState) {
        self.meta().state = state;
    }

    /// Prepare the buffer for hardware access. Must precede posting it
    /// to a free list or submit FIFO; in streaming mode this reassigns
    /// the bus handle.
    pub fn sync_to_hardware(&self) -> Result<()> {
        self.mem.sync_for_device()?;
        Ok(())
    }

    /// Take the buffer back after hardware completed with it.
    pub fn sync_from_hardware(&self) {
        self.mem.sync_for_cpu();
    }

    pub fn write_payload(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.mem.write(offset, src)?;
        Ok(())
    }

    pub fn read_payload(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.mem.read(offset, dst)?;
        Ok(())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("index", &self.index)
            .field("handle", &self.handle())
            .field("state", &self.state())
            .finish()
    }
}

/// Buffer population per [`OwnerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateCounts {
    pub free: u32,
    pub in_hardware: u32,
    pub in_software_queue: u32,
    pub held_by_consumer: u32,
}

impl StateCounts {
    pub fn total(&self) -> u32 {
        self.free + self.in_hardware + self.in_software_queue + self.held_by_consumer
    }
}

/// A fixed population of equally sized buffers with O(1) index lookup
/// and handle lookup for completion resolution.
///
/// Allocation is all-or-nothing: if any buffer fails to allocate, every
/// buffer already created is released and the pool reports zero buffers.
pub struct BufferPool {
    base_index: u32,
    direction: Direction,
    buffer_size: usize,
    chunks: Vec<Vec<Arc<Buffer>>>,
    /// Sorted by handle for binary search. Empty in streaming mode,
    /// where handles change per transfer and only a linear scan of the
    /// current handles is meaningful.
    sorted: Vec<Arc<Buffer>>,
    count: u32,
}

impl BufferPool {
    pub fn allocate(
        heap: &Arc<BusHeap>,
        count: u32,
        base_index: u32,
        direction: Direction,
        mode: CoherencyMode,
        buffer_size: usize,
    ) -> Result<Self> {
        let mut chunks: Vec<Vec<Arc<Buffer>>> = Vec::new();
        for i in 0..count {
            // Dropping `chunks` on the error path releases every region
            // already allocated, so a partial pool never survives.
            let mem = DmaRegion::alloc(heap, buffer_size, mode).map_err(DmaError::Mem)?;
            let buf = Arc::new(Buffer::new(base_index + i, mem));
            match chunks.last_mut() {
                Some(chunk) if chunk.len() < BUFFERS_PER_CHUNK => chunk.push(buf),
                _ => chunks.push(vec![buf]),
            }
        }
        let mut sorted = Vec::new();
        if !matches!(mode, CoherencyMode::Streaming) {
            sorted = chunks.iter().flatten().cloned().collect::<Vec<_>>();
            sorted.sort_by_key(|b| b.handle());
        }
        Ok(Self {
            base_index,
            direction,
            buffer_size,
            chunks,
            sorted,
            count,
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn base_index(&self) -> u32 {
        self.base_index
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn contains_index(&self, index: u32) -> bool {
        index >= self.base_index && index < self.base_index + self.count
    }

    pub fn get(&self, index: u32) -> Option<&Arc<Buffer>> {
        if !self.contains_index(index) {
            return None;
        }
        let rel = (index - self.base_index) as usize;
        Some(&self.chunks[rel / BUFFERS_PER_CHUNK][rel % BUFFERS_PER_CHUNK])
    }

    /// Resolve a bus handle back to its buffer. Binary search over the
    /// handle-sorted table when handles are stable, linear scan of live
    /// handles otherwise.
    pub fn find_by_handle(&self, handle: BusAddr) -> Option<&Arc<Buffer>> {
        if !self.sorted.is_empty() {
            let i = self
                .sorted
                .binary_search_by_key(&handle, |b| b.handle())
                .ok()?;
            return Some(&self.sorted[i]);
        }
        self.iter().find(|b| b.handle() == handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Buffer>> {
        self.chunks.iter().flatten()
    }

    pub fn state_counts(&self) -> StateCounts {
        let mut c = StateCounts::default();
        for b in self.iter() {
            match b.state() {
                OwnerState::Free => c.free += 1,
                OwnerState::InHardware => c.in_hardware += 1,
                OwnerState::InSoftwareQueue => c.in_software_queue += 1,
                OwnerState::HeldByConsumer => c.held_by_consumer += 1,
            }
        }
        c
    }
}
