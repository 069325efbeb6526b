//! Bus-addressable memory for the stream DMA engine.
//!
//! A [`BusHeap`] hands out bus address ranges from a fixed budget, and a
//! [`DmaRegion`] pairs one such range with host-visible backing bytes. The
//! engine treats the bus address (the "handle") as the value hardware sees
//! and the backing bytes as what software reads and writes. Coherency
//! between the two sides is modelled by [`DmaRegion::sync_for_device`] and
//! [`DmaRegion::sync_for_cpu`]; in [`CoherencyMode::Streaming`] a sync for
//! the device assigns a fresh bus range, so a region's handle is only
//! stable for the duration of one transfer.

pub mod mmio;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemError {
    #[error("bus heap exhausted: need {need:#x} bytes, {avail:#x} available")]
    HeapExhausted { need: u64, avail: u64 },
    #[error("region access out of range: offset {offset:#x} len {len:#x} region size {size:#x}")]
    OutOfRange { offset: usize, len: usize, size: usize },
    #[error("zero-length region")]
    ZeroLength,
}

pub type Result<T> = std::result::Result<T, MemError>;

/// A device-visible bus address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BusAddr(pub u64);

impl fmt::Debug for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusAddr({:#x})", self.0)
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How a region's host bytes relate to its bus range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherencyMode {
    /// Host and device views are always consistent; syncs are no-ops.
    Coherent,
    /// A fresh bus range is assigned each time the region is handed to the
    /// device, so handles are not stable across transfers.
    Streaming,
    /// Fixed pre-translated range; syncs flush but never remap.
    FixedMap,
}

/// Page granularity for bus range assignment. Handles are always aligned
/// to this, so their low 12 bits are zero.
pub const BUS_PAGE: u64 = 0x1000;

// First address handed out. Zero is reserved so a zero handle can always
// be read as "no mapping".
const BUS_BASE: u64 = BUS_PAGE;

struct HeapState {
    next: u64,
    used: u64,
}

/// Fixed-budget allocator of bus address ranges.
///
/// Addresses grow monotonically and are never reused, which keeps every
/// live handle unique even across streaming remaps. Only the byte budget
/// is reclaimed when a region is dropped.
pub struct BusHeap {
    capacity: u64,
    state: Mutex<HeapState>,
}

impl BusHeap {
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(HeapState { next: BUS_BASE, used: 0 }),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently backing live regions.
    pub fn used(&self) -> u64 {
        self.lock().used
    }

    fn lock(&self) -> MutexGuard<'_, HeapState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn alloc(&self, len: u64) -> Result<BusAddr> {
        let span = len.div_ceil(BUS_PAGE) * BUS_PAGE;
        let mut s = self.lock();
        if s.used + span > self.capacity {
            return Err(MemError::HeapExhausted {
                need: span,
                avail: self.capacity - s.used,
            });
        }
        let addr = BusAddr(s.next);
        s.next += span;
        s.used += span;
        Ok(addr)
    }

    fn release(&self, len: u64) {
        let span = len.div_ceil(BUS_PAGE) * BUS_PAGE;
        let mut s = self.lock();
        s.used = s.used.saturating_sub(span);
    }
}

/// One contiguous DMA-capable region: host backing bytes plus the bus
/// range the device addresses it through.
pub struct DmaRegion {
    heap: Arc<BusHeap>,
    mode: CoherencyMode,
    len: usize,
    handle: AtomicU64,
    bytes: Mutex<Box<[u8]>>,
}

impl DmaRegion {
    pub fn alloc(heap: &Arc<BusHeap>, len: usize, mode: CoherencyMode) -> Result<Self> {
        if len == 0 {
            return Err(MemError::ZeroLength);
        }
        let handle = heap.alloc(len as u64)?;
        Ok(Self {
            heap: heap.clone(),
            mode,
            len,
            handle: AtomicU64::new(handle.0),
            bytes: Mutex::new(vec![0u8; len].into_boxed_slice()),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> CoherencyMode {
        self.mode
    }

    /// Current bus handle. Stable for the life of the region except in
    /// [`CoherencyMode::Streaming`], where it changes on each
    /// [`sync_for_device`](Self::sync_for_device).
    pub fn handle(&self) -> BusAddr {
        BusAddr(self.handle.load(Ordering::Acquire))
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(MemError::OutOfRange { offset, len, size: self.len });
        }
        Ok(())
    }

    fn bytes(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        dst.copy_from_slice(&self.bytes()[offset..offset + dst.len()]);
        Ok(())
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        self.bytes()[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn read_u32_le(&self, offset: usize) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_u32_le(&self, offset: usize, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn fill_zero(&self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len)?;
        self.bytes()[offset..offset + len].fill(0);
        Ok(())
    }

    /// Hand the region to the device. In streaming mode this assigns a
    /// fresh bus range, invalidating the previous handle.
    pub fn sync_for_device(&self) -> Result<()> {
        if let CoherencyMode::Streaming = self.mode {
            let fresh = self.heap.alloc(self.len as u64)?;
            self.handle.store(fresh.0, Ordering::Release);
            self.heap.release(self.len as u64);
        }
        Ok(())
    }

    /// Take the region back from the device. No observable effect beyond
    /// ending the transfer; the handle keeps its last assigned value.
    pub fn sync_for_cpu(&self) {}
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        self.heap.release(self.len as u64);
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("handle", &self.handle())
            .field("len", &self.len)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_budget_enforced() {
        let heap = BusHeap::new(2 * BUS_PAGE);
        let a = DmaRegion::alloc(&heap, 100, CoherencyMode::Coherent).unwrap();
        let b = DmaRegion::alloc(&heap, 100, CoherencyMode::Coherent).unwrap();
        assert_eq!(heap.used(), 2 * BUS_PAGE);
        assert!(matches!(
            DmaRegion::alloc(&heap, 1, CoherencyMode::Coherent),
            Err(MemError::HeapExhausted { .. })
        ));
        drop(a);
        drop(b);
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn handles_unique_and_page_aligned() {
        let heap = BusHeap::new(64 * BUS_PAGE);
        let a = DmaRegion::alloc(&heap, 4096, CoherencyMode::Coherent).unwrap();
        let b = DmaRegion::alloc(&heap, 4096, CoherencyMode::Coherent).unwrap();
        assert_ne!(a.handle(), b.handle());
        assert_ne!(a.handle().0, 0);
        assert_eq!(a.handle().0 % BUS_PAGE, 0);
        assert_eq!(b.handle().0 % BUS_PAGE, 0);
    }

    #[test]
    fn read_write_bounds() {
        let heap = BusHeap::new(16 * BUS_PAGE);
        let r = DmaRegion::alloc(&heap, 64, CoherencyMode::Coherent).unwrap();
        r.write(60, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        r.read(60, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(matches!(
            r.write(61, &[0; 4]),
            Err(MemError::OutOfRange { .. })
        ));
        assert!(matches!(
            r.read(usize::MAX, &mut out),
            Err(MemError::OutOfRange { .. })
        ));
    }

    #[test]
    fn streaming_sync_remaps_handle() {
        let heap = BusHeap::new(16 * BUS_PAGE);
        let r = DmaRegion::alloc(&heap, 4096, CoherencyMode::Streaming).unwrap();
        let first = r.handle();
        r.sync_for_device().unwrap();
        let second = r.handle();
        assert_ne!(first, second);
        // Budget is returned when the old range is dropped, so repeated
        // transfers do not leak.
        let used = heap.used();
        r.sync_for_device().unwrap();
        assert_eq!(heap.used(), used);
    }

    #[test]
    fn coherent_sync_is_stable() {
        let heap = BusHeap::new(16 * BUS_PAGE);
        let r = DmaRegion::alloc(&heap, 4096, CoherencyMode::Coherent).unwrap();
        let h = r.handle();
        r.sync_for_device().unwrap();
        r.sync_for_cpu();
        assert_eq!(r.handle(), h);
    }
}
