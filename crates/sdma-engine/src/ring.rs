//! Completion descriptor rings shared with hardware.
//!
//! Hardware appends entries; software consumes them in slot order and
//! clears each consumed slot back to zero so the slot can carry a later
//! entry. A slot is occupied exactly when its marker word is non-zero,
//! and the marker word is the last word hardware writes, so a half
//! written entry is never observed as valid.
//!
//! Two entry widths exist. The wide form is four 32-bit words and covers
//! the full index/size/destination space; the narrow form is two words
//! and trades range (12-bit index, 7-bit destination, 24-bit size) for
//! ring density on older cards.

use sdma_mem::{BusAddr, BusHeap, CoherencyMode, DmaRegion, MemError};
use std::sync::Arc;

/// Marker bit hardware sets in the final word of a completed entry. A
/// non-zero marker word without this bit is corruption.
pub const RING_VALID: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorWidth {
    /// Two words per entry.
    Narrow,
    /// Four words per entry.
    Wide,
}

impl DescriptorWidth {
    pub const fn entry_bytes(self) -> usize {
        match self {
            DescriptorWidth::Narrow => 8,
            DescriptorWidth::Wide => 16,
        }
    }
}

/// One decoded completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingEntry {
    pub index: u32,
    pub size: u32,
    pub dest: u16,
    pub first_user: u8,
    pub last_user: u8,
    pub cont: bool,
    /// Hardware result code, non-zero on frame error.
    pub result: u8,
}

/// Outcome of consuming one ring slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotRead {
    /// Marker word still zero; hardware has not filled the slot.
    Empty,
    Entry(RingEntry),
    /// Marker word non-zero but malformed. The raw word is reported and
    /// the slot has been cleared.
    Corrupt(u32),
}

fn encode(width: DescriptorWidth, e: &RingEntry) -> [u32; 4] {
    let w0 = u32::from(e.first_user) << 24
        | u32::from(e.last_user) << 16
        | u32::from(e.cont) << 3
        | u32::from(e.result & 0x7);
    match width {
        DescriptorWidth::Wide => [
            w0,
            e.index,
            e.size,
            RING_VALID | u32::from(e.dest),
        ],
        DescriptorWidth::Narrow => [
            w0 | (e.index & 0xfff) << 4,
            RING_VALID | u32::from(e.dest & 0x7f) << 24 | (e.size & 0xff_ffff),
            0,
            0,
        ],
    }
}

fn decode(width: DescriptorWidth, w: [u32; 4]) -> SlotRead {
    match width {
        DescriptorWidth::Wide => {
            let marker = w[3];
            if marker == 0 {
                return SlotRead::Empty;
            }
            if marker & RING_VALID == 0 {
                return SlotRead::Corrupt(marker);
            }
            SlotRead::Entry(RingEntry {
                index: w[1],
                size: w[2],
                dest: (marker & 0xffff) as u16,
                first_user: (w[0] >> 24) as u8,
                last_user: (w[0] >> 16 & 0xff) as u8,
                cont: w[0] & 1 << 3 != 0,
                result: (w[0] & 0x7) as u8,
            })
        }
        DescriptorWidth::Narrow => {
            let marker = w[1];
            if marker == 0 {
                return SlotRead::Empty;
            }
            if marker & RING_VALID == 0 {
                return SlotRead::Corrupt(marker);
            }
            SlotRead::Entry(RingEntry {
                index: w[0] >> 4 & 0xfff,
                size: marker & 0xff_ffff,
                dest: (marker >> 24 & 0x7f) as u16,
                first_user: (w[0] >> 24) as u8,
                last_user: (w[0] >> 16 & 0xff) as u8,
                cont: w[0] & 1 << 3 != 0,
                result: (w[0] & 0x7) as u8,
            })
        }
    }
}

/// A ring of completion slots in bus-visible memory.
///
/// The ring itself is always coherent; only payload buffers vary in
/// coherency mode.
pub struct CompletionRing {
    mem: DmaRegion,
    depth: u32,
    width: DescriptorWidth,
}

impl CompletionRing {
    pub fn new(
        heap: &Arc<BusHeap>,
        depth: u32,
        width: DescriptorWidth,
    ) -> Result<Self, MemError> {
        let mem = DmaRegion::alloc(
            heap,
            depth as usize * width.entry_bytes(),
            CoherencyMode::Coherent,
        )?;
        Ok(Self { mem, depth, width })
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn width(&self) -> DescriptorWidth {
        self.width
    }

    /// Bus base address, programmed into the card's ring base registers.
    pub fn base(&self) -> BusAddr {
        self.mem.handle()
    }

    fn word_count(&self) -> usize {
        self.width.entry_bytes() / 4
    }

    fn slot_offset(&self, slot: u32) -> usize {
        debug_assert!(slot < self.depth);
        slot as usize * self.width.entry_bytes()
    }

    /// Consume one slot. Non-empty slots are cleared to zero so the
    /// next lap can reuse them.
    pub fn take(&self, slot: u32) -> SlotRead {
        let off = self.slot_offset(slot);
        let mut w = [0u32; 4];
        for (i, word) in w.iter_mut().enumerate().take(self.word_count()) {
            // A coherent in-range read cannot fail; treat the slot as
            // empty if it somehow does.
            *word = self.mem.read_u32_le(off + i * 4).unwrap_or(0);
        }
        let read = decode(self.width, w);
        if !matches!(read, SlotRead::Empty) {
            let _ = self.mem.fill_zero(off, self.width.entry_bytes());
        }
        read
    }

    /// Hardware-side append: fill one slot, marker word last. Returns
    /// false without writing if the slot is still occupied.
    pub fn post(&self, slot: u32, entry: &RingEntry) -> bool {
        let off = self.slot_offset(slot);
        let marker_word = self.word_count() - 1;
        if self
            .mem
            .read_u32_le(off + marker_word * 4)
            .unwrap_or(u32::MAX)
            != 0
        {
            return false;
        }
        let w = encode(self.width, entry);
        for i in (0..self.word_count()).rev() {
            if i == marker_word {
                continue;
            }
            let _ = self.mem.write_u32_le(off + i * 4, w[i]);
        }
        let _ = self.mem.write_u32_le(off + marker_word * 4, w[marker_word]);
        true
    }

    /// Corrupt a slot's marker word directly. Test hook for the
    /// malformed-entry recovery path.
    #[doc(hidden)]
    pub fn poison(&self, slot: u32, marker: u32) {
        let off = self.slot_offset(slot);
        let marker_word = self.word_count() - 1;
        let _ = self.mem.write_u32_le(off + marker_word * 4, marker);
    }
}
