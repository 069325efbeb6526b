//! Register access seam between the engine and a card's register file.
//!
//! The engine only ever reads and writes aligned 32-bit words, so the
//! trait surface is deliberately that narrow. [`RamRegisters`] is the
//! RAM-backed implementation used by tests and simulation harnesses; it
//! journals every write so a harness can assert on the exact word
//! sequence a code path produced.

use std::sync::{Mutex, MutexGuard};

pub trait RegisterIo: Send + Sync {
    fn read_reg32(&self, offset: u64) -> u32;
    fn write_reg32(&self, offset: u64, value: u32);
}

struct RamState {
    words: Vec<u32>,
    journal: Vec<(u64, u32)>,
}

/// RAM-backed register file.
///
/// Out-of-range reads return zero and out-of-range writes are dropped,
/// matching how a bridge responds to accesses past a BAR.
pub struct RamRegisters {
    size: u64,
    state: Mutex<RamState>,
}

impl RamRegisters {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            state: Mutex::new(RamState {
                words: vec![0; (size / 4) as usize],
                journal: Vec::new(),
            }),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn lock(&self) -> MutexGuard<'_, RamState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read a word without disturbing the journal.
    pub fn peek(&self, offset: u64) -> u32 {
        if offset + 4 > self.size {
            return 0;
        }
        self.lock().words[(offset / 4) as usize]
    }

    /// Take the ordered log of writes seen since the last drain.
    pub fn drain_writes(&self) -> Vec<(u64, u32)> {
        std::mem::take(&mut self.lock().journal)
    }
}

impl RegisterIo for RamRegisters {
    fn read_reg32(&self, offset: u64) -> u32 {
        self.peek(offset)
    }

    fn write_reg32(&self, offset: u64, value: u32) {
        let mut s = self.lock();
        if offset + 4 <= self.size {
            let idx = (offset / 4) as usize;
            s.words[idx] = value;
        }
        s.journal.push((offset, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_storage_and_journal() {
        let regs = RamRegisters::new(0x100);
        regs.write_reg32(0x10, 0xdead_beef);
        regs.write_reg32(0x14, 7);
        assert_eq!(regs.read_reg32(0x10), 0xdead_beef);
        assert_eq!(regs.drain_writes(), vec![(0x10, 0xdead_beef), (0x14, 7)]);
        assert!(regs.drain_writes().is_empty());
    }

    #[test]
    fn out_of_range_access_is_inert() {
        let regs = RamRegisters::new(0x10);
        assert_eq!(regs.read_reg32(0x20), 0);
        regs.write_reg32(0x20, 1);
        assert_eq!(regs.read_reg32(0x20), 0);
        // The journal still records the attempt.
        assert_eq!(regs.drain_writes(), vec![(0x20, 1)]);
    }
}
