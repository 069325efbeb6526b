#![allow(dead_code)]

use std::sync::Arc;

use sdma_engine::{Device, DeviceConfig, RingCard, RingEntry};
use sdma_mem::mmio::RamRegisters;
use sdma_mem::{BusHeap, BUS_PAGE};

/// A device wired to a RAM register file, with the harness playing the
/// hardware side of the completion rings.
pub struct Harness {
    pub dev: Arc<Device>,
    pub regs: Arc<RamRegisters>,
    pub heap: Arc<BusHeap>,
    rx_slot: u32,
    tx_slot: u32,
}

impl Harness {
    pub fn new(cfg: DeviceConfig) -> Self {
        let heap = BusHeap::new(2048 * BUS_PAGE);
        let regs = Arc::new(RamRegisters::new(0x8000));
        let dev = Device::new(cfg, heap.clone(), regs.clone()).unwrap();
        // Discard bring-up register traffic so tests see only their own.
        regs.drain_writes();
        Self { dev, regs, heap, rx_slot: 0, tx_slot: 0 }
    }

    /// 4 receive + 4 transmit buffers, ring depth 8.
    pub fn small() -> Self {
        Self::new(DeviceConfig {
            rx_count: 4,
            tx_count: 4,
            ring_depth: 8,
            ..DeviceConfig::default()
        })
    }

    pub fn card(&self) -> &RingCard {
        self.dev
            .hw_ops()
            .as_any()
            .downcast_ref::<RingCard>()
            .unwrap()
    }

    /// Index of the first receive buffer.
    pub fn rx_base(&self) -> u32 {
        self.dev.rx_pool().base_index()
    }

    /// Hardware side: append one receive completion.
    pub fn complete_rx(&mut self, entry: RingEntry) {
        assert!(self.card().rx_ring().post(self.rx_slot, &entry));
        self.rx_slot = (self.rx_slot + 1) % self.card().rx_ring().depth();
    }

    /// Hardware side: return one transmitted buffer.
    pub fn complete_tx(&mut self, entry: RingEntry) {
        assert!(self.card().tx_ring().post(self.tx_slot, &entry));
        self.tx_slot = (self.tx_slot + 1) % self.card().tx_ring().depth();
    }

    /// Every buffer of both pools is in exactly one state, none has
    /// gone missing, and the free queue agrees with the state counts.
    pub fn assert_conserved(&self) {
        let r = self.dev.report();
        assert_eq!(r.rx.total(), self.dev.rx_buffer_count(), "rx buffers lost: {r:?}");
        assert_eq!(r.tx.total(), self.dev.tx_buffer_count(), "tx buffers lost: {r:?}");
        assert_eq!(r.free_queue_len, r.tx.free, "free queue out of step: {r:?}");
    }

    /// Stronger cross-check for tests that inject no malformed or
    /// unresolvable entries: the card's occupancy counters must agree
    /// with the per-buffer states.
    pub fn assert_hw_counts_consistent(&self) {
        let r = self.dev.report();
        assert_eq!(
            r.card.hw_free_count + r.card.hw_submit_count,
            r.rx.in_hardware + r.tx.in_hardware,
            "hardware counters drifted: {r:?}"
        );
    }
}
