mod common;

use common::Harness;
use sdma_engine::hw::regs;
use sdma_engine::{DescriptorWidth, DestMask, DeviceConfig, HardwareOps, RingEntry, WriteRequest};

fn narrow() -> Harness {
    Harness::new(DeviceConfig {
        rx_count: 4,
        tx_count: 4,
        ring_depth: 8,
        width: DescriptorWidth::Narrow,
        ..DeviceConfig::default()
    })
}

// Narrow cards take only the buffer index through the FIFO; the bus
// page frame goes through the per-index address table.
#[test]
fn submit_writes_address_table_then_two_fifo_words() {
    let h = narrow();
    let ch = h.dev.open();
    ch.write(&WriteRequest::copying(3, &[0u8; 16])).unwrap();

    let writes = h.regs.drain_writes();
    assert_eq!(writes.len(), 3);
    let idx = writes[0].0 - regs::ADDR_TABLE;
    assert_eq!(idx % 4, 0);
    assert_eq!(writes[1].0, regs::SUBMIT_FIFO_B);
    // dest in bits 30:24, size in bits 23:0.
    assert_eq!(writes[1].1, 3 << 24 | 16);
    assert_eq!(writes[2].0, regs::SUBMIT_FIFO_A);
    assert_eq!(u64::from(writes[2].1 >> 4 & 0xfff), idx / 4);
}

#[test]
fn completions_route_in_narrow_mode() {
    let mut h = narrow();
    let ch = h.dev.open();
    ch.register_destinations(DestMask::single(0x7f)).unwrap();
    h.complete_rx(RingEntry {
        index: h.rx_base(),
        size: 77,
        dest: 0x7f,
        ..RingEntry::default()
    });
    assert_eq!(h.dev.service_interrupt(), 1);
    let mut out = [0u8; 128];
    let r = ch.try_read(Some(&mut out)).unwrap().unwrap();
    assert_eq!(r.size, 77);
    assert_eq!(r.dest, 0x7f);
    h.assert_conserved();
}

// Narrow cards have no software overflow; every free-list push is a
// direct FIFO write even past the ring depth.
#[test]
fn narrow_free_path_never_queues_in_software() {
    let h = Harness::new(DeviceConfig {
        rx_count: 12,
        tx_count: 2,
        ring_depth: 4,
        width: DescriptorWidth::Narrow,
        ..DeviceConfig::default()
    });
    let report = h.card().report();
    assert_eq!(report.hw_free_count, 12);
    assert_eq!(report.free_overflow, 0);
    assert_eq!(h.dev.rx_state_counts().in_hardware, 12);
}

#[test]
fn narrow_index_space_is_validated() {
    let cfg = DeviceConfig {
        rx_count: 0x1000,
        tx_count: 1,
        width: DescriptorWidth::Narrow,
        ..DeviceConfig::default()
    };
    assert!(cfg.validate().is_err());
}
