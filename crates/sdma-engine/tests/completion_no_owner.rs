mod common;

use common::Harness;
use sdma_engine::{HardwareOps, RingEntry};

// A completion for a destination no channel owns must not strand the
// buffer: it goes straight back to the hardware free path and the
// hardware-owned count ends where it started.
#[test]
fn unowned_destination_resubmits_buffer() {
    let mut h = Harness::small();
    let base = h.rx_base();
    assert_eq!(h.card().report().hw_free_count, 4);

    h.complete_rx(RingEntry {
        index: base,
        size: 100,
        dest: 2,
        ..RingEntry::default()
    });
    assert_eq!(h.dev.service_interrupt(), 1);

    let report = h.card().report();
    assert_eq!(report.hw_free_count, 4);
    let rx = h.dev.rx_state_counts();
    assert_eq!(rx.in_hardware, 4);
    h.assert_conserved();

    // The frame still happened as far as the buffer is concerned.
    let buf = h.dev.rx_pool().get(base).unwrap();
    assert_eq!(buf.meta().use_count, 1);
}

#[test]
fn channel_closed_before_service_does_not_leak() {
    let mut h = Harness::small();
    let ch = h.dev.open();
    ch.register_destinations(sdma_engine::DestMask::single(3)).unwrap();
    h.complete_rx(RingEntry {
        index: h.rx_base(),
        size: 10,
        dest: 3,
        ..RingEntry::default()
    });
    // Destination released before the entry is serviced.
    ch.close();
    assert_eq!(h.dev.service_interrupt(), 1);
    assert_eq!(h.dev.rx_state_counts().in_hardware, 4);
    h.assert_conserved();
}
