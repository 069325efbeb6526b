mod common;

use common::Harness;
use sdma_engine::{DestMask, HardwareOps, RingEntry};

// A malformed ring entry is skipped and counted; the scan keeps going
// and later entries still route.
#[test]
fn corrupt_slot_is_skipped_and_scan_continues() {
    let h = Harness::small();
    let ch = h.dev.open();
    ch.register_destinations(DestMask::single(1)).unwrap();

    // No valid-marker bit: looks occupied but malformed.
    h.card().rx_ring().poison(0, 0x0bad_c0de);
    assert!(h.card().rx_ring().post(
        1,
        &RingEntry {
            index: h.rx_base(),
            size: 32,
            dest: 1,
            ..RingEntry::default()
        }
    ));

    assert_eq!(h.dev.service_interrupt(), 2);
    assert_eq!(h.card().report().corrupt_entries, 1);

    let mut out = [0u8; 64];
    let r = ch.try_read(Some(&mut out)).unwrap().unwrap();
    assert_eq!(r.size, 32);
    h.assert_conserved();
}

#[test]
fn completion_for_unknown_index_is_dropped() {
    let mut h = Harness::small();
    h.complete_rx(RingEntry {
        index: 9999,
        size: 10,
        dest: 0,
        ..RingEntry::default()
    });
    assert_eq!(h.dev.service_interrupt(), 1);
    // Nothing crashed and no tracked buffer changed state.
    h.assert_conserved();
    assert_eq!(h.dev.rx_state_counts().in_hardware, 4);
}
