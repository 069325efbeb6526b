mod common;

use common::Harness;
use sdma_engine::hw::regs;
use sdma_engine::{DestMask, DmaError, RingEntry};

#[test]
fn shutdown_quiesces_card_and_closes_channels() {
    let mut h = Harness::small();
    let ch = h.dev.open();
    ch.register_destinations(DestMask::single(1)).unwrap();
    h.complete_rx(RingEntry {
        index: h.rx_base(),
        size: 8,
        dest: 1,
        ..RingEntry::default()
    });
    h.dev.service_interrupt();

    h.dev.shutdown();
    assert!(ch.is_closed());
    assert_eq!(h.regs.peek(regs::ENABLE), 0);
    assert_eq!(h.regs.peek(regs::ONLINE), 0);
    assert_eq!(h.regs.peek(regs::INT_ENABLE), 0);
    // Queued frames were reclaimed, not leaked.
    h.assert_conserved();
    assert!(matches!(
        ch.read_blocking(None),
        Err(DmaError::Interrupted)
    ));
}

#[test]
fn shutdown_unblocks_writers_waiting_on_free_queue() {
    let h = Harness::small();
    // Drain the free queue so a blocking waiter would park.
    let ch = h.dev.open();
    while ch.acquire_tx_index().is_ok() {}
    let waiter = {
        let q = h.dev.clone();
        std::thread::spawn(move || q.free_queue().wait_for_data())
    };
    std::thread::sleep(std::time::Duration::from_millis(20));
    h.dev.shutdown();
    assert!(!waiter.join().unwrap());
}
