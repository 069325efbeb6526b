//! Bounded FIFO of buffer references.
//!
//! Backing storage is a circular array with one sentinel slot, sized at
//! construction and never grown, so push and pop are O(1) with no
//! allocation on the hot path. Every push wakes all waiters; a closed
//! queue refuses pushes and unblocks waits immediately, which is how
//! teardown cancels blocked readers.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::buffer::Buffer;
use crate::lock;

struct QueueInner {
    slots: Box<[Option<Arc<Buffer>>]>,
    read: usize,
    write: usize,
    closed: bool,
}

impl QueueInner {
    fn len(&self) -> usize {
        (self.write + self.slots.len() - self.read) % self.slots.len()
    }

    fn is_full(&self) -> bool {
        (self.write + 1) % self.slots.len() == self.read
    }

    fn push(&mut self, buf: Arc<Buffer>) -> Option<Arc<Buffer>> {
        if self.closed || self.is_full() {
            return Some(buf);
        }
        self.slots[self.write] = Some(buf);
        self.write = (self.write + 1) % self.slots.len();
        None
    }

    fn pop(&mut self) -> Option<Arc<Buffer>> {
        if self.read == self.write {
            return None;
        }
        let buf = self.slots[self.read].take();
        self.read = (self.read + 1) % self.slots.len();
        buf
    }
}

pub struct BufferQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
}

impl BufferQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                slots: vec![None; capacity + 1].into_boxed_slice(),
                read: 0,
                write: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn guard(&self) -> MutexGuard<'_, QueueInner> {
        lock(&self.inner)
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.guard().slots.len() - 1
    }

    /// Append one buffer. On overflow or after close the buffer comes
    /// back to the caller untouched.
    pub fn push(&self, buf: Arc<Buffer>) -> Result<(), Arc<Buffer>> {
        let rejected = self.guard().push(buf);
        match rejected {
            Some(buf) => Err(buf),
            None => {
                self.ready.notify_all();
                Ok(())
            }
        }
    }

    /// Append a batch under one lock acquisition. Returns the untaken
    /// tail if the queue fills mid-batch; entries already stored stay
    /// stored.
    pub fn push_bulk(&self, bufs: Vec<Arc<Buffer>>) -> Result<(), Vec<Arc<Buffer>>> {
        let mut inner = self.guard();
        let mut it = bufs.into_iter();
        let mut stored = false;
        while let Some(buf) = it.next() {
            if let Some(back) = inner.push(buf) {
                drop(inner);
                if stored {
                    self.ready.notify_all();
                }
                let mut rest = vec![back];
                rest.extend(it);
                return Err(rest);
            }
            stored = true;
        }
        drop(inner);
        if stored {
            self.ready.notify_all();
        }
        Ok(())
    }

    pub fn pop(&self) -> Option<Arc<Buffer>> {
        self.guard().pop()
    }

    /// Pop up to `max` buffers under one lock acquisition.
    pub fn pop_bulk(&self, max: usize) -> Vec<Arc<Buffer>> {
        let mut inner = self.guard();
        let mut out = Vec::new();
        while out.len() < max {
            match inner.pop() {
                Some(buf) => out.push(buf),
                None => break,
            }
        }
        out
    }

    /// Block until the queue is non-empty or closed. Returns false if
    /// the queue was closed, true otherwise. A true return does not
    /// guarantee a subsequent pop succeeds; another consumer may win.
    pub fn wait_for_data(&self) -> bool {
        let mut inner = self.guard();
        loop {
            if inner.closed {
                return false;
            }
            if inner.len() != 0 {
                return true;
            }
            inner = self
                .ready
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// As [`wait_for_data`](Self::wait_for_data) with a deadline.
    /// Returns false on close or timeout.
    pub fn wait_for_data_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.guard();
        loop {
            if inner.closed {
                return false;
            }
            if inner.len() != 0 {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _) = self
                .ready
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = g;
        }
    }

    /// Refuse further pushes and wake every waiter. Entries already
    /// queued remain poppable so teardown can drain them.
    pub fn close(&self) {
        self.guard().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.guard().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, Direction};
    use proptest::prelude::*;
    use sdma_mem::{BusHeap, CoherencyMode, BUS_PAGE};

    fn bufs(n: u32) -> Vec<Arc<Buffer>> {
        let heap = BusHeap::new(u64::from(n + 1) * BUS_PAGE);
        let pool = BufferPool::allocate(
            &heap,
            n,
            0,
            Direction::Bidirectional,
            CoherencyMode::Coherent,
            64,
        )
        .unwrap();
        pool.iter().cloned().collect()
    }

    #[test]
    fn fifo_order() {
        let q = BufferQueue::new(8);
        for b in bufs(5) {
            q.push(b).unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.pop().unwrap().index(), i);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn overflow_returns_buffer_and_preserves_contents() {
        let q = BufferQueue::new(3);
        let b = bufs(4);
        for x in &b[..3] {
            q.push(x.clone()).unwrap();
        }
        assert_eq!(q.len(), 3);
        let back = q.push(b[3].clone()).unwrap_err();
        assert_eq!(back.index(), 3);
        for i in 0..3 {
            assert_eq!(q.pop().unwrap().index(), i);
        }
    }

    #[test]
    fn bulk_push_partial_on_overflow() {
        let q = BufferQueue::new(2);
        let rest = q.push_bulk(bufs(4)).unwrap_err();
        assert_eq!(q.len(), 2);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].index(), 2);
        assert_eq!(rest[1].index(), 3);
        assert_eq!(q.pop_bulk(10).len(), 2);
    }

    #[test]
    fn closed_queue_rejects_push_but_drains() {
        let q = BufferQueue::new(4);
        let b = bufs(2);
        q.push(b[0].clone()).unwrap();
        q.close();
        assert!(q.push(b[1].clone()).is_err());
        assert_eq!(q.pop().unwrap().index(), 0);
        assert!(!q.wait_for_data());
    }

    #[test]
    fn push_wakes_blocked_waiter() {
        let q = Arc::new(BufferQueue::new(4));
        let b = bufs(1).remove(0);
        let waiter = {
            let q = q.clone();
            std::thread::spawn(move || q.wait_for_data())
        };
        std::thread::sleep(Duration::from_millis(20));
        q.push(b).unwrap();
        assert!(waiter.join().unwrap());
        assert!(q.pop().is_some());
    }

    #[test]
    fn close_wakes_blocked_waiter() {
        let q = Arc::new(BufferQueue::new(4));
        let waiter = {
            let q = q.clone();
            std::thread::spawn(move || q.wait_for_data())
        };
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn wait_timeout_expires() {
        let q = BufferQueue::new(2);
        assert!(!q.wait_for_data_timeout(Duration::from_millis(10)));
    }

    proptest! {
        // Any interleaving of pushes and pops preserves FIFO order and
        // never exceeds capacity.
        #[test]
        fn fifo_under_interleaving(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let q = BufferQueue::new(16);
            let pool = bufs(200);
            let mut next_in = 0usize;
            let mut next_out = 0usize;
            for push in ops {
                if push {
                    if next_in < pool.len() && q.push(pool[next_in].clone()).is_ok() {
                        next_in += 1;
                    }
                    prop_assert!(q.len() <= 16);
                } else if let Some(b) = q.pop() {
                    prop_assert_eq!(b.index() as usize, next_out);
                    next_out += 1;
                }
            }
            prop_assert_eq!(q.len(), next_in - next_out);
        }
    }
}
