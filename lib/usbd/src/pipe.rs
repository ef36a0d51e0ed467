//! # Endpoint Buffer Pool
//!
//! A [`Pipe`] owns a fixed set of transfer buffers ("URBs") for one
//! endpoint. Each URB carries an atomic ownership tag:
//!
//! ```text
//!            acquire_for_producer          submit
//!   ┌──────┐ ───────────────────► ┌──────────┐ ──────► ┌──────────┐
//!   │ Free │                      │ Producer │         │ Consumer │
//!   └──────┘ ◄─── drop handle ─── └──────────┘         └──────────┘
//!       ▲                                                    │
//!       └──────────── release_from_consumer / purge ─────────┘
//! ```
//!
//! The producer (capture interrupt) and the consumer (USB completion
//! interrupt) run in different contexts, so every transition is a
//! compare-exchange on the tag. The byte storage sits behind a
//! `spin::Mutex`, but the tag already guarantees that only the owner
//! touches it, so the lock is never contended.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use spin::Mutex;

use crate::controller::UsbController;
use crate::{EndpointAddress, UsbError};

// =============================================================================
// Ownership Tags
// =============================================================================

/// Current owner of a URB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UrbOwner {
    Free = 0,
    Producer = 1,
    Consumer = 2,
}

impl UrbOwner {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => UrbOwner::Producer,
            2 => UrbOwner::Consumer,
            _ => UrbOwner::Free,
        }
    }
}

struct UrbStorage {
    data: Vec<u8>,
    len: usize,
}

struct Urb {
    owner: AtomicU8,
    storage: Mutex<UrbStorage>,
}

impl Urb {
    fn new(capacity: usize) -> Self {
        Self {
            owner: AtomicU8::new(UrbOwner::Free as u8),
            storage: Mutex::new(UrbStorage {
                data: vec![0; capacity],
                len: 0,
            }),
        }
    }

    fn owner(&self) -> UrbOwner {
        UrbOwner::from_raw(self.owner.load(Ordering::Acquire))
    }

    fn transition(&self, from: UrbOwner, to: UrbOwner) -> bool {
        self.owner
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Default)]
struct PipeCounters {
    submitted: AtomicU32,
    completed: AtomicU32,
    spin_retries: AtomicU32,
    starved: AtomicU32,
    stale_completions: AtomicU32,
}

/// Snapshot of pipe counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStatistics {
    /// URBs handed to the controller
    pub submitted: u32,
    /// URBs returned by the completion path
    pub completed: u32,
    /// Producer spin iterations spent waiting for a free URB
    pub spin_retries: u32,
    /// Acquisitions that gave up after the spin budget
    pub starved: u32,
    /// Completions for URBs that were no longer consumer-owned
    pub stale_completions: u32,
}

/// Per-owner URB counts. `free + producer + consumer` is always the pool
/// capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub free: usize,
    pub producer: usize,
    pub consumer: usize,
}

impl Occupancy {
    pub fn total(&self) -> usize {
        self.free + self.producer + self.consumer
    }
}

// =============================================================================
// Pipe
// =============================================================================

/// Fixed pool of URBs bound to one endpoint address. The endpoint's
/// packet size may change across bus resets; the pool does not.
pub struct Pipe {
    address: EndpointAddress,
    urbs: Vec<Urb>,
    urb_capacity: usize,
    /// Next URB the producer tries first. Producer-only.
    cursor: AtomicUsize,
    counters: PipeCounters,
}

impl Pipe {
    /// Allocates `urb_count` URBs of `urb_capacity` bytes each.
    pub fn new(address: EndpointAddress, urb_count: usize, urb_capacity: usize) -> Self {
        let urbs = (0..urb_count).map(|_| Urb::new(urb_capacity)).collect();
        log::debug!(
            "usbd: pipe for ep {:#04x}: {} URBs x {} bytes",
            address.0,
            urb_count,
            urb_capacity
        );
        Self {
            address,
            urbs,
            urb_capacity,
            cursor: AtomicUsize::new(0),
            counters: PipeCounters::default(),
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn capacity(&self) -> usize {
        self.urbs.len()
    }

    pub fn urb_capacity(&self) -> usize {
        self.urb_capacity
    }

    /// Claims a free URB for the producer.
    ///
    /// Scans the pool round-robin starting after the last URB handed out.
    /// When every URB is busy it spins, up to `spin_budget` extra passes,
    /// waiting for the completion context to free one. Each extra pass is
    /// counted in [`PipeStatistics::spin_retries`].
    pub fn acquire_for_producer(&self, spin_budget: u32) -> Result<UrbHandle<'_>, UsbError> {
        let count = self.urbs.len();
        if count == 0 {
            return Err(UsbError::BufferStarved);
        }

        let start = self.cursor.load(Ordering::Relaxed);
        for attempt in 0..=spin_budget {
            for offset in 0..count {
                let index = (start + offset) % count;
                let urb = &self.urbs[index];
                if urb.transition(UrbOwner::Free, UrbOwner::Producer) {
                    urb.storage.lock().len = 0;
                    self.cursor.store((index + 1) % count, Ordering::Relaxed);
                    return Ok(UrbHandle {
                        pipe: self,
                        index,
                        released: false,
                    });
                }
            }
            if attempt < spin_budget {
                self.counters.spin_retries.fetch_add(1, Ordering::Relaxed);
                core::hint::spin_loop();
            }
        }

        self.counters.starved.fetch_add(1, Ordering::Relaxed);
        log::warn!("usbd: ep {:#04x} starved for URBs", self.address.0);
        Err(UsbError::BufferStarved)
    }

    /// Hands a filled URB to the controller. Ownership moves to the
    /// consumer before the controller sees the bytes, so a completion that
    /// races the return of `submit` is still valid.
    pub fn submit<C>(&self, mut handle: UrbHandle<'_>, controller: &mut C) -> Result<(), UsbError>
    where
        C: UsbController + ?Sized,
    {
        let index = handle.index;
        handle.released = true;
        let urb = &self.urbs[index];

        if !urb.transition(UrbOwner::Producer, UrbOwner::Consumer) {
            return Err(UsbError::Cancelled);
        }

        let result = {
            let storage = urb.storage.lock();
            controller.submit(self.address, index, &storage.data[..storage.len])
        };

        match result {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                urb.transition(UrbOwner::Consumer, UrbOwner::Free);
                Err(err)
            }
        }
    }

    /// Returns a drained URB to the pool. Called from the completion
    /// context.
    ///
    /// Returns `Ok(false)` for a completion that arrives after the URB was
    /// already reclaimed by [`purge`](Self::purge); such completions are
    /// ignored.
    pub fn release_from_consumer(&self, urb: usize) -> Result<bool, UsbError> {
        let entry = self.urbs.get(urb).ok_or(UsbError::InvalidUrb)?;
        if entry.transition(UrbOwner::Consumer, UrbOwner::Free) {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        } else {
            self.counters.stale_completions.fetch_add(1, Ordering::Relaxed);
            log::debug!("usbd: stale completion for URB {}", urb);
            Ok(false)
        }
    }

    /// Returns every URB to `Free`. Used on stream stop; in-flight
    /// transfers are not waited for and their completions become stale.
    pub fn purge(&self) {
        for urb in &self.urbs {
            urb.owner.store(UrbOwner::Free as u8, Ordering::Release);
        }
        self.cursor.store(0, Ordering::Relaxed);
    }

    /// Current owner of URB `urb`.
    pub fn owner(&self, urb: usize) -> Option<UrbOwner> {
        self.urbs.get(urb).map(Urb::owner)
    }

    pub fn occupancy(&self) -> Occupancy {
        let mut occupancy = Occupancy::default();
        for urb in &self.urbs {
            match urb.owner() {
                UrbOwner::Free => occupancy.free += 1,
                UrbOwner::Producer => occupancy.producer += 1,
                UrbOwner::Consumer => occupancy.consumer += 1,
            }
        }
        occupancy
    }

    pub fn stats(&self) -> PipeStatistics {
        PipeStatistics {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            spin_retries: self.counters.spin_retries.load(Ordering::Relaxed),
            starved: self.counters.starved.load(Ordering::Relaxed),
            stale_completions: self.counters.stale_completions.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Producer Handle
// =============================================================================

/// Producer-owned URB. Dropping a handle without submitting it returns the
/// URB to the pool.
pub struct UrbHandle<'a> {
    pipe: &'a Pipe,
    index: usize,
    released: bool,
}

impl UrbHandle<'_> {
    /// URB identifier reported back on completion.
    pub fn id(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.pipe.urbs[self.index].storage.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> usize {
        self.pipe.urb_capacity - self.len()
    }

    /// Appends as much of `bytes` as fits; returns the number written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let mut storage = self.pipe.urbs[self.index].storage.lock();
        let start = storage.len;
        let count = bytes.len().min(storage.data.len() - start);
        storage.data[start..start + count].copy_from_slice(&bytes[..count]);
        storage.len += count;
        count
    }

    /// Bytes written so far.
    pub fn with_contents<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let storage = self.pipe.urbs[self.index].storage.lock();
        f(&storage.data[..storage.len])
    }
}

impl Drop for UrbHandle<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.pipe.urbs[self.index].transition(UrbOwner::Producer, UrbOwner::Free);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Endpoint, UsbSpeed};
    use alloc::sync::Arc;
    use std::thread;

    struct RecordingController {
        sent: Vec<(usize, Vec<u8>)>,
        fail: bool,
    }

    impl RecordingController {
        fn new() -> Self {
            Self { sent: Vec::new(), fail: false }
        }
    }

    impl UsbController for RecordingController {
        fn speed(&self) -> UsbSpeed {
            UsbSpeed::High
        }

        fn create_endpoint(&mut self, _endpoint: &Endpoint) -> Result<(), UsbError> {
            Ok(())
        }

        fn submit(&mut self, _ep: EndpointAddress, urb: usize, data: &[u8]) -> Result<(), UsbError> {
            if self.fail {
                return Err(UsbError::TransferFailed);
            }
            self.sent.push((urb, data.to_vec()));
            Ok(())
        }
    }

    fn bulk_pipe(count: usize) -> Pipe {
        Pipe::new(EndpointAddress::input(1), count, 64)
    }

    #[test]
    fn test_acquire_write_submit_release() {
        let pipe = bulk_pipe(2);
        let mut ctrl = RecordingController::new();

        let mut urb = pipe.acquire_for_producer(0).unwrap();
        assert_eq!(urb.write(b"hello"), 5);
        let id = urb.id();
        assert_eq!(pipe.owner(id), Some(UrbOwner::Producer));

        pipe.submit(urb, &mut ctrl).unwrap();
        assert_eq!(pipe.owner(id), Some(UrbOwner::Consumer));
        assert_eq!(ctrl.sent[0].1, b"hello");

        assert_eq!(pipe.release_from_consumer(id), Ok(true));
        assert_eq!(pipe.owner(id), Some(UrbOwner::Free));
        assert_eq!(pipe.stats().submitted, 1);
        assert_eq!(pipe.stats().completed, 1);
    }

    #[test]
    fn test_write_truncates_at_capacity() {
        let pipe = bulk_pipe(1);
        let mut urb = pipe.acquire_for_producer(0).unwrap();
        assert_eq!(urb.write(&[0xAA; 100]), 64);
        assert_eq!(urb.remaining(), 0);
        assert_eq!(urb.write(&[0xBB]), 0);
    }

    #[test]
    fn test_starvation_counts_retries() {
        let pipe = bulk_pipe(1);
        let mut ctrl = RecordingController::new();
        let urb = pipe.acquire_for_producer(0).unwrap();
        pipe.submit(urb, &mut ctrl).unwrap();

        assert_eq!(pipe.acquire_for_producer(5).err(), Some(UsbError::BufferStarved));
        let stats = pipe.stats();
        assert_eq!(stats.spin_retries, 5);
        assert_eq!(stats.starved, 1);
    }

    #[test]
    fn test_dropped_handle_returns_to_free() {
        let pipe = bulk_pipe(1);
        {
            let mut urb = pipe.acquire_for_producer(0).unwrap();
            urb.write(b"abc");
        }
        assert_eq!(pipe.occupancy().free, 1);
        // Re-acquired URB starts empty
        let urb = pipe.acquire_for_producer(0).unwrap();
        assert!(urb.is_empty());
    }

    #[test]
    fn test_failed_submit_frees_urb() {
        let pipe = bulk_pipe(1);
        let mut ctrl = RecordingController::new();
        ctrl.fail = true;
        let urb = pipe.acquire_for_producer(0).unwrap();
        assert_eq!(pipe.submit(urb, &mut ctrl), Err(UsbError::TransferFailed));
        assert_eq!(pipe.occupancy().free, 1);
    }

    #[test]
    fn test_purge_makes_completions_stale() {
        let pipe = bulk_pipe(3);
        let mut ctrl = RecordingController::new();
        for _ in 0..3 {
            let urb = pipe.acquire_for_producer(0).unwrap();
            pipe.submit(urb, &mut ctrl).unwrap();
        }
        assert_eq!(pipe.occupancy().consumer, 3);

        pipe.purge();
        assert_eq!(pipe.occupancy().free, 3);
        assert_eq!(pipe.release_from_consumer(1), Ok(false));
        assert_eq!(pipe.stats().stale_completions, 1);
        assert_eq!(pipe.release_from_consumer(7), Err(UsbError::InvalidUrb));
    }

    #[test]
    fn test_submit_after_purge_is_cancelled() {
        let pipe = bulk_pipe(1);
        let mut ctrl = RecordingController::new();
        let urb = pipe.acquire_for_producer(0).unwrap();
        pipe.purge();
        assert_eq!(pipe.submit(urb, &mut ctrl), Err(UsbError::Cancelled));
        assert!(ctrl.sent.is_empty());
    }

    #[test]
    fn test_round_robin_order() {
        let pipe = bulk_pipe(3);
        let mut ctrl = RecordingController::new();
        for _ in 0..3 {
            let urb = pipe.acquire_for_producer(0).unwrap();
            pipe.submit(urb, &mut ctrl).unwrap();
        }
        let order: Vec<usize> = ctrl.sent.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_single_owner_across_contexts() {
        let pipe = Arc::new(bulk_pipe(4));
        let completions = Arc::new(Mutex::new(Vec::new()));

        let consumer = {
            let pipe = Arc::clone(&pipe);
            let completions = Arc::clone(&completions);
            thread::spawn(move || {
                let mut released = 0;
                while released < 200 {
                    let next = completions.lock().pop();
                    if let Some(id) = next {
                        assert_eq!(pipe.release_from_consumer(id), Ok(true));
                        released += 1;
                    }
                    assert_eq!(pipe.occupancy().total(), 4);
                }
            })
        };

        struct Forwarding(Arc<Mutex<Vec<usize>>>);
        impl UsbController for Forwarding {
            fn speed(&self) -> UsbSpeed {
                UsbSpeed::High
            }
            fn create_endpoint(&mut self, _endpoint: &Endpoint) -> Result<(), UsbError> {
                Ok(())
            }
            fn submit(&mut self, _ep: EndpointAddress, urb: usize, _data: &[u8]) -> Result<(), UsbError> {
                self.0.lock().push(urb);
                Ok(())
            }
        }

        let mut ctrl = Forwarding(Arc::clone(&completions));
        let mut sent = 0;
        while sent < 200 {
            if let Ok(mut urb) = pipe.acquire_for_producer(1000) {
                urb.write(&[sent as u8]);
                pipe.submit(urb, &mut ctrl).unwrap();
                sent += 1;
            }
            assert_eq!(pipe.occupancy().total(), 4);
        }

        consumer.join().unwrap();
        assert_eq!(pipe.occupancy().free, 4);
        assert_eq!(pipe.stats().completed, 200);
    }
}
