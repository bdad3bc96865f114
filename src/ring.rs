//! Lock-free single-producer/single-consumer ring buffer for [`Sample`] handoff between
//! the sampler thread and the orchestrator thread.
//!
//! Capacity is rounded up to a power of two so index wrapping is a bitmask instead of a
//! modulo. Head and tail are each padded to their own cache line to avoid false sharing
//! between the producer and the consumer.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::sample::Sample;

const CACHE_LINE_SIZE: usize = 64;

#[repr(align(64))]
struct PaddedAtomic(AtomicUsize);

struct Inner {
    buffer: UnsafeCell<Box<[Sample]>>,
    capacity: usize,
    mask: usize,
    head: PaddedAtomic,
    tail: PaddedAtomic,
}

// SAFETY: `buffer` is only ever written by the single producer at index `head` and only
// ever read by the single consumer at index `tail`; the atomics establish the
// happens-before edges that make those accesses race-free.
unsafe impl Sync for Inner {}
unsafe impl Send for Inner {}

fn next_power_of_two(v: usize) -> usize {
    v.next_power_of_two()
}

/// Creates a bound producer/consumer pair sharing one ring of at least `capacity` slots.
pub fn channel(capacity: usize) -> (RingProducer, RingConsumer) {
    let capacity = next_power_of_two(capacity.max(2));
    let buffer = vec![Sample::default_zeroed(); capacity].into_boxed_slice();
    let inner = Arc::new(Inner {
        buffer: UnsafeCell::new(buffer),
        capacity,
        mask: capacity - 1,
        head: PaddedAtomic(AtomicUsize::new(0)),
        tail: PaddedAtomic(AtomicUsize::new(0)),
    });
    (
        RingProducer {
            inner: inner.clone(),
        },
        RingConsumer { inner },
    )
}

pub struct RingProducer {
    inner: Arc<Inner>,
}

pub struct RingConsumer {
    inner: Arc<Inner>,
}

// both sides need Send to cross the thread::spawn boundary; neither needs Sync since each
// is only ever held by one thread at a time.
unsafe impl Send for RingProducer {}
unsafe impl Send for RingConsumer {}

impl RingProducer {
    /// Attempts to push `sample`. Returns `false` (dropping the sample) if the ring is full.
    pub fn push(&self, sample: Sample) -> bool {
        let inner = &*self.inner;
        let head = inner.head.0.load(Ordering::Relaxed);
        let tail = inner.tail.0.load(Ordering::Acquire);

        let next = (head + 1) & inner.mask;
        if next == tail {
            return false;
        }

        unsafe {
            let buf = &mut *inner.buffer.get();
            buf[head] = sample;
        }

        inner.head.0.store(next, Ordering::Release);
        true
    }
}

impl RingConsumer {
    /// Attempts to pop the oldest sample. Returns `None` if the ring is empty.
    pub fn pop(&self) -> Option<Sample> {
        let inner = &*self.inner;
        let tail = inner.tail.0.load(Ordering::Relaxed);
        let head = inner.head.0.load(Ordering::Acquire);

        if tail == head {
            return None;
        }

        let sample = unsafe {
            let buf = &*inner.buffer.get();
            buf[tail]
        };

        let next = (tail + 1) & inner.mask;
        inner.tail.0.store(next, Ordering::Release);
        Some(sample)
    }

    /// Number of samples currently queued. Best-effort under concurrent access.
    pub fn len(&self) -> usize {
        let inner = &*self.inner;
        let head = inner.head.0.load(Ordering::Acquire);
        let tail = inner.tail.0.load(Ordering::Acquire);
        (head.wrapping_sub(tail)) & inner.mask
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Sample {
    /// A zero-valued sample used only to pre-fill ring slots before first use.
    fn default_zeroed() -> Sample {
        Sample {
            timestamp_ns: 0,
            cycles: 0,
            instructions: 0,
            cache_references: 0,
            cache_misses: 0,
            branch_instructions: 0,
            branch_misses: 0,
            cache_miss_rate: 0.0,
            branch_miss_rate: 0.0,
            ipc: 0.0,
        }
    }
}

const _: () = {
    assert!(CACHE_LINE_SIZE == 64);
};

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: u64) -> Sample {
        let mut s = Sample::default_zeroed();
        s.timestamp_ns = ts;
        s
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let (_, c) = channel(10);
        assert_eq!(c.capacity(), 16);
    }

    #[test]
    fn push_pop_preserves_order() {
        let (p, c) = channel(4);
        assert!(p.push(sample(1)));
        assert!(p.push(sample(2)));
        assert_eq!(c.pop().unwrap().timestamp_ns, 1);
        assert_eq!(c.pop().unwrap().timestamp_ns, 2);
        assert!(c.pop().is_none());
    }

    #[test]
    fn full_ring_drops_new_samples() {
        let (p, c) = channel(2);
        // capacity rounds to 2, one slot always reserved, so only 1 usable slot
        assert!(p.push(sample(1)));
        assert!(!p.push(sample(2)));
        assert_eq!(c.len(), 1);
        assert_eq!(c.pop().unwrap().timestamp_ns, 1);
    }

    #[test]
    fn empty_ring_reports_len_zero() {
        let (_, c) = channel(8);
        assert!(c.is_empty());
        assert_eq!(c.len(), 0);
    }
}
