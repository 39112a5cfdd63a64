//! Dead-letter queue: a bounded ring buffer holding events that failed
//! primary dispatch. Grows by doubling up to a hard cap and shrinks back
//! when mostly empty.

use super::hub::Event;
use super::{now_millis, CancelToken};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

pub const MIN_CAPACITY: usize = 32;
pub const MAX_CAPACITY: usize = 1 << 20;

/// Pops between shrink checks.
const SHRINK_CHECK_EVERY: u64 = 10;

/// A failed dispatch held for later retry or inspection.
#[derive(Debug, Clone)]
pub struct DlqEvent {
    /// Monotonic, assigned on push.
    pub id: u64,
    pub original_event: Event,
    pub fail_reason: String,
    pub error: Option<String>,
    pub retry_count: u32,
    pub enqueued_at: i64,
    pub last_attempt_at: i64,
}

impl DlqEvent {
    pub fn new(original_event: Event, fail_reason: String, error: Option<String>) -> Self {
        let now = now_millis();
        Self {
            id: 0,
            original_event,
            fail_reason,
            error,
            retry_count: 0,
            enqueued_at: now,
            last_attempt_at: now,
        }
    }
}

struct Ring {
    buf: Vec<Option<DlqEvent>>,
    head: usize,
    tail: usize,
    count: usize,
    // id -> physical position, kept in step with every move.
    positions: HashMap<u64, usize>,
    pops: u64,
}

impl Ring {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            count: 0,
            positions: HashMap::new(),
            pops: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Copy the live elements in logical head-to-tail order into a buffer
    /// of `target` slots, reset head to 0 and tail to count, and rebuild
    /// the position map for the new layout.
    fn resize(&mut self, target: usize) {
        debug_assert!(target >= self.count);
        let mut fresh: Vec<Option<DlqEvent>> = (0..target).map(|_| None).collect();
        let mut positions = HashMap::with_capacity(self.count);
        for i in 0..self.count {
            let from = (self.head + i) % self.capacity();
            let event = self.buf[from].take();
            if let Some(event) = &event {
                positions.insert(event.id, i);
            }
            fresh[i] = event;
        }
        self.buf = fresh;
        self.head = 0;
        self.tail = if self.count == target { 0 } else { self.count };
        self.positions = positions;
    }
}

/// Bounded holder of failed events with idempotent close.
pub struct DeadLetterQueue {
    ring: Mutex<Ring>,
    closed: AtomicBool,
    next_id: AtomicU64,
    // Mirrors ring.count so len() never takes the lock.
    count: AtomicUsize,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        Self {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            count: AtomicUsize::new(0),
        }
    }

    fn check_open(&self, ctx: &CancelToken) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::QueueClosed);
        }
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Enqueue an event, growing the buffer (doubling, capped at
    /// [`MAX_CAPACITY`]) when full. Fails with `QueueFull` only when the
    /// buffer is full at maximum capacity. Returns the assigned id.
    pub fn push(&self, mut event: DlqEvent, ctx: &CancelToken) -> Result<u64> {
        self.check_open(ctx)?;
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());

        if ring.count == ring.capacity() {
            if ring.capacity() >= MAX_CAPACITY {
                return Err(Error::QueueFull);
            }
            let target = (ring.capacity() * 2).min(MAX_CAPACITY);
            debug!(from = ring.capacity(), to = target, "expanding dead-letter queue");
            ring.resize(target);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        event.id = id;
        event.enqueued_at = now_millis();
        let tail = ring.tail;
        ring.buf[tail] = Some(event);
        ring.positions.insert(id, tail);
        ring.tail = (tail + 1) % ring.capacity();
        ring.count += 1;
        self.count.store(ring.count, Ordering::Release);
        Ok(id)
    }

    /// Dequeue the oldest event; `None` when empty. Every tenth pop, a
    /// mostly-empty buffer is shrunk (halved, floored at
    /// [`MIN_CAPACITY`] and at the live count).
    pub fn pop(&self, ctx: &CancelToken) -> Result<Option<DlqEvent>> {
        self.check_open(ctx)?;
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.count == 0 {
            return Ok(None);
        }

        let head = ring.head;
        let event = ring.buf[head].take();
        if let Some(event) = &event {
            ring.positions.remove(&event.id);
        }
        ring.head = (head + 1) % ring.capacity();
        ring.count -= 1;
        ring.pops += 1;
        self.count.store(ring.count, Ordering::Release);

        if ring.pops % SHRINK_CHECK_EVERY == 0
            && ring.capacity() > MIN_CAPACITY
            && ring.count < ring.capacity() / 4
        {
            let target = (ring.capacity() / 2).max(MIN_CAPACITY).max(ring.count);
            debug!(from = ring.capacity(), to = target, "shrinking dead-letter queue");
            ring.resize(target);
        }
        Ok(event)
    }

    /// Remove one event by id; `false` when no such id is queued.
    pub fn remove_by_id(&self, id: u64, ctx: &CancelToken) -> Result<bool> {
        self.check_open(ctx)?;
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if !ring.positions.contains_key(&id) {
            return Ok(false);
        }

        // Compact the survivors in logical order; removal is rare enough
        // that the linear rebuild is not worth avoiding.
        let capacity = ring.capacity();
        let mut survivors = Vec::with_capacity(ring.count - 1);
        for i in 0..ring.count {
            let from = (ring.head + i) % capacity;
            if let Some(event) = ring.buf[from].take() {
                if event.id != id {
                    survivors.push(event);
                }
            }
        }
        ring.head = 0;
        ring.tail = if survivors.len() == capacity {
            0
        } else {
            survivors.len()
        };
        ring.count = survivors.len();
        ring.positions.clear();
        for (i, event) in survivors.into_iter().enumerate() {
            ring.positions.insert(event.id, i);
            ring.buf[i] = Some(event);
        }
        self.count.store(ring.count, Ordering::Release);
        Ok(true)
    }

    /// Clone out every queued event in logical order.
    pub fn get_all(&self, ctx: &CancelToken) -> Result<Vec<DlqEvent>> {
        self.check_open(ctx)?;
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let mut events = Vec::with_capacity(ring.count);
        for i in 0..ring.count {
            let from = (ring.head + i) % ring.capacity();
            if let Some(event) = &ring.buf[from] {
                events.push(event.clone());
            }
        }
        Ok(events)
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .capacity()
    }

    /// Idempotent; afterwards every operation fails with `QueueClosed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("dead-letter queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}
