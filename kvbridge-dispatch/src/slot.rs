//! # Result Slots
//!
//! Purpose: Reusable records that carry one asynchronous call from the
//! submitting thread, through a worker, to the drain that fires its callback.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Slots are allocated a batch at a time and
//!    recycled after their callback fires; the pool never shrinks.
//! 2. **Single Owner**: A slot is a `Box` moved between the free list, one
//!    worker, the completed queue and the drain. No two holders exist at once.
//! 3. **Capacity Reuse**: `Payload::reset` clears collections in place so
//!    recycled slots keep their allocations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use kvbridge_client::Connection;
use parking_lot::Mutex;

/// Default number of slots allocated each time a free list runs dry.
pub const DEFAULT_RESULT_BATCH: usize = 100;

/// Callback stored in a slot; receives the success flag and the payload.
pub type Completion<T> = Box<dyn FnOnce(bool, &T) + Send>;

/// Result shape carried by a slot.
pub trait Payload: Default + Send + 'static {
    /// Restores the default value, keeping allocations where possible.
    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Payload for () {}
impl Payload for bool {}
impl Payload for i64 {}

impl Payload for String {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Payload for Vec<String> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Payload for HashMap<String, String> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// One in-flight or idle asynchronous result.
pub struct ResultSlot<T: Payload> {
    pub success: bool,
    pub payload: T,
    callback: Option<Completion<T>>,
    connection: Option<Connection>,
}

impl<T: Payload> Default for ResultSlot<T> {
    fn default() -> Self {
        ResultSlot {
            success: false,
            payload: T::default(),
            callback: None,
            connection: None,
        }
    }
}

impl<T: Payload> ResultSlot<T> {
    /// Installs the completion callback for the next call.
    pub fn arm(&mut self, callback: Completion<T>) {
        self.callback = Some(callback);
    }

    /// Records the connection borrowed for this call.
    pub fn attach(&mut self, conn: Connection) {
        self.connection = Some(conn);
    }

    /// Hands the borrowed connection back, if any.
    pub fn take_connection(&mut self) -> Option<Connection> {
        self.connection.take()
    }

    /// Fires the callback once. Returns false when none was armed.
    pub fn complete(&mut self) -> bool {
        match self.callback.take() {
            Some(callback) => {
                callback(self.success, &self.payload);
                true
            }
            None => false,
        }
    }

    /// Clears every field back to its default.
    pub fn reset(&mut self) {
        self.success = false;
        self.payload.reset();
        self.callback = None;
        self.connection = None;
    }

    pub fn is_armed(&self) -> bool {
        self.callback.is_some()
    }
}

/// Free list of slots for one result shape.
pub struct ResultPool<T: Payload> {
    free: Mutex<Vec<Box<ResultSlot<T>>>>,
    batch: usize,
    capacity: AtomicUsize,
}

impl<T: Payload> ResultPool<T> {
    /// Creates a pool and allocates the first batch up front.
    pub fn new(batch: usize) -> Self {
        let pool = ResultPool {
            free: Mutex::new(Vec::new()),
            batch: batch.max(1),
            capacity: AtomicUsize::new(0),
        };
        pool.grow(&mut pool.free.lock());
        pool
    }

    fn grow(&self, free: &mut Vec<Box<ResultSlot<T>>>) {
        free.reserve(self.batch);
        free.extend((0..self.batch).map(|_| Box::<ResultSlot<T>>::default()));
        self.capacity.fetch_add(self.batch, Ordering::Relaxed);
    }

    /// Takes a free slot, allocating another batch when the list is empty.
    pub fn checkout(&self) -> Box<ResultSlot<T>> {
        let mut free = self.free.lock();
        if free.is_empty() {
            self.grow(&mut free);
        }
        match free.pop() {
            Some(slot) => slot,
            None => Box::default(),
        }
    }

    /// Resets a slot and returns it to the free list.
    pub fn recycle(&self, mut slot: Box<ResultSlot<T>>) {
        slot.reset();
        self.free.lock().push(slot);
    }

    /// Total slots ever allocated by this pool.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }
}
