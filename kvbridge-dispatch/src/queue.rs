//! Multi-producer queue drained in bulk by a single consumer.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::slot::ResultSlot;

/// Unbounded FIFO shared by many producers and one draining consumer.
///
/// Producers hold the lock only for one push; the consumer swaps the whole
/// buffer out, so callbacks never run under the lock.
#[derive(Debug)]
pub struct MpscQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for MpscQueue<T> {
    fn default() -> Self {
        MpscQueue {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> MpscQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
    }

    /// Removes and returns everything queued so far, oldest first.
    pub fn take_all(&self) -> VecDeque<T> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Completed results of one operation kind, waiting for the drain.
pub type CompletedQueue<T> = MpscQueue<Box<ResultSlot<T>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn take_all_preserves_push_order() {
        let queue = MpscQueue::new();
        for idx in 0..5 {
            queue.push(idx);
        }
        let drained: Vec<_> = queue.take_all().into_iter().collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = Arc::new(MpscQueue::new());
        let producers: Vec<_> = (0..8)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for idx in 0..1_000 {
                        queue.push(producer * 1_000 + idx);
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        for handle in producers {
            handle.join().unwrap();
            seen.extend(queue.take_all());
        }
        seen.extend(queue.take_all());

        seen.sort_unstable();
        assert_eq!(seen, (0..8_000).collect::<Vec<_>>());
    }
}
