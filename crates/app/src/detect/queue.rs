//! Bounded output queue with a drop-oldest overflow policy.
//!
//! The postprocess stage pushes annotated frames here and the stream adapter
//! pops them. Producers never block: when full, the oldest frame is evicted
//! so a slow consumer sees stale frames dropped rather than stalling the
//! pipeline. Eviction and insert happen under one lock so a concurrent timed
//! pop can never observe a partially applied overflow.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::Duration,
};

pub struct StreamQueue<T> {
    inner: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> StreamQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Non-blocking push; returns `false` when the queue is full.
    pub fn try_push(&self, item: T) -> bool {
        let mut queue = self.inner.lock().expect("stream queue poisoned");
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(item);
        drop(queue);
        self.available.notify_one();
        true
    }

    /// Push that evicts the oldest item when full. Never blocks.
    pub fn push_latest(&self, item: T) {
        let mut queue = self.inner.lock().expect("stream queue poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
        drop(queue);
        self.available.notify_one();
    }

    /// Pop the oldest item, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let queue = self.inner.lock().expect("stream queue poisoned");
        let (mut queue, _) = self
            .available
            .wait_timeout_while(queue, timeout, |q| q.is_empty())
            .expect("stream queue poisoned");
        queue.pop_front()
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().expect("stream queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("stream queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().expect("stream queue poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn try_push_rejects_when_full() {
        let queue = StreamQueue::new(2);
        assert!(queue.try_push(1));
        assert!(queue.try_push(2));
        assert!(!queue.try_push(3));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn push_latest_evicts_oldest() {
        let queue = StreamQueue::new(30);
        for value in 0..31 {
            queue.push_latest(value);
        }
        assert_eq!(queue.len(), 30);
        // Oldest (0) evicted; the 30 most recent remain in FIFO order.
        assert_eq!(queue.try_pop(), Some(1));
        let mut last = None;
        while let Some(value) = queue.try_pop() {
            last = Some(value);
        }
        assert_eq!(last, Some(30));
    }

    #[test]
    fn pop_times_out_when_empty() {
        let queue: StreamQueue<u32> = StreamQueue::new(4);
        let start = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn pop_wakes_on_push() {
        let queue = Arc::new(StreamQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push_latest(7u32);
        assert_eq!(consumer.join().unwrap(), Some(7));
    }
}
