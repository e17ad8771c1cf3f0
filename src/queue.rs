//! Thread-safe queue carrying readings from the scan loop to consumers.

use crate::reading::Reading;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Returned by [`ReadingQueue::pop_timeout`] when nothing arrived in time.
///
/// This is an expected outcome, not a failure.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("timed out waiting for a reading")]
pub struct TimedOut;

/// Unbounded FIFO of [`Reading`]s guarded by a mutex and a condition variable.
///
/// `push` never blocks the producer beyond the lock. Several consumers may pop
/// from the same queue; each reading is delivered to exactly one of them.
#[derive(Debug, Default)]
pub struct ReadingQueue {
    items: Mutex<VecDeque<Reading>>,
    available: Condvar,
}

impl ReadingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reading: Reading) {
        let mut items = self.lock();
        items.push_back(reading);
        log::trace!("queued reading, depth {}", items.len());
        drop(items);
        self.available.notify_one();
    }

    /// Block until a reading is available.
    pub fn pop(&self) -> Reading {
        let mut items = self.lock();
        loop {
            if let Some(reading) = items.pop_front() {
                return reading;
            }
            items = self
                .available
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout` waiting for a reading.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Reading, TimedOut> {
        let items = self.lock();
        let (mut items, _) = self
            .available
            .wait_timeout_while(items, timeout, |items| items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        items.pop_front().ok_or(TimedOut)
    }

    /// Remove the oldest queued sentinel. Returns whether there was one.
    pub fn remove_sentinel(&self) -> bool {
        let mut items = self.lock();
        match items.iter().position(|reading| reading.is_sentinel()) {
            Some(index) => {
                items.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Reading>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::reading;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = ReadingQueue::new();
        queue.push(reading("aa:aa:aa:aa:aa:01", 1.0));
        queue.push(reading("aa:aa:aa:aa:aa:02", 2.0));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().device_address, "aa:aa:aa:aa:aa:01");
        assert_eq!(queue.pop().device_address, "aa:aa:aa:aa:aa:02");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_timeout_on_empty_queue_waits_for_timeout() {
        let queue = ReadingQueue::new();
        let started = Instant::now();

        assert_eq!(queue.pop_timeout(Duration::from_millis(50)), Err(TimedOut));

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
    }

    #[test]
    fn test_pop_timeout_returns_available_item_immediately() {
        let queue = ReadingQueue::new();
        queue.push(reading("aa:bb:cc:dd:ee:ff", 20.0));
        let started = Instant::now();

        let popped = queue.pop_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(popped.device_address, "aa:bb:cc:dd:ee:ff");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_blocking_pop_wakes_on_push_from_other_thread() {
        let queue = Arc::new(ReadingQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(reading("aa:bb:cc:dd:ee:ff", 20.0));

        let popped = consumer.join().unwrap();
        assert_eq!(popped.temperature, 20.0);
    }

    #[test]
    fn test_pop_timeout_wakes_on_sentinel() {
        let queue = Arc::new(ReadingQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_timeout(Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(Reading::sentinel());

        assert!(consumer.join().unwrap().unwrap().is_sentinel());
    }

    #[test]
    fn test_remove_sentinel_keeps_readings() {
        let queue = ReadingQueue::new();
        assert!(!queue.remove_sentinel());

        queue.push(reading("aa:aa:aa:aa:aa:01", 1.0));
        queue.push(Reading::sentinel());
        queue.push(reading("aa:aa:aa:aa:aa:02", 2.0));

        assert!(queue.remove_sentinel());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().device_address, "aa:aa:aa:aa:aa:01");
        assert_eq!(queue.pop().device_address, "aa:aa:aa:aa:aa:02");
    }

    #[test]
    fn test_each_item_is_delivered_once_to_competing_consumers() {
        let queue = Arc::new(ReadingQueue::new());
        for i in 0..100u8 {
            queue.push(reading(&format!("aa:aa:aa:aa:aa:{i:02x}"), f64::from(i)));
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Ok(r) = queue.pop_timeout(Duration::from_millis(20)) {
                        seen.push(r.device_address);
                    }
                    seen
                })
            })
            .collect();

        let mut all: Vec<String> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100);
    }
}
