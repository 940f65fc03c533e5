//! # Bounded Stage Queues
//!
//! Fixed-capacity hand-off between pipeline threads. A full queue blocks its producer,
//! which is how backpressure travels from a slow stage back to frame admission; nothing
//! in the pipeline ever buffers without bound.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  push (blocks when full)  ┌────────────────┐  pop  ┌──────────┐
//! │ producer │──────────────────────────▶│ N-slot channel │──────▶│ consumer │
//! └──────────┘                           └────────────────┘       └──────────┘
//!                                               │
//!                                       QueueGauge (depth, high water)
//! ```
//!
//! Dropping every receiver wakes blocked producers with a disconnect, so a failing stage
//! unwinds its upstream neighbours instead of leaving them parked.

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Depth accounting shared by both ends of a queue.
#[derive(Debug)]
pub struct QueueGauge {
    name: &'static str,
    capacity: usize,
    high_water: AtomicUsize,
    pushed: AtomicUsize,
}

/// Point-in-time view of a [`QueueGauge`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub name: &'static str,
    pub capacity: usize,
    pub high_water: usize,
    pub pushed: usize,
}

impl QueueGauge {
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            name: self.name,
            capacity: self.capacity,
            high_water: self.high_water.load(Ordering::Relaxed),
            pushed: self.pushed.load(Ordering::Relaxed),
        }
    }

    fn observe(&self, depth: usize) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.high_water.fetch_max(depth, Ordering::Relaxed);
    }
}

/// Producer end of a stage queue.
pub struct QueueSender<T> {
    tx: Sender<T>,
    gauge: Arc<QueueGauge>,
}

/// Consumer end of a stage queue.
pub struct QueueReceiver<T> {
    rx: Receiver<T>,
    gauge: Arc<QueueGauge>,
}

/// Outcome of a push that did not enqueue its item.
#[derive(Debug)]
pub enum PushError<T> {
    /// The queue stayed full for the whole timeout
    Timeout(T),
    /// Every consumer is gone
    Disconnected(T),
}

/// Creates a queue holding at most `capacity` items.
pub fn stage_queue<T>(name: &'static str, capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let gauge = Arc::new(QueueGauge {
        name,
        capacity,
        high_water: AtomicUsize::new(0),
        pushed: AtomicUsize::new(0),
    });
    (
        QueueSender {
            tx,
            gauge: Arc::clone(&gauge),
        },
        QueueReceiver { rx, gauge },
    )
}

impl<T> QueueSender<T> {
    /// Blocks while the queue is full. Returns the item if every consumer is gone.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.tx.send(item).map_err(|e| e.into_inner())?;
        self.gauge.observe(self.tx.len());
        Ok(())
    }

    /// Like [`QueueSender::push`] but gives up after `timeout`.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        match self.tx.send_timeout(item, timeout) {
            Ok(()) => {
                self.gauge.observe(self.tx.len());
                Ok(())
            }
            Err(SendTimeoutError::Timeout(item)) => Err(PushError::Timeout(item)),
            Err(SendTimeoutError::Disconnected(item)) => Err(PushError::Disconnected(item)),
        }
    }

    pub fn gauge(&self) -> Arc<QueueGauge> {
        Arc::clone(&self.gauge)
    }
}

impl<T> QueueReceiver<T> {
    /// Blocks for the next item; `None` once the queue is empty and every producer is gone.
    pub fn pop(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn gauge(&self) -> Arc<QueueGauge> {
        Arc::clone(&self.gauge)
    }
}

impl<T> Iterator for QueueReceiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_blocks_until_consumer_pops() {
        let (tx, rx) = stage_queue::<u32>("test", 2);
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        assert!(matches!(
            tx.push_timeout(3, Duration::from_millis(10)),
            Err(PushError::Timeout(3))
        ));
        assert_eq!(rx.pop(), Some(1));
        tx.push_timeout(3, Duration::from_millis(10)).unwrap();
        let snap = tx.gauge().snapshot();
        assert_eq!(snap.high_water, 2);
        assert_eq!(snap.capacity, 2);
        assert_eq!(snap.pushed, 3);
    }

    #[test]
    fn test_dropping_receiver_disconnects_producer() {
        let (tx, rx) = stage_queue::<u32>("test", 1);
        tx.push(1).unwrap();
        let producer = std::thread::spawn(move || tx.push(2));
        std::thread::sleep(Duration::from_millis(20));
        drop(rx);
        assert_eq!(producer.join().unwrap(), Err(2));
    }

    #[test]
    fn test_receiver_drains_then_ends() {
        let (tx, rx) = stage_queue::<u32>("test", 4);
        for i in 0..3 {
            tx.push(i).unwrap();
        }
        drop(tx);
        assert_eq!(rx.collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
