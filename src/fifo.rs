//! Bounded FIFO handoff queue.
//!
//! The IPC server's accept thread pushes accepted client sockets here and a
//! pool of worker threads pops them. Producers never block: when the queue is
//! full the item is handed back so the producer can drop it.

use std::collections::VecDeque;

use parking_lot::Condvar;
use parking_lot::Mutex;

/// A bounded multi-producer multi-consumer queue.
#[derive(Debug)]
pub struct Fifo<T> {
    capacity: usize,
    state: Mutex<FifoState<T>>,
    takers: Condvar,
}

#[derive(Debug)]
struct FifoState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> Fifo<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "fifo capacity must be non-zero");
        Fifo {
            capacity,
            state: Mutex::new(FifoState {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            takers: Condvar::new(),
        }
    }

    /// Enqueue `item`, waking one waiting consumer.
    ///
    /// Hands the item back when the queue is full or already closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed || state.queue.len() >= self.capacity {
            return Err(item);
        }
        state.queue.push_back(item);
        drop(state);
        self.takers.notify_one();
        Ok(())
    }

    /// Dequeue the oldest item, blocking until one arrives.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.takers.wait(&mut state);
        }
    }

    /// Close the queue. Pending items are still delivered; blocked consumers
    /// wake up and observe the close once the queue drains.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.takers.notify_all();
    }

    /// Number of queued items; test hook.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().queue.len()
    }
}
