// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded multi-producer, multi-consumer queue used for every handoff between pipeline threads.

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// What to do when pushing into a full queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Wait until there is room.
    #[default]
    Block,
    /// Evict the oldest item to make room for the new one.
    DropOldest,
    /// Reject the new item.
    DropNewest,
}

/// Result of a push into a [`BoundedQueue`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// The item has been queued and nothing was dropped.
    Queued,
    /// The queue was full: the returned item has been dropped from the queue, and is handed back
    /// so the caller can recycle it. Depending on the policy, this is the oldest queued item or
    /// the one that was pushed.
    Dropped(T),
    /// The queue is closed, the pushed item is returned.
    Closed(T),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("timed out waiting for an item")]
    Timeout,
    #[error("queue is closed and empty")]
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> BoundedQueue<T> {
    /// Create a new queue. `capacity` is clamped to at least 1.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Push `item` according to the overflow policy of the queue.
    pub fn push(&self, item: T) -> PushOutcome<T> {
        let mut state = self.state.lock();

        if state.closed {
            return PushOutcome::Closed(item);
        }

        let mut outcome = PushOutcome::Queued;
        if state.items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Block => {
                    while state.items.len() >= self.capacity && !state.closed {
                        self.not_full.wait(&mut state);
                    }
                    if state.closed {
                        return PushOutcome::Closed(item);
                    }
                }
                OverflowPolicy::DropOldest => {
                    if let Some(oldest) = state.items.pop_front() {
                        outcome = PushOutcome::Dropped(oldest);
                    }
                }
                OverflowPolicy::DropNewest => return PushOutcome::Dropped(item),
            }
        }

        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();

        outcome
    }

    /// Pop the oldest item, waiting for up to `timeout` (or forever if `None`) for one to
    /// become available.
    ///
    /// Items still queued when the queue is closed can still be popped.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<T, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            match deadline {
                None => self.not_empty.wait(&mut state),
                Some(deadline) => {
                    if self.not_empty.wait_until(&mut state, deadline).timed_out()
                        && state.items.is_empty()
                    {
                        return Err(if state.closed {
                            QueueError::Closed
                        } else {
                            QueueError::Timeout
                        });
                    }
                }
            }
        }
    }

    /// Pop the oldest item if there is one, without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Remove and return all the queued items.
    pub fn drain(&self) -> Vec<T> {
        let items = self.state.lock().items.drain(..).collect();
        self.not_full.notify_all();
        items
    }

    /// Close the queue: pushes are rejected and blocked callers are woken up.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn drop_oldest_evicts_front() {
        let queue = BoundedQueue::new(2, OverflowPolicy::DropOldest);
        assert_eq!(queue.push(1), PushOutcome::Queued);
        assert_eq!(queue.push(2), PushOutcome::Queued);
        assert_eq!(queue.push(3), PushOutcome::Dropped(1));
        assert_eq!(queue.drain(), vec![2, 3]);
    }

    #[test]
    fn drop_newest_rejects_item() {
        let queue = BoundedQueue::new(1, OverflowPolicy::DropNewest);
        assert_eq!(queue.push(1), PushOutcome::Queued);
        assert_eq!(queue.push(2), PushOutcome::Dropped(2));
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn pop_timeout() {
        let queue = BoundedQueue::<u32>::new(1, OverflowPolicy::Block);
        assert_eq!(
            queue.pop(Some(Duration::from_millis(10))),
            Err(QueueError::Timeout)
        );
    }

    #[test]
    fn close_wakes_consumers_after_draining() {
        let queue = Arc::new(BoundedQueue::new(4, OverflowPolicy::Block));
        queue.push(7);

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut items = Vec::new();
                while let Ok(item) = queue.pop(None) {
                    items.push(item);
                }
                items
            })
        };

        queue.close();
        assert_eq!(queue.push(8), PushOutcome::Closed(8));
        assert_eq!(consumer.join().unwrap(), vec![7]);
    }

    #[test]
    fn blocking_producer_waits_for_room() {
        let queue = Arc::new(BoundedQueue::new(1, OverflowPolicy::Block));
        queue.push(0);

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(1))
        };

        assert_eq!(queue.pop(None), Ok(0));
        assert_eq!(producer.join().unwrap(), PushOutcome::Queued);
        assert_eq!(queue.pop(None), Ok(1));
    }

    #[test]
    fn close_unblocks_producer() {
        let queue = Arc::new(BoundedQueue::new(1, OverflowPolicy::Block));
        queue.push(0);

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(1))
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(producer.join().unwrap(), PushOutcome::Closed(1));
    }
}
