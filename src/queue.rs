// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A bounded, closeable, multi-producer multi-consumer FIFO queue.
//!
//! Unlike channels that close implicitly when all senders are dropped, a
//! [`bounded()`] queue is closed explicitly by its single authorized closer via
//! [`Sender::close()`]. Items already buffered remain receivable after closing,
//! and [`Receiver::recv()`] returns [`None`] once the queue is closed and
//! drained.

use crate::error::{ClosedQueueError, TryRecvError};
use crate::macros::log_debug;
use crate::util::Status;
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Creates a queue that buffers at most `capacity` items, returning its send
/// and receive ends.
///
/// Both ends can be cloned: cloned senders feed the same queue (fan-in), and
/// cloned receivers compete for the same items (fan-out).
///
/// ```
/// # use fanpool::queue::bounded;
/// # use std::num::NonZeroUsize;
/// let (tx, rx) = bounded(NonZeroUsize::new(2).unwrap());
/// tx.send(1).unwrap();
/// tx.send(2).unwrap();
/// tx.close().unwrap();
///
/// assert!(tx.send(3).is_err());
/// assert_eq!(rx.iter().collect::<Vec<_>>(), [1, 2]);
/// assert_eq!(rx.recv(), None);
/// ```
pub fn bounded<T>(capacity: NonZeroUsize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        capacity: capacity.get(),
        state: Status::new(State {
            items: VecDeque::with_capacity(capacity.get()),
            closed: false,
            poisoned: false,
        }),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

/// State shared between all the ends of a queue.
struct Shared<T> {
    /// Maximum number of buffered items.
    capacity: usize,
    /// Buffered items and lifecycle, guarded by a single mutex.
    state: Status<State<T>>,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    /// Set when a producer failed before sending everything it meant to.
    poisoned: bool,
}

impl<T> Shared<T> {
    fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }
}

/// The sending end of a [`bounded()`] queue.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Sender<T> {
    /// Sends an item, blocking while the queue is full.
    ///
    /// Fails with [`ClosedQueueError::Send`] if the queue is closed, including
    /// when it gets closed while this call is blocked. The item is dropped in
    /// that case.
    pub fn send(&self, item: T) -> Result<(), ClosedQueueError> {
        let capacity = self.shared.capacity;
        let mut state = self
            .shared
            .state
            .wait_while(|state| !state.closed && state.items.len() >= capacity);
        if state.closed {
            return Err(ClosedQueueError::Send);
        }
        state.items.push_back(item);
        drop(state);

        self.shared.state.wake_all();
        Ok(())
    }

    /// Closes the queue.
    ///
    /// Blocked senders fail, and blocked receivers drain the remaining items
    /// before observing exhaustion. Fails with [`ClosedQueueError::Close`] if
    /// the queue was already closed.
    pub fn close(&self) -> Result<(), ClosedQueueError> {
        let pending = self.shared.state.update(|state| {
            if state.closed {
                Err(ClosedQueueError::Close)
            } else {
                state.closed = true;
                Ok(state.items.len())
            }
        })?;
        log_debug!("Closed queue with {pending} pending item(s)");
        Ok(())
    }

    /// Marks the queue as poisoned: some items that a producer meant to send
    /// will never arrive. This doesn't close the queue, and receivers can
    /// still drain what was sent.
    pub fn poison(&self) {
        self.shared.state.update(|state| state.poisoned = true);
    }

    /// Returns the maximum number of items that the queue buffers.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Returns the number of currently buffered items.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Returns whether the queue currently buffers no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether the queue was closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Returns whether the queue was poisoned by a failing producer.
    pub fn is_poisoned(&self) -> bool {
        self.shared.is_poisoned()
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

/// The receiving end of a [`bounded()`] queue.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Receiver<T> {
    /// Receives the next item, blocking while the queue is empty and open.
    ///
    /// Returns [`None`] once the queue is closed and all its items were
    /// received.
    pub fn recv(&self) -> Option<T> {
        let mut state = self
            .shared
            .state
            .wait_while(|state| !state.closed && state.items.is_empty());
        let item = state.items.pop_front();
        drop(state);

        if item.is_some() {
            // Room was made for a blocked sender.
            self.shared.state.wake_all();
        }
        item
    }

    /// Receives the next item without blocking.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut state = self.shared.state.lock();
        match state.items.pop_front() {
            Some(item) => {
                drop(state);
                self.shared.state.wake_all();
                Ok(item)
            }
            None if state.closed => Err(TryRecvError::Exhausted),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Returns a blocking iterator over the received items, which ends once
    /// the queue is closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { receiver: self }
    }

    /// Returns the maximum number of items that the queue buffers.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Returns the number of currently buffered items.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Returns whether the queue currently buffers no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether the queue was closed. Buffered items may still be
    /// receivable.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Returns whether a producer failed before sending all its items.
    ///
    /// Checking this after [`recv()`](Self::recv) returned [`None`] tells a
    /// truncated stream apart from a complete one.
    pub fn is_poisoned(&self) -> bool {
        self.shared.is_poisoned()
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

/// Blocking iterator returned by [`Receiver::iter()`].
pub struct Iter<'a, T> {
    receiver: &'a Receiver<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv()
    }
}

/// Owning blocking iterator returned by [`Receiver::into_iter()`].
pub struct IntoIter<T> {
    receiver: Receiver<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv()
    }
}

impl<T> IntoIterator for Receiver<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { receiver: self }
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::try_from(n).unwrap()
    }

    #[test]
    fn fifo_single_producer() {
        let (tx, rx) = bounded(capacity(4));
        let producer = std::thread::spawn(move || {
            for i in 0..1_000 {
                tx.send(i).unwrap();
            }
            tx.close().unwrap();
        });

        let received = rx.iter().collect::<Vec<_>>();
        producer.join().unwrap();
        assert_eq!(received, (0..1_000).collect::<Vec<_>>());
    }

    #[test]
    fn send_after_close_fails() {
        let (tx, rx) = bounded::<u32>(capacity(4));
        tx.close().unwrap();
        assert_eq!(tx.send(1), Err(ClosedQueueError::Send));
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn send_after_close_fails_with_buffered_items() {
        let (tx, rx) = bounded(capacity(4));
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.close().unwrap();

        assert_eq!(tx.send(3), Err(ClosedQueueError::Send));
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(tx.send(4), Err(ClosedQueueError::Send));
        assert_eq!(rx.recv(), Some(2));
        assert_eq!(rx.recv(), None);
        assert_eq!(tx.send(5), Err(ClosedQueueError::Send));
    }

    #[test]
    fn close_twice_fails() {
        let (tx, _rx) = bounded::<u32>(capacity(1));
        assert_eq!(tx.close(), Ok(()));
        assert_eq!(tx.close(), Err(ClosedQueueError::Close));
        assert_eq!(tx.clone().close(), Err(ClosedQueueError::Close));
    }

    #[test]
    fn try_recv_states() {
        let (tx, rx) = bounded(capacity(2));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        tx.send("a").unwrap();
        tx.close().unwrap();
        assert!(rx.is_closed());
        assert_eq!(rx.try_recv(), Ok("a"));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Exhausted));
    }

    #[test]
    fn poison_is_visible_after_draining() {
        let (tx, rx) = bounded(capacity(2));
        tx.send(1).unwrap();
        assert!(!rx.is_poisoned());

        tx.poison();
        tx.close().unwrap();
        assert!(rx.is_poisoned());
        assert_eq!(rx.iter().collect::<Vec<_>>(), [1]);
        assert!(rx.is_poisoned());
    }

    #[test]
    fn send_blocks_while_full() {
        let (tx, rx) = bounded(capacity(1));
        tx.send(1).unwrap();

        let sent = Arc::new(AtomicBool::new(false));
        let producer = std::thread::spawn({
            let tx = tx.clone();
            let sent = sent.clone();
            move || {
                tx.send(2).unwrap();
                sent.store(true, Ordering::SeqCst);
            }
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!sent.load(Ordering::SeqCst));
        assert_eq!(tx.len(), 1);

        assert_eq!(rx.recv(), Some(1));
        producer.join().unwrap();
        assert!(sent.load(Ordering::SeqCst));
        assert_eq!(rx.recv(), Some(2));
    }

    #[test]
    fn close_wakes_blocked_sender() {
        let (tx, rx) = bounded(capacity(1));
        tx.send(1).unwrap();

        let producer = std::thread::spawn({
            let tx = tx.clone();
            move || tx.send(2)
        });

        std::thread::sleep(Duration::from_millis(50));
        tx.close().unwrap();
        assert_eq!(producer.join().unwrap(), Err(ClosedQueueError::Send));
        assert_eq!(rx.iter().collect::<Vec<_>>(), [1]);
    }

    #[test]
    fn close_wakes_blocked_receivers() {
        let (tx, rx) = bounded::<u32>(capacity(1));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let rx = rx.clone();
                std::thread::spawn(move || rx.recv())
            })
            .collect();

        std::thread::sleep(Duration::from_millis(50));
        tx.close().unwrap();
        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
    }

    #[test]
    fn multiple_producers_keep_their_own_order() {
        const NUM_PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 500;

        let (tx, rx) = bounded(capacity(8));
        let producers: Vec<_> = (0..NUM_PRODUCERS)
            .map(|p| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        tx.send((p, i)).unwrap();
                    }
                })
            })
            .collect();

        let closer = std::thread::spawn(move || {
            for producer in producers {
                producer.join().unwrap();
            }
            tx.close().unwrap();
        });

        let mut next = [0; NUM_PRODUCERS as usize];
        let mut count = 0;
        for (p, i) in &rx {
            assert_eq!(next[p as usize], i);
            next[p as usize] += 1;
            count += 1;
        }
        closer.join().unwrap();
        assert_eq!(count, NUM_PRODUCERS * PER_PRODUCER);
    }

    #[test]
    fn competing_receivers_take_each_item_once() {
        let (tx, rx) = bounded(capacity(16));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let rx = rx.clone();
                std::thread::spawn(move || rx.into_iter().collect::<Vec<u32>>())
            })
            .collect();

        for i in 0..1_000 {
            tx.send(i).unwrap();
        }
        tx.close().unwrap();

        let mut all = consumers
            .into_iter()
            .flat_map(|consumer| consumer.join().unwrap())
            .collect::<Vec<_>>();
        all.sort_unstable();
        assert_eq!(all, (0..1_000).collect::<Vec<_>>());
    }
}
