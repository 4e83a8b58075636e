// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives

use crate::macros::{log_debug, log_error};
use crate::util::Status;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Status observed by the thread waiting on a [`CountdownLatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchStatus {
    /// Some tracked tasks are still running.
    Pending,
    /// All the tracked tasks have finished.
    Released,
}

/// A completion signal: a counter armed with a number of tasks, decremented
/// once by each task when it exits, on which another thread can wait until it
/// reaches zero.
///
/// Tasks decrement the latch by dropping the [`LatchGuard`] obtained from
/// [`guard()`](Self::guard), which also happens when a task unwinds.
///
/// ```
/// # use fanpool::sync::CountdownLatch;
/// # use std::sync::Arc;
/// let latch = Arc::new(CountdownLatch::new(3));
/// for _ in 0..3 {
///     let guard = latch.guard();
///     std::thread::spawn(move || {
///         let _guard = guard;
///         // ... do some work ...
///     });
/// }
/// latch.wait();
/// assert_eq!(latch.count(), 0);
/// ```
pub struct CountdownLatch {
    /// Number of tasks that haven't finished yet.
    remaining: CachePadded<AtomicUsize>,
    /// Number of tasks that finished by unwinding.
    num_panicking: CachePadded<AtomicUsize>,
    /// Status of the waiting thread.
    status: Status<LatchStatus>,
}

impl CountdownLatch {
    /// Creates a latch armed with the given number of tasks. A latch armed
    /// with zero tasks is released immediately.
    pub fn new(count: usize) -> Self {
        Self {
            remaining: CachePadded::new(AtomicUsize::new(count)),
            num_panicking: CachePadded::new(AtomicUsize::new(0)),
            status: Status::new(if count == 0 {
                LatchStatus::Released
            } else {
                LatchStatus::Pending
            }),
        }
    }

    /// Returns the number of tasks that haven't finished yet.
    pub fn count(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Returns the number of tasks that finished by unwinding.
    pub fn num_panicking(&self) -> usize {
        self.num_panicking.load(Ordering::SeqCst)
    }

    /// Returns a guard that decrements this latch exactly once, when dropped.
    ///
    /// Each tracked task must own exactly one guard. Creating more guards than
    /// the latch was armed with makes the extra decrement panic.
    pub fn guard(self: &Arc<Self>) -> LatchGuard {
        LatchGuard {
            latch: self.clone(),
        }
    }

    /// Blocks until all the tracked tasks have finished.
    pub fn wait(&self) {
        let guard = self
            .status
            .wait_while(|status| *status == LatchStatus::Pending);
        assert_eq!(*guard, LatchStatus::Released);
    }

    /// Decrements the counter, releasing the waiters if this was the last
    /// task.
    ///
    /// # Panics
    ///
    /// Panics if the counter is already zero, unless the current thread is
    /// already unwinding, in which case the error is only logged.
    fn count_down(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
        let previous = match previous {
            Ok(previous) => previous,
            Err(_) => {
                log_error!("Countdown latch decremented below zero");
                if std::thread::panicking() {
                    return;
                }
                panic!("Countdown latch decremented below zero");
            }
        };
        log_debug!(
            "Decremented the countdown latch: {} task(s) remaining.",
            previous - 1
        );

        if previous == 1 {
            // We're the last task.
            if let Err(e) = self.status.try_notify_all(LatchStatus::Released) {
                log_error!("Failed to release the countdown latch, the mutex was poisoned: {e:?}");
                if std::thread::panicking() {
                    return;
                }
                panic!("Failed to release the countdown latch, the mutex was poisoned: {e:?}");
            }
        }
    }
}

/// Object whose destructor decrements a [`CountdownLatch`], whether the task
/// owning it finished normally or panicked.
#[must_use = "the latch is decremented as soon as the guard is dropped"]
pub struct LatchGuard {
    latch: Arc<CountdownLatch>,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log_error!("Detected panic in a task tracked by a countdown latch");
            self.latch.num_panicking.fetch_add(1, Ordering::SeqCst);
        }
        self.latch.count_down();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn zero_count_is_released() {
        let latch = CountdownLatch::new(0);
        latch.wait();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn wait_until_all_guards_dropped() {
        const NUM_TASKS: usize = 8;

        let latch = Arc::new(CountdownLatch::new(NUM_TASKS));
        let finished = Arc::new(AtomicUsize::new(0));
        for i in 0..NUM_TASKS {
            let guard = latch.guard();
            let finished = finished.clone();
            std::thread::spawn(move || {
                let _guard = guard;
                std::thread::sleep(Duration::from_millis(5 * i as u64));
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        latch.wait();
        assert_eq!(finished.load(Ordering::SeqCst), NUM_TASKS);
        assert_eq!(latch.count(), 0);
        assert_eq!(latch.num_panicking(), 0);
    }

    #[test]
    fn wait_blocks_while_pending() {
        let latch = Arc::new(CountdownLatch::new(1));
        let released = Arc::new(AtomicBool::new(false));
        let waiter = std::thread::spawn({
            let latch = latch.clone();
            let released = released.clone();
            move || {
                latch.wait();
                released.store(true, Ordering::SeqCst);
            }
        });

        let guard = latch.guard();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::SeqCst));

        drop(guard);
        waiter.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_task_still_counts_down() {
        let latch = Arc::new(CountdownLatch::new(2));

        let ok = std::thread::spawn({
            let guard = latch.guard();
            move || {
                let _guard = guard;
            }
        });
        let panicking = std::thread::spawn({
            let guard = latch.guard();
            move || {
                let _guard = guard;
                panic!("task failure");
            }
        });

        latch.wait();
        assert!(ok.join().is_ok());
        assert!(panicking.join().is_err());
        assert_eq!(latch.num_panicking(), 1);
    }

    #[test]
    #[should_panic(expected = "Countdown latch decremented below zero")]
    fn extra_guard_panics() {
        let latch = Arc::new(CountdownLatch::new(1));
        drop(latch.guard());
        drop(latch.guard());
    }

    #[test]
    fn extra_guard_while_unwinding_does_not_abort() {
        let latch = Arc::new(CountdownLatch::new(1));
        let task = std::thread::spawn({
            let first = latch.guard();
            let second = latch.guard();
            move || {
                let _first = first;
                let _second = second;
                panic!("task failure");
            }
        });

        // The second decrement is only logged: the thread unwinds normally
        // instead of aborting the process.
        assert!(task.join().is_err());
        latch.wait();
        assert_eq!(latch.count(), 0);
        assert_eq!(latch.num_panicking(), 2);
    }
}
