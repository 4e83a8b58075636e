// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fan-out/fan-in pipelines: single-producer stages connected by
//! [`bounded()`](crate::queue::bounded) queues, and a merger multiplexing
//! several queues into one.
//!
//! Each stage runs on its own thread and is the sole closer of its output
//! queue. The merger's output is closed by a dedicated closer thread once all
//! its inputs are drained.
//!
//! A stage that panics closes its output early and poisons it, and mergers
//! forward the poison downstream, so that a consumer can tell a truncated
//! stream from a complete one with [`Receiver::is_poisoned()`] once the
//! stream is exhausted.

use crate::macros::{log_debug, log_error, log_warn};
use crate::queue::{bounded, Receiver, Sender};
use crate::sync::CountdownLatch;
use std::cell::Cell;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Arc;

/// Capacity of the queues created by the stage functions. A single slot makes
/// each stage hand over items one at a time.
pub const DEFAULT_CAPACITY: NonZeroUsize = NonZeroUsize::MIN;

/// Sends each value in order on a new queue from a dedicated thread, then
/// closes the queue.
///
/// ```
/// # use fanpool::pipeline::generate;
/// let numbers = generate([1, 2, 3]);
/// assert_eq!(numbers.iter().collect::<Vec<_>>(), [1, 2, 3]);
/// ```
pub fn generate<I>(values: I) -> Receiver<I::Item>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    generate_with_capacity(values, DEFAULT_CAPACITY)
}

/// Same as [`generate()`], with the given output queue capacity.
pub fn generate_with_capacity<I>(values: I, capacity: NonZeroUsize) -> Receiver<I::Item>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    let (tx, rx) = bounded(capacity);
    let values = values.into_iter();
    std::thread::spawn(move || {
        let output = StageOutput::new("generate", tx);
        let mut _count = 0usize;
        for value in values {
            output.send(value);
            _count += 1;
        }
        log_debug!("[generate] Produced {_count} value(s)");
    });
    rx
}

/// Applies `f` to each item received from `input` on a dedicated thread,
/// sending the mapped items in order on a new queue, which is closed once
/// `input` is exhausted.
///
/// The output is poisoned if `f` panics or if `input` was poisoned.
pub fn transform<T, U, F>(input: Receiver<T>, f: F) -> Receiver<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + 'static,
{
    transform_with_capacity(input, f, DEFAULT_CAPACITY)
}

/// Same as [`transform()`], with the given output queue capacity.
pub fn transform_with_capacity<T, U, F>(
    input: Receiver<T>,
    f: F,
    capacity: NonZeroUsize,
) -> Receiver<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + 'static,
{
    let (tx, rx) = bounded(capacity);
    std::thread::spawn(move || {
        let output = StageOutput::new("transform", tx);
        for item in &input {
            output.send(f(item));
        }
        if input.is_poisoned() {
            output.poison();
        }
    });
    rx
}

/// Squares each number received from `input`, wrapping around on overflow.
///
/// ```
/// # use fanpool::pipeline::{generate, square};
/// let squares = square(generate([1, 2, 3]));
/// assert_eq!(squares.iter().collect::<Vec<_>>(), [1, 4, 9]);
/// ```
pub fn square(input: Receiver<i64>) -> Receiver<i64> {
    transform(input, |n: i64| n.wrapping_mul(n))
}

/// Forwards the items of all the inputs onto a single new queue, which is
/// closed once every input is exhausted.
///
/// Items of a given input keep their relative order, but the interleaving of
/// items from different inputs is unspecified. Merging no inputs yields a
/// queue that is already closed. The output is poisoned if any input was.
///
/// ```
/// # use fanpool::pipeline::{generate, merge, square};
/// let merged = merge([square(generate([1, 2, 3])), generate([10, 20])]);
/// let mut items = merged.iter().collect::<Vec<_>>();
/// items.sort_unstable();
/// assert_eq!(items, [1, 4, 9, 10, 20]);
/// ```
pub fn merge<T, I>(inputs: I) -> Receiver<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Receiver<T>>,
{
    merge_with_capacity(inputs, DEFAULT_CAPACITY)
}

/// Same as [`merge()`], with the given output queue capacity.
pub fn merge_with_capacity<T, I>(inputs: I, capacity: NonZeroUsize) -> Receiver<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Receiver<T>>,
{
    let inputs = inputs.into_iter().collect::<Vec<_>>();
    let (tx, rx) = bounded(capacity);

    // Armed before spawning any forwarder.
    let latch = Arc::new(CountdownLatch::new(inputs.len()));
    for (_id, input) in inputs.into_iter().enumerate() {
        let guard = latch.guard();
        let tx = tx.clone();
        std::thread::spawn(move || {
            let _guard = guard;
            let mut _count = 0usize;
            for item in &input {
                if let Err(e) = tx.send(item) {
                    log_error!("[forward #{_id}] Failed to forward an item: {e}");
                    panic!("Failed to forward an item: {e}");
                }
                _count += 1;
            }
            if input.is_poisoned() {
                log_warn!("[forward #{_id}] Input was poisoned after {_count} item(s)");
                tx.poison();
            }
            log_debug!("[forward #{_id}] Input exhausted after {_count} item(s)");
        });
    }

    std::thread::spawn(move || {
        latch.wait();
        log_debug!("[closer] All inputs drained, closing the merged queue");
        if let Err(e) = tx.close() {
            log_error!("[closer] Failed to close the merged queue: {e}");
            panic!("Failed to close the merged queue: {e}");
        }
    });
    rx
}

/// Strategy to distribute the input of a pipeline among its parallel stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanOutStrategy {
    /// A single generator feeds all the stages, which compete for its items.
    Shared,
    /// The input is split into contiguous chunks of near-equal length, each
    /// fed to one stage by its own generator.
    Partitioned,
}

/// A builder for fan-out/fan-in pipelines.
#[derive(Clone, Copy, Debug)]
pub struct PipelineBuilder {
    /// Number of parallel transform stages.
    pub num_stages: NonZeroUsize,
    /// Strategy to distribute the input among the stages.
    pub fan_out: FanOutStrategy,
    /// Capacity of every queue in the pipeline.
    pub capacity: NonZeroUsize,
}

impl PipelineBuilder {
    /// Fans the given values out to [`num_stages`](Self::num_stages) parallel
    /// stages applying `f`, and fans their outputs back into the returned
    /// queue.
    ///
    /// Each value is mapped exactly once, but the output order is unspecified
    /// unless there is a single stage.
    ///
    /// ```
    /// # use fanpool::pipeline::{FanOutStrategy, PipelineBuilder};
    /// # use std::num::NonZeroUsize;
    /// let pipeline = PipelineBuilder {
    ///     num_stages: NonZeroUsize::new(4).unwrap(),
    ///     fan_out: FanOutStrategy::Partitioned,
    ///     capacity: NonZeroUsize::new(8).unwrap(),
    /// };
    /// let output = pipeline.build(1..=100u64, |n: u64| n + 1);
    /// assert_eq!(output.iter().sum::<u64>(), (2..=101u64).sum::<u64>());
    /// ```
    pub fn build<T, U, I, F>(&self, values: I, f: F) -> Receiver<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let num_stages = self.num_stages.get();
        let f = Arc::new(f);

        let stage_inputs: Vec<Receiver<T>> = match self.fan_out {
            FanOutStrategy::Shared => {
                let source = generate_with_capacity(values, self.capacity);
                vec![source; num_stages]
            }
            FanOutStrategy::Partitioned => {
                partition(values.into_iter().collect(), num_stages)
                    .into_iter()
                    .map(|chunk| generate_with_capacity(chunk, self.capacity))
                    .collect()
            }
        };
        log_debug!(
            "[main thread] Fanning out to {num_stages} stage(s) with {:?} strategy",
            self.fan_out
        );

        let stage_outputs = stage_inputs
            .into_iter()
            .map(|input| {
                let f = f.clone();
                transform_with_capacity(input, move |item| f(item), self.capacity)
            })
            .collect::<Vec<_>>();
        merge_with_capacity(stage_outputs, self.capacity)
    }
}

/// Generates the given numbers, fans them out to `stage_count` squaring stages
/// competing for them, and merges the squares into the returned queue.
/// Squares wrap around on overflow.
///
/// ```
/// # use fanpool::pipeline::build_pipeline;
/// # use std::num::NonZeroUsize;
/// let squares = build_pipeline(vec![1, 2, 3], NonZeroUsize::new(2).unwrap());
/// let mut squares = squares.iter().collect::<Vec<_>>();
/// squares.sort_unstable();
/// assert_eq!(squares, [1, 4, 9]);
/// ```
pub fn build_pipeline(numbers: Vec<i64>, stage_count: NonZeroUsize) -> Receiver<i64> {
    PipelineBuilder {
        num_stages: stage_count,
        fan_out: FanOutStrategy::Shared,
        capacity: DEFAULT_CAPACITY,
    }
    .build(numbers, |n: i64| n.wrapping_mul(n))
}

/// Splits the values into `num_parts` contiguous chunks, as given by
/// [`chunk_bounds()`].
fn partition<T>(values: Vec<T>, num_parts: usize) -> Vec<Vec<T>> {
    let len = values.len();
    let mut values = values.into_iter();
    (0..num_parts)
        .map(|i| values.by_ref().take(chunk_bounds(i, len, num_parts).len()).collect())
        .collect()
}

/// Bounds of chunk `i` when splitting `len` items into `num_parts` chunks.
/// The first `len % num_parts` chunks get one extra item.
///
/// Requires `i < num_parts`.
fn chunk_bounds(i: usize, len: usize, num_parts: usize) -> Range<usize> {
    let base = len / num_parts;
    let remainder = len % num_parts;
    let start = base * i + i.min(remainder);
    let end = start + base + usize::from(i < remainder);
    start..end
}

/// Output end of a single-producer stage, closed when dropped so that
/// consumers observe exhaustion even if the stage panics. A panicking stage
/// also poisons its output.
struct StageOutput<T> {
    name: &'static str,
    tx: Sender<T>,
    sent: Cell<usize>,
}

impl<T> StageOutput<T> {
    fn new(name: &'static str, tx: Sender<T>) -> Self {
        Self {
            name,
            tx,
            sent: Cell::new(0),
        }
    }

    fn send(&self, item: T) {
        if let Err(e) = self.tx.send(item) {
            log_error!("[{}] Failed to send downstream: {e}", self.name);
            panic!("[{}] Failed to send downstream: {e}", self.name);
        }
        self.sent.set(self.sent.get() + 1);
    }

    fn poison(&self) {
        log_warn!(
            "[{}] Input was poisoned after {} item(s)",
            self.name,
            self.sent.get()
        );
        self.tx.poison();
    }
}

impl<T> Drop for StageOutput<T> {
    fn drop(&mut self) {
        let panicking = std::thread::panicking();
        if panicking {
            log_error!(
                "[{}] Stage panicked after sending {} item(s), poisoning its output",
                self.name,
                self.sent.get()
            );
            self.tx.poison();
        }
        match self.tx.close() {
            Ok(()) => log_debug!("[{}] Closed output", self.name),
            Err(e) => {
                log_error!("[{}] Failed to close output: {e}", self.name);
                if !panicking {
                    panic!("[{}] Failed to close output: {e}", self.name);
                }
            }
        }
    }
}
