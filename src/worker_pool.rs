// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-size pool of worker threads draining a job queue into a result
//! queue.

use crate::error::ProcessingError;
#[cfg(feature = "log_parallelism")]
use crate::macros::log_info;
use crate::macros::{log_debug, log_error, log_warn};
use crate::queue::{bounded, Receiver, Sender};
use crate::sync::{CountdownLatch, LatchGuard};
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A unit of work: an identifier, unique within a submission batch, and a
/// payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    id: u64,
    data: String,
}

impl Job {
    /// Creates a job with the given identifier and payload.
    pub fn new(id: u64, data: impl Into<String>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Returns the identifier of this job.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the payload of this job.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Consumes this job, returning its payload.
    pub fn into_data(self) -> String {
        self.data
    }
}

/// The outcome of processing a [`Job`].
///
/// Exactly one result is produced per processed job. A failed result still
/// carries the identifier of its job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobResult {
    job_id: u64,
    value: String,
    error: Option<ProcessingError>,
}

impl JobResult {
    /// Creates a successful result for the given job.
    pub fn ok(job_id: u64, value: impl Into<String>) -> Self {
        Self {
            job_id,
            value: value.into(),
            error: None,
        }
    }

    /// Creates a failed result for the given job.
    pub fn failed(job_id: u64, error: ProcessingError) -> Self {
        Self {
            job_id,
            value: String::new(),
            error: Some(error),
        }
    }

    /// Returns the identifier of the job that this result originates from.
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Returns the value computed for the job. Empty for failed results.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns the processing error, if any.
    pub fn error(&self) -> Option<&ProcessingError> {
        self.error.as_ref()
    }

    /// Returns whether processing the job succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Converts this result into a standard [`Result`].
    pub fn into_result(self) -> Result<String, ProcessingError> {
        match self.error {
            None => Ok(self.value),
            Some(e) => Err(e),
        }
    }
}

/// Reference processing function, which describes the job's payload.
///
/// ```
/// # use fanpool::{describe_job, Job};
/// let result = describe_job(Job::new(1, "task-1"));
/// assert_eq!(result.job_id(), 1);
/// assert_eq!(result.value(), "Processed: task-1");
/// assert!(result.is_ok());
/// ```
pub fn describe_job(job: Job) -> JobResult {
    JobResult::ok(job.id, format!("Processed: {}", job.data))
}

/// Wraps a processing function so that it sleeps for the given duration
/// before processing each job, simulating latency.
pub fn with_latency<F>(latency: Duration, process: F) -> impl Fn(Job) -> JobResult + Send + Sync
where
    F: Fn(Job) -> JobResult + Send + Sync,
{
    move |job| {
        std::thread::sleep(latency);
        process(job)
    }
}

/// Number of worker threads to spawn in a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl WorkerCount {
    /// Resolves the number of threads to spawn.
    pub fn count(self) -> NonZeroUsize {
        match self {
            WorkerCount::AvailableParallelism => available_parallelism(),
            WorkerCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for WorkerCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(worker_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(worker_count)?;
        Ok(WorkerCount::Count(count))
    }
}

fn available_parallelism() -> NonZeroUsize {
    match std::thread::available_parallelism() {
        Ok(count) => count,
        Err(_e) => {
            log_warn!("Getting the available parallelism failed, using one worker: {_e}");
            NonZeroUsize::MIN
        }
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), spawning a worker pool will panic.
    Always,
}

/// A builder for [`WorkerPool`].
#[derive(Clone, Copy, Debug)]
pub struct WorkerPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_workers: WorkerCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self {
            num_workers: WorkerCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
    }
}

impl WorkerPoolBuilder {
    /// Spawns the worker threads, which drain the `jobs` queue and send one
    /// result per job to the `results` queue.
    ///
    /// Workers exit once `jobs` is closed and drained. The `results` queue is
    /// then closed by a dedicated closer thread, after all workers have exited;
    /// no other party may close it.
    ///
    /// A panic in `process` is caught and turned into a failed [`JobResult`]
    /// carrying [`ProcessingError::Panicked`].
    ///
    /// ```
    /// # use fanpool::queue::bounded;
    /// # use fanpool::{describe_job, CpuPinningPolicy, Job, WorkerCount, WorkerPoolBuilder};
    /// # use std::num::NonZeroUsize;
    /// let capacity = NonZeroUsize::new(16).unwrap();
    /// let (job_tx, job_rx) = bounded(capacity);
    /// let (result_tx, result_rx) = bounded(capacity);
    ///
    /// let pool = WorkerPoolBuilder {
    ///     num_workers: WorkerCount::try_from(3).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .spawn(job_rx, result_tx, describe_job);
    ///
    /// for i in 1..=10 {
    ///     job_tx.send(Job::new(i, format!("task-{i}"))).unwrap();
    /// }
    /// job_tx.close().unwrap();
    ///
    /// let mut ids = result_rx.iter().map(|r| r.job_id()).collect::<Vec<_>>();
    /// ids.sort_unstable();
    /// assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    /// assert_eq!(pool.join().total(), 10);
    /// ```
    pub fn spawn<F>(&self, jobs: Receiver<Job>, results: Sender<JobResult>, process: F) -> WorkerPool
    where
        F: Fn(Job) -> JobResult + Send + Sync + 'static,
    {
        let num_workers: usize = self.num_workers.count().into();
        let cpu_pinning = self.cpu_pinning;

        let cpu_pinning = match cpu_pinning {
            CpuPinningPolicy::IfSupported if !CPU_PINNING_SUPPORTED => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.");
                CpuPinningPolicy::No
            }
            CpuPinningPolicy::Always if !CPU_PINNING_SUPPORTED => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
            policy => policy,
        };

        // The latch is armed before any worker starts, so that the closer can't
        // observe a zero count too early.
        let latch = Arc::new(CountdownLatch::new(num_workers));
        let process = Arc::new(process);
        let num_cpus = available_parallelism().get();

        let workers = (0..num_workers)
            .map(|id| {
                let context = WorkerContext {
                    id,
                    jobs: jobs.clone(),
                    results: results.clone(),
                    process: process.clone(),
                    _guard: latch.guard(),
                };
                WorkerThreadHandle {
                    handle: std::thread::spawn(move || {
                        pin_current_thread(id, id % num_cpus, cpu_pinning);
                        context.run()
                    }),
                }
            })
            .collect();
        log_debug!("[main thread] Spawned {num_workers} workers");

        let closer = std::thread::spawn(move || {
            latch.wait();
            log_debug!("[closer] All workers exited, closing the result queue");
            if let Err(e) = results.close() {
                log_error!("[closer] Failed to close the result queue: {e}");
                panic!("Failed to close the result queue: {e}");
            }
        });

        WorkerPool { workers, closer }
    }
}

/// Whether worker threads can be pinned with `sched_setaffinity()`.
const CPU_PINNING_SUPPORTED: bool = cfg!(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
));

/// Pins the calling worker thread to the given CPU. A failure is fatal under
/// [`CpuPinningPolicy::Always`] and only logged otherwise.
fn pin_current_thread(id: usize, cpu: usize, cpu_pinning: CpuPinningPolicy) {
    if cpu_pinning == CpuPinningPolicy::No {
        return;
    }
    match set_affinity(cpu) {
        Ok(()) => log_debug!("Pinned worker #{id} to CPU #{cpu}"),
        Err(e) if cpu_pinning == CpuPinningPolicy::Always => {
            panic!("Failed to pin worker #{id} to CPU #{cpu}: {e}")
        }
        Err(_e) => log_warn!("Failed to pin worker #{id} to CPU #{cpu}: {_e}"),
    }
}

#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn set_affinity(cpu: usize) -> nix::Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    cpu_set.set(cpu)?;
    // Pid 0 is the calling thread.
    sched_setaffinity(Pid::from_raw(0), &cpu_set)
}

#[cfg(not(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
)))]
fn set_affinity(_cpu: usize) -> Result<(), &'static str> {
    Err("not implemented on this platform")
}

/// A running pool of worker threads, as returned by
/// [`WorkerPoolBuilder::spawn()`].
///
/// Dropping the pool without calling [`join()`](Self::join) detaches the
/// threads, which keep running until the job queue is exhausted.
pub struct WorkerPool {
    /// Handles to all the worker threads in the pool.
    workers: Vec<WorkerThreadHandle>,
    /// Thread closing the result queue once all workers have exited.
    closer: JoinHandle<()>,
}

/// Handle to a worker thread in a pool.
struct WorkerThreadHandle {
    /// Thread handle object, returning the number of processed jobs.
    handle: JoinHandle<usize>,
}

impl WorkerPool {
    /// Returns the number of worker threads in this pool.
    pub fn num_workers(&self) -> NonZeroUsize {
        self.workers
            .len()
            .try_into()
            .expect("a worker pool has at least one worker")
    }

    /// Waits for all the workers and the result closer to exit, and returns
    /// how many jobs each worker processed.
    ///
    /// This only returns once the job queue is closed and drained. The result
    /// queue must be drained concurrently (or be large enough) for the
    /// workers to make progress.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread panicked outside of the processing function,
    /// which only happens when the result queue was closed by someone else.
    pub fn join(self) -> WorkerStats {
        log_debug!("[main thread] Joining worker threads...");
        let mut num_panicking = 0;
        let jobs_per_worker = self
            .workers
            .into_iter()
            .enumerate()
            .map(|(_id, worker)| match worker.handle.join() {
                Ok(count) => {
                    log_debug!("[main thread] Worker {_id} joined after {count} job(s)");
                    count
                }
                Err(_) => {
                    log_error!("[main thread] Worker {_id} panicked");
                    num_panicking += 1;
                    0
                }
            })
            .collect::<Vec<_>>();

        if self.closer.join().is_err() {
            log_error!("[main thread] The result closer panicked");
            num_panicking += 1;
        }
        if num_panicking != 0 {
            panic!("{num_panicking} worker pool thread(s) panicked!");
        }
        log_debug!("[main thread] Joined worker threads.");

        let stats = WorkerStats { jobs_per_worker };
        #[cfg(feature = "log_parallelism")]
        stats.print_statistics();
        stats
    }
}

/// Number of jobs processed by each worker of a joined [`WorkerPool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerStats {
    jobs_per_worker: Vec<usize>,
}

impl WorkerStats {
    /// Returns the number of jobs processed by each worker, indexed by worker
    /// id.
    pub fn jobs_per_worker(&self) -> &[usize] {
        &self.jobs_per_worker
    }

    /// Returns the total number of processed jobs.
    pub fn total(&self) -> usize {
        self.jobs_per_worker.iter().sum()
    }

    #[cfg(feature = "log_parallelism")]
    fn print_statistics(&self) {
        log_info!("Worker pool statistics:");
        log_info!("- total jobs: {}", self.total());
        for (id, count) in self.jobs_per_worker.iter().enumerate() {
            log_info!("- worker #{id}: {count} job(s)");
        }
    }
}

/// Context object owned by a worker thread.
struct WorkerContext<F> {
    /// Worker index.
    id: usize,
    /// Queue of jobs to process.
    jobs: Receiver<Job>,
    /// Queue on which results are sent.
    results: Sender<JobResult>,
    /// Processing function shared by all workers.
    process: Arc<F>,
    /// Decrements the pool's latch once this context is dropped, including
    /// when the thread unwinds.
    _guard: LatchGuard,
}

impl<F: Fn(Job) -> JobResult> WorkerContext<F> {
    /// Main function run by this thread. Returns the number of processed jobs.
    fn run(self) -> usize {
        let mut processed = 0;
        for job in &self.jobs {
            let job_id = job.id();
            log_debug!("[worker {}] Processing job {job_id}", self.id);

            let process = &*self.process;
            let result = match catch_unwind(AssertUnwindSafe(|| process(job))) {
                Ok(result) => result,
                Err(payload) => {
                    let error = ProcessingError::from_panic(payload);
                    log_warn!("[worker {}] Job {job_id} panicked: {error}", self.id);
                    JobResult::failed(job_id, error)
                }
            };

            if let Err(e) = self.results.send(result) {
                log_error!(
                    "[worker {}] Failed to send the result of job {job_id}: {e}",
                    self.id
                );
                panic!("Failed to send the result of job {job_id}: {e}");
            }
            processed += 1;
        }
        log_debug!(
            "[worker {}] Job queue exhausted after {processed} job(s)",
            self.id
        );
        processed
    }
}

/// Runs a worker pool over the given payloads and returns the queue on which
/// results arrive, along with the pool itself.
///
/// Jobs are numbered from 1 in iteration order. Both queues are sized to hold
/// every job, so this function returns as soon as all the jobs are queued,
/// and the caller drains the results until exhaustion. Result order is not
/// specified.
///
/// ```
/// # use fanpool::{describe_job, submit_jobs, WorkerCount};
/// let (results, pool) = submit_jobs(
///     (1..=10).map(|i| format!("task-{i}")),
///     WorkerCount::try_from(3).unwrap(),
///     describe_job,
/// );
///
/// let mut results = results.iter().collect::<Vec<_>>();
/// results.sort_unstable_by_key(|r| r.job_id());
/// assert_eq!(results.len(), 10);
/// assert_eq!(results[0].value(), "Processed: task-1");
/// assert!(results.iter().all(|r| r.is_ok()));
/// pool.join();
/// ```
pub fn submit_jobs<I, F>(
    values: I,
    num_workers: WorkerCount,
    process: F,
) -> (Receiver<JobResult>, WorkerPool)
where
    I: IntoIterator,
    I::Item: Into<String>,
    F: Fn(Job) -> JobResult + Send + Sync + 'static,
{
    let jobs = values
        .into_iter()
        .zip(1..)
        .map(|(data, id)| Job::new(id, data))
        .collect::<Vec<_>>();
    let capacity = NonZeroUsize::new(jobs.len()).unwrap_or(NonZeroUsize::MIN);

    let (job_tx, job_rx) = bounded(capacity);
    let (result_tx, result_rx) = bounded(capacity);

    let pool = WorkerPoolBuilder {
        num_workers,
        cpu_pinning: CpuPinningPolicy::No,
    }
    .spawn(job_rx, result_tx, process);

    let num_jobs = jobs.len();
    for job in jobs {
        if let Err(e) = job_tx.send(job) {
            log_error!("[main thread] Failed to queue a job: {e}");
            panic!("Failed to queue a job: {e}");
        }
    }
    if let Err(e) = job_tx.close() {
        log_error!("[main thread] Failed to close the job queue: {e}");
        panic!("Failed to close the job queue: {e}");
    }
    log_debug!("[main thread] Submitted {num_jobs} job(s)");

    (result_rx, pool)
}
