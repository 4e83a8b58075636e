// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod error;
mod macros;
pub mod pipeline;
pub mod queue;
pub mod sync;
mod util;
mod worker_pool;

pub use error::{ClosedQueueError, ProcessingError, TryRecvError};
pub use pipeline::build_pipeline;
pub use worker_pool::{
    describe_job, submit_jobs, with_latency, CpuPinningPolicy, Job, JobResult, WorkerCount,
    WorkerPool, WorkerPoolBuilder, WorkerStats,
};
