// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run the worker pool and pipeline scenarios.

use clap::{Parser, ValueEnum};
use fanpool::pipeline::{FanOutStrategy, PipelineBuilder};
use fanpool::{describe_job, submit_jobs, with_latency, WorkerCount};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::num::NonZeroUsize;
use std::time::Duration;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.scenario {
        Scenario::Jobs => {
            let num_workers = match cli.num_workers {
                Some(num_workers) => WorkerCount::Count(num_workers),
                None => WorkerCount::AvailableParallelism,
            };
            let (results, pool) = submit_jobs(
                (1..=cli.input_size).map(|i| format!("task-{i}")),
                num_workers,
                with_latency(Duration::from_millis(cli.latency_ms), describe_job),
            );

            for result in &results {
                match result.error() {
                    Some(e) => println!("Job {} failed: {e}", result.job_id()),
                    None => println!("Job {} result: {}", result.job_id(), result.value()),
                }
            }
            let stats = pool.join();
            println!(
                "All jobs completed: {} job(s) over {} worker(s)",
                stats.total(),
                stats.jobs_per_worker().len()
            );
        }
        Scenario::Pipeline => {
            let mut rng = ChaCha12Rng::seed_from_u64(cli.seed);
            let numbers = (0..cli.input_size)
                .map(|_| rng.random_range(-1000..1000))
                .collect::<Vec<i64>>();

            let pipeline = PipelineBuilder {
                num_stages: cli.num_stages,
                fan_out: match cli.fan_out {
                    FanOutCli::Shared => FanOutStrategy::Shared,
                    FanOutCli::Partitioned => FanOutStrategy::Partitioned,
                },
                capacity: cli.capacity,
            };
            let squares = pipeline.build(numbers, |n: i64| n * n);

            let mut count = 0;
            let mut sum = 0;
            for n in squares {
                count += 1;
                sum += n;
            }
            println!("count = {count}, sum of squares = {sum}");
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Scenario to run.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of jobs or numbers in the input.
    #[arg(long, default_value_t = 10)]
    input_size: u64,

    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_workers: Option<NonZeroUsize>,

    /// Simulated latency of each job, in milliseconds.
    #[arg(long, default_value_t = 100)]
    latency_ms: u64,

    /// Number of parallel pipeline stages.
    #[arg(long, default_value = "4")]
    num_stages: NonZeroUsize,

    /// Policy to fan the input out to the pipeline stages.
    #[arg(long, value_enum, default_value_t = FanOutCli::Shared)]
    fan_out: FanOutCli,

    /// Capacity of the pipeline queues.
    #[arg(long, default_value = "1")]
    capacity: NonZeroUsize,

    /// Seed of the random pipeline input.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Policy to fan the input out to the pipeline stages.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum FanOutCli {
    /// All stages compete for the items of a single generator.
    Shared,
    /// Each stage processes a fixed contiguous chunk of the input.
    Partitioned,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Process numbered jobs on a worker pool.
    Jobs,
    /// Square random numbers through a fan-out/fan-in pipeline.
    Pipeline,
}
