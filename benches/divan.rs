// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

fn main() {
    divan::main();
}

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const LENGTHS: &[usize] = &[100, 1_000, 10_000];

/// Baseline benchmarks using serial iterators (without any multi-threading
/// involved).
mod serial {
    use super::LENGTHS;
    use divan::counter::ItemsCount;
    use divan::{black_box, Bencher};

    #[divan::bench(args = LENGTHS)]
    fn squares(bencher: Bencher, len: usize) {
        let input = (0..len as i64).collect::<Vec<i64>>();
        let input_slice = input.as_slice();
        bencher
            .counter(ItemsCount::new(len))
            .bench_local(|| black_box(input_slice).iter().map(|n| n * n).sum::<i64>())
    }
}

/// Benchmarks of the queues and stages of fanpool.
mod fanpool {
    use super::{LENGTHS, NUM_THREADS};
    use divan::counter::ItemsCount;
    use divan::{black_box, Bencher};
    use fanpool::pipeline::{generate_with_capacity, merge, FanOutStrategy, PipelineBuilder};
    use fanpool::queue::bounded;
    use std::num::NonZeroUsize;

    #[divan::bench(args = LENGTHS)]
    fn queue_ping_pong(bencher: Bencher, len: usize) {
        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            let (tx, rx) = bounded(NonZeroUsize::try_from(16).unwrap());
            let producer = std::thread::spawn(move || {
                for i in 0..len as u64 {
                    tx.send(i).unwrap();
                }
                tx.close().unwrap();
            });
            let sum = rx.iter().sum::<u64>();
            producer.join().unwrap();
            sum
        });
    }

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn merge_inputs<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let capacity = NonZeroUsize::try_from(16).unwrap();
        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            let inputs = (0..NUM_THREADS).map(|i| {
                let start = (i * len) / NUM_THREADS;
                let end = ((i + 1) * len) / NUM_THREADS;
                generate_with_capacity(start as u64..end as u64, capacity)
            });
            merge(inputs).iter().sum::<u64>()
        });
    }

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn squares_shared<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        squares_impl::<NUM_THREADS>(bencher, len, FanOutStrategy::Shared)
    }

    #[divan::bench(consts = NUM_THREADS, args = LENGTHS)]
    fn squares_partitioned<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        squares_impl::<NUM_THREADS>(bencher, len, FanOutStrategy::Partitioned)
    }

    fn squares_impl<const NUM_THREADS: usize>(
        bencher: Bencher,
        len: usize,
        fan_out: FanOutStrategy,
    ) {
        let input = (0..len as i64).collect::<Vec<i64>>();
        let pipeline = PipelineBuilder {
            num_stages: NonZeroUsize::try_from(NUM_THREADS).unwrap(),
            fan_out,
            capacity: NonZeroUsize::try_from(64).unwrap(),
        };

        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            pipeline
                .build(black_box(input.clone()), |n: i64| n * n)
                .iter()
                .sum::<i64>()
        });
    }
}
