//! Blocked Matrix Multiplication Benchmark
//!
//! Compares both staging strategies on both targets against the naive
//! reference product, for a few matrix and block sizes.
//!
//! # Usage:
//! ```bash
//! # Run all benchmarks
//! cargo bench --bench matmul
//!
//! # Run one size only
//! cargo bench --bench matmul -- blockgemm_256
//! ```

use std::hint::black_box;

use blockgemm::{
    block_matmul, utils, BlockStore, Config, DeviceTarget, HostTarget, StagingStrategy,
};
use criterion::{criterion_group, criterion_main, Criterion};
use rand::prelude::*;

fn bench_matmul_by_size(c: &mut Criterion) {
    let sizes = [(128, 32), (256, 64), (256, 32), (512, 128)];

    for (n, bs) in sizes {
        let group_name = format!("blockgemm_{}_bs{}", n, bs);
        let mut group = c.benchmark_group(&group_name);
        group.sample_size(20);

        let mut rng = StdRng::seed_from_u64(42);
        let a: Vec<i64> = utils::random_matrix(n, &mut rng);
        let b: Vec<i64> = utils::random_matrix(n, &mut rng);

        let block_a = BlockStore::from_flat(bs, bs, n, n, &a).unwrap();
        let block_b = BlockStore::from_flat(bs, bs, n, n, &b).unwrap();
        let mut block_c = BlockStore::square(bs, n).unwrap();

        group.bench_function("reference", |bench| {
            bench.iter(|| black_box(utils::reference_matmul(black_box(&a), black_box(&b), n)));
        });

        for strategy in [StagingStrategy::Inline, StagingStrategy::Bulk] {
            let config = Config::new().with_strategy(strategy);

            group.bench_function(format!("host_{}", strategy), |bench| {
                bench.iter(|| {
                    block_matmul(&block_a, &block_b, &mut block_c, &HostTarget, &config).unwrap();
                    black_box(&block_c);
                });
            });

            group.bench_function(format!("device_{}", strategy), |bench| {
                bench.iter(|| {
                    let device = DeviceTarget::<i64>::new();
                    block_matmul(&block_a, &block_b, &mut block_c, &device, &config).unwrap();
                    black_box(&block_c);
                });
            });
        }

        group.finish();
    }
}

criterion_group!(benches, bench_matmul_by_size);
criterion_main!(benches);
