use cqf::{CountingQuotientFilter, HashMode, QfConfig};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

fn bench_insert(c: &mut Criterion) {
    let mut initial_items = 0;
    while initial_items < 1024 - 32 {
        c.bench_function(&format!("bench insert {}", initial_items), |b| {
            b.iter_batched_ref(
                || {
                    let config =
                        QfConfig::new(1024, 32, 0).with_hash_mode(HashMode::Invertible);
                    let mut filter = CountingQuotientFilter::new(config).unwrap();
                    for i in 0..initial_items {
                        filter.insert(i, 0, 1).unwrap();
                    }
                    filter
                },
                |filter| filter.insert(0xDEAD_BEEF, 0, 1).unwrap(),
                BatchSize::PerIteration,
            )
        });
        initial_items += 32;
    }
}

fn bench_query(c: &mut Criterion) {
    let config = QfConfig::new(1 << 16, 32, 0).with_hash_mode(HashMode::Invertible);
    let mut filter = CountingQuotientFilter::new(config).unwrap();
    for i in 0..(1 << 14) {
        filter.insert(i, 0, 1).unwrap();
    }
    c.bench_function("bench query hit", |b| b.iter(|| filter.query(1234)));
    c.bench_function("bench query miss", |b| {
        b.iter(|| filter.query(1 << 20))
    });
}

criterion_group!(benches, bench_insert, bench_query);
criterion_main!(benches);
