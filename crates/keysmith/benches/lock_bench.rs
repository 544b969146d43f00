// Benchmarks for identifier generation and lock throughput
// Lock benchmarks run against the in-memory store to isolate protocol overhead

use std::hint::black_box;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use keysmith::{IdentifierGenerator, Key, KeySmithError, LockService, MemoryStore};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn bench_identifier_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("identifier_generation");
    for size in [12usize, 16, 32] {
        let generator = IdentifierGenerator::new(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &generator, |b, g| {
            b.iter(|| black_box(g.generate()))
        });
    }
    group.finish();
}

fn bench_uncontended_lock(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let service = LockService::new(MemoryStore::shared());
    let key = Key::new("bench", "uncontended", Duration::from_secs(30)).unwrap();
    let cancel = CancellationToken::new();

    c.bench_function("uncontended_lock", |b| {
        b.to_async(&runtime).iter(|| async {
            let value: Result<u64, KeySmithError> = service
                .lock(&key, |_| async { Ok(black_box(1)) }, &cancel)
                .await;
            value.unwrap()
        })
    });
}

fn bench_contended_lock(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("contended_lock");
    group.sample_size(20);

    for contenders in [4usize, 16, 64] {
        let service = LockService::new(MemoryStore::shared());
        let key = Key::new("bench", "contended", Duration::from_secs(30)).unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(contenders),
            &contenders,
            |b, &contenders| {
                b.to_async(&runtime).iter(|| async {
                    let handles: Vec<_> = (0..contenders)
                        .map(|_| {
                            let service = service.clone();
                            let key = key.clone();
                            tokio::spawn(async move {
                                service
                                    .run(
                                        &key,
                                        |_| async { Ok::<_, KeySmithError>(()) },
                                        &CancellationToken::new(),
                                    )
                                    .await
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.await.unwrap().unwrap();
                    }
                })
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_identifier_generation,
    bench_uncontended_lock,
    bench_contended_lock,
);
criterion_main!(benches);
