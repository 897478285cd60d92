use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quotaplane_common::{Cap, Dimension, QuotaLimit, QuotaSpecification, ReservationRequest};
use quotaplane_engine::QuotaEngine;
use std::sync::Arc;
use tokio::runtime::Runtime;

const QUOTA_COUNTS: [usize; 3] = [1, 8, 64];

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn engine_with_quotas(rt: &Runtime, count: usize) -> Arc<QuotaEngine> {
    let engine = QuotaEngine::in_memory();
    rt.block_on(async {
        for i in 0..count {
            let spec = QuotaSpecification::new(format!("team-{}", i)).with_limit(
                QuotaLimit::new("global").with_cap(Dimension::Cpu, Cap::Limited(i64::MAX)),
            );
            engine.register(spec).await.unwrap();
        }
    });
    Arc::new(engine)
}

/// Single reserve + release round trip on an idle quota
fn bench_reserve_release(c: &mut Criterion) {
    let rt = runtime();
    let engine = engine_with_quotas(&rt, 1);

    c.bench_function("reserve_release", |b| {
        b.to_async(&rt).iter(|| {
            let engine = engine.clone();
            async move {
                let reservation = engine
                    .reserve(ReservationRequest::new("team-0", "global").with(Dimension::Cpu, 1))
                    .await
                    .unwrap();
                black_box(engine.release(reservation.id).await.unwrap())
            }
        });
    });
}

/// 64 concurrent reservations spread over an increasing number of quotas
fn bench_contention(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("concurrent_reserve");

    for count in QUOTA_COUNTS.iter() {
        let engine = engine_with_quotas(&rt, *count);

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.to_async(&rt).iter(|| {
                let engine = engine.clone();
                async move {
                    let tasks: Vec<_> = (0..64)
                        .map(|i| {
                            let engine = engine.clone();
                            tokio::spawn(async move {
                                let quota = format!("team-{}", i % count);
                                let reservation = engine
                                    .reserve(
                                        ReservationRequest::new(quota, "global")
                                            .with(Dimension::Cpu, 1),
                                    )
                                    .await
                                    .unwrap();
                                engine.release(reservation.id).await.unwrap()
                            })
                        })
                        .collect();
                    for task in tasks {
                        black_box(task.await.unwrap());
                    }
                }
            });
        });
    }

    group.finish();
}

/// Usage snapshot of a quota with live reservations
fn bench_usage_query(c: &mut Criterion) {
    let rt = runtime();
    let engine = engine_with_quotas(&rt, 1);
    rt.block_on(async {
        for _ in 0..100 {
            engine
                .reserve(ReservationRequest::new("team-0", "global").with(Dimension::Cpu, 1))
                .await
                .unwrap();
        }
    });

    c.bench_function("usage_query", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(engine.usage("team-0").await.unwrap()) });
    });
}

criterion_group!(benches, bench_reserve_release, bench_contention, bench_usage_query);
criterion_main!(benches);
