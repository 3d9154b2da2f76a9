use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode};
use merkle_kv::model::Version;
use merkle_kv::store::VersionedStore;
use std::time::Duration;

fn bench_put_and_merkle_root(c: &mut Criterion) {
    let store = VersionedStore::new();
    for i in 0..100_000 {
        store
            .put(
                &format!("user:{i:06}"),
                "x".to_string(),
                Version::new(i as u64, "bench-node"),
            )
            .unwrap();
    }

    let mut g = c.benchmark_group("versioned_store");
    g.sample_size(60)
        .measurement_time(Duration::from_secs(10))
        .warm_up_time(Duration::from_secs(2))
        .sampling_mode(SamplingMode::Auto);

    g.bench_function(BenchmarkId::new("merkle_root over", 100_000), |b| {
        b.iter(|| {
            let root = store.merkle_root();
            black_box(root);
        });
    });

    g.bench_function(BenchmarkId::new("get existing key", 100_000), |b| {
        b.iter(|| {
            let v = store.get(black_box("user:050000"));
            black_box(v);
        });
    });

    g.finish();
}

criterion_group!(benches, bench_put_and_merkle_root);
criterion_main!(benches);
