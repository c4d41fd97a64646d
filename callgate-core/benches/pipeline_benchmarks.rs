use callgate_core::{CacheConfig, CacheStore, KeyConfig, KeyGenerator, RequestSpec};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::time::Duration;

fn bench_key_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_generation");
    let generator = KeyGenerator::new(KeyConfig::default());

    for fields in [1usize, 10, 100].iter() {
        let params: serde_json::Map<String, serde_json::Value> = (0..*fields)
            .map(|i| (format!("field_{}", i), json!(i)))
            .collect();
        let request = RequestSpec::get("/items").with_params(json!(params));

        group.bench_with_input(BenchmarkId::new("query_fields", fields), &request, |b, request| {
            b.iter(|| black_box(generator.generate(request)))
        });
    }

    let write = RequestSpec::post("/items").with_data(json!({
        "title": "benchmark",
        "tags": ["a", "b", "c"],
        "nested": {"z": 1, "a": {"y": 2, "b": 3}}
    }));
    group.bench_function("write_with_body", |b| {
        b.iter(|| black_box(generator.generate(&write)))
    });

    group.finish();
}

fn bench_cache_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_operations");
    let ttl = Duration::from_secs(300);

    for size in [100usize, 1000].iter() {
        let cache = CacheStore::new(CacheConfig {
            max_size: *size,
            ..Default::default()
        });
        for i in 0..*size {
            cache.set(&format!("GET /items/{}", i), json!({"id": i}), ttl);
        }

        group.bench_with_input(BenchmarkId::new("get_hit", size), size, |b, &size| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 1) % size;
                black_box(cache.get(&format!("GET /items/{}", i)))
            })
        });

        group.bench_with_input(BenchmarkId::new("set_evicting", size), size, |b, &size| {
            let mut i = size;
            b.iter(|| {
                i += 1;
                cache.set(&format!("GET /items/{}", i), json!({"id": i}), ttl);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_key_generation, bench_cache_operations);
criterion_main!(benches);
