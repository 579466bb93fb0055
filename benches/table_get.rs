use criterion::{criterion_group, criterion_main, Criterion};
use rand::seq::IndexedRandom;
use segment_table::{Config, IndexingMode, MemorySegmentContainer, TableEntry};
use std::{sync::Arc, time::Duration};

const TIMEOUT: Duration = Duration::from_secs(60);

fn table_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("table get");
    group.sample_size(10);

    for num_keys in [1_000, 10_000] {
        for cache_capacity in [0, 100_000] {
            let tables = Config::new(Arc::new(MemorySegmentContainer::new(0)))
                .cache_capacity(cache_capacity)
                .open();
            tables.create_segment("bench", TIMEOUT).unwrap();

            let keys = (0..num_keys).map(|i| i.to_string()).collect::<Vec<_>>();

            for chunk in keys.chunks(1_000) {
                let entries = chunk
                    .iter()
                    .map(|key| TableEntry::new(key.as_str(), key.as_str()))
                    .collect::<Vec<_>>();
                tables.put("bench", &entries, TIMEOUT).unwrap();
            }

            let mut rng = rand::rng();

            group.bench_function(
                format!("get, {num_keys} keys, cache capacity {cache_capacity}"),
                |b| {
                    b.iter(|| {
                        let key = keys.choose(&mut rng).unwrap();
                        let entries = tables.get("bench", &[key], TIMEOUT).unwrap();
                        assert!(entries[0].is_some());
                    });
                },
            );

            group.bench_function(
                format!("get 100 keys, {num_keys} keys, cache capacity {cache_capacity}"),
                |b| {
                    b.iter(|| {
                        let sample = keys.choose_multiple(&mut rng, 100).collect::<Vec<_>>();
                        tables.get("bench", &sample, TIMEOUT).unwrap();
                    });
                },
            );
        }
    }
}

fn table_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("table put");
    group.sample_size(10);

    for mode in [IndexingMode::Inline, IndexingMode::Deferred] {
        let tables = Config::new(Arc::new(MemorySegmentContainer::new(0)))
            .indexing_mode(mode)
            .open();
        tables.create_segment("bench", TIMEOUT).unwrap();

        let mut idx = 0u64;

        group.bench_function(format!("put ({mode:?})"), |b| {
            b.iter(|| {
                idx += 1;
                tables
                    .put("bench", &[TableEntry::new(idx.to_be_bytes(), "value")], TIMEOUT)
                    .unwrap();
            });
        });
    }
}

criterion_group!(benches, table_get, table_put);
criterion_main!(benches);
