//! Incremental maintenance cost: a pipeline hydrated once over a base
//! dataset, then fed single-document inserts/removes, compared against
//! re-running the whole pipeline from scratch on every change.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use docview::{aggregate, Engine};
use serde_json::{json, Value};

fn make_docs(size: u32) -> Vec<Value> {
    (0..size)
        .map(|i| json!({"_id": i, "category": i % 10, "price": (i % 50) + 1, "quantity": (i % 5) + 1}))
        .collect()
}

fn group_pipeline() -> Vec<Value> {
    vec![json!({"$group": {
        "_id": "$category",
        "revenue": {"$sum": {"$multiply": ["$price", "$quantity"]}},
    }})]
}

fn bench_single_insert_incremental(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_insert");
    for size in [1_000u32, 10_000] {
        let docs = make_docs(size);
        let pipeline = group_pipeline();
        let mut engine = Engine::new();
        for d in &docs {
            engine.add_document(d.clone());
        }
        let mut live = engine.build_pipeline(&pipeline).unwrap();
        let mut next_id = size as i64;

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let row = live
                    .add_document(json!({"_id": next_id, "category": next_id % 10, "price": 7, "quantity": 2}))
                    .unwrap();
                next_id += 1;
                live.remove_document(row).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_single_insert_from_scratch(c: &mut Criterion) {
    let mut group = c.benchmark_group("from_scratch_insert");
    for size in [1_000u32, 10_000] {
        let mut docs = make_docs(size);
        let pipeline = group_pipeline();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                docs.push(json!({"_id": size as i64, "category": 3, "price": 7, "quantity": 2}));
                let out = aggregate(docs.clone(), &pipeline).unwrap();
                docs.pop();
                out
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_insert_incremental, bench_single_insert_from_scratch);
criterion_main!(benches);
