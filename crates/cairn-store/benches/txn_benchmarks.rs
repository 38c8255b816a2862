use cairn_schema::TxnSection;
use cairn_store::{DocumentStore, FieldOp, FileStore, MemoryStore, Op, Runner};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn fields(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

fn seeded(store: Arc<dyn DocumentStore>) -> Runner {
    let runner = Runner::new(store, TxnSection::default());
    runner
        .run(vec![Op::new("counters", "c").insert(fields(json!({"n": 0})))])
        .unwrap();
    runner
}

fn bench_memory_insert(c: &mut Criterion) {
    c.bench_function("txn_memory_insert_3docs", |b| {
        b.iter_with_setup(
            || Runner::new(Arc::new(MemoryStore::new()), TxnSection::default()),
            |runner| {
                runner
                    .run(vec![
                        Op::new("services", "wordpress").insert(fields(json!({"life": "alive"}))),
                        Op::new("units", "wordpress/0").insert(fields(json!({"life": "alive"}))),
                        Op::new("machines", "0").insert(fields(json!({"life": "alive"}))),
                    ])
                    .unwrap();
            },
        );
    });
}

fn bench_memory_update(c: &mut Criterion) {
    let runner = seeded(Arc::new(MemoryStore::new()));
    c.bench_function("txn_memory_increment", |b| {
        b.iter(|| {
            runner
                .run(vec![
                    Op::new("counters", "c").update(vec![FieldOp::Inc("n".into(), 1)])
                ])
                .unwrap();
        });
    });
}

fn bench_file_update(c: &mut Criterion) {
    c.bench_function("txn_file_increment", |b| {
        b.iter_with_setup(
            || {
                let dir = tempfile::tempdir().unwrap();
                let runner = seeded(Arc::new(FileStore::open(dir.path()).unwrap()));
                (dir, runner)
            },
            |(_dir, runner)| {
                runner
                    .run(vec![
                        Op::new("counters", "c").update(vec![FieldOp::Inc("n".into(), 1)])
                    ])
                    .unwrap();
            },
        );
    });
}

criterion_group!(
    benches,
    bench_memory_insert,
    bench_memory_update,
    bench_file_update
);
criterion_main!(benches);
