//! Benchmarks for partition planning and idempotent writes.

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowgate::core::LineageKey;
use flowgate::partition::plan_batches;
use flowgate::retry::RetryConfig;
use flowgate::warehouse::{MemoryWarehouse, QueryParam, Row, TableRef, Warehouse};
use flowgate::writer::IdempotentWriter;
use serde_json::Value;
use std::sync::Arc;

fn rows(count: u64) -> Vec<Row> {
    (0..count)
        .map(|i| {
            let mut row = Row::new();
            row.insert("id".to_string(), Value::from(i));
            row.insert("amount".to_string(), Value::from(i * 3));
            row
        })
        .collect()
}

fn plan_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_batches");
    for partitions in [37_usize, 1_000, 10_000] {
        let values: Vec<QueryParam> = (0..partitions as i64).map(QueryParam::Int).collect();
        group.throughput(Throughput::Elements(partitions as u64));
        group.bench_with_input(BenchmarkId::from_parameter(partitions), &values, |b, values| {
            b.iter(|| plan_batches(black_box(values), black_box(10)));
        });
    }
    group.finish();
}

fn merge_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let key = LineageKey::new(
        "bench",
        "orders",
        "cred-1",
        NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date"),
    );
    let target = TableRef::new("mart", "orders").expect("valid table");

    let mut group = c.benchmark_group("write_with_merge");
    for count in [100_u64, 1_000, 5_000] {
        let input = rows(count);
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &input, |b, input| {
            b.iter(|| {
                let warehouse: Arc<dyn Warehouse> = Arc::new(MemoryWarehouse::new());
                let writer = IdempotentWriter::new(warehouse, RetryConfig::no_retry(), 500);
                runtime.block_on(async {
                    writer
                        .write_with_merge(&target, &key, &["id".to_string()], input.clone(), "bench-run")
                        .await
                        .expect("merge succeeds")
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, plan_benchmark, merge_benchmark);
criterion_main!(benches);
