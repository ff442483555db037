use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quota_core::services::{apply_topup, apply_usage, parse_command, BYTES_PER_GB, BYTES_PER_MB};
use quota_core::{AccountStore, Category, QuotaBucket};
use tempfile::TempDir;

fn full_buckets() -> Vec<QuotaBucket> {
    vec![
        QuotaBucket::new(Category::Video, 0).with_remaining(100 * BYTES_PER_MB),
        QuotaBucket::new(Category::Social, 1).with_remaining(50 * BYTES_PER_MB),
        QuotaBucket::new(Category::General, 2).with_remaining(20 * BYTES_PER_MB),
    ]
}

fn benchmark_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_command");
    for text in ["YouTube 2GB", "please buy 500 mb for TikTok", "??? not a command"] {
        group.bench_with_input(BenchmarkId::from_parameter(text), text, |b, text| {
            b.iter(|| parse_command(black_box(text)))
        });
    }
    group.finish();
}

fn benchmark_ledger(c: &mut Criterion) {
    let buckets = full_buckets();

    c.bench_function("ledger_topup", |b| {
        b.iter(|| apply_topup(black_box(&buckets), Category::Social, BYTES_PER_GB))
    });

    c.bench_function("ledger_usage_single_bucket", |b| {
        b.iter(|| apply_usage(black_box(&buckets), Category::Video, 10 * BYTES_PER_MB))
    });

    c.bench_function("ledger_usage_cascade", |b| {
        b.iter(|| apply_usage(black_box(&buckets), Category::Video, 120 * BYTES_PER_MB))
    });
}

fn benchmark_store(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let temp_dir = TempDir::new().unwrap();
    let store = runtime
        .block_on(AccountStore::open("bench-user", temp_dir.path().join("bench.db")))
        .unwrap();

    // Enter the runtime so the worker keeps draining while commits run
    let _guard = runtime.enter();

    c.bench_function("store_top_up_then_use", |b| {
        b.iter(|| {
            store.top_up(Category::General, BYTES_PER_MB).unwrap();
            store.record_usage(Category::General, BYTES_PER_MB).unwrap();
        })
    });

    c.bench_function("store_get_snapshot", |b| b.iter(|| black_box(store.get_snapshot())));

    runtime.block_on(store.shutdown());
}

criterion_group!(benches, benchmark_parser, benchmark_ledger, benchmark_store);
criterion_main!(benches);
