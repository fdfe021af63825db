//! Benchmarks for canopy storage
//!
//! Run with: cargo bench

use canopy::encoding::{decode_column, encode_column, EncodingMethod};
use canopy::partition::{EntityLocator, TagLocator};
use canopy::storage::part::Part;
use canopy::storage::series::{SeriesOptions, SeriesStore};
use canopy::storage::wal::{WalSyncMode, WriteAheadLog};
use canopy::storage::{Context, Element, Entity, Row, TagFamilyForWrite, TagValue};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use tempfile::tempdir;

// 2024-03-15T00:00:00Z
const DAY_START: i64 = 1_710_460_800_000;

fn create_test_rows(count: usize) -> Vec<Row> {
    (0..count)
        .map(|i| {
            let service = format!("svc-{}", i % 8);
            let instance = format!("i-{}", i % 32);
            let entity = Entity::new(vec![service.as_bytes().to_vec(), instance.as_bytes().to_vec()]);
            Row::from_element(
                Element::new(format!("e{}", i), DAY_START + i as i64 * 100).family(vec![
                    service.into(),
                    "/api/orders".into(),
                    instance.into(),
                    TagValue::Int(i as i64 % 5_000),
                ]),
                entity,
            )
        })
        .collect()
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoding");

    for (name, method) in [
        ("plain", EncodingMethod::plain(1 << 20)),
        ("lz4", EncodingMethod::lz4(1 << 20)),
    ] {
        for size in [1000, 10000] {
            let values: Vec<TagValue> = (0..size)
                .map(|i| TagValue::Str(format!("/api/endpoint/{}", i % 50)))
                .collect();

            group.throughput(Throughput::Elements(size as u64));

            group.bench_function(format!("{}_encode_{}", name, size), |b| {
                b.iter(|| encode_column(method.encoder_pool.as_ref(), black_box(&values)))
            });

            let chunks = encode_column(method.encoder_pool.as_ref(), &values);
            let decoder = method.decoder_pool.get();

            group.bench_function(format!("{}_decode_{}", name, size), |b| {
                b.iter(|| decode_column(decoder.as_ref(), black_box(&chunks)).unwrap())
            });
        }
    }

    group.finish();
}

fn bench_locate(c: &mut Criterion) {
    let locator = EntityLocator::from_locators(vec![
        TagLocator {
            family_offset: 0,
            tag_offset: 0,
        },
        TagLocator {
            family_offset: 0,
            tag_offset: 2,
        },
    ]);
    let values = vec![TagFamilyForWrite::new(vec![
        "svcA".into(),
        "/api/orders".into(),
        "i-1".into(),
        TagValue::Int(120),
    ])];

    c.bench_function("locate", |b| {
        b.iter(|| locator.locate(black_box(&values), 32).unwrap())
    });
}

fn bench_wal(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal");

    group.bench_function("append_single", |b| {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(
            dir.path().join("wal.log"),
            WalSyncMode::None, // No fsync for benchmarking raw performance
        )
        .unwrap();

        let row = create_test_rows(1).remove(0);

        b.iter(|| wal.append(black_box(&row)).unwrap());
    });

    group.finish();
}

fn bench_part(c: &mut Criterion) {
    let mut group = c.benchmark_group("part");
    let method = EncodingMethod::default();

    for size in [1000, 10000] {
        let rows = create_test_rows(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("write_{}", size), |b| {
            let dir = tempdir().unwrap();
            let mut seq = 0;
            b.iter(|| {
                seq += 1;
                Part::write(dir.path(), seq, black_box(&rows), &method).unwrap()
            });
        });

        let dir = tempdir().unwrap();
        let part = Part::write(dir.path(), 1, &rows, &method).unwrap();

        group.bench_function(format!("read_{}", size), |b| {
            b.iter(|| part.read_rows(black_box(&method)).unwrap())
        });
    }

    group.finish();
}

fn bench_series_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("series");
    let rows = create_test_rows(1000);
    group.throughput(Throughput::Elements(rows.len() as u64));

    group.bench_function("append_1000", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let opts = SeriesOptions {
                    wal_sync: WalSyncMode::None,
                    ..SeriesOptions::default()
                };
                let store = SeriesStore::open(&Context::background(), dir.path(), Arc::new(opts))
                    .unwrap();
                (dir, store)
            },
            |(_dir, store)| {
                for row in &rows {
                    store.append(row.clone()).unwrap();
                }
                store.close().unwrap();
            },
        )
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encoding,
    bench_locate,
    bench_wal,
    bench_part,
    bench_series_append
);
criterion_main!(benches);
