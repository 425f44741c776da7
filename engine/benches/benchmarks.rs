//! Performance benchmarks for weft-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use indexmap::IndexMap;
use weft_engine::{
    apply_update, decode_value, encode_state_as_update, encode_value, Doc, NumArray, Value,
};

fn det_doc(priority: u32, id_base: u64) -> Doc {
    let mut doc = Doc::new();
    doc.set_resolve_priority(priority);
    let mut next = id_base;
    doc.set_id_source(move || {
        next += 1;
        next
    });
    doc
}

/// A value with nesting, strings, and typed arrays, shaped like a small
/// world snapshot.
fn sample_value(entities: usize) -> Value {
    let mut root = IndexMap::new();
    for i in 0..entities {
        let mut entity = IndexMap::new();
        entity.insert("name".to_string(), Value::Str(format!("entity_{i}")));
        entity.insert(
            "position".to_string(),
            Value::NumArray(NumArray::F32(vec![i as f32, 0.0, -1.5])),
        );
        entity.insert(
            "tags".to_string(),
            Value::List(vec![Value::Str("alive".into()), Value::Int(i as i64)]),
        );
        root.insert(format!("e{i}"), Value::Map(entity));
    }
    Value::Map(root)
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for entities in [1usize, 16, 256] {
        let value = sample_value(entities);
        let encoded = encode_value(&value).unwrap();

        group.bench_with_input(BenchmarkId::new("encode", entities), &value, |b, value| {
            b.iter(|| encode_value(black_box(value)).unwrap())
        });
        group.bench_with_input(
            BenchmarkId::new("decode", entities),
            &encoded,
            |b, encoded| b.iter(|| decode_value(black_box(encoded)).unwrap()),
        );
    }

    group.finish();
}

fn bench_local_mutation(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_mutation");

    group.bench_function("map_set", |b| {
        let mut doc = det_doc(1, 0);
        let map = doc.get_map("bench").unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            map.set(&mut doc, format!("k{}", i % 128), black_box(i as i64))
                .unwrap()
        })
    });

    group.bench_function("array_push", |b| {
        let mut doc = det_doc(1, 0);
        let array = doc.get_array("bench").unwrap();
        b.iter(|| array.push(&mut doc, vec![black_box(Value::Int(7))]).unwrap())
    });

    group.bench_function("transact_16_sets", |b| {
        let mut doc = det_doc(1, 0);
        let map = doc.get_map("bench").unwrap();
        b.iter(|| {
            doc.transact(|doc| {
                for i in 0..16 {
                    map.set(doc, format!("k{i}"), i)?;
                }
                Ok(())
            })
            .unwrap()
        })
    });

    group.finish();
}

fn bench_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync");

    group.bench_function("apply_transaction_in_order", |b| {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut source = det_doc(1, 0);
        let updates = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&updates);
        source.observe_update(move |bytes, _| seen.borrow_mut().push(bytes.to_vec()));
        let map = source.get_map("bench").unwrap();
        for i in 0..256 {
            map.set(&mut source, format!("k{i}"), i).unwrap();
        }
        let updates = updates.borrow();

        b.iter(|| {
            let mut sink = det_doc(2, 1_000_000);
            for bytes in updates.iter() {
                apply_update(&mut sink, black_box(bytes), None).unwrap();
            }
            sink.clock()
        })
    });

    group.bench_function("state_snapshot_round_trip", |b| {
        let mut source = det_doc(1, 0);
        let map = source.get_map("world").unwrap();
        for i in 0..64 {
            map.set(&mut source, format!("e{i}"), sample_value(1)).unwrap();
        }

        b.iter(|| {
            let snapshot = encode_state_as_update(black_box(&source)).unwrap();
            let mut sink = det_doc(2, 1_000_000);
            apply_update(&mut sink, &snapshot, None).unwrap();
            sink.clock()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_local_mutation, bench_sync);
criterion_main!(benches);
