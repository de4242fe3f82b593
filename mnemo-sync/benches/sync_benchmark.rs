use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mnemo_sync::document::ContainerKind;
use mnemo_sync::{
    reconcile_sorted, DurableCache, KvFrame, ReplicatedDocument, StorageKey, Store, StoreConfig,
};
use serde_json::{json, Value};

fn tasks(ids: impl Iterator<Item = usize>) -> Vec<Value> {
    ids.map(|i| json!({ "id": format!("task-{i:04}"), "done": i % 3 == 0 }))
        .collect()
}

fn bench_reconcile_sorted(c: &mut Criterion) {
    let key = StorageKey::new("tasks").unwrap();
    // Reversed order forces one move per element.
    let initial = tasks((0..200).rev());
    let desired = tasks(0..200);

    c.bench_function("reconcile_sorted_200_reversed", |b| {
        b.iter(|| {
            let doc = ReplicatedDocument::new();
            let mut list = doc.get_or_create_sorted_list(&key).unwrap();
            for (i, item) in initial.iter().enumerate() {
                list.insert(i, mnemo_sync::document::convert::to_loro(item))
                    .unwrap();
            }
            let live = doc.materialize(&key, ContainerKind::SortedList);
            let live = live.as_array().cloned().unwrap_or_default();
            black_box(reconcile_sorted(live, black_box(&desired), "id", &mut list).unwrap());
        })
    });
}

fn bench_kv_frame_codec(c: &mut Criterion) {
    let frame = KvFrame::new("settings/theme", json!({"mode": "dark", "accent": 3}), 1_700_000_000_000);
    let encoded = frame.encode().unwrap();

    c.bench_function("kv_frame_encode", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
    c.bench_function("kv_frame_decode", |b| {
        b.iter(|| black_box(KvFrame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_apply_if_newer(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
    let cache = DurableCache::new(&store);
    let key = StorageKey::new("profile/name").unwrap();
    let value = json!("Ada");
    let mut ts = 0u64;

    c.bench_function("apply_remote_newer", |b| {
        b.iter(|| {
            ts += 1;
            black_box(cache.apply_remote(&key, &value, ts).unwrap());
        })
    });
    c.bench_function("apply_remote_stale", |b| {
        b.iter(|| black_box(cache.apply_remote(&key, &value, 0).unwrap()))
    });
}

fn bench_snapshot_export(c: &mut Criterion) {
    let doc = ReplicatedDocument::new();
    let key = StorageKey::new("notes/long.md").unwrap();
    let text = doc.get_or_create_text(&key).unwrap();
    text.insert(0, &"lorem ipsum ".repeat(500)).unwrap();
    doc.commit();

    c.bench_function("snapshot_export_6KB_text", |b| {
        b.iter(|| black_box(doc.export_snapshot().unwrap()))
    });
}

criterion_group!(
    benches,
    bench_reconcile_sorted,
    bench_kv_frame_codec,
    bench_apply_if_newer,
    bench_snapshot_export,
);
criterion_main!(benches);
