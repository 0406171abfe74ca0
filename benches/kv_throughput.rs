//! Keyed-map throughput under mixed operations.

use criterion::{Criterion, criterion_group, criterion_main};

use aurora_sls::kv::{SlsSet, SlsTable};

fn bench_kv(c: &mut Criterion) {
    c.bench_function("kv_add_find_del", |b| {
        b.iter(|| {
            let table: SlsTable<u64> = SlsTable::new();
            for k in 0..1024u64 {
                table.add(k, k.wrapping_mul(0x9e37_79b9)).unwrap();
            }
            for k in 0..1024u64 {
                std::hint::black_box(table.find(k));
            }
            for k in (0..1024u64).step_by(2) {
                table.del(k);
            }
            std::hint::black_box(table.len())
        })
    });

    c.bench_function("kv_pop_drain", |b| {
        b.iter(|| {
            let set = SlsSet::new();
            for k in 0..1024u64 {
                set.insert(k).unwrap();
            }
            while set.pop_key().is_some() {}
        })
    });
}

criterion_group!(benches, bench_kv);
criterion_main!(benches);
