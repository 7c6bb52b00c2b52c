//! Performance benchmarks for forkdb
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::prelude::*;
use std::sync::Arc;

use forkdb::chain::{Account, Blockchain, Options};
use forkdb::data::{BitFilter, EntryTag, Key, NibblePath, Pool, SpanDict};
use forkdb::merkle::FlatDigestRoot;
use forkdb::store::PagedDb;
use primitive_types::{H256, U256};

fn random_hash(rng: &mut impl Rng) -> H256 {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    H256::from(bytes)
}

/// Benchmark key encoding and hashing
fn bench_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("Key");
    let mut rng = StdRng::seed_from_u64(7);
    let address = random_hash(&mut rng);
    let slot = random_hash(&mut rng);

    group.bench_function("account_hash64", |b| {
        b.iter(|| Key::account(black_box(&address)).hash64())
    });
    group.bench_function("storage_encode", |b| {
        let key = Key::storage_cell(&address, &slot);
        let mut buf = [0u8; Key::MAX_BYTE_LENGTH];
        b.iter(|| key.write_to(black_box(&mut buf)).len())
    });
    group.bench_function("nibble_path_from_hash", |b| {
        b.iter(|| NibblePath::from_hash(black_box(&address)))
    });

    group.finish();
}

/// Benchmark SpanDict operations
fn bench_span_dict(c: &mut Criterion) {
    let mut group = c.benchmark_group("SpanDict");
    let pool = Pool::new();

    for size in [100usize, 1000, 5000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("set", size), &size, |b, &size| {
            b.iter(|| {
                let mut dict = SpanDict::new(&pool);
                for i in 0..size as u64 {
                    let key = i.to_be_bytes();
                    dict.set(&key, i, &[0xAB; 64], EntryTag::Persistent);
                }
                dict
            })
        });
    }

    let mut dict = SpanDict::new(&pool);
    for i in 0..10_000u64 {
        dict.set(&i.to_be_bytes(), i, &[0xAB; 64], EntryTag::Persistent);
    }
    group.bench_function("try_get_hit", |b| {
        b.iter(|| dict.try_get(black_box(&42u64.to_be_bytes()), black_box(42)))
    });
    group.bench_function("try_get_miss", |b| {
        b.iter(|| dict.try_get(black_box(&99_999u64.to_be_bytes()), black_box(99_999)))
    });

    group.finish();
}

/// Benchmark BitFilter operations
fn bench_bit_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("BitFilter");
    let pool = Pool::new();
    let filter = BitFilter::new(&pool);
    for i in 0..50_000u64 {
        filter.add(i.wrapping_mul(0x9E3779B97F4A7C15));
    }

    group.bench_function("may_contain", |b| {
        b.iter(|| filter.may_contain(black_box(0xDEADBEEF)))
    });
    group.bench_function("add_atomic", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = i.wrapping_add(0x9E3779B97F4A7C15);
            filter.add_atomic(black_box(i))
        })
    });

    group.finish();
}

/// Benchmark block reads across an ancestor chain
fn bench_chain_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("Blockchain");
    let db = Arc::new(PagedDb::in_memory(8));
    let chain = Blockchain::new(db, Arc::new(FlatDigestRoot), Options::default());

    let mut rng = StdRng::seed_from_u64(11);
    let addresses: Vec<H256> = (0..256).map(|_| random_hash(&mut rng)).collect();

    let mut parent = H256::zero();
    for n in 1..=4u64 {
        let mut block = chain.start_new(parent).unwrap();
        for (i, address) in addresses.iter().enumerate() {
            if i as u64 % 4 == n - 1 {
                block.set_account(address, &Account::with_balance(U256::from(i)));
            }
        }
        parent = block.commit(n).unwrap();
    }

    let mut head = chain.start_new(parent).unwrap();
    group.bench_function("get_account_across_ancestors", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % addresses.len();
            head.get_account(black_box(&addresses[i]))
        })
    });
    group.bench_function("get_account_untouched", |b| {
        let missing = random_hash(&mut rng);
        b.iter(|| head.get_account(black_box(&missing)))
    });
    group.finish();

    drop(head);
    chain.close();
}

criterion_group!(
    benches,
    bench_key,
    bench_span_dict,
    bench_bit_filter,
    bench_chain_reads
);
criterion_main!(benches);
