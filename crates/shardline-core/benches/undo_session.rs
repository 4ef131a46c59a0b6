//! Undo session throughput on the object store

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use shardline_core::config::MAIN_SHARD;
use shardline_core::objects::AccountObject;
use shardline_core::store::{Database, DatabaseManager};
use shardline_core::types::TimePoint;
use shardline_core::Name;

fn name(i: u64) -> Name {
    Name::from_raw((i + 1) << 4)
}

fn populated(rows: u64) -> Database {
    let mut db = Database::new();
    for i in 0..rows {
        db.create::<AccountObject>(|a| a.name = name(i)).unwrap();
    }
    db
}

fn bench_modify_then_undo(c: &mut Criterion) {
    c.bench_function("modify_undo_1k", |b| {
        b.iter_batched(
            || populated(1_000),
            |mut db| {
                db.start_undo_session(true).push();
                for i in 0..1_000 {
                    let id = db.find_by_key::<AccountObject>(&name(i)).unwrap();
                    db.modify::<AccountObject>(id, |a| a.code_sequence += 1).unwrap();
                }
                db.undo();
                black_box(db.revision())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_nested_squash(c: &mut Criterion) {
    c.bench_function("nested_squash_100", |b| {
        b.iter_batched(
            || populated(100),
            |mut db| {
                db.start_undo_session(true).push();
                for i in 0..100 {
                    db.start_undo_session(true).push();
                    let id = db.find_by_key::<AccountObject>(&name(i)).unwrap();
                    db.modify::<AccountObject>(id, |a| a.abi_sequence += 1).unwrap();
                    db.squash();
                }
                black_box(db.undo_stack_len())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_tiered_create(c: &mut Criterion) {
    c.bench_function("tiered_create_account_100", |b| {
        b.iter(|| {
            let mut dbm = DatabaseManager::new();
            let mut session = dbm.start_undo_session(MAIN_SHARD, true).unwrap();
            for i in 0..100 {
                session
                    .create_account(MAIN_SHARD, name(i), TimePoint::default(), false)
                    .unwrap();
            }
            session.push();
            black_box(dbm.shared_db().len::<AccountObject>())
        })
    });
}

criterion_group!(benches, bench_modify_then_undo, bench_nested_squash, bench_tiered_create);
criterion_main!(benches);
