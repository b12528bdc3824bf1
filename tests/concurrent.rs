//! # Concurrency Stress Tests
//!
//! Multi-threaded exercises of the collection: parallel writers over
//! disjoint and contended key ranges, lock-free readers racing updates,
//! and a background cleaner sweeping while writers churn. Assertions run
//! at quiescence (size faithfulness, index audit, last-writer-wins values)
//! plus inline invariants readers can check mid-flight (an updated key is
//! never observed missing).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use hivekv::{Store, StoreConfig, StoreError};

fn stress_store() -> Arc<Store> {
    Arc::new(
        Store::open(StoreConfig {
            arena_capacity: 1 << 24,
            ..Default::default()
        })
        .unwrap(),
    )
}

#[test]
fn parallel_writers_on_disjoint_keys() {
    const THREADS: usize = 8;
    const KEYS_PER_THREAD: usize = 64;

    let store = stress_store();
    let coll = store.create_collection(b"c").unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            let coll = Arc::clone(&coll);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let worker = store.register_worker().unwrap();
                barrier.wait();
                for i in 0..KEYS_PER_THREAD {
                    let key = format!("t{t}-k{i}");
                    let value = format!("t{t}-v{i}");
                    coll.put(&worker, key.as_bytes(), value.as_bytes(), store.new_timestamp())
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(coll.size(), (THREADS * KEYS_PER_THREAD) as u64);
    assert!(coll.check_index().is_ok());
    for t in 0..THREADS {
        for i in 0..KEYS_PER_THREAD {
            let key = format!("t{t}-k{i}");
            assert_eq!(coll.get(key.as_bytes()).unwrap(), format!("t{t}-v{i}").as_bytes());
        }
    }
}

#[test]
fn contended_writers_keep_per_key_order() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;
    const KEYS: usize = 4;

    let store = stress_store();
    let coll = store.create_collection(b"c").unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));
    let highest: Arc<Vec<AtomicU64>> =
        Arc::new((0..KEYS).map(|_| AtomicU64::new(0)).collect());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            let coll = Arc::clone(&coll);
            let barrier = Arc::clone(&barrier);
            let highest = Arc::clone(&highest);
            thread::spawn(move || {
                let worker = store.register_worker().unwrap();
                barrier.wait();
                for round in 0..ROUNDS {
                    let key = format!("k{}", (t + round) % KEYS);
                    // A racing writer may win a later timestamp first; the
                    // rejected write retries with a fresh stamp.
                    loop {
                        let ts = store.new_timestamp();
                        let value = ts.to_le_bytes();
                        match coll.put(&worker, key.as_bytes(), &value, ts) {
                            Ok(_) => {
                                highest[(t + round) % KEYS].fetch_max(ts, Ordering::Relaxed);
                                break;
                            }
                            Err(StoreError::InvalidArgument) => continue,
                            Err(other) => panic!("unexpected write error: {other}"),
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(coll.size(), KEYS as u64);
    assert!(coll.check_index().is_ok());
    for (i, max_ts) in highest.iter().enumerate() {
        let stored = coll.get(format!("k{i}").as_bytes()).unwrap();
        let stored_ts = u64::from_le_bytes(stored.as_slice().try_into().unwrap());
        assert_eq!(stored_ts, max_ts.load(Ordering::Relaxed));
    }
}

#[test]
fn readers_never_lose_an_updated_key() {
    const READERS: usize = 4;
    const UPDATES: usize = 500;

    let store = stress_store();
    let coll = store.create_collection(b"c").unwrap();
    let writer_worker = store.register_worker().unwrap();
    coll.put(&writer_worker, b"hot", b"0", store.new_timestamp())
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let coll = Arc::clone(&coll);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut last_seen = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    // the key is updated, never deleted: a miss would mean a
                    // reader observed a torn replace
                    let value = coll.get(b"hot").expect("hot key must stay visible");
                    let seen: u64 = std::str::from_utf8(&value).unwrap().parse().unwrap();
                    assert!(seen >= last_seen, "reader went back in time");
                    last_seen = seen;
                }
            })
        })
        .collect();

    for i in 1..=UPDATES {
        coll.put(
            &writer_worker,
            b"hot",
            i.to_string().as_bytes(),
            store.new_timestamp(),
        )
        .unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for handle in readers {
        handle.join().unwrap();
    }

    assert_eq!(coll.get(b"hot").unwrap(), UPDATES.to_string().as_bytes());
    assert!(coll.check_index().is_ok());
}

#[test]
fn cleaner_races_writers_safely() {
    const WRITERS: usize = 4;
    const ROUNDS: usize = 300;

    let store = stress_store();
    let coll = store.create_collection(b"c").unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let cleaner_handle = {
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                store.cleaner().try_clean_all();
                thread::yield_now();
            }
        })
    };

    let writers: Vec<_> = (0..WRITERS)
        .map(|t| {
            let store = Arc::clone(&store);
            let coll = Arc::clone(&coll);
            thread::spawn(move || {
                let worker = store.register_worker().unwrap();
                for round in 0..ROUNDS {
                    let key = format!("t{t}-k{}", round % 8);
                    coll.put(&worker, key.as_bytes(), b"value", store.new_timestamp())
                        .unwrap();
                    if round % 3 == 0 {
                        coll.delete(&worker, key.as_bytes(), store.new_timestamp())
                            .unwrap();
                    }
                    store.cleaner().try_clean_cached(&worker, 8);
                }
            })
        })
        .collect();
    for handle in writers {
        handle.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    cleaner_handle.join().unwrap();

    // drain everything still queued, then audit
    store.cleaner().try_clean_all();
    store.cleaner().try_clean_all();
    store.cleaner().try_clean_all();
    assert!(coll.check_index().is_ok());

    for t in 0..WRITERS {
        for k in 0..8 {
            let key = format!("t{t}-k{k}");
            // last operation per key is deterministic from the round count
            let last_round = (0..ROUNDS).rev().find(|r| r % 8 == k).unwrap();
            let expect_deleted = last_round % 3 == 0;
            match coll.get(key.as_bytes()) {
                Ok(value) => {
                    assert!(!expect_deleted, "key {key} should be deleted");
                    assert_eq!(value, b"value");
                }
                Err(StoreError::NotFound) => {
                    assert!(expect_deleted, "key {key} should be present");
                }
                Err(other) => panic!("unexpected read error: {other}"),
            }
        }
    }
}

#[test]
fn snapshot_readers_race_reclamation() {
    const ROUNDS: usize = 200;

    let store = stress_store();
    let coll = store.create_collection(b"c").unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let reader_handle = {
        let store = Arc::clone(&store);
        let coll = Arc::clone(&coll);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let _snap = store.hold_snapshot().unwrap();
                // under a snapshot, whatever the index hands us stays
                // dereferenceable even while the cleaner churns
                match coll.get(b"hot") {
                    Ok(value) => assert_eq!(&value[..2], b"v-"),
                    Err(StoreError::NotFound) => {}
                    Err(other) => panic!("unexpected read error: {other}"),
                }
            }
        })
    };

    let worker = store.register_worker().unwrap();
    for round in 0..ROUNDS {
        coll.put(
            &worker,
            b"hot",
            format!("v-{round}").as_bytes(),
            store.new_timestamp(),
        )
        .unwrap();
        if round % 5 == 0 {
            coll.delete(&worker, b"hot", store.new_timestamp()).unwrap();
        }
        store.cleaner().try_clean_all();
    }
    stop.store(true, Ordering::Relaxed);
    reader_handle.join().unwrap();

    store.cleaner().try_clean_all();
    store.cleaner().try_clean_all();
    assert!(coll.check_index().is_ok());
}
