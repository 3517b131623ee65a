/// Many threads hammering a small cache, then a leak check on the backend.

use std::sync::{Arc, Barrier};
use std::thread;

use offheap_lru::entry::alloc_len;
use offheap_lru::{CacheBuilder, TrackingBackend};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const THREADS: usize = 8;
const OPS_PER_THREAD: usize = 20_000;
const KEYS: u32 = 2_000;

#[test]
fn test_mixed_workload_leaks_nothing() {
    let mem = Arc::new(TrackingBackend::new());
    let cache = CacheBuilder::new()
        .segment_count(4)
        .hash_table_size(8)
        // roughly a quarter of the key space fits
        .capacity(alloc_len(4, 64) * KEYS as u64 / 4)
        .backend(Arc::clone(&mem))
        .build();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                barrier.wait();

                for _ in 0..OPS_PER_THREAD {
                    let id: u32 = rng.gen_range(0..KEYS);
                    let key = id.to_be_bytes();
                    match rng.gen_range(0..10) {
                        0..=4 => {
                            if let Some(guard) = cache.get(&key) {
                                // values always carry their own key
                                assert_eq!(&guard.value()[..4], &key);
                            }
                        }
                        5..=7 => {
                            let len = rng.gen_range(4..64);
                            let mut value = vec![0u8; len];
                            value[..4].copy_from_slice(&key);
                            cache.put(&key, &value).unwrap();
                        }
                        8 => {
                            cache.remove(&key);
                        }
                        _ => {
                            cache.evict_for_capacity(1024);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    cache.check_invariants().unwrap();
    let stats = cache.stats();
    assert!(stats.used_bytes <= stats.capacity);
    assert_eq!(mem.outstanding() as u64, stats.entries);

    drop(cache);
    mem.assert_empty();
}

#[test]
fn test_readers_hold_entries_across_replacement() {
    let mem = Arc::new(TrackingBackend::new());
    let cache = CacheBuilder::new()
        .segment_count(1)
        .backend(Arc::clone(&mem))
        .build();
    cache.put(b"shared", &0u64.to_be_bytes()).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS + 1));
    let readers: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut last = 0;
                for _ in 0..10_000 {
                    let guard = cache.get(b"shared").unwrap();
                    let value = u64::from_be_bytes(guard.value().try_into().unwrap());
                    // a guard never observes a torn or older value than before
                    assert!(value >= last);
                    last = value;
                }
            })
        })
        .collect();

    barrier.wait();
    for i in 1..=10_000u64 {
        cache.put(b"shared", &i.to_be_bytes()).unwrap();
    }

    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(cache.len(), 1);
    assert_eq!(mem.outstanding(), 1);
    drop(cache);
    mem.assert_empty();
}

#[test]
fn test_disjoint_writers_all_land() {
    let cache = CacheBuilder::new()
        .segment_count(8)
        .hash_table_size(2)
        .build();

    let handles: Vec<_> = (0..THREADS as u32)
        .map(|t| {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..5_000u32 {
                    let key = (t * 5_000 + i).to_be_bytes();
                    assert!(!cache.put(&key, &key).unwrap());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.len(), THREADS as u64 * 5_000);
    assert!(cache.rehash_count() > 0);
    for k in 0..(THREADS as u32 * 5_000) {
        let key = k.to_be_bytes();
        assert_eq!(cache.get(&key).unwrap().value(), &key);
    }
    cache.check_invariants().unwrap();
}
