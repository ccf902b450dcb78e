// Copyright 2025 Shardmap Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Concurrency
//!
//! Segmented locking under parallel writers and readers, and the
//! single-winner guarantee of `put_if_absent`.

use std::sync::Arc;
use std::thread;

use shardmap::{I64Codec, ShardMap, StrCodec};

fn concurrent_map() -> Arc<ShardMap<String, i64>> {
    ShardMap::builder()
        .geometry(3, 4, 2)
        .key_codec(StrCodec)
        .value_codec(I64Codec)
        .enable_counters()
        .build()
        .unwrap()
}

#[test]
fn test_parallel_disjoint_writers() {
    let map = concurrent_map();
    let threads = 8;
    let per_thread = 200i64;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..per_thread {
                    map.put(format!("t{}-{}", t, i), t * per_thread + i).unwrap();
                }
                for i in 0..per_thread {
                    let key = format!("t{}-{}", t, i);
                    assert_eq!(map.get(&key).unwrap(), Some(t * per_thread + i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len().unwrap(), (threads * per_thread) as usize);
    map.verify().unwrap();
}

#[test]
fn test_put_if_absent_single_winner() {
    let map = concurrent_map();
    let threads = 8i64;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || map.put_if_absent("contended".to_string(), t).unwrap())
        })
        .collect();
    let results: Vec<Option<i64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners = results.iter().filter(|r| r.is_none()).count();
    assert_eq!(winners, 1, "exactly one thread must win the insert");

    let stored = map.get(&"contended".to_string()).unwrap().unwrap();
    for result in results {
        if let Some(seen) = result {
            assert_eq!(seen, stored, "losers must observe the winner's value");
        }
    }
}

#[test]
fn test_readers_alongside_writers() {
    let map = concurrent_map();
    for i in 0..100 {
        map.put(format!("stable{}", i), i).unwrap();
    }

    let writer = {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            for round in 0..50i64 {
                for i in 0..20 {
                    map.put(format!("churn{}", i), round).unwrap();
                }
                for i in 0..20 {
                    map.remove(&format!("churn{}", i)).unwrap();
                }
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for _ in 0..200 {
                    for i in 0..100 {
                        assert_eq!(map.get(&format!("stable{}", i)).unwrap(), Some(i));
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(map.len().unwrap(), 100);
    map.verify().unwrap();
}

#[test]
fn test_concurrent_removes_remove_once() {
    let map = concurrent_map();
    for i in 0..200 {
        map.put(format!("k{}", i), i).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let mut removed = 0u32;
                for i in 0..200 {
                    if map.remove_present(&format!("k{}", i)).unwrap() {
                        removed += 1;
                    }
                }
                removed
            })
        })
        .collect();
    let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(total, 200, "every key must be removed exactly once");
    assert!(map.is_empty().unwrap());
    map.verify().unwrap();
}

#[test]
fn test_concurrent_iteration_does_not_panic() {
    let map = concurrent_map();
    for i in 0..500 {
        map.put(format!("k{}", i), i).unwrap();
    }

    let mutator = {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            for i in 0..500 {
                if i % 2 == 0 {
                    map.remove(&format!("k{}", i)).unwrap();
                } else {
                    map.put(format!("k{}", i), -i).unwrap();
                }
            }
        })
    };
    // Best-effort snapshot iteration while the mutator churns
    for _ in 0..10 {
        for item in map.iter() {
            let (_, _) = item.unwrap();
        }
    }
    mutator.join().unwrap();
    map.verify().unwrap();
}
