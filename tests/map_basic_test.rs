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

//! Basic map semantics
//!
//! Covers the core put/get/remove/replace contract on a small geometry,
//! clear modes with listener notifications, key-set mode and the live
//! views.

use std::sync::Arc;
use std::sync::Mutex;

use shardmap::{
    ClearMode, I64Codec, ModificationListener, ShardMap, StrCodec, UnitCodec,
};

type Event = (String, Option<i64>, Option<i64>, bool);

/// Records every modification for later inspection
struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl ModificationListener<String, i64> for Recorder {
    fn modify(&self, key: &String, old: Option<&i64>, new: Option<&i64>, triggered: bool) {
        self.events
            .lock()
            .unwrap()
            .push((key.clone(), old.copied(), new.copied(), triggered));
    }
}

fn basic_map() -> Arc<ShardMap<String, i64>> {
    ShardMap::builder()
        .geometry(2, 4, 2)
        .key_codec(StrCodec)
        .value_codec(I64Codec)
        .build()
        .expect("build failed")
}

#[test]
fn test_put_get_remove_size() {
    let map = basic_map();
    map.put("a".to_string(), 1).unwrap();
    map.put("b".to_string(), 2).unwrap();
    map.put("c".to_string(), 3).unwrap();

    assert_eq!(map.len().unwrap(), 3);
    assert_eq!(map.get(&"b".to_string()).unwrap(), Some(2));
    assert_eq!(map.remove(&"a".to_string()).unwrap(), Some(1));
    assert_eq!(map.get(&"a".to_string()).unwrap(), None);
    assert_eq!(map.len().unwrap(), 2);
    map.verify().unwrap();
}

#[test]
fn test_overwrite_returns_previous() {
    let map = basic_map();
    assert_eq!(map.put("k".to_string(), 10).unwrap(), None);
    assert_eq!(map.put("k".to_string(), 20).unwrap(), Some(10));
    assert_eq!(map.len().unwrap(), 1);
}

#[test]
fn test_many_entries_across_segments() {
    let map = basic_map();
    for i in 0..500i64 {
        map.put(format!("key-{}", i), i).unwrap();
    }
    assert_eq!(map.len().unwrap(), 500);
    for i in 0..500i64 {
        assert_eq!(map.get(&format!("key-{}", i)).unwrap(), Some(i));
        assert!(map.contains_key(&format!("key-{}", i)).unwrap());
    }
    for i in (0..500i64).step_by(2) {
        assert_eq!(map.remove(&format!("key-{}", i)).unwrap(), Some(i));
    }
    assert_eq!(map.len().unwrap(), 250);
    map.verify().unwrap();
}

#[test]
fn test_listener_sequence() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let map = ShardMap::builder()
        .geometry(1, 4, 2)
        .key_codec(StrCodec)
        .value_codec(I64Codec)
        .listener(Recorder {
            events: Arc::clone(&events),
        })
        .build()
        .unwrap();

    map.put("k".to_string(), 1).unwrap();
    map.put("k".to_string(), 2).unwrap();
    map.remove(&"k".to_string()).unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            ("k".to_string(), None, Some(1), false),
            ("k".to_string(), Some(1), Some(2), false),
            ("k".to_string(), Some(2), None, false),
        ]
    );
}

#[test]
fn test_clear_modes() {
    for (mode, expect_events, expect_triggered) in [
        (ClearMode::Silent, false, false),
        (ClearMode::Notify, true, false),
        (ClearMode::AsExpired, true, true),
    ] {
        let events = Arc::new(Mutex::new(Vec::new()));
        let map = ShardMap::builder()
            .geometry(2, 4, 2)
            .key_codec(StrCodec)
            .value_codec(I64Codec)
            .listener(Recorder {
                events: Arc::clone(&events),
            })
            .build()
            .unwrap();
        map.put("a".to_string(), 1).unwrap();
        map.put("b".to_string(), 2).unwrap();
        events.lock().unwrap().clear();

        map.clear_with(mode).unwrap();
        assert!(map.is_empty().unwrap());
        assert_eq!(map.len().unwrap(), 0);

        let events = events.lock().unwrap();
        if expect_events {
            assert_eq!(events.len(), 2, "one event per removed entry");
            for (_, old, new, triggered) in events.iter() {
                assert!(old.is_some());
                assert_eq!(*new, None);
                assert_eq!(*triggered, expect_triggered);
            }
        } else {
            assert!(events.is_empty(), "silent clear must not notify");
        }
    }
}

#[test]
fn test_clear_resets_queues_and_counters() {
    let map = ShardMap::builder()
        .geometry(1, 4, 2)
        .key_codec(StrCodec)
        .value_codec(I64Codec)
        .expire_create_ttl(60_000)
        .enable_counters()
        .build()
        .unwrap();
    for i in 0..20 {
        map.put(format!("k{}", i), i).unwrap();
    }
    map.clear().unwrap();
    assert!(map.is_empty().unwrap());
    assert_eq!(map.len().unwrap(), 0);
    map.verify().unwrap();
    // The map stays usable after a clear
    map.put("again".to_string(), 7).unwrap();
    assert_eq!(map.len().unwrap(), 1);
    map.verify().unwrap();
}

#[test]
fn test_key_set() {
    let set = ShardMap::<String, ()>::builder()
        .geometry(1, 4, 2)
        .key_codec(StrCodec)
        .value_codec(UnitCodec)
        .key_set()
        .build()
        .unwrap();
    assert!(set.add_key("alpha".to_string()).unwrap());
    assert!(set.add_key("beta".to_string()).unwrap());
    assert!(!set.add_key("alpha".to_string()).unwrap());
    assert_eq!(set.len().unwrap(), 2);
    assert!(set.contains_key(&"alpha".to_string()).unwrap());
    assert!(set.remove_present(&"alpha".to_string()).unwrap());
    assert_eq!(set.len().unwrap(), 1);
    set.verify().unwrap();
}

#[test]
fn test_views_and_structural_comparison() {
    let map = basic_map();
    let other = basic_map();
    for (k, v) in [("a", 1i64), ("b", 2), ("c", 3)] {
        map.put(k.to_string(), v).unwrap();
        other.put(k.to_string(), v).unwrap();
    }

    assert!(map.contains_value(&2).unwrap());
    assert!(!map.contains_value(&9).unwrap());
    assert!(map.contains_entry(&"a".to_string(), &1).unwrap());
    assert!(!map.contains_entry(&"a".to_string(), &2).unwrap());

    assert_eq!(map.content_hash().unwrap(), other.content_hash().unwrap());
    assert!(map.content_eq(&other).unwrap());
    other.remove(&"c".to_string()).unwrap();
    assert!(!map.content_eq(&other).unwrap());

    let mut collected = 0;
    map.for_each(|_, _| collected += 1).unwrap();
    assert_eq!(collected, 3);
}

#[test]
fn test_value_loader_inserts_on_miss() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let map = ShardMap::builder()
        .geometry(1, 4, 2)
        .key_codec(StrCodec)
        .value_codec(I64Codec)
        .listener(Recorder {
            events: Arc::clone(&events),
        })
        .value_loader(|key: &String| {
            if key.starts_with("load") {
                Some(key.len() as i64)
            } else {
                None
            }
        })
        .build()
        .unwrap();

    // Loader synthesizes the value and inserts it, flagged as triggered
    assert_eq!(map.get(&"load-me".to_string()).unwrap(), Some(7));
    assert!(map.contains_key(&"load-me".to_string()).unwrap());
    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], ("load-me".to_string(), None, Some(7), true));
    }

    // Present keys do not consult the loader
    map.put("direct".to_string(), 100).unwrap();
    assert_eq!(map.get(&"direct".to_string()).unwrap(), Some(100));

    // A loader miss stays a miss
    assert_eq!(map.get(&"other".to_string()).unwrap(), None);
    assert!(!map.contains_key(&"other".to_string()).unwrap());
}
