use mama_bridge::Core::{BridgeError, CallbackStore, Closure};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn closure_of(value: &'static str) -> Closure {
    Some(Arc::new(value))
}

fn closure_str(closure: &Closure) -> Option<&'static str> {
    closure.as_ref().and_then(|c| c.downcast_ref::<&'static str>()).copied()
}

#[test]
fn register_resolve_scenario() {
    let store: CallbackStore<&'static str, ()> = CallbackStore::new("scenario");

    let k1 = store.register("A", closure_of("X"), ());
    let k2 = store.register("B", closure_of("Y"), ());
    assert_eq!(k1, 1);
    assert_eq!(k2, 2);

    let (cb, closure) = store.resolve_and_remove(k1).unwrap();
    assert_eq!(cb, "A");
    assert_eq!(closure_str(&closure), Some("X"));

    assert_eq!(store.resolve_and_remove(k1).unwrap_err(), BridgeError::KeyNotFound(k1));

    let (cb, closure) = store.resolve_and_remove(k2).unwrap();
    assert_eq!(cb, "B");
    assert_eq!(closure_str(&closure), Some("Y"));
    assert!(store.is_empty());
    assert_eq!(store.misses(), 1);
}

#[test]
fn keys_increase_monotonically() {
    let store: CallbackStore<u32, ()> = CallbackStore::new("monotonic");
    let mut last = 0;
    for i in 0..1000 {
        let key = store.register(i, None, ());
        assert!(key > last, "key {} not above {}", key, last);
        last = key;
        // Resolving never frees a key for reuse
        if i % 3 == 0 {
            store.resolve_and_remove(key).unwrap();
        }
    }
    println!("last key: {}, pending: {}", last, store.len());
}

#[test]
fn repeating_lookup_keeps_entry() {
    let store: CallbackStore<u32, ()> = CallbackStore::new("repeating");
    let key = store.register(7, closure_of("tick"), ());
    for _ in 0..5 {
        let (cb, closure) = store.get(key).unwrap();
        assert_eq!(cb, 7);
        assert_eq!(closure_str(&closure), Some("tick"));
    }
    assert!(store.contains(key));
    store.resolve_and_remove(key).unwrap();
    assert!(store.get(key).is_err());
}

#[test]
fn dispose_all_releases_everything() {
    let store: CallbackStore<Arc<u32>, ()> = CallbackStore::new("dispose");
    let payload = Arc::new(5);
    for _ in 0..10 {
        store.register(payload.clone(), None, ());
    }
    assert_eq!(Arc::strong_count(&payload), 11);
    assert_eq!(store.dispose_all(), 10);
    assert_eq!(Arc::strong_count(&payload), 1);
    assert_eq!(store.dispose_all(), 0);
}

#[test]
fn concurrent_register_yields_distinct_keys() {
    let threads = 64;
    let per_thread = 10_000;
    let store: Arc<CallbackStore<usize, ()>> = Arc::new(CallbackStore::new("stress"));

    let mut handles = vec![];
    for t in 0..threads {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            (0..per_thread)
                .map(|i| store.register(t * per_thread + i, None, ()))
                .collect::<Vec<_>>()
        }));
    }

    let mut keys = HashSet::with_capacity(threads * per_thread);
    for handle in handles {
        for key in handle.join().unwrap() {
            assert!(keys.insert(key), "duplicate key {}", key);
        }
    }
    println!("registered {} keys across {} threads", keys.len(), threads);
    assert_eq!(keys.len(), threads * per_thread);
    assert_eq!(store.len(), threads * per_thread);

    // Every payload comes back exactly once
    let mut payloads = HashSet::with_capacity(keys.len());
    for key in keys {
        let (payload, _) = store.resolve_and_remove(key).unwrap();
        assert!(payloads.insert(payload));
    }
    assert!(store.is_empty());
}

#[test]
fn concurrent_resolve_in_random_order() {
    let store: Arc<CallbackStore<u64, ()>> = Arc::new(CallbackStore::new("random"));
    let mut keys: Vec<u64> = (0..4_000).map(|i| store.register(i, None, ())).collect();
    fastrand::shuffle(&mut keys);

    let chunks: Vec<Vec<u64>> = keys.chunks(500).map(|c| c.to_vec()).collect();
    let mut handles = vec![];
    for chunk in chunks {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            chunk
                .into_iter()
                .filter(|key| store.resolve_and_remove(*key).is_ok())
                .count()
        }));
    }
    let resolved: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(resolved, 4_000);
    assert!(store.is_empty());
    assert_eq!(store.misses(), 0);
}
