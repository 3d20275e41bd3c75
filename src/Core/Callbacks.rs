// Callback registration table.
//
// Keeps the Rust side of an asynchronous native call alive between the
// moment the call is issued and the moment its trampoline fires. The key is
// what crosses the boundary as the opaque closure argument.

use super::error::{BridgeError, CallbackKey, Result};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// User-supplied value threaded through an async call and handed back
/// unchanged at completion.
pub type Closure = Option<Arc<dyn Any + Send + Sync>>;

/// One outstanding asynchronous call.
pub struct Registration<C, T> {
    pub callback: C,
    pub closure: Closure,
    /// Native entry point the engine was given for this call.
    pub trampoline: T,
}

struct StoreInner<C, T> {
    next_key: CallbackKey,
    entries: HashMap<CallbackKey, Registration<C, T>>,
}

/// Mutex-protected map from integer keys to pending registrations.
///
/// `C` is the callback type, `T` the trampoline the engine invokes.
pub struct CallbackStore<C, T> {
    name: &'static str,
    inner: Mutex<StoreInner<C, T>>,
    /// Lookups for keys that were never issued or already resolved.
    misses: CachePadded<AtomicU64>,
}

impl<C, T> CallbackStore<C, T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(StoreInner {
                next_key: 1,
                entries: HashMap::new(),
            }),
            misses: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Store a registration and return the key to hand to the engine.
    pub fn register(&self, callback: C, closure: Closure, trampoline: T) -> CallbackKey {
        let mut inner = self.inner.lock();
        let key = inner.next_key;
        inner.next_key += 1;
        inner.entries.insert(
            key,
            Registration {
                callback,
                closure,
                trampoline,
            },
        );
        trace!(store = self.name, key, "callback registered");
        key
    }

    /// Remove a registration and return its callback and closure.
    ///
    /// A second call for the same key fails with `KeyNotFound`.
    pub fn resolve_and_remove(&self, key: CallbackKey) -> Result<(C, Closure)> {
        self.remove(key).map(|reg| (reg.callback, reg.closure))
    }

    /// Remove a registration, trampoline included.
    pub fn remove(&self, key: CallbackKey) -> Result<Registration<C, T>> {
        let removed = self.inner.lock().entries.remove(&key);
        match removed {
            Some(reg) => {
                trace!(store = self.name, key, "callback resolved");
                Ok(reg)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(BridgeError::KeyNotFound(key))
            }
        }
    }

    pub fn contains(&self, key: CallbackKey) -> bool {
        self.inner.lock().entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Change a stored callback in place. Returns false for an unknown key.
    pub fn update<F>(&self, key: CallbackKey, f: F) -> bool
    where
        F: FnOnce(&mut C),
    {
        match self.inner.lock().entries.get_mut(&key) {
            Some(reg) => {
                f(&mut reg.callback);
                true
            }
            None => false,
        }
    }

    /// Take every registration out of the table, leaving it empty.
    pub fn drain(&self) -> Vec<(CallbackKey, Registration<C, T>)> {
        let mut inner = self.inner.lock();
        inner.entries.drain().collect()
    }

    /// Drop every registration the engine never completed. Returns how many
    /// were released.
    pub fn dispose_all(&self) -> usize {
        let drained = self.drain();
        for (key, _) in &drained {
            warn!(store = self.name, key = *key, "releasing callback never completed by the engine");
        }
        // Registrations are dropped here, outside the lock
        drained.len()
    }
}

impl<C: Clone, T> CallbackStore<C, T> {
    /// Non-removing lookup for callbacks that fire repeatedly.
    ///
    /// The callback is cloned out so no user code runs under the table lock.
    pub fn get(&self, key: CallbackKey) -> Result<(C, Closure)> {
        let inner = self.inner.lock();
        match inner.entries.get(&key) {
            Some(reg) => Ok((reg.callback.clone(), reg.closure.clone())),
            None => {
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(BridgeError::KeyNotFound(key))
            }
        }
    }
}

impl<C, T> std::fmt::Debug for CallbackStore<C, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_callback_store(self, f)
    }
}

impl<C, T> Default for CallbackStore<C, T> {
    fn default() -> Self {
        Self::new("callbacks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closure_value(closure: &Closure) -> Option<u32> {
        closure.as_ref().and_then(|c| c.downcast_ref::<u32>()).copied()
    }

    #[test]
    fn keys_start_at_one_and_increase() {
        let store: CallbackStore<&str, ()> = CallbackStore::new("test");
        let keys: Vec<_> = (0..5).map(|_| store.register("cb", None, ())).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn get_does_not_remove() {
        let store: CallbackStore<&str, ()> = CallbackStore::new("test");
        let key = store.register("tick", Some(Arc::new(9u32)), ());
        let (cb, closure) = store.get(key).unwrap();
        assert_eq!(cb, "tick");
        assert_eq!(closure_value(&closure), Some(9));
        assert!(store.contains(key));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn misses_are_counted() {
        let store: CallbackStore<&str, ()> = CallbackStore::new("test");
        assert_eq!(store.resolve_and_remove(3).unwrap_err(), BridgeError::KeyNotFound(3));
        assert!(store.get(4).is_err());
        assert_eq!(store.misses(), 2);
    }

    #[test]
    fn remove_returns_trampoline() {
        let store: CallbackStore<&str, u8> = CallbackStore::new("test");
        let key = store.register("done", None, 7);
        let reg = store.remove(key).unwrap();
        assert_eq!(reg.trampoline, 7);
        assert!(store.is_empty());
    }

    #[test]
    fn dispose_all_drains() {
        let store: CallbackStore<Arc<u32>, ()> = CallbackStore::new("test");
        let shared = Arc::new(1u32);
        for _ in 0..3 {
            store.register(shared.clone(), None, ());
        }
        assert_eq!(Arc::strong_count(&shared), 4);
        assert_eq!(store.dispose_all(), 3);
        assert_eq!(Arc::strong_count(&shared), 1);
        assert_eq!(store.dispose_all(), 0);
    }

    #[test]
    fn update_changes_callback_in_place() {
        let store: CallbackStore<u32, ()> = CallbackStore::new("test");
        let key = store.register(1, None, ());
        assert!(store.update(key, |cb| *cb = 42));
        assert_eq!(store.get(key).unwrap().0, 42);
        assert!(!store.update(key + 1, |cb| *cb = 0));
    }

    #[test]
    fn drain_hands_back_registrations() {
        let store: CallbackStore<&str, u8> = CallbackStore::new("test");
        store.register("a", None, 1);
        store.register("b", None, 2);
        let mut drained = store.drain();
        drained.sort_by_key(|(key, _)| *key);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].1.trampoline, 2);
        assert!(store.is_empty());
    }
}
