/// Keyed lock arenas for per-identity mutual exclusion
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type Arena<K, L> = Arc<StdMutex<HashMap<K, Arc<L>>>>;

fn new_arena<K, L>() -> Arena<K, L> {
    Arc::new(StdMutex::new(HashMap::new()))
}

/// Handle on one key's lock; removes the arena entry when it is the last user
struct Slot<K: Eq + Hash + Clone, L> {
    key: K,
    lock: Arc<L>,
    arena: Arena<K, L>,
}

impl<K: Eq + Hash + Clone, L: Default> Slot<K, L> {
    fn take(arena: &Arena<K, L>, key: K) -> Self {
        let mut entries = arena.lock().unwrap_or_else(|e| e.into_inner());
        let lock = entries.entry(key.clone()).or_default().clone();
        Slot {
            key,
            lock,
            arena: arena.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone, L> Drop for Slot<K, L> {
    fn drop(&mut self) {
        let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the arena, one here: nobody else holds or waits
        if let Some(entry) = arena.get(&self.key) {
            if Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(&self.lock) == 2 {
                arena.remove(&self.key);
            }
        }
    }
}

/// Lazily created async locks, one per key.
///
/// A key's lock lives only while someone holds or waits for it.
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    arena: Arena<K, Mutex<()>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self { arena: new_arena() }
    }
}

/// Held lock for one key
pub struct KeyedGuard<K: Eq + Hash + Clone> {
    // Field order matters: the guard must release before the slot checks usage
    _guard: OwnedMutexGuard<()>,
    _slot: Slot<K, Mutex<()>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the key's lock
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let slot = Slot::take(&self.arena, key);
        let guard = slot.lock.clone().lock_owned().await;
        KeyedGuard {
            _guard: guard,
            _slot: slot,
        }
    }

    /// Take the key's lock only if it is free
    pub fn try_lock(&self, key: K) -> Option<KeyedGuard<K>> {
        let slot = Slot::take(&self.arena, key);
        let guard = slot.lock.clone().try_lock_owned().ok()?;
        Some(KeyedGuard {
            _guard: guard,
            _slot: slot,
        })
    }

    pub fn is_locked(&self, key: &K) -> bool {
        let arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        arena
            .get(key)
            .map_or(false, |lock| lock.try_lock().is_err())
    }

    /// Number of keys currently held or awaited
    pub fn len(&self) -> usize {
        self.arena.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-key read/write gates.
///
/// Readers of a key share the gate; a writer excludes them for the duration of
/// its critical section.
pub struct KeyedGates<K: Eq + Hash + Clone> {
    arena: Arena<K, RwLock<()>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedGates<K> {
    fn default() -> Self {
        Self { arena: new_arena() }
    }
}

pub struct GateReadGuard<K: Eq + Hash + Clone> {
    _guard: OwnedRwLockReadGuard<()>,
    _slot: Slot<K, RwLock<()>>,
}

pub struct GateWriteGuard<K: Eq + Hash + Clone> {
    _guard: OwnedRwLockWriteGuard<()>,
    _slot: Slot<K, RwLock<()>>,
}

impl<K: Eq + Hash + Clone> KeyedGates<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self, key: K) -> GateReadGuard<K> {
        let slot = Slot::take(&self.arena, key);
        let guard = slot.lock.clone().read_owned().await;
        GateReadGuard {
            _guard: guard,
            _slot: slot,
        }
    }

    pub async fn write(&self, key: K) -> GateWriteGuard<K> {
        let slot = Slot::take(&self.arena, key);
        let guard = slot.lock.clone().write_owned().await;
        GateWriteGuard {
            _guard: guard,
            _slot: slot,
        }
    }

    pub fn len(&self) -> usize {
        self.arena.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
