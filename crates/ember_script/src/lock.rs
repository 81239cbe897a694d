//! Execution lock coordination
//!
//! The interpreter runs script code on one thread at a time. Native worker
//! threads hand the execution lock around with the four `threading_*` calls:
//! the thread owning the interpreter releases it before a parallel region
//! (`threading_init`), workers acquire and release it around their calls
//! into script code (`threading_start` / `threading_stop`), and the resuming
//! thread takes it back afterwards (`threading_finalize`).
//!
//! Ownership is tracked in an explicit map from thread identity to an
//! acquisition token, so the state machine can be exercised with simulated
//! thread keys and inspected from tests. Every transition checks "does the
//! calling thread hold the lock" first; out-of-order calls are no-ops rather
//! than panics.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Condvar, Mutex, PoisonError};

/// Identity of a native thread as seen by the lock coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadKey(u64);

impl ThreadKey {
    /// Key for the calling OS thread.
    pub fn current() -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Key with a caller-chosen identity. Lets tests drive the state machine
    /// as N logical threads from a single OS thread.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy)]
struct MainStash {
    key: ThreadKey,
    token: u64,
}

#[derive(Debug, Default)]
struct LockState {
    /// Thread currently allowed to execute script code, if any.
    holder: Option<ThreadKey>,
    /// Per-thread acquisition tokens, keyed by thread identity.
    tokens: HashMap<ThreadKey, u64>,
    /// Saved execution state of the thread that called `threading_init`.
    main_stash: Option<MainStash>,
    /// Monotonic token source.
    generation: u64,
}

/// Exclusive execution lock of the embedded interpreter.
pub struct ExecutionLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `key` the current holder unconditionally. Called when the
    /// interpreter comes up (or is re-entered) on that thread.
    pub fn adopt(&self, key: ThreadKey) {
        let mut st = self.lock_state();
        st.generation += 1;
        let token = st.generation;
        st.tokens.insert(key, token);
        st.holder = Some(key);
    }

    /// Pre-sizes per-thread token storage for an upcoming parallel region.
    pub fn reserve_slots(&self, threads: usize) {
        self.lock_state().tokens.reserve(threads);
    }

    /// Releases the lock ahead of a parallel region, stashing the calling
    /// thread's execution state so `threading_finalize` can restore it.
    /// No-op unless the calling thread holds the lock.
    pub fn threading_init(&self) {
        self.threading_init_as(ThreadKey::current());
    }

    pub fn threading_init_as(&self, key: ThreadKey) {
        let mut st = self.lock_state();
        if st.holder != Some(key) {
            return;
        }
        let token = st.tokens.remove(&key).unwrap_or(0);
        st.main_stash = Some(MainStash { key, token });
        st.holder = None;
        drop(st);
        self.released.notify_all();
    }

    /// Acquires the lock for the calling thread, blocking until it is free.
    /// Idempotent: a thread that already holds the lock does nothing.
    pub fn threading_start(&self) {
        self.threading_start_as(ThreadKey::current());
    }

    pub fn threading_start_as(&self, key: ThreadKey) {
        let mut st = self.lock_state();
        if st.holder == Some(key) {
            return;
        }
        while st.holder.is_some() {
            st = self
                .released
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
        st.generation += 1;
        let token = st.generation;
        st.tokens.insert(key, token);
        st.holder = Some(key);
    }

    /// Releases the lock using the calling thread's own token. No-op unless
    /// the calling thread holds the lock.
    pub fn threading_stop(&self) {
        self.threading_stop_as(ThreadKey::current());
    }

    pub fn threading_stop_as(&self, key: ThreadKey) {
        let mut st = self.lock_state();
        if st.holder != Some(key) {
            return;
        }
        st.tokens.remove(&key);
        st.holder = None;
        drop(st);
        self.released.notify_all();
    }

    /// Restores the execution state stashed by `threading_init`, returning
    /// ownership to the thread that entered the parallel region. No-op while
    /// any thread still holds the lock, or when nothing is stashed.
    pub fn threading_finalize(&self) {
        let mut st = self.lock_state();
        if st.holder.is_some() {
            return;
        }
        if let Some(stash) = st.main_stash.take() {
            st.tokens.insert(stash.key, stash.token);
            st.holder = Some(stash.key);
        }
    }

    /// Thread currently holding the lock, if any.
    pub fn holder(&self) -> Option<ThreadKey> {
        self.lock_state().holder
    }

    pub fn is_held_by(&self, key: ThreadKey) -> bool {
        self.holder() == Some(key)
    }

    /// Number of live acquisition tokens (holder plus stashed state).
    pub fn token_count(&self) -> usize {
        self.lock_state().tokens.len()
    }

    /// Whether a main-thread execution state is currently stashed.
    pub fn has_stashed_state(&self) -> bool {
        self.lock_state().main_stash.is_some()
    }
}

impl Default for ExecutionLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const MAIN: ThreadKey = ThreadKey::from_raw(1);

    fn held_lock() -> ExecutionLock {
        let lock = ExecutionLock::new();
        lock.adopt(MAIN);
        lock
    }

    #[test]
    fn handoff_restores_original_ownership() {
        let lock = held_lock();
        lock.threading_init_as(MAIN);
        assert_eq!(lock.holder(), None);
        assert!(lock.has_stashed_state());

        for raw in 2..6 {
            let worker = ThreadKey::from_raw(raw);
            lock.threading_start_as(worker);
            assert!(lock.is_held_by(worker));
            lock.threading_stop_as(worker);
            assert_eq!(lock.holder(), None);
        }

        lock.threading_finalize();
        assert!(lock.is_held_by(MAIN));
        assert!(!lock.has_stashed_state());
        assert_eq!(lock.token_count(), 1);
    }

    #[test]
    fn handoff_with_zero_workers() {
        let lock = held_lock();
        lock.threading_init_as(MAIN);
        lock.threading_finalize();
        assert!(lock.is_held_by(MAIN));
    }

    #[test]
    fn start_is_idempotent_for_the_holder() {
        let lock = held_lock();
        lock.threading_init_as(MAIN);

        let worker = ThreadKey::from_raw(7);
        lock.threading_start_as(worker);
        let tokens = lock.token_count();
        lock.threading_start_as(worker);
        assert_eq!(lock.token_count(), tokens);
        assert!(lock.is_held_by(worker));
    }

    #[test]
    fn stop_by_non_holder_is_ignored() {
        let lock = held_lock();
        lock.threading_init_as(MAIN);

        let worker = ThreadKey::from_raw(2);
        let other = ThreadKey::from_raw(3);
        lock.threading_start_as(worker);
        lock.threading_stop_as(other);
        assert!(lock.is_held_by(worker));
    }

    #[test]
    fn init_by_non_holder_is_ignored() {
        let lock = held_lock();
        lock.threading_init_as(ThreadKey::from_raw(9));
        assert!(lock.is_held_by(MAIN));
        assert!(!lock.has_stashed_state());
    }

    #[test]
    fn finalize_while_held_is_ignored() {
        let lock = held_lock();
        lock.threading_init_as(MAIN);

        let worker = ThreadKey::from_raw(2);
        lock.threading_start_as(worker);
        lock.threading_finalize();
        assert!(lock.is_held_by(worker));
        assert!(lock.has_stashed_state());

        lock.threading_stop_as(worker);
        lock.threading_finalize();
        assert!(lock.is_held_by(MAIN));
    }

    #[test]
    fn contended_workers_hold_exclusively() {
        let lock = Arc::new(ExecutionLock::new());
        let main = ThreadKey::current();
        lock.adopt(main);
        lock.threading_init();

        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        lock.threading_start();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.threading_stop();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        lock.threading_finalize();
        assert!(lock.is_held_by(main));
    }
}
