// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TTL-bounded mutual exclusion on top of a [`CacheStore`].

use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::rnd::Rnd;
use crate::store::{CacheStore, StoreError};

/// Prefix prepended to a cache key to form its lock key.
pub const DEFAULT_LOCK_PREFIX: &str = "lock:";

/// Acquires and releases named locks in a shared [`CacheStore`].
///
/// A lock is an ordinary store entry created with [`CacheStore::create_if_absent`]. At
/// most one caller can create it while it is live, and the store drops it on its own
/// once the TTL elapses, so a holder that crashes never blocks other callers for
/// longer than the TTL.
///
/// Release is an unconditional delete. A holder whose lock already expired and was
/// taken over by another caller will delete the newer lock when it releases. The value
/// stored with the lock is a random owner token that is kept for diagnostics only.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use stampede::LockManager;
/// use stampede::store::memory::MemoryStore;
/// use tick::Clock;
///
/// # futures::executor::block_on(async {
/// let locks = LockManager::new(Arc::new(MemoryStore::new(Clock::new_frozen())));
/// let lock_key = locks.lock_key("user:42");
///
/// assert!(locks.acquire(&lock_key, Duration::from_secs(5)).await);
/// assert!(!locks.acquire(&lock_key, Duration::from_secs(5)).await);
///
/// locks.release(&lock_key).await;
/// assert!(locks.acquire(&lock_key, Duration::from_secs(5)).await);
/// # });
/// ```
#[derive(Debug)]
pub struct LockManager<S> {
    store: Arc<S>,
    prefix: Cow<'static, str>,
    rnd: Rnd,
}

impl<S> Clone for LockManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
            rnd: self.rnd.clone(),
        }
    }
}

impl<S: CacheStore> LockManager<S> {
    /// Creates a lock manager using [`DEFAULT_LOCK_PREFIX`].
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            prefix: Cow::Borrowed(DEFAULT_LOCK_PREFIX),
            rnd: Rnd::default(),
        }
    }

    /// Uses `prefix` instead of [`DEFAULT_LOCK_PREFIX`] when deriving lock keys.
    #[must_use]
    pub fn prefix(self, prefix: impl Into<Cow<'static, str>>) -> Self {
        Self {
            prefix: prefix.into(),
            ..self
        }
    }

    /// Returns the store this manager writes its locks to.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Derives the lock key guarding `cache_key`.
    #[must_use]
    pub fn lock_key(&self, cache_key: &str) -> String {
        format!("{}{cache_key}", self.prefix)
    }

    /// Attempts to take the lock, surfacing store failures.
    ///
    /// Returns `Ok(true)` if the caller now owns the lock and `Ok(false)` if it is held
    /// by someone else.
    ///
    /// # Errors
    ///
    /// Returns the store error if the atomic create could not be performed.
    pub async fn try_acquire(&self, lock_key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let token = Bytes::from(self.rnd.token().to_be_bytes().to_vec());
        let acquired = self.store.create_if_absent(lock_key, token, ttl).await?;

        crate::log!(debug, stampede.lock.key = lock_key, stampede.lock.acquired = acquired, "stampede.lock.acquire");
        Ok(acquired)
    }

    /// Attempts to take the lock, returning `true` iff the caller now owns it.
    ///
    /// Store failures fail closed: the lock is reported as not acquired.
    pub async fn acquire(&self, lock_key: &str, ttl: Duration) -> bool {
        match self.try_acquire(lock_key, ttl).await {
            Ok(acquired) => acquired,
            Err(error) => {
                crate::log!(warn, stampede.lock.key = lock_key, error = %error, "stampede.lock.unavailable");
                let _ = error;
                false
            }
        }
    }

    /// Deletes the lock. Safe to call when the lock has already expired.
    ///
    /// A store failure is logged and otherwise ignored; the lock then expires by TTL.
    pub async fn release(&self, lock_key: &str) {
        release_key(self.store.as_ref(), lock_key).await;
    }

    /// Returns whether a live lock exists under `lock_key`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the lookup fails.
    pub async fn is_locked(&self, lock_key: &str) -> Result<bool, StoreError> {
        self.store.exists(lock_key).await
    }
}

impl<S: CacheStore + 'static> LockManager<S> {
    /// Wraps an already acquired lock in a guard that owns its release.
    pub(crate) fn guard(&self, lock_key: String) -> LockGuard<S> {
        LockGuard {
            store: Arc::clone(&self.store),
            lock_key: Some(lock_key),
        }
    }
}

async fn release_key<S: CacheStore + ?Sized>(store: &S, lock_key: &str) {
    match store.delete(lock_key).await {
        Ok(()) => crate::log!(debug, stampede.lock.key = lock_key, "stampede.lock.release"),
        Err(error) => {
            crate::log!(warn, stampede.lock.key = lock_key, error = %error, "stampede.lock.release_failed");
            let _ = error;
        }
    }
}

/// Scoped ownership of an acquired lock.
///
/// Callers release the lock with [`LockGuard::release`] on every path out of the critical
/// section. If the guard is dropped while still holding the lock (the owning future was
/// cancelled or panicked), the delete is handed to the ambient Tokio runtime; without a
/// runtime the lock is left to expire by its TTL.
pub(crate) struct LockGuard<S: CacheStore + 'static> {
    store: Arc<S>,
    lock_key: Option<String>,
}

impl<S: CacheStore + 'static> Debug for LockGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("lock_key", &self.lock_key).finish_non_exhaustive()
    }
}

impl<S: CacheStore + 'static> LockGuard<S> {
    #[cfg(test)]
    pub(crate) fn lock_key(&self) -> &str {
        self.lock_key.as_deref().unwrap_or_default()
    }

    pub(crate) async fn release(mut self) {
        if let Some(lock_key) = self.lock_key.take() {
            release_key(self.store.as_ref(), &lock_key).await;
        }
    }
}

impl<S: CacheStore + 'static> Drop for LockGuard<S> {
    fn drop(&mut self) {
        let Some(lock_key) = self.lock_key.take() else {
            return;
        };

        crate::log!(warn, stampede.lock.key = %lock_key, "stampede.lock.abandoned");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            drop(runtime.spawn(async move {
                release_key(store.as_ref(), &lock_key).await;
            }));
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use tick::{Clock, ClockControl};

    use super::*;
    use crate::store::memory::{MemoryStore, StoreOp};

    const TTL: Duration = Duration::from_secs(10);

    fn manager(clock: Clock) -> (LockManager<MemoryStore>, MemoryStore) {
        let store = MemoryStore::new(clock);
        (LockManager::new(Arc::new(store.clone())), store)
    }

    #[test]
    fn lock_key_is_deterministic() {
        let (locks, _) = manager(Clock::new_frozen());
        assert_eq!(locks.lock_key("user:1"), "lock:user:1");
        assert_eq!(locks.lock_key("user:1"), locks.lock_key("user:1"));

        let locks = locks.prefix("mutex/");
        assert_eq!(locks.lock_key("user:1"), "mutex/user:1");
    }

    #[test]
    fn only_one_holder() {
        let (locks, _) = manager(Clock::new_frozen());
        block_on(async {
            assert!(locks.acquire("lock:k", TTL).await);
            assert!(!locks.acquire("lock:k", TTL).await);
            assert!(!locks.clone().acquire("lock:k", TTL).await);
            assert!(locks.is_locked("lock:k").await.unwrap());
        });
    }

    #[test]
    fn expires_without_release() {
        let control = ClockControl::new();
        let (locks, _) = manager(control.to_clock());
        block_on(async {
            assert!(locks.acquire("lock:k", TTL).await);
            control.advance(TTL);
            assert!(!locks.is_locked("lock:k").await.unwrap());
            assert!(locks.acquire("lock:k", TTL).await);
        });
    }

    #[test]
    fn release_is_idempotent() {
        let control = ClockControl::new();
        let (locks, _) = manager(control.to_clock());
        block_on(async {
            locks.release("lock:never-taken").await;

            assert!(locks.acquire("lock:k", TTL).await);
            locks.release("lock:k").await;
            locks.release("lock:k").await;
            assert!(!locks.is_locked("lock:k").await.unwrap());

            assert!(locks.acquire("lock:k", TTL).await);
            control.advance(TTL);
            locks.release("lock:k").await;
            assert!(!locks.is_locked("lock:k").await.unwrap());
        });
    }

    #[test]
    fn acquire_fails_closed_when_store_unavailable() {
        let (locks, store) = manager(Clock::new_frozen());
        store.set_unavailable(true);
        block_on(async {
            assert!(!locks.acquire("lock:k", TTL).await);
            let error = locks.try_acquire("lock:k", TTL).await.unwrap_err();
            assert!(error.is_unavailable());
        });
    }

    #[test]
    fn release_swallows_store_errors() {
        let (locks, store) = manager(Clock::new_frozen());
        block_on(async {
            assert!(locks.acquire("lock:k", TTL).await);
            store.fail_when(|op| matches!(op, StoreOp::Delete(_)));
            locks.release("lock:k").await;

            store.clear_failures();
            assert!(locks.is_locked("lock:k").await.unwrap());
        });
    }

    #[test]
    fn lock_value_is_an_owner_token() {
        let (locks, store) = manager(Clock::new_frozen());
        block_on(async {
            assert!(locks.acquire("lock:k", TTL).await);
            let token = store.get("lock:k").await.unwrap().unwrap();
            assert_eq!(token.len(), 8);
        });
    }

    #[test]
    fn guard_release_deletes_lock() {
        let (locks, _) = manager(Clock::new_frozen());
        block_on(async {
            assert!(locks.acquire("lock:k", TTL).await);
            let guard = locks.guard("lock:k".to_string());
            assert_eq!(guard.lock_key(), "lock:k");
            guard.release().await;
            assert!(!locks.is_locked("lock:k").await.unwrap());
        });
    }

    #[test]
    fn dropped_guard_without_runtime_leaves_lock_to_expire() {
        let control = ClockControl::new();
        let (locks, _) = manager(control.to_clock());
        block_on(async {
            assert!(locks.acquire("lock:k", TTL).await);
            drop(locks.guard("lock:k".to_string()));
            assert!(locks.is_locked("lock:k").await.unwrap());

            control.advance(TTL);
            assert!(!locks.is_locked("lock:k").await.unwrap());
        });
    }

    #[tokio::test]
    async fn dropped_guard_inside_runtime_releases_in_background() {
        let (locks, _) = manager(Clock::new_frozen());
        assert!(locks.acquire("lock:k", TTL).await);
        drop(locks.guard("lock:k".to_string()));

        // let the spawned release run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!locks.is_locked("lock:k").await.unwrap());
    }
}
