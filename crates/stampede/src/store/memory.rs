// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process [`CacheStore`] with TTL expiry and failure injection.
//!
//! [`MemoryStore`] stands in for a real shared store in tests, demos and load
//! harnesses. All clones share the same entries, so a single store can be handed
//! to many concurrent fetchers to simulate callers in different processes.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tick::Clock;

use super::{CacheStore, StoreError};

/// A store operation, passed to failure predicates installed with [`MemoryStore::fail_when`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp<'a> {
    /// [`CacheStore::get`] on the given key.
    Get(&'a str),
    /// [`CacheStore::set`] on the given key.
    Set(&'a str),
    /// [`CacheStore::delete`] on the given key.
    Delete(&'a str),
    /// [`CacheStore::exists`] on the given key.
    Exists(&'a str),
    /// [`CacheStore::create_if_absent`] on the given key.
    CreateIfAbsent(&'a str),
}

impl StoreOp<'_> {
    /// Returns the key the operation targets.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Get(key) | Self::Set(key) | Self::Delete(key) | Self::Exists(key) | Self::CreateIfAbsent(key) => key,
        }
    }
}

type FailPredicate = Box<dyn Fn(&StoreOp<'_>) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// An in-memory [`CacheStore`].
///
/// Expiry is evaluated against the [`Clock`] the store was created with, so tests can
/// drive lock and entry expiry with `tick::ClockControl` instead of sleeping.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use bytes::Bytes;
/// use stampede::store::CacheStore;
/// use stampede::store::memory::MemoryStore;
/// use tick::Clock;
///
/// # futures::executor::block_on(async {
/// let store = MemoryStore::new(Clock::new_frozen());
///
/// assert!(store.create_if_absent("lock:user", Bytes::from_static(b"a"), Duration::from_secs(5)).await?);
/// assert!(!store.create_if_absent("lock:user", Bytes::from_static(b"b"), Duration::from_secs(5)).await?);
/// # Ok::<(), stampede::store::StoreError>(())
/// # });
/// ```
///
/// # Failure injection
///
/// ```
/// use stampede::store::CacheStore;
/// use stampede::store::memory::{MemoryStore, StoreOp};
/// use tick::Clock;
///
/// # futures::executor::block_on(async {
/// let store = MemoryStore::new(Clock::new_frozen());
///
/// store.fail_when(|op| matches!(op, StoreOp::Get(key) if *key == "flaky"));
/// assert!(store.get("flaky").await.is_err());
/// assert!(store.get("stable").await.is_ok());
///
/// store.set_unavailable(true);
/// assert!(store.get("stable").await.is_err());
/// # });
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    clock: Clock,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    fail_when: Arc<Mutex<Option<FailPredicate>>>,
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.lock().len())
            .field("fail_when", &self.fail_when.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Creates an empty store that evaluates expiry against `clock`.
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            entries: Arc::default(),
            fail_when: Arc::default(),
        }
    }

    /// Installs a predicate; every operation for which it returns `true` fails with
    /// [`StoreError::Unavailable`]. Replaces any previous predicate.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&StoreOp<'_>) -> bool + Send + Sync + 'static,
    {
        *self.fail_when.lock() = Some(Box::new(predicate));
    }

    /// Simulates a full outage (`true`) or recovery (`false`) of the store.
    pub fn set_unavailable(&self, unavailable: bool) {
        if unavailable {
            self.fail_when(|_| true);
        } else {
            self.clear_failures();
        }
    }

    /// Removes the failure predicate.
    pub fn clear_failures(&self) {
        *self.fail_when.lock() = None;
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.instant();
        self.entries.lock().values().filter(|entry| entry.is_live(now)).count()
    }

    /// Returns `true` if the store holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.instant();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    fn check(&self, op: &StoreOp<'_>) -> Result<(), StoreError> {
        if self.fail_when.lock().as_ref().is_some_and(|predicate| predicate(op)) {
            return Err(StoreError::unavailable(format!("injected failure for key '{}'", op.key())));
        }
        Ok(())
    }

    fn expires_at(&self, ttl: Duration) -> Instant {
        let now = self.clock.instant();
        now.checked_add(ttl).unwrap_or(now + Duration::from_secs(u64::from(u32::MAX)))
    }
}

impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.check(&StoreOp::Get(key))?;
        let now = self.clock.instant();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.check(&StoreOp::Set(key))?;
        let expires_at = self.expires_at(ttl);
        self.entries.lock().insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check(&StoreOp::Delete(key))?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check(&StoreOp::Exists(key))?;
        let now = self.clock.instant();
        Ok(self.entries.lock().get(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn create_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, StoreError> {
        self.check(&StoreOp::CreateIfAbsent(key))?;
        let now = self.clock.instant();
        let expires_at = self.expires_at(ttl);

        // Check and insert under one lock acquisition.
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(key.to_owned(), Entry { value, expires_at });
        Ok(true)
    }
}
