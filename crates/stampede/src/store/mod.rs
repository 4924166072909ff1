// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The shared key-value store consumed by the lock manager and the fetcher.
//!
//! [`CacheStore`] is the seam between this crate and whatever actually holds the
//! cached values and lock entries (Redis, Memcached, an in-process map, ...). The
//! storage engine itself, including its persistence and replication, is outside the
//! scope of this crate. The only hard requirement on an implementation is that
//! [`CacheStore::create_if_absent`] is a single atomic operation.

#[cfg(any(feature = "memory", test))]
pub mod memory;

use std::time::Duration;

use bytes::Bytes;

/// Errors reported by a [`CacheStore`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached or did not answer in time.
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with an error of its own.
    #[error("cache store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates an [`StoreError::Unavailable`] error with the given message.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Creates an [`StoreError::Backend`] error with the given message.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Returns `true` if the store was unreachable rather than failing the request.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A shared key-value store with per-entry expiry.
///
/// Values are opaque payloads. Every entry written with a TTL must be treated as
/// absent by all readers once the TTL has elapsed.
///
/// # Implementing a store
///
/// ```
/// use std::time::Duration;
///
/// use bytes::Bytes;
/// use stampede::store::{CacheStore, StoreError};
///
/// /// A store that is never reachable.
/// struct Offline;
///
/// impl CacheStore for Offline {
///     async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
///         Err(StoreError::unavailable("offline"))
///     }
///
///     async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), StoreError> {
///         Err(StoreError::unavailable("offline"))
///     }
///
///     async fn delete(&self, _key: &str) -> Result<(), StoreError> {
///         Err(StoreError::unavailable("offline"))
///     }
///
///     async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
///         Err(StoreError::unavailable("offline"))
///     }
///
///     async fn create_if_absent(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<bool, StoreError> {
///         Err(StoreError::unavailable("offline"))
///     }
/// }
/// ```
pub trait CacheStore: Send + Sync {
    /// Reads the value stored under `key`, returning `None` when absent or expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Bytes>, StoreError>> + Send;

    /// Writes `value` under `key`, replacing any previous value, expiring after `ttl`.
    fn set(&self, key: &str, value: Bytes, ttl: Duration) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns `true` if a live (non-expired) entry exists under `key`.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Atomically writes `value` under `key` only if no live entry exists there.
    ///
    /// Returns `true` if this call created the entry. This is the `SET key value NX PX ttl`
    /// primitive and must not be emulated with a separate existence check followed by a write.
    fn create_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> impl Future<Output = Result<bool, StoreError>> + Send;
}
