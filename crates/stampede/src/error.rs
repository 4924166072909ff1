// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Errors returned by [`SingleFlightFetcher::fetch`](crate::SingleFlightFetcher::fetch).
///
/// Store failures never appear here: cache read errors are treated as misses, populate
/// and release errors are logged, and lock errors are handled by the
/// [`StoreOutage`](crate::StoreOutage) policy.
///
/// # Examples
///
/// ```
/// use stampede::FetchError;
///
/// let err: FetchError<std::io::Error> = FetchError::LockTimeout { retries: 5 };
/// assert!(err.is_timeout());
/// assert_eq!(err.to_string(), "gave up waiting for the value after 5 retries");
/// ```
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError<E> {
    /// The source failed. Only the caller that invoked it sees this error.
    #[error("source failed: {0}")]
    Source(#[source] E),

    /// The caller lost the lock race and the value did not show up in the cache within
    /// the retry budget.
    #[error("gave up waiting for the value after {retries} retries")]
    LockTimeout {
        /// Number of backoff delays slept through.
        retries: u32,
    },
}

impl<E> FetchError<E> {
    /// Returns `true` if the caller gave up waiting for the lock holder.
    ///
    /// Callers that would rather hit the source than fail can retry with
    /// [`RetryExhausted::FetchAnyway`](crate::RetryExhausted::FetchAnyway).
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Returns the source error, if this is one.
    #[must_use]
    pub fn as_source(&self) -> Option<&E> {
        match self {
            Self::Source(error) => Some(error),
            Self::LockTimeout { .. } => None,
        }
    }

    /// Consumes the error, returning the source error if this is one.
    #[must_use]
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Source(error) => Some(error),
            Self::LockTimeout { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::io;

    use super::*;

    #[test]
    fn source_error_is_chained() {
        let err = FetchError::Source(io::Error::other("upstream 503"));
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "source failed: upstream 503");
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("upstream 503"));
        assert_eq!(err.as_source().map(io::Error::kind), Some(io::ErrorKind::Other));
        assert!(err.into_source().is_some());
    }

    #[test]
    fn timeout_has_no_source() {
        let err: FetchError<io::Error> = FetchError::LockTimeout { retries: 3 };
        assert!(err.is_timeout());
        assert!(err.source().is_none());
        assert!(err.as_source().is_none());
        assert!(err.into_source().is_none());
    }
}
