// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
#[cfg(test)]
use std::sync::Arc;

/// Randomness for backoff jitter and lock owner tokens.
///
/// Backed by `fastrand`, which is fast and not cryptographically secure. Unit tests
/// script the samples so jittered delays become exact.
#[derive(Clone, Default)]
pub(crate) enum Rnd {
    #[default]
    Fastrand,

    #[cfg(test)]
    Scripted(Arc<dyn Fn() -> f64 + Send + Sync>),
}

impl Debug for Rnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Fastrand => "Fastrand",
            #[cfg(test)]
            Self::Scripted(_) => "Scripted",
        };
        f.write_str(name)
    }
}

impl Rnd {
    /// Always samples `value`.
    #[cfg(test)]
    pub fn fixed(value: f64) -> Self {
        Self::scripted(move || value)
    }

    #[cfg(test)]
    pub fn scripted(next: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        Self::Scripted(Arc::new(next))
    }

    /// A sample from `[0, 1)`. Scripted sources may return anything.
    pub fn next_f64(&self) -> f64 {
        match self {
            Self::Fastrand => fastrand::f64(),
            #[cfg(test)]
            Self::Scripted(next) => next(),
        }
    }

    /// An owner token to store as the value of a lock.
    pub fn token(&self) -> u64 {
        match self {
            Self::Fastrand => fastrand::u64(..),
            #[cfg(test)]
            Self::Scripted(next) => next().to_bits(),
        }
    }
}
